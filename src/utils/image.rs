//! Image utility functions

use anyhow::Result;
use image::{DynamicImage, GenericImageView};

use crate::engine::Region;

/// Decode image from bytes (JPEG, PNG, etc.)
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    let img = image::load_from_memory(data)?;
    Ok(img)
}

/// Crop a region, clamped to the image bounds.
///
/// Returns the crop and its top-left offset in the source image, or `None`
/// when nothing of the region lies inside the image.
pub fn crop_region(
    image: &DynamicImage,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
) -> Option<(DynamicImage, (u32, u32))> {
    let (img_w, img_h) = image.dimensions();

    let left = x1.max(0.0).floor() as u32;
    let top = y1.max(0.0).floor() as u32;
    let right = (x2.min(img_w as f32).ceil().max(0.0) as u32).min(img_w);
    let bottom = (y2.min(img_h as f32).ceil().max(0.0) as u32).min(img_h);

    if right <= left || bottom <= top {
        return None;
    }

    Some((image.crop_imm(left, top, right - left, bottom - top), (left, top)))
}

/// Crop using a model-produced region.
pub fn crop_to(image: &DynamicImage, region: &Region) -> Option<(DynamicImage, (u32, u32))> {
    crop_region(image, region.x1, region.y1, region.x2, region.y2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn blank(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_pixel(w, h, Rgb([0u8, 0, 0])))
    }

    #[test]
    fn test_crop_inside() {
        let (crop, offset) = crop_region(&blank(100, 50), 10.0, 5.0, 30.0, 25.0).unwrap();
        assert_eq!(crop.dimensions(), (20, 20));
        assert_eq!(offset, (10, 5));
    }

    #[test]
    fn test_crop_is_clamped() {
        let (crop, offset) = crop_region(&blank(100, 50), -10.0, -5.0, 200.0, 40.0).unwrap();
        assert_eq!(crop.dimensions(), (100, 40));
        assert_eq!(offset, (0, 0));
    }

    #[test]
    fn test_crop_outside_is_none() {
        assert!(crop_region(&blank(100, 50), 150.0, 10.0, 180.0, 20.0).is_none());
    }
}
