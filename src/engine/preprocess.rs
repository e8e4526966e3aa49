//! Image preprocessing for model input tensors

use image::{DynamicImage, GenericImageView};
use ndarray::Array4;

/// Maps network-space coordinates back to the input crop.
#[derive(Debug, Clone, Copy)]
pub struct ScaleInfo {
    pub scale_x: f32,
    pub scale_y: f32,
}

impl ScaleInfo {
    /// `original` and `target` are (width, height)
    pub fn new(original: (u32, u32), target: (u32, u32)) -> Self {
        Self {
            scale_x: original.0 as f32 / target.0.max(1) as f32,
            scale_y: original.1 as f32 / target.1.max(1) as f32,
        }
    }

    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale_x, y * self.scale_y)
    }
}

/// Resize to the network input size and convert to a normalised NCHW tensor.
pub fn to_input_tensor(image: &DynamicImage, input_size: (u32, u32)) -> Array4<f32> {
    let (target_w, target_h) = input_size;
    let resized = if image.dimensions() == input_size {
        image.clone()
    } else {
        image.resize_exact(target_w, target_h, image::imageops::FilterType::Triangle)
    };
    image_to_nchw(&resized)
}

/// Convert image to NCHW tensor format, RGB order, normalised to [-1, 1]
fn image_to_nchw(image: &DynamicImage) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();

    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            tensor[[0, c, y, x]] = (pixel[c] as f32 - 127.5) / 128.0;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn test_tensor_shape_and_range() {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(40, 20, Rgb([255u8, 0, 128])));
        let tensor = to_input_tensor(&img, (16, 8));

        assert_eq!(tensor.shape(), &[1, 3, 8, 16]);
        assert!(tensor.iter().all(|v| (-1.0..=1.0).contains(v)));
        assert!(tensor[[0, 0, 0, 0]] > 0.99);
        assert!(tensor[[0, 1, 0, 0]] < -0.99);
    }

    #[test]
    fn test_scale_info_maps_back() {
        let scale = ScaleInfo::new((320, 240), (160, 120));
        assert_eq!(scale.to_original(10.0, 20.0), (20.0, 40.0));
    }
}
