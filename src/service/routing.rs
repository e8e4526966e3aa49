//! Detection routing table
//!
//! Maps detector class names to pipeline categories, and each category to
//! the ordered tasks it runs. Both sets are closed enums so adding a
//! category forces every `match` over them to be revisited.

use serde::{Deserialize, Serialize};

/// Enrichment pipeline a detection is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Vehicle,
    Person,
    Pet,
}

impl Category {
    /// Processing and result order
    pub const ALL: [Category; 3] = [Category::Vehicle, Category::Person, Category::Pet];

    /// Route a detector class name. Unrouted classes return `None`.
    pub fn from_class(class_name: &str) -> Option<Self> {
        match class_name {
            "car" | "truck" | "bus" | "motorcycle" => Some(Category::Vehicle),
            "person" => Some(Category::Person),
            "cat" | "dog" => Some(Category::Pet),
            _ => None,
        }
    }

    pub fn tasks(&self) -> &'static [EnrichmentTask] {
        match self {
            Category::Vehicle => &[EnrichmentTask::LicensePlate, EnrichmentTask::VehicleDamage],
            Category::Person => &[
                EnrichmentTask::Face,
                EnrichmentTask::Pose,
                EnrichmentTask::Violence,
            ],
            Category::Pet => &[EnrichmentTask::PetBreed],
        }
    }

    /// Distinct models needed by this category, in first-use order
    pub fn models(&self) -> Vec<&'static str> {
        let mut models: Vec<&'static str> = Vec::new();
        for task in self.tasks() {
            for model in task.models() {
                if !models.contains(model) {
                    models.push(model);
                }
            }
        }
        models
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Vehicle => "vehicle",
            Category::Person => "person",
            Category::Pet => "pet",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One enrichment step applied to a single detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentTask {
    /// Find the plate inside the vehicle, then read it
    LicensePlate,
    VehicleDamage,
    Face,
    Pose,
    Violence,
    PetBreed,
}

impl EnrichmentTask {
    /// Models used by this task, in call order
    pub fn models(&self) -> &'static [&'static str] {
        match self {
            EnrichmentTask::LicensePlate => &["plate_detector", "plate_ocr"],
            EnrichmentTask::VehicleDamage => &["damage_classifier"],
            EnrichmentTask::Face => &["face_detector"],
            EnrichmentTask::Pose => &["pose_estimator"],
            EnrichmentTask::Violence => &["violence_classifier"],
            EnrichmentTask::PetBreed => &["pet_classifier"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentTask::LicensePlate => "license_plate",
            EnrichmentTask::VehicleDamage => "vehicle_damage",
            EnrichmentTask::Face => "face",
            EnrichmentTask::Pose => "pose",
            EnrichmentTask::Violence => "violence",
            EnrichmentTask::PetBreed => "pet_breed",
        }
    }
}

impl std::fmt::Display for EnrichmentTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_routing() {
        assert_eq!(Category::from_class("truck"), Some(Category::Vehicle));
        assert_eq!(Category::from_class("person"), Some(Category::Person));
        assert_eq!(Category::from_class("dog"), Some(Category::Pet));
        assert_eq!(Category::from_class("bicycle"), None);
        assert_eq!(Category::from_class("Car"), None);
    }

    #[test]
    fn test_category_models_are_deduplicated_in_order() {
        assert_eq!(
            Category::Vehicle.models(),
            vec!["plate_detector", "plate_ocr", "damage_classifier"]
        );
        assert_eq!(Category::Pet.models(), vec!["pet_classifier"]);
    }

    #[test]
    fn test_every_category_has_tasks() {
        for category in Category::ALL {
            assert!(!category.tasks().is_empty());
        }
    }
}
