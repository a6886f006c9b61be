use garde::Validate;
use serde::{Deserialize, Serialize};

/// Structured output of the vision model for one food photo.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct FoodAnalysis {
    #[garde(length(min = 1, max = 200))]
    pub dish_name: String,

    #[garde(length(max = 50), dive)]
    #[serde(default)]
    pub items: Vec<FoodItem>,

    #[garde(dive)]
    pub nutrition: Nutrition,

    #[garde(range(min = 0.0, max = 1.0))]
    #[serde(default = "default_confidence")]
    pub confidence: f64,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// One recognised component of the dish.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct FoodItem {
    #[garde(length(min = 1, max = 200))]
    pub name: String,

    #[garde(length(max = 100))]
    #[serde(default)]
    pub portion: String,

    #[garde(range(min = 0.0, max = 10000.0))]
    #[serde(default)]
    pub calories: f64,
}

/// Estimated nutrition for the whole plate.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct Nutrition {
    #[garde(range(min = 0.0, max = 20000.0))]
    pub calories: f64,

    #[garde(range(min = 0.0, max = 2000.0))]
    pub protein_g: f64,

    #[garde(range(min = 0.0, max = 2000.0))]
    pub carbs_g: f64,

    #[garde(range(min = 0.0, max = 2000.0))]
    pub fat_g: f64,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fiber_g: Option<f64>,
}

fn default_confidence() -> f64 {
    0.5
}
