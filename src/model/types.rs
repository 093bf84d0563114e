use std::{collections::BTreeMap, fmt, str::FromStr};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    ObjectDetection,
    Attribute,
    Tagging,
    Segmentation,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 4] = [
        ModelFamily::ObjectDetection,
        ModelFamily::Attribute,
        ModelFamily::Tagging,
        ModelFamily::Segmentation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::ObjectDetection => "object_detection",
            ModelFamily::Attribute => "attribute",
            ModelFamily::Tagging => "tagging",
            ModelFamily::Segmentation => "segmentation",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFamily {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "object_detection" | "detection" | "detector" => Ok(ModelFamily::ObjectDetection),
            "attribute" | "attributes" => Ok(ModelFamily::Attribute),
            "tagging" | "tagger" | "image_tagger" => Ok(ModelFamily::Tagging),
            "segmentation" | "segmentor" | "semantic_segmentor" => Ok(ModelFamily::Segmentation),
            other => Err(ServiceError::InvalidInput(format!(
                "unknown model family {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeScore {
    pub attr_value: String,
    pub attr_score: f32,
}

/// Attribute name to its possible values. Attributes and their values both
/// keep class-mapping first-appearance order.
pub type AttributeGroups = IndexMap<String, Vec<AttributeScore>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributePrediction {
    pub attributes: AttributeGroups,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedObject {
    /// `[x_min, y_min, x_max, y_max]` in original image pixels.
    pub bbox: [f32; 4],
    pub label: String,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<AttributeGroups>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DetectionPrediction {
    pub objects: Vec<DetectedObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TaggingPrediction {
    pub tags: BTreeMap<String, f32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SegmentationPrediction {
    pub class_names: Vec<String>,
    pub boxes: Vec<[u32; 4]>,
    pub rle_masks: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PredictionResult {
    Detection(DetectionPrediction),
    Attribute(AttributePrediction),
    Tagging(TaggingPrediction),
    Segmentation(SegmentationPrediction),
}

impl PredictionResult {
    pub fn family(&self) -> ModelFamily {
        match self {
            PredictionResult::Detection(_) => ModelFamily::ObjectDetection,
            PredictionResult::Attribute(_) => ModelFamily::Attribute,
            PredictionResult::Tagging(_) => ModelFamily::Tagging,
            PredictionResult::Segmentation(_) => ModelFamily::Segmentation,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub family: ModelFamily,
    pub name: String,
    pub device: String,
    pub num_classes: usize,
    pub batch_size: usize,
    pub size_bytes: u64,
    pub is_default: bool,
}
