pub mod adapter;
pub mod attribute;
pub mod detector;
pub mod loader;
pub mod mapping;
pub mod registry;
pub mod segmentor;
pub mod tagger;
mod types;

#[cfg(feature = "tch-backend")]
pub mod tch_backend;

pub use adapter::ModelAdapter;
pub use loader::{LoadContext, ModelArtifact};
pub use registry::{FamilySpec, ModelRegistry, RegistryBuilder, ScanReport};
pub use types::{
    AttributeGroups, AttributePrediction, AttributeScore, DetectedObject, DetectionPrediction,
    ModelFamily, ModelMetadata, PredictionResult, SegmentationPrediction, TaggingPrediction,
};
