use image::RgbImage;

use crate::{
    error::ServiceError,
    model::{ModelMetadata, PredictionResult, loader::ModelArtifact},
};

/// Uniform contract over every model family: one result per input image, in
/// input order.
pub trait ModelAdapter: Send + Sync {
    fn artifact(&self) -> &ModelArtifact;

    fn num_classes(&self) -> usize;

    fn predict(&self, images: &[RgbImage]) -> Result<Vec<PredictionResult>, ServiceError>;

    fn metadata(&self) -> ModelMetadata {
        self.artifact().metadata(self.num_classes())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers that lay out model directories on disk.

    use std::{fs, path::Path};

    use serde_json::{Value, json};

    use crate::model::loader::{CLASS_MAPPING_FILE, NETWORK_FILE, TRANSFORMS_FILE};

    pub fn write_model_dir(root: &Path, name: &str, mapping: Value, transforms: Value) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(CLASS_MAPPING_FILE), mapping.to_string()).unwrap();
        fs::write(dir.join(TRANSFORMS_FILE), transforms.to_string()).unwrap();
        fs::write(dir.join(NETWORK_FILE), b"torchscript").unwrap();
    }

    pub fn write_extra(root: &Path, name: &str, file: &str, body: Value) {
        fs::write(root.join(name).join(file), body.to_string()).unwrap();
    }

    pub fn resize_transforms(height: usize, width: usize) -> Value {
        json!({
            "__version__": "1.3.0",
            "transform": {
                "__class_fullname__": "Compose",
                "transforms": [
                    {"__class_fullname__": "Resize", "height": height, "width": width},
                    {"__class_fullname__": "Normalize"}
                ]
            }
        })
    }

    pub fn identity_transforms() -> Value {
        json!({"transform": {"__class_fullname__": "Compose", "transforms": []}})
    }
}
