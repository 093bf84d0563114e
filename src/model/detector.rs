use std::{fs, path::Path};

use image::RgbImage;
use ndarray::{Array2, Axis};
use serde::Deserialize;

use crate::{
    error::ServiceError,
    model::{
        DetectedObject, DetectionPrediction, ModelFamily, PredictionResult,
        adapter::ModelAdapter,
        loader::{DETECTOR_FILE, LoadContext, ModelArtifact},
        mapping,
    },
};

/// Columns of one detection row: `x1, y1, x2, y2, score, class_idx`.
const ROW_WIDTH: usize = 6;

#[derive(Debug, Deserialize)]
struct DetectorOptions {
    #[serde(default = "default_max_detections")]
    max_detections: usize,
}

fn default_max_detections() -> usize {
    100
}

/// Box detector exported with its own post-processing, so the network
/// returns final detections in transformed-image coordinates.
pub struct DetectorModel {
    artifact: ModelArtifact,
    labels: Vec<String>,
    max_detections: usize,
}

impl DetectorModel {
    pub fn load(dir: &Path, name: &str, ctx: &LoadContext) -> Result<Self, ServiceError> {
        let options_path = dir.join(DETECTOR_FILE);
        let raw = fs::read_to_string(&options_path).map_err(|e| ServiceError::load(&options_path, e))?;
        let options: DetectorOptions =
            serde_json::from_str(&raw).map_err(|e| ServiceError::load(&options_path, e))?;

        let (artifact, raw) = ModelArtifact::load(ModelFamily::ObjectDetection, dir, name, ctx)?;
        let labels = mapping::parse_labels(&raw).map_err(|e| ServiceError::load(dir, e))?;
        let model = Self {
            artifact,
            labels,
            max_detections: options.max_detections,
        };
        if ctx.probe {
            let side = model.artifact.stride as u32 * 2;
            model
                .detect(&RgbImage::new(side, side))
                .map_err(|e| ServiceError::load(dir, e))?;
        }
        tracing::info!(
            model = %model.artifact.name,
            labels = model.labels.len(),
            max_detections = model.max_detections,
            "object detection model loaded"
        );
        Ok(model)
    }

    fn detect(&self, image: &RgbImage) -> Result<DetectionPrediction, ServiceError> {
        let (width, height) = image.dimensions();
        let x = self.artifact.transforms.apply(image)?;
        let (_, th, tw) = x.dim();
        let output = self.artifact.network.forward(x.insert_axis(Axis(0)))?;

        let shape = output.shape().to_vec();
        let rows: Array2<f32> = match shape.as_slice() {
            [_, ROW_WIDTH] => output.into_dimensionality(),
            [1, _, ROW_WIDTH] => output.index_axis_move(Axis(0), 0).into_dimensionality(),
            _ => {
                return Err(ServiceError::Inference(format!(
                    "detector output shape {shape:?} is not [N, {ROW_WIDTH}]"
                )));
            }
        }
        .map_err(|e| ServiceError::Inference(e.to_string()))?;

        let sx = width as f32 / tw as f32;
        let sy = height as f32 / th as f32;
        let mut objects = Vec::with_capacity(rows.nrows());
        for row in rows.outer_iter() {
            let class_idx = row[5];
            let label = Some(class_idx)
                .filter(|c| c.is_finite() && *c >= 0.0)
                .and_then(|c| self.labels.get(c.round() as usize))
                .ok_or_else(|| {
                    ServiceError::Inference(format!("detector emitted unknown class {class_idx}"))
                })?;
            let bbox = [
                (row[0] * sx).clamp(0.0, width as f32),
                (row[1] * sy).clamp(0.0, height as f32),
                (row[2] * sx).clamp(0.0, width as f32),
                (row[3] * sy).clamp(0.0, height as f32),
            ];
            objects.push(DetectedObject {
                bbox,
                label: label.clone(),
                confidence: row[4],
                attributes: None,
            });
        }
        objects.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        objects.truncate(self.max_detections);
        Ok(DetectionPrediction { objects })
    }
}

impl ModelAdapter for DetectorModel {
    fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    fn num_classes(&self) -> usize {
        self.labels.len()
    }

    fn predict(&self, images: &[RgbImage]) -> Result<Vec<PredictionResult>, ServiceError> {
        images
            .iter()
            .map(|image| self.detect(image).map(PredictionResult::Detection))
            .collect()
    }
}
