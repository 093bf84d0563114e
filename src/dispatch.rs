//! Turns a prediction request into a registry lookup, an image decode and one
//! blocking predict call, then applies whatever thresholds the caller set.

use std::sync::Arc;

use image::{RgbImage, imageops};
use tokio::task;

use crate::{
    decode::{ImageDecoder, ImageSource},
    error::ServiceError,
    model::{
        AttributeGroups, DetectedObject, DetectionPrediction, ModelAdapter, ModelFamily,
        ModelRegistry, PredictionResult, TaggingPrediction,
    },
};

#[derive(Debug, Clone)]
pub struct PredictionRequest {
    pub family: ModelFamily,
    pub model: Option<String>,
    /// Attribute model applied to detected objects.
    pub attribute_model: Option<String>,
    pub image: ImageSource,
    /// Unset means no confidence filtering.
    pub confidence_threshold: Option<f32>,
    /// Unset means no attribute filtering.
    pub attribute_threshold: Option<f32>,
}

impl PredictionRequest {
    pub fn new(family: ModelFamily, image: ImageSource) -> Self {
        Self {
            family,
            model: None,
            attribute_model: None,
            image,
            confidence_threshold: None,
            attribute_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    confidence: Option<f32>,
    attribute: Option<f32>,
}

fn threshold(value: Option<f32>, field: &str) -> Result<Option<f32>, ServiceError> {
    match value {
        None => Ok(None),
        Some(v) if v.is_finite() && (0.0..=1.0).contains(&v) => Ok(Some(v)),
        Some(v) => Err(ServiceError::InvalidInput(format!(
            "{field} must be within [0, 1], got {v}"
        ))),
    }
}

enum Plan {
    Single(Arc<dyn ModelAdapter>),
    Detection {
        detector: Arc<dyn ModelAdapter>,
        attributer: Option<Arc<dyn ModelAdapter>>,
    },
}

pub struct Dispatcher {
    registry: Arc<ModelRegistry>,
    decoder: ImageDecoder,
}

impl Dispatcher {
    pub fn new(registry: Arc<ModelRegistry>, decoder: ImageDecoder) -> Self {
        Self { registry, decoder }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub async fn dispatch(
        &self,
        request: PredictionRequest,
    ) -> Result<PredictionResult, ServiceError> {
        let thresholds = Thresholds {
            confidence: threshold(request.confidence_threshold, "confidence_threshold")?,
            attribute: threshold(request.attribute_threshold, "attribute_threshold")?,
        };

        let plan = self.plan(&request)?;
        let image = self.decoder.decode(&request.image).await?;
        let (width, height) = image.dimensions();
        tracing::debug!(family = %request.family, width, height, "image decoded");

        task::spawn_blocking(move || execute(plan, image, thresholds))
            .await
            .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }

    fn plan(&self, request: &PredictionRequest) -> Result<Plan, ServiceError> {
        let model = self
            .registry
            .resolve(request.family, request.model.as_deref())?;
        if request.family != ModelFamily::ObjectDetection {
            return Ok(Plan::Single(model));
        }

        let attributer = match request.attribute_model.as_deref() {
            Some(name) if !name.trim().is_empty() => {
                Some(self.registry.resolve(ModelFamily::Attribute, Some(name))?)
            }
            _ if self.registry.has_family(ModelFamily::Attribute) => {
                Some(self.registry.resolve(ModelFamily::Attribute, None)?)
            }
            _ => None,
        };
        Ok(Plan::Detection {
            detector: model,
            attributer,
        })
    }
}

fn execute(
    plan: Plan,
    image: RgbImage,
    thresholds: Thresholds,
) -> Result<PredictionResult, ServiceError> {
    match plan {
        Plan::Single(model) => {
            let result = single(model.predict(std::slice::from_ref(&image))?)?;
            Ok(apply_thresholds(result, thresholds))
        }
        Plan::Detection {
            detector,
            attributer,
        } => {
            let PredictionResult::Detection(mut detections) =
                single(detector.predict(std::slice::from_ref(&image))?)?
            else {
                return Err(ServiceError::Inference(
                    "detector returned a non-detection result".into(),
                ));
            };
            if let Some(min) = thresholds.confidence {
                detections.objects.retain(|o| o.confidence >= min);
            }
            if let Some(attributer) = attributer {
                attach_attributes(&mut detections, attributer.as_ref(), &image, thresholds)?;
            }
            Ok(PredictionResult::Detection(detections))
        }
    }
}

fn single(results: Vec<PredictionResult>) -> Result<PredictionResult, ServiceError> {
    let count = results.len();
    let mut results = results.into_iter();
    match (results.next(), count) {
        (Some(result), 1) => Ok(result),
        _ => Err(ServiceError::Inference(format!(
            "expected one result per image, got {count}"
        ))),
    }
}

fn attach_attributes(
    detections: &mut DetectionPrediction,
    attributer: &dyn ModelAdapter,
    image: &RgbImage,
    thresholds: Thresholds,
) -> Result<(), ServiceError> {
    if detections.objects.is_empty() {
        return Ok(());
    }
    let crops: Vec<RgbImage> = detections
        .objects
        .iter()
        .map(|object| crop_box(image, object.bbox))
        .collect();
    let results = attributer.predict(&crops)?;
    if results.len() != detections.objects.len() {
        return Err(ServiceError::Inference(format!(
            "attribute model returned {} results for {} crops",
            results.len(),
            detections.objects.len()
        )));
    }
    for (object, result) in detections.objects.iter_mut().zip(results) {
        let PredictionResult::Attribute(prediction) = result else {
            return Err(ServiceError::Inference(
                "attribute model returned a non-attribute result".into(),
            ));
        };
        object.attributes = Some(match thresholds.attribute {
            Some(min) => filter_groups(prediction.attributes, min),
            None => prediction.attributes,
        });
    }
    Ok(())
}

/// Pixel region covering `bbox`, at least one pixel in each direction.
fn crop_box(image: &RgbImage, bbox: [f32; 4]) -> RgbImage {
    let (width, height) = image.dimensions();
    let x0 = (bbox[0].floor().max(0.0) as u32).min(width.saturating_sub(1));
    let y0 = (bbox[1].floor().max(0.0) as u32).min(height.saturating_sub(1));
    let x1 = (bbox[2].ceil().max(0.0) as u32).clamp(x0 + 1, width.max(x0 + 1));
    let y1 = (bbox[3].ceil().max(0.0) as u32).clamp(y0 + 1, height.max(y0 + 1));
    imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image()
}

fn apply_thresholds(result: PredictionResult, thresholds: Thresholds) -> PredictionResult {
    match (result, thresholds) {
        (
            PredictionResult::Tagging(TaggingPrediction { mut tags }),
            Thresholds {
                confidence: Some(min),
                ..
            },
        ) => {
            tags.retain(|_, score| *score >= min);
            PredictionResult::Tagging(TaggingPrediction { tags })
        }
        (
            PredictionResult::Attribute(mut prediction),
            Thresholds {
                attribute: Some(min),
                ..
            },
        ) => {
            prediction.attributes = filter_groups(prediction.attributes, min);
            PredictionResult::Attribute(prediction)
        }
        (
            PredictionResult::Detection(DetectionPrediction { mut objects }),
            Thresholds {
                confidence: Some(min),
                ..
            },
        ) => {
            objects.retain(|o: &DetectedObject| o.confidence >= min);
            PredictionResult::Detection(DetectionPrediction { objects })
        }
        (unfiltered, _) => unfiltered,
    }
}

/// Drops values under `threshold`, then attributes left with no value.
fn filter_groups(groups: AttributeGroups, threshold: f32) -> AttributeGroups {
    groups
        .into_iter()
        .filter_map(|(name, mut values)| {
            values.retain(|v| v.attr_score >= threshold);
            (!values.is_empty()).then_some((name, values))
        })
        .collect()
}
