//! Declarative per-model pixel transforms.
//!
//! The step list is read from the model's `transforms.json`, which follows the
//! albumentations serialization layout so the exact file used during training
//! can ship with the artifact.

use std::{fs, path::Path};

use image::RgbImage;
use ndarray::{Array3, Axis, s};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::ServiceError,
    tensor::{hwc_to_chw, image_to_hwc, resize_bilinear},
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PerChannel {
    Scalar(f32),
    List(Vec<f32>),
}

impl PerChannel {
    fn get(&self, channel: usize) -> f32 {
        match self {
            PerChannel::Scalar(v) => *v,
            PerChannel::List(values) => values
                .get(channel)
                .or_else(|| values.last())
                .copied()
                .unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "__class_fullname__")]
pub enum TransformStep {
    Resize {
        height: usize,
        width: usize,
    },
    LongestMaxSize {
        max_size: usize,
    },
    SmallestMaxSize {
        max_size: usize,
    },
    CenterCrop {
        height: usize,
        width: usize,
    },
    Normalize {
        #[serde(default = "imagenet_mean")]
        mean: PerChannel,
        #[serde(default = "imagenet_std")]
        std: PerChannel,
        #[serde(default = "default_max_pixel")]
        max_pixel_value: f32,
    },
    ToFloat {
        #[serde(default)]
        max_value: Option<f32>,
    },
    ChannelReorder {
        #[serde(default = "bgr_order")]
        order: Vec<usize>,
    },
    ResizeToStride {
        stride: usize,
    },
}

fn imagenet_mean() -> PerChannel {
    PerChannel::List(vec![0.485, 0.456, 0.406])
}

fn imagenet_std() -> PerChannel {
    PerChannel::List(vec![0.229, 0.224, 0.225])
}

fn default_max_pixel() -> f32 {
    255.0
}

fn bgr_order() -> Vec<usize> {
    vec![2, 1, 0]
}

impl TransformStep {
    /// Config errors that can be caught before any image is seen.
    fn validate(&self) -> Result<(), String> {
        match self {
            TransformStep::ChannelReorder { order }
                if order.len() != 3 || order.iter().any(|&c| c >= 3) =>
            {
                Err(format!("channel order {order:?} must pick 3 of the RGB channels"))
            }
            _ => Ok(()),
        }
    }
}

/// Rounds `n` to the closest multiple of `stride`. An exact midpoint goes to
/// the lower multiple. Never returns zero.
pub fn round_to_stride(n: usize, stride: usize) -> usize {
    if stride == 0 {
        return n;
    }
    let lower = stride * (n / stride);
    let upper = lower + stride;
    let rounded = if n - lower <= upper - n { lower } else { upper };
    rounded.max(stride)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformPipeline {
    steps: Vec<TransformStep>,
}

impl TransformPipeline {
    pub fn new(steps: Vec<TransformStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[TransformStep] {
        &self.steps
    }

    pub fn from_file(path: &Path) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(path).map_err(|e| ServiceError::load(path, e))?;
        let value: Value = serde_json::from_str(&raw).map_err(|e| ServiceError::load(path, e))?;
        Self::from_value(&value).map_err(|e| ServiceError::load(path, e))
    }

    /// Accepts a serialized `Compose` (optionally wrapped in `{"transform": ..}`)
    /// or a bare list of steps.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let root = value.get("transform").unwrap_or(value);
        let items = match root {
            Value::Array(items) => items,
            Value::Object(map) => match map.get("transforms") {
                Some(Value::Array(items)) => items,
                _ => return Err("expected a `transforms` list".into()),
            },
            _ => return Err("transform config must be an object or a list".into()),
        };

        let mut steps = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            let mut item = item.clone();
            let name = item
                .get("__class_fullname__")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| format!("step {idx} has no `__class_fullname__`"))?;
            let short = name.rsplit('.').next().unwrap_or(&name).to_string();
            if short == "ToTensorV2" {
                // Layout conversion happens unconditionally after the steps.
                continue;
            }
            item["__class_fullname__"] = Value::String(short);
            let step: TransformStep =
                serde_json::from_value(item).map_err(|e| format!("step {idx} ({name}): {e}"))?;
            step.validate().map_err(|e| format!("step {idx} ({name}): {e}"))?;
            steps.push(step);
        }
        Ok(Self { steps })
    }

    /// Runs every step and returns a CHW float tensor.
    pub fn apply(&self, image: &RgbImage) -> Result<Array3<f32>, ServiceError> {
        let mut hwc = image_to_hwc(image);
        if hwc.is_empty() {
            return Err(ServiceError::InvalidInput("image has no pixels".into()));
        }
        // Geometric steps on an 8-bit image keep 8-bit values until the data
        // is converted to float.
        let mut integral = true;
        for step in &self.steps {
            hwc = match step {
                TransformStep::Resize { height, width } => {
                    resize_hwc(&hwc, *height, *width, integral)
                }
                TransformStep::LongestMaxSize { max_size } => {
                    let (h, w, _) = hwc.dim();
                    let (nh, nw) = scale_to(h, w, *max_size, h.max(w));
                    resize_hwc(&hwc, nh, nw, integral)
                }
                TransformStep::SmallestMaxSize { max_size } => {
                    let (h, w, _) = hwc.dim();
                    let (nh, nw) = scale_to(h, w, *max_size, h.min(w));
                    resize_hwc(&hwc, nh, nw, integral)
                }
                TransformStep::CenterCrop { height, width } => center_crop(&hwc, *height, *width)?,
                TransformStep::Normalize {
                    mean,
                    std,
                    max_pixel_value,
                } => {
                    integral = false;
                    let mut out = hwc;
                    for (c, mut plane) in out.axis_iter_mut(Axis(2)).enumerate() {
                        let m = mean.get(c) * max_pixel_value;
                        let d = std.get(c) * max_pixel_value;
                        plane.mapv_inplace(|v| (v - m) / d);
                    }
                    out
                }
                TransformStep::ToFloat { max_value } => {
                    integral = false;
                    let max = max_value.unwrap_or(255.0);
                    hwc.mapv(|v| v / max)
                }
                TransformStep::ChannelReorder { order } => reorder_channels(&hwc, order)?,
                TransformStep::ResizeToStride { stride } => {
                    let (h, w, _) = hwc.dim();
                    resize_hwc(
                        &hwc,
                        round_to_stride(h, *stride),
                        round_to_stride(w, *stride),
                        integral,
                    )
                }
            };
        }
        Ok(hwc_to_chw(hwc))
    }
}

fn scale_to(h: usize, w: usize, target: usize, reference: usize) -> (usize, usize) {
    if reference == target || reference == 0 {
        return (h, w);
    }
    let scale = target as f64 / reference as f64;
    let nh = ((h as f64 * scale).round() as usize).max(1);
    let nw = ((w as f64 * scale).round() as usize).max(1);
    (nh, nw)
}

fn resize_hwc(hwc: &Array3<f32>, height: usize, width: usize, integral: bool) -> Array3<f32> {
    let (h, w, _) = hwc.dim();
    if (h, w) == (height, width) {
        return hwc.clone();
    }
    let chw = hwc.view().permuted_axes([2, 0, 1]);
    let resized = resize_bilinear(chw, height, width).permuted_axes([1, 2, 0]);
    if integral {
        resized.mapv(|v| v.round().clamp(0.0, 255.0))
    } else {
        resized
    }
}

fn center_crop(hwc: &Array3<f32>, height: usize, width: usize) -> Result<Array3<f32>, ServiceError> {
    let (h, w, _) = hwc.dim();
    if height > h || width > w {
        return Err(ServiceError::InvalidInput(format!(
            "image {w}x{h} is smaller than the {width}x{height} center crop"
        )));
    }
    let top = (h - height) / 2;
    let left = (w - width) / 2;
    Ok(hwc
        .slice(s![top..top + height, left..left + width, ..])
        .to_owned())
}

fn reorder_channels(hwc: &Array3<f32>, order: &[usize]) -> Result<Array3<f32>, ServiceError> {
    let channels = hwc.dim().2;
    if order.iter().any(|&c| c >= channels) {
        return Err(ServiceError::Inference(format!(
            "channel order {order:?} does not fit a {channels}-channel image"
        )));
    }
    Ok(hwc.select(Axis(2), order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stride_rounding_prefers_closest_and_lower_on_ties() {
        assert_eq!(round_to_stride(100, 32), 96);
        assert_eq!(round_to_stride(112, 32), 96);
        assert_eq!(round_to_stride(113, 32), 128);
        assert_eq!(round_to_stride(96, 32), 96);
        assert_eq!(round_to_stride(257, 32), 256);
        assert_eq!(round_to_stride(10, 32), 32);
    }

    #[test]
    fn parses_albumentations_compose() {
        let config = json!({
            "__version__": "1.3.0",
            "transform": {
                "__class_fullname__": "Compose",
                "p": 1.0,
                "transforms": [
                    {
                        "__class_fullname__": "albumentations.augmentations.geometric.resize.Resize",
                        "always_apply": false,
                        "p": 1,
                        "height": 8,
                        "width": 4,
                        "interpolation": 1
                    },
                    {
                        "__class_fullname__": "Normalize",
                        "mean": [0.5, 0.5, 0.5],
                        "std": 0.5,
                        "max_pixel_value": 255.0
                    },
                    { "__class_fullname__": "ToTensorV2" }
                ]
            }
        });
        let pipeline = TransformPipeline::from_value(&config).unwrap();
        assert_eq!(
            pipeline.steps()[0],
            TransformStep::Resize {
                height: 8,
                width: 4
            }
        );
        assert_eq!(pipeline.steps().len(), 2);
    }

    #[test]
    fn unknown_step_is_rejected() {
        let config = json!([{ "__class_fullname__": "RandomRain" }]);
        assert!(TransformPipeline::from_value(&config).is_err());
    }

    #[test]
    fn bad_channel_order_fails_when_loading() {
        for order in [json!([0, 3, 1]), json!([2, 1])] {
            let config = json!([{"__class_fullname__": "ChannelReorder", "order": order}]);
            assert!(TransformPipeline::from_value(&config).is_err());
        }
        let ok = json!([{"__class_fullname__": "ChannelReorder", "order": [2, 1, 0]}]);
        assert!(TransformPipeline::from_value(&ok).is_ok());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transforms.json");
        std::fs::write(
            &path,
            json!([{"__class_fullname__": "ChannelReorder", "order": [5, 0, 1]}]).to_string(),
        )
        .unwrap();
        assert!(matches!(
            TransformPipeline::from_file(&path),
            Err(ServiceError::Load(_))
        ));
    }

    #[test]
    fn apply_resizes_normalizes_and_outputs_chw() {
        let pipeline = TransformPipeline::new(vec![
            TransformStep::Resize {
                height: 4,
                width: 6,
            },
            TransformStep::Normalize {
                mean: PerChannel::Scalar(0.5),
                std: PerChannel::Scalar(0.5),
                max_pixel_value: 255.0,
            },
        ]);
        let image = RgbImage::from_pixel(13, 7, image::Rgb([255, 0, 255]));
        let out = pipeline.apply(&image).unwrap();
        assert_eq!(out.dim(), (3, 4, 6));
        assert!((out[[0, 2, 3]] - 1.0).abs() < 1e-5);
        assert!((out[[1, 2, 3]] + 1.0).abs() < 1e-5);
    }

    #[test]
    fn apply_is_deterministic_for_any_input_size() {
        let pipeline = TransformPipeline::new(vec![
            TransformStep::LongestMaxSize { max_size: 16 },
            TransformStep::ToFloat { max_value: None },
        ]);
        let image = RgbImage::from_fn(40, 20, |x, y| image::Rgb([(x * 6) as u8, (y * 12) as u8, 7]));
        let a = pipeline.apply(&image).unwrap();
        let b = pipeline.apply(&image).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.dim(), (3, 8, 16));
    }

    #[test]
    fn channel_reorder_swaps_rgb_to_bgr() {
        let pipeline = TransformPipeline::new(vec![TransformStep::ChannelReorder {
            order: vec![2, 1, 0],
        }]);
        let image = RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]));
        let out = pipeline.apply(&image).unwrap();
        assert_eq!(out[[0, 0, 0]], 3.0);
        assert_eq!(out[[2, 1, 1]], 1.0);
    }

    #[test]
    fn center_crop_larger_than_image_fails() {
        let pipeline = TransformPipeline::new(vec![TransformStep::CenterCrop {
            height: 10,
            width: 10,
        }]);
        let image = RgbImage::new(4, 4);
        assert!(matches!(
            pipeline.apply(&image),
            Err(ServiceError::InvalidInput(_))
        ));
    }
}
