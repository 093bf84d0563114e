use std::path::Path;

use image::RgbImage;
use ndarray::{Array2, Array3, Axis};

use crate::{
    error::ServiceError,
    mask,
    model::{
        ModelFamily, PredictionResult, SegmentationPrediction,
        adapter::ModelAdapter,
        loader::{LoadContext, ModelArtifact},
        mapping,
    },
    tensor::{argmax_channels, resize_bilinear},
    transform::round_to_stride,
};

/// Semantic segmentation. Images run one at a time because the stride-aligned
/// input size depends on each image's own dimensions.
pub struct SegmentorModel {
    artifact: ModelArtifact,
    class_names: Vec<String>,
}

impl SegmentorModel {
    pub fn load(dir: &Path, name: &str, ctx: &LoadContext) -> Result<Self, ServiceError> {
        let (artifact, raw) = ModelArtifact::load(ModelFamily::Segmentation, dir, name, ctx)?;
        let class_names =
            mapping::parse_indexed_list(&raw).map_err(|e| ServiceError::load(dir, e))?;
        if class_names.len() < 2 {
            return Err(ServiceError::load(
                dir,
                "segmentation mapping needs background plus at least one class",
            ));
        }
        if ctx.probe {
            artifact.probe_channels(class_names.len())?;
        }
        tracing::info!(
            model = %artifact.name,
            classes = class_names.len(),
            stride = artifact.stride,
            "segmentation model loaded"
        );
        Ok(Self {
            artifact,
            class_names,
        })
    }

    /// Per-pixel class index at the original image resolution.
    pub fn label_mask(&self, image: &RgbImage) -> Result<Array2<u32>, ServiceError> {
        let (width, height) = image.dimensions();
        let x = self.artifact.transforms.apply(image)?;

        let (_, h, w) = x.dim();
        let stride = self.artifact.stride;
        let (sh, sw) = (round_to_stride(h, stride), round_to_stride(w, stride));
        let x = if (h, w) != (sh, sw) {
            resize_bilinear(x.view(), sh, sw)
        } else {
            x
        };

        let batch = x.insert_axis(Axis(0));
        let output = self.artifact.network.forward(batch)?;
        let shape = output.shape().to_vec();
        if shape.len() != 4 || shape[0] != 1 || shape[1] != self.class_names.len() {
            return Err(ServiceError::Inference(format!(
                "segmentation output shape {shape:?} does not match [1, {}, H, W]",
                self.class_names.len()
            )));
        }
        let logits: Array3<f32> = output
            .index_axis_move(Axis(0), 0)
            .into_dimensionality()
            .map_err(|e| ServiceError::Inference(e.to_string()))?;
        let logits = resize_bilinear(logits.view(), height as usize, width as usize);
        Ok(argmax_channels(logits.view()))
    }

    fn segment(&self, image: &RgbImage) -> Result<SegmentationPrediction, ServiceError> {
        let labels = self.label_mask(image)?;
        let regions = mask::decompose(labels.view(), self.class_names.len())?;

        let mut prediction = SegmentationPrediction::default();
        for region in regions {
            prediction
                .class_names
                .push(self.class_names[region.class_idx].clone());
            prediction.boxes.push(region.bbox.to_xyxy());
            prediction.rle_masks.push(region.rle);
        }
        Ok(prediction)
    }
}

impl ModelAdapter for SegmentorModel {
    fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    fn predict(&self, images: &[RgbImage]) -> Result<Vec<PredictionResult>, ServiceError> {
        images
            .iter()
            .map(|image| self.segment(image).map(PredictionResult::Segmentation))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        engine::{
            Device, Network,
            testing::{FakeLoader, FakeNetwork},
        },
        mask::rle_decode,
        model::adapter::testing::{identity_transforms, write_model_dir},
    };

    fn mapping() -> serde_json::Value {
        json!([
            {"model_idx": 0, "class_name": "background"},
            {"model_idx": 1, "class_name": "road"},
            {"model_idx": 2, "class_name": "car"},
            {"model_idx": 3, "class_name": "person"}
        ])
    }

    /// Right half of the frame is road, a block in the top-left quadrant is a
    /// car, nothing is a person.
    fn scene(y: usize, x: usize, h: usize, w: usize) -> usize {
        if x >= w / 2 {
            1
        } else if y < h / 4 && x < w / 4 {
            2
        } else {
            0
        }
    }

    fn load(root: &Path, net_shapes: Arc<parking_lot::Mutex<Vec<(usize, usize)>>>) -> SegmentorModel {
        let loader = FakeLoader::new(move |_| {
            let shapes = net_shapes.clone();
            Some(FakeNetwork::new(move |input| {
                let (_, _, h, w) = input.dim();
                shapes.lock().push((h, w));
                let net = FakeNetwork::segmenter(4, scene);
                net.forward(input.clone()).unwrap()
            }))
        });
        let ctx = LoadContext {
            loader: Arc::new(loader),
            device: Device::Cpu,
            batch_size: 32,
            stride: 32,
            probe: true,
        };
        write_model_dir(root, "streets", mapping(), identity_transforms());
        SegmentorModel::load(&root.join("streets"), "streets", &ctx).unwrap()
    }

    #[test]
    fn emits_one_record_per_present_class() {
        let root = tempfile::tempdir().unwrap();
        let shapes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let model = load(root.path(), shapes.clone());

        let image = RgbImage::new(64, 32);
        let results = model.predict(&[image]).unwrap();
        let PredictionResult::Segmentation(pred) = &results[0] else {
            panic!("expected segmentation result");
        };
        assert_eq!(pred.class_names, vec!["road", "car"]);
        assert!(!pred.class_names.contains(&"person".to_string()));
        assert_eq!(pred.boxes[0], [32, 0, 64, 32]);
        assert_eq!(pred.boxes[1], [0, 0, 16, 8]);

        let [x0, y0, x1, y1] = pred.boxes[1];
        let car = rle_decode(&pred.rle_masks[1], (y1 - y0) as usize, (x1 - x0) as usize).unwrap();
        assert!(car.iter().all(|&v| v));
    }

    #[test]
    fn input_is_stride_aligned_and_output_matches_original_size() {
        let root = tempfile::tempdir().unwrap();
        let shapes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let model = load(root.path(), shapes.clone());
        shapes.lock().clear();

        let image = RgbImage::new(100, 112);
        let labels = model.label_mask(&image).unwrap();
        assert_eq!(labels.dim(), (112, 100));
        assert_eq!(*shapes.lock(), vec![(96, 96)]);
    }

    #[test]
    fn missing_background_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        write_model_dir(
            root.path(),
            "tiny",
            json!([{"model_idx": 0, "class_name": "background"}]),
            identity_transforms(),
        );
        let ctx = LoadContext {
            loader: Arc::new(FakeLoader::new(|_| Some(FakeNetwork::segmenter(1, |_, _, _, _| 0)))),
            device: Device::Cpu,
            batch_size: 32,
            stride: 32,
            probe: false,
        };
        assert!(SegmentorModel::load(&root.path().join("tiny"), "tiny", &ctx).is_err());
    }
}
