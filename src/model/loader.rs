use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use image::RgbImage;
use ndarray::{Array2, Array3, ArrayD};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    config::AppConfig,
    engine::{Device, Network, NetworkLoader, place_on_device},
    error::ServiceError,
    model::{ModelFamily, ModelMetadata, mapping},
    tensor::stack_batch,
    transform::TransformPipeline,
};

pub const TRANSFORMS_FILE: &str = "transforms.json";
pub const CLASS_MAPPING_FILE: &str = "class_mapping.json";
pub const NETWORK_FILE: &str = "model.pt";
pub const SERVING_FILE: &str = "serving.json";
pub const DETECTOR_FILE: &str = "detector.json";

/// Everything an adapter factory needs besides the artifact directory.
#[derive(Clone)]
pub struct LoadContext {
    pub loader: Arc<dyn NetworkLoader>,
    pub device: Device,
    pub batch_size: usize,
    pub stride: usize,
    pub probe: bool,
}

impl LoadContext {
    pub fn new(config: &AppConfig, loader: Arc<dyn NetworkLoader>) -> Self {
        Self {
            loader,
            device: config.device,
            batch_size: config.batch_size,
            stride: config.stride,
            probe: config.probe_on_load,
        }
    }
}

/// Optional per-model overrides in `serving.json`.
#[derive(Debug, Default, Deserialize)]
struct ServingOptions {
    batch_size: Option<usize>,
    stride: Option<usize>,
}

/// Loaded network plus the metadata shared by every family. Immutable once
/// built.
pub struct ModelArtifact {
    pub family: ModelFamily,
    pub name: String,
    pub path: PathBuf,
    pub device: Device,
    pub transforms: TransformPipeline,
    pub network: Arc<dyn Network>,
    pub batch_size: usize,
    pub stride: usize,
    pub size_bytes: u64,
}

impl ModelArtifact {
    /// Loads the shared parts of a model directory and returns the raw class
    /// mapping for the family adapter to interpret.
    pub fn load(
        family: ModelFamily,
        dir: &Path,
        name: &str,
        ctx: &LoadContext,
    ) -> Result<(Self, Value), ServiceError> {
        if !dir.is_dir() {
            return Err(ServiceError::load(dir, "not a directory"));
        }
        let transforms = TransformPipeline::from_file(&dir.join(TRANSFORMS_FILE))?;
        let mapping = mapping::read_mapping(&dir.join(CLASS_MAPPING_FILE))?;

        let serving_path = dir.join(SERVING_FILE);
        let serving: ServingOptions = if serving_path.exists() {
            let raw = fs::read_to_string(&serving_path)
                .map_err(|e| ServiceError::load(&serving_path, e))?;
            serde_json::from_str(&raw).map_err(|e| ServiceError::load(&serving_path, e))?
        } else {
            ServingOptions::default()
        };
        let batch_size = serving.batch_size.unwrap_or(ctx.batch_size);
        let stride = serving.stride.unwrap_or(ctx.stride);
        if batch_size == 0 || stride == 0 {
            return Err(ServiceError::load(
                &serving_path,
                "batch_size and stride must be positive",
            ));
        }

        let module_path = dir.join(NETWORK_FILE);
        if !module_path.exists() {
            return Err(ServiceError::load(&module_path, "model artifact missing"));
        }
        let size_bytes = fs::metadata(&module_path)
            .map_err(|e| ServiceError::load(&module_path, e))?
            .len();
        let device = place_on_device(ctx.loader.as_ref(), ctx.device);
        let network = ctx.loader.load(&module_path, device)?;

        Ok((
            Self {
                family,
                name: name.to_string(),
                path: dir.to_path_buf(),
                device,
                transforms,
                network,
                batch_size,
                stride,
                size_bytes,
            },
            mapping,
        ))
    }

    pub fn metadata(&self, num_classes: usize) -> ModelMetadata {
        ModelMetadata {
            family: self.family,
            name: self.name.clone(),
            device: self.device.to_string(),
            num_classes,
            batch_size: self.batch_size,
            size_bytes: self.size_bytes,
            is_default: false,
        }
    }

    /// Transforms, batches and runs classifier-style models. Returns one raw
    /// logit row per image, in input order.
    pub fn classify(
        &self,
        images: &[RgbImage],
        num_classes: usize,
    ) -> Result<Vec<Vec<f32>>, ServiceError> {
        let mut rows = Vec::with_capacity(images.len());
        for chunk in images.chunks(self.batch_size) {
            let tensors = chunk
                .iter()
                .map(|image| self.transforms.apply(image))
                .collect::<Result<Vec<Array3<f32>>, _>>()?;
            let batch = stack_batch(&tensors)?;
            let output = self.network.forward(batch)?;
            let logits = logits_2d(output, chunk.len(), num_classes)?;
            rows.extend(logits.outer_iter().map(|row| row.to_vec()));
        }
        Ok(rows)
    }

    /// Runs a blank image through the model once and checks the number of
    /// output channels.
    pub fn probe_channels(&self, expected: usize) -> Result<(), ServiceError> {
        let blank = RgbImage::new(self.stride as u32 * 2, self.stride as u32 * 2);
        let tensor = self.transforms.apply(&blank)?;
        let (c, h, w) = tensor.dim();
        let batch = tensor
            .into_shape_with_order((1, c, h, w))
            .map_err(|e| ServiceError::load(&self.path, e))?;
        let output = self
            .network
            .forward(batch)
            .map_err(|e| ServiceError::load(&self.path, e))?;
        let channels = output.shape().get(1).copied().unwrap_or(0);
        if channels != expected {
            return Err(ServiceError::load(
                &self.path,
                format!("network emits {channels} channels but class mapping has {expected}"),
            ));
        }
        Ok(())
    }
}

/// Reshapes classifier output (`[N, C]`, or `[N, C, 1, 1]` style) to `[N, C]`.
pub(crate) fn logits_2d(
    output: ArrayD<f32>,
    batch: usize,
    num_classes: usize,
) -> Result<Array2<f32>, ServiceError> {
    let shape = output.shape().to_vec();
    if shape.first() != Some(&batch) || output.len() != batch * num_classes {
        return Err(ServiceError::Inference(format!(
            "network output shape {shape:?} does not match batch {batch} x {num_classes} classes"
        )));
    }
    output
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((batch, num_classes))
        .map_err(|e| ServiceError::Inference(e.to_string()))
}
