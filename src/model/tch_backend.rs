use std::{path::Path, sync::Arc};

use ndarray::{Array4, ArrayD, IxDyn};
use parking_lot::Mutex;
use tch::{IValue, Kind, Tensor, no_grad};

use crate::{
    engine::{Device, Network, NetworkLoader},
    error::ServiceError,
};

fn to_tch(device: Device) -> tch::Device {
    match device {
        Device::Cpu => tch::Device::Cpu,
        Device::Cuda(idx) => tch::Device::Cuda(idx),
    }
}

/// Loads TorchScript archives with libtorch.
pub struct TorchScriptLoader;

impl NetworkLoader for TorchScriptLoader {
    fn accelerator_available(&self, device: Device) -> bool {
        match device {
            Device::Cpu => true,
            Device::Cuda(idx) => {
                tch::Cuda::is_available() && (idx as i64) < tch::Cuda::device_count()
            }
        }
    }

    fn load(&self, artifact: &Path, device: Device) -> Result<Arc<dyn Network>, ServiceError> {
        if !artifact.is_file() {
            return Err(ServiceError::load(artifact, "network file missing"));
        }
        let mut module = tch::CModule::load_on_device(artifact, to_tch(device))
            .map_err(|e| ServiceError::load(artifact, e))?;
        module.set_eval();
        Ok(Arc::new(TorchScriptNetwork {
            device: to_tch(device),
            module: Mutex::new(module),
        }))
    }
}

pub struct TorchScriptNetwork {
    device: tch::Device,
    module: Mutex<tch::CModule>,
}

impl Network for TorchScriptNetwork {
    fn forward(&self, input: Array4<f32>) -> Result<ArrayD<f32>, ServiceError> {
        let (n, c, h, w) = input.dim();
        let contiguous = input.as_standard_layout();
        let data = contiguous
            .as_slice()
            .ok_or_else(|| ServiceError::Inference("input tensor is not contiguous".into()))?;
        let batch = Tensor::from_slice(data)
            .reshape([n as i64, c as i64, h as i64, w as i64])
            .to_device(self.device);

        let output = no_grad(|| {
            let module = self.module.lock();
            module
                .forward_is(&[IValue::Tensor(batch)])
                .map_err(|e| ServiceError::Inference(e.to_string()))
        })?;

        // Traced models may wrap their main output in a tuple.
        let tensor = match output {
            IValue::Tensor(t) => t,
            IValue::Tuple(ref items) if !items.is_empty() => match &items[0] {
                IValue::Tensor(t) => t.shallow_clone(),
                _ => {
                    return Err(ServiceError::Inference(
                        "expected tensor as first tuple element".into(),
                    ));
                }
            },
            _ => return Err(ServiceError::Inference("unexpected model output format".into())),
        };

        let tensor = tensor.to_device(tch::Device::Cpu).to_kind(Kind::Float);
        let shape: Vec<usize> = tensor.size().iter().map(|&d| d as usize).collect();
        let values = Vec::<f32>::try_from(&tensor.reshape([-1]))
            .map_err(|e| ServiceError::Inference(e.to_string()))?;
        ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| ServiceError::Inference(e.to_string()))
    }
}
