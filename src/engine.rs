//! Boundary to the neural-network execution engine.
//!
//! The serving core treats a network as an opaque callable: an NCHW float
//! batch goes in, a dense float tensor comes out. Concrete engines plug in
//! through [`NetworkLoader`].

use std::{fmt, path::Path, sync::Arc};

use ndarray::{Array4, ArrayD};

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

pub trait Network: Send + Sync {
    /// Runs one forward pass. Implementations may block while the device is
    /// busy with another caller.
    fn forward(&self, input: Array4<f32>) -> Result<ArrayD<f32>, ServiceError>;
}

pub trait NetworkLoader: Send + Sync {
    fn accelerator_available(&self, device: Device) -> bool;

    fn load(&self, artifact: &Path, device: Device) -> Result<Arc<dyn Network>, ServiceError>;
}

/// Picks the device a model is placed on. A missing accelerator degrades to
/// CPU with a warning instead of failing the load.
pub fn place_on_device(loader: &dyn NetworkLoader, requested: Device) -> Device {
    match requested {
        Device::Cpu => Device::Cpu,
        Device::Cuda(_) if loader.accelerator_available(requested) => requested,
        Device::Cuda(_) => {
            tracing::warn!(%requested, "GPU not found, falling back to cpu");
            Device::Cpu
        }
    }
}

/// Loader used when the crate is built without an execution backend. Every
/// load fails, so the registry skips the model and keeps serving.
pub struct UnavailableLoader;

impl NetworkLoader for UnavailableLoader {
    fn accelerator_available(&self, _device: Device) -> bool {
        false
    }

    fn load(&self, artifact: &Path, _device: Device) -> Result<Arc<dyn Network>, ServiceError> {
        Err(ServiceError::load(
            artifact,
            "no execution backend compiled in (enable the `tch-backend` feature)",
        ))
    }
}

pub fn default_loader() -> Arc<dyn NetworkLoader> {
    #[cfg(feature = "tch-backend")]
    {
        Arc::new(crate::model::tch_backend::TorchScriptLoader)
    }
    #[cfg(not(feature = "tch-backend"))]
    {
        Arc::new(UnavailableLoader)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeLoader;
    use super::*;

    #[test]
    fn missing_accelerator_falls_back_to_cpu() {
        let loader = FakeLoader::new(|_| None);
        assert_eq!(place_on_device(&loader, Device::Cuda(0)), Device::Cpu);
        assert_eq!(place_on_device(&loader, Device::Cpu), Device::Cpu);

        let mut loader = FakeLoader::new(|_| None);
        loader.accelerator = true;
        assert_eq!(place_on_device(&loader, Device::Cuda(1)), Device::Cuda(1));
    }

    #[test]
    fn unavailable_loader_reports_load_error() {
        let err = UnavailableLoader
            .load(Path::new("model/tagger/model.pt"), Device::Cpu)
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::Load(_)));
    }
}
