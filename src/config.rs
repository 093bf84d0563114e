use std::{
    collections::HashMap,
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::{engine::Device, model::ModelFamily};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_dir: PathBuf,
    pub device: Device,
    pub batch_size: usize,
    pub stride: usize,
    pub worker_threads: usize,
    pub max_blocking_threads: usize,
    pub fetch_timeout: Duration,
    pub max_image_bytes: usize,
    pub probe_on_load: bool,
    pub default_models: HashMap<ModelFamily, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5000),
            model_dir: PathBuf::from("model"),
            device: Device::Cuda(0),
            batch_size: 32,
            stride: 32,
            worker_threads: 8,
            max_blocking_threads: 8,
            fetch_timeout: Duration::from_secs(10),
            max_image_bytes: 32 * 1024 * 1024,
            probe_on_load: true,
            default_models: HashMap::new(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = match env::var("SERVER_ADDR") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid SERVER_ADDR {raw:?}: {e}"))?,
            Err(_) => defaults.listen_addr,
        };

        let model_dir = env::var("MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.model_dir);

        let device = env::var("DEVICE")
            .map(|raw| parse_device(&raw))
            .unwrap_or(defaults.device);

        let batch_size = parse_env("BATCH_SIZE", defaults.batch_size)?;
        let stride = parse_env("STRIDE", defaults.stride)?;
        if batch_size == 0 || stride == 0 {
            anyhow::bail!("BATCH_SIZE and STRIDE must be positive");
        }

        let worker_threads = parse_env("WORKER_THREADS", defaults.worker_threads)?.max(1);
        let max_blocking_threads =
            parse_env("MAX_BLOCKING_THREADS", defaults.max_blocking_threads)?.max(1);
        let fetch_timeout = env::var("FETCH_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.fetch_timeout);
        let max_image_bytes = parse_env("MAX_IMAGE_BYTES", defaults.max_image_bytes)?;
        let probe_on_load = env::var("PROBE_ON_LOAD")
            .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"))
            .unwrap_or(defaults.probe_on_load);

        let mut default_models = HashMap::new();
        for family in ModelFamily::ALL {
            let key = format!("DEFAULT_{}_MODEL", family.as_str().to_uppercase());
            if let Ok(name) = env::var(&key) {
                if !name.trim().is_empty() {
                    default_models.insert(family, name.trim().to_string());
                }
            }
        }

        Ok(Self {
            listen_addr,
            model_dir,
            device,
            batch_size,
            stride,
            worker_threads,
            max_blocking_threads,
            fetch_timeout,
            max_image_bytes,
            probe_on_load,
            default_models,
        })
    }
}

fn parse_env(key: &str, default: usize) -> anyhow::Result<usize> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key} {raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

/// Accepts `cpu`, `cuda` and `cuda:N`. Anything else means CPU.
pub fn parse_device(raw: &str) -> Device {
    let lower = raw.trim().to_lowercase();
    if lower.starts_with("cuda") || lower.starts_with("gpu") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        Device::Cuda(idx)
    } else {
        Device::Cpu
    }
}
