pub mod config;
pub mod decode;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod mask;
pub mod model;
pub mod server;
pub mod tensor;
pub mod transform;

pub use config::AppConfig;
pub use decode::{HttpFetcher, ImageDecoder, ImageSource};
pub use dispatch::{Dispatcher, PredictionRequest};
pub use error::ServiceError;
pub use model::{ModelFamily, ModelRegistry, PredictionResult};
pub use server::build_router;
