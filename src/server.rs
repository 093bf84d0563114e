use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, info};

use crate::{
    config::AppConfig,
    decode::{ImageDecoder, ImageSource},
    dispatch::{Dispatcher, PredictionRequest},
    error::ServiceError,
    model::{ModelFamily, ModelMetadata, ModelRegistry, PredictionResult},
};

/// Route defaults applied when the body leaves a threshold out.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_ATTRIBUTE_THRESHOLD: f32 = 0.5;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ModelRegistry>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Request body shared by every prediction route. Fields a route does not use
/// are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct PredictBody {
    #[serde(default)]
    pub image: ImageSource,
    pub model: Option<String>,
    /// Older clients name the detector this way.
    pub cls_model_name: Option<String>,
    pub attr_model_name: Option<String>,
    pub confidence_threshold: Option<f32>,
    #[serde(alias = "attribute_threshold")]
    pub attributer_threshold: Option<f32>,
    pub request_id: Option<Value>,
}

impl PredictBody {
    fn with_default_confidence(mut self) -> Self {
        self.confidence_threshold.get_or_insert(DEFAULT_CONFIDENCE_THRESHOLD);
        self
    }

    fn with_default_attribute_threshold(mut self) -> Self {
        self.attributer_threshold.get_or_insert(DEFAULT_ATTRIBUTE_THRESHOLD);
        self
    }
}

#[derive(Debug, Serialize)]
pub struct PredictionEnvelope {
    pub predictions: PredictionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
}

#[derive(Serialize)]
struct ModelsResponse {
    device: String,
    models: Vec<ModelMetadata>,
}

pub fn build_router(
    config: Arc<AppConfig>,
    registry: Arc<ModelRegistry>,
    decoder: ImageDecoder,
) -> Router {
    let state = AppState {
        dispatcher: Arc::new(Dispatcher::new(registry.clone(), decoder)),
        registry,
        config,
    };

    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(models))
        .route("/v1/object_detection", post(object_detection))
        .route("/v1/image_tagger", post(image_tagger))
        .route("/v1/semantic_segmentor", post(semantic_segmentor))
        .route("/v1/attributes", post(attributes))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        device: state.config.device.to_string(),
        models: state.registry.models(),
    })
}

async fn object_detection(
    State(state): State<AppState>,
    Json(body): Json<PredictBody>,
) -> Result<Json<PredictionEnvelope>, ServiceError> {
    let body = body
        .with_default_confidence()
        .with_default_attribute_threshold();
    predict(state, ModelFamily::ObjectDetection, body).await
}

async fn image_tagger(
    State(state): State<AppState>,
    Json(body): Json<PredictBody>,
) -> Result<Json<PredictionEnvelope>, ServiceError> {
    predict(state, ModelFamily::Tagging, body.with_default_confidence()).await
}

async fn semantic_segmentor(
    State(state): State<AppState>,
    Json(body): Json<PredictBody>,
) -> Result<Json<PredictionEnvelope>, ServiceError> {
    predict(state, ModelFamily::Segmentation, body).await
}

async fn attributes(
    State(state): State<AppState>,
    Json(body): Json<PredictBody>,
) -> Result<Json<PredictionEnvelope>, ServiceError> {
    predict(state, ModelFamily::Attribute, body).await
}

async fn predict(
    state: AppState,
    family: ModelFamily,
    body: PredictBody,
) -> Result<Json<PredictionEnvelope>, ServiceError> {
    let span = tracing::info_span!("predict", %family, request_id = ?body.request_id);
    let request_id = body.request_id;
    let request = PredictionRequest {
        family,
        model: body.model.or(body.cls_model_name),
        attribute_model: body.attr_model_name,
        image: body.image,
        confidence_threshold: body.confidence_threshold,
        attribute_threshold: body.attributer_threshold,
    };

    async move {
        let start = Instant::now();
        let predictions = state.dispatcher.dispatch(request).await?;
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "prediction served");
        Ok::<_, ServiceError>(Json(PredictionEnvelope {
            predictions,
            request_id,
        }))
    }
    .instrument(span)
    .await
}
