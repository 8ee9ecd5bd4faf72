use std::time::Instant;

use actix_web::error::InternalError;
use actix_web::{web, HttpResponse, Responder};
use log::{error, info, warn};
use serde_json::{Map, Value};

use crate::error::ServiceError;
use crate::loader;
use crate::models::{
    ApiResponse, HealthStatus, ModelMetadata, ModelMetrics, PredictQuery, PredictionResult,
};
use crate::service::{ArtifactPaths, PredictionService};

/// Built once at startup and shared by every worker.
pub struct AppState {
    pub service: PredictionService,
    pub paths: ArtifactPaths,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .app_data(query_config())
        .route("/health", web::get().to(health))
        .route("/metadata", web::get().to(metadata))
        .route("/predict", web::post().to(predict));
}

pub async fn not_found() -> impl Responder {
    HttpResponse::NotFound().json(ApiResponse::<()>::error("Endpoint not found"))
}

async fn health() -> impl Responder {
    HttpResponse::Ok().json(ApiResponse::success(HealthStatus::ok()))
}

async fn metadata(state: web::Data<AppState>) -> impl Responder {
    let start = Instant::now();
    let path = state.paths.metadata.clone();

    // Not cached: read from disk on every call.
    let record = match web::block(move || loader::load_metadata(&path)).await {
        Ok(Ok(record)) => record,
        Ok(Err(e)) => {
            error!("Failed to read metadata: {}", e);
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<ModelMetadata>::error(&e.to_string()).timed(start));
        }
        Err(e) => {
            error!("Blocking metadata read failed: {}", e);
            return HttpResponse::InternalServerError()
                .json(ApiResponse::<ModelMetadata>::error("Execution error").timed(start));
        }
    };

    let model = state
        .paths
        .model
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let body = ModelMetadata {
        model,
        features: state.service.features().to_vec(),
        metrics: ModelMetrics {
            r2: record.get("model2_r2").and_then(Value::as_f64),
            rmse: record.get("model2_rmse").and_then(Value::as_f64),
        },
    };
    HttpResponse::Ok().json(ApiResponse::success(body).timed(start))
}

async fn predict(
    state: web::Data<AppState>,
    query: web::Query<PredictQuery>,
    req: web::Json<Map<String, Value>>,
) -> impl Responder {
    let start = Instant::now();
    let debug = query.debug;
    let payload = req.into_inner();

    let worker_state = state.clone();
    match web::block(move || worker_state.service.predict(&payload)).await {
        Ok(Ok(prediction)) => {
            info!("Prediction served: {:.4}", prediction.value);
            HttpResponse::Ok()
                .json(ApiResponse::success(PredictionResult::from(prediction)).timed(start))
        }
        Ok(Err(e)) => prediction_failure(e, debug, start),
        Err(e) => {
            error!("Blocking prediction failed: {}", e);
            HttpResponse::InternalServerError()
                .json(ApiResponse::<PredictionResult>::error("Execution error").timed(start))
        }
    }
}

fn prediction_failure(err: ServiceError, debug: bool, start: Instant) -> HttpResponse {
    if debug {
        error!("Prediction failed (debug): {:?}", err);
        return HttpResponse::InternalServerError()
            .json(ApiResponse::<PredictionResult>::error(&format!("{:?}", err)).timed(start));
    }

    let response = ApiResponse::<PredictionResult>::error(&err.to_string()).timed(start);
    if err.is_client_error() {
        warn!("Rejected prediction request: {}", err);
        HttpResponse::BadRequest().json(response)
    } else {
        error!("Prediction failed: {}", err);
        HttpResponse::InternalServerError().json(response)
    }
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(64 * 1024)
        .error_handler(|err, _req| {
            let response =
                HttpResponse::BadRequest().json(ApiResponse::<()>::error(&err.to_string()));
            InternalError::from_response(err, response).into()
        })
}

fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(|err, _req| {
        let response = HttpResponse::BadRequest().json(ApiResponse::<()>::error(&err.to_string()));
        InternalError::from_response(err, response).into()
    })
}
