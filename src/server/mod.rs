use crate::error::{Error, Result};
use crate::model::{ModelKind, ModelRegistry, ReadinessSnapshot};
use axum::{
	extract::{Path, State},
	http::StatusCode,
	response::{IntoResponse, Response},
	routing::get,
	Json, Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
	registry: Arc<ModelRegistry>,
	device_name: String,
}

impl AppState {
	pub fn new(registry: Arc<ModelRegistry>, device_name: String) -> Self {
		Self {
			registry,
			device_name,
		}
	}
}

#[derive(Serialize)]
pub struct HealthResponse {
	pub status: String,
	pub device: String,
	pub models: BTreeMap<ModelKind, bool>,
	pub timestamp: String,
}

impl IntoResponse for Error {
	fn into_response(self) -> Response {
		let (status, message) = match self {
			Error::KindNotConfigured(_) => (StatusCode::NOT_FOUND, self.to_string()),
			Error::InvalidInput(_) => (StatusCode::BAD_REQUEST, self.to_string()),
			Error::ModelNotLoaded(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
			Error::ModelLoadFailed(_) | Error::InferenceError(_) => {
				(StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
			}
			_ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string()),
		};

		let body = Json(serde_json::json!({
			"error": message,
		}));

		(status, body).into_response()
	}
}

async fn root_handler() -> Json<serde_json::Value> {
	Json(serde_json::json!({
		"message": "DFU inference service",
		"version": env!("CARGO_PKG_VERSION"),
		"status": "online",
		"endpoints": ["/api/health", "/api/models", "/api/models/{kind}"],
	}))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
	let snapshot = state.registry.snapshot();
	let status = if snapshot.all_loaded() { "healthy" } else { "degraded" };

	Json(HealthResponse {
		status: status.to_string(),
		device: state.device_name.clone(),
		models: snapshot
			.kinds
			.iter()
			.map(|(kind, status)| (*kind, status.loaded))
			.collect(),
		timestamp: snapshot.generated_at.to_rfc3339(),
	})
}

async fn models_handler(State(state): State<AppState>) -> Json<ReadinessSnapshot> {
	Json(state.registry.snapshot())
}

async fn model_handler(
	State(state): State<AppState>,
	Path(kind): Path<ModelKind>,
) -> Result<Json<serde_json::Value>> {
	let snapshot = state.registry.snapshot();
	let status = snapshot
		.kinds
		.get(&kind)
		.ok_or_else(|| Error::KindNotConfigured(kind.to_string()))?;

	if !status.loaded {
		return Err(Error::ModelNotLoaded(kind.to_string()));
	}

	Ok(Json(serde_json::json!({
		"kind": kind,
		"status": status,
	})))
}

pub fn create_router(state: AppState) -> Router {
	Router::new()
		.route("/", get(root_handler))
		.route("/api/health", get(health_handler))
		.route("/api/models", get(models_handler))
		.route("/api/models/{kind}", get(model_handler))
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
		.with_state(state)
}

pub async fn serve(host: &str, port: u16, state: AppState) -> Result<()> {
	let app = create_router(state);
	let addr = format!("{}:{}", host, port);

	tracing::info!("Starting server on {}", addr);

	let listener = tokio::net::TcpListener::bind(&addr)
		.await
		.map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

	axum::serve(listener, app)
		.await
		.map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::ModelHandle;
	use axum::body::Body;
	use axum::http::Request;
	use candle_core::Device;
	use tower::ServiceExt;

	async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
		let response = router
			.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
			.await
			.unwrap();
		let status = response.status();
		let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
		(status, serde_json::from_slice(&bytes).unwrap())
	}

	async fn state_with_detector() -> AppState {
		let registry = Arc::new(ModelRegistry::new());
		registry
			.get_or_try_publish(ModelKind::Detection, || async {
				Ok(ModelHandle::empty_detector(vec!["object".to_string()], Device::Cpu)
					.with_origin("stand-in")
					.normalize(&Default::default()))
			})
			.await
			.unwrap();
		AppState::new(registry, "Cpu".to_string())
	}

	#[tokio::test]
	async fn health_reports_each_kind() {
		let (status, body) = get_json(create_router(state_with_detector().await), "/api/health").await;

		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["status"], "degraded");
		assert_eq!(body["models"]["detection"], true);
		assert_eq!(body["models"]["classification"], false);
	}

	#[tokio::test]
	async fn models_lists_thresholds_for_detection() {
		let (status, body) = get_json(create_router(state_with_detector().await), "/api/models").await;

		assert_eq!(status, StatusCode::OK);
		let detection = &body["kinds"]["detection"];
		assert_eq!(detection["origin"], "stand-in");
		assert_eq!(detection["labels"][0], "object");
		assert!((detection["thresholds"]["confidence"].as_f64().unwrap() - 0.25).abs() < 1e-6);
		assert!(body["kinds"]["classification"]["thresholds"].is_null());
	}

	#[tokio::test]
	async fn unloaded_kind_is_unavailable() {
		let router = create_router(state_with_detector().await);

		let (status, _) = get_json(router.clone(), "/api/models/detection").await;
		assert_eq!(status, StatusCode::OK);

		let (status, body) = get_json(router, "/api/models/classification").await;
		assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
		assert!(body["error"].as_str().unwrap().contains("classification"));
	}
}
