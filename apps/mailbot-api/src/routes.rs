use axum::{
	Json, Router,
	extract::{Path, Query, State},
	http::StatusCode,
	response::{IntoResponse, Response},
	routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::state::AppState;
use mailbot_domain::{ProcessingState, ProcessingStatus, SourceDocument};
use mailbot_service::{Error as ServiceError, IngestReport};

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/", get(root))
		.route("/health", get(health))
		.route("/process-emails", post(process_emails))
		.route("/v1/messages", get(list_messages))
		.route("/v1/messages/{id}", get(get_message))
		.route("/v1/messages/{id}/reset", post(reset_message))
		.route("/v1/documents", post(ingest_documents))
		.with_state(state)
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
	pub status: &'static str,
	pub message: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
	pub status: Option<String>,
	pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
	pub messages: Vec<ProcessingState>,
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
	pub documents: Vec<SourceDocument>,
}

async fn root() -> Json<StatusBody> {
	Json(StatusBody { status: "success", message: "Email Bot API is running" })
}

async fn health() -> Json<StatusBody> {
	Json(StatusBody { status: "success", message: "Service is healthy" })
}

async fn process_emails(State(state): State<AppState>) -> (StatusCode, Json<StatusBody>) {
	let orchestrator = state.bot.orchestrator.clone();

	tokio::spawn(async move {
		if let Err(err) = orchestrator.poll_once().await {
			tracing::error!(error = %err, "Background email processing failed.");
		}
	});

	(
		StatusCode::ACCEPTED,
		Json(StatusBody {
			status: "success",
			message: "Email processing started in background",
		}),
	)
}

async fn list_messages(
	State(state): State<AppState>,
	Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
	let status = match query.status.as_deref() {
		None | Some("") => None,
		Some(raw) => Some(raw.parse::<ProcessingStatus>().map_err(|err| {
			json_error(StatusCode::BAD_REQUEST, "invalid_request", err.to_string())
		})?),
	};
	let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
	let messages = state.bot.orchestrator.list(status, limit).await?;

	Ok(Json(ListResponse { messages }))
}

async fn get_message(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> Result<Json<ProcessingState>, ApiError> {
	Ok(Json(state.bot.orchestrator.status(&id).await?))
}

async fn reset_message(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> Result<Json<ProcessingState>, ApiError> {
	Ok(Json(state.bot.orchestrator.reset(&id).await?))
}

async fn ingest_documents(
	State(state): State<AppState>,
	Json(payload): Json<IngestRequest>,
) -> Result<Json<IngestReport>, ApiError> {
	if payload.documents.iter().any(|document| document.id.trim().is_empty()) {
		return Err(json_error(
			StatusCode::BAD_REQUEST,
			"invalid_request",
			"Every document needs a non-empty id.",
		));
	}

	Ok(Json(state.bot.ingestor.ingest(&payload.documents).await))
}

#[derive(Debug, Serialize)]
struct ErrorBody {
	error_code: String,
	message: String,
}

#[derive(Debug)]
pub struct ApiError {
	status: StatusCode,
	error_code: String,
	message: String,
}
impl ApiError {
	fn new(status: StatusCode, error_code: impl Into<String>, message: impl Into<String>) -> Self {
		Self { status, error_code: error_code.into(), message: message.into() }
	}
}
impl From<ServiceError> for ApiError {
	fn from(err: ServiceError) -> Self {
		match err {
			ServiceError::InvalidRequest { message } =>
				json_error(StatusCode::BAD_REQUEST, "invalid_request", message),
			ServiceError::NotFound { message } =>
				json_error(StatusCode::NOT_FOUND, "not_found", message),
			ServiceError::Conflict { message } =>
				json_error(StatusCode::CONFLICT, "conflict", message),
			ServiceError::Provider { message } =>
				json_error(StatusCode::BAD_GATEWAY, "provider_error", message),
			ServiceError::Storage { message } =>
				json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", message),
			ServiceError::Mail { message } =>
				json_error(StatusCode::BAD_GATEWAY, "mail_error", message),
		}
	}
}
impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let body = ErrorBody { error_code: self.error_code, message: self.message };

		(self.status, Json(body)).into_response()
	}
}

pub fn json_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
	ApiError::new(status, code, message)
}
