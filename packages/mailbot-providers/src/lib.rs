pub mod chat;
pub mod embedding;

mod error;

pub use error::{Error, Result};

use std::{sync::Arc, time::Duration};

use reqwest::{
	Client, StatusCode,
	header::{AUTHORIZATION, HeaderMap, HeaderName},
};
use serde_json::{Map, Value};

use mailbot_config::{EmbeddingProviderConfig, LlmProviderConfig};
use mailbot_domain::{ChatModel, Embedder};

const MAX_ERROR_BODY_CHARS: usize = 512;

pub fn auth_headers(api_key: &str, default_headers: &Map<String, Value>) -> Result<HeaderMap> {
	let mut headers = HeaderMap::new();

	if !api_key.is_empty() {
		headers.insert(AUTHORIZATION, format!("Bearer {api_key}").parse()?);
	}

	with_default_headers(headers, default_headers)
}

/// Builds the embedding client named by `provider_id`.
pub fn embedder(cfg: &EmbeddingProviderConfig) -> Result<Arc<dyn Embedder>> {
	match cfg.provider_id.as_str() {
		"openai" => Ok(Arc::new(embedding::OpenAiEmbedder::new(cfg)?)),
		"ollama" => Ok(Arc::new(embedding::OllamaEmbedder::new(cfg)?)),
		other => Err(Error::InvalidConfig {
			message: format!("Unknown embedding provider {other:?}."),
		}),
	}
}

/// Builds the chat model named by `provider_id`.
pub fn chat_model(cfg: &LlmProviderConfig) -> Result<Arc<dyn ChatModel>> {
	match cfg.provider_id.as_str() {
		"openai" => Ok(Arc::new(chat::OpenAiChat::new(cfg)?)),
		"anthropic" => Ok(Arc::new(chat::AnthropicChat::new(cfg)?)),
		other =>
			Err(Error::InvalidConfig { message: format!("Unknown LLM provider {other:?}.") }),
	}
}

pub(crate) fn with_default_headers(
	mut headers: HeaderMap,
	default_headers: &Map<String, Value>,
) -> Result<HeaderMap> {
	for (key, value) in default_headers {
		let Some(raw) = value.as_str() else {
			return Err(Error::InvalidConfig {
				message: "Default header values must be strings.".to_string(),
			});
		};

		headers.insert(HeaderName::from_bytes(key.as_bytes())?, raw.parse()?);
	}

	Ok(headers)
}

pub(crate) fn http_client(timeout_ms: u64) -> Result<Client> {
	Ok(Client::builder().timeout(Duration::from_millis(timeout_ms)).build()?)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FailureKind {
	RateLimited,
	Timeout,
	Unavailable,
	Rejected,
	Malformed,
}

/// A provider call that did not yield a usable JSON body.
#[derive(Debug)]
pub(crate) struct CallFailure {
	pub(crate) kind: FailureKind,
	pub(crate) status: Option<StatusCode>,
	pub(crate) message: String,
	/// Error body, when the provider sent JSON.
	pub(crate) body: Option<Value>,
}
impl CallFailure {
	fn from_status(status: StatusCode, text: &str) -> Self {
		let body = serde_json::from_str::<Value>(text).ok();
		let message = body
			.as_ref()
			.and_then(|json| json.pointer("/error/message"))
			.and_then(Value::as_str)
			.map(str::to_string)
			.unwrap_or_else(|| excerpt(text));

		Self { kind: classify_status(status), status: Some(status), message, body }
	}

	fn from_transport(err: reqwest::Error) -> Self {
		Self { kind: classify_transport(&err), status: None, message: err.to_string(), body: None }
	}

	pub(crate) fn status_code(&self) -> u16 {
		self.status.map(|status| status.as_u16()).unwrap_or(0)
	}
}

pub(crate) async fn post_json(
	client: &Client,
	url: &str,
	headers: &HeaderMap,
	body: &Value,
) -> std::result::Result<Value, CallFailure> {
	let res = client
		.post(url)
		.headers(headers.clone())
		.json(body)
		.send()
		.await
		.map_err(CallFailure::from_transport)?;
	let status = res.status();

	if !status.is_success() {
		let text = res.text().await.unwrap_or_default();

		return Err(CallFailure::from_status(status, &text));
	}

	res.json::<Value>().await.map_err(CallFailure::from_transport)
}

pub(crate) fn classify_status(status: StatusCode) -> FailureKind {
	if status == StatusCode::TOO_MANY_REQUESTS {
		FailureKind::RateLimited
	} else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
		FailureKind::Timeout
	} else if status.is_server_error() {
		FailureKind::Unavailable
	} else {
		FailureKind::Rejected
	}
}

pub(crate) fn classify_transport(err: &reqwest::Error) -> FailureKind {
	if err.is_timeout() {
		FailureKind::Timeout
	} else if err.is_decode() {
		FailureKind::Malformed
	} else if err.is_builder() {
		FailureKind::Rejected
	} else {
		FailureKind::Unavailable
	}
}

fn excerpt(text: &str) -> String {
	let trimmed = text.trim();

	if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
		return trimmed.to_string();
	}

	let mut out: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();

	out.push_str("...");

	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn statuses_map_to_failure_kinds() {
		assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), FailureKind::RateLimited);
		assert_eq!(classify_status(StatusCode::GATEWAY_TIMEOUT), FailureKind::Timeout);
		assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), FailureKind::Unavailable);
		assert_eq!(classify_status(StatusCode::UNAUTHORIZED), FailureKind::Rejected);
		assert_eq!(classify_status(StatusCode::BAD_REQUEST), FailureKind::Rejected);
	}

	#[test]
	fn status_failures_prefer_the_provider_message() {
		let failure = CallFailure::from_status(
			StatusCode::BAD_REQUEST,
			r#"{"error":{"message":"Invalid model.","code":"model_not_found"}}"#,
		);

		assert_eq!(failure.message, "Invalid model.");
		assert_eq!(failure.status_code(), 400);
		assert!(failure.body.is_some());

		let failure = CallFailure::from_status(StatusCode::BAD_GATEWAY, "upstream down");

		assert_eq!(failure.message, "upstream down");
		assert_eq!(failure.kind, FailureKind::Unavailable);
	}

	#[test]
	fn long_error_bodies_are_truncated() {
		let body = "x".repeat(MAX_ERROR_BODY_CHARS + 10);
		let out = excerpt(&body);

		assert!(out.ends_with("..."));
		assert_eq!(out.chars().count(), MAX_ERROR_BODY_CHARS + 3);
	}
}
