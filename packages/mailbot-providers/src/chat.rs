use reqwest::{
	Client, StatusCode,
	header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue},
};
use serde_json::Value;

use crate::{CallFailure, FailureKind, Result};
use mailbot_config::LlmProviderConfig;
use mailbot_domain::{BoxFuture, ChatModel, ChatRequest, GenerationError};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const CONTENT_POLICY_CODES: [&str; 2] = ["content_policy_violation", "content_filter"];

/// OpenAI-compatible chat completions.
pub struct OpenAiChat {
	client: Client,
	url: String,
	headers: HeaderMap,
	model: String,
}
impl OpenAiChat {
	pub fn new(cfg: &LlmProviderConfig) -> Result<Self> {
		Ok(Self {
			client: crate::http_client(cfg.timeout_ms)?,
			url: format!("{}{}", cfg.api_base, cfg.path),
			headers: crate::auth_headers(&cfg.api_key, &cfg.default_headers)?,
			model: cfg.model.clone(),
		})
	}

	async fn complete_request(&self, request: &ChatRequest) -> Result<String, GenerationError> {
		let body = serde_json::json!({
			"model": self.model,
			"temperature": request.temperature,
			"max_tokens": request.max_output_tokens,
			"messages": [
				{ "role": "system", "content": request.system },
				{ "role": "user", "content": request.prompt },
			],
		});
		let json = crate::post_json(&self.client, &self.url, &self.headers, &body)
			.await
			.map_err(openai_error)?;

		parse_openai_completion(&json)
	}
}
impl ChatModel for OpenAiChat {
	fn complete<'a>(
		&'a self,
		request: &'a ChatRequest,
	) -> BoxFuture<'a, Result<String, GenerationError>> {
		Box::pin(self.complete_request(request))
	}
}

/// Anthropic messages API.
pub struct AnthropicChat {
	client: Client,
	url: String,
	headers: HeaderMap,
	model: String,
}
impl AnthropicChat {
	pub fn new(cfg: &LlmProviderConfig) -> Result<Self> {
		let mut headers = HeaderMap::new();

		headers.insert(HeaderName::from_static("x-api-key"), cfg.api_key.parse()?);
		headers.insert(
			HeaderName::from_static("anthropic-version"),
			HeaderValue::from_static(ANTHROPIC_VERSION),
		);
		headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

		Ok(Self {
			client: crate::http_client(cfg.timeout_ms)?,
			url: format!("{}{}", cfg.api_base, cfg.path),
			headers: crate::with_default_headers(headers, &cfg.default_headers)?,
			model: cfg.model.clone(),
		})
	}

	async fn complete_request(&self, request: &ChatRequest) -> Result<String, GenerationError> {
		let body = serde_json::json!({
			"model": self.model,
			"max_tokens": request.max_output_tokens,
			"temperature": request.temperature,
			"system": request.system,
			"messages": [{ "role": "user", "content": request.prompt }],
		});
		let json = crate::post_json(&self.client, &self.url, &self.headers, &body)
			.await
			.map_err(|failure| generation_error(failure, false))?;

		parse_anthropic_completion(&json)
	}
}
impl ChatModel for AnthropicChat {
	fn complete<'a>(
		&'a self,
		request: &'a ChatRequest,
	) -> BoxFuture<'a, Result<String, GenerationError>> {
		Box::pin(self.complete_request(request))
	}
}

fn openai_error(failure: CallFailure) -> GenerationError {
	let policy = failure.status == Some(StatusCode::BAD_REQUEST)
		&& failure
			.body
			.as_ref()
			.and_then(|body| body.pointer("/error/code"))
			.and_then(Value::as_str)
			.map(|code| CONTENT_POLICY_CODES.contains(&code))
			.unwrap_or(false);

	generation_error(failure, policy)
}

fn generation_error(failure: CallFailure, content_policy: bool) -> GenerationError {
	let message = failure.message;

	if content_policy {
		return GenerationError::ContentPolicy { message };
	}

	match failure.kind {
		FailureKind::RateLimited => GenerationError::RateLimited { message },
		FailureKind::Timeout => GenerationError::Timeout { message },
		FailureKind::Unavailable => GenerationError::Unavailable { message },
		FailureKind::Rejected => GenerationError::InvalidRequest { message },
		FailureKind::Malformed => GenerationError::MalformedResponse { message },
	}
}

fn parse_openai_completion(json: &Value) -> Result<String, GenerationError> {
	let choice = json
		.get("choices")
		.and_then(|v| v.as_array())
		.and_then(|arr| arr.first())
		.ok_or_else(|| malformed("Completion response is missing choices."))?;

	if choice.get("finish_reason").and_then(Value::as_str) == Some("content_filter") {
		return Err(GenerationError::ContentPolicy {
			message: "Completion was withheld by the content filter.".to_string(),
		});
	}

	let message = choice.get("message").ok_or_else(|| malformed("Choice is missing message."))?;

	if let Some(refusal) = message.get("refusal").and_then(Value::as_str) {
		return Err(GenerationError::ContentPolicy { message: refusal.to_string() });
	}

	message
		.get("content")
		.and_then(Value::as_str)
		.map(str::to_string)
		.ok_or_else(|| malformed("Choice message has no text content."))
}

fn parse_anthropic_completion(json: &Value) -> Result<String, GenerationError> {
	if json.get("stop_reason").and_then(Value::as_str) == Some("refusal") {
		return Err(GenerationError::ContentPolicy {
			message: "Model refused to answer.".to_string(),
		});
	}

	let blocks = json
		.get("content")
		.and_then(|v| v.as_array())
		.ok_or_else(|| malformed("Messages response is missing content."))?;
	let text: String = blocks
		.iter()
		.filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
		.filter_map(|block| block.get("text").and_then(Value::as_str))
		.collect();

	Ok(text)
}

fn malformed(message: &str) -> GenerationError {
	GenerationError::MalformedResponse { message: message.to_string() }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_choice_content() {
		let json = serde_json::json!({
			"choices": [
				{ "finish_reason": "stop", "message": { "content": "We are open 9am-5pm ET." } }
			]
		});

		let text = parse_openai_completion(&json).expect("parse failed");

		assert_eq!(text, "We are open 9am-5pm ET.");
	}

	#[test]
	fn filtered_choice_is_a_policy_rejection() {
		let json = serde_json::json!({
			"choices": [{ "finish_reason": "content_filter", "message": { "content": null } }]
		});

		assert!(matches!(
			parse_openai_completion(&json),
			Err(GenerationError::ContentPolicy { .. })
		));
	}

	#[test]
	fn policy_error_code_is_not_an_invalid_request() {
		let failure = CallFailure {
			kind: FailureKind::Rejected,
			status: Some(StatusCode::BAD_REQUEST),
			message: "Flagged.".to_string(),
			body: Some(serde_json::json!({
				"error": { "message": "Flagged.", "code": "content_policy_violation" }
			})),
		};

		assert_eq!(openai_error(failure), GenerationError::ContentPolicy {
			message: "Flagged.".to_string()
		});
	}

	#[test]
	fn joins_anthropic_text_blocks() {
		let json = serde_json::json!({
			"stop_reason": "end_turn",
			"content": [
				{ "type": "text", "text": "Hello, " },
				{ "type": "tool_use", "id": "x" },
				{ "type": "text", "text": "world." }
			]
		});

		assert_eq!(parse_anthropic_completion(&json).expect("parse failed"), "Hello, world.");
	}
}
