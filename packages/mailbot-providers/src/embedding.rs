use reqwest::{Client, header::HeaderMap};
use serde_json::Value;

use crate::{CallFailure, FailureKind, Result};
use mailbot_config::EmbeddingProviderConfig;
use mailbot_domain::{BoxFuture, Embedder, EmbeddingError, EmbeddingVector};

/// OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
	client: Client,
	url: String,
	headers: HeaderMap,
	model: String,
	dimensions: u32,
}
impl OpenAiEmbedder {
	pub fn new(cfg: &EmbeddingProviderConfig) -> Result<Self> {
		Ok(Self {
			client: crate::http_client(cfg.timeout_ms)?,
			url: format!("{}{}", cfg.api_base, cfg.path),
			headers: crate::auth_headers(&cfg.api_key, &cfg.default_headers)?,
			model: cfg.model.clone(),
			dimensions: cfg.dimensions,
		})
	}

	async fn embed_text(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
		if text.trim().is_empty() {
			return Err(EmbeddingError::EmptyInput);
		}

		let body = serde_json::json!({
			"model": self.model,
			"input": [text],
			"dimensions": self.dimensions,
		});
		let json = crate::post_json(&self.client, &self.url, &self.headers, &body)
			.await
			.map_err(embedding_error)?;
		let vector = parse_embedding_response(json)?.into_iter().next().ok_or_else(|| {
			EmbeddingError::MalformedResponse {
				message: "Embedding response holds no vectors.".to_string(),
			}
		})?;

		check_dimensions(vector, self.dimensions)
	}
}
impl Embedder for OpenAiEmbedder {
	fn dimensions(&self) -> u32 {
		self.dimensions
	}

	fn embed<'a>(
		&'a self,
		text: &'a str,
	) -> BoxFuture<'a, Result<EmbeddingVector, EmbeddingError>> {
		Box::pin(self.embed_text(text))
	}
}

/// Ollama `/api/embed` endpoint.
pub struct OllamaEmbedder {
	client: Client,
	url: String,
	headers: HeaderMap,
	model: String,
	dimensions: u32,
}
impl OllamaEmbedder {
	pub fn new(cfg: &EmbeddingProviderConfig) -> Result<Self> {
		Ok(Self {
			client: crate::http_client(cfg.timeout_ms)?,
			url: format!("{}{}", cfg.api_base, cfg.path),
			headers: crate::auth_headers(&cfg.api_key, &cfg.default_headers)?,
			model: cfg.model.clone(),
			dimensions: cfg.dimensions,
		})
	}

	async fn embed_text(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
		if text.trim().is_empty() {
			return Err(EmbeddingError::EmptyInput);
		}

		let body = serde_json::json!({ "model": self.model, "input": [text] });
		let json = crate::post_json(&self.client, &self.url, &self.headers, &body)
			.await
			.map_err(embedding_error)?;

		check_dimensions(parse_ollama_response(&json)?, self.dimensions)
	}
}
impl Embedder for OllamaEmbedder {
	fn dimensions(&self) -> u32 {
		self.dimensions
	}

	fn embed<'a>(
		&'a self,
		text: &'a str,
	) -> BoxFuture<'a, Result<EmbeddingVector, EmbeddingError>> {
		Box::pin(self.embed_text(text))
	}
}

fn embedding_error(failure: CallFailure) -> EmbeddingError {
	let message = failure.message.clone();

	match failure.kind {
		FailureKind::RateLimited => EmbeddingError::RateLimited { message },
		FailureKind::Timeout => EmbeddingError::Timeout { message },
		FailureKind::Unavailable => EmbeddingError::Unavailable { message },
		FailureKind::Rejected =>
			EmbeddingError::Rejected { status: failure.status_code(), message },
		FailureKind::Malformed => EmbeddingError::MalformedResponse { message },
	}
}

fn check_dimensions(
	vector: EmbeddingVector,
	expected: u32,
) -> Result<EmbeddingVector, EmbeddingError> {
	if vector.len() != expected as usize {
		return Err(EmbeddingError::DimensionMismatch { expected, actual: vector.len() });
	}

	Ok(vector)
}

fn parse_embedding_response(json: Value) -> Result<Vec<EmbeddingVector>, EmbeddingError> {
	let data = json
		.get("data")
		.and_then(|v| v.as_array())
		.ok_or_else(|| malformed("Embedding response is missing data array."))?;
	let mut indexed: Vec<(usize, EmbeddingVector)> = Vec::with_capacity(data.len());

	for (fallback_index, item) in data.iter().enumerate() {
		let index = item
			.get("index")
			.and_then(|v| v.as_u64())
			.map(|v| v as usize)
			.unwrap_or(fallback_index);
		let embedding = item
			.get("embedding")
			.ok_or_else(|| malformed("Embedding item missing embedding array."))?;

		indexed.push((index, parse_vector(embedding)?));
	}

	indexed.sort_by_key(|(index, _)| *index);

	Ok(indexed.into_iter().map(|(_, vec)| vec).collect())
}

fn parse_ollama_response(json: &Value) -> Result<EmbeddingVector, EmbeddingError> {
	let first = json
		.get("embeddings")
		.and_then(|v| v.as_array())
		.and_then(|arr| arr.first())
		.ok_or_else(|| malformed("Embedding response is missing embeddings array."))?;

	parse_vector(first)
}

fn parse_vector(value: &Value) -> Result<EmbeddingVector, EmbeddingError> {
	let values = value.as_array().ok_or_else(|| malformed("Embedding must be an array."))?;
	let mut vec = Vec::with_capacity(values.len());

	for value in values {
		let number = value.as_f64().ok_or_else(|| malformed("Embedding value must be numeric."))?;

		vec.push(number as f32);
	}

	Ok(vec)
}

fn malformed(message: &str) -> EmbeddingError {
	EmbeddingError::MalformedResponse { message: message.to_string() }
}
