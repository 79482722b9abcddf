use std::time::Duration;

use reqwest::{
	Client, Method, StatusCode,
	header::{HeaderMap, HeaderName, HeaderValue},
};
use serde_json::{Map, Value};
use uuid::Uuid;

use mailbot_config::Pinecone;
use mailbot_domain::{
	BoxFuture, DocumentChunk, RetrievalResult, RetrievedChunk, VectorStore, VectorStoreError,
	model::METADATA_CHUNK_INDEX,
};

const API_VERSION: &str = "2024-07";
const MAX_UPSERT_BATCH: usize = 100;
const READY_POLL_ATTEMPTS: u32 = 60;
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RESERVED_DOCUMENT_ID: &str = "document_id";
const RESERVED_TEXT: &str = "text";

/// Pinecone REST data plane for one index and namespace.
pub struct PineconeStore {
	client: Client,
	headers: HeaderMap,
	host: String,
	namespace: String,
	dimensions: u32,
}
impl PineconeStore {
	/// Resolves the index host, creating the index first when `create_if_missing` is set.
	///
	/// A configured `index_host` is used as-is and skips the control plane.
	pub async fn connect(
		cfg: &Pinecone,
		dimensions: u32,
		metric: &str,
	) -> Result<Self, VectorStoreError> {
		let client = Client::builder()
			.timeout(Duration::from_millis(cfg.timeout_ms))
			.build()
			.map_err(|err| VectorStoreError::Rejected { message: err.to_string() })?;
		let headers = api_headers(&cfg.api_key)?;
		let host = match cfg.index_host.as_deref().filter(|host| !host.trim().is_empty()) {
			Some(host) => host.to_string(),
			None => {
				let control = ControlPlane { client: &client, headers: &headers, cfg };

				control.resolve_host(dimensions, metric).await?
			},
		};

		tracing::info!(
			index = %cfg.index_name,
			namespace = %cfg.namespace,
			host = %host,
			"Pinecone index resolved."
		);

		Ok(Self {
			client,
			headers,
			host: normalize_host(&host),
			namespace: cfg.namespace.clone(),
			dimensions,
		})
	}

	async fn upsert_chunks(&self, chunks: &[DocumentChunk]) -> Result<(), VectorStoreError> {
		for chunk in chunks {
			VectorStoreError::check_dimensions(&chunk.embedding, self.dimensions)?;
		}

		for batch in chunks.chunks(MAX_UPSERT_BATCH) {
			let vectors: Vec<Value> = batch
				.iter()
				.map(|chunk| {
					serde_json::json!({
						"id": chunk.chunk_id.to_string(),
						"values": chunk.embedding,
						"metadata": pinecone_metadata(chunk),
					})
				})
				.collect();
			let body = serde_json::json!({ "vectors": vectors, "namespace": self.namespace });

			send_json(
				&self.client,
				&self.headers,
				Method::POST,
				&format!("{}/vectors/upsert", self.host),
				Some(&body),
			)
			.await?;
		}

		Ok(())
	}

	async fn prune_chunks(&self, document_id: &str, keep: u32) -> Result<(), VectorStoreError> {
		let body = serde_json::json!({
			"filter": prune_filter(document_id, keep),
			"namespace": self.namespace,
		});

		send_json(
			&self.client,
			&self.headers,
			Method::POST,
			&format!("{}/vectors/delete", self.host),
			Some(&body),
		)
		.await?;

		Ok(())
	}

	async fn query_chunks(
		&self,
		vector: &[f32],
		top_k: u32,
	) -> Result<RetrievalResult, VectorStoreError> {
		if top_k == 0 {
			return Err(VectorStoreError::InvalidTopK);
		}

		VectorStoreError::check_dimensions(vector, self.dimensions)?;

		let body = serde_json::json!({
			"vector": vector,
			"topK": top_k,
			"namespace": self.namespace,
			"includeMetadata": true,
			"includeValues": true,
		});
		let json = send_json(
			&self.client,
			&self.headers,
			Method::POST,
			&format!("{}/query", self.host),
			Some(&body),
		)
		.await?
		.unwrap_or(Value::Null);

		parse_matches(json)
	}
}
impl VectorStore for PineconeStore {
	fn dimensions(&self) -> u32 {
		self.dimensions
	}

	fn upsert<'a>(
		&'a self,
		chunks: &'a [DocumentChunk],
	) -> BoxFuture<'a, Result<(), VectorStoreError>> {
		Box::pin(self.upsert_chunks(chunks))
	}

	fn prune<'a>(
		&'a self,
		document_id: &'a str,
		keep: u32,
	) -> BoxFuture<'a, Result<(), VectorStoreError>> {
		Box::pin(self.prune_chunks(document_id, keep))
	}

	fn query<'a>(
		&'a self,
		vector: &'a [f32],
		top_k: u32,
	) -> BoxFuture<'a, Result<RetrievalResult, VectorStoreError>> {
		Box::pin(self.query_chunks(vector, top_k))
	}
}

struct IndexDescription {
	dimension: u64,
	host: String,
	ready: bool,
}

struct ControlPlane<'a> {
	client: &'a Client,
	headers: &'a HeaderMap,
	cfg: &'a Pinecone,
}
impl ControlPlane<'_> {
	async fn resolve_host(
		&self,
		dimensions: u32,
		metric: &str,
	) -> Result<String, VectorStoreError> {
		let description = match self.describe().await? {
			Some(description) => description,
			None if self.cfg.create_if_missing => {
				self.create(dimensions, metric).await?;

				self.wait_until_ready().await?
			},
			None => {
				return Err(VectorStoreError::IndexNotFound { name: self.cfg.index_name.clone() });
			},
		};

		if description.dimension != u64::from(dimensions) {
			return Err(VectorStoreError::DimensionMismatch {
				expected: dimensions,
				actual: description.dimension as usize,
			});
		}
		if description.ready && !description.host.is_empty() {
			return Ok(description.host);
		}

		Ok(self.wait_until_ready().await?.host)
	}

	async fn describe(&self) -> Result<Option<IndexDescription>, VectorStoreError> {
		let url = format!("{}/indexes/{}", self.controller(), self.cfg.index_name);
		let res = self
			.client
			.get(&url)
			.headers(self.headers.clone())
			.send()
			.await
			.map_err(transport_error)?;
		let status = res.status();

		if status == StatusCode::NOT_FOUND {
			return Ok(None);
		}
		if !status.is_success() {
			let text = res.text().await.unwrap_or_default();

			return Err(status_error(status, &text));
		}

		let json = res.json::<Value>().await.map_err(|err| malformed(&err.to_string()))?;

		parse_description(&json).map(Some)
	}

	async fn create(&self, dimensions: u32, metric: &str) -> Result<(), VectorStoreError> {
		let region = if self.cfg.environment.trim().is_empty() {
			self.cfg.region.as_str()
		} else {
			self.cfg.environment.as_str()
		};
		let body = serde_json::json!({
			"name": self.cfg.index_name,
			"dimension": dimensions,
			"metric": metric,
			"spec": { "serverless": { "cloud": self.cfg.cloud, "region": region } },
		});
		let url = format!("{}/indexes", self.controller());

		tracing::info!(
			index = %self.cfg.index_name,
			dimensions,
			metric,
			region,
			"Creating Pinecone index."
		);

		match send_json(self.client, self.headers, Method::POST, &url, Some(&body)).await {
			Ok(_) => Ok(()),
			// Another process created it first.
			Err(VectorStoreError::Rejected { message }) if message.starts_with("409") => Ok(()),
			Err(err) => Err(err),
		}
	}

	async fn wait_until_ready(&self) -> Result<IndexDescription, VectorStoreError> {
		for _ in 0..READY_POLL_ATTEMPTS {
			if let Some(description) = self.describe().await?
				&& description.ready
				&& !description.host.is_empty()
			{
				return Ok(description);
			}

			tokio::time::sleep(READY_POLL_INTERVAL).await;
		}

		Err(VectorStoreError::Unavailable {
			message: format!("Pinecone index {} did not become ready.", self.cfg.index_name),
		})
	}

	fn controller(&self) -> &str {
		self.cfg.controller_url.trim_end_matches('/')
	}
}

fn api_headers(api_key: &str) -> Result<HeaderMap, VectorStoreError> {
	let mut headers = HeaderMap::new();
	let key = HeaderValue::from_str(api_key).map_err(|_| VectorStoreError::Rejected {
		message: "Pinecone API key is not a valid header value.".to_string(),
	})?;

	headers.insert(HeaderName::from_static("api-key"), key);
	headers.insert(
		HeaderName::from_static("x-pinecone-api-version"),
		HeaderValue::from_static(API_VERSION),
	);

	Ok(headers)
}

async fn send_json(
	client: &Client,
	headers: &HeaderMap,
	method: Method,
	url: &str,
	body: Option<&Value>,
) -> Result<Option<Value>, VectorStoreError> {
	let mut req = client.request(method, url).headers(headers.clone());

	if let Some(body) = body {
		req = req.json(body);
	}

	let res = req.send().await.map_err(transport_error)?;
	let status = res.status();
	let text = res.text().await.map_err(transport_error)?;

	if !status.is_success() {
		return Err(status_error(status, &text));
	}
	if text.trim().is_empty() {
		return Ok(None);
	}

	serde_json::from_str(&text).map(Some).map_err(|err| malformed(&err.to_string()))
}

fn status_error(status: StatusCode, text: &str) -> VectorStoreError {
	let message = format!("{} {}", status.as_u16(), text.trim());

	if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
		VectorStoreError::Unavailable { message }
	} else {
		VectorStoreError::Rejected { message }
	}
}

fn transport_error(err: reqwest::Error) -> VectorStoreError {
	VectorStoreError::Unavailable { message: err.to_string() }
}

fn malformed(message: &str) -> VectorStoreError {
	VectorStoreError::MalformedResponse { message: message.to_string() }
}

fn normalize_host(host: &str) -> String {
	let host = host.trim().trim_end_matches('/');

	if host.starts_with("http://") || host.starts_with("https://") {
		host.to_string()
	} else {
		format!("https://{host}")
	}
}

fn parse_description(json: &Value) -> Result<IndexDescription, VectorStoreError> {
	let dimension = json
		.get("dimension")
		.and_then(Value::as_u64)
		.ok_or_else(|| malformed("Index description is missing dimension."))?;
	let host = json.get("host").and_then(Value::as_str).unwrap_or_default().to_string();
	let ready = json.pointer("/status/ready").and_then(Value::as_bool).unwrap_or(false);

	Ok(IndexDescription { dimension, host, ready })
}

/// Pinecone metadata is flat: strings, numbers, booleans or lists of strings.
fn pinecone_metadata(chunk: &DocumentChunk) -> Map<String, Value> {
	let mut out = Map::new();

	for (key, value) in &chunk.metadata {
		if key == RESERVED_DOCUMENT_ID || key == RESERVED_TEXT {
			continue;
		}

		match value {
			Value::Null => {},
			Value::String(_) | Value::Number(_) | Value::Bool(_) => {
				out.insert(key.clone(), value.clone());
			},
			Value::Array(items) if items.iter().all(Value::is_string) => {
				out.insert(key.clone(), value.clone());
			},
			other => {
				out.insert(key.clone(), Value::String(other.to_string()));
			},
		}
	}

	out.insert(RESERVED_DOCUMENT_ID.to_string(), Value::String(chunk.document_id.clone()));
	out.insert(RESERVED_TEXT.to_string(), Value::String(chunk.text.clone()));

	out
}

fn prune_filter(document_id: &str, keep: u32) -> Value {
	serde_json::json!({
		RESERVED_DOCUMENT_ID: { "$eq": document_id },
		METADATA_CHUNK_INDEX: { "$gte": keep },
	})
}

fn parse_matches(json: Value) -> Result<RetrievalResult, VectorStoreError> {
	let Value::Object(mut root) = json else {
		return Err(malformed("Query response must be an object."));
	};
	let Some(Value::Array(items)) = root.remove("matches") else {
		return Err(malformed("Query response is missing matches."));
	};
	let mut matches = Vec::with_capacity(items.len());

	for item in items {
		matches.push(parse_match(item)?);
	}

	Ok(RetrievalResult::new(matches))
}

fn parse_match(item: Value) -> Result<RetrievedChunk, VectorStoreError> {
	let Value::Object(mut item) = item else {
		return Err(malformed("Query match must be an object."));
	};
	let chunk_id = item
		.get("id")
		.and_then(Value::as_str)
		.and_then(|id| Uuid::parse_str(id).ok())
		.ok_or_else(|| malformed("Query match id is not a chunk UUID."))?;
	let score = item
		.get("score")
		.and_then(Value::as_f64)
		.ok_or_else(|| malformed("Query match is missing score."))? as f32;
	let embedding = match item.remove("values") {
		Some(Value::Array(values)) => values
			.iter()
			.map(|value| value.as_f64().map(|number| number as f32))
			.collect::<Option<Vec<f32>>>()
			.ok_or_else(|| malformed("Query match values must be numeric."))?,
		_ => Vec::new(),
	};
	let mut metadata = match item.remove("metadata") {
		Some(Value::Object(metadata)) => metadata,
		_ => Map::new(),
	};
	let document_id = take_string(&mut metadata, RESERVED_DOCUMENT_ID);
	let text = take_string(&mut metadata, RESERVED_TEXT);

	Ok(RetrievedChunk {
		chunk: DocumentChunk { chunk_id, document_id, text, embedding, metadata },
		score,
	})
}

fn take_string(metadata: &mut Map<String, Value>, key: &str) -> String {
	match metadata.remove(key) {
		Some(Value::String(value)) => value,
		_ => String::new(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hosts_default_to_https() {
		assert_eq!(normalize_host("idx-abc.svc.pinecone.io"), "https://idx-abc.svc.pinecone.io");
		assert_eq!(normalize_host("http://127.0.0.1:9000/"), "http://127.0.0.1:9000");
	}

	#[test]
	fn metadata_is_flattened() {
		let mut metadata = Map::new();

		metadata.insert("source".to_string(), Value::String("faq.md".to_string()));
		metadata.insert("chunk_index".to_string(), serde_json::json!(2));
		metadata.insert("tags".to_string(), serde_json::json!(["billing", "hours"]));
		metadata.insert("headers".to_string(), serde_json::json!({ "lang": "en" }));
		metadata.insert("empty".to_string(), Value::Null);
		metadata.insert("text".to_string(), Value::String("spoofed".to_string()));

		let chunk = DocumentChunk {
			chunk_id: mailbot_domain::chunk_id_for("faq", 2),
			document_id: "faq".to_string(),
			text: "We are open 9am-5pm ET.".to_string(),
			embedding: vec![0.0; 2],
			metadata,
		};
		let flat = pinecone_metadata(&chunk);

		assert_eq!(flat["source"], "faq.md");
		assert_eq!(flat["chunk_index"], 2);
		assert_eq!(flat["tags"], serde_json::json!(["billing", "hours"]));
		assert_eq!(flat["headers"], r#"{"lang":"en"}"#);
		assert_eq!(flat["text"], "We are open 9am-5pm ET.");
		assert_eq!(flat["document_id"], "faq");
		assert!(!flat.contains_key("empty"));
	}

	#[test]
	fn matches_keep_backend_order() {
		let first = mailbot_domain::chunk_id_for("a", 0);
		let second = mailbot_domain::chunk_id_for("b", 0);
		let json = serde_json::json!({
			"matches": [
				{
					"id": first.to_string(),
					"score": 0.91,
					"values": [0.1, 0.2],
					"metadata": { "document_id": "a", "text": "alpha", "chunk_index": 0.0 }
				},
				{ "id": second.to_string(), "score": 0.52, "metadata": { "text": "beta" } }
			]
		});
		let result = parse_matches(json).expect("parse failed");

		assert_eq!(result.len(), 2);
		assert_eq!(result.matches[0].chunk.chunk_id, first);
		assert_eq!(result.matches[0].chunk.text, "alpha");
		assert_eq!(result.matches[0].chunk.embedding, vec![0.1, 0.2]);
		assert!(!result.matches[0].chunk.metadata.contains_key("text"));
		assert_eq!(result.matches[1].chunk.document_id, "");
		assert!(result.is_ranked());
	}

	#[test]
	fn non_uuid_ids_are_malformed() {
		let json = serde_json::json!({ "matches": [{ "id": "doc-1", "score": 0.5 }] });

		assert!(matches!(parse_matches(json), Err(VectorStoreError::MalformedResponse { .. })));
	}

	#[test]
	fn prune_filter_targets_trailing_chunks() {
		assert_eq!(
			prune_filter("faq", 3),
			serde_json::json!({ "document_id": { "$eq": "faq" }, "chunk_index": { "$gte": 3 } })
		);
	}

	#[test]
	fn throttling_is_unavailable() {
		assert!(matches!(
			status_error(StatusCode::TOO_MANY_REQUESTS, "slow down"),
			VectorStoreError::Unavailable { .. }
		));
		assert!(matches!(
			status_error(StatusCode::BAD_REQUEST, "bad vector"),
			VectorStoreError::Rejected { .. }
		));
	}
}
