use std::sync::{
	Arc, Mutex,
	atomic::{AtomicBool, Ordering},
};

use axum::{
	Json, Router,
	extract::State,
	http::{HeaderMap, StatusCode},
	routing::{get, post},
};
use serde_json::{Map, Value};
use tokio::net::TcpListener;

use mailbot_config::Pinecone;
use mailbot_domain::{DocumentChunk, VectorStore, VectorStoreError};
use mailbot_storage::pinecone::PineconeStore;

#[derive(Clone, Default)]
struct MockIndex {
	created: Arc<AtomicBool>,
	base: Arc<Mutex<String>>,
	upserts: Arc<Mutex<Vec<Value>>>,
	deletes: Arc<Mutex<Vec<Value>>>,
}

async fn serve(router: Router) -> String {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind mock server.");
	let addr = listener.local_addr().expect("Failed to read mock server address.");

	tokio::spawn(async move {
		axum::serve(listener, router).await.expect("Mock server failed.");
	});

	format!("http://{addr}")
}

fn pinecone_cfg(controller_url: String, index_host: Option<String>) -> Pinecone {
	Pinecone {
		api_key: "pc-key".to_string(),
		environment: String::new(),
		index_name: "email-embeddings".to_string(),
		index_host,
		controller_url,
		namespace: "support".to_string(),
		create_if_missing: true,
		cloud: "aws".to_string(),
		region: "us-east-1".to_string(),
		timeout_ms: 5_000,
	}
}

fn chunk(index: u32) -> DocumentChunk {
	DocumentChunk {
		chunk_id: mailbot_domain::chunk_id_for("faq", index),
		document_id: "faq".to_string(),
		text: format!("Answer {index}."),
		embedding: vec![0.5, 0.5],
		metadata: Map::new(),
	}
}

async fn upsert(
	State(mock): State<MockIndex>,
	headers: HeaderMap,
	Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
	if headers.get("api-key").and_then(|v| v.to_str().ok()) != Some("pc-key") {
		return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({})));
	}

	let count = body["vectors"].as_array().map(Vec::len).unwrap_or(0);

	mock.upserts.lock().expect("Lock poisoned.").push(body);

	(StatusCode::OK, Json(serde_json::json!({ "upsertedCount": count })))
}

async fn delete(State(mock): State<MockIndex>, Json(body): Json<Value>) -> Json<Value> {
	mock.deletes.lock().expect("Lock poisoned.").push(body);

	Json(serde_json::json!({}))
}

async fn query(Json(body): Json<Value>) -> Json<Value> {
	assert_eq!(body["namespace"], "support");
	assert_eq!(body["includeMetadata"], true);

	let low = mailbot_domain::chunk_id_for("faq", 1);
	let high = mailbot_domain::chunk_id_for("faq", 0);

	Json(serde_json::json!({
		"matches": [
			{
				"id": high.to_string(),
				"score": 0.9,
				"values": [0.5, 0.5],
				"metadata": { "document_id": "faq", "text": "Answer 0." }
			},
			{
				"id": low.to_string(),
				"score": 0.4,
				"values": [0.5, 0.5],
				"metadata": { "document_id": "faq", "text": "Answer 1." }
			}
		]
	}))
}

async fn describe(State(mock): State<MockIndex>) -> (StatusCode, Json<Value>) {
	if !mock.created.load(Ordering::SeqCst) {
		return (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "not found" })));
	}

	let host = mock.base.lock().expect("Lock poisoned.").clone();

	(
		StatusCode::OK,
		Json(serde_json::json!({
			"name": "email-embeddings",
			"dimension": 2,
			"host": host,
			"status": { "ready": true, "state": "Ready" }
		})),
	)
}

async fn create(State(mock): State<MockIndex>, Json(body): Json<Value>) -> StatusCode {
	assert_eq!(body["dimension"], 2);
	assert_eq!(body["spec"]["serverless"]["region"], "us-east-1");

	mock.created.store(true, Ordering::SeqCst);

	StatusCode::CREATED
}

fn router(mock: MockIndex) -> Router {
	Router::new()
		.route("/indexes/email-embeddings", get(describe))
		.route("/indexes", post(create))
		.route("/vectors/upsert", post(upsert))
		.route("/vectors/delete", post(delete))
		.route("/query", post(query))
		.with_state(mock)
}

#[tokio::test]
async fn missing_index_is_created_then_used() {
	let mock = MockIndex::default();
	let base = serve(router(mock.clone())).await;

	*mock.base.lock().expect("Lock poisoned.") = base.clone();

	let store = PineconeStore::connect(&pinecone_cfg(base, None), 2, "cosine")
		.await
		.expect("Connect failed.");

	assert!(mock.created.load(Ordering::SeqCst));

	store.upsert(&[chunk(0)]).await.expect("Upsert failed.");

	assert_eq!(mock.upserts.lock().expect("Lock poisoned.").len(), 1);
}

#[tokio::test]
async fn missing_index_without_creation_is_reported() {
	let mock = MockIndex::default();
	let base = serve(router(mock)).await;
	let mut cfg = pinecone_cfg(base, None);

	cfg.create_if_missing = false;

	let err = PineconeStore::connect(&cfg, 2, "cosine").await.err().expect("Expected an error.");

	assert_eq!(err, VectorStoreError::IndexNotFound { name: "email-embeddings".to_string() });
}

#[tokio::test]
async fn large_upserts_are_batched() {
	let mock = MockIndex::default();
	let base = serve(router(mock.clone())).await;
	let store = PineconeStore::connect(&pinecone_cfg(String::new(), Some(base)), 2, "cosine")
		.await
		.expect("Connect failed.");
	let chunks: Vec<DocumentChunk> = (0..150).map(chunk).collect();

	store.upsert(&chunks).await.expect("Upsert failed.");

	let upserts = mock.upserts.lock().expect("Lock poisoned.");
	let sizes: Vec<usize> =
		upserts.iter().map(|body| body["vectors"].as_array().map(Vec::len).unwrap_or(0)).collect();

	assert_eq!(sizes, vec![100, 50]);
	assert_eq!(upserts[0]["namespace"], "support");
	assert_eq!(upserts[0]["vectors"][0]["metadata"]["document_id"], "faq");
}

#[tokio::test]
async fn query_returns_ranked_chunks() {
	let base = serve(router(MockIndex::default())).await;
	let store = PineconeStore::connect(&pinecone_cfg(String::new(), Some(base)), 2, "cosine")
		.await
		.expect("Connect failed.");
	let result = store.query(&[0.5, 0.5], 2).await.expect("Query failed.");
	let texts: Vec<&str> = result.iter().map(|m| m.chunk.text.as_str()).collect();

	assert_eq!(texts, vec!["Answer 0.", "Answer 1."]);
	assert!(result.is_ranked());
}

#[tokio::test]
async fn dimension_mismatch_never_reaches_the_index() {
	let cfg = pinecone_cfg(String::new(), Some("http://127.0.0.1:1".to_string()));
	let store = PineconeStore::connect(&cfg, 3, "cosine").await.expect("Connect failed.");

	assert_eq!(
		store.query(&[0.5, 0.5], 2).await,
		Err(VectorStoreError::DimensionMismatch { expected: 3, actual: 2 })
	);
}

#[tokio::test]
async fn prune_deletes_by_document_and_position() {
	let mock = MockIndex::default();
	let base = serve(router(mock.clone())).await;
	let store = PineconeStore::connect(&pinecone_cfg(String::new(), Some(base)), 2, "cosine")
		.await
		.expect("Connect failed.");

	store.prune("faq", 2).await.expect("Prune failed.");

	let deletes = mock.deletes.lock().expect("Lock poisoned.");

	assert_eq!(deletes.len(), 1);
	assert_eq!(deletes[0]["namespace"], "support");
	assert_eq!(deletes[0]["filter"]["document_id"]["$eq"], "faq");
	assert_eq!(deletes[0]["filter"]["chunk_index"]["$gte"], 2);
}
