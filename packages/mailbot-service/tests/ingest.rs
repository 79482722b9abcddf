use std::{sync::Arc, time::Duration};

use serde_json::{Map, Value};

use mailbot_chunking::ChunkingConfig;
use mailbot_domain::{EmbeddingError, MailError, SourceDocument, chunk_id_for};
use mailbot_service::{Inbox, IngestStage, Ingestor, RetryPolicy};
use mailbot_storage::memory::MemoryVectorStore;
use mailbot_testkit::{FakeEmbedder, RecordingMailbox, TEST_DIMENSIONS};

fn policy() -> RetryPolicy {
	RetryPolicy {
		max_attempts: 3,
		base_backoff: Duration::from_millis(1),
		max_backoff: Duration::from_millis(1),
	}
}

fn ingestor(
	embedder: Arc<FakeEmbedder>,
	store: Arc<MemoryVectorStore>,
	batch_size: u32,
) -> Ingestor {
	Ingestor::new(
		embedder,
		store,
		ChunkingConfig { window_chars: 40, overlap_chars: 8 },
		batch_size,
		policy(),
	)
}

fn document(id: &str) -> SourceDocument {
	let mut metadata = Map::new();

	metadata.insert("source".to_string(), Value::String("faq".to_string()));

	SourceDocument {
		id: id.to_string(),
		text: "Support is open weekdays from 9am to 5pm ET. Returns are accepted within thirty \
		       days of purchase with a receipt."
			.to_string(),
		metadata,
	}
}

#[tokio::test]
async fn reingesting_replaces_instead_of_duplicating() {
	let embedder = Arc::new(FakeEmbedder::new(TEST_DIMENSIONS));
	let store = Arc::new(MemoryVectorStore::new(TEST_DIMENSIONS));
	let ingestor = ingestor(embedder, store.clone(), 2);
	let first = ingestor.ingest(&[document("faq")]).await;

	assert_eq!(first.documents, 1);
	assert!(first.chunks > 1);
	assert_eq!(first.upserted, first.chunks);
	assert!(first.failures.is_empty());

	let stored = store.len();
	let second = ingestor.ingest(&[document("faq")]).await;

	assert_eq!(second.upserted, first.upserted);
	assert_eq!(store.len(), stored);
}

#[tokio::test]
async fn shortened_document_drops_its_trailing_chunks() {
	let embedder = Arc::new(FakeEmbedder::new(TEST_DIMENSIONS));
	let store = Arc::new(MemoryVectorStore::new(TEST_DIMENSIONS));
	let ingestor = ingestor(embedder, store.clone(), 2);
	let first = ingestor.ingest(&[document("faq"), document("returns")]).await;

	assert!(first.chunks > 2);

	let shortened = SourceDocument {
		id: "faq".to_string(),
		text: "Closed on holidays.".to_string(),
		metadata: Map::new(),
	};
	let second = ingestor.ingest(&[shortened]).await;

	assert_eq!(second.chunks, 1);
	assert!(second.failures.is_empty());
	assert_eq!(store.len(), first.chunks / 2 + 1);
	assert_eq!(
		store.get(chunk_id_for("faq", 0)).expect("Missing first chunk.").text,
		"Closed on holidays."
	);
	assert!(store.get(chunk_id_for("faq", 1)).is_none());
	assert!(store.get(chunk_id_for("returns", 1)).is_some());
}

#[tokio::test]
async fn chunk_metadata_keeps_caller_fields() {
	let embedder = Arc::new(FakeEmbedder::new(TEST_DIMENSIONS));
	let store = Arc::new(MemoryVectorStore::new(TEST_DIMENSIONS));

	ingestor(embedder, store.clone(), 10).ingest(&[document("faq")]).await;

	let chunk = store.get(chunk_id_for("faq", 1)).expect("Missing second chunk.");

	assert_eq!(chunk.document_id, "faq");
	assert_eq!(chunk.metadata["source"], "faq");
	assert_eq!(chunk.metadata["chunk_index"], 1);
	assert_eq!(
		chunk.metadata["content_hash"],
		Value::String(mailbot_domain::content_hash(&chunk.text))
	);
}

#[tokio::test]
async fn fatal_embedding_failures_are_reported_per_chunk() {
	let embedder = Arc::new(FakeEmbedder::new(TEST_DIMENSIONS));
	let store = Arc::new(MemoryVectorStore::new(TEST_DIMENSIONS));

	embedder.fail_next(EmbeddingError::Rejected { status: 400, message: "Bad input.".to_string() });

	let report = ingestor(embedder.clone(), store.clone(), 10).ingest(&[document("faq")]).await;

	assert_eq!(report.failures.len(), 1);
	assert_eq!(report.failures[0].stage, IngestStage::Embed);
	assert_eq!(report.failures[0].chunk_id, Some(chunk_id_for("faq", 0)));
	assert_eq!(report.upserted, report.chunks - 1);
	assert!(store.get(chunk_id_for("faq", 0)).is_none());
}

#[tokio::test]
async fn failed_upsert_reports_every_chunk_in_the_batch() {
	let embedder = Arc::new(FakeEmbedder::new(TEST_DIMENSIONS));
	let store = Arc::new(MemoryVectorStore::new(TEST_DIMENSIONS + 1));
	let report = ingestor(embedder, store, 10).ingest(&[document("faq")]).await;

	assert_eq!(report.upserted, 0);
	assert_eq!(report.failures.len(), report.chunks);
	assert!(report.failures.iter().all(|failure| failure.stage == IngestStage::Upsert));
}

#[tokio::test]
async fn mailbox_history_is_backfilled() {
	let embedder = Arc::new(FakeEmbedder::new(TEST_DIMENSIONS));
	let store = Arc::new(MemoryVectorStore::new(TEST_DIMENSIONS));
	let mailbox = RecordingMailbox::new();

	mailbox.archive(mailbot_testkit::inbound("old-1", "a@example.com", "Invoice", "Paid."));
	mailbox.archive(mailbot_testkit::inbound("old-2", "b@example.com", "Refund", "Done."));

	let report = ingestor(embedder, store.clone(), 10)
		.backfill_mailbox(&mailbox, None)
		.await
		.expect("Backfill failed.");

	assert_eq!(report.documents, 2);
	assert!(report.failures.is_empty());

	let chunk = store.get(chunk_id_for("old-2", 0)).expect("Missing backfilled chunk.");

	assert_eq!(chunk.text, "Refund\n\nDone.");
	assert_eq!(chunk.metadata["kind"], "email");
	assert_eq!(chunk.metadata["sender"], "b@example.com");
}

#[tokio::test]
async fn inbox_survives_poll_failures() {
	let mailbox = Arc::new(RecordingMailbox::new());

	mailbox.fail_next_fetch(MailError::Transport { message: "Connection reset.".to_string() });
	mailbox.deliver(mailbot_testkit::inbound("m1", "a@example.com", "Hi", "Hello."));

	let mut inbox = Inbox::new(mailbox, Duration::from_millis(5));
	let message = tokio::time::timeout(Duration::from_secs(5), inbox.next())
		.await
		.expect("Inbox did not yield.");

	assert_eq!(message.id, "m1");
}
