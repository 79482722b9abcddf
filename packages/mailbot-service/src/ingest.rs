use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::retry::{RetryPolicy, sanitize_error};
use mailbot_chunking::ChunkingConfig;
use mailbot_domain::{
	DocumentChunk, Embedder, InboundMessage, MailError, Mailbox, Metadata, SourceDocument,
	VectorStore, chunk_id_for, content_hash,
	model::{METADATA_CHUNK_INDEX, METADATA_CONTENT_HASH},
};

pub const EMAIL_DOCUMENT_KIND: &str = "email";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
	Embed,
	Upsert,
	Prune,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IngestFailure {
	pub document_id: String,
	/// Absent for document-level failures.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub chunk_id: Option<Uuid>,
	pub stage: IngestStage,
	pub error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IngestReport {
	pub documents: usize,
	pub chunks: usize,
	pub upserted: usize,
	pub failures: Vec<IngestFailure>,
}
impl IngestReport {
	fn absorb(&mut self, other: Self) {
		self.documents += other.documents;
		self.chunks += other.chunks;
		self.upserted += other.upserted;
		self.failures.extend(other.failures);
	}
}

/// Chunks, embeds and indexes knowledge documents.
///
/// Chunk ids derive from the document id and chunk position, so re-ingesting a document
/// overwrites its chunks instead of duplicating them. Chunks past the new chunk count are
/// pruned from the index.
pub struct Ingestor {
	embedder: Arc<dyn Embedder>,
	store: Arc<dyn VectorStore>,
	chunking: ChunkingConfig,
	batch_size: usize,
	policy: RetryPolicy,
}
impl Ingestor {
	pub fn new(
		embedder: Arc<dyn Embedder>,
		store: Arc<dyn VectorStore>,
		chunking: ChunkingConfig,
		batch_size: u32,
		policy: RetryPolicy,
	) -> Self {
		Self { embedder, store, chunking, batch_size: batch_size.max(1) as usize, policy }
	}

	pub async fn ingest(&self, documents: &[SourceDocument]) -> IngestReport {
		let mut report = IngestReport { documents: documents.len(), ..Default::default() };
		let mut pending = Vec::with_capacity(self.batch_size);

		for document in documents {
			let pieces = mailbot_chunking::split_text(&document.text, &self.chunking);

			self.prune(&document.id, pieces.len() as u32, &mut report).await;

			for piece in pieces {
				let chunk_id = chunk_id_for(&document.id, piece.chunk_index);

				report.chunks += 1;

				let embedding = match self.policy.retry(|| self.embedder.embed(&piece.text)).await {
					Ok(embedding) => embedding,
					Err(err) => {
						tracing::warn!(
							document_id = %document.id,
							%chunk_id,
							error = %err,
							"Failed to embed chunk."
						);
						report.failures.push(IngestFailure {
							document_id: document.id.clone(),
							chunk_id: Some(chunk_id),
							stage: IngestStage::Embed,
							error: sanitize_error(&err.to_string()),
						});

						continue;
					},
				};
				let mut metadata = document.metadata.clone();

				metadata.insert(METADATA_CHUNK_INDEX.to_string(), Value::from(piece.chunk_index));
				metadata
					.insert(METADATA_CONTENT_HASH.to_string(), content_hash(&piece.text).into());
				pending.push(DocumentChunk {
					chunk_id,
					document_id: document.id.clone(),
					text: piece.text,
					embedding,
					metadata,
				});

				if pending.len() >= self.batch_size {
					self.flush(&mut pending, &mut report).await;
				}
			}
		}

		self.flush(&mut pending, &mut report).await;

		tracing::info!(
			documents = report.documents,
			chunks = report.chunks,
			upserted = report.upserted,
			failures = report.failures.len(),
			"Ingestion finished."
		);

		report
	}

	/// Indexes the whole mailbox history, newest `limit` messages when bounded.
	pub async fn backfill_mailbox(
		&self,
		mailbox: &dyn Mailbox,
		limit: Option<usize>,
	) -> Result<IngestReport, MailError> {
		let messages = mailbox.history(limit).await?;
		let documents: Vec<SourceDocument> = messages.iter().map(document_from_message).collect();

		tracing::info!(messages = documents.len(), "Backfilling knowledge from the mailbox.");

		let mut report = IngestReport::default();

		for batch in documents.chunks(self.batch_size) {
			report.absorb(self.ingest(batch).await);
		}

		Ok(report)
	}

	async fn prune(&self, document_id: &str, keep: u32, report: &mut IngestReport) {
		if let Err(err) = self.policy.retry(|| self.store.prune(document_id, keep)).await {
			tracing::warn!(document_id, keep, error = %err, "Failed to prune stale chunks.");

			report.failures.push(IngestFailure {
				document_id: document_id.to_string(),
				chunk_id: None,
				stage: IngestStage::Prune,
				error: sanitize_error(&err.to_string()),
			});
		}
	}

	async fn flush(&self, pending: &mut Vec<DocumentChunk>, report: &mut IngestReport) {
		if pending.is_empty() {
			return;
		}

		let batch = std::mem::take(pending);

		match self.policy.retry(|| self.store.upsert(&batch)).await {
			Ok(()) => report.upserted += batch.len(),
			Err(err) => {
				let error = sanitize_error(&err.to_string());

				tracing::warn!(chunks = batch.len(), error = %err, "Failed to upsert chunk batch.");

				report.failures.extend(batch.iter().map(|chunk| IngestFailure {
					document_id: chunk.document_id.clone(),
					chunk_id: Some(chunk.chunk_id),
					stage: IngestStage::Upsert,
					error: error.clone(),
				}));
			},
		}
	}
}

/// A knowledge document built from a received mail.
pub fn document_from_message(message: &InboundMessage) -> SourceDocument {
	let mut metadata = Metadata::new();

	metadata.insert("kind".to_string(), EMAIL_DOCUMENT_KIND.into());
	metadata.insert("sender".to_string(), message.sender.clone().into());
	metadata.insert("subject".to_string(), message.subject.clone().into());

	if let Ok(received_at) = message.received_at.format(&Rfc3339) {
		metadata.insert("received_at".to_string(), received_at.into());
	}

	SourceDocument {
		id: message.id.clone(),
		text: format!("{}\n\n{}", message.subject.trim(), message.body.trim()),
		metadata,
	}
}
