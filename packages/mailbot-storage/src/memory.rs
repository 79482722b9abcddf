//! In-process backends for local runs and tests.

use std::{collections::HashMap, sync::Mutex};

use serde_json::Value;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use mailbot_domain::{
	BoxFuture, Claim, DocumentChunk, Lease, ProcessingState, ProcessingStatus, RetrievalResult,
	RetrievedChunk, StateStore, StateStoreError, VectorStore, VectorStoreError,
	model::METADATA_CHUNK_INDEX,
};

struct Entry {
	state: ProcessingState,
	lease: Option<(Uuid, OffsetDateTime)>,
}
impl Entry {
	fn lease_live(&self, now: OffsetDateTime) -> bool {
		matches!(self.lease, Some((_, until)) if until > now)
	}

	fn holds(&self, token: Uuid) -> bool {
		matches!(self.lease, Some((held, _)) if held == token)
	}
}

#[derive(Default)]
pub struct MemoryStateStore {
	entries: Mutex<HashMap<String, Entry>>,
}
impl MemoryStateStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn claim_now(&self, message_id: &str, lease: Duration) -> Claim {
		let now = OffsetDateTime::now_utc();
		let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
		let entry = entries.entry(message_id.to_string()).or_insert_with(|| Entry {
			state: ProcessingState::new(message_id, now),
			lease: None,
		});

		if entry.state.status.is_terminal() {
			return Claim::Finished(entry.state.status);
		}
		if entry.lease_live(now) {
			return Claim::InFlight;
		}

		let token = Uuid::new_v4();

		entry.lease = Some((token, now + lease));
		entry.state.updated_at = now;

		Claim::Acquired(Lease { token, state: entry.state.clone() })
	}

	fn advance_now(
		&self,
		message_id: &str,
		token: Uuid,
		from: ProcessingStatus,
		to: ProcessingStatus,
		reply_text: Option<&str>,
	) -> Result<ProcessingState, StateStoreError> {
		if !from.can_advance_to(to) {
			return Err(StateStoreError::InvalidTransition {
				message_id: message_id.to_string(),
				from,
				to,
			});
		}

		let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
		let entry = entries
			.get_mut(message_id)
			.ok_or_else(|| StateStoreError::NotFound { message_id: message_id.to_string() })?;

		if entry.state.status != from {
			return Err(StateStoreError::Conflict {
				message_id: message_id.to_string(),
				status: entry.state.status,
				expected: from,
			});
		}
		if !entry.holds(token) {
			return Err(StateStoreError::LeaseLost { message_id: message_id.to_string() });
		}

		entry.state.status = to;
		entry.state.updated_at = OffsetDateTime::now_utc();

		if let Some(text) = reply_text {
			entry.state.reply_text = Some(text.to_string());
		}
		if to.is_terminal() {
			entry.lease = None;
		}

		Ok(entry.state.clone())
	}

	fn record_failure_now(
		&self,
		message_id: &str,
		token: Uuid,
		error: &str,
		terminal: bool,
	) -> Result<ProcessingState, StateStoreError> {
		let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
		let entry = entries
			.get_mut(message_id)
			.ok_or_else(|| StateStoreError::NotFound { message_id: message_id.to_string() })?;

		if entry.state.status.is_terminal() || !entry.holds(token) {
			return Err(StateStoreError::LeaseLost { message_id: message_id.to_string() });
		}

		entry.state.attempts += 1;
		entry.state.last_error = Some(error.to_string());
		entry.state.updated_at = OffsetDateTime::now_utc();

		if terminal {
			entry.state.status = ProcessingStatus::Failed;
			entry.lease = None;
		}

		Ok(entry.state.clone())
	}

	fn release_now(&self, message_id: &str, token: Uuid) {
		let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());

		if let Some(entry) = entries.get_mut(message_id)
			&& entry.holds(token)
		{
			entry.lease = None;
			entry.state.updated_at = OffsetDateTime::now_utc();
		}
	}

	fn get_now(&self, message_id: &str) -> Option<ProcessingState> {
		let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());

		entries.get(message_id).map(|entry| entry.state.clone())
	}

	fn list_now(&self, status: Option<ProcessingStatus>, limit: u32) -> Vec<ProcessingState> {
		let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
		let mut states: Vec<ProcessingState> = entries
			.values()
			.filter(|entry| status.is_none_or(|status| entry.state.status == status))
			.map(|entry| entry.state.clone())
			.collect();

		states.sort_by(|a, b| {
			b.updated_at.cmp(&a.updated_at).then_with(|| a.message_id.cmp(&b.message_id))
		});
		states.truncate(limit as usize);

		states
	}

	fn reset_now(&self, message_id: &str) -> Result<ProcessingState, StateStoreError> {
		let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
		let entry = entries
			.get_mut(message_id)
			.ok_or_else(|| StateStoreError::NotFound { message_id: message_id.to_string() })?;

		if entry.state.status != ProcessingStatus::Failed {
			return Err(StateStoreError::Conflict {
				message_id: message_id.to_string(),
				status: entry.state.status,
				expected: ProcessingStatus::Failed,
			});
		}

		entry.state.status = ProcessingStatus::Pending;
		entry.state.attempts = 0;
		entry.state.last_error = None;
		entry.state.reply_text = None;
		entry.state.updated_at = OffsetDateTime::now_utc();
		entry.lease = None;

		Ok(entry.state.clone())
	}
}
impl StateStore for MemoryStateStore {
	fn claim<'a>(
		&'a self,
		message_id: &'a str,
		lease: Duration,
	) -> BoxFuture<'a, Result<Claim, StateStoreError>> {
		Box::pin(async move { Ok(self.claim_now(message_id, lease)) })
	}

	fn advance<'a>(
		&'a self,
		message_id: &'a str,
		token: Uuid,
		from: ProcessingStatus,
		to: ProcessingStatus,
		reply_text: Option<&'a str>,
	) -> BoxFuture<'a, Result<ProcessingState, StateStoreError>> {
		Box::pin(async move { self.advance_now(message_id, token, from, to, reply_text) })
	}

	fn record_failure<'a>(
		&'a self,
		message_id: &'a str,
		token: Uuid,
		error: &'a str,
		terminal: bool,
	) -> BoxFuture<'a, Result<ProcessingState, StateStoreError>> {
		Box::pin(async move { self.record_failure_now(message_id, token, error, terminal) })
	}

	fn release<'a>(
		&'a self,
		message_id: &'a str,
		token: Uuid,
	) -> BoxFuture<'a, Result<(), StateStoreError>> {
		Box::pin(async move {
			self.release_now(message_id, token);

			Ok(())
		})
	}

	fn get<'a>(
		&'a self,
		message_id: &'a str,
	) -> BoxFuture<'a, Result<Option<ProcessingState>, StateStoreError>> {
		Box::pin(async move { Ok(self.get_now(message_id)) })
	}

	fn list<'a>(
		&'a self,
		status: Option<ProcessingStatus>,
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<ProcessingState>, StateStoreError>> {
		Box::pin(async move { Ok(self.list_now(status, limit)) })
	}

	fn reset<'a>(
		&'a self,
		message_id: &'a str,
	) -> BoxFuture<'a, Result<ProcessingState, StateStoreError>> {
		Box::pin(async move { self.reset_now(message_id) })
	}
}

/// Exact cosine search over every stored chunk.
pub struct MemoryVectorStore {
	dimensions: u32,
	chunks: Mutex<Vec<DocumentChunk>>,
}
impl MemoryVectorStore {
	pub fn new(dimensions: u32) -> Self {
		Self { dimensions, chunks: Mutex::new(Vec::new()) }
	}

	pub fn len(&self) -> usize {
		self.chunks.lock().unwrap_or_else(|err| err.into_inner()).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn get(&self, chunk_id: Uuid) -> Option<DocumentChunk> {
		let chunks = self.chunks.lock().unwrap_or_else(|err| err.into_inner());

		chunks.iter().find(|chunk| chunk.chunk_id == chunk_id).cloned()
	}

	fn upsert_now(&self, incoming: &[DocumentChunk]) -> Result<(), VectorStoreError> {
		for chunk in incoming {
			VectorStoreError::check_dimensions(&chunk.embedding, self.dimensions)?;
		}

		let mut chunks = self.chunks.lock().unwrap_or_else(|err| err.into_inner());

		for chunk in incoming {
			match chunks.iter_mut().find(|stored| stored.chunk_id == chunk.chunk_id) {
				Some(stored) => *stored = chunk.clone(),
				None => chunks.push(chunk.clone()),
			}
		}

		Ok(())
	}

	fn prune_now(&self, document_id: &str, keep: u32) {
		let mut chunks = self.chunks.lock().unwrap_or_else(|err| err.into_inner());

		chunks.retain(|chunk| {
			chunk.document_id != document_id
				|| chunk
					.metadata
					.get(METADATA_CHUNK_INDEX)
					.and_then(Value::as_u64)
					.is_none_or(|index| index < u64::from(keep))
		});
	}

	fn query_now(&self, vector: &[f32], top_k: u32) -> Result<RetrievalResult, VectorStoreError> {
		if top_k == 0 {
			return Err(VectorStoreError::InvalidTopK);
		}

		VectorStoreError::check_dimensions(vector, self.dimensions)?;

		let chunks = self.chunks.lock().unwrap_or_else(|err| err.into_inner());
		let mut matches: Vec<RetrievedChunk> = chunks
			.iter()
			.map(|chunk| RetrievedChunk {
				score: cosine(vector, &chunk.embedding),
				chunk: chunk.clone(),
			})
			.collect();

		matches.sort_by(|a, b| b.score.total_cmp(&a.score));
		matches.truncate(top_k as usize);

		Ok(RetrievalResult::new(matches))
	}
}
impl VectorStore for MemoryVectorStore {
	fn dimensions(&self) -> u32 {
		self.dimensions
	}

	fn upsert<'a>(
		&'a self,
		chunks: &'a [DocumentChunk],
	) -> BoxFuture<'a, Result<(), VectorStoreError>> {
		Box::pin(async move { self.upsert_now(chunks) })
	}

	fn prune<'a>(
		&'a self,
		document_id: &'a str,
		keep: u32,
	) -> BoxFuture<'a, Result<(), VectorStoreError>> {
		Box::pin(async move {
			self.prune_now(document_id, keep);

			Ok(())
		})
	}

	fn query<'a>(
		&'a self,
		vector: &'a [f32],
		top_k: u32,
	) -> BoxFuture<'a, Result<RetrievalResult, VectorStoreError>> {
		Box::pin(async move { self.query_now(vector, top_k) })
	}
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
	let mut dot = 0.0_f32;
	let mut norm_a = 0.0_f32;
	let mut norm_b = 0.0_f32;

	for (x, y) in a.iter().zip(b) {
		dot += x * y;
		norm_a += x * x;
		norm_b += y * y;
	}

	if norm_a == 0.0 || norm_b == 0.0 {
		return 0.0;
	}

	dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
	use serde_json::Map;

	use super::*;

	const LEASE: Duration = Duration::minutes(5);

	fn chunk(document_id: &str, index: u32, embedding: Vec<f32>) -> DocumentChunk {
		DocumentChunk {
			chunk_id: mailbot_domain::chunk_id_for(document_id, index),
			document_id: document_id.to_string(),
			text: format!("{document_id} part {index}"),
			embedding,
			metadata: Map::from_iter([(
				METADATA_CHUNK_INDEX.to_string(),
				Value::from(index),
			)]),
		}
	}

	fn lease_token(claim: Claim) -> Uuid {
		match claim {
			Claim::Acquired(lease) => lease.token,
			other => panic!("Expected an acquired lease, got {other:?}."),
		}
	}

	#[tokio::test]
	async fn second_claim_sees_in_flight() {
		let store = MemoryStateStore::new();
		let first = store.claim("m1", LEASE).await.expect("claim failed");

		assert!(matches!(first, Claim::Acquired(_)));
		assert_eq!(
			store.claim("m1", LEASE).await.expect("claim failed"),
			Claim::InFlight
		);
	}

	#[tokio::test]
	async fn expired_lease_can_be_reclaimed() {
		let store = MemoryStateStore::new();
		let stale = lease_token(store.claim("m1", Duration::ZERO).await.expect("claim failed"));
		let fresh = lease_token(store.claim("m1", LEASE).await.expect("claim failed"));

		assert_ne!(stale, fresh);

		let err = store
			.advance("m1", stale, ProcessingStatus::Pending, ProcessingStatus::Retrieved, None)
			.await
			.expect_err("Stale lease should not advance.");

		assert_eq!(err, StateStoreError::LeaseLost { message_id: "m1".to_string() });
	}

	#[tokio::test]
	async fn advance_is_a_compare_and_swap() {
		let store = MemoryStateStore::new();
		let token = lease_token(store.claim("m1", LEASE).await.expect("claim failed"));

		store
			.advance("m1", token, ProcessingStatus::Pending, ProcessingStatus::Retrieved, None)
			.await
			.expect("advance failed");

		let err = store
			.advance("m1", token, ProcessingStatus::Pending, ProcessingStatus::Retrieved, None)
			.await
			.expect_err("Repeated advance should conflict.");

		assert!(matches!(err, StateStoreError::Conflict { .. }));

		let err = store
			.advance("m1", token, ProcessingStatus::Retrieved, ProcessingStatus::Sent, None)
			.await
			.expect_err("Skipping a stage should be rejected.");

		assert!(matches!(err, StateStoreError::InvalidTransition { .. }));
	}

	#[tokio::test]
	async fn terminal_records_stay_finished() {
		let store = MemoryStateStore::new();
		let token = lease_token(store.claim("m1", LEASE).await.expect("claim failed"));
		let state = store
			.record_failure("m1", token, "boom", true)
			.await
			.expect("record failure failed");

		assert_eq!(state.status, ProcessingStatus::Failed);
		assert_eq!(state.attempts, 1);
		assert_eq!(
			store.claim("m1", LEASE).await.expect("claim failed"),
			Claim::Finished(ProcessingStatus::Failed)
		);

		let reset = store.reset("m1").await.expect("reset failed");

		assert_eq!(reset.status, ProcessingStatus::Pending);
		assert_eq!(reset.attempts, 0);
		assert_eq!(reset.last_error, None);
	}

	#[tokio::test]
	async fn reset_requires_a_failed_record() {
		let store = MemoryStateStore::new();

		assert_eq!(
			store.reset("missing").await,
			Err(StateStoreError::NotFound { message_id: "missing".to_string() })
		);

		store.claim("m1", LEASE).await.expect("claim failed");

		assert!(matches!(store.reset("m1").await, Err(StateStoreError::Conflict { .. })));
	}

	#[tokio::test]
	async fn list_filters_by_status() {
		let store = MemoryStateStore::new();
		let token = lease_token(store.claim("m1", LEASE).await.expect("claim failed"));

		store.claim("m2", LEASE).await.expect("claim failed");
		store.record_failure("m1", token, "boom", true).await.expect("record failure failed");

		let failed = store.list(Some(ProcessingStatus::Failed), 10).await.expect("list failed");
		let all = store.list(None, 10).await.expect("list failed");

		assert_eq!(failed.len(), 1);
		assert_eq!(failed[0].message_id, "m1");
		assert_eq!(all.len(), 2);
		assert_eq!(store.list(None, 1).await.expect("list failed").len(), 1);
	}

	#[tokio::test]
	async fn upsert_replaces_by_chunk_id() {
		let store = MemoryVectorStore::new(2);

		store.upsert(&[chunk("faq", 0, vec![1.0, 0.0])]).await.expect("upsert failed");
		store.upsert(&[chunk("faq", 0, vec![0.0, 1.0])]).await.expect("upsert failed");

		assert_eq!(store.len(), 1);

		let stored = store.get(mailbot_domain::chunk_id_for("faq", 0)).expect("missing chunk");

		assert_eq!(stored.embedding, vec![0.0, 1.0]);
	}

	#[tokio::test]
	async fn query_ranks_by_cosine() {
		let store = MemoryVectorStore::new(2);

		store
			.upsert(&[
				chunk("a", 0, vec![0.0, 1.0]),
				chunk("b", 0, vec![1.0, 0.1]),
				chunk("c", 0, vec![1.0, 1.0]),
			])
			.await
			.expect("upsert failed");

		let result = store.query(&[1.0, 0.0], 2).await.expect("query failed");
		let ids: Vec<&str> = result.iter().map(|m| m.chunk.document_id.as_str()).collect();

		assert_eq!(ids, vec!["b", "c"]);
		assert!(result.is_ranked());
	}

	#[tokio::test]
	async fn wrong_dimensions_are_rejected() {
		let store = MemoryVectorStore::new(3);

		assert_eq!(
			store.query(&[1.0, 0.0], 3).await,
			Err(VectorStoreError::DimensionMismatch { expected: 3, actual: 2 })
		);
		assert_eq!(store.query(&[1.0, 0.0, 0.0], 0).await, Err(VectorStoreError::InvalidTopK));
		assert!(store.upsert(&[chunk("a", 0, vec![1.0])]).await.is_err());
		assert!(store.is_empty());
	}

	#[tokio::test]
	async fn prune_keeps_leading_chunks_of_the_document() {
		let store = MemoryVectorStore::new(2);

		store
			.upsert(&[
				chunk("faq", 0, vec![1.0, 0.0]),
				chunk("faq", 1, vec![1.0, 0.0]),
				chunk("faq", 2, vec![1.0, 0.0]),
				chunk("returns", 2, vec![0.0, 1.0]),
			])
			.await
			.expect("upsert failed");
		store.prune("faq", 1).await.expect("prune failed");

		assert_eq!(store.len(), 2);
		assert!(store.get(mailbot_domain::chunk_id_for("faq", 0)).is_some());
		assert!(store.get(mailbot_domain::chunk_id_for("faq", 1)).is_none());
		assert!(store.get(mailbot_domain::chunk_id_for("returns", 2)).is_some());
	}
}
