use std::{future::Future, pin::Pin};

use time::Duration;
use uuid::Uuid;

use crate::{
	error::{
		DeliveryError, EmbeddingError, GenerationError, MailError, StateStoreError,
		VectorStoreError,
	},
	model::{
		ChatRequest, Claim, DocumentChunk, EmbeddingVector, GeneratedReply, InboundMessage,
		ProcessingState, ProcessingStatus, RetrievalResult,
	},
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait Embedder
where
	Self: Send + Sync,
{
	fn dimensions(&self) -> u32;

	fn embed<'a>(
		&'a self,
		text: &'a str,
	) -> BoxFuture<'a, Result<EmbeddingVector, EmbeddingError>>;
}

pub trait ChatModel
where
	Self: Send + Sync,
{
	fn complete<'a>(
		&'a self,
		request: &'a ChatRequest,
	) -> BoxFuture<'a, Result<String, GenerationError>>;
}

/// Nearest-neighbour index over document chunks.
///
/// Implementations reject vectors whose length differs from [`VectorStore::dimensions`] before
/// touching the backend, and return matches in the order the backend ranked them.
pub trait VectorStore
where
	Self: Send + Sync,
{
	fn dimensions(&self) -> u32;

	/// Writes chunks keyed by `chunk_id`. Re-upserting an id replaces the stored chunk.
	fn upsert<'a>(
		&'a self,
		chunks: &'a [DocumentChunk],
	) -> BoxFuture<'a, Result<(), VectorStoreError>>;

	/// Deletes the chunks of `document_id` whose `chunk_index` metadata is `keep` or higher.
	fn prune<'a>(
		&'a self,
		document_id: &'a str,
		keep: u32,
	) -> BoxFuture<'a, Result<(), VectorStoreError>>;

	fn query<'a>(
		&'a self,
		vector: &'a [f32],
		top_k: u32,
	) -> BoxFuture<'a, Result<RetrievalResult, VectorStoreError>>;
}

/// Per-message processing records. Every mutation is a single atomic compare-and-swap.
pub trait StateStore
where
	Self: Send + Sync,
{
	/// Creates the record if absent and leases it for `lease` unless another live lease exists.
	fn claim<'a>(
		&'a self,
		message_id: &'a str,
		lease: Duration,
	) -> BoxFuture<'a, Result<Claim, StateStoreError>>;

	/// Moves `from -> to` while the lease `token` is held. Terminal targets release the lease.
	fn advance<'a>(
		&'a self,
		message_id: &'a str,
		token: Uuid,
		from: ProcessingStatus,
		to: ProcessingStatus,
		reply_text: Option<&'a str>,
	) -> BoxFuture<'a, Result<ProcessingState, StateStoreError>>;

	/// Counts a failed attempt. With `terminal` the record moves to `failed` and the lease is
	/// released.
	fn record_failure<'a>(
		&'a self,
		message_id: &'a str,
		token: Uuid,
		error: &'a str,
		terminal: bool,
	) -> BoxFuture<'a, Result<ProcessingState, StateStoreError>>;

	fn release<'a>(
		&'a self,
		message_id: &'a str,
		token: Uuid,
	) -> BoxFuture<'a, Result<(), StateStoreError>>;

	fn get<'a>(
		&'a self,
		message_id: &'a str,
	) -> BoxFuture<'a, Result<Option<ProcessingState>, StateStoreError>>;

	/// Most recently updated first.
	fn list<'a>(
		&'a self,
		status: Option<ProcessingStatus>,
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<ProcessingState>, StateStoreError>>;

	/// Operator reset: `failed -> pending` with attempts and error cleared.
	fn reset<'a>(
		&'a self,
		message_id: &'a str,
	) -> BoxFuture<'a, Result<ProcessingState, StateStoreError>>;
}

pub trait Mailbox
where
	Self: Send + Sync,
{
	/// Unread messages. Fetching does not mark them read.
	fn fetch_unseen<'a>(&'a self) -> BoxFuture<'a, Result<Vec<InboundMessage>, MailError>>;

	/// Marks a message read once processing reached a terminal state.
	fn acknowledge<'a>(&'a self, message_id: &'a str) -> BoxFuture<'a, Result<(), MailError>>;

	fn send<'a>(
		&'a self,
		reply: &'a GeneratedReply,
		to: &'a str,
	) -> BoxFuture<'a, Result<(), DeliveryError>>;

	/// Every message in the mailbox, newest last, bounded by `limit` when given.
	fn history<'a>(
		&'a self,
		limit: Option<usize>,
	) -> BoxFuture<'a, Result<Vec<InboundMessage>, MailError>>;
}
