pub mod capability;
pub mod error;
pub mod model;

pub use capability::{BoxFuture, ChatModel, Embedder, Mailbox, StateStore, VectorStore};
pub use error::{
	Classify, DeliveryError, EmbeddingError, ErrorClass, GenerationError, MailError,
	RetrievalError, StateStoreError, VectorStoreError,
};
pub use model::{
	ChatRequest, Claim, DocumentChunk, EmbeddingVector, GeneratedReply, InboundMessage, Lease,
	Metadata, ProcessingState, ProcessingStatus, RetrievalResult, RetrievedChunk, SourceDocument,
	chunk_id_for, content_hash, reply_subject,
};
