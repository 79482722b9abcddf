use serde::Serialize;

use crate::model::ProcessingStatus;

/// How the orchestrator treats a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
	/// Network blip, rate limit or timeout. Retried with backoff up to the attempt bound.
	Transient,
	/// Malformed request, auth failure or policy rejection. Never retried.
	Fatal,
	/// Inconsistent data such as a dimension mismatch or an empty query. Never retried.
	DataIntegrity,
}
impl ErrorClass {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Transient => "transient",
			Self::Fatal => "fatal",
			Self::DataIntegrity => "data_integrity",
		}
	}

	pub fn is_retryable(self) -> bool {
		matches!(self, Self::Transient)
	}
}

pub trait Classify {
	fn classify(&self) -> ErrorClass;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EmbeddingError {
	#[error("Embedding provider rate limited the request: {message}")]
	RateLimited { message: String },
	#[error("Embedding request timed out: {message}")]
	Timeout { message: String },
	#[error("Embedding provider is unavailable: {message}")]
	Unavailable { message: String },
	#[error("Embedding provider rejected the request with status {status}: {message}")]
	Rejected { status: u16, message: String },
	#[error("Embedding response is malformed: {message}")]
	MalformedResponse { message: String },
	#[error("Embedding input is empty.")]
	EmptyInput,
	#[error("Embedding dimension {actual} does not match configured dimension {expected}.")]
	DimensionMismatch { expected: u32, actual: usize },
}
impl Classify for EmbeddingError {
	fn classify(&self) -> ErrorClass {
		match self {
			Self::RateLimited { .. } | Self::Timeout { .. } | Self::Unavailable { .. } =>
				ErrorClass::Transient,
			Self::Rejected { .. } | Self::MalformedResponse { .. } => ErrorClass::Fatal,
			Self::EmptyInput | Self::DimensionMismatch { .. } => ErrorClass::DataIntegrity,
		}
	}
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VectorStoreError {
	#[error("Vector index is unavailable: {message}")]
	Unavailable { message: String },
	#[error("Vector index rejected the request: {message}")]
	Rejected { message: String },
	#[error("Vector index response is malformed: {message}")]
	MalformedResponse { message: String },
	#[error("Vector dimension {actual} does not match index dimension {expected}.")]
	DimensionMismatch { expected: u32, actual: usize },
	#[error("top_k must be at least 1.")]
	InvalidTopK,
	#[error("Vector index {name:?} does not exist.")]
	IndexNotFound { name: String },
}
impl VectorStoreError {
	pub fn check_dimensions(vector: &[f32], expected: u32) -> Result<(), Self> {
		if vector.len() != expected as usize {
			return Err(Self::DimensionMismatch { expected, actual: vector.len() });
		}

		Ok(())
	}
}
impl Classify for VectorStoreError {
	fn classify(&self) -> ErrorClass {
		match self {
			Self::Unavailable { .. } => ErrorClass::Transient,
			Self::Rejected { .. } | Self::MalformedResponse { .. } | Self::IndexNotFound { .. } =>
				ErrorClass::Fatal,
			Self::DimensionMismatch { .. } | Self::InvalidTopK => ErrorClass::DataIntegrity,
		}
	}
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetrievalError {
	#[error("Message has neither body nor subject text to search with.")]
	EmptyQuery,
	#[error(transparent)]
	Embedding(#[from] EmbeddingError),
	#[error(transparent)]
	VectorStore(#[from] VectorStoreError),
}
impl Classify for RetrievalError {
	fn classify(&self) -> ErrorClass {
		match self {
			Self::EmptyQuery => ErrorClass::DataIntegrity,
			Self::Embedding(err) => err.classify(),
			Self::VectorStore(err) => err.classify(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
	#[error("Language model rate limited the request: {message}")]
	RateLimited { message: String },
	#[error("Generation timed out: {message}")]
	Timeout { message: String },
	#[error("Language model is unavailable: {message}")]
	Unavailable { message: String },
	#[error("Language model rejected the request: {message}")]
	InvalidRequest { message: String },
	#[error("Language model refused the request on content policy grounds: {message}")]
	ContentPolicy { message: String },
	#[error("Language model response is malformed: {message}")]
	MalformedResponse { message: String },
	#[error("Language model returned an empty completion.")]
	EmptyCompletion,
}
impl Classify for GenerationError {
	fn classify(&self) -> ErrorClass {
		match self {
			Self::RateLimited { .. } | Self::Timeout { .. } | Self::Unavailable { .. } =>
				ErrorClass::Transient,
			Self::InvalidRequest { .. }
			| Self::ContentPolicy { .. }
			| Self::MalformedResponse { .. }
			| Self::EmptyCompletion => ErrorClass::Fatal,
		}
	}
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
	#[error("Recipient address {address:?} is malformed.")]
	InvalidAddress { address: String },
	#[error("Mail server permanently rejected the reply: {message}")]
	Rejected { message: String },
	#[error("Mail transport failed: {message}")]
	Transport { message: String },
}
impl Classify for DeliveryError {
	fn classify(&self) -> ErrorClass {
		match self {
			Self::Transport { .. } => ErrorClass::Transient,
			Self::InvalidAddress { .. } | Self::Rejected { .. } => ErrorClass::Fatal,
		}
	}
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MailError {
	#[error("Mailbox transport failed: {message}")]
	Transport { message: String },
	#[error("Mailbox rejected the credentials: {message}")]
	Authentication { message: String },
	#[error("Failed to parse mail: {message}")]
	Parse { message: String },
}
impl Classify for MailError {
	fn classify(&self) -> ErrorClass {
		match self {
			Self::Transport { .. } => ErrorClass::Transient,
			Self::Authentication { .. } => ErrorClass::Fatal,
			Self::Parse { .. } => ErrorClass::DataIntegrity,
		}
	}
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateStoreError {
	#[error("Processing state backend failed: {message}")]
	Backend { message: String },
	#[error("No processing state for message {message_id:?}.")]
	NotFound { message_id: String },
	#[error("Message {message_id:?} is {status}, expected {expected}.")]
	Conflict { message_id: String, status: ProcessingStatus, expected: ProcessingStatus },
	#[error("Cannot move message {message_id:?} from {from} to {to}.")]
	InvalidTransition { message_id: String, from: ProcessingStatus, to: ProcessingStatus },
	#[error("Lease on message {message_id:?} was lost.")]
	LeaseLost { message_id: String },
}
impl Classify for StateStoreError {
	fn classify(&self) -> ErrorClass {
		match self {
			Self::Backend { .. } => ErrorClass::Transient,
			Self::NotFound { .. } | Self::Conflict { .. } | Self::LeaseLost { .. } =>
				ErrorClass::Fatal,
			Self::InvalidTransition { .. } => ErrorClass::DataIntegrity,
		}
	}
}
