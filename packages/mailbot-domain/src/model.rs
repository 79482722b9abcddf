use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

pub type EmbeddingVector = Vec<f32>;
pub type Metadata = Map<String, Value>;

pub const METADATA_CHUNK_INDEX: &str = "chunk_index";
pub const METADATA_CONTENT_HASH: &str = "content_hash";

const REPLY_PREFIX: &str = "Re: ";

/// A mail received from the mailbox. Never mutated after it is parsed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
	/// Provider-assigned `Message-ID`, without angle brackets.
	pub id: String,
	pub sender: String,
	pub subject: String,
	pub body: String,
	#[serde(with = "time::serde::rfc3339")]
	pub received_at: OffsetDateTime,
	/// Thread ids taken from `References` and `In-Reply-To`.
	#[serde(default)]
	pub references: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
	pub id: String,
	pub text: String,
	#[serde(default)]
	pub metadata: Metadata,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
	pub chunk_id: Uuid,
	pub document_id: String,
	pub text: String,
	pub embedding: EmbeddingVector,
	#[serde(default)]
	pub metadata: Metadata,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
	pub chunk: DocumentChunk,
	pub score: f32,
}

/// Nearest neighbours in the order the vector index returned them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
	pub matches: Vec<RetrievedChunk>,
}
impl RetrievalResult {
	pub fn new(matches: Vec<RetrievedChunk>) -> Self {
		Self { matches }
	}

	pub fn len(&self) -> usize {
		self.matches.len()
	}

	pub fn is_empty(&self) -> bool {
		self.matches.is_empty()
	}

	pub fn iter(&self) -> std::slice::Iter<'_, RetrievedChunk> {
		self.matches.iter()
	}

	/// Returns true when scores never increase along the sequence.
	pub fn is_ranked(&self) -> bool {
		self.matches.windows(2).all(|pair| pair[0].score >= pair[1].score)
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratedReply {
	/// Id of the inbound message this reply answers.
	pub in_reply_to: String,
	pub subject: String,
	pub text: String,
	pub references: Vec<String>,
	#[serde(with = "time::serde::rfc3339")]
	pub generated_at: OffsetDateTime,
}
impl GeneratedReply {
	pub fn for_message(
		message: &InboundMessage,
		text: String,
		generated_at: OffsetDateTime,
	) -> Self {
		let mut references = message.references.clone();

		if !references.iter().any(|reference| reference == &message.id) {
			references.push(message.id.clone());
		}

		Self {
			in_reply_to: message.id.clone(),
			subject: reply_subject(&message.subject),
			text,
			references,
			generated_at,
		}
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatRequest {
	pub system: String,
	pub prompt: String,
	pub max_output_tokens: u32,
	pub temperature: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
	Pending,
	Retrieved,
	Generated,
	Sent,
	Failed,
}
impl ProcessingStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Retrieved => "retrieved",
			Self::Generated => "generated",
			Self::Sent => "sent",
			Self::Failed => "failed",
		}
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, Self::Sent | Self::Failed)
	}

	/// Forward moves of the processing pipeline. `failed -> pending` is not a move; it only
	/// happens through an operator reset.
	pub fn can_advance_to(self, next: Self) -> bool {
		match (self, next) {
			(Self::Pending, Self::Retrieved)
			| (Self::Retrieved, Self::Generated)
			| (Self::Generated, Self::Sent) => true,
			(from, Self::Failed) => !from.is_terminal(),
			_ => false,
		}
	}
}
impl fmt::Display for ProcessingStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for ProcessingStatus {
	type Err = UnknownStatus;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw.trim().to_ascii_lowercase().as_str() {
			"pending" => Ok(Self::Pending),
			"retrieved" => Ok(Self::Retrieved),
			"generated" => Ok(Self::Generated),
			"sent" => Ok(Self::Sent),
			"failed" => Ok(Self::Failed),
			_ => Err(UnknownStatus(raw.to_string())),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown processing status {0:?}.")]
pub struct UnknownStatus(pub String);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessingState {
	pub message_id: String,
	pub status: ProcessingStatus,
	pub attempts: u32,
	pub last_error: Option<String>,
	/// Persisted at `generated` so delivery can resume without another model call.
	pub reply_text: Option<String>,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
	#[serde(with = "time::serde::rfc3339")]
	pub updated_at: OffsetDateTime,
}
impl ProcessingState {
	/// A fresh `pending` record with no attempts.
	pub fn new(message_id: &str, now: OffsetDateTime) -> Self {
		Self {
			message_id: message_id.to_string(),
			status: ProcessingStatus::Pending,
			attempts: 0,
			last_error: None,
			reply_text: None,
			created_at: now,
			updated_at: now,
		}
	}
}

/// Exclusive right to advance one message, identified by `token`.
#[derive(Clone, Debug, PartialEq)]
pub struct Lease {
	pub token: Uuid,
	/// Record as it was when the lease was taken.
	pub state: ProcessingState,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Claim {
	Acquired(Lease),
	/// Another worker holds a live lease on the message.
	InFlight,
	Finished(ProcessingStatus),
}

pub fn chunk_id_for(document_id: &str, chunk_index: u32) -> Uuid {
	let name = format!("{document_id}:{chunk_index}");

	Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

pub fn content_hash(text: &str) -> String {
	blake3::hash(text.as_bytes()).to_hex().to_string()
}

pub fn reply_subject(subject: &str) -> String {
	let trimmed = subject.trim();
	let already_prefixed = trimmed
		.get(..REPLY_PREFIX.len() - 1)
		.map(|prefix| prefix.eq_ignore_ascii_case("re:"))
		.unwrap_or(false);

	if already_prefixed { trimmed.to_string() } else { format!("{REPLY_PREFIX}{trimmed}") }
}
