use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub service: Service,
	pub mail: Mail,
	pub storage: Storage,
	pub providers: Providers,
	#[serde(default)]
	pub chunking: Chunking,
	#[serde(default)]
	pub retrieval: Retrieval,
	#[serde(default)]
	pub generation: Generation,
	#[serde(default)]
	pub orchestrator: Orchestrator,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
	pub http_bind: String,
	pub log_level: String,
	/// Run the mailbox poll loop inside the HTTP process.
	#[serde(default)]
	pub poll_on_start: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mail {
	pub imap_host: String,
	#[serde(default = "default_imap_port")]
	pub imap_port: u16,
	pub smtp_host: String,
	#[serde(default = "default_smtp_port")]
	pub smtp_port: u16,
	/// Mailbox identity. Overridden by `EMAIL_ADDRESS`.
	#[serde(default)]
	pub address: String,
	/// Mailbox credential. Overridden by `EMAIL_PASSWORD`.
	#[serde(default)]
	pub password: String,
	#[serde(default = "default_mailbox")]
	pub mailbox: String,
	#[serde(default = "default_poll_interval_ms")]
	pub poll_interval_ms: u64,
	#[serde(default = "default_mail_timeout_ms")]
	pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
	pub state: StateStorage,
	pub vector: VectorStorage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateStorage {
	/// One of `memory` or `postgres`.
	pub backend: String,
	pub postgres: Option<Postgres>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Postgres {
	pub dsn: String,
	pub pool_max_conns: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorStorage {
	/// One of `pinecone`, `qdrant` or `memory`.
	pub backend: String,
	pub dimensions: u32,
	#[serde(default = "default_metric")]
	pub metric: String,
	pub pinecone: Option<Pinecone>,
	pub qdrant: Option<Qdrant>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pinecone {
	/// Overridden by `PINECONE_API_KEY`.
	#[serde(default)]
	pub api_key: String,
	/// Overridden by `PINECONE_ENVIRONMENT`. Used as the serverless region when the index is
	/// created.
	#[serde(default)]
	pub environment: String,
	pub index_name: String,
	/// Data-plane host. Resolved through the control plane when absent.
	pub index_host: Option<String>,
	#[serde(default = "default_pinecone_controller")]
	pub controller_url: String,
	#[serde(default = "default_namespace")]
	pub namespace: String,
	#[serde(default)]
	pub create_if_missing: bool,
	#[serde(default = "default_pinecone_cloud")]
	pub cloud: String,
	#[serde(default = "default_pinecone_region")]
	pub region: String,
	#[serde(default = "default_vector_timeout_ms")]
	pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Qdrant {
	pub url: String,
	pub collection: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Providers {
	pub embedding: EmbeddingProviderConfig,
	pub llm: LlmProviderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingProviderConfig {
	/// One of `openai` or `ollama`.
	pub provider_id: String,
	pub api_base: String,
	#[serde(default)]
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub dimensions: u32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmProviderConfig {
	/// One of `openai` or `anthropic`.
	pub provider_id: String,
	pub api_base: String,
	#[serde(default)]
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub temperature: f32,
	pub max_output_tokens: u32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chunking {
	pub window_chars: u32,
	pub overlap_chars: u32,
	pub upsert_batch_size: u32,
}
impl Default for Chunking {
	fn default() -> Self {
		Self { window_chars: 1_200, overlap_chars: 200, upsert_batch_size: 100 }
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct Retrieval {
	pub top_k: u32,
	/// Weight of the subject embedding when blending subject and body. Zero embeds the body only.
	#[serde(default)]
	pub subject_weight: f32,
}
impl Default for Retrieval {
	fn default() -> Self {
		Self { top_k: 3, subject_weight: 0.0 }
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct Generation {
	pub instructions: String,
	/// Prompt budget in characters, covering instructions, context and the email.
	pub max_prompt_chars: u32,
	/// Hard timeout around one generation call.
	pub timeout_ms: u64,
}
impl Default for Generation {
	fn default() -> Self {
		Self {
			instructions: default_instructions(),
			max_prompt_chars: 24_000,
			timeout_ms: 300_000,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct Orchestrator {
	pub max_attempts: u32,
	pub base_backoff_ms: u64,
	pub max_backoff_ms: u64,
	pub workers: u32,
	pub claim_lease_seconds: u64,
	/// Ingest answered mail into the knowledge index after the reply is sent.
	#[serde(default)]
	pub archive_answered: bool,
}
impl Default for Orchestrator {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_backoff_ms: 500,
			max_backoff_ms: 30_000,
			workers: 4,
			claim_lease_seconds: 1_800,
			archive_answered: false,
		}
	}
}

pub fn default_instructions() -> String {
	"You are an email assistant. Answer the email below using the context passages when they \
	 are relevant. Keep the tone professional and helpful, acknowledge any action items, and do \
	 not invent facts that are not supported by the context."
		.to_string()
}

fn default_imap_port() -> u16 {
	993
}

fn default_smtp_port() -> u16 {
	587
}

fn default_mailbox() -> String {
	"INBOX".to_string()
}

fn default_poll_interval_ms() -> u64 {
	60_000
}

fn default_mail_timeout_ms() -> u64 {
	30_000
}

fn default_metric() -> String {
	"cosine".to_string()
}

fn default_pinecone_controller() -> String {
	"https://api.pinecone.io".to_string()
}

fn default_namespace() -> String {
	"default".to_string()
}

fn default_pinecone_cloud() -> String {
	"aws".to_string()
}

fn default_pinecone_region() -> String {
	"us-east-1".to_string()
}

fn default_vector_timeout_ms() -> u64 {
	30_000
}
