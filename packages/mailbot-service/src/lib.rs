pub mod gateway;
pub mod generator;
pub mod ingest;
pub mod orchestrator;
pub mod retriever;
pub mod retry;

mod error;

pub use error::{Error, Result};
pub use gateway::Inbox;
pub use generator::Generator;
pub use ingest::{IngestFailure, IngestReport, IngestStage, Ingestor};
pub use orchestrator::{BatchReport, Failure, Orchestrator, Outcome, SkipReason, Stage};
pub use retriever::Retriever;
pub use retry::{RetryDecision, RetryPolicy};

use std::{sync::Arc, time::Duration};

use mailbot_chunking::ChunkingConfig;
use mailbot_config::Config;
use mailbot_domain::{ChatModel, Embedder, Mailbox, StateStore, VectorStore};

/// External collaborators the service runs against.
#[derive(Clone)]
pub struct Capabilities {
	pub embedder: Arc<dyn Embedder>,
	pub chat: Arc<dyn ChatModel>,
	pub vectors: Arc<dyn VectorStore>,
	pub state: Arc<dyn StateStore>,
	pub mailbox: Arc<dyn Mailbox>,
}

pub struct Mailbot {
	pub config: Config,
	pub orchestrator: Arc<Orchestrator>,
	pub ingestor: Arc<Ingestor>,
	pub mailbox: Arc<dyn Mailbox>,
	pub state: Arc<dyn StateStore>,
}
impl Mailbot {
	/// Connects every configured backend and provider.
	pub async fn from_config(config: Config) -> Result<Self> {
		let embedder = mailbot_providers::embedder(&config.providers.embedding)?;
		let chat = mailbot_providers::chat_model(&config.providers.llm)?;
		let vectors = mailbot_storage::connect_vector_store(&config.storage.vector).await?;
		let state = mailbot_storage::connect_state_store(&config.storage.state).await?;
		let mailbox = Arc::new(mailbot_mail::ImapSmtpMailbox::new(&config.mail)?);

		tracing::info!(
			embedding = %config.providers.embedding.provider_id,
			llm = %config.providers.llm.provider_id,
			vector_backend = %config.storage.vector.backend,
			state_backend = %config.storage.state.backend,
			"Service backends connected."
		);

		Self::assemble(config, Capabilities { embedder, chat, vectors, state, mailbox })
	}

	pub fn assemble(config: Config, caps: Capabilities) -> Result<Self> {
		if caps.embedder.dimensions() != caps.vectors.dimensions() {
			return Err(Error::InvalidRequest {
				message: format!(
					"Embedding dimension {} does not match vector index dimension {}.",
					caps.embedder.dimensions(),
					caps.vectors.dimensions()
				),
			});
		}

		let policy = RetryPolicy::from_config(&config.orchestrator);
		let ingestor = Arc::new(Ingestor::new(
			Arc::clone(&caps.embedder),
			Arc::clone(&caps.vectors),
			ChunkingConfig {
				window_chars: config.chunking.window_chars,
				overlap_chars: config.chunking.overlap_chars,
			},
			config.chunking.upsert_batch_size,
			policy,
		));
		let orchestrator = Arc::new(Orchestrator {
			retriever: Retriever::new(
				Arc::clone(&caps.embedder),
				Arc::clone(&caps.vectors),
				config.retrieval.subject_weight,
			),
			generator: Generator::new(caps.chat, &config.generation, &config.providers.llm),
			state: Arc::clone(&caps.state),
			mailbox: Arc::clone(&caps.mailbox),
			archive: config.orchestrator.archive_answered.then(|| Arc::clone(&ingestor)),
			policy,
			lease: time::Duration::seconds(config.orchestrator.claim_lease_seconds as i64),
			workers: config.orchestrator.workers.max(1) as usize,
			top_k: config.retrieval.top_k,
			poll_interval: Duration::from_millis(config.mail.poll_interval_ms),
		});

		Ok(Self { config, orchestrator, ingestor, mailbox: caps.mailbox, state: caps.state })
	}
}
