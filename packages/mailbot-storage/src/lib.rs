pub mod db;
pub mod memory;
pub mod pinecone;
pub mod qdrant;
pub mod schema;
pub mod state;

mod error;

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

use std::sync::Arc;

use mailbot_config::{StateStorage, VectorStorage};
use mailbot_domain::{StateStore, VectorStore};

/// Opens the ProcessingState backend named by `storage.state.backend`.
pub async fn connect_state_store(cfg: &StateStorage) -> Result<Arc<dyn StateStore>> {
	match (cfg.backend.as_str(), cfg.postgres.as_ref()) {
		("memory", _) => Ok(Arc::new(memory::MemoryStateStore::new())),
		("postgres", Some(postgres)) => {
			let db = db::Db::connect(postgres).await?;

			db.ensure_schema().await?;

			Ok(Arc::new(state::PgStateStore::new(db)))
		},
		(backend, _) =>
			Err(Error::InvalidConfig(format!("Unsupported state backend {backend:?}."))),
	}
}

/// Opens the vector index named by `storage.vector.backend`.
pub async fn connect_vector_store(cfg: &VectorStorage) -> Result<Arc<dyn VectorStore>> {
	match cfg.backend.as_str() {
		"memory" => Ok(Arc::new(memory::MemoryVectorStore::new(cfg.dimensions))),
		"pinecone" => {
			let pinecone = cfg.pinecone.as_ref().ok_or_else(|| {
				Error::InvalidConfig("storage.vector.pinecone is missing.".to_string())
			})?;
			let store =
				pinecone::PineconeStore::connect(pinecone, cfg.dimensions, &cfg.metric).await?;

			Ok(Arc::new(store))
		},
		"qdrant" => {
			let qdrant = cfg.qdrant.as_ref().ok_or_else(|| {
				Error::InvalidConfig("storage.vector.qdrant is missing.".to_string())
			})?;
			let store = qdrant::QdrantStore::connect(qdrant, cfg.dimensions, &cfg.metric).await?;

			Ok(Arc::new(store))
		},
		backend => Err(Error::InvalidConfig(format!("Unsupported vector backend {backend:?}."))),
	}
}
