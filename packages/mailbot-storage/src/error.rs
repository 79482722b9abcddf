use mailbot_domain::VectorStoreError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Sqlx(#[from] sqlx::Error),
	#[error(transparent)]
	VectorStore(#[from] VectorStoreError),
	#[error("Invalid configuration: {0}")]
	InvalidConfig(String),
}
