use mailbot_domain::{MailError, StateStoreError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error("Not found: {message}")]
	NotFound { message: String },
	#[error("Conflict: {message}")]
	Conflict { message: String },
	#[error("Provider error: {message}")]
	Provider { message: String },
	#[error("Storage error: {message}")]
	Storage { message: String },
	#[error("Mail error: {message}")]
	Mail { message: String },
}
impl From<StateStoreError> for Error {
	fn from(err: StateStoreError) -> Self {
		match err {
			StateStoreError::NotFound { .. } => Self::NotFound { message: err.to_string() },
			StateStoreError::Conflict { .. } | StateStoreError::InvalidTransition { .. } =>
				Self::Conflict { message: err.to_string() },
			StateStoreError::Backend { .. } | StateStoreError::LeaseLost { .. } =>
				Self::Storage { message: err.to_string() },
		}
	}
}

impl From<MailError> for Error {
	fn from(err: MailError) -> Self {
		Self::Mail { message: err.to_string() }
	}
}

impl From<mailbot_storage::Error> for Error {
	fn from(err: mailbot_storage::Error) -> Self {
		match err {
			mailbot_storage::Error::InvalidConfig(message) => Self::InvalidRequest { message },
			other => Self::Storage { message: other.to_string() },
		}
	}
}

impl From<mailbot_providers::Error> for Error {
	fn from(err: mailbot_providers::Error) -> Self {
		Self::Provider { message: err.to_string() }
	}
}

impl From<mailbot_mail::Error> for Error {
	fn from(err: mailbot_mail::Error) -> Self {
		Self::Mail { message: err.to_string() }
	}
}
