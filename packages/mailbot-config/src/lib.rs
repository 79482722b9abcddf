mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Chunking, Config, EmbeddingProviderConfig, Generation, LlmProviderConfig, Mail, Orchestrator,
	Pinecone, Postgres, Providers, Qdrant, Retrieval, Service, StateStorage, Storage,
	VectorStorage, default_instructions,
};

use std::{env, fs, path::Path};

pub const ENV_EMAIL_ADDRESS: &str = "EMAIL_ADDRESS";
pub const ENV_EMAIL_PASSWORD: &str = "EMAIL_PASSWORD";
pub const ENV_PINECONE_API_KEY: &str = "PINECONE_API_KEY";
pub const ENV_PINECONE_ENVIRONMENT: &str = "PINECONE_ENVIRONMENT";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_PORT: &str = "PORT";
/// Largest upsert the vector backends accept in one request.
pub const MAX_UPSERT_BATCH_SIZE: u32 = 100;

const EMBEDDING_PROVIDERS: [&str; 2] = ["openai", "ollama"];
const LLM_PROVIDERS: [&str; 2] = ["openai", "anthropic"];

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;
	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	apply_env_overrides(&mut cfg, |key| env::var(key).ok())?;
	normalize(&mut cfg);
	validate(&cfg)?;

	Ok(cfg)
}

/// Applies the deployment environment on top of the file configuration.
///
/// `lookup` returns the value of an environment variable, if set. Empty values are ignored.
pub fn apply_env_overrides<F>(cfg: &mut Config, lookup: F) -> Result<()>
where
	F: Fn(&str) -> Option<String>,
{
	let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

	if let Some(address) = lookup(ENV_EMAIL_ADDRESS) {
		cfg.mail.address = address;
	}
	if let Some(password) = lookup(ENV_EMAIL_PASSWORD) {
		cfg.mail.password = password;
	}
	if let Some(pinecone) = cfg.storage.vector.pinecone.as_mut() {
		if let Some(api_key) = lookup(ENV_PINECONE_API_KEY) {
			pinecone.api_key = api_key;
		}
		if let Some(environment) = lookup(ENV_PINECONE_ENVIRONMENT) {
			pinecone.environment = environment;
		}
	}
	if let Some(api_key) = lookup(ENV_OPENAI_API_KEY) {
		if cfg.providers.embedding.provider_id == "openai" {
			cfg.providers.embedding.api_key = api_key.clone();
		}
		if cfg.providers.llm.provider_id == "openai" {
			cfg.providers.llm.api_key = api_key;
		}
	}
	if let Some(port) = lookup(ENV_PORT) {
		let port: u16 = port.trim().parse().map_err(|_| Error::Validation {
			message: format!("{ENV_PORT} must be a valid TCP port, got {port:?}."),
		})?;
		let host = match cfg.service.http_bind.rsplit_once(':') {
			Some((host, _)) if !host.is_empty() => host.to_string(),
			_ => "0.0.0.0".to_string(),
		};

		cfg.service.http_bind = format!("{host}:{port}");
	}

	Ok(())
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.service.http_bind.trim().is_empty() {
		return Err(validation("service.http_bind must be non-empty."));
	}
	if cfg.mail.address.trim().is_empty() {
		return Err(validation("mail.address must be non-empty. Set EMAIL_ADDRESS."));
	}
	if cfg.mail.password.trim().is_empty() {
		return Err(validation("mail.password must be non-empty. Set EMAIL_PASSWORD."));
	}
	if cfg.mail.imap_host.trim().is_empty() || cfg.mail.smtp_host.trim().is_empty() {
		return Err(validation("mail.imap_host and mail.smtp_host must be non-empty."));
	}
	if cfg.mail.poll_interval_ms == 0 {
		return Err(validation("mail.poll_interval_ms must be greater than zero."));
	}

	validate_storage(cfg)?;
	validate_providers(cfg)?;

	if cfg.chunking.window_chars == 0 {
		return Err(validation("chunking.window_chars must be greater than zero."));
	}
	if cfg.chunking.overlap_chars >= cfg.chunking.window_chars {
		return Err(validation("chunking.overlap_chars must be less than chunking.window_chars."));
	}
	if cfg.chunking.upsert_batch_size == 0 {
		return Err(validation("chunking.upsert_batch_size must be greater than zero."));
	}
	if cfg.chunking.upsert_batch_size > MAX_UPSERT_BATCH_SIZE {
		return Err(validation("chunking.upsert_batch_size must be at most 100."));
	}
	if cfg.retrieval.top_k == 0 {
		return Err(validation("retrieval.top_k must be greater than zero."));
	}
	if !cfg.retrieval.subject_weight.is_finite()
		|| !(0.0..=1.0).contains(&cfg.retrieval.subject_weight)
	{
		return Err(validation("retrieval.subject_weight must be in the range 0.0-1.0."));
	}
	if cfg.generation.max_prompt_chars == 0 {
		return Err(validation("generation.max_prompt_chars must be greater than zero."));
	}
	if cfg.generation.timeout_ms == 0 {
		return Err(validation("generation.timeout_ms must be greater than zero."));
	}
	if cfg.orchestrator.max_attempts == 0 {
		return Err(validation("orchestrator.max_attempts must be greater than zero."));
	}
	if cfg.orchestrator.workers == 0 {
		return Err(validation("orchestrator.workers must be greater than zero."));
	}
	if cfg.orchestrator.base_backoff_ms > cfg.orchestrator.max_backoff_ms {
		return Err(validation(
			"orchestrator.base_backoff_ms must not exceed orchestrator.max_backoff_ms.",
		));
	}
	if cfg.orchestrator.claim_lease_seconds == 0 {
		return Err(validation("orchestrator.claim_lease_seconds must be greater than zero."));
	}

	Ok(())
}

fn validate_storage(cfg: &Config) -> Result<()> {
	let state = &cfg.storage.state;

	match state.backend.as_str() {
		"memory" => {},
		"postgres" => {
			let Some(postgres) = state.postgres.as_ref() else {
				return Err(validation(
					"storage.state.postgres is required when storage.state.backend is postgres.",
				));
			};

			if postgres.dsn.trim().is_empty() {
				return Err(validation("storage.state.postgres.dsn must be non-empty."));
			}
			if postgres.pool_max_conns == 0 {
				return Err(validation(
					"storage.state.postgres.pool_max_conns must be greater than zero.",
				));
			}
		},
		_ => {
			return Err(validation("storage.state.backend must be one of memory or postgres."));
		},
	}

	let vector = &cfg.storage.vector;

	if vector.dimensions == 0 {
		return Err(validation("storage.vector.dimensions must be greater than zero."));
	}
	if vector.dimensions != cfg.providers.embedding.dimensions {
		return Err(validation(
			"providers.embedding.dimensions must match storage.vector.dimensions.",
		));
	}
	if !matches!(vector.metric.as_str(), "cosine" | "dotproduct" | "euclidean") {
		return Err(validation(
			"storage.vector.metric must be one of cosine, dotproduct, or euclidean.",
		));
	}

	match vector.backend.as_str() {
		"memory" => {},
		"pinecone" => {
			let Some(pinecone) = vector.pinecone.as_ref() else {
				return Err(validation(
					"storage.vector.pinecone is required when storage.vector.backend is pinecone.",
				));
			};

			if pinecone.api_key.trim().is_empty() {
				return Err(validation(
					"storage.vector.pinecone.api_key must be non-empty. Set PINECONE_API_KEY.",
				));
			}
			if pinecone.index_name.trim().is_empty() {
				return Err(validation("storage.vector.pinecone.index_name must be non-empty."));
			}
		},
		"qdrant" => {
			let Some(qdrant) = vector.qdrant.as_ref() else {
				return Err(validation(
					"storage.vector.qdrant is required when storage.vector.backend is qdrant.",
				));
			};

			if qdrant.url.trim().is_empty() || qdrant.collection.trim().is_empty() {
				return Err(validation(
					"storage.vector.qdrant.url and storage.vector.qdrant.collection must be non-empty.",
				));
			}
		},
		_ => {
			return Err(validation(
				"storage.vector.backend must be one of pinecone, qdrant, or memory.",
			));
		},
	}

	Ok(())
}

fn validate_providers(cfg: &Config) -> Result<()> {
	let embedding = &cfg.providers.embedding;
	let llm = &cfg.providers.llm;

	if !EMBEDDING_PROVIDERS.contains(&embedding.provider_id.as_str()) {
		return Err(validation("providers.embedding.provider_id must be one of openai or ollama."));
	}
	if !LLM_PROVIDERS.contains(&llm.provider_id.as_str()) {
		return Err(validation("providers.llm.provider_id must be one of openai or anthropic."));
	}
	if embedding.provider_id != "ollama" && embedding.api_key.trim().is_empty() {
		return Err(validation("providers.embedding.api_key must be non-empty."));
	}
	if llm.api_key.trim().is_empty() {
		return Err(validation("providers.llm.api_key must be non-empty."));
	}
	if embedding.timeout_ms == 0 || llm.timeout_ms == 0 {
		return Err(validation("Provider timeout_ms must be greater than zero."));
	}
	if llm.max_output_tokens == 0 {
		return Err(validation("providers.llm.max_output_tokens must be greater than zero."));
	}
	if !llm.temperature.is_finite() || !(0.0..=2.0).contains(&llm.temperature) {
		return Err(validation("providers.llm.temperature must be in the range 0.0-2.0."));
	}

	for (label, headers) in
		[("embedding", &embedding.default_headers), ("llm", &llm.default_headers)]
	{
		if headers.values().any(|value| !value.is_string()) {
			return Err(validation(format!(
				"providers.{label}.default_headers values must be strings."
			)));
		}
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	cfg.mail.address = cfg.mail.address.trim().to_string();
	cfg.providers.embedding.api_base =
		cfg.providers.embedding.api_base.trim_end_matches('/').to_string();
	cfg.providers.llm.api_base = cfg.providers.llm.api_base.trim_end_matches('/').to_string();

	if let Some(pinecone) = cfg.storage.vector.pinecone.as_mut() {
		pinecone.controller_url = pinecone.controller_url.trim_end_matches('/').to_string();

		if pinecone.index_host.as_deref().map(|host| host.trim().is_empty()).unwrap_or(false) {
			pinecone.index_host = None;
		}
		if let Some(host) = pinecone.index_host.as_mut() {
			*host = host.trim_end_matches('/').to_string();
		}
	}
	if cfg.generation.instructions.trim().is_empty() {
		cfg.generation.instructions = default_instructions();
	}
}

fn validation(message: impl Into<String>) -> Error {
	Error::Validation { message: message.into() }
}
