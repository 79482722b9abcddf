use std::{fmt::Display, future::Future, time::Duration};

use mailbot_config::Orchestrator;
use mailbot_domain::{Classify, ErrorClass};

pub const MAX_ERROR_CHARS: usize = 1_024;

const MAX_BACKOFF_EXPONENT: u32 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
	Retry(Duration),
	GiveUp,
}

/// Bounded exponential backoff shared by every external call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub base_backoff: Duration,
	pub max_backoff: Duration,
}
impl RetryPolicy {
	pub fn from_config(cfg: &Orchestrator) -> Self {
		Self {
			max_attempts: cfg.max_attempts.max(1),
			base_backoff: Duration::from_millis(cfg.base_backoff_ms),
			max_backoff: Duration::from_millis(cfg.max_backoff_ms),
		}
	}

	/// `base * 2^(attempt - 1)`, capped at `max_backoff`.
	pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
		let exp = attempt.max(1).saturating_sub(1).min(MAX_BACKOFF_EXPONENT);

		self.base_backoff.saturating_mul(1 << exp).min(self.max_backoff)
	}

	/// What to do after `attempt` (1-based) failed with an error of `class`.
	pub fn decide(&self, class: ErrorClass, attempt: u32) -> RetryDecision {
		if class.is_retryable() && attempt < self.max_attempts {
			RetryDecision::Retry(self.backoff_for_attempt(attempt))
		} else {
			RetryDecision::GiveUp
		}
	}

	/// Runs `op` until it succeeds or the policy gives up, returning the last error.
	pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, E>>,
		E: Classify + Display,
	{
		let mut attempt = 0;

		loop {
			attempt += 1;

			let err = match op().await {
				Ok(value) => return Ok(value),
				Err(err) => err,
			};

			match self.decide(err.classify(), attempt) {
				RetryDecision::Retry(delay) => {
					tracing::warn!(
						attempt,
						delay_ms = delay.as_millis() as u64,
						error = %err,
						"Retrying after a transient failure."
					);
					tokio::time::sleep(delay).await;
				},
				RetryDecision::GiveUp => return Err(err),
			}
		}
	}
}

/// Redacts credentials and bounds the length of error text before it is stored or logged.
pub fn sanitize_error(text: &str) -> String {
	let mut parts = Vec::new();
	let mut redact_next = false;

	for raw in text.split_whitespace() {
		let mut word = raw.to_string();

		if redact_next {
			word = "[REDACTED]".to_string();
			redact_next = false;
		}
		if raw.eq_ignore_ascii_case("bearer") {
			redact_next = true;
		}

		let lowered = raw.to_ascii_lowercase();

		for key in ["api_key", "apikey", "password", "secret", "token"] {
			if lowered.contains(key) && (lowered.contains('=') || lowered.contains(':')) {
				let sep = if raw.contains('=') { '=' } else { ':' };
				let prefix = raw.split(sep).next().unwrap_or(raw);

				word = format!("{prefix}{sep}[REDACTED]");

				break;
			}
		}

		parts.push(word);
	}

	let mut out = parts.join(" ");

	if out.chars().count() > MAX_ERROR_CHARS {
		out = out.chars().take(MAX_ERROR_CHARS).collect();
		out.push_str("...");
	}

	out
}
