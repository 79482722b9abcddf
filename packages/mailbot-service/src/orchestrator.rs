use std::{fmt::Display, future::Future, sync::Arc, time::Duration};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::{sync::Semaphore, task::JoinSet};
use uuid::Uuid;

use crate::{
	Error, Result,
	gateway::{self, Inbox},
	generator::Generator,
	ingest::{self, Ingestor},
	retriever::Retriever,
	retry::{RetryDecision, RetryPolicy, sanitize_error},
};
use mailbot_domain::{
	Claim, Classify, GeneratedReply, InboundMessage, Lease, Mailbox, ProcessingState,
	ProcessingStatus, StateStore, StateStoreError,
};

pub const ALERT_TARGET: &str = "mailbot::alert";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
	Retrieve,
	Generate,
	Deliver,
}
impl Stage {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Retrieve => "retrieve",
			Self::Generate => "generate",
			Self::Deliver => "deliver",
		}
	}
}

/// Why a message ended in `failed`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Failure {
	pub stage: Stage,
	/// Failed attempts recorded for the message, across all stages.
	pub attempts: u32,
	pub error: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
	/// Another worker holds the lease.
	InFlight,
	AlreadyFinished(ProcessingStatus),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
	Sent { reply: GeneratedReply },
	Failed(Failure),
	Skipped(SkipReason),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
	pub received: usize,
	pub sent: usize,
	pub failed: usize,
	pub skipped: usize,
	/// Messages whose processing stopped on a state store error. They are retried on a later
	/// poll once their lease is released.
	pub errors: usize,
}
impl BatchReport {
	fn record(&mut self, outcome: &Outcome) {
		match outcome {
			Outcome::Sent { .. } => self.sent += 1,
			Outcome::Failed(_) => self.failed += 1,
			Outcome::Skipped(_) => self.skipped += 1,
		}
	}
}

enum Halt {
	Failed(Failure),
	Store(StateStoreError),
}
impl From<StateStoreError> for Halt {
	fn from(err: StateStoreError) -> Self {
		Self::Store(err)
	}
}

/// Drives each message through retrieve, generate and deliver exactly once.
pub struct Orchestrator {
	pub(crate) retriever: Retriever,
	pub(crate) generator: Generator,
	pub(crate) state: Arc<dyn StateStore>,
	pub(crate) mailbox: Arc<dyn Mailbox>,
	pub(crate) archive: Option<Arc<Ingestor>>,
	pub(crate) policy: RetryPolicy,
	pub(crate) lease: time::Duration,
	pub(crate) workers: usize,
	pub(crate) top_k: u32,
	pub(crate) poll_interval: Duration,
}
impl Orchestrator {
	pub async fn process(&self, message: &InboundMessage) -> Result<Outcome> {
		let lease = match self.state.claim(&message.id, self.lease).await? {
			Claim::Acquired(lease) => lease,
			Claim::InFlight => {
				tracing::debug!(message_id = %message.id, "Message is in flight elsewhere.");

				return Ok(Outcome::Skipped(SkipReason::InFlight));
			},
			Claim::Finished(status) => {
				tracing::debug!(message_id = %message.id, %status, "Message already finished.");
				self.acknowledge(&message.id).await;

				return Ok(Outcome::Skipped(SkipReason::AlreadyFinished(status)));
			},
		};
		let outcome = match self.drive(message, &lease).await {
			Ok(outcome) => outcome,
			Err(Halt::Failed(failure)) => Outcome::Failed(failure),
			Err(Halt::Store(err)) => {
				if let Err(release_err) = self.state.release(&message.id, lease.token).await {
					tracing::warn!(
						message_id = %message.id,
						error = %release_err,
						"Failed to release the message lease."
					);
				}

				return Err(err.into());
			},
		};

		if matches!(outcome, Outcome::Sent { .. } | Outcome::Failed(_)) {
			self.acknowledge(&message.id).await;
		}
		if let Outcome::Sent { .. } = &outcome {
			tracing::info!(message_id = %message.id, "Reply sent.");
			self.archive(message).await;
		}

		Ok(outcome)
	}

	/// Processes `messages` on at most `workers` concurrent tasks.
	pub async fn process_batch(self: &Arc<Self>, messages: Vec<InboundMessage>) -> BatchReport {
		let permits = Arc::new(Semaphore::new(self.workers));
		let mut tasks = JoinSet::new();
		let mut report = BatchReport { received: messages.len(), ..Default::default() };

		for message in messages {
			let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
				break;
			};
			let orchestrator = Arc::clone(self);

			tasks.spawn(async move {
				let _permit = permit;
				let outcome = orchestrator.process(&message).await;

				(message.id, outcome)
			});
		}

		while let Some(joined) = tasks.join_next().await {
			match joined {
				Ok((_, Ok(outcome))) => report.record(&outcome),
				Ok((message_id, Err(err))) => {
					report.errors += 1;

					tracing::warn!(%message_id, error = %err, "Failed to process message.");
				},
				Err(err) => {
					report.errors += 1;

					tracing::error!(error = %err, "Message task aborted.");
				},
			}
		}

		report
	}

	/// Fetches unseen mail once and processes it.
	pub async fn poll_once(self: &Arc<Self>) -> Result<BatchReport> {
		let messages = self.mailbox.fetch_unseen().await?;
		let report = self.process_batch(messages).await;

		tracing::info!(
			received = report.received,
			sent = report.sent,
			failed = report.failed,
			skipped = report.skipped,
			errors = report.errors,
			"Poll finished."
		);

		Ok(report)
	}

	/// Polls the mailbox until `shutdown` resolves. A batch in progress runs to completion.
	pub async fn run<S>(self: Arc<Self>, shutdown: S)
	where
		S: Future<Output = ()>,
	{
		let mut inbox = Inbox::new(Arc::clone(&self.mailbox), self.poll_interval);

		tokio::pin!(shutdown);

		tracing::info!(
			poll_interval_ms = self.poll_interval.as_millis() as u64,
			workers = self.workers,
			"Poll loop started."
		);

		loop {
			tokio::select! {
				_ = &mut shutdown => break,
				batch = inbox.next_batch() => {
					let report = self.process_batch(batch).await;

					tracing::info!(
						received = report.received,
						sent = report.sent,
						failed = report.failed,
						skipped = report.skipped,
						errors = report.errors,
						"Batch processed."
					);
				},
			}
		}

		tracing::info!("Poll loop stopped.");
	}

	pub async fn status(&self, message_id: &str) -> Result<ProcessingState> {
		self.state
			.get(message_id)
			.await?
			.ok_or_else(|| Error::NotFound { message: format!("Unknown message {message_id:?}.") })
	}

	pub async fn list(
		&self,
		status: Option<ProcessingStatus>,
		limit: u32,
	) -> Result<Vec<ProcessingState>> {
		Ok(self.state.list(status, limit).await?)
	}

	/// Returns a failed message to `pending` so the next poll that sees it starts over.
	pub async fn reset(&self, message_id: &str) -> Result<ProcessingState> {
		let state = self.state.reset(message_id).await?;

		tracing::info!(message_id, "Message reset to pending.");

		Ok(state)
	}

	async fn drive(
		&self,
		message: &InboundMessage,
		lease: &Lease,
	) -> std::result::Result<Outcome, Halt> {
		let id = message.id.as_str();
		let token = lease.token;
		let mut status = lease.state.status;
		let mut reply_text = lease.state.reply_text.clone();
		let mut context = None;
		let retriever = &self.retriever;
		let generator = &self.generator;
		let top_k = self.top_k;

		if status == ProcessingStatus::Pending {
			let retrieved = self
				.run_stage(id, token, Stage::Retrieve, move || retriever.retrieve(message, top_k))
				.await?;

			tracing::debug!(message_id = id, matches = retrieved.len(), "Context retrieved.");
			self.state
				.advance(id, token, ProcessingStatus::Pending, ProcessingStatus::Retrieved, None)
				.await?;

			context = Some(retrieved);
			status = ProcessingStatus::Retrieved;
		}
		if status == ProcessingStatus::Retrieved {
			// Context is not persisted, so a resumed record retrieves again.
			let context = match context {
				Some(context) => context,
				None =>
					self.run_stage(id, token, Stage::Retrieve, move || {
						retriever.retrieve(message, top_k)
					})
					.await?,
			};
			let context = &context;
			let reply = self
				.run_stage(id, token, Stage::Generate, move || generator.generate(message, context))
				.await?;

			self.state
				.advance(
					id,
					token,
					ProcessingStatus::Retrieved,
					ProcessingStatus::Generated,
					Some(&reply.text),
				)
				.await?;

			reply_text = Some(reply.text);
			status = ProcessingStatus::Generated;
		}
		if status == ProcessingStatus::Generated {
			let Some(text) = reply_text else {
				return Err(self
					.give_up(id, token, Stage::Deliver, "Generated record has no reply text.")
					.await);
			};
			let reply = GeneratedReply::for_message(message, text, OffsetDateTime::now_utc());
			let mailbox = self.mailbox.as_ref();
			let reply_ref = &reply;
			let to = message.sender.as_str();

			self.run_stage(id, token, Stage::Deliver, move || {
				gateway::deliver(mailbox, reply_ref, to)
			})
			.await?;
			self.state
				.advance(id, token, ProcessingStatus::Generated, ProcessingStatus::Sent, None)
				.await?;

			return Ok(Outcome::Sent { reply });
		}

		Ok(Outcome::Skipped(SkipReason::AlreadyFinished(status)))
	}

	/// Runs one stage under the retry policy, recording every failed attempt.
	async fn run_stage<T, E, F, Fut>(
		&self,
		message_id: &str,
		token: Uuid,
		stage: Stage,
		mut op: F,
	) -> std::result::Result<T, Halt>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = std::result::Result<T, E>>,
		E: Classify + Display,
	{
		let mut attempt = 0;

		loop {
			attempt += 1;

			let err = match op().await {
				Ok(value) => return Ok(value),
				Err(err) => err,
			};
			let class = err.classify();
			let decision = self.policy.decide(class, attempt);
			let error = sanitize_error(&format!("{}: {err}", stage.as_str()));
			let state = self
				.state
				.record_failure(message_id, token, &error, decision == RetryDecision::GiveUp)
				.await?;

			match decision {
				RetryDecision::Retry(delay) => {
					tracing::warn!(
						message_id,
						stage = stage.as_str(),
						attempt,
						class = class.as_str(),
						delay_ms = delay.as_millis() as u64,
						error = %error,
						"Stage failed, retrying."
					);
					tokio::time::sleep(delay).await;
				},
				RetryDecision::GiveUp => {
					alert(message_id, stage, state.attempts, &error);

					return Err(Halt::Failed(Failure { stage, attempts: state.attempts, error }));
				},
			}
		}
	}

	async fn give_up(&self, message_id: &str, token: Uuid, stage: Stage, reason: &str) -> Halt {
		let error = format!("{}: {reason}", stage.as_str());

		match self.state.record_failure(message_id, token, &error, true).await {
			Ok(state) => {
				alert(message_id, stage, state.attempts, &error);

				Halt::Failed(Failure { stage, attempts: state.attempts, error })
			},
			Err(err) => Halt::Store(err),
		}
	}

	async fn acknowledge(&self, message_id: &str) {
		if let Err(err) = self.mailbox.acknowledge(message_id).await {
			tracing::warn!(message_id, error = %err, "Failed to mark message as read.");
		}
	}

	async fn archive(&self, message: &InboundMessage) {
		let Some(ingestor) = &self.archive else {
			return;
		};
		let report = ingestor.ingest(&[ingest::document_from_message(message)]).await;

		if !report.failures.is_empty() {
			tracing::warn!(
				message_id = %message.id,
				failures = report.failures.len(),
				"Failed to archive answered message."
			);
		}
	}
}

fn alert(message_id: &str, stage: Stage, attempts: u32, error: &str) {
	tracing::error!(
		target: ALERT_TARGET,
		message_id,
		stage = stage.as_str(),
		attempts,
		error,
		"Message moved to failed."
	);
}
