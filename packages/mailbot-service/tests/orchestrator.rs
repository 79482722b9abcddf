use std::{sync::Arc, time::Duration};

use serde_json::Map;

use mailbot_config::Config;
use mailbot_domain::{
	Claim, DeliveryError, EmbeddingError, GenerationError, InboundMessage, ProcessingStatus,
	SourceDocument, StateStore,
};
use mailbot_service::{Capabilities, Error, Mailbot, Outcome, SkipReason, Stage};
use mailbot_storage::memory::{MemoryStateStore, MemoryVectorStore};
use mailbot_testkit::{FakeChatModel, FakeEmbedder, RecordingMailbox, TEST_DIMENSIONS};

const CUSTOMER: &str = "customer@example.com";

struct Harness {
	bot: Mailbot,
	embedder: Arc<FakeEmbedder>,
	chat: Arc<FakeChatModel>,
	mailbox: Arc<RecordingMailbox>,
	vectors: Arc<MemoryVectorStore>,
	state: Arc<MemoryStateStore>,
}

async fn harness_with(config: Config, chat: FakeChatModel) -> Harness {
	let embedder = Arc::new(FakeEmbedder::new(TEST_DIMENSIONS));
	let chat = Arc::new(chat);
	let mailbox = Arc::new(RecordingMailbox::new());
	let vectors = Arc::new(MemoryVectorStore::new(TEST_DIMENSIONS));
	let state = Arc::new(MemoryStateStore::new());
	let bot = Mailbot::assemble(config, Capabilities {
		embedder: embedder.clone(),
		chat: chat.clone(),
		vectors: vectors.clone(),
		state: state.clone(),
		mailbox: mailbox.clone(),
	})
	.expect("Failed to assemble service.");
	let report = bot
		.ingestor
		.ingest(&[SourceDocument {
			id: "hours".to_string(),
			text: "We are open 9am-5pm ET".to_string(),
			metadata: Map::new(),
		}])
		.await;

	assert!(report.failures.is_empty());

	Harness { bot, embedder, chat, mailbox, vectors, state }
}

async fn harness() -> Harness {
	harness_with(mailbot_testkit::config(), FakeChatModel::new()).await
}

fn hours_question(id: &str) -> InboundMessage {
	mailbot_testkit::inbound(id, CUSTOMER, "Support hours", "What are your support hours?")
}

#[tokio::test]
async fn answers_a_question_once() {
	let h = harness().await;

	h.mailbox.deliver(hours_question("m1"));

	let report = h.bot.orchestrator.poll_once().await.expect("Poll failed.");

	assert_eq!(report.received, 1);
	assert_eq!(report.sent, 1);

	let sent = h.mailbox.sent();

	assert_eq!(sent.len(), 1);
	assert_eq!(sent[0].to, CUSTOMER);
	assert_eq!(sent[0].reply.in_reply_to, "m1");
	assert_eq!(sent[0].reply.subject, "Re: Support hours");
	assert_eq!(sent[0].reply.text, mailbot_testkit::fakes::DEFAULT_REPLY);
	assert!(h.chat.requests()[0].prompt.contains("We are open 9am-5pm ET"));
	assert_eq!(h.mailbox.acknowledged(), vec!["m1".to_string()]);

	let state = h.bot.orchestrator.status("m1").await.expect("Status failed.");

	assert_eq!(state.status, ProcessingStatus::Sent);
	assert_eq!(state.attempts, 0);
	assert_eq!(state.reply_text.as_deref(), Some(mailbot_testkit::fakes::DEFAULT_REPLY));

	let again = h.bot.orchestrator.process(&hours_question("m1")).await.expect("Process failed.");

	assert_eq!(again, Outcome::Skipped(SkipReason::AlreadyFinished(ProcessingStatus::Sent)));
	assert_eq!(h.mailbox.sent().len(), 1);
	assert_eq!(h.chat.calls(), 1);
}

#[tokio::test]
async fn transient_embedding_failures_are_retried() {
	let h = harness().await;

	for _ in 0..2 {
		h.embedder.fail_next(EmbeddingError::Unavailable { message: "503".to_string() });
	}

	let outcome = h.bot.orchestrator.process(&hours_question("m2")).await.expect("Process failed.");

	assert!(matches!(outcome, Outcome::Sent { .. }));

	let state = h.bot.orchestrator.status("m2").await.expect("Status failed.");

	assert_eq!(state.status, ProcessingStatus::Sent);
	assert_eq!(state.attempts, 2);
	assert!(state.last_error.as_deref().is_some_and(|err| err.starts_with("retrieve:")));
	assert_eq!(h.mailbox.sent().len(), 1);
}

#[tokio::test]
async fn content_policy_rejection_fails_without_retry() {
	let h = harness().await;

	h.chat.fail_next(GenerationError::ContentPolicy { message: "Flagged.".to_string() });

	let outcome = h.bot.orchestrator.process(&hours_question("m3")).await.expect("Process failed.");
	let Outcome::Failed(failure) = outcome else {
		panic!("Expected a failed outcome, got {outcome:?}.");
	};

	assert_eq!(failure.stage, Stage::Generate);
	assert_eq!(failure.attempts, 1);
	assert_eq!(h.chat.calls(), 1);
	assert!(h.mailbox.sent().is_empty());
	assert_eq!(h.mailbox.acknowledged(), vec!["m3".to_string()]);

	let state = h.bot.orchestrator.status("m3").await.expect("Status failed.");

	assert_eq!(state.status, ProcessingStatus::Failed);
	assert!(state.last_error.as_deref().is_some_and(|err| err.contains("content policy")));
}

#[tokio::test]
async fn duplicate_delivery_sends_one_reply() {
	let h = harness_with(
		mailbot_testkit::config(),
		FakeChatModel::new().with_delay(Duration::from_millis(50)),
	)
	.await;
	let report = h
		.bot
		.orchestrator
		.process_batch(vec![hours_question("m4"), hours_question("m4")])
		.await;

	assert_eq!(report.received, 2);
	assert_eq!(report.sent, 1);
	assert_eq!(report.skipped, 1);
	assert_eq!(h.mailbox.sent().len(), 1);
	assert_eq!(h.chat.calls(), 1);
}

#[tokio::test]
async fn empty_body_falls_back_to_the_subject() {
	let h = harness().await;
	let message = mailbot_testkit::inbound("m5", CUSTOMER, "support hours open", "   ");
	let outcome = h.bot.orchestrator.process(&message).await.expect("Process failed.");

	assert!(matches!(outcome, Outcome::Sent { .. }));
	assert!(h.chat.requests()[0].prompt.contains("We are open 9am-5pm ET"));
}

#[tokio::test]
async fn message_without_text_fails_as_data_integrity() {
	let h = harness().await;
	let message = mailbot_testkit::inbound("m6", CUSTOMER, "  ", "");
	let outcome = h.bot.orchestrator.process(&message).await.expect("Process failed.");
	let Outcome::Failed(failure) = outcome else {
		panic!("Expected a failed outcome, got {outcome:?}.");
	};

	assert_eq!(failure.stage, Stage::Retrieve);
	assert_eq!(failure.attempts, 1);
	assert_eq!(h.chat.calls(), 0);
}

#[tokio::test]
async fn invalid_recipient_is_fatal() {
	let h = harness().await;
	let message = mailbot_testkit::inbound(
		"m7",
		"not-an-address",
		"Support hours",
		"What are your support hours?",
	);
	let outcome = h.bot.orchestrator.process(&message).await.expect("Process failed.");
	let Outcome::Failed(failure) = outcome else {
		panic!("Expected a failed outcome, got {outcome:?}.");
	};

	assert_eq!(failure.stage, Stage::Deliver);
	assert_eq!(failure.attempts, 1);
	assert!(h.mailbox.sent().is_empty());
}

#[tokio::test]
async fn transient_smtp_failure_is_retried() {
	let h = harness().await;

	h.mailbox.fail_next_send(DeliveryError::Transport { message: "421".to_string() });

	let outcome = h.bot.orchestrator.process(&hours_question("m8")).await.expect("Process failed.");

	assert!(matches!(outcome, Outcome::Sent { .. }));
	assert_eq!(h.mailbox.sent().len(), 1);
	assert_eq!(h.chat.calls(), 1);

	let state = h.bot.orchestrator.status("m8").await.expect("Status failed.");

	assert_eq!(state.attempts, 1);
}

#[tokio::test]
async fn generation_timeouts_are_retried_up_to_the_bound() {
	let mut config = mailbot_testkit::config();

	config.generation.timeout_ms = 20;

	let h =
		harness_with(config, FakeChatModel::new().with_delay(Duration::from_millis(500))).await;
	let outcome = h.bot.orchestrator.process(&hours_question("m9")).await.expect("Process failed.");
	let Outcome::Failed(failure) = outcome else {
		panic!("Expected a failed outcome, got {outcome:?}.");
	};

	assert_eq!(failure.stage, Stage::Generate);
	assert_eq!(failure.attempts, 3);
	assert!(failure.error.contains("timed out"));
}

#[tokio::test]
async fn generated_reply_is_delivered_without_regenerating() {
	let h = harness().await;
	let claim = h.state.claim("m10", time::Duration::minutes(5)).await.expect("Claim failed.");
	let Claim::Acquired(lease) = claim else {
		panic!("Expected a lease, got {claim:?}.");
	};

	h.state
		.advance("m10", lease.token, ProcessingStatus::Pending, ProcessingStatus::Retrieved, None)
		.await
		.expect("Advance failed.");
	h.state
		.advance(
			"m10",
			lease.token,
			ProcessingStatus::Retrieved,
			ProcessingStatus::Generated,
			Some("Stored reply."),
		)
		.await
		.expect("Advance failed.");
	h.state.release("m10", lease.token).await.expect("Release failed.");

	let outcome =
		h.bot.orchestrator.process(&hours_question("m10")).await.expect("Process failed.");
	let Outcome::Sent { reply } = outcome else {
		panic!("Expected a sent outcome, got {outcome:?}.");
	};

	assert_eq!(reply.text, "Stored reply.");
	assert_eq!(h.chat.calls(), 0);
}

#[tokio::test]
async fn reset_returns_a_failed_message_to_pending() {
	let h = harness().await;

	h.chat.fail_next(GenerationError::InvalidRequest { message: "Bad model.".to_string() });

	let outcome =
		h.bot.orchestrator.process(&hours_question("m11")).await.expect("Process failed.");

	assert!(matches!(outcome, Outcome::Failed(_)));

	let state = h.bot.orchestrator.reset("m11").await.expect("Reset failed.");

	assert_eq!(state.status, ProcessingStatus::Pending);
	assert_eq!(state.attempts, 0);
	assert_eq!(state.last_error, None);

	let outcome =
		h.bot.orchestrator.process(&hours_question("m11")).await.expect("Process failed.");

	assert!(matches!(outcome, Outcome::Sent { .. }));
	assert!(matches!(h.bot.orchestrator.reset("m11").await, Err(Error::Conflict { .. })));
	assert!(matches!(h.bot.orchestrator.reset("missing").await, Err(Error::NotFound { .. })));
}

#[tokio::test]
async fn list_filters_by_status() {
	let h = harness().await;

	h.chat.fail_next(GenerationError::ContentPolicy { message: "Flagged.".to_string() });

	let _ = h.bot.orchestrator.process(&hours_question("a")).await.expect("Process failed.");
	let _ = h.bot.orchestrator.process(&hours_question("b")).await.expect("Process failed.");
	let failed = h
		.bot
		.orchestrator
		.list(Some(ProcessingStatus::Failed), 10)
		.await
		.expect("List failed.");
	let all = h.bot.orchestrator.list(None, 10).await.expect("List failed.");

	assert_eq!(failed.len(), 1);
	assert_eq!(failed[0].message_id, "a");
	assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn answered_mail_is_archived_when_enabled() {
	let mut config = mailbot_testkit::config();

	config.orchestrator.archive_answered = true;

	let h = harness_with(config, FakeChatModel::new()).await;
	let before = h.vectors.len();
	let outcome =
		h.bot.orchestrator.process(&hours_question("m12")).await.expect("Process failed.");

	assert!(matches!(outcome, Outcome::Sent { .. }));
	assert!(h.vectors.len() > before);
	assert!(
		h.vectors.get(mailbot_domain::chunk_id_for("m12", 0)).is_some_and(|chunk| {
			chunk.document_id == "m12"
		})
	);
}

#[tokio::test]
async fn mismatched_dimensions_are_rejected_at_assembly() {
	let result = Mailbot::assemble(mailbot_testkit::config(), Capabilities {
		embedder: Arc::new(FakeEmbedder::new(TEST_DIMENSIONS)),
		chat: Arc::new(FakeChatModel::new()),
		vectors: Arc::new(MemoryVectorStore::new(TEST_DIMENSIONS + 1)),
		state: Arc::new(MemoryStateStore::new()),
		mailbox: Arc::new(RecordingMailbox::new()),
	});

	assert!(matches!(result, Err(Error::InvalidRequest { .. })));
}

#[tokio::test]
async fn run_stops_on_shutdown() {
	let h = harness().await;

	h.mailbox.deliver(hours_question("m13"));

	let (tx, rx) = tokio::sync::oneshot::channel::<()>();
	let loop_handle = tokio::spawn(Arc::clone(&h.bot.orchestrator).run(async move {
		let _ = rx.await;
	}));

	for _ in 0..100 {
		if !h.mailbox.sent().is_empty() {
			break;
		}

		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	let _ = tx.send(());

	tokio::time::timeout(Duration::from_secs(5), loop_handle)
		.await
		.expect("Poll loop did not stop.")
		.expect("Poll loop panicked.");

	assert_eq!(h.mailbox.sent().len(), 1);
}
