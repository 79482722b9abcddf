use std::sync::Arc;

use serde_json::Map;
use uuid::Uuid;

use mailbot_config::Generation;
use mailbot_domain::{DocumentChunk, GenerationError, RetrievalResult, RetrievedChunk};
use mailbot_service::Generator;
use mailbot_testkit::FakeChatModel;

const INSTRUCTIONS: &str = "Be brief.";
const EMAIL: &str = "Email:\nSubject: Hours\n\nWhen are you open?";

fn retrieved(text: &str, score: f32) -> RetrievedChunk {
	RetrievedChunk {
		chunk: DocumentChunk {
			chunk_id: Uuid::new_v4(),
			document_id: "faq".to_string(),
			text: text.to_string(),
			embedding: Vec::new(),
			metadata: Map::new(),
		},
		score,
	}
}

fn generator(chat: FakeChatModel, max_prompt_chars: usize) -> Generator {
	let cfg = Generation {
		instructions: INSTRUCTIONS.to_string(),
		max_prompt_chars: max_prompt_chars as u32,
		timeout_ms: 1_000,
	};

	Generator::new(Arc::new(chat), &cfg, &mailbot_testkit::config().providers.llm)
}

fn context() -> RetrievalResult {
	RetrievalResult::new(vec![
		retrieved("Open weekdays 9am-5pm ET.", 0.9),
		retrieved("Parking is behind the building.", 0.5),
		retrieved("Closed on public holidays.", 0.7),
	])
}

fn message() -> mailbot_domain::InboundMessage {
	mailbot_testkit::inbound("m1", "customer@example.com", "Hours", "When are you open?")
}

#[test]
fn prompt_carries_context_then_email() {
	let request = generator(FakeChatModel::new(), 10_000).build_request(&message(), &context());

	assert_eq!(request.system, INSTRUCTIONS);
	assert_eq!(
		request.prompt,
		format!(
			"Context:\n[1] Open weekdays 9am-5pm ET.\n\n[2] Parking is behind the building.\n\n\
			 [3] Closed on public holidays.\n\n{EMAIL}"
		)
	);
}

#[test]
fn lowest_scoring_context_is_dropped_first() {
	let expected = format!(
		"Context:\n[1] Open weekdays 9am-5pm ET.\n\n[2] Closed on public holidays.\n\n{EMAIL}"
	);
	let budget = INSTRUCTIONS.chars().count() + expected.chars().count();
	let request = generator(FakeChatModel::new(), budget).build_request(&message(), &context());

	assert_eq!(request.prompt, expected);
}

#[test]
fn oversized_email_is_sent_without_context() {
	let request = generator(FakeChatModel::new(), 5).build_request(&message(), &context());

	assert_eq!(request.prompt, EMAIL);
}

#[tokio::test]
async fn reply_threads_onto_the_message() {
	let reply = generator(FakeChatModel::with_reply("  We open at 9am.  "), 10_000)
		.generate(&message(), &context())
		.await
		.expect("Generation failed.");

	assert_eq!(reply.text, "We open at 9am.");
	assert_eq!(reply.subject, "Re: Hours");
	assert_eq!(reply.in_reply_to, "m1");
	assert_eq!(reply.references, vec!["m1".to_string()]);
}

#[tokio::test]
async fn blank_completion_is_an_error() {
	let err = generator(FakeChatModel::with_reply("   "), 10_000)
		.generate(&message(), &RetrievalResult::default())
		.await
		.expect_err("Expected an empty completion.");

	assert_eq!(err, GenerationError::EmptyCompletion);
}
