use std::{collections::HashSet, sync::Arc, time::Duration};

use time::OffsetDateTime;

use mailbot_config::{Generation, LlmProviderConfig};
use mailbot_domain::{
	ChatModel, ChatRequest, GeneratedReply, GenerationError, InboundMessage, RetrievalResult,
	RetrievedChunk, content_hash,
};

/// Turns a message and its retrieved context into a reply through the chat model.
pub struct Generator {
	model: Arc<dyn ChatModel>,
	instructions: String,
	max_prompt_chars: usize,
	timeout: Duration,
	max_output_tokens: u32,
	temperature: f32,
}
impl Generator {
	pub fn new(model: Arc<dyn ChatModel>, cfg: &Generation, llm: &LlmProviderConfig) -> Self {
		Self {
			model,
			instructions: cfg.instructions.clone(),
			max_prompt_chars: cfg.max_prompt_chars as usize,
			timeout: Duration::from_millis(cfg.timeout_ms),
			max_output_tokens: llm.max_output_tokens,
			temperature: llm.temperature,
		}
	}

	/// Builds the model request, dropping the weakest context until the prompt fits the budget.
	///
	/// The email section is never cut. When it alone exceeds the budget the request carries no
	/// context at all.
	pub fn build_request(
		&self,
		message: &InboundMessage,
		context: &RetrievalResult,
	) -> ChatRequest {
		let email = email_section(message);
		let mut kept = dedup(context);
		let budget = self.max_prompt_chars.saturating_sub(self.instructions.chars().count());

		loop {
			let prompt = render_prompt(&kept, &email);

			if prompt.chars().count() <= budget || kept.is_empty() {
				return ChatRequest {
					system: self.instructions.clone(),
					prompt,
					max_output_tokens: self.max_output_tokens,
					temperature: self.temperature,
				};
			}

			let weakest = weakest_position(&kept);

			tracing::debug!(
				message_id = %message.id,
				dropped = %kept[weakest].chunk.chunk_id,
				"Dropped context chunk to fit the prompt budget."
			);
			kept.remove(weakest);
		}
	}

	/// One model call bounded by the generation timeout. A timeout is transient.
	pub async fn generate(
		&self,
		message: &InboundMessage,
		context: &RetrievalResult,
	) -> Result<GeneratedReply, GenerationError> {
		let request = self.build_request(message, context);
		let text = match tokio::time::timeout(self.timeout, self.model.complete(&request)).await {
			Ok(result) => result?,
			Err(_) =>
				return Err(GenerationError::Timeout {
					message: format!("Generation exceeded {} ms.", self.timeout.as_millis()),
				}),
		};
		let text = text.trim();

		if text.is_empty() {
			return Err(GenerationError::EmptyCompletion);
		}

		Ok(GeneratedReply::for_message(message, text.to_string(), OffsetDateTime::now_utc()))
	}
}

fn email_section(message: &InboundMessage) -> String {
	format!("Email:\nSubject: {}\n\n{}", message.subject.trim(), message.body.trim())
}

fn render_prompt(context: &[&RetrievedChunk], email: &str) -> String {
	if context.is_empty() {
		return email.to_string();
	}

	let passages: Vec<String> = context
		.iter()
		.enumerate()
		.map(|(idx, retrieved)| format!("[{}] {}", idx + 1, retrieved.chunk.text.trim()))
		.collect();

	format!("Context:\n{}\n\n{email}", passages.join("\n\n"))
}

fn dedup(context: &RetrievalResult) -> Vec<&RetrievedChunk> {
	let mut seen = HashSet::new();

	context
		.iter()
		.filter(|retrieved| seen.insert(content_hash(retrieved.chunk.text.trim())))
		.collect()
}

// Ties go to the later chunk, which the index ranked lower.
fn weakest_position(context: &[&RetrievedChunk]) -> usize {
	let mut weakest = 0;

	for (idx, retrieved) in context.iter().enumerate() {
		if retrieved.score <= context[weakest].score {
			weakest = idx;
		}
	}

	weakest
}
