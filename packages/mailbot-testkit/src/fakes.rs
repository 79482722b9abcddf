//! Deterministic stand-ins for the external capabilities.

use std::{
	collections::{HashMap, VecDeque},
	sync::{
		Mutex, MutexGuard,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};

use mailbot_domain::{
	BoxFuture, ChatModel, ChatRequest, DeliveryError, Embedder, EmbeddingError, EmbeddingVector,
	GeneratedReply, GenerationError, InboundMessage, MailError, Mailbox,
};

pub const DEFAULT_REPLY: &str = "Thanks for your email. Our support hours are 9am-5pm ET.";

/// Hashes each word into a signed bucket, so texts sharing words land close together.
pub struct FakeEmbedder {
	dimensions: u32,
	overrides: Mutex<HashMap<String, EmbeddingVector>>,
	failures: Mutex<VecDeque<EmbeddingError>>,
	calls: AtomicUsize,
}
impl FakeEmbedder {
	pub fn new(dimensions: u32) -> Self {
		Self {
			dimensions,
			overrides: Mutex::new(HashMap::new()),
			failures: Mutex::new(VecDeque::new()),
			calls: AtomicUsize::new(0),
		}
	}

	/// Pins the vector returned for an exact text.
	pub fn with_text(self, text: &str, vector: EmbeddingVector) -> Self {
		lock(&self.overrides).insert(text.to_string(), vector);

		self
	}

	/// Queues an error for the next call. Queued errors are returned in order.
	pub fn fail_next(&self, err: EmbeddingError) {
		lock(&self.failures).push_back(err);
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	pub fn vector_for(&self, text: &str) -> EmbeddingVector {
		if let Some(vector) = lock(&self.overrides).get(text) {
			return vector.clone();
		}

		let dims = self.dimensions.max(1) as usize;
		let mut vector = vec![0.0_f32; dims];

		for word in text.split(|c: char| !c.is_alphanumeric()).filter(|word| !word.is_empty()) {
			let hash = blake3::hash(word.to_lowercase().as_bytes());
			let bytes = hash.as_bytes();
			let bucket = u64::from_le_bytes([
				bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
			]) as usize % dims;
			let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };

			vector[bucket] += sign;
		}

		let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();

		if norm == 0.0 {
			vector[0] = 1.0;

			return vector;
		}

		vector.iter().map(|v| v / norm).collect()
	}

	fn embed_now(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
		self.calls.fetch_add(1, Ordering::SeqCst);

		if let Some(err) = lock(&self.failures).pop_front() {
			return Err(err);
		}
		if text.trim().is_empty() {
			return Err(EmbeddingError::EmptyInput);
		}

		Ok(self.vector_for(text))
	}
}
impl Embedder for FakeEmbedder {
	fn dimensions(&self) -> u32 {
		self.dimensions
	}

	fn embed<'a>(
		&'a self,
		text: &'a str,
	) -> BoxFuture<'a, Result<EmbeddingVector, EmbeddingError>> {
		Box::pin(async move { self.embed_now(text) })
	}
}

/// Returns a fixed reply and records every request it sees.
pub struct FakeChatModel {
	reply: String,
	delay: Option<Duration>,
	failures: Mutex<VecDeque<GenerationError>>,
	requests: Mutex<Vec<ChatRequest>>,
}
impl FakeChatModel {
	pub fn new() -> Self {
		Self::with_reply(DEFAULT_REPLY)
	}

	pub fn with_reply(reply: &str) -> Self {
		Self {
			reply: reply.to_string(),
			delay: None,
			failures: Mutex::new(VecDeque::new()),
			requests: Mutex::new(Vec::new()),
		}
	}

	/// Sleeps before answering, for timeout tests.
	pub fn with_delay(mut self, delay: Duration) -> Self {
		self.delay = Some(delay);

		self
	}

	pub fn fail_next(&self, err: GenerationError) {
		lock(&self.failures).push_back(err);
	}

	pub fn requests(&self) -> Vec<ChatRequest> {
		lock(&self.requests).clone()
	}

	pub fn calls(&self) -> usize {
		lock(&self.requests).len()
	}

	async fn complete_request(&self, request: &ChatRequest) -> Result<String, GenerationError> {
		lock(&self.requests).push(request.clone());

		if let Some(delay) = self.delay {
			tokio::time::sleep(delay).await;
		}

		let failure = lock(&self.failures).pop_front();

		match failure {
			Some(err) => Err(err),
			None => Ok(self.reply.clone()),
		}
	}
}
impl Default for FakeChatModel {
	fn default() -> Self {
		Self::new()
	}
}
impl ChatModel for FakeChatModel {
	fn complete<'a>(
		&'a self,
		request: &'a ChatRequest,
	) -> BoxFuture<'a, Result<String, GenerationError>> {
		Box::pin(self.complete_request(request))
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct SentReply {
	pub to: String,
	pub reply: GeneratedReply,
}

/// In-memory mailbox that records acknowledgements and outgoing replies.
#[derive(Default)]
pub struct RecordingMailbox {
	unseen: Mutex<Vec<InboundMessage>>,
	history: Mutex<Vec<InboundMessage>>,
	acknowledged: Mutex<Vec<String>>,
	sent: Mutex<Vec<SentReply>>,
	fetch_failures: Mutex<VecDeque<MailError>>,
	send_failures: Mutex<VecDeque<DeliveryError>>,
}
impl RecordingMailbox {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds an unread message.
	pub fn deliver(&self, message: InboundMessage) {
		lock(&self.history).push(message.clone());
		lock(&self.unseen).push(message);
	}

	/// Adds an already read message, visible only through `history`.
	pub fn archive(&self, message: InboundMessage) {
		lock(&self.history).push(message);
	}

	pub fn fail_next_fetch(&self, err: MailError) {
		lock(&self.fetch_failures).push_back(err);
	}

	pub fn fail_next_send(&self, err: DeliveryError) {
		lock(&self.send_failures).push_back(err);
	}

	pub fn acknowledged(&self) -> Vec<String> {
		lock(&self.acknowledged).clone()
	}

	pub fn sent(&self) -> Vec<SentReply> {
		lock(&self.sent).clone()
	}

	fn fetch_now(&self) -> Result<Vec<InboundMessage>, MailError> {
		if let Some(err) = lock(&self.fetch_failures).pop_front() {
			return Err(err);
		}

		Ok(lock(&self.unseen).clone())
	}

	fn acknowledge_now(&self, message_id: &str) {
		lock(&self.unseen).retain(|m| m.id != message_id);
		lock(&self.acknowledged).push(message_id.to_string());
	}

	fn send_now(&self, reply: &GeneratedReply, to: &str) -> Result<(), DeliveryError> {
		if let Some(err) = lock(&self.send_failures).pop_front() {
			return Err(err);
		}

		lock(&self.sent).push(SentReply { to: to.to_string(), reply: reply.clone() });

		Ok(())
	}

	fn history_now(&self, limit: Option<usize>) -> Vec<InboundMessage> {
		let history = lock(&self.history);
		let skip = limit.map(|limit| history.len().saturating_sub(limit)).unwrap_or(0);

		history[skip..].to_vec()
	}
}
impl Mailbox for RecordingMailbox {
	fn fetch_unseen<'a>(&'a self) -> BoxFuture<'a, Result<Vec<InboundMessage>, MailError>> {
		Box::pin(async move { self.fetch_now() })
	}

	fn acknowledge<'a>(&'a self, message_id: &'a str) -> BoxFuture<'a, Result<(), MailError>> {
		Box::pin(async move {
			self.acknowledge_now(message_id);

			Ok(())
		})
	}

	fn send<'a>(
		&'a self,
		reply: &'a GeneratedReply,
		to: &'a str,
	) -> BoxFuture<'a, Result<(), DeliveryError>> {
		Box::pin(async move { self.send_now(reply, to) })
	}

	fn history<'a>(
		&'a self,
		limit: Option<usize>,
	) -> BoxFuture<'a, Result<Vec<InboundMessage>, MailError>> {
		Box::pin(async move { Ok(self.history_now(limit)) })
	}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|err| err.into_inner())
}
