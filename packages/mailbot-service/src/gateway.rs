use std::{collections::VecDeque, sync::Arc, time::Duration};

use mailbot_domain::{DeliveryError, GeneratedReply, InboundMessage, Mailbox};

/// Lazy, unbounded view over a polled mailbox.
///
/// Poll failures are logged and retried on the next interval; they never end the stream.
pub struct Inbox {
	mailbox: Arc<dyn Mailbox>,
	poll_interval: Duration,
	buffered: VecDeque<InboundMessage>,
	polled: bool,
}
impl Inbox {
	pub fn new(mailbox: Arc<dyn Mailbox>, poll_interval: Duration) -> Self {
		Self { mailbox, poll_interval, buffered: VecDeque::new(), polled: false }
	}

	pub async fn next(&mut self) -> InboundMessage {
		loop {
			if let Some(message) = self.buffered.pop_front() {
				return message;
			}

			let batch = self.poll().await;

			self.buffered.extend(batch);
		}
	}

	/// Everything buffered, or the next non-empty poll.
	pub async fn next_batch(&mut self) -> Vec<InboundMessage> {
		loop {
			if !self.buffered.is_empty() {
				return self.buffered.drain(..).collect();
			}

			let batch = self.poll().await;

			if !batch.is_empty() {
				return batch;
			}
		}
	}

	async fn poll(&mut self) -> Vec<InboundMessage> {
		if self.polled {
			tokio::time::sleep(self.poll_interval).await;
		}

		self.polled = true;

		match self.mailbox.fetch_unseen().await {
			Ok(messages) => {
				if !messages.is_empty() {
					tracing::debug!(count = messages.len(), "Fetched unseen mail.");
				}

				messages
			},
			Err(err) => {
				tracing::warn!(error = %err, "Failed to poll the mailbox.");

				Vec::new()
			},
		}
	}
}

/// Sends `reply` after checking the recipient, so a malformed address never reaches SMTP.
pub async fn deliver(
	mailbox: &dyn Mailbox,
	reply: &GeneratedReply,
	to: &str,
) -> Result<(), DeliveryError> {
	mailbot_mail::message::validate_address(to)?;

	mailbox.send(reply, to).await
}
