pub mod inbound;
pub mod message;
pub mod outbound;

mod error;

pub use error::{Error, Result};

use mailbot_config::Mail;
use mailbot_domain::{BoxFuture, DeliveryError, GeneratedReply, InboundMessage, MailError, Mailbox};

/// The configured mailbox: IMAP for receiving, SMTP for replies.
pub struct ImapSmtpMailbox {
	receiver: inbound::ImapReceiver,
	sender: outbound::SmtpSender,
}
impl ImapSmtpMailbox {
	pub fn new(cfg: &Mail) -> Result<Self> {
		let sender = outbound::SmtpSender::new(cfg)?;

		Ok(Self { receiver: inbound::ImapReceiver::new(cfg), sender })
	}
}
impl Mailbox for ImapSmtpMailbox {
	fn fetch_unseen<'a>(&'a self) -> BoxFuture<'a, Result<Vec<InboundMessage>, MailError>> {
		Box::pin(self.receiver.fetch_unseen())
	}

	fn acknowledge<'a>(&'a self, message_id: &'a str) -> BoxFuture<'a, Result<(), MailError>> {
		Box::pin(self.receiver.acknowledge(message_id))
	}

	fn send<'a>(
		&'a self,
		reply: &'a GeneratedReply,
		to: &'a str,
	) -> BoxFuture<'a, Result<(), DeliveryError>> {
		Box::pin(self.sender.send(reply, to))
	}

	fn history<'a>(
		&'a self,
		limit: Option<usize>,
	) -> BoxFuture<'a, Result<Vec<InboundMessage>, MailError>> {
		Box::pin(self.receiver.history(limit))
	}
}
