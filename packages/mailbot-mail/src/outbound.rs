//! SMTP send.

use std::time::Duration;

use lettre::{
	AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
	transport::smtp::authentication::Credentials,
};

use crate::{Result, message};
use mailbot_config::Mail;
use mailbot_domain::{DeliveryError, GeneratedReply};

const IMPLICIT_TLS_PORT: u16 = 465;

pub struct SmtpSender {
	transport: AsyncSmtpTransport<Tokio1Executor>,
	from: String,
}
impl SmtpSender {
	/// Port 465 uses implicit TLS, every other port STARTTLS.
	pub fn new(cfg: &Mail) -> Result<Self> {
		let builder = if cfg.smtp_port == IMPLICIT_TLS_PORT {
			AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.smtp_host)?
		} else {
			AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.smtp_host)?
		};
		let transport = builder
			.port(cfg.smtp_port)
			.credentials(Credentials::new(cfg.address.clone(), cfg.password.clone()))
			.timeout(Some(Duration::from_millis(cfg.timeout_ms)))
			.build();

		Ok(Self { transport, from: cfg.address.clone() })
	}

	pub async fn send(&self, reply: &GeneratedReply, to: &str) -> Result<(), DeliveryError> {
		let email = message::build_reply(reply, &self.from, to)?;

		self.transport.send(email).await.map_err(|err| {
			if err.is_permanent() {
				DeliveryError::Rejected { message: err.to_string() }
			} else {
				DeliveryError::Transport { message: err.to_string() }
			}
		})?;

		Ok(())
	}
}
