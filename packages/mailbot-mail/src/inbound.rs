//! IMAP receive. The `imap` client is blocking, so every session runs on the blocking pool.

use std::{
	collections::HashMap,
	net::TcpStream,
	sync::{Arc, Mutex},
	time::Duration,
};

use native_tls::{TlsConnector, TlsStream};

use crate::message;
use mailbot_config::Mail;
use mailbot_domain::{InboundMessage, MailError};

type Session = imap::Session<TlsStream<TcpStream>>;

#[derive(Clone)]
struct ImapSettings {
	host: String,
	port: u16,
	address: String,
	password: String,
	mailbox: String,
}

struct Fetched {
	uid_validity: u32,
	messages: Vec<(u32, Vec<u8>)>,
}

enum Search {
	Unseen,
	All { limit: Option<usize> },
}

pub struct ImapReceiver {
	settings: ImapSettings,
	timeout: Duration,
	/// Message id to UID for unread messages awaiting acknowledgement.
	uids: Arc<Mutex<HashMap<String, u32>>>,
}
impl ImapReceiver {
	pub fn new(cfg: &Mail) -> Self {
		Self {
			settings: ImapSettings {
				host: cfg.imap_host.clone(),
				port: cfg.imap_port,
				address: cfg.address.clone(),
				password: cfg.password.clone(),
				mailbox: cfg.mailbox.clone(),
			},
			timeout: Duration::from_millis(cfg.timeout_ms),
			uids: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	/// Unread messages, fetched with `BODY.PEEK[]` so they stay unread.
	pub async fn fetch_unseen(&self) -> Result<Vec<InboundMessage>, MailError> {
		self.fetch(Search::Unseen).await
	}

	pub async fn history(&self, limit: Option<usize>) -> Result<Vec<InboundMessage>, MailError> {
		self.fetch(Search::All { limit }).await
	}

	/// Sets `\Seen` on the message.
	pub async fn acknowledge(&self, message_id: &str) -> Result<(), MailError> {
		let settings = self.settings.clone();
		let known = self.take_uid(message_id);
		let message_id = message_id.to_string();

		self.run_blocking(move || {
			let mut session = open_session(&settings)?;
			let selected = session.select(&settings.mailbox).map_err(transport)?;
			let uid = match known {
				Some(uid) => Some(uid),
				None => locate_uid(&mut session, &settings, selected.uid_validity, &message_id)?,
			};

			match uid {
				Some(uid) => {
					session.uid_store(uid.to_string(), "+FLAGS (\\Seen)").map_err(transport)?;
				},
				None => tracing::warn!(message_id = %message_id, "Message not found in mailbox."),
			}

			session.logout().map_err(transport)?;

			Ok(())
		})
		.await
	}

	async fn fetch(&self, search: Search) -> Result<Vec<InboundMessage>, MailError> {
		let settings = self.settings.clone();
		let remember = matches!(search, Search::Unseen);
		let fetched = self.run_blocking(move || fetch_blocking(&settings, search)).await?;

		Ok(self.collect(fetched, remember))
	}

	/// Parses fetched bodies. With `remember` their UIDs are kept until acknowledged.
	fn collect(&self, fetched: Fetched, remember: bool) -> Vec<InboundMessage> {
		let mailbox = self.settings.mailbox.as_str();
		let mut out = Vec::with_capacity(fetched.messages.len());
		let mut uids = self.uids.lock().unwrap_or_else(|err| err.into_inner());

		for (uid, raw) in fetched.messages {
			let fallback = message::synthetic_id(fetched.uid_validity, uid, mailbox);
			let inbound = match message::parse_message(&raw, &fallback) {
				Ok(inbound) => inbound,
				Err(err) => {
					tracing::warn!(uid, error = %err, "Failed to parse message.");

					message::unparsable(fallback)
				},
			};

			if remember {
				uids.insert(inbound.id.clone(), uid);
			}

			out.push(inbound);
		}

		out
	}

	fn take_uid(&self, message_id: &str) -> Option<u32> {
		self.uids.lock().unwrap_or_else(|err| err.into_inner()).remove(message_id)
	}

	async fn run_blocking<T, F>(&self, f: F) -> Result<T, MailError>
	where
		T: Send + 'static,
		F: FnOnce() -> Result<T, MailError> + Send + 'static,
	{
		match tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(f)).await {
			Ok(Ok(result)) => result,
			Ok(Err(err)) =>
				Err(MailError::Transport { message: format!("IMAP task failed: {err}.") }),
			Err(_) => Err(MailError::Transport { message: "IMAP call timed out.".to_string() }),
		}
	}
}

fn open_session(settings: &ImapSettings) -> Result<Session, MailError> {
	let tls = TlsConnector::builder().build().map_err(transport)?;
	let client = imap::connect((settings.host.as_str(), settings.port), &settings.host, &tls)
		.map_err(transport)?;

	client
		.login(&settings.address, &settings.password)
		.map_err(|(err, _)| MailError::Authentication { message: err.to_string() })
}

fn fetch_blocking(settings: &ImapSettings, search: Search) -> Result<Fetched, MailError> {
	let mut session = open_session(settings)?;
	let selected = session.select(&settings.mailbox).map_err(transport)?;
	let (query, limit) = match search {
		Search::Unseen => ("UNSEEN", None),
		Search::All { limit } => ("ALL", limit),
	};
	let mut uids: Vec<u32> = session.uid_search(query).map_err(transport)?.into_iter().collect();

	uids.sort_unstable();

	if let Some(limit) = limit {
		uids = uids.split_off(uids.len().saturating_sub(limit));
	}

	let mut messages = Vec::with_capacity(uids.len());

	if !uids.is_empty() {
		let set = uids.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
		let fetches = session.uid_fetch(set, "(UID BODY.PEEK[])").map_err(transport)?;

		for fetch in fetches.iter() {
			if let (Some(uid), Some(body)) = (fetch.uid, fetch.body()) {
				messages.push((uid, body.to_vec()));
			}
		}
	}

	session.logout().map_err(transport)?;
	messages.sort_by_key(|(uid, _)| *uid);

	Ok(Fetched { uid_validity: selected.uid_validity.unwrap_or(0), messages })
}

fn locate_uid(
	session: &mut Session,
	settings: &ImapSettings,
	uid_validity: Option<u32>,
	message_id: &str,
) -> Result<Option<u32>, MailError> {
	if let Some(uid) =
		message::synthetic_uid(message_id, uid_validity.unwrap_or(0), &settings.mailbox)
	{
		return Ok(Some(uid));
	}

	let query = format!("HEADER Message-ID \"{}\"", message_id.replace('"', ""));
	let found = session.uid_search(query).map_err(transport)?;

	Ok(found.into_iter().max())
}

fn transport(err: impl std::fmt::Display) -> MailError {
	MailError::Transport { message: err.to_string() }
}

#[cfg(test)]
mod tests {
	use super::*;

	const RAW: &[u8] = b"From: jane@example.com\r\n\
Subject: Hours\r\n\
Message-ID: <m1@example.com>\r\n\
\r\n\
When are you open?\r\n";

	fn receiver() -> ImapReceiver {
		ImapReceiver::new(&Mail {
			imap_host: "imap.example.com".to_string(),
			imap_port: 993,
			smtp_host: "smtp.example.com".to_string(),
			smtp_port: 587,
			address: "bot@example.com".to_string(),
			password: "app-password".to_string(),
			mailbox: "INBOX".to_string(),
			poll_interval_ms: 1_000,
			timeout_ms: 1_000,
		})
	}

	fn fetched() -> Fetched {
		Fetched { uid_validity: 9, messages: vec![(42, RAW.to_vec())] }
	}

	#[test]
	fn acknowledging_forgets_the_uid() {
		let receiver = receiver();
		let messages = receiver.collect(fetched(), true);

		assert_eq!(messages.len(), 1);
		assert_eq!(receiver.take_uid(&messages[0].id), Some(42));
		assert_eq!(receiver.take_uid(&messages[0].id), None);
	}

	#[test]
	fn history_fetches_are_not_tracked() {
		let receiver = receiver();
		let messages = receiver.collect(fetched(), false);

		assert_eq!(messages.len(), 1);
		assert!(receiver.uids.lock().expect("Lock poisoned.").is_empty());
	}
}
