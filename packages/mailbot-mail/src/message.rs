//! Conversion between raw RFC 5322 messages and domain types.

use lettre::{
	Message,
	message::{Mailbox as Address, header::ContentType},
};
use mail_parser::{HeaderValue, MessageParser};
use time::OffsetDateTime;

use mailbot_domain::{DeliveryError, GeneratedReply, InboundMessage, MailError};

/// Stable id for a message that carries no `Message-ID` header.
pub fn synthetic_id(uid_validity: u32, uid: u32, mailbox: &str) -> String {
	format!("uid.{uid_validity}.{uid}@{mailbox}")
}

/// Recovers the UID from an id produced by [`synthetic_id`] for the same mailbox generation.
pub fn synthetic_uid(id: &str, uid_validity: u32, mailbox: &str) -> Option<u32> {
	let rest = id.strip_prefix("uid.")?.strip_suffix(mailbox)?.strip_suffix('@')?;
	let (validity, uid) = rest.split_once('.')?;

	if validity.parse::<u32>().ok()? != uid_validity {
		return None;
	}

	uid.parse().ok()
}

/// Checks that `address` is a bare `local@domain` mailbox.
pub fn validate_address(address: &str) -> Result<(), DeliveryError> {
	address
		.trim()
		.parse::<lettre::Address>()
		.map(|_| ())
		.map_err(|_| DeliveryError::InvalidAddress { address: address.to_string() })
}

pub fn strip_angle_brackets(id: &str) -> String {
	id.trim().trim_start_matches('<').trim_end_matches('>').trim().to_string()
}

pub fn parse_message(raw: &[u8], fallback_id: &str) -> Result<InboundMessage, MailError> {
	let message = MessageParser::default().parse(raw).ok_or_else(|| MailError::Parse {
		message: format!("Message {fallback_id} is not RFC 5322."),
	})?;
	let id = message
		.message_id()
		.map(strip_angle_brackets)
		.filter(|id| !id.is_empty())
		.unwrap_or_else(|| fallback_id.to_string());
	let sender = message
		.from()
		.and_then(|from| from.first())
		.and_then(|addr| addr.address())
		.unwrap_or_default()
		.to_string();
	let received_at = message
		.date()
		.and_then(|date| OffsetDateTime::from_unix_timestamp(date.to_timestamp()).ok())
		.unwrap_or_else(OffsetDateTime::now_utc);
	let mut references = header_ids(message.references());

	for id in header_ids(message.in_reply_to()) {
		if !references.contains(&id) {
			references.push(id);
		}
	}

	Ok(InboundMessage {
		id,
		sender,
		subject: message.subject().unwrap_or_default().trim().to_string(),
		body: message.body_text(0).map(|body| body.trim().to_string()).unwrap_or_default(),
		received_at,
		references,
	})
}

/// A placeholder for mail that could not be parsed, so it still gets a processing record.
pub fn unparsable(id: String) -> InboundMessage {
	InboundMessage {
		id,
		sender: String::new(),
		subject: String::new(),
		body: String::new(),
		received_at: OffsetDateTime::now_utc(),
		references: Vec::new(),
	}
}

pub fn build_reply(reply: &GeneratedReply, from: &str, to: &str) -> Result<Message, DeliveryError> {
	let from: Address = from
		.parse()
		.map_err(|_| DeliveryError::InvalidAddress { address: from.to_string() })?;
	let to: Address =
		to.parse().map_err(|_| DeliveryError::InvalidAddress { address: to.to_string() })?;
	let mut builder = Message::builder()
		.from(from)
		.to(to)
		.subject(reply.subject.clone())
		.in_reply_to(format!("<{}>", reply.in_reply_to))
		.header(ContentType::TEXT_PLAIN);

	if !reply.references.is_empty() {
		let references =
			reply.references.iter().map(|id| format!("<{id}>")).collect::<Vec<_>>().join(" ");

		builder = builder.references(references);
	}

	builder
		.body(reply.text.clone())
		.map_err(|err| DeliveryError::Rejected { message: err.to_string() })
}

fn header_ids(value: &HeaderValue<'_>) -> Vec<String> {
	let raw: Vec<&str> = match value {
		HeaderValue::Text(text) => vec![text.as_ref()],
		HeaderValue::TextList(list) => list.iter().map(|text| text.as_ref()).collect(),
		_ => Vec::new(),
	};

	raw.into_iter()
		.flat_map(|text| text.split_whitespace())
		.map(strip_angle_brackets)
		.filter(|id| !id.is_empty())
		.collect()
}
