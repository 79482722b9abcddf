pub mod fakes;

mod error;

pub use error::{Error, Result};
pub use fakes::{FakeChatModel, FakeEmbedder, RecordingMailbox, SentReply};

use std::{env, future::Future, str::FromStr, thread, time::Duration};

use qdrant_client::Qdrant;
use sqlx::{
	ConnectOptions, Connection, Executor,
	postgres::{PgConnectOptions, PgConnection},
};
use time::OffsetDateTime;
use tokio::{runtime::Builder, time as tokio_time};
use uuid::Uuid;

use mailbot_config::Config;
use mailbot_domain::InboundMessage;

pub const TEST_DIMENSIONS: u32 = 64;

const ADMIN_DATABASES: [&str; 2] = ["postgres", "template1"];
const TEST_CONFIG: &str = r#"
[service]
http_bind = "127.0.0.1:0"
log_level = "debug"

[mail]
imap_host = "imap.example.com"
smtp_host = "smtp.example.com"
address = "bot@example.com"
password = "app-password"
poll_interval_ms = 10

[storage.state]
backend = "memory"

[storage.vector]
backend = "memory"
dimensions = 64

[providers.embedding]
provider_id = "openai"
api_base = "http://127.0.0.1:1"
api_key = "test-key"
path = "/embeddings"
model = "test-embedding"
dimensions = 64
timeout_ms = 1000

[providers.llm]
provider_id = "openai"
api_base = "http://127.0.0.1:1"
api_key = "test-key"
path = "/chat/completions"
model = "test-chat"
temperature = 0.2
max_output_tokens = 256
timeout_ms = 1000

[chunking]
window_chars = 200
overlap_chars = 40
upsert_batch_size = 10

[retrieval]
top_k = 3

[generation]
instructions = "You are an email assistant. Answer using the context."
max_prompt_chars = 4000
timeout_ms = 1000

[orchestrator]
max_attempts = 3
base_backoff_ms = 1
max_backoff_ms = 1
workers = 4
claim_lease_seconds = 60
"#;

/// A throwaway Postgres database, dropped on cleanup or drop.
pub struct TestDatabase {
	name: String,
	dsn: String,
	admin_options: PgConnectOptions,
	cleaned: bool,
}
impl TestDatabase {
	pub async fn new(base_dsn: &str) -> Result<Self> {
		let base_options: PgConnectOptions = PgConnectOptions::from_str(base_dsn)
			.map_err(|err| Error::Message(format!("Failed to parse MAILBOT_PG_DSN: {err}.")))?;
		let (admin_options, mut admin_conn) = connect_admin(&base_options).await?;
		let name = format!("mailbot_test_{}", Uuid::new_v4().simple());
		let create_sql = format!(r#"CREATE DATABASE "{}""#, name);

		admin_conn
			.execute(create_sql.as_str())
			.await
			.map_err(|err| Error::Message(format!("Failed to create test database: {err}.")))?;

		let dsn = base_options.clone().database(&name).to_url_lossy().to_string();

		Ok(Self { name, dsn, admin_options, cleaned: false })
	}

	pub fn dsn(&self) -> &str {
		&self.dsn
	}

	pub async fn cleanup(mut self) -> Result<()> {
		cleanup_database(&self.name, &self.admin_options).await?;

		self.cleaned = true;

		Ok(())
	}
}
impl Drop for TestDatabase {
	fn drop(&mut self) {
		if self.cleaned {
			return;
		}

		let name = self.name.clone();
		let admin_options = self.admin_options.clone();

		block_on_cleanup(async move {
			if let Err(err) = cleanup_database(&name, &admin_options).await {
				eprintln!("Test database cleanup failed: {err}.");
			}
		});
	}
}

/// A uniquely named Qdrant collection, deleted on cleanup or drop.
pub struct TestCollection {
	name: String,
	url: String,
	cleaned: bool,
}
impl TestCollection {
	pub fn new(url: &str, prefix: &str) -> Self {
		Self {
			name: format!("{prefix}_{}", Uuid::new_v4().simple()),
			url: url.to_string(),
			cleaned: false,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn url(&self) -> &str {
		&self.url
	}

	pub async fn cleanup(mut self) -> Result<()> {
		delete_collection(&self.url, &self.name).await?;

		self.cleaned = true;

		Ok(())
	}
}
impl Drop for TestCollection {
	fn drop(&mut self) {
		if self.cleaned {
			return;
		}

		let name = self.name.clone();
		let url = self.url.clone();

		block_on_cleanup(async move {
			if let Err(err) = delete_collection(&url, &name).await {
				eprintln!("Test Qdrant cleanup failed: {err}.");
			}
		});
	}
}

pub fn env_dsn() -> Option<String> {
	env::var("MAILBOT_PG_DSN").ok()
}

pub fn env_qdrant_url() -> Option<String> {
	env::var("MAILBOT_QDRANT_URL").ok()
}

/// A configuration with in-memory backends and millisecond backoffs.
pub fn config() -> Config {
	match toml::from_str(TEST_CONFIG) {
		Ok(config) => config,
		Err(err) => panic!("Test configuration does not parse: {err}."),
	}
}

/// An unread message received now.
pub fn inbound(id: &str, sender: &str, subject: &str, body: &str) -> InboundMessage {
	InboundMessage {
		id: id.to_string(),
		sender: sender.to_string(),
		subject: subject.to_string(),
		body: body.to_string(),
		received_at: OffsetDateTime::now_utc(),
		references: Vec::new(),
	}
}

async fn connect_admin(
	base_options: &PgConnectOptions,
) -> Result<(PgConnectOptions, PgConnection)> {
	let mut last_err = None;

	for database in ADMIN_DATABASES {
		let options = base_options.clone().database(database);

		match PgConnection::connect_with(&options).await {
			Ok(conn) => return Ok((options, conn)),
			Err(err) => {
				last_err = Some(err);
			},
		}
	}

	Err(Error::Message(format!("Failed to connect to an admin database: {last_err:?}.")))
}

async fn cleanup_database(name: &str, admin_options: &PgConnectOptions) -> Result<()> {
	let mut conn = PgConnection::connect_with(admin_options).await.map_err(|err| {
		Error::Message(format!("Failed to connect to admin database for cleanup: {err}."))
	})?;
	let drop_sql = format!(r#"DROP DATABASE IF EXISTS "{}""#, name);
	let _ = sqlx::query(
		"\
SELECT pg_terminate_backend(pid)
FROM pg_stat_activity
WHERE datname = $1 AND pid <> pg_backend_pid()",
	)
	.bind(name)
	.fetch_all(&mut conn)
	.await;

	sqlx::query(drop_sql.as_str())
		.execute(&mut conn)
		.await
		.map_err(|err| Error::Message(format!("Failed to drop test database: {err}.")))?;

	Ok(())
}

async fn delete_collection(url: &str, collection: &str) -> Result<()> {
	let client = Qdrant::from_url(url).build()?;
	let delete = client.delete_collection(collection.to_string());

	match tokio_time::timeout(Duration::from_secs(10), delete).await {
		Ok(Ok(_)) => Ok(()),
		Ok(Err(err)) => Err(Error::Message(format!(
			"Failed to delete Qdrant collection {collection:?}: {err}."
		))),
		Err(_) =>
			Err(Error::Message(format!("Timed out deleting Qdrant collection {collection:?}."))),
	}
}

/// Runs async cleanup from `Drop`, on its own thread and runtime.
fn block_on_cleanup<F>(cleanup: F)
where
	F: Future<Output = ()> + Send + 'static,
{
	let cleanup_thread = thread::spawn(move || {
		match Builder::new_current_thread().enable_all().build() {
			Ok(runtime) => runtime.block_on(cleanup),
			Err(err) => eprintln!("Test cleanup runtime failed to start: {err}."),
		}
	});
	let _ = cleanup_thread.join();
}
