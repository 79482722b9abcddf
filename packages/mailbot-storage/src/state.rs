use sqlx::FromRow;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::db::Db;
use mailbot_domain::{
	BoxFuture, Claim, Lease, ProcessingState, ProcessingStatus, StateStore, StateStoreError,
};

#[derive(Debug, FromRow)]
struct StateRow {
	message_id: String,
	status: String,
	attempts: i32,
	last_error: Option<String>,
	reply_text: Option<String>,
	created_at: OffsetDateTime,
	updated_at: OffsetDateTime,
}
impl StateRow {
	fn into_state(self) -> Result<ProcessingState, StateStoreError> {
		Ok(ProcessingState {
			status: parse_status(&self.status)?,
			message_id: self.message_id,
			attempts: self.attempts.max(0) as u32,
			last_error: self.last_error,
			reply_text: self.reply_text,
			created_at: self.created_at,
			updated_at: self.updated_at,
		})
	}
}

/// Postgres-backed processing records. Leases live in `lease_token` and `lease_until`.
pub struct PgStateStore {
	db: Db,
}
impl PgStateStore {
	pub fn new(db: Db) -> Self {
		Self { db }
	}

	async fn claim_message(
		&self,
		message_id: &str,
		lease: Duration,
	) -> Result<Claim, StateStoreError> {
		let now = OffsetDateTime::now_utc();
		let token = Uuid::new_v4();
		let mut tx = self.db.pool.begin().await.map_err(backend)?;

		sqlx::query(
			"\
INSERT INTO processing_states (message_id, status, attempts, created_at, updated_at)
VALUES ($1, 'pending', 0, $2, $2)
ON CONFLICT (message_id) DO NOTHING",
		)
		.bind(message_id)
		.bind(now)
		.execute(&mut *tx)
		.await
		.map_err(backend)?;

		let row: Option<StateRow> = sqlx::query_as(
			"\
UPDATE processing_states
SET lease_token = $2, lease_until = $3, updated_at = $4
WHERE message_id = $1
	AND status NOT IN ('sent', 'failed')
	AND (lease_token IS NULL OR lease_until IS NULL OR lease_until <= $4)
RETURNING message_id, status, attempts, last_error, reply_text, created_at, updated_at",
		)
		.bind(message_id)
		.bind(token)
		.bind(now + lease)
		.bind(now)
		.fetch_optional(&mut *tx)
		.await
		.map_err(backend)?;
		let claim = match row {
			Some(row) => Claim::Acquired(Lease { token, state: row.into_state()? }),
			None => {
				let status: String =
					sqlx::query_scalar("SELECT status FROM processing_states WHERE message_id = $1")
						.bind(message_id)
						.fetch_one(&mut *tx)
						.await
						.map_err(backend)?;
				let status = parse_status(&status)?;

				if status.is_terminal() { Claim::Finished(status) } else { Claim::InFlight }
			},
		};

		tx.commit().await.map_err(backend)?;

		Ok(claim)
	}

	async fn advance_message(
		&self,
		message_id: &str,
		token: Uuid,
		from: ProcessingStatus,
		to: ProcessingStatus,
		reply_text: Option<&str>,
	) -> Result<ProcessingState, StateStoreError> {
		if !from.can_advance_to(to) {
			return Err(StateStoreError::InvalidTransition {
				message_id: message_id.to_string(),
				from,
				to,
			});
		}

		let row: Option<StateRow> = sqlx::query_as(
			"\
UPDATE processing_states
SET
	status = $4,
	reply_text = COALESCE($5, reply_text),
	lease_token = CASE WHEN $6 THEN NULL ELSE lease_token END,
	lease_until = CASE WHEN $6 THEN NULL ELSE lease_until END,
	updated_at = $7
WHERE message_id = $1 AND status = $2 AND lease_token = $3
RETURNING message_id, status, attempts, last_error, reply_text, created_at, updated_at",
		)
		.bind(message_id)
		.bind(from.as_str())
		.bind(token)
		.bind(to.as_str())
		.bind(reply_text)
		.bind(to.is_terminal())
		.bind(OffsetDateTime::now_utc())
		.fetch_optional(&self.db.pool)
		.await
		.map_err(backend)?;

		match row {
			Some(row) => row.into_state(),
			None => Err(self.explain_miss(message_id, Some(from)).await),
		}
	}

	async fn record_message_failure(
		&self,
		message_id: &str,
		token: Uuid,
		error: &str,
		terminal: bool,
	) -> Result<ProcessingState, StateStoreError> {
		let row: Option<StateRow> = sqlx::query_as(
			"\
UPDATE processing_states
SET
	attempts = attempts + 1,
	last_error = $3,
	status = CASE WHEN $4 THEN 'failed' ELSE status END,
	lease_token = CASE WHEN $4 THEN NULL ELSE lease_token END,
	lease_until = CASE WHEN $4 THEN NULL ELSE lease_until END,
	updated_at = $5
WHERE message_id = $1 AND lease_token = $2 AND status NOT IN ('sent', 'failed')
RETURNING message_id, status, attempts, last_error, reply_text, created_at, updated_at",
		)
		.bind(message_id)
		.bind(token)
		.bind(error)
		.bind(terminal)
		.bind(OffsetDateTime::now_utc())
		.fetch_optional(&self.db.pool)
		.await
		.map_err(backend)?;

		match row {
			Some(row) => row.into_state(),
			None => Err(self.explain_miss(message_id, None).await),
		}
	}

	async fn release_message(&self, message_id: &str, token: Uuid) -> Result<(), StateStoreError> {
		sqlx::query(
			"\
UPDATE processing_states
SET lease_token = NULL, lease_until = NULL, updated_at = $3
WHERE message_id = $1 AND lease_token = $2",
		)
		.bind(message_id)
		.bind(token)
		.bind(OffsetDateTime::now_utc())
		.execute(&self.db.pool)
		.await
		.map_err(backend)?;

		Ok(())
	}

	async fn get_message(
		&self,
		message_id: &str,
	) -> Result<Option<ProcessingState>, StateStoreError> {
		let row: Option<StateRow> = sqlx::query_as(
			"\
SELECT message_id, status, attempts, last_error, reply_text, created_at, updated_at
FROM processing_states
WHERE message_id = $1",
		)
		.bind(message_id)
		.fetch_optional(&self.db.pool)
		.await
		.map_err(backend)?;

		row.map(StateRow::into_state).transpose()
	}

	async fn list_messages(
		&self,
		status: Option<ProcessingStatus>,
		limit: u32,
	) -> Result<Vec<ProcessingState>, StateStoreError> {
		let rows: Vec<StateRow> = sqlx::query_as(
			"\
SELECT message_id, status, attempts, last_error, reply_text, created_at, updated_at
FROM processing_states
WHERE ($1::text IS NULL OR status = $1)
ORDER BY updated_at DESC, message_id
LIMIT $2",
		)
		.bind(status.map(ProcessingStatus::as_str))
		.bind(i64::from(limit))
		.fetch_all(&self.db.pool)
		.await
		.map_err(backend)?;

		rows.into_iter().map(StateRow::into_state).collect()
	}

	async fn reset_message(&self, message_id: &str) -> Result<ProcessingState, StateStoreError> {
		let row: Option<StateRow> = sqlx::query_as(
			"\
UPDATE processing_states
SET
	status = 'pending',
	attempts = 0,
	last_error = NULL,
	reply_text = NULL,
	lease_token = NULL,
	lease_until = NULL,
	updated_at = $2
WHERE message_id = $1 AND status = 'failed'
RETURNING message_id, status, attempts, last_error, reply_text, created_at, updated_at",
		)
		.bind(message_id)
		.bind(OffsetDateTime::now_utc())
		.fetch_optional(&self.db.pool)
		.await
		.map_err(backend)?;

		if let Some(row) = row {
			return row.into_state();
		}

		match self.get_message(message_id).await? {
			None => Err(StateStoreError::NotFound { message_id: message_id.to_string() }),
			Some(state) => Err(StateStoreError::Conflict {
				message_id: message_id.to_string(),
				status: state.status,
				expected: ProcessingStatus::Failed,
			}),
		}
	}

	/// Names the reason a guarded update matched no row.
	async fn explain_miss(
		&self,
		message_id: &str,
		expected: Option<ProcessingStatus>,
	) -> StateStoreError {
		let current = match self.get_message(message_id).await {
			Ok(current) => current,
			Err(err) => return err,
		};

		match (current, expected) {
			(None, _) => StateStoreError::NotFound { message_id: message_id.to_string() },
			(Some(state), Some(expected)) if state.status != expected => StateStoreError::Conflict {
				message_id: message_id.to_string(),
				status: state.status,
				expected,
			},
			(Some(_), _) => StateStoreError::LeaseLost { message_id: message_id.to_string() },
		}
	}
}
impl StateStore for PgStateStore {
	fn claim<'a>(
		&'a self,
		message_id: &'a str,
		lease: Duration,
	) -> BoxFuture<'a, Result<Claim, StateStoreError>> {
		Box::pin(self.claim_message(message_id, lease))
	}

	fn advance<'a>(
		&'a self,
		message_id: &'a str,
		token: Uuid,
		from: ProcessingStatus,
		to: ProcessingStatus,
		reply_text: Option<&'a str>,
	) -> BoxFuture<'a, Result<ProcessingState, StateStoreError>> {
		Box::pin(self.advance_message(message_id, token, from, to, reply_text))
	}

	fn record_failure<'a>(
		&'a self,
		message_id: &'a str,
		token: Uuid,
		error: &'a str,
		terminal: bool,
	) -> BoxFuture<'a, Result<ProcessingState, StateStoreError>> {
		Box::pin(self.record_message_failure(message_id, token, error, terminal))
	}

	fn release<'a>(
		&'a self,
		message_id: &'a str,
		token: Uuid,
	) -> BoxFuture<'a, Result<(), StateStoreError>> {
		Box::pin(self.release_message(message_id, token))
	}

	fn get<'a>(
		&'a self,
		message_id: &'a str,
	) -> BoxFuture<'a, Result<Option<ProcessingState>, StateStoreError>> {
		Box::pin(self.get_message(message_id))
	}

	fn list<'a>(
		&'a self,
		status: Option<ProcessingStatus>,
		limit: u32,
	) -> BoxFuture<'a, Result<Vec<ProcessingState>, StateStoreError>> {
		Box::pin(self.list_messages(status, limit))
	}

	fn reset<'a>(
		&'a self,
		message_id: &'a str,
	) -> BoxFuture<'a, Result<ProcessingState, StateStoreError>> {
		Box::pin(self.reset_message(message_id))
	}
}

fn parse_status(raw: &str) -> Result<ProcessingStatus, StateStoreError> {
	raw.parse().map_err(|_| StateStoreError::Backend {
		message: format!("Stored status {raw:?} is not a known processing status."),
	})
}

fn backend(err: sqlx::Error) -> StateStoreError {
	StateStoreError::Backend { message: err.to_string() }
}
