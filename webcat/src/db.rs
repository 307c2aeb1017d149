// SPDX-License-Identifier: MIT

//! Database access.
//!
//! The database is the sole coordination point between the API, the
//! processor tasks, and crash recovery: there is no in-memory handoff.
//! Models expose methods over `&mut SqliteConnection` so that multi-write
//! steps can share one transaction.

use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::SqliteConnectOptions, Pool, Sqlite, SqliteConnection, SqlitePool,
};
use tracing::instrument;
use uuid::Uuid;

use crate::fsm::SubmissionState;
use crate::payload::Action;

static MIGRATIONS: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Ensure the database is migrated to the latest version.
#[instrument(skip_all)]
pub async fn migrate(pool: &Pool<Sqlite>) -> anyhow::Result<()> {
    MIGRATIONS
        .run(pool)
        .await
        .context("Migrations could not be applied")?;
    Ok(())
}

/// Get a database pool, creating the database file if needed.
pub async fn pool(db_uri: &str) -> anyhow::Result<Pool<Sqlite>> {
    let opts = SqliteConnectOptions::from_str(db_uri)
        .context("The database URL couldn't be parsed.")?
        .create_if_missing(true)
        .foreign_keys(true);
    SqlitePool::connect_with(opts)
        .await
        .with_context(|| format!("Failed to connect to the database at {db_uri}"))
}

/// One `(timestamp, message)` entry in a submission's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// A domain submission and its progress through the state machine.
///
/// Created by the API on ingest; mutated only by the FSM driver (and the
/// confirmation endpoint); never deleted.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Submission {
    pub id: String,
    /// The raw submitted hostname, replaced with its canonical ASCII form
    /// by the first driver step.
    pub domain: String,
    pub status: SubmissionState,
    /// Append-only JSON array of [`LogEntry`] values.
    pub logs: String,
    /// SHA-256 hex of the confirmation token, in email mode.
    pub validation_token: Option<String>,
    pub wait_until: Option<DateTime<Utc>>,
    /// The normalized signers JSON.
    pub signers: Option<String>,
    pub threshold: Option<i64>,
    pub action: Option<Action>,
    /// The canonical payload, exactly as hashed and signed.
    pub payload: Option<String>,
    /// Hex of the payload's SHA-256 (the message hash).
    pub hash: Option<String>,
    /// Hex of the leaf signature over the message hash.
    pub signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(domain: &str) -> Self {
        let now = Utc::now();
        Submission {
            id: Uuid::new_v4().to_string(),
            domain: domain.to_string(),
            status: SubmissionState::Ingested,
            logs: "[]".to_string(),
            validation_token: None,
            wait_until: None,
            signers: None,
            threshold: None,
            action: None,
            payload: None,
            hash: None,
            signature: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[instrument(skip(conn))]
    pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Submission, sqlx::Error> {
        sqlx::query_as("SELECT * FROM submissions WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *conn)
            .await
    }

    /// The non-terminal submission for a domain, if one exists. The ingest
    /// rule allows at most one.
    #[instrument(skip(conn))]
    pub async fn active_for_domain(
        conn: &mut SqliteConnection,
        domain: &str,
    ) -> Result<Option<Submission>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM submissions \
             WHERE domain = ? AND status NOT IN ('completed', 'failed')",
        )
        .bind(domain)
        .fetch_optional(&mut *conn)
        .await
    }

    /// All submissions the processor should look at: everything that has
    /// not reached a terminal state.
    #[instrument(skip(conn))]
    pub async fn runnable(conn: &mut SqliteConnection) -> Result<Vec<Submission>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM submissions \
             WHERE status NOT IN ('completed', 'failed') \
             ORDER BY created_at",
        )
        .fetch_all(&mut *conn)
        .await
    }

    pub async fn insert(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO submissions \
             (id, domain, status, logs, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.domain)
        .bind(self.status)
        .bind(&self.logs)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Persist every mutable column.
    pub async fn save(&mut self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        self.updated_at = Utc::now();
        sqlx::query(
            "UPDATE submissions SET \
             domain = ?, status = ?, logs = ?, validation_token = ?, wait_until = ?, \
             signers = ?, threshold = ?, action = ?, payload = ?, hash = ?, signature = ?, \
             updated_at = ? \
             WHERE id = ?",
        )
        .bind(&self.domain)
        .bind(self.status)
        .bind(&self.logs)
        .bind(&self.validation_token)
        .bind(self.wait_until)
        .bind(&self.signers)
        .bind(self.threshold)
        .bind(self.action)
        .bind(&self.payload)
        .bind(&self.hash)
        .bind(&self.signature)
        .bind(self.updated_at)
        .bind(&self.id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Append a message to the in-memory event log; the next `save`
    /// persists it.
    pub fn append_log(&mut self, message: &str) {
        let mut entries = self.log_entries();
        entries.push(LogEntry {
            timestamp: Utc::now(),
            message: message.to_string(),
        });
        self.logs = serde_json::to_string(&entries).expect("log entries always serialize");
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        serde_json::from_str(&self.logs).unwrap_or_default()
    }
}

/// The durable record that makes a log leaf reproducible: the canonical
/// payload, its hash, the leaf signature, and the ASCII-serialized
/// inclusion proof. Written exactly once per submission; immutable.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TransparencyRecord {
    pub id: String,
    pub submission_id: String,
    /// Hex of the payload hash (the logged message).
    pub hash: String,
    /// Hex of the log leaf checksum, `H(hash)`; the list builder looks
    /// records up by this.
    pub leaf_hash: String,
    pub payload: String,
    pub signature: String,
    pub proof: String,
    pub created_at: DateTime<Utc>,
}

impl TransparencyRecord {
    pub fn new(
        submission_id: &str,
        hash: &str,
        leaf_hash: &str,
        payload: &str,
        signature: &str,
        proof: &str,
    ) -> Self {
        TransparencyRecord {
            id: Uuid::new_v4().to_string(),
            submission_id: submission_id.to_string(),
            hash: hash.to_string(),
            leaf_hash: leaf_hash.to_string(),
            payload: payload.to_string(),
            signature: signature.to_string(),
            proof: proof.to_string(),
            created_at: Utc::now(),
        }
    }

    pub async fn insert(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO transparency_records \
             (id, submission_id, hash, leaf_hash, payload, signature, proof, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.submission_id)
        .bind(&self.hash)
        .bind(&self.leaf_hash)
        .bind(&self.payload)
        .bind(&self.signature)
        .bind(&self.proof)
        .bind(self.created_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Look a record up by the payload hash or by the leaf checksum; the
    /// data server accepts either.
    #[instrument(skip(conn))]
    pub async fn get_by_hash(
        conn: &mut SqliteConnection,
        hash: &str,
    ) -> Result<Option<TransparencyRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM transparency_records WHERE hash = ? OR leaf_hash = ?")
            .bind(hash)
            .bind(hash)
            .fetch_optional(&mut *conn)
            .await
    }

    #[instrument(skip(conn))]
    pub async fn get_by_submission(
        conn: &mut SqliteConnection,
        submission_id: &str,
    ) -> Result<Vec<TransparencyRecord>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM transparency_records WHERE submission_id = ?")
            .bind(submission_id)
            .fetch_all(&mut *conn)
            .await
    }
}

/// The authoritative present state for one domain.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ListEntry {
    pub domain: String,
    pub signers: String,
    pub threshold: i64,
    pub transparency_hash: String,
    pub updated_at: DateTime<Utc>,
}

impl ListEntry {
    #[instrument(skip(conn))]
    pub async fn get(
        conn: &mut SqliteConnection,
        domain: &str,
    ) -> Result<Option<ListEntry>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM list_entries WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&mut *conn)
            .await
    }

    pub async fn insert(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO list_entries \
             (domain, signers, threshold, transparency_hash, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&self.domain)
        .bind(&self.signers)
        .bind(self.threshold)
        .bind(&self.transparency_hash)
        .bind(self.updated_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn update(&self, conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE list_entries SET \
             signers = ?, threshold = ?, transparency_hash = ?, updated_at = ? \
             WHERE domain = ?",
        )
        .bind(&self.signers)
        .bind(self.threshold)
        .bind(&self.transparency_hash)
        .bind(self.updated_at)
        .bind(&self.domain)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn delete(conn: &mut SqliteConnection, domain: &str) -> Result<u64, sqlx::Error> {
        sqlx::query("DELETE FROM list_entries WHERE domain = ?")
            .bind(domain)
            .execute(&mut *conn)
            .await
            .map(|result| result.rows_affected())
    }
}
