// SPDX-License-Identifier: MIT

//! The per-submission state machine and its driver.
//!
//! The state graph is small, closed, and linear, so it is a plain enum
//! with a successor table rather than a generic state machine. Each driver
//! invocation advances one submission as far as it can without blocking on
//! a wall-clock deadline, persisting every transition; the polling
//! scheduler resumes it later. Invoking the driver twice on the same row
//! in the same state is safe.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, SecondsFormat, Utc};
use rand::RngCore;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::instrument;

use crate::config::ConfirmationMode;
use crate::db::{ListEntry, Submission, TransparencyRecord};
use crate::error::FsmError;
use crate::payload::{Action, CanonicalPayload};
use crate::sigsum::{
    client::{submit_leaf, LeafRequest, SubmitConfig},
    types::sign_leaf_message,
    Hash, KeyPair, Policy, Signature, SigsumError, SigsumProof,
};
use crate::validator::{canonicalize_hostname, normalize_sigstore, Prober};

/// How long an email-mode submission waits for external confirmation.
const EMAIL_CONFIRMATION_WINDOW: i64 = 12 * 60 * 60;

/// How long a recheck-mode submission waits before headers are re-fetched.
const RECHECK_DELAY: i64 = 60;

/// Per-log budget for leaf submission.
const PER_LOG_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

/// The states a submission moves through. Except for `Failed`, which is
/// reachable from every non-terminal state, the graph is linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize, serde::Deserialize)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    Ingested,
    DnsChecked,
    HeadersValid,
    ListChecked,
    AwaitingConfirmation,
    Confirmed,
    PayloadSigned,
    SigsumSubmitted,
    Completed,
    Failed,
}

impl SubmissionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionState::Ingested => "ingested",
            SubmissionState::DnsChecked => "dns_checked",
            SubmissionState::HeadersValid => "headers_valid",
            SubmissionState::ListChecked => "list_checked",
            SubmissionState::AwaitingConfirmation => "awaiting_confirmation",
            SubmissionState::Confirmed => "confirmed",
            SubmissionState::PayloadSigned => "payload_signed",
            SubmissionState::SigsumSubmitted => "sigsum_submitted",
            SubmissionState::Completed => "completed",
            SubmissionState::Failed => "failed",
        }
    }

    /// The next state on the success path, if any.
    pub fn successor(self) -> Option<SubmissionState> {
        match self {
            SubmissionState::Ingested => Some(SubmissionState::DnsChecked),
            SubmissionState::DnsChecked => Some(SubmissionState::HeadersValid),
            SubmissionState::HeadersValid => Some(SubmissionState::ListChecked),
            SubmissionState::ListChecked => Some(SubmissionState::AwaitingConfirmation),
            SubmissionState::AwaitingConfirmation => Some(SubmissionState::Confirmed),
            SubmissionState::Confirmed => Some(SubmissionState::PayloadSigned),
            SubmissionState::PayloadSigned => Some(SubmissionState::SigsumSubmitted),
            SubmissionState::SigsumSubmitted => Some(SubmissionState::Completed),
            SubmissionState::Completed | SubmissionState::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SubmissionState::Completed | SubmissionState::Failed)
    }

    /// Whether `next` is adjacent to `self` in the state graph.
    pub fn can_transition(self, next: SubmissionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == SubmissionState::Failed || self.successor() == Some(next)
    }
}

impl std::fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submits a signed leaf to a transparency log and returns a proof that
/// has already been verified against the publisher's trust policy.
#[async_trait]
pub trait LeafPublisher: Send + Sync {
    async fn publish(&self, request: &LeafRequest) -> Result<SigsumProof, SigsumError>;
}

/// The production [`LeafPublisher`]: submits to the logs named in the
/// Sigsum policy with the standard per-log timeout.
pub struct SigsumPublisher {
    config: SubmitConfig,
}

impl SigsumPublisher {
    pub fn new(policy: Policy) -> Self {
        SigsumPublisher {
            config: SubmitConfig {
                policy,
                per_log_timeout: PER_LOG_TIMEOUT,
            },
        }
    }
}

#[async_trait]
impl LeafPublisher for SigsumPublisher {
    async fn publish(&self, request: &LeafRequest) -> Result<SigsumProof, SigsumError> {
        submit_leaf(&self.config, request).await
    }
}

/// The FSM driver. One instance is shared by all processor tasks; all
/// per-submission state lives in the database row.
pub struct Driver {
    db: SqlitePool,
    prober: Arc<dyn Prober>,
    publisher: Arc<dyn LeafPublisher>,
    keypair: KeyPair,
    confirmation_mode: ConfirmationMode,
}

impl Driver {
    pub fn new(
        db: SqlitePool,
        prober: Arc<dyn Prober>,
        publisher: Arc<dyn LeafPublisher>,
        keypair: KeyPair,
        confirmation_mode: ConfirmationMode,
    ) -> Self {
        Driver {
            db,
            prober,
            publisher,
            keypair,
            confirmation_mode,
        }
    }

    /// Advance a submission as far as possible. Returns without error when
    /// the submission is waiting on a deadline or has reached a terminal
    /// state; an [`FsmError`] means the driver itself could not proceed
    /// (the database, not the submission) and the next poll should retry.
    #[instrument(skip(self), err)]
    pub async fn advance(&self, submission_id: &str) -> Result<(), FsmError> {
        let mut conn = self.db.acquire().await?;
        let mut sub = Submission::get(&mut conn, submission_id).await?;

        loop {
            let before = sub.status;
            match before {
                SubmissionState::Ingested => self.check_dns(&mut conn, &mut sub).await?,
                SubmissionState::DnsChecked => self.check_https(&mut conn, &mut sub).await?,
                SubmissionState::HeadersValid => self.check_list(&mut conn, &mut sub).await?,
                SubmissionState::ListChecked => {
                    self.schedule_confirmation(&mut conn, &mut sub).await?
                }
                SubmissionState::AwaitingConfirmation => {
                    self.check_confirmation(&mut conn, &mut sub).await?
                }
                SubmissionState::Confirmed => self.sign_payload(&mut conn, &mut sub).await?,
                SubmissionState::PayloadSigned => {
                    // Persist the new state before the log RPC so a crash
                    // cannot lead to a re-sign, only to an idempotent
                    // re-submission of the same leaf.
                    self.transition(
                        &mut conn,
                        &mut sub,
                        SubmissionState::SigsumSubmitted,
                        "submitting signed payload to the transparency log",
                    )
                    .await?
                }
                SubmissionState::SigsumSubmitted => {
                    self.submit_and_complete(&mut conn, &mut sub).await?
                }
                SubmissionState::Completed | SubmissionState::Failed => break,
            }
            if sub.status == before {
                // Waiting on a deadline; the next poll resumes.
                break;
            }
        }
        Ok(())
    }

    /// Persist a state transition, appending `message` and the transition
    /// itself to the event log.
    async fn transition(
        &self,
        conn: &mut SqliteConnection,
        sub: &mut Submission,
        next: SubmissionState,
        message: &str,
    ) -> Result<(), FsmError> {
        if !sub.status.can_transition(next) {
            return Err(FsmError::IllegalTransition {
                current: sub.status,
                next,
            });
        }
        sub.append_log(message);
        sub.append_log(&format!("state updated to '{next}'"));
        sub.status = next;
        sub.save(conn).await?;
        Ok(())
    }

    async fn fail(
        &self,
        conn: &mut SqliteConnection,
        sub: &mut Submission,
        message: &str,
    ) -> Result<(), FsmError> {
        tracing::warn!(
            submission = sub.id,
            domain = sub.domain,
            message,
            "Submission failed"
        );
        self.transition(conn, sub, SubmissionState::Failed, message)
            .await
    }

    async fn check_dns(
        &self,
        conn: &mut SqliteConnection,
        sub: &mut Submission,
    ) -> Result<(), FsmError> {
        let canonical = match canonicalize_hostname(&sub.domain) {
            Ok(canonical) => canonical,
            Err(error) => return self.fail(conn, sub, &error.to_string()).await,
        };
        match self.prober.resolve(&canonical).await {
            Err(error) => self.fail(conn, sub, &error.to_string()).await,
            Ok(addresses) => {
                sub.domain = canonical;
                self.transition(
                    conn,
                    sub,
                    SubmissionState::DnsChecked,
                    &format!("DNS lookup successful: {addresses:?}"),
                )
                .await
            }
        }
    }

    async fn check_https(
        &self,
        conn: &mut SqliteConnection,
        sub: &mut Submission,
    ) -> Result<(), FsmError> {
        let headers = match self.prober.fetch_headers(&sub.domain).await {
            Ok(headers) => headers,
            Err(error) => return self.fail(conn, sub, &error.to_string()).await,
        };
        match normalize_sigstore(&headers) {
            Err(error) => {
                self.fail(conn, sub, &format!("header validation failed: {error}"))
                    .await
            }
            Ok(normalized) => {
                sub.signers = Some(normalized.signers);
                sub.threshold = Some(normalized.threshold);
                sub.action = Some(normalized.action);
                self.transition(
                    conn,
                    sub,
                    SubmissionState::HeadersValid,
                    "HTTPS check and header validation successful",
                )
                .await
            }
        }
    }

    async fn check_list(
        &self,
        conn: &mut SqliteConnection,
        sub: &mut Submission,
    ) -> Result<(), FsmError> {
        let action = require(sub.action, "action")?;
        let entry = ListEntry::get(conn, &sub.domain).await?;
        match (action, entry.is_some()) {
            (Action::Add, true) => {
                self.fail(conn, sub, "domain already exists in the list; cannot add")
                    .await
            }
            (Action::Delete | Action::Modify, false) => {
                self.fail(conn, sub, "domain does not exist; cannot delete or modify")
                    .await
            }
            _ => {
                self.transition(conn, sub, SubmissionState::ListChecked, "list check passed")
                    .await
            }
        }
    }

    async fn schedule_confirmation(
        &self,
        conn: &mut SqliteConnection,
        sub: &mut Submission,
    ) -> Result<(), FsmError> {
        match self.confirmation_mode {
            ConfirmationMode::Email => {
                let mut token = [0_u8; 16];
                rand::rngs::OsRng.fill_bytes(&mut token);
                let raw_token = hex::encode(token);
                // Email delivery is out of scope; the raw token is only
                // surfaced through the service log for out-of-band
                // delivery, and only its hash is stored.
                tracing::info!(
                    submission = sub.id,
                    token = raw_token,
                    "Confirmation token issued; deliver to the domain owner out of band"
                );
                sub.validation_token = Some(Hash::of(raw_token.as_bytes()).to_hex());
                let wait_until = Utc::now() + Duration::seconds(EMAIL_CONFIRMATION_WINDOW);
                sub.wait_until = Some(wait_until);
                self.transition(
                    conn,
                    sub,
                    SubmissionState::AwaitingConfirmation,
                    &format!(
                        "validation token issued; waiting for confirmation until {}",
                        wait_until.to_rfc3339_opts(SecondsFormat::Secs, true)
                    ),
                )
                .await
            }
            ConfirmationMode::Recheck => {
                let wait_until = Utc::now() + Duration::seconds(RECHECK_DELAY);
                sub.wait_until = Some(wait_until);
                self.transition(
                    conn,
                    sub,
                    SubmissionState::AwaitingConfirmation,
                    &format!(
                        "recheck scheduled: headers will be re-fetched after {}",
                        wait_until.to_rfc3339_opts(SecondsFormat::Secs, true)
                    ),
                )
                .await
            }
        }
    }

    async fn check_confirmation(
        &self,
        conn: &mut SqliteConnection,
        sub: &mut Submission,
    ) -> Result<(), FsmError> {
        if let Some(wait_until) = sub.wait_until {
            if Utc::now() < wait_until {
                // Still waiting; do not advance.
                return Ok(());
            }
        }
        match self.confirmation_mode {
            ConfirmationMode::Email => {
                self.fail(conn, sub, "waiting period expired without external confirmation")
                    .await
            }
            ConfirmationMode::Recheck => self.recheck_headers(conn, sub).await,
        }
    }

    /// Re-fetch the headers and auto-confirm when they still match the
    /// persisted values byte for byte.
    async fn recheck_headers(
        &self,
        conn: &mut SqliteConnection,
        sub: &mut Submission,
    ) -> Result<(), FsmError> {
        let headers = match self.prober.fetch_headers(&sub.domain).await {
            Ok(headers) => headers,
            Err(error) => {
                return self
                    .fail(conn, sub, &format!("error re-fetching HTTPS headers: {error}"))
                    .await
            }
        };
        let normalized = match normalize_sigstore(&headers) {
            Ok(normalized) => normalized,
            Err(error) => {
                return self
                    .fail(conn, sub, &format!("second header validation failed: {error}"))
                    .await
            }
        };
        if Some(&normalized.signers) != sub.signers.as_ref()
            || Some(normalized.threshold) != sub.threshold
            || Some(normalized.action) != sub.action
        {
            return self
                .fail(
                    conn,
                    sub,
                    "header re-check failed: current headers do not match the initial ones",
                )
                .await;
        }
        self.transition(
            conn,
            sub,
            SubmissionState::Confirmed,
            "header re-check successful; auto-confirming submission",
        )
        .await
    }

    async fn sign_payload(
        &self,
        conn: &mut SqliteConnection,
        sub: &mut Submission,
    ) -> Result<(), FsmError> {
        let payload = CanonicalPayload {
            domain: sub.domain.clone(),
            action: require(sub.action, "action")?,
            signers: require(sub.signers.clone(), "signers")?,
            threshold: require(sub.threshold, "threshold")?,
            confirmation_date: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let canonical = payload.to_canonical_json()?;
        let message = Hash::of(canonical.as_bytes());
        let signature = sign_leaf_message(&self.keypair, &message);

        sub.payload = Some(canonical);
        sub.hash = Some(message.to_hex());
        sub.signature = Some(signature.to_hex());
        self.transition(conn, sub, SubmissionState::PayloadSigned, "payload signed")
            .await
    }

    /// Submit the leaf, then, in a single transaction, create the
    /// transparency record, apply the list mutation, and flip the state to
    /// completed. Safe to re-run after a crash: the log deduplicates
    /// leaves by content.
    async fn submit_and_complete(
        &self,
        conn: &mut SqliteConnection,
        sub: &mut Submission,
    ) -> Result<(), FsmError> {
        let hash_hex = require(sub.hash.clone(), "hash")?;
        let signature_hex = require(sub.signature.clone(), "signature")?;
        let payload = require(sub.payload.clone(), "payload")?;
        let action = require(sub.action, "action")?;
        let signers = require(sub.signers.clone(), "signers")?;
        let threshold = require(sub.threshold, "threshold")?;

        let (message, signature) =
            match (Hash::from_hex(&hash_hex), Signature::from_hex(&signature_hex)) {
                (Ok(message), Ok(signature)) => (message, signature),
                _ => {
                    return self
                        .fail(conn, sub, "persisted hash or signature is not valid hex")
                        .await
                }
            };

        let request = LeafRequest {
            message,
            signature,
            public_key: self.keypair.public(),
        };
        let proof = match self.publisher.publish(&request).await {
            Ok(proof) => proof,
            Err(error) => {
                let error = FsmError::LogSubmission(error);
                return self.fail(conn, sub, &error.to_string()).await;
            }
        };
        sub.append_log("inclusion proof received and verified");

        let outcome: Result<(), FsmError> = async {
            let mut tx = self.db.begin().await?;
            let record = TransparencyRecord::new(
                &sub.id,
                &hash_hex,
                &Hash::of(message.as_bytes()).to_hex(),
                &payload,
                &signature_hex,
                &proof.to_ascii(),
            );
            record.insert(&mut tx).await?;

            let now = Utc::now();
            match action {
                Action::Add => {
                    ListEntry {
                        domain: sub.domain.clone(),
                        signers,
                        threshold,
                        transparency_hash: hash_hex.clone(),
                        updated_at: now,
                    }
                    .insert(&mut tx)
                    .await?;
                }
                Action::Delete => {
                    let deleted = ListEntry::delete(&mut tx, &sub.domain).await?;
                    if deleted != 1 {
                        return Err(FsmError::ListIntegrity(
                            "list entry vanished before deletion".into(),
                        ));
                    }
                }
                Action::Modify => {
                    let mut entry = ListEntry::get(&mut tx, &sub.domain)
                        .await?
                        .ok_or_else(|| {
                            FsmError::ListIntegrity("list entry vanished before update".into())
                        })?;
                    entry.signers = signers;
                    entry.threshold = threshold;
                    entry.transparency_hash = hash_hex.clone();
                    entry.updated_at = now;
                    entry.update(&mut tx).await?;
                }
            }

            sub.append_log(&format!("list entry {action} applied for {}", sub.domain));
            sub.append_log(&format!("state updated to '{}'", SubmissionState::Completed));
            sub.status = SubmissionState::Completed;
            sub.save(&mut tx).await?;
            tx.commit().await?;
            Ok(())
        }
        .await;

        if let Err(error) = outcome {
            // The log leaf exists but our records don't; this needs an
            // operator. Reload the row so the failure transition starts
            // from the persisted state, not the half-mutated one.
            *sub = Submission::get(conn, &sub.id).await?;
            return self
                .fail(
                    conn,
                    sub,
                    &format!("failed to record completion after log submission: {error}"),
                )
                .await;
        }
        Ok(())
    }
}

fn require<T>(value: Option<T>, what: &'static str) -> Result<T, FsmError> {
    value.ok_or(FsmError::MissingField(what))
}
