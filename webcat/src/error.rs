// SPDX-License-Identifier: MIT

//! Error types for submission validation and the state machine driver.

use thiserror::Error;

use crate::fsm::SubmissionState;
use crate::sigsum::SigsumError;

/// Errors raised while validating a submission.
///
/// All of these are fatal for the submission being processed: the driver
/// records the message in the submission's event log and moves the row to
/// the failed state. The distinction between variants matters for
/// operators reading those logs, not for control flow.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// The submitted hostname is not a bare, resolvable-looking domain.
    ///
    /// This is an input error; resubmitting the same string will fail the
    /// same way.
    #[error("invalid hostname: {0}")]
    InvalidHostname(String),

    /// The domain did not resolve to any address.
    ///
    /// This may be transient, but a retry requires a fresh submission:
    /// external instability might indicate a real ownership problem, and
    /// automatic retry would enable replay.
    #[error("DNS lookup failed: {0}")]
    DnsFailure(String),

    /// The HTTPS probe of the domain failed or returned a non-200 status.
    ///
    /// Treated like [`ValidationError::DnsFailure`]: fatal for this
    /// submission.
    #[error("HTTPS check failed: {0}")]
    HttpsFailure(String),

    /// A required header is missing, unparsable, or out of bounds.
    #[error("{0}")]
    HeaderMalformed(String),
}

/// Errors the FSM driver may return.
///
/// These are infrastructure failures, distinct from the per-submission
/// verification failures above: a [`ValidationError`] fails one
/// submission, while an [`FsmError`] means the driver itself could not do
/// its job and the invocation should be retried on a later poll (or, for
/// the internal variants, reported as a bug).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FsmError {
    /// A database read or write failed.
    ///
    /// The row is left in its last persisted state; re-invoking the
    /// driver is safe and is exactly what the next poll does.
    #[error("database operation failed: {0}")]
    Persistence(#[from] sqlx::Error),

    /// The transparency log rejected the leaf, never sequenced it, or
    /// returned a proof that does not verify.
    ///
    /// The affected submission is moved to the failed state; retrying
    /// requires a fresh submission.
    #[error("log submission failed: {0}")]
    LogSubmission(#[from] SigsumError),

    /// An attempted transition is not an edge of the state graph.
    ///
    /// The graph is closed and the driver only follows its edges, so this
    /// is a bug, not an operational condition.
    #[error("illegal state transition {current} -> {next}")]
    IllegalTransition {
        current: SubmissionState,
        next: SubmissionState,
    },

    /// The persisted row lacks a value an earlier state should have
    /// written (for example a payload without a signature).
    ///
    /// Indicates a corrupted row or an out-of-band edit; the driver
    /// refuses to guess.
    #[error("submission row is missing persisted {0}")]
    MissingField(&'static str),

    /// Serializing or re-reading the canonical payload failed.
    #[error("canonical payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    /// The completion transaction observed list state that contradicts
    /// the earlier list check, for example an entry that vanished between
    /// the check and the mutation.
    #[error("list integrity violation: {0}")]
    ListIntegrity(String),
}
