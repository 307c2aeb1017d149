// SPDX-License-Identifier: MIT

//! The REST adapter: submission ingest, status, confirmation, and the
//! transparency data server.
//!
//! This layer is deliberately thin. It creates rows and reads rows; all
//! verification and mutation of the authoritative list happens in the FSM
//! driver. Handlers are plain async functions over [`ApiState`], so tests
//! can call them without a listening socket.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::db::{Submission, TransparencyRecord};
use crate::fsm::SubmissionState;
use crate::sigsum::Hash;

#[derive(Clone)]
pub struct ApiState {
    pub db: SqlitePool,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub domain: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub code: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/submit", post(submit))
        .route("/status/{uid}", get(status))
        .route("/transparency/{hash}", get(transparency))
        .route("/confirm/{uid}", post(confirm))
        .with_state(state)
}

/// Bind and serve the API until the token is cancelled.
pub async fn serve(
    state: ApiState,
    addr: &str,
    halt_token: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr, "API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { halt_token.cancelled().await })
        .await?;
    Ok(())
}

/// Accept a new submission, enforcing at most one non-terminal submission
/// per domain.
#[instrument(skip_all, fields(domain = request.domain))]
pub async fn submit(
    State(state): State<ApiState>,
    Json(request): Json<SubmitRequest>,
) -> (StatusCode, Json<Value>) {
    let mut conn = match state.db.acquire().await {
        Ok(conn) => conn,
        Err(error) => return internal_error(error),
    };

    match Submission::active_for_domain(&mut conn, &request.domain).await {
        Err(error) => return internal_error(error),
        Ok(Some(_)) => {
            return bad_request(
                "A validation attempt for this domain is already in progress. \
                 Please wait until the previous attempt reaches a final state \
                 before submitting again.",
            )
        }
        Ok(None) => {}
    }

    let submission = Submission::new(&request.domain);
    if let Err(error) = submission.insert(&mut conn).await {
        return internal_error(error);
    }
    tracing::info!(submission = submission.id, "Submission accepted");
    (
        StatusCode::OK,
        Json(json!({
            "uid": submission.id,
            "message": "Domain submitted successfully",
        })),
    )
}

/// Report the state and event log of a submission.
#[instrument(skip(state))]
pub async fn status(
    State(state): State<ApiState>,
    Path(uid): Path<String>,
) -> (StatusCode, Json<Value>) {
    let mut conn = match state.db.acquire().await {
        Ok(conn) => conn,
        Err(error) => return internal_error(error),
    };
    match Submission::get(&mut conn, &uid).await {
        Ok(submission) => (
            StatusCode::OK,
            Json(json!({
                "domain": submission.domain,
                "status": submission.status,
                "logs": submission.log_entries(),
            })),
        ),
        Err(sqlx::Error::RowNotFound) => not_found("Submission not found"),
        Err(error) => internal_error(error),
    }
}

/// Serve a transparency record by its payload hash. This is the endpoint
/// the list builder replays the log against.
#[instrument(skip(state))]
pub async fn transparency(
    State(state): State<ApiState>,
    Path(hash): Path<String>,
) -> (StatusCode, Json<Value>) {
    let mut conn = match state.db.acquire().await {
        Ok(conn) => conn,
        Err(error) => return internal_error(error),
    };
    match TransparencyRecord::get_by_hash(&mut conn, &hash).await {
        Ok(Some(record)) => (
            StatusCode::OK,
            Json(json!({
                "createdAt": record.created_at,
                "hash": record.hash,
                "payload": record.payload,
                "proof": record.proof,
                "signature": record.signature,
            })),
        ),
        Ok(None) => not_found("Transparency record not found"),
        Err(error) => internal_error(error),
    }
}

/// Confirm a submission with the raw token issued in email mode.
#[instrument(skip(state, request))]
pub async fn confirm(
    State(state): State<ApiState>,
    Path(uid): Path<String>,
    Json(request): Json<ConfirmRequest>,
) -> (StatusCode, Json<Value>) {
    let mut conn = match state.db.acquire().await {
        Ok(conn) => conn,
        Err(error) => return internal_error(error),
    };
    let mut submission = match Submission::get(&mut conn, &uid).await {
        Ok(submission) => submission,
        Err(sqlx::Error::RowNotFound) => return not_found("Submission not found"),
        Err(error) => return internal_error(error),
    };

    if submission.status != SubmissionState::AwaitingConfirmation {
        return bad_request("Submission is not awaiting confirmation");
    }
    if let Some(wait_until) = submission.wait_until {
        if Utc::now() > wait_until {
            return bad_request("Confirmation period has expired");
        }
    }

    let hashed_code = Hash::of(request.code.as_bytes()).to_hex();
    let stored = submission.validation_token.clone().unwrap_or_default();
    if hashed_code.as_bytes().ct_eq(stored.as_bytes()).unwrap_u8() != 1 {
        return bad_request("Invalid confirmation code");
    }

    submission.append_log("submission confirmed via confirmation token");
    submission.append_log(&format!(
        "state updated to '{}'",
        SubmissionState::Confirmed
    ));
    submission.status = SubmissionState::Confirmed;
    if let Err(error) = submission.save(&mut conn).await {
        return internal_error(error);
    }
    (
        StatusCode::OK,
        Json(json!({"message": "Submission confirmed"})),
    )
}

fn bad_request(message: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message})))
}

fn not_found(message: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({"error": message})))
}

fn internal_error(error: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    tracing::error!(%error, "Request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error"})),
    )
}
