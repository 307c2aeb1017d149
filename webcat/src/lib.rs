// SPDX-License-Identifier: MIT

/*!
# Webcat

Webcat maintains a transparent trust list of domains that serve
Sigstore-verified content. Domain owners ask for their domain to be added
to, modified in, or removed from the list; the service verifies the
request, confirms ownership, signs a canonical payload, and records it in
a public [Sigsum](https://www.sigsum.org/) transparency log. A batch job
later replays the log into a reproducible, signed binary list.

## Components

The service is made up of three binaries sharing this library:

The **API** (`webcat-api`) is a thin REST adapter. It ingests new
submissions (enforcing at most one in-flight submission per domain),
reports their status, accepts confirmation tokens, and serves transparency
records to anyone wanting to re-verify a log leaf.

The **processor** (`webcat-processor`) polls for unfinished submissions
and drives each one through a persisted state machine: DNS check, HTTPS
header validation, list consistency check, ownership confirmation,
canonical payload signing, transparency log submission, and finally the
authoritative list update. Every transition is durably recorded before the
next step runs, so a crashed processor resumes where it left off.

The **builder** (`webcat-builder`) rebuilds the published list from
nothing but the transparency log and the data server: it re-fetches every
logged payload, re-verifies hashes and signatures against the log leaves,
replays the action stream, and emits a canonical binary list whose
signature is itself submitted to the log.
*/

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

pub mod api;
pub mod builder;
pub mod config;
pub mod db;
pub mod error;
pub mod fsm;
pub mod keys;
pub mod payload;
pub mod processor;
pub mod sigsum;
pub mod validator;

/// Install and manage signal handlers for the process.
///
/// # SIGTERM and SIGINT
///
/// Sending SIGTERM or SIGINT to the process will cause it to stop taking
/// on new work. In-flight submission tasks are allowed to complete before
/// the process shuts down.
#[doc(hidden)]
pub async fn signal_handler(halt_token: CancellationToken) -> Result<(), anyhow::Error> {
    let mut sigterm_stream = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGTERM signal handler");
    })?;
    let mut sigint_stream = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGINT signal handler");
    })?;

    loop {
        tokio::select! {
            _ = sigterm_stream.recv() => {
                tracing::info!("SIGTERM received, beginning service shutdown");
                halt_token.cancel();
            }
            _ = sigint_stream.recv() => {
                tracing::info!("SIGINT received, beginning service shutdown");
                halt_token.cancel();
            }
        }
    }
}
