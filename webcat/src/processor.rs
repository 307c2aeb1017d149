// SPDX-License-Identifier: MIT

//! The background submission processor.
//!
//! A fixed-cadence polling loop selects every non-terminal submission and
//! spawns one task per submission that runs the FSM driver. Tasks share
//! nothing in memory; the database row is the only coordination artifact,
//! so a crashed or restarted processor simply resumes from the persisted
//! states.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::db::Submission;
use crate::fsm::Driver;

pub struct Processor {
    db: SqlitePool,
    driver: Arc<Driver>,
    cadence: Duration,
}

/// A handle on a running processor, mirroring the service listener
/// pattern: cancel the token to stop polling, then wait for in-flight
/// tasks to drain.
pub struct ProcessorHandle {
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    halt_token: CancellationToken,
}

impl ProcessorHandle {
    /// Stop polling and wait for in-flight submission tasks to complete.
    pub async fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.task.await??;
        Ok(())
    }

    /// A cancellation token which can be used to start a graceful
    /// shutdown of the processor.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt_token.clone()
    }

    pub async fn wait_to_finish(self) -> anyhow::Result<()> {
        self.task.await??;
        Ok(())
    }
}

impl Processor {
    pub fn new(db: SqlitePool, driver: Driver, cadence: Duration) -> Self {
        Processor {
            db,
            driver: Arc::new(driver),
            cadence,
        }
    }

    /// Run the polling loop until the returned handle is halted.
    #[instrument(skip_all, name = "processor")]
    pub fn run(self) -> ProcessorHandle {
        let halt_token = CancellationToken::new();
        let processor_halt_token = halt_token.clone();
        let task = tokio::spawn(
            async move {
                let mut tasks: JoinSet<String> = JoinSet::new();
                let mut in_flight: HashSet<String> = HashSet::new();
                let mut ticker = tokio::time::interval(self.cadence);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = processor_halt_token.cancelled() => {
                            tracing::info!("Shutdown requested; waiting for in-flight submissions");
                            break;
                        }
                        _ = ticker.tick() => {
                            while let Some(finished) = tasks.try_join_next() {
                                match finished {
                                    Ok(id) => { in_flight.remove(&id); }
                                    Err(error) => tracing::error!(?error, "Submission task panicked"),
                                }
                            }
                            if let Err(error) = self.poll(&mut tasks, &mut in_flight).await {
                                tracing::error!(?error, "Failed to poll for runnable submissions");
                            }
                        }
                    }
                }

                while let Some(finished) = tasks.join_next().await {
                    if let Err(error) = finished {
                        tracing::error!(?error, "Submission task panicked");
                    }
                }
                Ok::<_, anyhow::Error>(())
            }
            .in_current_span(),
        );

        ProcessorHandle { task, halt_token }
    }

    /// Spawn a driver task for every runnable submission that doesn't
    /// already have one.
    async fn poll(
        &self,
        tasks: &mut JoinSet<String>,
        in_flight: &mut HashSet<String>,
    ) -> anyhow::Result<()> {
        let mut conn = self.db.acquire().await?;
        let submissions = Submission::runnable(&mut conn).await?;
        drop(conn);

        for submission in submissions {
            if !in_flight.insert(submission.id.clone()) {
                continue;
            }
            let driver = self.driver.clone();
            tasks.spawn(
                async move {
                    if let Err(error) = driver.advance(&submission.id).await {
                        tracing::error!(
                            ?error,
                            submission = submission.id,
                            domain = submission.domain,
                            "Driver invocation failed"
                        );
                    }
                    submission.id
                }
                .in_current_span(),
            );
        }
        Ok(())
    }
}
