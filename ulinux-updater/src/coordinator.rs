// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The update pipeline.
//!
//! Both triggers funnel into [`Coordinator::run`], which takes the single-flight guard and then
//! walks the stages in order:
//!
//! ```text
//! Idle -> CheckingStaleness -> Downloading -> Verifying -> Persisting -> Applying -> Idle
//! ```
//!
//! A trigger that arrives while a run holds the guard is dropped, not queued. Any failure ends
//! the run and returns the guard to [`Stage::Idle`] without touching the recorded state.

use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU8, Ordering},
};

use tracing::instrument;

use crate::{
    archive::Verifier,
    error::{StorageError, UpdateError},
    protocol::{PushNotification, UpdateCandidate, UpdateId},
    reboot::{Rebooter, SystemRebooter},
    state::{self, StateStore},
    transport::{DistributionClient, DistributionPoint},
};

/// Where a pipeline run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    Idle = 0,
    CheckingStaleness = 1,
    Downloading = 2,
    Verifying = 3,
    Persisting = 4,
    Applying = 5,
}

impl Stage {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::CheckingStaleness,
            2 => Self::Downloading,
            3 => Self::Verifying,
            4 => Self::Persisting,
            5 => Self::Applying,
            _ => Self::Idle,
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::CheckingStaleness => "checking-staleness",
            Stage::Downloading => "downloading",
            Stage::Verifying => "verifying",
            Stage::Persisting => "persisting",
            Stage::Applying => "applying",
        };
        f.write_str(name)
    }
}

/// The single-flight guard.
///
/// The current [`Stage`] doubles as the lock: the guard is held whenever it is not
/// [`Stage::Idle`].
#[derive(Debug, Default)]
pub struct RunGuard {
    stage: AtomicU8,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::Acquire))
    }

    /// Take the guard, moving it to [`Stage::CheckingStaleness`].
    ///
    /// Returns `None` if a run is already in progress.
    pub fn try_begin(&self) -> Option<RunToken<'_>> {
        self.stage
            .compare_exchange(
                Stage::Idle as u8,
                Stage::CheckingStaleness as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| RunToken { guard: self })
    }
}

/// Proof that the holder owns the current run. Dropping it ends the run.
#[derive(Debug)]
pub struct RunToken<'a> {
    guard: &'a RunGuard,
}

impl RunToken<'_> {
    pub fn advance(&self, stage: Stage) {
        debug_assert_ne!(stage, Stage::Idle, "runs end by dropping the token");
        self.guard.stage.store(stage as u8, Ordering::Release);
        tracing::debug!(%stage, "Update run advanced");
    }

    pub fn stage(&self) -> Stage {
        self.guard.stage()
    }
}

impl Drop for RunToken<'_> {
    fn drop(&mut self) {
        self.guard.stage.store(Stage::Idle as u8, Ordering::Release);
    }
}

/// What started a run.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// The periodic timer; the distribution point is asked for a candidate.
    Poll,
    /// A push notification that already names a candidate.
    Push(UpdateCandidate),
}

impl Trigger {
    fn name(&self) -> &'static str {
        match self {
            Trigger::Poll => "poll",
            Trigger::Push(_) => "push",
        }
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum Outcome {
    /// Another run held the guard; this trigger was ignored.
    Busy,
    /// The distribution point has nothing newer.
    UpToDate,
    /// The pushed candidate is not newer than the installed update.
    Stale { announced: i64, last_update: i64 },
    /// The update was installed and recorded under `timestamp`, and the reboot was started.
    Applied { update_id: UpdateId, timestamp: i64 },
    Failed(UpdateError),
}

/// Sequences update runs for one device.
pub struct Coordinator<D = DistributionClient, R = SystemRebooter> {
    distribution: D,
    verifier: Verifier,
    state: StateStore,
    image_path: PathBuf,
    rebooter: R,
    guard: RunGuard,
}

impl<D: DistributionPoint, R: Rebooter> Coordinator<D, R> {
    pub fn new(
        distribution: D,
        verifier: Verifier,
        state: StateStore,
        image_path: impl Into<PathBuf>,
        rebooter: R,
    ) -> Self {
        Self {
            distribution,
            verifier,
            state,
            image_path: image_path.into(),
            rebooter,
            guard: RunGuard::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.guard.stage()
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn distribution(&self) -> &D {
        &self.distribution
    }

    pub async fn on_poll(&self) -> Outcome {
        self.run(Trigger::Poll).await
    }

    pub async fn on_push(&self, notification: PushNotification) -> Outcome {
        self.run(Trigger::Push(notification.into())).await
    }

    /// Run the pipeline once for `trigger`, unless a run is already in progress.
    ///
    /// Errors never escape; they are logged and reported as [`Outcome::Failed`].
    #[instrument(skip_all, fields(trigger = trigger.name()))]
    pub async fn run(&self, trigger: Trigger) -> Outcome {
        let Some(token) = self.guard.try_begin() else {
            tracing::debug!(stage = %self.stage(), "An update run is already in progress; ignoring trigger");
            return Outcome::Busy;
        };

        match self.pipeline(&token, trigger).await {
            Ok(outcome) => outcome,
            Err(error) if error.is_signature_failure() => {
                tracing::error!(
                    alert = true,
                    stage = %token.stage(),
                    ?error,
                    "The update image failed signature verification and was discarded"
                );
                Outcome::Failed(error)
            }
            Err(error) => {
                tracing::warn!(stage = %token.stage(), ?error, "Update run failed");
                Outcome::Failed(error)
            }
        }
    }

    async fn pipeline(
        &self,
        token: &RunToken<'_>,
        trigger: Trigger,
    ) -> Result<Outcome, UpdateError> {
        let last_update = self.state.last_update_timestamp();
        let (candidate, timestamp) = match trigger {
            Trigger::Poll => {
                let Some(candidate) = self.distribution.check_for_update(last_update).await? else {
                    return Ok(Outcome::UpToDate);
                };
                // The distribution point already judged the candidate newer. Its timestamp is
                // only moved forward so the recorded value never goes backwards.
                let timestamp = candidate.timestamp.max(last_update.saturating_add(1));
                if timestamp != candidate.timestamp {
                    tracing::debug!(
                        update_id = %candidate.id,
                        announced = candidate.timestamp,
                        last_update,
                        timestamp,
                        "Polled update predates the last recorded one"
                    );
                }
                (candidate, timestamp)
            }
            Trigger::Push(candidate) => {
                if !candidate.is_newer_than(last_update) {
                    tracing::debug!(
                        update_id = %candidate.id,
                        announced = candidate.timestamp,
                        last_update,
                        "Candidate is not newer than the installed update"
                    );
                    return Ok(Outcome::Stale {
                        announced: candidate.timestamp,
                        last_update,
                    });
                }
                let timestamp = candidate.timestamp;
                (candidate, timestamp)
            }
        };

        token.advance(Stage::Downloading);
        // Recorded before the download so the heartbeat reports the version being attempted.
        let store = self.state.clone();
        let update_id = candidate.id.clone();
        let recorded = off_runtime(self.state.directory(), move || {
            store.record_firmware_version(&update_id)
        })
        .await;
        if let Err(error) = recorded {
            tracing::warn!(?error, "Failed to record the firmware version being attempted");
        }
        let container = self.distribution.download(&candidate.id).await?;

        token.advance(Stage::Verifying);
        let verified = self.verifier.verify_container(&container)?;
        drop(container);

        token.advance(Stage::Persisting);
        let store = self.state.clone();
        let image_path = self.image_path.clone();
        let image = verified.into_image();
        off_runtime(&self.image_path, move || {
            state::install_image(&image_path, &image)?;
            store.record_update_timestamp(timestamp)
        })
        .await?;
        tracing::info!(update_id = %candidate.id, timestamp, "Update installed");

        token.advance(Stage::Applying);
        self.rebooter.reboot().await.map_err(UpdateError::Reboot)?;

        Ok(Outcome::Applied {
            update_id: candidate.id,
            timestamp,
        })
    }
}

/// Run filesystem work on the blocking pool, since every state write ends in an fsync.
async fn off_runtime<T, F>(path: &Path, work: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    let span = tracing::Span::current();
    tokio::task::spawn_blocking(move || span.in_scope(work))
        .await
        .map_err(|error| StorageError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::other(error),
        })?
}
