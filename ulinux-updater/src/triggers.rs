// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The two ways an update run starts.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    coordinator::{Coordinator, Outcome},
    protocol::PushNotification,
    reboot::Rebooter,
    transport::DistributionPoint,
};

/// The shortest polling interval honored; anything smaller is raised to it.
pub const MIN_POLLING_INTERVAL: Duration = Duration::from_secs(1);

/// Ask the distribution point for updates every `interval` until `halt_token` is cancelled.
///
/// The first check happens immediately. Ticks that come due while a check is running are
/// skipped rather than bunched up, and a run that is in progress when the token is cancelled is
/// allowed to finish.
#[instrument(skip_all, fields(interval = ?interval))]
pub async fn poll<D, R>(
    coordinator: Arc<Coordinator<D, R>>,
    interval: Duration,
    halt_token: CancellationToken,
) where
    D: DistributionPoint,
    R: Rebooter,
{
    let mut ticker = tokio::time::interval(interval.max(MIN_POLLING_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = halt_token.cancelled() => {
                tracing::info!("Shutdown requested, no further update checks will be made");
                break;
            },
            _ = ticker.tick() => {
                match coordinator.on_poll().await {
                    Outcome::Applied { update_id, .. } => {
                        tracing::info!(%update_id, "Update applied by scheduled check");
                    }
                    outcome => tracing::debug!(?outcome, "Scheduled update check finished"),
                }
            }
        }
    }
}

/// A push notification handler for [`crate::transport::listen`].
///
/// The returned future runs a whole pipeline; the listener acknowledges the notification before
/// it starts.
pub fn push_handler<D, R>(
    coordinator: Arc<Coordinator<D, R>>,
) -> impl Fn(PushNotification) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
+ Clone
+ Send
+ Sync
+ 'static
where
    D: DistributionPoint,
    R: Rebooter,
{
    move |notification| {
        let coordinator = coordinator.clone();
        Box::pin(async move {
            match coordinator.on_push(notification).await {
                Outcome::Busy => {
                    tracing::info!("An update run is already in progress; push notification ignored");
                }
                outcome => tracing::debug!(?outcome, "Pushed update run finished"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        archive::{Verifier, tests as fixtures},
        error::TransportError,
        protocol::{UpdateCandidate, UpdateId},
        reboot::LogRebooter,
        state::StateStore,
    };

    #[derive(Default)]
    struct CountingDistribution {
        checks: AtomicUsize,
    }

    impl DistributionPoint for CountingDistribution {
        async fn check_for_update(
            &self,
            _since: i64,
        ) -> Result<Option<UpdateCandidate>, TransportError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }

        async fn download(&self, _id: &UpdateId) -> Result<Bytes, TransportError> {
            unreachable!("nothing is ever announced")
        }
    }

    fn coordinator(dir: &TempDir) -> Arc<Coordinator<CountingDistribution, LogRebooter>> {
        let key = fixtures::signing_key();
        Arc::new(Coordinator::new(
            CountingDistribution::default(),
            Verifier::new(fixtures::public_key(&key)),
            StateStore::new(dir.path()),
            dir.path().join("firmware.img"),
            LogRebooter,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn polls_immediately_then_on_interval() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let coordinator = coordinator(&dir);
        let halt_token = CancellationToken::new();
        let poller = tokio::spawn(poll(
            coordinator.clone(),
            Duration::from_secs(60),
            halt_token.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(coordinator.distribution().checks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(coordinator.distribution().checks.load(Ordering::SeqCst), 3);

        halt_token.cancel();
        poller.await?;
        Ok(())
    }

    #[tokio::test]
    async fn push_handler_runs_the_pipeline() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let coordinator = coordinator(&dir);
        coordinator.state().record_update_timestamp(10)?;

        let handler = push_handler(coordinator.clone());
        handler(PushNotification {
            timestamp: 5,
            id: UpdateId::new("fw-old"),
        })
        .await;
        // The stale push never reached the distribution point.
        assert_eq!(coordinator.distribution().checks.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.state().last_update_timestamp(), 10);
        Ok(())
    }
}
