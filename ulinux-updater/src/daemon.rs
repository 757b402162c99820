// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Wiring the updater together.

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

use crate::{
    archive::Verifier,
    config::Config,
    coordinator::Coordinator,
    heartbeat,
    reboot::SystemRebooter,
    state::StateStore,
    transport::{self, DistributionClient, Listener},
    triggers,
    trust::TrustStore,
};

/// A running updater: the push listener, the poller, and optionally the heartbeat.
pub struct Daemon {
    coordinator: Arc<Coordinator>,
    listener: Listener,
    poller: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
    halt_token: CancellationToken,
}

impl Daemon {
    /// Load the trust material and start every background task.
    ///
    /// This returns once the push listener is bound. The first update check starts immediately.
    #[instrument(skip_all, err)]
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let trust = Arc::new(
            TrustStore::load(&config.credentials)
                .context("Failed to load the device trust material")?,
        );
        let state = StateStore::new(&config.state_directory);
        let device_id = state.device_id()?;
        tracing::info!(
            %device_id,
            last_update = state.last_update_timestamp(),
            distribution_host = %config.distribution_host,
            "Starting the updater"
        );

        let client = DistributionClient::from_config(&config, trust.clone());
        let coordinator = Arc::new(Coordinator::new(
            client.clone(),
            Verifier::new(trust.signing_key().clone()),
            state.clone(),
            config.image_path.clone(),
            SystemRebooter::from_command(config.reboot_command.as_deref()),
        ));

        let halt_token = CancellationToken::new();
        let listener = transport::listen(
            config.listen_address,
            trust,
            config.request_timeout,
            triggers::push_handler(coordinator.clone()),
            halt_token.clone(),
        )
        .await?;
        let poller = tokio::spawn(
            triggers::poll(
                coordinator.clone(),
                config.polling_interval,
                halt_token.clone(),
            )
            .instrument(tracing::Span::current()),
        );
        let heartbeat = config.heartbeat_interval.map(|interval| {
            tokio::spawn(
                heartbeat::beat(
                    client,
                    state,
                    device_id,
                    listener.port(),
                    interval,
                    halt_token.clone(),
                )
                .instrument(tracing::Span::current()),
            )
        });

        Ok(Self {
            coordinator,
            listener,
            poller,
            heartbeat,
            halt_token,
        })
    }

    /// Get a cancellation token which starts a graceful shutdown when cancelled.
    ///
    /// A pipeline run that is already in progress is allowed to finish.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt_token.clone()
    }

    /// The port the push listener is bound to.
    pub fn listener_port(&self) -> u16 {
        self.listener.port()
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub async fn wait_to_finish(self) -> anyhow::Result<()> {
        self.poller.await?;
        if let Some(heartbeat) = self.heartbeat {
            heartbeat.await?;
        }
        self.listener.wait_to_finish().await
    }

    pub async fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.wait_to_finish().await
    }
}
