// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The "is-alive" beacon.
//!
//! Periodically tells the distribution point which device this is, which update it last
//! attempted, and which port its push listener is on.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    error::TransportError, protocol::paths, state::StateStore, transport::DistributionClient,
};

/// The form fields of one heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub device_id: Uuid,
    pub firmware_version: String,
    pub port: u16,
}

impl Beacon {
    /// Assemble the current beacon from the device state.
    ///
    /// A missing or unreadable firmware version marker is reported as an empty string.
    pub fn collect(state: &StateStore, device_id: Uuid, port: u16) -> Self {
        let firmware_version = match state.firmware_version() {
            Ok(version) => version.unwrap_or_default(),
            Err(error) => {
                tracing::debug!(?error, "Unable to read the firmware version marker");
                String::new()
            }
        };
        Self {
            device_id,
            firmware_version: firmware_version.trim().to_string(),
            port,
        }
    }

    pub fn form(&self) -> [(&'static str, String); 3] {
        [
            ("deviceId", self.device_id.to_string()),
            ("firmwareVersion", self.firmware_version.clone()),
            ("port", self.port.to_string()),
        ]
    }
}

#[instrument(skip_all, err)]
async fn send(client: &DistributionClient, beacon: &Beacon) -> Result<(), TransportError> {
    let form = beacon.form();
    let fields = form
        .iter()
        .map(|(name, value)| (*name, value.as_str()))
        .collect::<Vec<_>>();
    client.post_form(paths::HEARTBEAT, &fields).await?;
    tracing::debug!("Heartbeat acknowledged");
    Ok(())
}

/// Send a heartbeat every `interval` until `halt_token` is cancelled.
///
/// Failures are logged and otherwise ignored; the next beat is the retry.
#[instrument(skip_all, fields(device_id = %device_id, port = port))]
pub async fn beat(
    client: DistributionClient,
    state: StateStore,
    device_id: Uuid,
    port: u16,
    interval: Duration,
    halt_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = halt_token.cancelled() => {
                tracing::debug!("Shutdown requested, stopping the heartbeat");
                break;
            },
            _ = ticker.tick() => {
                let beacon = Beacon::collect(&state, device_id, port);
                if let Err(error) = send(&client, &beacon).await {
                    tracing::warn!(?error, "Heartbeat was not delivered");
                }
            }
        }
    }
}
