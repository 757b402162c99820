// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# ulinux-updater

A device agent that keeps a device's firmware image in sync with a trusted distribution point.

Every network exchange uses mutually authenticated TLS: the device presents its own certificate
to the distribution point, and anyone pushing an update notification to the device must present
a certificate that chains to the distribution point's certificate authority. On top of that,
every image carries a detached RSA signature which is checked against the signing authority's
public key before anything is written to disk. The transport proves who delivered the bytes;
the signature proves what they are. Neither substitutes for the other.

## Components

Updates are found two ways. The device periodically asks the distribution point whether anything
newer than its last installed update exists, and the distribution point can push a notification
naming an update directly to the device. Both paths feed the same [`coordinator::Coordinator`],
which allows a single pipeline run at a time:

1. Check that the candidate is newer than the last installed update.
2. Download the update container.
3. Verify the image against its detached signature.
4. Write the image and then record the update's timestamp, both durably.
5. Reboot into the new image.

A trigger that arrives while a run is in progress is dropped; the next poll or push picks it
up. Failures at any step leave the previously installed image and the recorded state alone.

Optionally, the device also sends a periodic heartbeat so the distribution point knows which
devices are alive, what they last attempted to install, and where to push notifications.

## Crate features

* **cli** -
  Include the `ulinux-updater` daemon and its CLI. This is a default feature.
*/

pub mod archive;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod reboot;
pub mod state;
pub mod transport;
pub mod triggers;
pub mod trust;
