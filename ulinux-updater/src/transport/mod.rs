// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! HTTP/1.1 over mutually authenticated TLS.
//!
//! The device is a client of the distribution point (update checks, downloads, heartbeats) and a
//! server for push notifications. Both directions use the [`TrustStore`](crate::trust::TrustStore)
//! loaded at startup: the device presents its own certificate and requires the peer's to chain
//! to the configured certificate authority.

use std::future::Future;

use bytes::Bytes;
use openssl::{nid::Nid, ssl::SslRef};

use crate::{
    error::TransportError,
    protocol::{UpdateCandidate, UpdateId},
};

mod client;
mod listener;

pub use client::DistributionClient;
pub use listener::{Listener, listen};

/// The remote service that publishes updates.
pub trait DistributionPoint: Send + Sync + 'static {
    /// Ask whether an update newer than `since` (Unix seconds) is available.
    fn check_for_update(
        &self,
        since: i64,
    ) -> impl Future<Output = Result<Option<UpdateCandidate>, TransportError>> + Send;

    /// Fetch the update container for `id`.
    ///
    /// A response labelled as JSON is an error report, never a container, regardless of its
    /// status code.
    fn download(&self, id: &UpdateId)
    -> impl Future<Output = Result<Bytes, TransportError>> + Send;
}

/// The common name of the certificate the TLS peer authenticated with, if it has one.
pub(crate) fn peer_common_name(ssl: &SslRef) -> Option<String> {
    let certificate = ssl.peer_certificate()?;
    let entry = certificate
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()?;
    entry.data().as_utf8().ok().map(|name| name.to_string())
}
