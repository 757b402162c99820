// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the transport, archive, storage, and update pipeline layers.

use std::{path::PathBuf, time::Duration};

use http::StatusCode;

/// Errors that occur while talking to the distribution point.
///
/// All of these are expected to happen occasionally on a field device. The update coordinator
/// never retries within a run; the next poll tick or push notification is the retry.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// An I/O error occurred.
    ///
    /// This is very likely due to temporary networking issues. Be aware, however, that it could
    /// be because the configured hostname or port is incorrect, in which case retrying will
    /// never succeed.
    #[error("an I/O error occurred: {0}")]
    Io(std::io::Error),

    /// OpenSSL could not be configured for the connection.
    #[error("one or more openssl errors occurred: {0}")]
    SslErrors(#[from] openssl::error::ErrorStack),

    /// The TLS session with the peer failed.
    ///
    /// This covers handshake failures, including the peer presenting a certificate that does not
    /// chain to the configured certificate authority.
    #[error("an SSL error occurred: {0}")]
    Ssl(#[from] openssl::ssl::Error),

    /// The peer violated HTTP/1.1 or closed the connection mid-exchange.
    #[error("an HTTP error occurred: {0}")]
    Http(#[from] hyper::Error),

    /// The request could not be constructed; this is a bug or an unusable update identifier.
    #[error("failed to build the HTTP request: {0}")]
    InvalidRequest(#[from] http::Error),

    /// The exchange did not complete within the configured request timeout.
    #[error("the request did not complete within {0:?}")]
    Timeout(Duration),

    /// The distribution point replied with a non-success status and an unstructured body.
    #[error("the distribution point responded with {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// The distribution point replied with a structured JSON error.
    #[error("the distribution point reported an error ({status}): {body}")]
    Remote {
        status: StatusCode,
        body: serde_json::Value,
    },

    /// The distribution point claimed to send a JSON error, but it wasn't valid JSON.
    #[error("could not parse the error message produced by the distribution point ({status})")]
    UnparsableError {
        status: StatusCode,
        #[source]
        source: serde_json::Error,
    },

    /// A successful response did not have the expected shape.
    #[error("failed to decode the response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The response body was larger than the configured limit.
    #[error("the response body exceeded {limit} bytes")]
    TooLarge { limit: usize },
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        // I/O errors may occur due to a TLS error, like if the peer rejects our certificate and
        // we then read from the socket. Map those to the more specific variant.
        if let Some(ssl_error) = std::error::Error::source(&error)
            .and_then(|error| error.downcast_ref::<openssl::error::ErrorStack>())
        {
            TransportError::Ssl(ssl_error.to_owned().into())
        } else {
            TransportError::Io(error)
        }
    }
}

/// Errors produced while unpacking and authenticating an update container.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ArchiveError {
    /// The container is readable but lacks one of the required members.
    ///
    /// No cryptographic check is attempted when this is returned.
    #[error("the update container has no '{missing}' member")]
    Malformed { missing: &'static str },

    /// The bytes are not a readable tar archive.
    #[error("failed to read the update container: {0}")]
    Read(#[from] std::io::Error),

    /// The signature member is not valid base64 text.
    #[error("the detached signature is not valid base64")]
    SignatureEncoding,

    /// The image does not match the detached signature under the trusted public key.
    ///
    /// This means the image was corrupted or was not produced by the signing authority. It is
    /// never retried and the bytes are discarded.
    #[error("the image signature was not successfully verified")]
    Verification,

    /// OpenSSL failed to set up the signature check.
    #[error("openssl failed to verify the image: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

/// Errors writing or reading the device's local state.
///
/// These are recoverable: the state simply remains stale and a later check tries again.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} contains unexpected data: {contents:?}")]
    Corrupt { path: PathBuf, contents: String },
}

/// Errors loading the trust material at startup.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TrustError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The certificates or keys were rejected by OpenSSL.
    ///
    /// This usually indicates the private key does not match the certificate or a file is not
    /// PEM-encoded.
    #[error("openssl could not be configured: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),
}

/// The reasons an update run can fail.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum UpdateError {
    #[error("communication with the distribution point failed: {0}")]
    Transport(#[from] TransportError),

    #[error("the update container was rejected: {0}")]
    Archive(#[from] ArchiveError),

    #[error("failed to persist the update: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to trigger the reboot: {0}")]
    Reboot(#[source] std::io::Error),
}

impl UpdateError {
    /// Returns true if the payload failed authentication.
    ///
    /// These indicate either corruption or a trust failure and must be surfaced loudly.
    pub fn is_signature_failure(&self) -> bool {
        matches!(
            self,
            UpdateError::Archive(
                ArchiveError::Verification | ArchiveError::SignatureEncoding | ArchiveError::Crypto(_)
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_failures_are_flagged() {
        assert!(UpdateError::from(ArchiveError::Verification).is_signature_failure());
        assert!(UpdateError::from(ArchiveError::SignatureEncoding).is_signature_failure());
        assert!(
            !UpdateError::from(ArchiveError::Malformed {
                missing: "signature.txt"
            })
            .is_signature_failure()
        );
        assert!(!UpdateError::from(TransportError::Timeout(Duration::from_secs(1)))
            .is_signature_failure());
    }

    #[test]
    fn plain_io_error_stays_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        match TransportError::from(io_error) {
            TransportError::Io(error) => {
                assert_eq!(error.kind(), std::io::ErrorKind::ConnectionRefused)
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
