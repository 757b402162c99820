// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The loaded trust material, shared read-only by the transport and the image verifier.

use std::path::Path;

use openssl::{
    pkey::{PKey, Public},
    rsa::Rsa,
    ssl::{SslAcceptor, SslConnector},
};

use crate::{config::Credentials, error::TrustError};

/// TLS configuration for both directions plus the signature verification key.
///
/// Built once at startup and never mutated; wrap it in an [`std::sync::Arc`] to share it.
pub struct TrustStore {
    connector: SslConnector,
    acceptor: SslAcceptor,
    signing_key: PKey<Public>,
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustStore")
            .field("signing_key_bits", &self.signing_key.bits())
            .finish_non_exhaustive()
    }
}

impl TrustStore {
    /// Load and validate the trust material referenced by `credentials`.
    ///
    /// # Errors
    ///
    /// Returns an error if any file is unreadable, if the private key does not match the
    /// certificate, or if the signing key is not an RSA public key in PEM format.
    pub fn load(credentials: &Credentials) -> Result<Self, TrustError> {
        let ca_pem = read(&credentials.ca_certificate)?;
        let connector = credentials.ssl_connector()?;
        let acceptor = credentials.ssl_acceptor(&ca_pem)?;
        let signing_key = signing_key_from_pem(&read(&credentials.signing_public_key)?)?;
        tracing::debug!(
            bits = signing_key.bits(),
            "Loaded the image signing public key"
        );

        Ok(Self {
            connector,
            acceptor,
            signing_key,
        })
    }

    /// TLS configuration for connections to the distribution point.
    pub fn connector(&self) -> &SslConnector {
        &self.connector
    }

    /// TLS configuration for the push listener; clients must present a certificate.
    pub fn acceptor(&self) -> &SslAcceptor {
        &self.acceptor
    }

    /// The key detached image signatures are checked against.
    pub fn signing_key(&self) -> &PKey<Public> {
        &self.signing_key
    }
}

fn read(path: &Path) -> Result<Vec<u8>, TrustError> {
    std::fs::read(path).map_err(|source| TrustError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Accepts both SubjectPublicKeyInfo ("BEGIN PUBLIC KEY") and PKCS #1 ("BEGIN RSA PUBLIC KEY").
pub(crate) fn signing_key_from_pem(pem: &[u8]) -> Result<PKey<Public>, openssl::error::ErrorStack> {
    PKey::public_key_from_pem(pem)
        .or_else(|_| Rsa::public_key_from_pem_pkcs1(pem).and_then(PKey::from_rsa))
}
