// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Utilities for testing the updater end-to-end: an in-process certificate authority, signed
//! update containers, and a mock distribution point that speaks mutual TLS.

use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    path::{Path, PathBuf},
    pin::Pin,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Context;
use bytes::Bytes;
use http::{
    Method, Request, Response, StatusCode,
    header::{CONTENT_TYPE, HOST},
};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::BigNum,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    ssl::Ssl,
    x509::{
        X509, X509Builder, X509NameBuilder,
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
            SubjectAlternativeName, SubjectKeyIdentifier,
        },
    },
};
use percent_encoding::percent_decode_str;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_openssl::SslStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;
pub use ulinux_updater::archive::{build_container, sign_image, signed_container};
use ulinux_updater::{
    config::{Config, Credentials},
    coordinator::Stage,
    daemon::Daemon,
    protocol::{PushNotification, paths},
    state::StateStore,
    trust::TrustStore,
};

/// The hostname every fixture certificate is valid for.
pub const HOSTNAME: &str = "localhost";
pub const DEVICE_NAME: &str = "ulinux-device";
pub const DISTRIBUTION_NAME: &str = "ulinux-distribution";

fn new_key() -> anyhow::Result<PKey<Private>> {
    Ok(PKey::from_rsa(Rsa::generate(2048)?)?)
}

fn serial_number() -> anyhow::Result<Asn1Integer> {
    let mut serial_number = [0; 20];
    openssl::rand::rand_bytes(&mut serial_number)?;
    let mut serial_number = BigNum::from_slice(&serial_number)?;
    serial_number.set_negative(false);
    Ok(serial_number.to_asn1_integer()?)
}

/// A throwaway certificate authority.
pub struct CertificateAuthority {
    key: PKey<Private>,
    certificate: X509,
}

impl CertificateAuthority {
    pub fn new(common_name: &str) -> anyhow::Result<Self> {
        let key = new_key()?;
        let mut subject_name = X509NameBuilder::new()?;
        subject_name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        let subject_name = subject_name.build();

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial = serial_number()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&subject_name)?;
        builder.set_issuer_name(&subject_name)?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
        builder.set_not_after(Asn1Time::days_from_now(30)?.as_ref())?;
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .build()?,
        )?;
        let subject_key_id =
            SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(subject_key_id)?;
        builder.sign(&key, MessageDigest::sha256())?;

        Ok(Self {
            key,
            certificate: builder.build(),
        })
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    /// Issue a certificate usable for both TLS clients and servers on [`HOSTNAME`].
    pub fn issue(&self, common_name: &str) -> anyhow::Result<(PKey<Private>, X509)> {
        let key = new_key()?;
        let mut subject_name = X509NameBuilder::new()?;
        subject_name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        let subject_name = subject_name.build();

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial = serial_number()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&subject_name)?;
        builder.set_issuer_name(self.certificate.subject_name())?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
        builder.set_not_after(Asn1Time::days_from_now(30)?.as_ref())?;
        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.append_extension(
            ExtendedKeyUsage::new()
                .server_auth()
                .client_auth()
                .build()?,
        )?;
        let alternative_names = SubjectAlternativeName::new()
            .dns(HOSTNAME)
            .ip("127.0.0.1")
            .build(&builder.x509v3_context(Some(&self.certificate), None))?;
        builder.append_extension(alternative_names)?;
        let authority_key_id = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(&self.certificate), None))?;
        builder.append_extension(authority_key_id)?;
        builder.sign(&self.key, MessageDigest::sha256())?;

        Ok((key, builder.build()))
    }
}

#[derive(Clone)]
pub struct Creds {
    /// The device's identity, trusting the distribution point's CA.
    pub device: Credentials,
    /// The distribution point's identity, issued by the same CA.
    pub distribution: Credentials,
    /// An identity from an unrelated CA that trusts the real CA.
    pub rogue: Credentials,
    /// The signing authority's private key; its public half is in every `Credentials`.
    pub signing_key: PKey<Private>,
}

fn write_identity(
    dir: &Path,
    name: &str,
    authority: &CertificateAuthority,
    common_name: &str,
    ca_certificate: &Path,
    signing_public_key: &Path,
) -> anyhow::Result<Credentials> {
    let (key, certificate) = authority.issue(common_name)?;
    let private_key = dir.join(format!("ulinux.{name}.private_key.pem"));
    let certificate_path = dir.join(format!("ulinux.{name}.certificate.pem"));
    std::fs::write(&private_key, key.private_key_to_pem_pkcs8()?)?;
    std::fs::write(&certificate_path, certificate.to_pem()?)?;

    Ok(Credentials {
        private_key,
        certificate: certificate_path,
        ca_certificate: ca_certificate.to_path_buf(),
        signing_public_key: signing_public_key.to_path_buf(),
    })
}

/// Generate a complete set of credentials in the given directory.
///
/// File names match the defaults in [`Config`], so `dir` can be used directly as a
/// credentials directory for the device.
pub fn create_credentials(dir: &Path) -> anyhow::Result<Creds> {
    std::fs::create_dir_all(dir)?;
    let authority = CertificateAuthority::new("ulinux test CA")?;
    let ca_certificate = dir.join("ulinux.ca_certificate.pem");
    std::fs::write(&ca_certificate, authority.certificate().to_pem()?)?;

    let signing_key = new_key()?;
    let signing_public_key = dir.join("ulinux.signing.public_key.pem");
    std::fs::write(&signing_public_key, signing_key.public_key_to_pem()?)?;
    std::fs::write(
        dir.join("ulinux.signing.private_key.pem"),
        signing_key.private_key_to_pem_pkcs8()?,
    )?;

    let device = write_identity(
        dir,
        "device",
        &authority,
        DEVICE_NAME,
        &ca_certificate,
        &signing_public_key,
    )?;
    let distribution = write_identity(
        dir,
        "distribution",
        &authority,
        DISTRIBUTION_NAME,
        &ca_certificate,
        &signing_public_key,
    )?;
    let rogue_authority = CertificateAuthority::new("ulinux rogue CA")?;
    let rogue = write_identity(
        dir,
        "rogue",
        &rogue_authority,
        DISTRIBUTION_NAME,
        &ca_certificate,
        &signing_public_key,
    )?;

    Ok(Creds {
        device,
        distribution,
        rogue,
        signing_key,
    })
}

/// An update advertised by the mock distribution point.
#[derive(Debug, Clone)]
pub struct Published {
    pub id: String,
    pub timestamp: i64,
}

/// Everything the mock distribution point serves and has seen.
#[derive(Debug, Default)]
pub struct MockState {
    pub latest: Option<Published>,
    pub containers: HashMap<String, Bytes>,
    /// The `timestamp` field of every update check.
    pub checks: Vec<i64>,
    /// The identifier of every download request.
    pub downloads: Vec<String>,
    pub heartbeats: Vec<HashMap<String, String>>,
}

/// A distribution point for tests.
///
/// It requires client certificates from the test CA, answers update checks based on
/// [`MockState::latest`], serves containers by identifier, and records heartbeats.
pub struct MockDistributionPoint {
    local_addr: SocketAddr,
    credentials: Credentials,
    state: Arc<Mutex<MockState>>,
    halt_token: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl MockDistributionPoint {
    pub async fn start(credentials: Credentials) -> anyhow::Result<Self> {
        let trust = Arc::new(TrustStore::load(&credentials)?);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(MockState::default()));
        let halt_token = CancellationToken::new();
        let task = tokio::spawn(
            serve(listener, trust, state.clone(), halt_token.clone())
                .instrument(tracing::info_span!("mock_distribution_point")),
        );

        Ok(Self {
            local_addr,
            credentials,
            state,
            halt_token,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state lock poisoned")
    }

    /// Make a container downloadable without announcing it.
    pub fn add_container(&self, id: &str, container: Vec<u8>) {
        self.state()
            .containers
            .insert(id.to_string(), Bytes::from(container));
    }

    /// Announce `id` as the newest update and make `container` downloadable under it.
    pub fn publish(&self, id: &str, timestamp: i64, container: Option<Vec<u8>>) {
        let mut state = self.state();
        state.latest = Some(Published {
            id: id.to_string(),
            timestamp,
        });
        if let Some(container) = container {
            state
                .containers
                .insert(id.to_string(), Bytes::from(container));
        }
    }

    /// Push an update notification to a device, as the distribution point.
    pub async fn push(
        &self,
        device_port: u16,
        notification: &PushNotification,
    ) -> anyhow::Result<StatusCode> {
        push_notification(&self.credentials, device_port, notification).await
    }

    pub async fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.task.await??;
        Ok(())
    }
}

async fn serve(
    listener: TcpListener,
    trust: Arc<TrustStore>,
    state: Arc<Mutex<MockState>>,
    halt_token: CancellationToken,
) -> anyhow::Result<()> {
    let connections = TaskTracker::new();
    loop {
        tokio::select! {
            _ = halt_token.cancelled() => break,
            accepted = listener.accept() => {
                let (tcp_stream, peer_addr) = accepted?;
                let ssl = Ssl::new(trust.acceptor().context())?;
                let state = state.clone();
                connections.spawn(
                    async move {
                        let mut stream = SslStream::new(ssl, tcp_stream)?;
                        if let Err(error) = Pin::new(&mut stream).accept().await {
                            tracing::warn!(?peer_addr, ?error, "Mock distribution point rejected a connection");
                            return Ok(());
                        }
                        let service = service_fn(move |request| respond(request, state.clone()));
                        http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await?;
                        Ok::<_, anyhow::Error>(())
                    }
                    .instrument(tracing::Span::current()),
                );
            }
        }
    }

    connections.close();
    connections.wait().await;
    Ok(())
}

fn form(body: &[u8]) -> HashMap<String, String> {
    url::form_urlencoded::parse(body).into_owned().collect()
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response parts are valid")
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

async fn respond(
    request: Request<Incoming>,
    state: Arc<Mutex<MockState>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(body) => body.to_bytes(),
        Err(_) => return Ok(empty_response(StatusCode::BAD_REQUEST)),
    };

    let mut state = state.lock().expect("mock state lock poisoned");
    let response = match (&parts.method, parts.uri.path()) {
        (&Method::POST, paths::NEW_UPDATE) => {
            let since = form(&body)
                .get("timestamp")
                .and_then(|timestamp| timestamp.parse::<i64>().ok())
                .unwrap_or(0);
            state.checks.push(since);
            let reply = match &state.latest {
                Some(latest) if latest.timestamp > since => serde_json::json!({
                    "message": true,
                    "updateId": latest.id,
                    "timestamp": latest.timestamp,
                }),
                _ => serde_json::json!({ "message": false }),
            };
            json_response(StatusCode::OK, &reply)
        }
        (&Method::GET, path) if path.starts_with(paths::UPDATES) => {
            let id = percent_decode_str(&path[paths::UPDATES.len()..])
                .decode_utf8_lossy()
                .into_owned();
            state.downloads.push(id.clone());
            match state.containers.get(&id) {
                Some(container) => Response::builder()
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(Full::new(container.clone()))
                    .expect("static response parts are valid"),
                None => json_response(
                    StatusCode::NOT_FOUND,
                    &serde_json::json!({ "error": "not found" }),
                ),
            }
        }
        (&Method::POST, paths::HEARTBEAT) => {
            state.heartbeats.push(form(&body));
            empty_response(StatusCode::OK)
        }
        _ => empty_response(StatusCode::NOT_FOUND),
    };

    Ok(response)
}

/// Send a raw body to a device's push endpoint using `credentials`.
pub async fn push_raw(
    credentials: &Credentials,
    device_port: u16,
    body: Vec<u8>,
) -> anyhow::Result<StatusCode> {
    let trust = TrustStore::load(credentials)?;
    let ssl = trust.connector().configure()?.into_ssl(HOSTNAME)?;
    let tcp_stream = TcpStream::connect(("127.0.0.1", device_port)).await?;
    let mut stream = SslStream::new(ssl, tcp_stream)?;
    Pin::new(&mut stream).connect().await?;

    let (mut sender, connection) =
        hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    let connection = tokio::spawn(connection);
    let request = Request::builder()
        .method(Method::POST)
        .uri(paths::NEW_UPDATE)
        .header(HOST, format!("{HOSTNAME}:{device_port}"))
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))?;
    let response = sender.send_request(request).await?;
    let status = response.status();

    drop(sender);
    let _ = connection.await;
    Ok(status)
}

/// Send an update notification to a device's push endpoint using `credentials`.
pub async fn push_notification(
    credentials: &Credentials,
    device_port: u16,
    notification: &PushNotification,
) -> anyhow::Result<StatusCode> {
    push_raw(credentials, device_port, serde_json::to_vec(notification)?).await
}

/// A device configuration pointing at a local distribution point.
pub fn device_config(credentials: &Credentials, dir: &Path, distribution_port: u16) -> Config {
    Config {
        distribution_host: HOSTNAME.to_string(),
        distribution_port,
        listen_address: SocketAddr::from_str("127.0.0.1:0").expect("the address should be valid"),
        polling_interval: Duration::from_secs(60 * 60),
        request_timeout: Duration::from_secs(10),
        max_image_size: 16 * 1024 * 1024,
        state_directory: dir.join("state"),
        image_path: dir.join("firmware.img"),
        reboot_command: None,
        heartbeat_interval: None,
        credentials: credentials.clone(),
    }
}

/// Wait up to 30 seconds for `condition` to hold.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("condition was not met in time")
}

// Dropping TempDir cleans up the directory, but it needs to live to the end of the test.
pub struct Instance {
    pub daemon: Daemon,
    pub distribution: MockDistributionPoint,
    pub creds: Creds,
    pub state_dir: tempfile::TempDir,
}

impl Instance {
    /// Start a mock distribution point and a device pointed at it.
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(|_, _, _| Ok(())).await
    }

    /// Like [`Instance::start`], but `prepare` runs before the device starts.
    ///
    /// The device checks for updates as soon as it starts, so anything it should find on its
    /// first check must be published here.
    pub async fn start_with(
        prepare: impl FnOnce(&mut Config, &Creds, &MockDistributionPoint) -> anyhow::Result<()>,
    ) -> anyhow::Result<Self> {
        let state_dir = tempfile::TempDir::new()?;
        let creds = create_credentials(&state_dir.path().join("creds"))?;
        let distribution = MockDistributionPoint::start(creds.distribution.clone()).await?;

        let mut config = device_config(&creds.device, state_dir.path(), distribution.port());
        prepare(&mut config, &creds, &distribution)?;
        let daemon = Daemon::start(config).await?;

        Ok(Self {
            daemon,
            distribution,
            creds,
            state_dir,
        })
    }

    pub fn state(&self) -> &StateStore {
        self.daemon.coordinator().state()
    }

    pub fn image_path(&self) -> PathBuf {
        self.state_dir.path().join("firmware.img")
    }

    /// Wait for the check the device makes at startup to finish.
    ///
    /// Until then a push notification may be dropped because a run is already in progress.
    pub async fn wait_for_first_check(&self) -> anyhow::Result<()> {
        wait_until(|| {
            !self.distribution.state().checks.is_empty()
                && self.daemon.coordinator().stage() == Stage::Idle
        })
        .await
    }

    pub async fn push(&self, notification: &PushNotification) -> anyhow::Result<StatusCode> {
        self.distribution
            .push(self.daemon.listener_port(), notification)
            .await
    }

    pub async fn halt(self) -> anyhow::Result<()> {
        self.daemon.halt().await?;
        self.distribution.halt().await?;
        Ok(())
    }
}
