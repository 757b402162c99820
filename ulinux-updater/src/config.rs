// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Updater configuration.

use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context;
use openssl::{
    error::ErrorStack,
    ssl::{SslAcceptor, SslConnector, SslFiletype, SslMethod, SslVerifyMode, SslVersion},
};
use serde::{Deserialize, Serialize};

/// The trust material for the device.
///
/// It is highly recommended that you use systemd credentials to ensure the private key is
/// only accessible to the service using it. If the paths provided are relative, it is assumed
/// to be relative to the `$CREDENTIALS_DIRECTORY` environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// The systemd credentials ID of the PEM-encoded private key file.
    ///
    /// This private key is the key that matches the `certificate` and is used to authenticate
    /// with the distribution point, and to serve the push endpoint. It is expected to be provided
    /// by systemd's "ImportCredential" or "LoadCredentialEncrypted" option.
    ///
    /// # Example
    ///
    /// To prepare the encrypted configuration:
    ///
    /// ```bash
    /// systemd-creds encrypt /secure/ramfs/private-key.pem /etc/credstore.encrypted/ulinux.device.private_key
    /// ```
    ///
    /// This will produce an encrypted blob which will be decrypted by systemd at runtime.
    pub private_key: PathBuf,
    /// The path to the certificate that matches the `private_key`.
    ///
    /// The certificate is used in both directions, so it needs both the `clientAuth` and
    /// `serverAuth` extended key usages.
    pub certificate: PathBuf,
    /// The path to the certificate authority of the distribution point.
    ///
    /// The distribution point's server certificate and the certificate of anyone pushing update
    /// notifications to the device must chain to it.
    pub ca_certificate: PathBuf,
    /// The PEM-encoded RSA public key of the signing authority.
    ///
    /// Images are verified against this key regardless of which TLS peer delivered them.
    pub signing_public_key: PathBuf,
}

impl Credentials {
    pub(crate) fn ssl_connector(&self) -> Result<SslConnector, ErrorStack> {
        let mut connector = SslConnector::builder(SslMethod::tls())?;
        connector.set_verify(SslVerifyMode::PEER);
        connector.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        connector.set_ca_file(&self.ca_certificate)?;
        connector.set_private_key_file(&self.private_key, SslFiletype::PEM)?;
        connector.set_certificate_file(&self.certificate, SslFiletype::PEM)?;
        connector.check_private_key()?;

        Ok(connector.build())
    }

    pub(crate) fn ssl_acceptor(&self, ca_pem: &[u8]) -> Result<SslAcceptor, ErrorStack> {
        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
        let client_ca_cert = openssl::x509::X509::from_pem(ca_pem)?;
        acceptor.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        acceptor.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        acceptor.add_client_ca(&client_ca_cert)?;
        acceptor.set_ca_file(&self.ca_certificate)?;
        acceptor.set_private_key_file(&self.private_key, SslFiletype::PEM)?;
        acceptor.set_certificate_file(&self.certificate, SslFiletype::PEM)?;
        acceptor.check_private_key()?;

        Ok(acceptor.build())
    }

    /// Fix up any relative paths in the configuration file to use the provided credentials directory.
    ///
    /// # Errors
    ///
    /// If the referenced files don't exist, an error is returned.
    pub fn with_credentials_dir(
        &mut self,
        credentials_dir: &std::path::Path,
    ) -> anyhow::Result<()> {
        if self.private_key.is_absolute() {
            tracing::warn!(
                private_key = self.private_key.display().to_string(),
                "Path to private key file is absolute; consider using systemd credentials"
            );
        }

        for (description, path) in [
            ("private key", &mut self.private_key),
            ("certificate", &mut self.certificate),
            ("CA certificate", &mut self.ca_certificate),
            ("signing public key", &mut self.signing_public_key),
        ] {
            if !path.is_absolute() {
                *path = credentials_dir.join(&*path);
                if !path.exists() {
                    return Err(anyhow::anyhow!(
                        "No {description} file named '{}' found in credentials directory",
                        path.display()
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Configuration for the updater daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The distribution point hostname. This is used to connect and to validate the
    /// distribution point's TLS certificate.
    pub distribution_host: String,
    /// The port on the distribution point to connect to; the default is 443.
    pub distribution_port: u16,
    /// The socket address to listen on for update notifications pushed by the distribution
    /// point.
    ///
    /// The default is to listen on all interfaces on port 8443.
    pub listen_address: SocketAddr,
    /// How often to ask the distribution point whether a newer update exists.
    pub polling_interval: Duration,
    /// The amount of time to wait for any single exchange with the distribution point,
    /// including connecting, the TLS handshake, and reading the full response.
    ///
    /// The same bound applies to TLS handshakes on the push listener.
    pub request_timeout: Duration,
    /// The largest update container, in bytes, the device is willing to download.
    pub max_image_size: usize,
    /// The location where the updater stores its state.
    ///
    /// This includes the timestamp of the last installed update, the identifier of the update
    /// most recently attempted, and the device identity.
    ///
    /// Defaults to "/var/lib/ulinux-updater" if not set.
    #[serde(default = "default_state_directory")]
    pub state_directory: PathBuf,
    /// Where verified firmware images are installed.
    #[serde(default = "default_image_path")]
    pub image_path: PathBuf,
    /// The command to run in order to reboot into a freshly installed image.
    ///
    /// If unset, the updater only logs that a reboot is required.
    #[serde(default)]
    pub reboot_command: Option<Vec<String>>,
    /// How often to tell the distribution point this device is alive.
    ///
    /// The heartbeat is disabled if this is not set.
    #[serde(default)]
    pub heartbeat_interval: Option<Duration>,
    /// The device's trust material.
    pub credentials: Credentials,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            distribution_host: "updates.example.com".to_string(),
            distribution_port: 443,
            listen_address: SocketAddr::from_str("[::]:8443")
                .expect("the default should be valid"),
            polling_interval: Duration::from_secs(60 * 60),
            request_timeout: Duration::from_secs(30),
            max_image_size: 512 * 1024 * 1024,
            state_directory: default_state_directory(),
            image_path: default_image_path(),
            reboot_command: None,
            heartbeat_interval: None,
            credentials: Credentials {
                private_key: PathBuf::from("ulinux.device.private_key.pem"),
                certificate: PathBuf::from("ulinux.device.certificate.pem"),
                ca_certificate: PathBuf::from("ulinux.ca_certificate.pem"),
                signing_public_key: PathBuf::from("ulinux.signing.public_key.pem"),
            },
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

fn default_state_directory() -> PathBuf {
    PathBuf::from("/var/lib/ulinux-updater/")
}

fn default_image_path() -> PathBuf {
    PathBuf::from("/var/lib/ulinux-updater/firmware.img")
}

fn private_load_config<T>(path: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(path=%path.display(), "Read from configuration file");
    toml::from_str(&config)
        .inspect_err(|error| {
            eprintln!("Failed to parse configuration loaded from {path:?}:\n{error}");
            eprintln!("Example config file:\n\n{}", T::default());
        })
        .context("configuration file is invalid")
}

/// Load the configuration with fallback options.
///
/// If `path` is [`None`], the `default` path, which should be relative to CONFIGURATION_DIRECTORY, is
/// checked.  If the default config doesn't exist, the [`Default`] implementation is returned. It's
/// expected that CONFIGURATION_DIRECTORY is set via systemd.
///
/// # Errors
///
/// In the event that one of the config files exists, but is invalid, an error is returned.
pub fn load_config<T>(path: Option<PathBuf>, default: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    path.or_else(|| {
        env::var("CONFIGURATION_DIRECTORY")
            .inspect_err(|error| {
                tracing::warn!(
                    ?error,
                    "CONFIGURATION_DIRECTORY environment variable isn't readable"
                );
            })
            .map(PathBuf::from)
            .ok()
            .map(|base_path| base_path.join(default))
            .filter(|path| path.is_file())
    })
    .map_or_else(
        || {
            tracing::warn!("No configuration file found; using defaults");
            Ok(T::default())
        },
        |path| {
            tracing::info!(?path, "Attempting to load configuration");
            private_load_config::<T>(&path)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // The rendered default configuration must load back in.
    #[test]
    fn default_config_round_trips() -> anyhow::Result<()> {
        let rendered = Config::default().to_string();
        let config: Config = toml::from_str(&rendered)?;
        assert_eq!(config.distribution_port, 443);
        assert_eq!(config.polling_interval, Duration::from_secs(3600));
        assert!(config.reboot_command.is_none());
        Ok(())
    }

    #[test]
    fn optional_fields_default() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("updater.toml");
        std::fs::write(
            &path,
            r#"
distribution_host = "dist.example.com"
distribution_port = 8443
listen_address = "127.0.0.1:9443"
polling_interval = { secs = 60, nanos = 0 }
request_timeout = { secs = 5, nanos = 0 }
max_image_size = 1024

[credentials]
private_key = "device.key"
certificate = "device.crt"
ca_certificate = "ca.crt"
signing_public_key = "signing.pub"
"#,
        )?;
        let config: Config = load_config(Some(path), std::path::Path::new("unused.toml"))?;
        assert_eq!(config.distribution_host, "dist.example.com");
        assert_eq!(config.state_directory, default_state_directory());
        assert_eq!(config.image_path, default_image_path());
        assert!(config.heartbeat_interval.is_none());
        Ok(())
    }

    #[test]
    fn invalid_config_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("updater.toml");
        std::fs::write(&path, "distribution_host = 42")?;
        assert!(load_config::<Config>(Some(path), std::path::Path::new("unused.toml")).is_err());
        Ok(())
    }

    #[test]
    fn credentials_dir_resolves_relative_paths() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let mut credentials = Config::default().credentials;
        for path in [
            &credentials.private_key,
            &credentials.certificate,
            &credentials.ca_certificate,
            &credentials.signing_public_key,
        ] {
            std::fs::write(dir.path().join(path), "")?;
        }

        credentials.with_credentials_dir(dir.path())?;
        assert_eq!(
            credentials.signing_public_key,
            dir.path().join("ulinux.signing.public_key.pem")
        );
        assert!(credentials.private_key.is_absolute());
        Ok(())
    }

    #[test]
    fn credentials_dir_missing_file() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let mut credentials = Config::default().credentials;
        let error = credentials
            .with_credentials_dir(dir.path())
            .expect_err("no files exist");
        assert!(error.to_string().contains("private key"));
        Ok(())
    }
}
