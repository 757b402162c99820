// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Define the command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// The ulinux firmware updater.
///
/// The updater keeps this device's firmware image in sync with a distribution point. It checks
/// for new updates on a fixed interval and also listens for update notifications pushed by the
/// distribution point. Every connection is authenticated with TLS client certificates, and every
/// image is checked against its detached signature before it is installed.
///
/// To view the expected configuration format, run the `config` subcommand.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// The path to the updater's configuration file.
    ///
    /// If no path is provided, the defaults are used. To view the service configuration,
    /// run the `config` subcommand.
    #[arg(long, short, env = "ULINUX_UPDATER_CONFIG")]
    pub config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(
        long,
        env = "ULINUX_UPDATER_LOG",
        default_value = "WARN,ulinux_updater=INFO"
    )]
    pub log_filter: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Run the service.
    Run {
        /// The directory containing the service's secrets.
        ///
        /// Any file referenced in the configuration that are not absolute paths are
        /// expected to be in this directory.
        ///
        /// When run under systemd, providing a `ImportCredential=`,
        /// `LoadCredentialEncrypted=`, or `LoadCredential=` directive will
        /// set the environment variable automatically for you.
        #[arg(long, env = "CREDENTIALS_DIRECTORY")]
        credentials_directory: PathBuf,
    },

    /// See the current updater configuration.
    Config {
        /// The directory containing the service's secrets.
        ///
        /// Any file referenced in the configuration that are not absolute paths are
        /// expected to be in this directory.
        #[arg(
            long,
            env = "CREDENTIALS_DIRECTORY",
            default_value = "/etc/credstore.encrypted/"
        )]
        credentials_directory: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_subcommand_parses() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "ulinux-updater",
            "--config",
            "/etc/ulinux-updater/updater.toml",
            "run",
            "--credentials-directory",
            "/run/credentials/ulinux-updater.service",
        ])?;
        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("/etc/ulinux-updater/updater.toml"))
        );
        assert!(matches!(cli.command, Command::Run { .. }));
        Ok(())
    }
}
