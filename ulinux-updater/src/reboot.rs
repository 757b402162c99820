// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Rebooting into a freshly installed image.

use std::{future::Future, io};

use tracing::instrument;

/// Something that can restart the device.
///
/// Implementations only need to *start* the reboot; the update is already durably recorded by
/// the time this is called.
pub trait Rebooter: Send + Sync + 'static {
    fn reboot(&self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Reboots by running an external command, such as `systemctl reboot`.
#[derive(Debug, Clone)]
pub struct CommandRebooter {
    program: String,
    args: Vec<String>,
}

impl CommandRebooter {
    /// Build a rebooter from an argument vector; the first element is the program.
    ///
    /// Returns `None` if `argv` is empty.
    pub fn new(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl Rebooter for CommandRebooter {
    #[instrument(skip_all, err, fields(program = %self.program))]
    async fn reboot(&self) -> io::Result<()> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(false)
            .spawn()?;
        tracing::warn!(pid = child.id(), "Rebooting to apply the update");

        // The command is expected to take the whole system down, so nothing waits on it beyond
        // reaping the process if it does exit.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => tracing::debug!("Reboot command exited"),
                Ok(status) => tracing::error!(%status, "Reboot command failed"),
                Err(error) => tracing::error!(?error, "Failed to wait on the reboot command"),
            }
        });

        Ok(())
    }
}

/// Only logs that a reboot is required.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRebooter;

impl Rebooter for LogRebooter {
    async fn reboot(&self) -> io::Result<()> {
        tracing::warn!("An update was installed; reboot the device to apply it");
        Ok(())
    }
}

/// The rebooter selected by the daemon configuration.
#[derive(Debug, Clone)]
pub enum SystemRebooter {
    Command(CommandRebooter),
    Log(LogRebooter),
}

impl SystemRebooter {
    pub fn from_command(command: Option<&[String]>) -> Self {
        match command.and_then(CommandRebooter::new) {
            Some(rebooter) => Self::Command(rebooter),
            None => {
                if command.is_some() {
                    tracing::warn!("The configured reboot command is empty; reboots will only be logged");
                }
                Self::Log(LogRebooter)
            }
        }
    }
}

impl Rebooter for SystemRebooter {
    async fn reboot(&self) -> io::Result<()> {
        match self {
            Self::Command(rebooter) => rebooter.reboot().await,
            Self::Log(rebooter) => rebooter.reboot().await,
        }
    }
}
