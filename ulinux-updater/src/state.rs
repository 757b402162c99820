// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Durable device state.
//!
//! Each value lives in its own small file inside the state directory. Every write goes to a
//! temporary file in the same directory which is synced and then renamed over the old file, so
//! readers observe either the previous value or the new one, never a partial write.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use uuid::Uuid;

use crate::{error::StorageError, protocol::UpdateId};

const LAST_UPDATE: &str = "last_update";
const FIRMWARE_VERSION: &str = "firmware_version";
const DEVICE_ID: &str = "device_id";

/// The on-disk record of what has been installed on this device.
#[derive(Debug, Clone)]
pub struct StateStore {
    directory: PathBuf,
}

impl StateStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The Unix timestamp of the last installed update.
    ///
    /// A device that has never installed an update reports 0, so any real update is newer. This
    /// never fails: an unreadable or garbled record is logged and treated as 0 as well.
    pub fn last_update_timestamp(&self) -> i64 {
        let path = self.directory.join(LAST_UPDATE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => contents.trim().parse().unwrap_or_else(|error| {
                tracing::warn!(
                    ?error,
                    path = %path.display(),
                    "Last update record is not an integer; treating the device as never updated"
                );
                0
            }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => 0,
            Err(error) => {
                tracing::warn!(
                    ?error,
                    path = %path.display(),
                    "Failed to read the last update record; treating the device as never updated"
                );
                0
            }
        }
    }

    /// Persist `timestamp` as the time of the last installed update.
    ///
    /// Only call this once the image it describes is durably installed.
    pub fn record_update_timestamp(&self, timestamp: i64) -> Result<(), StorageError> {
        write_atomically(
            &self.directory.join(LAST_UPDATE),
            timestamp.to_string().as_bytes(),
        )?;
        tracing::debug!(timestamp, "Recorded last update timestamp");
        Ok(())
    }

    /// Note which update the device is about to attempt.
    pub fn record_firmware_version(&self, id: &UpdateId) -> Result<(), StorageError> {
        write_atomically(
            &self.directory.join(FIRMWARE_VERSION),
            id.as_str().as_bytes(),
        )
    }

    /// The identifier of the update most recently attempted, if any.
    pub fn firmware_version(&self) -> Result<Option<String>, StorageError> {
        let path = self.directory.join(FIRMWARE_VERSION);
        match std::fs::read_to_string(&path) {
            Ok(version) => Ok(Some(version)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    /// The persistent identity of this device.
    ///
    /// It is generated the first time it is requested and reused from then on.
    pub fn device_id(&self) -> Result<Uuid, StorageError> {
        let path = self.directory.join(DEVICE_ID);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                Uuid::parse_str(contents.trim()).map_err(|_| StorageError::Corrupt {
                    path,
                    contents,
                })
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                let id = Uuid::now_v7();
                write_atomically(&path, id.hyphenated().to_string().as_bytes())?;
                tracing::info!(device_id = %id, "Generated a new device identity");
                Ok(id)
            }
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }
}

/// Durably write a firmware image to `path`.
pub fn install_image(path: &Path, image: &[u8]) -> Result<(), StorageError> {
    write_atomically(path, image)?;
    tracing::info!(path = %path.display(), size = image.len(), "Wrote image to disk");
    Ok(())
}

/// Replace the contents of `path` such that a crash leaves either the old or new contents.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let io_error = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(io_error)?;

    let mut file = tempfile::NamedTempFile::new_in(parent).map_err(io_error)?;
    file.write_all(contents).map_err(io_error)?;
    file.as_file().sync_all().map_err(io_error)?;
    file.persist(path).map_err(|error| io_error(error.error))?;

    // The rename itself must reach the disk before the caller records anything that depends on it.
    std::fs::File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(io_error)?;

    Ok(())
}
