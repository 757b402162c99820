// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Types exchanged with the distribution point.

use serde::{Deserialize, Serialize};

/// Request paths, on the distribution point and on the device's push listener.
pub mod paths {
    /// `POST` on the distribution point asks whether a newer update exists; `POST` on the device
    /// announces one.
    pub const NEW_UPDATE: &str = "/newUpdate";
    /// Prefix of the image download path; the update identifier follows.
    pub const UPDATES: &str = "/updates/";
    /// `POST` here tells the distribution point the device is alive.
    pub const HEARTBEAT: &str = "/";
}

/// An opaque token naming an update on the distribution point.
///
/// The distribution point may send it as a JSON string or integer; it is kept as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct UpdateId(String);

impl UpdateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UpdateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UpdateId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum IdHelper {
            Text(String),
            Unsigned(u64),
            Signed(i64),
        }

        Ok(match IdHelper::deserialize(deserializer)? {
            IdHelper::Text(text) => UpdateId(text),
            IdHelper::Unsigned(number) => UpdateId(number.to_string()),
            IdHelper::Signed(number) => UpdateId(number.to_string()),
        })
    }
}

/// An update some trigger believes the device should install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCandidate {
    pub id: UpdateId,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
}

impl UpdateCandidate {
    /// Returns true if this candidate was announced strictly after `last_update`.
    pub fn is_newer_than(&self, last_update: i64) -> bool {
        self.timestamp > last_update
    }
}

/// The distribution point's answer to `POST /newUpdate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUpdateResponse {
    /// Whether an update newer than the submitted timestamp exists.
    pub message: bool,
    #[serde(rename = "updateId", default, skip_serializing_if = "Option::is_none")]
    pub update_id: Option<UpdateId>,
    /// When the update was published, if the distribution point says.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// The body of a push notification sent to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNotification {
    pub timestamp: i64,
    pub id: UpdateId,
}

impl From<PushNotification> for UpdateCandidate {
    fn from(notification: PushNotification) -> Self {
        Self {
            id: notification.id,
            timestamp: notification.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_id_accepts_strings_and_integers() -> anyhow::Result<()> {
        let text: UpdateId = serde_json::from_str(r#""abc-123""#)?;
        let number: UpdateId = serde_json::from_str("42")?;
        assert_eq!(text.as_str(), "abc-123");
        assert_eq!(number.as_str(), "42");
        assert_eq!(serde_json::to_string(&number)?, r#""42""#);
        assert!(serde_json::from_str::<UpdateId>("[1]").is_err());
        Ok(())
    }

    #[test]
    fn new_update_response_shapes() -> anyhow::Result<()> {
        let nothing: NewUpdateResponse = serde_json::from_str(r#"{"message": false}"#)?;
        assert!(!nothing.message);
        assert!(nothing.update_id.is_none());

        let update: NewUpdateResponse =
            serde_json::from_str(r#"{"message": true, "updateId": 7, "timestamp": 1700000000}"#)?;
        assert!(update.message);
        assert_eq!(update.update_id, Some(UpdateId::new("7")));
        assert_eq!(update.timestamp, Some(1_700_000_000));
        Ok(())
    }

    #[test]
    fn push_notification() -> anyhow::Result<()> {
        let push: PushNotification = serde_json::from_str(r#"{"timestamp": 10, "id": "fw-10"}"#)?;
        let candidate = UpdateCandidate::from(push);
        assert_eq!(candidate.id, UpdateId::new("fw-10"));
        assert!(candidate.is_newer_than(9));
        assert!(!candidate.is_newer_than(10));
        Ok(())
    }

    proptest::proptest! {
        // A candidate is never newer than a record at or after its own timestamp.
        #[test]
        fn older_candidates_are_stale(announced in proptest::num::i64::ANY, delta in 0_i64..1_000_000) {
            let candidate = UpdateCandidate { id: UpdateId::new("x"), timestamp: announced };
            let recorded = announced.saturating_add(delta);
            proptest::prop_assert!(!candidate.is_newer_than(recorded));
            if announced != i64::MIN {
                proptest::prop_assert!(candidate.is_newer_than(announced - 1));
            }
        }
    }
}
