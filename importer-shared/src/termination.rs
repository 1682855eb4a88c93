//! Termination message exchanged with the controller.
//!
//! The importer writes one JSON line to the termination log before it exits;
//! the controller parses it back with the same types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// VDDK library details discovered while nbdkit was running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VddkInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
}

/// Payload of the termination log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Kubernetes labels derived from the source image's environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vddk_info: Option<VddkInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preallocation_applied: Option<bool>,
}

impl TerminationMessage {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Fill fields that are unset here from `other`.
    pub fn merge(&mut self, other: TerminationMessage) {
        if self.message.is_none() {
            self.message = other.message;
        }
        if self.labels.is_none() {
            self.labels = other.labels;
        }
        if self.vddk_info.is_none() {
            self.vddk_info = other.vddk_info;
        }
        if self.preallocation_applied.is_none() {
            self.preallocation_applied = other.preallocation_applied;
        }
    }

    /// Single-line JSON form.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_skips_empty_fields() {
        let msg = TerminationMessage::with_message("Import Complete");
        assert_eq!(msg.to_line().unwrap(), r#"{"message":"Import Complete"}"#);
    }

    #[test]
    fn test_serialize_vddk_info() {
        let msg = TerminationMessage {
            vddk_info: Some(VddkInfo {
                version: "7.0.3".into(),
                host: "esx1.example.com".into(),
            }),
            ..Default::default()
        };
        assert_eq!(
            msg.to_line().unwrap(),
            r#"{"vddkInfo":{"version":"7.0.3","host":"esx1.example.com"}}"#
        );
    }

    #[test]
    fn test_merge_keeps_existing_message() {
        let mut msg = TerminationMessage::with_message("Import Complete");
        let mut labels = BTreeMap::new();
        labels.insert("instancetype.kubevirt.io/default-preference".into(), "fedora".into());
        msg.merge(TerminationMessage {
            message: Some("other".into()),
            labels: Some(labels.clone()),
            ..Default::default()
        });
        assert_eq!(msg.message.as_deref(), Some("Import Complete"));
        assert_eq!(msg.labels, Some(labels));
    }
}
