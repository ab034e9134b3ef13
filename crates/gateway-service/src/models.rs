//! Device record, its public view and the setter used by manage commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted state of one camera.
///
/// Only the owning device actor mutates the liveness fields (`online`,
/// `has_video`, `has_audio`, `width`, `height`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "Url", default)]
    pub url: String,
    #[serde(rename = "Rec", default)]
    pub recording_enabled: bool,
    #[serde(rename = "AudioOff", default)]
    pub audio_disabled: bool,
    #[serde(rename = "Off", default)]
    pub disabled: bool,
    #[serde(rename = "Online", default)]
    pub online: bool,
    #[serde(rename = "HasVideo", default)]
    pub has_video: bool,
    #[serde(rename = "HasAudio", default)]
    pub has_audio: bool,
    #[serde(rename = "Width", default)]
    pub width: u32,
    #[serde(rename = "Height", default)]
    pub height: u32,
    #[serde(rename = "UpdatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    /// True when a save carrying `other` would not change anything the
    /// operator controls. Recording is toggled separately and not compared.
    pub fn same_settings(&self, other: &DeviceRecord) -> bool {
        self.id == other.id
            && self.url == other.url
            && self.audio_disabled == other.audio_disabled
            && self.disabled == other.disabled
    }

    /// True when the probe-owned fields already match `report`.
    pub fn matches_probe(&self, report: &ProbeReport) -> bool {
        self.online == report.online
            && self.has_video == report.has_video
            && self.has_audio == report.has_audio
            && self.width == report.width
            && self.height == report.height
    }

    /// Copy the probe-owned fields from `report`.
    pub fn apply_probe(&mut self, report: &ProbeReport) {
        self.online = report.online;
        self.has_video = report.has_video;
        self.has_audio = report.has_audio;
        self.width = report.width;
        self.height = report.height;
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    pub fn view(&self) -> DeviceView {
        DeviceView {
            id: self.id.clone(),
            disabled: self.disabled,
            online: self.online,
            has_video: self.has_video,
            has_audio: self.has_audio,
            width: self.width,
            height: self.height,
            updated_at: self.updated_at,
        }
    }
}

/// The subset of a record that is pushed to the control server and viewers.
/// The source URL and recording settings stay on the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceView {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Off")]
    pub disabled: bool,
    #[serde(rename = "Online")]
    pub online: bool,
    #[serde(rename = "HasVideo")]
    pub has_video: bool,
    #[serde(rename = "HasAudio")]
    pub has_audio: bool,
    #[serde(rename = "Width")]
    pub width: u32,
    #[serde(rename = "Height")]
    pub height: u32,
    #[serde(rename = "UpdatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A record sent by a manager, optionally replacing the device `target`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSetter {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(flatten)]
    pub record: DeviceRecord,
}

impl DeviceSetter {
    /// The id a save is routed by: the target if given, else the record id.
    pub fn routing_id(&self) -> &str {
        if self.target.is_empty() {
            &self.record.id
        } else {
            &self.target
        }
    }
}

/// Result of one registration probe, as reported by the media engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub online: bool,
    pub width: u32,
    pub height: u32,
    pub has_video: bool,
    pub has_audio: bool,
}

impl ProbeReport {
    pub fn offline() -> Self {
        Self::default()
    }
}

/// Human-readable summary of what a probe changed.
pub fn describe_change(before: &DeviceRecord, after: &DeviceRecord) -> String {
    let mut parts = Vec::new();
    if before.online != after.online {
        parts.push(if after.online { "online" } else { "offline" }.to_string());
    }
    if (before.width, before.height) != (after.width, after.height) {
        parts.push(format!("{}x{}", after.width, after.height));
    }
    if before.has_video != after.has_video {
        parts.push(format!("video {}", on_off(after.has_video)));
    }
    if before.has_audio != after.has_audio {
        parts.push(format!("audio {}", on_off(after.has_audio)));
    }
    if parts.is_empty() {
        format!("Changes saved: {}", after.id)
    } else {
        format!("Changes saved: {} ({})", after.id, parts.join(", "))
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}
