//! Message types for actor communication.
//!
//! Every actor has one mailbox carrying one message enum. Request-reply uses
//! `tokio::sync::oneshot`; replies towards the control server travel as
//! [`DeviceEvent`]s carrying the [`RequestRef`] of the asker.

use crate::models::{DeviceRecord, ProbeReport};
use crate::transport::Link;
use crate::wire::{LocalCommand, RequestRef, ServerCommand, Status};
use common::types::{LinkId, ObserverId};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// Messages sent to a device actor.
#[derive(Debug)]
pub enum DeviceMessage {
    /// Announce the device to a joining viewer if it is enabled and online.
    View { request: Option<RequestRef> },

    /// Replace the record. `target` is the id the save was routed by.
    Save {
        record: DeviceRecord,
        target: String,
        request: Option<RequestRef>,
    },

    Delete { request: Option<RequestRef> },

    ToggleRecording { enabled: bool },

    Get { request: Option<RequestRef> },

    /// Re-announce recording state to local observers.
    LocalBroadcast,

    /// Asynchronous liveness report from the media engine.
    LivenessChanged { online: bool },

    /// Read-only snapshot of the record.
    CopyOf {
        respond_to: oneshot::Sender<DeviceRecord>,
    },

    /// Start a probe unless one is running. `force` probes even when the
    /// device is already online.
    TriggerRegistration {
        force: bool,
        request: Option<RequestRef>,
    },

    /// Completion of a detached probe.
    RegistrationEnded {
        request: Option<RequestRef>,
        report: ProbeReport,
        started_at: Instant,
    },
}

/// What happened on a device, as reported to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEventKind {
    StatusChanged,
    StatusNoChange,
    SaveFailed,
    GetOk,
    NotFound,
    DelOk,
    DelFailed,
    RecChanged,
    IdChanged { old: String, new: String },
}

/// Event emitted by a device actor (or by the directory for unknown ids).
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub record: DeviceRecord,
    pub request: Option<RequestRef>,
    pub note: String,
}

impl DeviceEvent {
    pub fn new(
        kind: DeviceEventKind,
        record: DeviceRecord,
        request: Option<RequestRef>,
        note: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            record,
            request,
            note: note.into(),
        }
    }

    /// `NotFound` carries the id that was asked for.
    pub fn not_found(id: &str, request: Option<RequestRef>) -> Self {
        Self::new(
            DeviceEventKind::NotFound,
            DeviceRecord {
                id: id.to_string(),
                ..DeviceRecord::default()
            },
            request,
            format!("Camera not found: {id}"),
        )
    }
}

/// A local client's outbound queue.
#[derive(Debug, Clone)]
pub struct Observer {
    pub id: ObserverId,
    pub sender: mpsc::Sender<String>,
}

/// Messages sent to the hub.
#[derive(Debug)]
pub enum HubMessage {
    AddObserver { observer: Observer },

    RemoveObserver { observer_id: ObserverId },

    /// Store and broadcast a status; `None` re-broadcasts the current one.
    ChangeStatus { status: Option<Status> },

    /// Broadcast a payload without touching the stored status.
    ChangeNoStatus { payload: String },

    ConnectControlLink,

    SetControlLink { link: Link },

    /// Clear the control link if `link_id` is still the current one.
    ClearControlLink { link_id: LinkId },

    /// Send a frame on the control link, if any.
    SendControl { frame: String },

    /// Push the full device list to the control server.
    PushDeviceList,

    DeviceEvent(DeviceEvent),

    ServerCommand(ServerCommand),

    LocalCommand {
        observer_id: ObserverId,
        command: LocalCommand,
    },

    GetStatus {
        respond_to: oneshot::Sender<HubStatus>,
    },
}

/// Snapshot of hub state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubStatus {
    pub status: Status,
    pub has_control_link: bool,
    pub observer_count: usize,
    pub device_count: usize,
}
