//! `DeviceActor` - one actor per configured camera.
//!
//! The actor owns the camera's record and is the only writer of its liveness
//! fields. Registration probes run detached on a blocking thread and report
//! back through the mailbox as [`DeviceMessage::RegistrationEnded`], so the
//! actor keeps answering while a probe is in flight.
//!
//! # Coalescing
//!
//! At most one probe runs per actor. While it runs:
//! - a save is persisted immediately but its record is parked in
//!   `pending_save` and adopted when the probe ends (last save wins);
//! - a delete removes the stored record immediately but the actor only
//!   unregisters and exits when the probe ends (or on the next trigger).

use crate::context::GatewayContext;
use crate::errors::GatewayError;
use crate::media::Registration;
use crate::models::{describe_change, DeviceRecord, ProbeReport};
use crate::observability::metrics as prom;
use crate::wire::RequestRef;

use super::directory::DeviceDirectory;
use super::hub::HubActorHandle;
use super::messages::{DeviceEvent, DeviceEventKind, DeviceMessage};
use super::metrics::{ActorType, MailboxMonitor};

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for a device mailbox.
pub const DEVICE_CHANNEL_BUFFER: usize = 64;

/// Handle to a `DeviceActor`.
#[derive(Clone, Debug)]
pub struct DeviceActorHandle {
    key: Uuid,
    sender: mpsc::Sender<DeviceMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl DeviceActorHandle {
    /// Identity of the actor instance, stable across renames.
    #[must_use]
    pub fn key(&self) -> Uuid {
        self.key
    }

    pub async fn send(&self, message: DeviceMessage) -> Result<(), GatewayError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;
        self.mailbox.record_enqueue();
        Ok(())
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// True once the actor has exited or is cancelled.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed() || self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn mailbox(&self) -> &MailboxMonitor {
        &self.mailbox
    }
}

struct PendingSave {
    record: DeviceRecord,
    request: Option<RequestRef>,
}

struct PendingDelete {
    request: Option<RequestRef>,
}

/// The `DeviceActor` implementation.
pub struct DeviceActor {
    key: Uuid,
    record: DeviceRecord,
    /// A probe is in flight.
    registering: bool,
    pending_save: Option<PendingSave>,
    pending_delete: Option<PendingDelete>,
    deleted: bool,
    receiver: mpsc::Receiver<DeviceMessage>,
    /// Weak so the actor does not keep its own mailbox open.
    self_sender: mpsc::WeakSender<DeviceMessage>,
    ctx: GatewayContext,
    directory: DeviceDirectory,
    hub: HubActorHandle,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl DeviceActor {
    /// Spawn a new device actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        record: DeviceRecord,
        ctx: GatewayContext,
        directory: DeviceDirectory,
        hub: HubActorHandle,
        cancel_token: CancellationToken,
    ) -> (DeviceActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(DEVICE_CHANNEL_BUFFER);
        let key = Uuid::new_v4();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Device, &record.id));

        ctx.metrics.device_started();

        let actor = Self {
            key,
            record,
            registering: false,
            pending_save: None,
            pending_delete: None,
            deleted: false,
            receiver,
            self_sender: sender.downgrade(),
            ctx,
            directory,
            hub,
            cancel_token: cancel_token.clone(),
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = DeviceActorHandle {
            key,
            sender,
            cancel_token,
            mailbox,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "gw.actor.device", fields(device_id = %self.record.id))]
    async fn run(mut self) {
        debug!(
            target: "gw.actor.device",
            device_id = %self.record.id,
            "DeviceActor started"
        );

        let period = self.ctx.config.registration_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "gw.actor.device",
                        device_id = %self.record.id,
                        "DeviceActor received cancellation signal"
                    );
                    break;
                }

                _ = ticker.tick() => {
                    let tick = DeviceMessage::TriggerRegistration { force: false, request: None };
                    if self.dispatch(tick) {
                        break;
                    }
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        debug!(
                            target: "gw.actor.device",
                            device_id = %self.record.id,
                            "DeviceActor channel closed, exiting"
                        );
                        break;
                    };
                    self.mailbox.record_dequeue();
                    if self.dispatch(message) {
                        break;
                    }
                }
            }
        }

        self.ctx.metrics.device_stopped();

        info!(
            target: "gw.actor.device",
            device_id = %self.record.id,
            messages_processed = self.mailbox.messages_processed(),
            deleted = self.deleted,
            "DeviceActor stopped"
        );
    }

    /// Handle one message with panic containment. Returns true if the actor
    /// should exit.
    fn dispatch(&mut self, message: DeviceMessage) -> bool {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handle_message(message)));
        self.ctx.metrics.record_message_processed();

        match outcome {
            Ok(should_exit) => should_exit,
            Err(_) => {
                self.ctx.metrics.record_panic(ActorType::Device);
                error!(
                    target: "gw.actor.device",
                    device_id = %self.record.id,
                    "Device message handler panicked"
                );
                false
            }
        }
    }

    fn handle_message(&mut self, message: DeviceMessage) -> bool {
        match message {
            DeviceMessage::View { request } => {
                if !self.record.disabled && self.record.online {
                    let note = format!("Camera online: {}", self.record.id);
                    self.emit(DeviceEventKind::StatusChanged, self.record.clone(), request, note);
                }
                false
            }

            DeviceMessage::Save {
                record,
                target,
                request,
            } => {
                self.handle_save(record, &target, request);
                false
            }

            DeviceMessage::Delete { request } => self.handle_delete(request),

            DeviceMessage::ToggleRecording { enabled } => {
                self.handle_toggle_recording(enabled);
                false
            }

            DeviceMessage::Get { request } => {
                let current = self.current().clone();
                let note = format!("Camera: {}", current.id);
                self.emit(DeviceEventKind::GetOk, current, request, note);
                false
            }

            DeviceMessage::LocalBroadcast => {
                let note = recording_note(&self.record);
                self.emit(DeviceEventKind::RecChanged, self.record.clone(), None, note);
                false
            }

            DeviceMessage::LivenessChanged { online } => {
                self.handle_liveness(online);
                false
            }

            DeviceMessage::CopyOf { respond_to } => {
                let _ = respond_to.send(self.current().clone());
                false
            }

            DeviceMessage::TriggerRegistration { force, request } => {
                self.handle_trigger(force, request)
            }

            DeviceMessage::RegistrationEnded {
                request,
                report,
                started_at,
            } => self.handle_registration_ended(request, report, started_at),
        }
    }

    /// The record future messages should see: a parked save wins over the
    /// registered record.
    fn current(&self) -> &DeviceRecord {
        self.pending_save
            .as_ref()
            .map_or(&self.record, |pending| &pending.record)
    }

    fn handle_save(
        &mut self,
        mut record: DeviceRecord,
        target: &str,
        request: Option<RequestRef>,
    ) {
        if self.pending_delete.is_some() {
            let event = DeviceEvent::not_found(target, request);
            if let Err(e) = self.hub.device_event(event) {
                debug!(target: "gw.actor.device", error = %e, "Hub gone, event dropped");
            }
            return;
        }

        if record.id.is_empty() {
            record.id = target.to_string();
        }

        let current = self.current().clone();
        if current.same_settings(&record) {
            let note = format!("No need to change: {}", current.id);
            self.emit(DeviceEventKind::StatusNoChange, current, request, note);
            return;
        }

        // Liveness is re-learned by the next probe; recording is toggled
        // on its own path.
        record.apply_probe(&ProbeReport::offline());
        record.recording_enabled = current.recording_enabled;
        record.touch();

        let old_id = current.id.clone();
        let renamed = old_id != record.id;

        // The new id routes here from now on, so no concurrent create can
        // take it while the record is written.
        if renamed {
            if let Err(e) = self.directory.reserve_rename(&old_id, &record.id, self.key) {
                debug!(
                    target: "gw.actor.device",
                    old_id = %old_id,
                    new_id = %record.id,
                    error = %e,
                    "Rename rejected"
                );
                let note = match e {
                    GatewayError::Conflict(message) => message,
                    _ => format!("Save failed: {old_id}"),
                };
                self.emit(DeviceEventKind::SaveFailed, current, request, note);
                return;
            }
        }

        let rename_from = renamed.then_some(old_id.as_str());
        if let Err(e) = self.ctx.store.put_device(&record, rename_from) {
            warn!(
                target: "gw.actor.device",
                device_id = %old_id,
                error = %e,
                "Failed to persist camera"
            );
            prom::record_storage_failure("put");
            if renamed {
                self.directory.release(&record.id, self.key);
            }
            let note = format!("Save failed: {old_id}");
            self.emit(DeviceEventKind::SaveFailed, current, request, note);
            return;
        }

        if renamed {
            self.directory.release(&old_id, self.key);
            info!(
                target: "gw.actor.device",
                old_id = %old_id,
                new_id = %record.id,
                "Camera renamed"
            );
            let kind = DeviceEventKind::IdChanged {
                old: old_id.clone(),
                new: record.id.clone(),
            };
            let note = format!("Camera renamed: {old_id} -> {}", record.id);
            self.emit(kind, record.clone(), None, note);
        }

        if self.registering {
            debug!(
                target: "gw.actor.device",
                device_id = %record.id,
                "Probe in flight, parking save"
            );
            self.pending_save = Some(PendingSave { record, request });
            return;
        }

        self.adopt(record, request);
    }

    /// Replace the registered record and probe it afresh.
    fn adopt(&mut self, record: DeviceRecord, request: Option<RequestRef>) {
        self.ctx.conductor.unregister(&self.record.id);
        self.record = record;

        if self.record.disabled {
            let note = format!("Changes saved: {}", self.record.id);
            self.emit(DeviceEventKind::StatusChanged, self.record.clone(), request, note);
            return;
        }

        self.begin_registration(request);
    }

    fn handle_delete(&mut self, request: Option<RequestRef>) -> bool {
        let id = self.current().id.clone();

        if let Err(e) = self.ctx.store.remove_device(&id) {
            warn!(
                target: "gw.actor.device",
                device_id = %id,
                error = %e,
                "Failed to remove camera"
            );
            prom::record_storage_failure("remove");
            let note = format!("Remove failed: {id}");
            let current = self.current().clone();
            self.emit(DeviceEventKind::DelFailed, current, request, note);
            return false;
        }

        self.directory.release(&id, self.key);

        if self.registering {
            debug!(
                target: "gw.actor.device",
                device_id = %id,
                "Probe in flight, deferring teardown"
            );
            self.pending_delete = Some(PendingDelete { request });
            return false;
        }

        self.finalize_delete(request)
    }

    /// Unregister and stop. Runs once.
    fn finalize_delete(&mut self, request: Option<RequestRef>) -> bool {
        if self.deleted {
            return true;
        }
        self.deleted = true;

        self.ctx.conductor.unregister(&self.record.id);

        let record = self.current().clone();
        let note = format!("Camera removed: {}", record.id);
        self.emit(DeviceEventKind::DelOk, record, request, note);

        self.receiver.close();
        true
    }

    fn handle_toggle_recording(&mut self, enabled: bool) {
        if self.current().recording_enabled != enabled {
            let mut updated = self.current().clone();
            updated.recording_enabled = enabled;
            updated.touch();

            if let Err(e) = self.ctx.store.put_device(&updated, None) {
                warn!(
                    target: "gw.actor.device",
                    device_id = %updated.id,
                    error = %e,
                    "Failed to persist recording flag"
                );
                prom::record_storage_failure("put");
                let note = format!("Save failed: {}", updated.id);
                self.emit(DeviceEventKind::SaveFailed, updated, None, note);
                return;
            }

            self.record.recording_enabled = enabled;
            self.record.updated_at = updated.updated_at;
            if let Some(pending) = self.pending_save.as_mut() {
                pending.record.recording_enabled = enabled;
            }
            self.ctx
                .conductor
                .set_recording_enabled(&self.record.id, enabled);
        }

        let note = recording_note(&self.record);
        self.emit(DeviceEventKind::RecChanged, self.record.clone(), None, note);
    }

    fn handle_liveness(&mut self, online: bool) {
        if self.record.online == online {
            return;
        }

        self.record.online = online;
        self.record.touch();

        // A parked save already owns the stored record
        if self.pending_save.is_none() {
            if let Err(e) = self.ctx.store.put_device(&self.record, None) {
                warn!(
                    target: "gw.actor.device",
                    device_id = %self.record.id,
                    error = %e,
                    "Failed to persist liveness"
                );
                prom::record_storage_failure("put");
            }
        }

        let note = format!(
            "{}: {}",
            self.record.id,
            if online { "online" } else { "offline" }
        );
        self.emit(DeviceEventKind::StatusChanged, self.record.clone(), None, note);
    }

    fn handle_trigger(&mut self, force: bool, request: Option<RequestRef>) -> bool {
        if let Some(pending) = self.pending_delete.take() {
            return self.finalize_delete(pending.request);
        }

        if self.record.disabled {
            if request.is_some() {
                let note = format!("Camera disabled: {}", self.record.id);
                self.emit(DeviceEventKind::StatusNoChange, self.record.clone(), request, note);
            }
            return false;
        }

        if self.registering {
            if request.is_some() {
                let note = format!("Registration already in progress: {}", self.record.id);
                self.emit(DeviceEventKind::StatusNoChange, self.record.clone(), request, note);
            }
            return false;
        }

        if self.record.online && !force {
            return false;
        }

        self.begin_registration(request);
        false
    }

    /// Start a detached probe. The prior liveness stays visible until the
    /// probe reports.
    fn begin_registration(&mut self, request: Option<RequestRef>) {
        let Some(sender) = self.self_sender.upgrade() else {
            warn!(
                target: "gw.actor.device",
                device_id = %self.record.id,
                "Mailbox gone, not probing"
            );
            return;
        };

        self.registering = true;

        let registration = Registration {
            id: self.record.id.clone(),
            url: self.record.url.clone(),
            record_prefix: self.ctx.config.record_prefix(&self.record.id),
            recording_enabled: self.record.recording_enabled,
            audio_disabled: self.record.audio_disabled,
        };
        let conductor = Arc::clone(&self.ctx.conductor);
        let mailbox = Arc::clone(&self.mailbox);
        let started_at = Instant::now();

        debug!(
            target: "gw.actor.device",
            device_id = %registration.id,
            "Registration started"
        );

        tokio::spawn(async move {
            let device_id = registration.id.clone();
            let report =
                match tokio::task::spawn_blocking(move || conductor.register(&registration)).await
                {
                    Ok(report) => report,
                    Err(e) => {
                        error!(
                            target: "gw.actor.device",
                            device_id = %device_id,
                            error = %e,
                            "Probe task failed"
                        );
                        ProbeReport::offline()
                    }
                };

            let ended = DeviceMessage::RegistrationEnded {
                request,
                report,
                started_at,
            };
            if sender.send(ended).await.is_ok() {
                mailbox.record_enqueue();
            } else {
                debug!(
                    target: "gw.actor.device",
                    device_id = %device_id,
                    "Device gone before probe completed"
                );
            }
        });
    }

    fn handle_registration_ended(
        &mut self,
        request: Option<RequestRef>,
        report: ProbeReport,
        started_at: Instant,
    ) -> bool {
        let elapsed = started_at.elapsed();

        if let Some(pending) = self.pending_delete.take() {
            prom::record_registration("discarded", elapsed);
            return self.finalize_delete(pending.request);
        }

        self.registering = false;

        if let Some(pending) = self.pending_save.take() {
            prom::record_registration("discarded", elapsed);
            if request.is_some() {
                let note = format!("Registration superseded: {}", pending.record.id);
                self.emit(
                    DeviceEventKind::StatusNoChange,
                    pending.record.clone(),
                    request,
                    note,
                );
            }
            self.adopt(pending.record, pending.request);
            return false;
        }

        prom::record_registration(if report.online { "online" } else { "offline" }, elapsed);

        if self.record.matches_probe(&report) {
            let note = format!("Not changed: {}", self.record.id);
            self.emit(DeviceEventKind::StatusNoChange, self.record.clone(), request, note);
            return false;
        }

        let before = self.record.clone();
        self.record.apply_probe(&report);
        self.record.touch();

        if let Err(e) = self.ctx.store.put_device(&self.record, None) {
            warn!(
                target: "gw.actor.device",
                device_id = %self.record.id,
                error = %e,
                "Failed to persist probe result"
            );
            prom::record_storage_failure("put");
            let note = format!("Save failed: {}", self.record.id);
            self.emit(DeviceEventKind::SaveFailed, self.record.clone(), None, note);
        }

        info!(
            target: "gw.actor.device",
            device_id = %self.record.id,
            online = self.record.online,
            width = self.record.width,
            height = self.record.height,
            "Camera status changed"
        );

        let note = describe_change(&before, &self.record);
        self.emit(DeviceEventKind::StatusChanged, self.record.clone(), request, note);
        false
    }

    fn emit(
        &self,
        kind: DeviceEventKind,
        record: DeviceRecord,
        request: Option<RequestRef>,
        note: String,
    ) {
        let event = DeviceEvent::new(kind, record, request, note);
        if let Err(e) = self.hub.device_event(event) {
            debug!(
                target: "gw.actor.device",
                device_id = %self.record.id,
                error = %e,
                "Hub gone, event dropped"
            );
        }
    }
}

fn recording_note(record: &DeviceRecord) -> String {
    format!(
        "Recording {}: {}",
        if record.recording_enabled { "on" } else { "off" },
        record.id
    )
}
