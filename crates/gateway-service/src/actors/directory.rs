//! `DeviceDirectory` - routes operations to device actors by id.
//!
//! The id map is the only state shared between actors; it sits behind a
//! mutex that is never held across an await. Lookups clone the handle out of
//! the lock before sending. Renames and deletions are applied by the owning
//! actor, and only when the map entry still belongs to that actor. During a
//! rename the actor is briefly reachable under both ids.

use crate::context::GatewayContext;
use crate::errors::GatewayError;
use crate::media::LivenessObserver;
use crate::models::{DeviceRecord, DeviceSetter, ProbeReport};
use crate::observability::metrics as prom;
use crate::wire::RequestRef;

use super::device::{DeviceActor, DeviceActorHandle};
use super::hub::HubActorHandle;
use super::messages::{DeviceEvent, DeviceEventKind, DeviceMessage};
use super::metrics::ActorType;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Shared id -> actor map. Cheap to clone.
#[derive(Clone)]
pub struct DeviceDirectory {
    inner: Arc<DirectoryInner>,
}

struct DirectoryInner {
    devices: Mutex<HashMap<String, DeviceActorHandle>>,
    ctx: GatewayContext,
    hub: HubActorHandle,
    cancel_token: CancellationToken,
    runtime: Handle,
}

enum Placement {
    Existing(DeviceActorHandle),
    Created(DeviceActorHandle),
}

impl DeviceDirectory {
    /// Create an empty directory. Must be called from within a Tokio runtime.
    pub fn new(
        ctx: GatewayContext,
        hub: HubActorHandle,
        cancel_token: CancellationToken,
    ) -> Result<Self, GatewayError> {
        let runtime = Handle::try_current()
            .map_err(|e| GatewayError::Internal(format!("no tokio runtime: {e}")))?;

        Ok(Self {
            inner: Arc::new(DirectoryInner {
                devices: Mutex::new(HashMap::new()),
                ctx,
                hub,
                cancel_token,
                runtime,
            }),
        })
    }

    /// Create a directory and spawn one actor per stored device.
    #[instrument(skip_all, name = "gw.actor.directory")]
    pub fn load(
        ctx: GatewayContext,
        hub: HubActorHandle,
        cancel_token: CancellationToken,
    ) -> Result<Self, GatewayError> {
        let stored = ctx.store.get_devices()?;
        let directory = Self::new(ctx, hub, cancel_token)?;

        {
            let mut devices = directory.lock();
            for (id, record) in stored {
                let handle = directory.spawn_device(record);
                devices.insert(id, handle);
            }
        }

        info!(
            target: "gw.actor.directory",
            devices = directory.len(),
            "Loaded cameras from storage"
        );

        Ok(directory)
    }

    /// Kick a forced registration on every device.
    pub async fn start(&self) {
        self.trigger_all(true).await;
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DeviceActorHandle>> {
        self.inner
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, id: &str) -> Option<DeviceActorHandle> {
        self.lock().get(id).cloned()
    }

    /// One handle per actor, even mid-rename.
    fn handles(&self) -> Vec<DeviceActorHandle> {
        let devices = self.lock();
        let mut seen = HashSet::new();
        devices
            .values()
            .filter(|handle| seen.insert(handle.key()))
            .cloned()
            .collect()
    }

    /// Spawn an actor for `record` without inserting it. A supervisor task
    /// drops the map entry once the actor task ends.
    fn spawn_device(&self, record: DeviceRecord) -> DeviceActorHandle {
        let id = record.id.clone();
        let (handle, task) = DeviceActor::spawn(
            record,
            self.inner.ctx.clone(),
            self.clone(),
            self.inner.hub.clone(),
            self.inner.cancel_token.child_token(),
        );

        let directory = self.clone();
        let key = handle.key();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    directory.inner.ctx.metrics.record_panic(ActorType::Device);
                    error!(
                        target: "gw.actor.directory",
                        device_id = %id,
                        "Device actor task panicked"
                    );
                }
            }
            directory.forget(key);
        });

        handle
    }

    fn forget(&self, key: Uuid) {
        self.lock().retain(|_, handle| handle.key() != key);
    }

    fn report(&self, event: DeviceEvent) {
        if let Err(e) = self.inner.hub.device_event(event) {
            debug!(target: "gw.actor.directory", error = %e, "Hub gone, event dropped");
        }
    }

    /// Deliver a message built from `request` to device `id`, or report
    /// `NotFound` to the requester.
    async fn route(
        &self,
        id: &str,
        request: Option<RequestRef>,
        build: impl FnOnce(Option<RequestRef>) -> DeviceMessage,
    ) {
        let delivered = match self.lookup(id) {
            Some(handle) => handle.send(build(request.clone())).await.is_ok(),
            None => false,
        };

        if !delivered {
            debug!(target: "gw.actor.directory", device_id = %id, "Camera not found");
            self.report(DeviceEvent::not_found(id, request));
        }
    }

    /// Create or update a device.
    ///
    /// The save is routed by the setter's target, falling back to the record
    /// id. An unknown id creates and persists a new device, then probes it.
    pub async fn save(
        &self,
        setter: DeviceSetter,
        request: Option<RequestRef>,
    ) -> Result<(), GatewayError> {
        let key = setter.routing_id().to_string();
        if key.is_empty() {
            return Err(GatewayError::Protocol("Camera id is required".to_string()));
        }

        let mut record = setter.record;
        if record.id.is_empty() {
            record.id.clone_from(&key);
        }

        if let Some(handle) = self.lookup(&key) {
            let message = DeviceMessage::Save {
                record: record.clone(),
                target: key.clone(),
                request: request.clone(),
            };
            if handle.send(message).await.is_ok() {
                return Ok(());
            }
        }

        record.apply_probe(&ProbeReport::offline());
        record.touch();

        // Hold the lock only for the check-and-insert; persist first so a
        // failed write never leaves an actor behind.
        if self.lookup(&record.id).is_none() {
            if let Err(e) = self.inner.ctx.store.put_device(&record, None) {
                warn!(
                    target: "gw.actor.directory",
                    device_id = %record.id,
                    error = %e,
                    "Failed to persist new camera"
                );
                prom::record_storage_failure("put");
                let note = format!("Save failed: {}", record.id);
                self.report(DeviceEvent::new(DeviceEventKind::SaveFailed, record, request, note));
                return Ok(());
            }
        }

        let placement = {
            let mut devices = self.lock();
            match devices.get(&record.id) {
                Some(existing) => Placement::Existing(existing.clone()),
                None => {
                    let handle = self.spawn_device(record.clone());
                    devices.insert(record.id.clone(), handle.clone());
                    Placement::Created(handle)
                }
            }
        };

        match placement {
            Placement::Existing(handle) => {
                let target = record.id.clone();
                let message = DeviceMessage::Save {
                    record,
                    target: target.clone(),
                    request: request.clone(),
                };
                if handle.send(message).await.is_err() {
                    self.report(DeviceEvent::not_found(&target, request));
                }
            }
            Placement::Created(handle) => {
                info!(
                    target: "gw.actor.directory",
                    device_id = %record.id,
                    "Camera added"
                );
                if record.disabled {
                    let note = format!("Camera added: {}", record.id);
                    self.report(DeviceEvent::new(
                        DeviceEventKind::StatusChanged,
                        record,
                        request,
                        note,
                    ));
                } else {
                    let trigger = DeviceMessage::TriggerRegistration {
                        force: true,
                        request,
                    };
                    if let Err(e) = handle.send(trigger).await {
                        warn!(target: "gw.actor.directory", error = %e, "New camera gone");
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn get(&self, id: &str, request: Option<RequestRef>) {
        self.route(id, request, |request| DeviceMessage::Get { request })
            .await;
    }

    pub async fn delete(&self, id: &str, request: Option<RequestRef>) {
        self.route(id, request, |request| DeviceMessage::Delete { request })
            .await;
    }

    /// Force a fresh probe of one device.
    pub async fn reconnect(&self, id: &str, request: Option<RequestRef>) {
        self.route(id, request, |request| DeviceMessage::TriggerRegistration {
            force: true,
            request,
        })
        .await;
    }

    pub async fn view(&self, id: &str, request: Option<RequestRef>) {
        self.route(id, request, |request| DeviceMessage::View { request })
            .await;
    }

    pub async fn toggle_recording(&self, id: &str, enabled: bool) {
        self.route(id, None, |_| DeviceMessage::ToggleRecording { enabled })
            .await;
    }

    /// Ask every device to announce itself to a joining viewer.
    pub async fn view_all(&self, request: Option<RequestRef>) {
        for handle in self.handles() {
            let message = DeviceMessage::View {
                request: request.clone(),
            };
            if let Err(e) = handle.send(message).await {
                debug!(target: "gw.actor.directory", error = %e, "Skipping stopped camera");
            }
        }
    }

    pub async fn local_broadcast(&self) {
        for handle in self.handles() {
            if let Err(e) = handle.send(DeviceMessage::LocalBroadcast).await {
                debug!(target: "gw.actor.directory", error = %e, "Skipping stopped camera");
            }
        }
    }

    pub async fn trigger_all(&self, force: bool) {
        for handle in self.handles() {
            let message = DeviceMessage::TriggerRegistration {
                force,
                request: None,
            };
            if let Err(e) = handle.send(message).await {
                debug!(target: "gw.actor.directory", error = %e, "Skipping stopped camera");
            }
        }
    }

    /// Forward an engine liveness report. Reports for unknown ids release
    /// the engine's bookkeeping instead.
    pub async fn liveness_changed(&self, id: &str, online: bool) {
        match self.lookup(id) {
            Some(handle) => {
                if let Err(e) = handle.send(DeviceMessage::LivenessChanged { online }).await {
                    debug!(target: "gw.actor.directory", device_id = %id, error = %e, "Camera stopped");
                }
            }
            None => {
                debug!(
                    target: "gw.actor.directory",
                    device_id = %id,
                    "Liveness for unknown camera, unregistering"
                );
                self.inner.ctx.conductor.unregister(id);
            }
        }
    }

    /// Snapshot of one device's current record.
    pub async fn copy_of(&self, id: &str) -> Option<DeviceRecord> {
        let handle = self.lookup(id)?;
        copy_from(&handle).await
    }

    /// Snapshots of every device, sorted by id.
    pub async fn snapshot_all(&self) -> Vec<DeviceRecord> {
        let mut records = Vec::new();
        for handle in self.handles() {
            if let Some(record) = copy_from(&handle).await {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// All known ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Claim `new` for actor `key`, which stays reachable under `old` until
    /// [`release`](Self::release) drops whichever id loses. Check and insert
    /// happen under one lock.
    pub(crate) fn reserve_rename(
        &self,
        old: &str,
        new: &str,
        key: Uuid,
    ) -> Result<(), GatewayError> {
        let mut devices = self.lock();

        if let Some(occupant) = devices.get(new) {
            if occupant.key() != key {
                return Err(GatewayError::Conflict(format!("Camera id already in use: {new}")));
            }
        }

        let handle = match devices.get(old) {
            Some(handle) if handle.key() == key => handle.clone(),
            _ => return Err(GatewayError::NotFound(old.to_string())),
        };
        devices.insert(new.to_string(), handle);
        Ok(())
    }

    /// Drop `id` if it still maps to actor `key`.
    pub(crate) fn release(&self, id: &str, key: Uuid) {
        let mut devices = self.lock();
        if devices.get(id).is_some_and(|handle| handle.key() == key) {
            devices.remove(id);
        }
    }

    /// Cancel every device actor and forget them.
    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
        let drained: Vec<DeviceActorHandle> = self.lock().drain().map(|(_, h)| h).collect();
        for handle in drained {
            handle.cancel();
        }
    }
}

impl LivenessObserver for DeviceDirectory {
    fn on_liveness_changed(&self, id: &str, alive: bool) {
        let directory = self.clone();
        let id = id.to_string();
        self.inner.runtime.spawn(async move {
            directory.liveness_changed(&id, alive).await;
        });
    }
}

async fn copy_from(handle: &DeviceActorHandle) -> Option<DeviceRecord> {
    let (tx, rx) = oneshot::channel();
    handle
        .send(DeviceMessage::CopyOf { respond_to: tx })
        .await
        .ok()?;
    rx.await.ok()
}
