//! `HubActor` - the gateway's single coordination point.
//!
//! The hub:
//! - owns the current control link and the stored connectivity status
//! - fans out status and notices to local observers
//! - translates device events into control-link replies
//! - dispatches server commands and local commands
//!
//! Device events reach the hub on their own unbounded lane, so a device
//! never waits on the hub while the hub waits on a device mailbox. The lane
//! is held in check by the device mailboxes: a device emits at most a few
//! events per message it handles. Work that needs device replies (the
//! device list) is spawned onto its own task.

use crate::context::GatewayContext;
use crate::control_link::room_token;
use crate::errors::GatewayError;
use crate::models::DeviceSetter;
use crate::observability::metrics as prom;
use crate::signaling;
use crate::transport::Link;
use crate::storage::{REG_TOKEN_KEY, ROOM_TOKEN_KEY};
use crate::wire::{
    self, LocalCommand, LocalCommandKind, Regable, ServerCommand, ServerCommandKind, Status,
};

use super::directory::DeviceDirectory;
use super::messages::{DeviceEvent, DeviceEventKind, HubMessage, HubStatus, Observer};
use super::metrics::{ActorType, MailboxMonitor};

use common::secret::{is_compact_token, ExposeSecret, SecretString};
use common::types::{LinkId, ObserverId};
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the hub mailbox.
pub const HUB_CHANNEL_BUFFER: usize = 1000;

/// Handle to the `HubActor`.
#[derive(Clone, Debug)]
pub struct HubActorHandle {
    sender: mpsc::Sender<HubMessage>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    mailbox: Arc<MailboxMonitor>,
}

/// Receiving half of the hub mailbox, consumed by [`HubActor::spawn`].
///
/// Split from the handle so device actors and the directory can be wired to
/// the hub before the hub itself exists.
#[derive(Debug)]
pub struct HubMailbox {
    receiver: mpsc::Receiver<HubMessage>,
    events: mpsc::UnboundedReceiver<DeviceEvent>,
    monitor: Arc<MailboxMonitor>,
}

impl HubMailbox {
    /// Next message from either lane. Device events arrive wrapped in
    /// [`HubMessage::DeviceEvent`].
    pub async fn recv(&mut self) -> Option<HubMessage> {
        let message = tokio::select! {
            Some(event) = self.events.recv() => Some(HubMessage::DeviceEvent(event)),
            message = self.receiver.recv() => message,
        };
        if message.is_some() {
            self.monitor.record_dequeue();
        }
        message
    }

    pub fn try_recv(&mut self) -> Option<HubMessage> {
        let message = match self.events.try_recv() {
            Ok(event) => Some(HubMessage::DeviceEvent(event)),
            Err(_) => self.receiver.try_recv().ok(),
        };
        if message.is_some() {
            self.monitor.record_dequeue();
        }
        message
    }
}

/// Create the hub mailbox.
#[must_use]
pub fn mailbox() -> (HubActorHandle, HubMailbox) {
    let (sender, receiver) = mpsc::channel(HUB_CHANNEL_BUFFER);
    let (events_tx, events) = mpsc::unbounded_channel();
    let monitor = Arc::new(MailboxMonitor::new(ActorType::Hub, "hub"));
    (
        HubActorHandle {
            sender,
            events: events_tx,
            mailbox: Arc::clone(&monitor),
        },
        HubMailbox {
            receiver,
            events,
            monitor,
        },
    )
}

impl HubActorHandle {
    async fn send(&self, message: HubMessage) -> Result<(), GatewayError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;
        self.mailbox.record_enqueue();
        Ok(())
    }

    pub async fn add_observer(&self, observer: Observer) -> Result<(), GatewayError> {
        self.send(HubMessage::AddObserver { observer }).await
    }

    pub async fn remove_observer(&self, observer_id: ObserverId) -> Result<(), GatewayError> {
        self.send(HubMessage::RemoveObserver { observer_id }).await
    }

    pub async fn change_status(&self, status: Option<Status>) -> Result<(), GatewayError> {
        self.send(HubMessage::ChangeStatus { status }).await
    }

    pub async fn change_no_status(&self, payload: String) -> Result<(), GatewayError> {
        self.send(HubMessage::ChangeNoStatus { payload }).await
    }

    pub async fn connect_control_link(&self) -> Result<(), GatewayError> {
        self.send(HubMessage::ConnectControlLink).await
    }

    pub async fn set_control_link(&self, link: Link) -> Result<(), GatewayError> {
        self.send(HubMessage::SetControlLink { link }).await
    }

    pub async fn clear_control_link(&self, link_id: LinkId) -> Result<(), GatewayError> {
        self.send(HubMessage::ClearControlLink { link_id }).await
    }

    pub async fn send_control(&self, frame: String) -> Result<(), GatewayError> {
        self.send(HubMessage::SendControl { frame }).await
    }

    pub async fn push_device_list(&self) -> Result<(), GatewayError> {
        self.send(HubMessage::PushDeviceList).await
    }

    /// Queue a device event. Never waits, so device actors can report
    /// while the hub is blocked on their mailboxes.
    pub fn device_event(&self, event: DeviceEvent) -> Result<(), GatewayError> {
        self.events
            .send(event)
            .map_err(|e| GatewayError::Internal(format!("channel send failed: {e}")))?;
        self.mailbox.record_enqueue();
        Ok(())
    }

    pub async fn server_command(&self, command: ServerCommand) -> Result<(), GatewayError> {
        self.send(HubMessage::ServerCommand(command)).await
    }

    pub async fn local_command(
        &self,
        observer_id: ObserverId,
        command: LocalCommand,
    ) -> Result<(), GatewayError> {
        self.send(HubMessage::LocalCommand {
            observer_id,
            command,
        })
        .await
    }

    pub async fn status(&self) -> Result<HubStatus, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::GetStatus { respond_to: tx }).await?;
        rx.await
            .map_err(|e| GatewayError::Internal(format!("response receive failed: {e}")))
    }

    #[must_use]
    pub fn mailbox(&self) -> &MailboxMonitor {
        &self.mailbox
    }
}

/// The `HubActor` implementation.
pub struct HubActor {
    mailbox: HubMailbox,
    /// Own handle, passed to spawned work that reports back.
    handle: HubActorHandle,
    ctx: GatewayContext,
    directory: DeviceDirectory,
    status: Status,
    link: Option<Link>,
    observers: HashMap<ObserverId, mpsc::Sender<String>>,
    /// Wakes the control-link manager out of its retry delay.
    reconnect: Arc<Notify>,
    /// Root token; cancelled by a local `Exit`.
    shutdown: CancellationToken,
    cancel_token: CancellationToken,
}

impl HubActor {
    /// Spawn the hub on `mailbox`.
    pub fn spawn(
        mailbox: HubMailbox,
        handle: HubActorHandle,
        ctx: GatewayContext,
        directory: DeviceDirectory,
        reconnect: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cancel_token = shutdown.child_token();
        let actor = Self {
            mailbox,
            handle,
            ctx,
            directory,
            status: Status::Disconnected,
            link: None,
            observers: HashMap::new(),
            reconnect,
            shutdown,
            cancel_token,
        };
        tokio::spawn(actor.run())
    }

    #[instrument(skip_all, name = "gw.actor.hub")]
    async fn run(mut self) {
        info!(target: "gw.actor.hub", "HubActor started");

        let period = self.ctx.config.hub_tick;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "gw.actor.hub", "HubActor received cancellation signal");
                    break;
                }

                _ = ticker.tick() => {
                    self.on_tick().await;
                }

                msg = self.mailbox.recv() => {
                    let Some(message) = msg else {
                        debug!(target: "gw.actor.hub", "HubActor channel closed, exiting");
                        break;
                    };
                    let outcome = AssertUnwindSafe(self.handle_message(message))
                        .catch_unwind()
                        .await;
                    self.ctx.metrics.record_message_processed();
                    if outcome.is_err() {
                        self.ctx.metrics.record_panic(ActorType::Hub);
                        error!(target: "gw.actor.hub", "Hub message handler panicked");
                    }
                }
            }
        }

        if let Some(link) = self.link.take() {
            link.close();
        }
        self.observers.clear();
        self.ctx.metrics.set_observers(0);
        self.directory.shutdown();

        info!(
            target: "gw.actor.hub",
            messages_processed = self.handle.mailbox().messages_processed(),
            "HubActor stopped"
        );
    }

    /// Periodic upkeep: make sure a connection attempt is pending and
    /// nudge devices that are not online.
    async fn on_tick(&mut self) {
        self.connect_control_link();
        self.directory.trigger_all(false).await;
    }

    async fn handle_message(&mut self, message: HubMessage) {
        match message {
            HubMessage::AddObserver { observer } => {
                debug!(target: "gw.actor.hub", observer_id = %observer.id, "Observer added");
                self.observers.insert(observer.id, observer.sender);
                self.ctx.metrics.set_observers(self.observers.len());
            }

            HubMessage::RemoveObserver { observer_id } => {
                self.remove_observer(observer_id);
            }

            HubMessage::ChangeStatus { status } => self.change_status(status),

            HubMessage::ChangeNoStatus { payload } => self.broadcast(&payload),

            HubMessage::ConnectControlLink => self.connect_control_link(),

            HubMessage::SetControlLink { link } => {
                let link_id = link.id();
                if let Some(previous) = self.link.replace(link) {
                    if previous.id() != link_id {
                        previous.close();
                    }
                }
                debug!(target: "gw.actor.hub", "Control link set");
            }

            HubMessage::ClearControlLink { link_id } => {
                if self.link.as_ref().is_some_and(|link| link.id() == link_id) {
                    self.link = None;
                    self.ctx.health.link_lost();
                    debug!(target: "gw.actor.hub", link_id = %link_id, "Control link cleared");
                }
            }

            HubMessage::SendControl { frame } => self.send_control(frame).await,

            HubMessage::PushDeviceList => self.push_device_list(),

            HubMessage::DeviceEvent(event) => self.handle_device_event(event).await,

            HubMessage::ServerCommand(command) => self.handle_server_command(command).await,

            HubMessage::LocalCommand {
                observer_id,
                command,
            } => self.handle_local_command(observer_id, command).await,

            HubMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(HubStatus {
                    status: self.status,
                    has_control_link: self.link.is_some(),
                    observer_count: self.observers.len(),
                    device_count: self.directory.len(),
                });
            }
        }
    }

    fn remove_observer(&mut self, observer_id: ObserverId) {
        if self.observers.remove(&observer_id).is_some() {
            debug!(target: "gw.actor.hub", observer_id = %observer_id, "Observer removed");
            self.ctx.metrics.set_observers(self.observers.len());
        }
    }

    fn change_status(&mut self, status: Option<Status>) {
        if let Some(status) = status {
            if status != self.status {
                info!(target: "gw.actor.hub", from = %self.status, to = %status, "Status changed");
            }
            self.status = status;
            self.ctx.health.record_status(status);
        }
        let frame = self.status.to_frame();
        self.broadcast(&frame);
    }

    /// Offer `payload` to every observer without waiting. An observer whose
    /// queue is full or closed is dropped.
    fn broadcast(&mut self, payload: &str) {
        let mut evicted = Vec::new();
        for (id, sender) in &self.observers {
            if let Err(e) = sender.try_send(payload.to_string()) {
                warn!(
                    target: "gw.actor.hub",
                    observer_id = %id,
                    error = %e,
                    "Evicting observer"
                );
                evicted.push(*id);
            }
        }

        if evicted.is_empty() {
            return;
        }
        for id in evicted {
            self.observers.remove(&id);
            prom::record_observer_evicted();
        }
        self.ctx.metrics.set_observers(self.observers.len());
    }

    fn send_to_observer(&mut self, observer_id: ObserverId, payload: String) {
        let Some(sender) = self.observers.get(&observer_id) else {
            return;
        };
        if let Err(e) = sender.try_send(payload) {
            warn!(
                target: "gw.actor.hub",
                observer_id = %observer_id,
                error = %e,
                "Evicting observer"
            );
            self.observers.remove(&observer_id);
            prom::record_observer_evicted();
            self.ctx.metrics.set_observers(self.observers.len());
        }
    }

    fn connect_control_link(&self) {
        if self.has_live_link() {
            debug!(target: "gw.actor.hub", "Control link already up");
            return;
        }
        self.reconnect.notify_one();
    }

    /// Write one control frame, waiting for the writer when the link is
    /// busy. A link that fails or stalls is dropped.
    async fn send_control(&mut self, frame: String) {
        let Some(link) = self.link.clone() else {
            debug!(target: "gw.actor.hub", "No control link, frame dropped");
            return;
        };
        if let Err(e) = link.send_wait(frame).await {
            warn!(target: "gw.actor.hub", error = %e, "Control send failed, dropping link");
            self.link = None;
            self.ctx.health.link_lost();
        }
    }

    /// Gather device snapshots off the hub task and push them as one frame.
    fn push_device_list(&self) {
        let Some(link) = self.link.clone() else {
            debug!(target: "gw.actor.hub", "No control link, device list not pushed");
            return;
        };
        let directory = self.directory.clone();
        tokio::spawn(async move {
            let views: Vec<_> = directory
                .snapshot_all()
                .await
                .iter()
                .map(crate::models::DeviceRecord::view)
                .collect();
            if let Err(e) = link.send_wait(wire::devices_frame(&views)).await {
                warn!(target: "gw.actor.hub", error = %e, "Device list push failed");
            }
        });
    }

    async fn handle_device_event(&mut self, event: DeviceEvent) {
        let DeviceEvent {
            kind,
            record,
            request,
            note,
        } = event;

        match kind {
            DeviceEventKind::StatusChanged => match request {
                Some(request) => {
                    let content = to_value(&record.view());
                    self.send_control(wire::response_frame(request.from, &request.name, content))
                        .await;
                }
                None => self.push_device_list(),
            },

            DeviceEventKind::StatusNoChange => {
                if let Some(request) = request {
                    self.send_control(wire::info_frame(request.from, &note)).await;
                }
            }

            DeviceEventKind::SaveFailed
            | DeviceEventKind::DelFailed
            | DeviceEventKind::NotFound => {
                warn!(target: "gw.actor.hub", device_id = %record.id, note = %note, "Device operation failed");
                if let Some(request) = request {
                    self.send_control(wire::info_frame(request.from, &note)).await;
                }
            }

            DeviceEventKind::GetOk => {
                if let Some(request) = request {
                    let content = to_value(&record);
                    self.send_control(wire::response_frame(request.from, &request.name, content))
                        .await;
                }
            }

            DeviceEventKind::DelOk => {
                if let Some(request) = request {
                    self.send_control(wire::info_frame(request.from, &note)).await;
                }
                self.push_device_list();
            }

            DeviceEventKind::RecChanged => {
                let notice = wire::recording_notice(&record, &self.directory.ids());
                self.broadcast(&notice);
            }

            DeviceEventKind::IdChanged { old, new } => {
                self.send_control(wire::id_changed_frame(&old, &new)).await;
                self.push_device_list();
            }
        }
    }

    #[instrument(skip_all, fields(name = %command.name, from = command.from))]
    async fn handle_server_command(&mut self, command: ServerCommand) {
        let request = command.request();

        match command.kind() {
            ServerCommandKind::GetIpcams => self.push_device_list(),

            ServerCommandKind::ManageGetIpcam => {
                self.directory.get(&command.value(), Some(request)).await;
            }

            ServerCommandKind::ManageSetIpcam => {
                match command.decode_content::<DeviceSetter>() {
                    Ok(setter) => {
                        if let Err(e) = self.directory.save(setter, Some(request)).await {
                            warn!(target: "gw.actor.hub", error = %e, "Save rejected");
                            self.send_control(wire::info_frame(command.from, &e.client_message()))
                                .await;
                        }
                    }
                    Err(e) => {
                        warn!(target: "gw.actor.hub", error = %e, "Cannot parse camera");
                        self.send_control(wire::info_frame(command.from, "Cannot parse camera"))
                            .await;
                    }
                }
            }

            ServerCommandKind::ManageDelIpcam => {
                self.directory.delete(&command.value(), Some(request)).await;
            }

            ServerCommandKind::ManageReconnectIpcam => {
                self.directory.reconnect(&command.value(), Some(request)).await;
            }

            ServerCommandKind::CreateSignalingConnection => {
                let receiver = command.value();
                if receiver.is_empty() {
                    self.send_control(wire::info_frame(command.from, "Missing signaling receiver"))
                        .await;
                    return;
                }
                tokio::spawn(signaling::run_session(
                    self.ctx.clone(),
                    self.directory.clone(),
                    self.handle.clone(),
                    request,
                    receiver,
                ));
            }

            ServerCommandKind::LoginOk => {
                self.change_status(Some(Status::Ready));
                self.push_device_list();
            }

            ServerCommandKind::ViewerJoined => {
                self.change_status(Some(Status::Ready));
                let ids = json!(self.directory.ids());
                self.send_control(wire::response_frame(command.from, "Ids", ids)).await;
                self.directory.view_all(Some(request)).await;
            }

            ServerCommandKind::SetRoomToken => {
                let token = command.value();
                if let Err(e) = self
                    .ctx
                    .store
                    .put_scalar(ROOM_TOKEN_KEY, token.as_bytes())
                {
                    warn!(target: "gw.actor.hub", error = %e, "Failed to store room token");
                    prom::record_storage_failure("scalar");
                    self.change_status(Some(Status::SaveRoomTokenError));
                    return;
                }
                info!(target: "gw.actor.hub", "Room token updated");
                self.login().await;
            }

            ServerCommandKind::BadRegToken => {
                warn!(target: "gw.actor.hub", "Registration token rejected by server");
                self.forget_reg_token();
                self.broadcast(&Regable::BadRegToken.to_frame());
            }

            ServerCommandKind::RegError => {
                warn!(target: "gw.actor.hub", "Room registration failed");
                self.change_status(Some(Status::RegError));
            }

            // The control-link manager ends the link on a rejection
            ServerCommandKind::LoginFailed | ServerCommandKind::Unknown => {
                debug!(target: "gw.actor.hub", name = %command.name, "Ignoring server command");
            }
        }
    }

    async fn handle_local_command(&mut self, observer_id: ObserverId, command: LocalCommand) {
        debug!(
            target: "gw.actor.hub",
            observer_id = %observer_id,
            command = ?command.kind,
            "Local command"
        );

        match command.kind {
            LocalCommandKind::GetStatus => {
                let frame = self.status.to_frame();
                self.send_to_observer(observer_id, frame);
            }

            LocalCommandKind::GetRoomInfo => {
                let notice = wire::room_info_notice(&self.ctx.config.gateway_id);
                self.send_to_observer(observer_id, notice);
                self.directory.local_broadcast().await;
            }

            LocalCommandKind::GetCameras => self.directory.local_broadcast().await,

            LocalCommandKind::SetRecOn | LocalCommandKind::SetRecOff => {
                let enabled = command.kind == LocalCommandKind::SetRecOn;
                self.directory
                    .toggle_recording(&command.value(), enabled)
                    .await;
            }

            LocalCommandKind::DoConnect => self.connect_control_link(),

            LocalCommandKind::DoLogin => self.login().await,

            LocalCommandKind::GetRegable => {
                let regable = match self.reg_token() {
                    Some(token) if is_compact_token(&token) => Regable::Regable,
                    _ => Regable::BadRegToken,
                };
                self.broadcast(&regable.to_frame());
            }

            LocalCommandKind::SetRegToken => {
                let token = command.value();
                let regable = match self.ctx.store.put_scalar(REG_TOKEN_KEY, token.as_bytes()) {
                    Ok(()) => Regable::Regable,
                    Err(e) => {
                        warn!(target: "gw.actor.hub", error = %e, "Failed to store registration token");
                        prom::record_storage_failure("scalar");
                        Regable::SaveRegTokenError
                    }
                };
                self.broadcast(&regable.to_frame());
            }

            LocalCommandKind::DoRemoveRegToken => {
                self.forget_reg_token();
                self.broadcast(&Regable::BadRegToken.to_frame());
                self.change_status(None);
            }

            LocalCommandKind::DoRegRoom => self.register_room(&command.content).await,

            LocalCommandKind::DoRemoveRoom => {
                if self.has_live_link() {
                    info!(target: "gw.actor.hub", "Removing room");
                    self.send_control(wire::remove_room_frame()).await;
                } else {
                    self.change_status(Some(Status::Disconnected));
                }
            }

            LocalCommandKind::Close => self.remove_observer(observer_id),

            LocalCommandKind::Exit => {
                info!(target: "gw.actor.hub", "Exit requested by local client");
                self.shutdown.cancel();
            }
        }
    }

    fn has_live_link(&self) -> bool {
        self.link.as_ref().is_some_and(|link| !link.is_closed())
    }

    fn reg_token(&self) -> Option<SecretString> {
        match self.ctx.store.get_scalar(REG_TOKEN_KEY) {
            Ok(bytes) => bytes
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .map(SecretString::from),
            Err(e) => {
                warn!(target: "gw.actor.hub", error = %e, "Cannot read registration token");
                None
            }
        }
    }

    fn forget_reg_token(&self) {
        if let Err(e) = self.ctx.store.delete_scalar(REG_TOKEN_KEY) {
            warn!(target: "gw.actor.hub", error = %e, "Failed to remove registration token");
            prom::record_storage_failure("scalar");
        }
    }

    /// Ask the server to register this gateway as a room named `name`.
    /// `regging` (or `disconnected` without a link) is only announced; the
    /// stored status is left alone so the server's answer decides it.
    async fn register_room(&mut self, name: &Value) {
        if !self.has_live_link() {
            self.broadcast(&Status::Disconnected.to_frame());
            return;
        }
        let Some(token) = self.reg_token().filter(is_compact_token) else {
            warn!(target: "gw.actor.hub", "Registration token missing or malformed");
            self.broadcast(&Regable::BadRegToken.to_frame());
            return;
        };

        info!(target: "gw.actor.hub", "Registering room");
        self.broadcast(&Status::Regging.to_frame());
        self.send_control(wire::reg_room_frame(token.expose_secret(), name))
            .await;
    }

    /// Log in on the current link, or ask for a new connection if there is
    /// none.
    async fn login(&mut self) {
        let token = match room_token(&self.ctx) {
            Ok(Some(token)) if is_compact_token(&token) => token,
            Ok(_) => {
                warn!(target: "gw.actor.hub", "Room token missing or malformed");
                self.change_status(Some(Status::BadRoomToken));
                return;
            }
            Err(e) => {
                warn!(target: "gw.actor.hub", error = %e, "Cannot read room token");
                self.change_status(Some(Status::BadRoomToken));
                return;
            }
        };

        if self.link.is_none() {
            self.connect_control_link();
            return;
        }

        self.send_control(wire::login_frame(token.expose_secret())).await;
        self.change_status(Some(Status::LoggingIn));
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
