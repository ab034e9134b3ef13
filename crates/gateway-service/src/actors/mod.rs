//! Actor model of the gateway.
//!
//! ```text
//! HubActor (singleton)
//! ├── owns the control link and local observers
//! └── DeviceDirectory (id -> actor map, shared)
//!     └── DeviceActor (one per camera)
//!         └── detached probe task (at most one at a time)
//! ```
//!
//! - **Message passing**: all inter-actor traffic uses `tokio::sync::mpsc`
//! - **Cancellation**: the hub and every device run on child tokens of the
//!   process root token
//! - **Containment**: a panicking handler drops its message; the actor keeps
//!   running
//!
//! # Modules
//!
//! - [`hub`] - `HubActor`, status fan-out and command dispatch
//! - [`directory`] - `DeviceDirectory`, routing by device id
//! - [`device`] - `DeviceActor`, per-camera state and probe coalescing
//! - [`messages`] - message and event types
//! - [`metrics`] - mailbox monitoring and actor counters

pub mod device;
pub mod directory;
pub mod hub;
pub mod messages;
pub mod metrics;

pub use device::{DeviceActor, DeviceActorHandle};
pub use directory::DeviceDirectory;
pub use hub::{mailbox, HubActor, HubActorHandle, HubMailbox};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
