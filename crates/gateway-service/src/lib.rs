//! Camera Gateway Service Library
//!
//! Bridges IP cameras on a local network to a remote control server:
//!
//! - One actor per configured camera owns its record, probes it and reports
//!   status changes
//! - A single hub keeps the authenticated control link, fans status out to
//!   local clients and dispatches server commands
//! - Signaling sockets relay WebRTC offers and candidates to the media engine
//!
//! # Architecture
//!
//! ```text
//! ControlLinkManager ──frames──> HubActor ──> DeviceDirectory ──> DeviceActor*
//!        ^                          │                                  │
//!        └──── reconnect kick ──────┘<──────── DeviceEvent ────────────┘
//! ```
//!
//! The media engine ([`media::Conductor`]) and persistence
//! ([`storage::DeviceStore`]) are traits; the binary plugs in an RTSP probe
//! and SQLite.
//!
//! # Modules
//!
//! - [`actors`] - hub, directory and device actors
//! - [`control_link`] - dial/login/reconnect of the control link
//! - [`signaling`] - per-viewer signaling relay
//! - [`local`] - local control socket for the operator UI
//! - [`transport`] - link abstraction and WebSocket dialer
//! - [`wire`] - frame formats
//! - [`config`] - configuration from environment

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod actors;
pub mod config;
pub mod context;
pub mod control_link;
pub mod errors;
pub mod gateway;
pub mod local;
pub mod media;
pub mod models;
pub mod observability;
pub mod signaling;
pub mod storage;
pub mod transport;
pub mod wire;

pub use context::GatewayContext;
pub use gateway::Gateway;
