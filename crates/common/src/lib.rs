//! Types shared by the gateway service and its test utilities.
//!
//! - [`types`] - link and observer identifiers
//! - [`config`] - logging setup
//! - [`secret`] - room token wrapper that never prints its value

#![warn(clippy::pedantic)]

pub mod config;
pub mod secret;
pub mod types;
