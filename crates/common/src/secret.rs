//! Secret types for keeping credentials out of logs.
//!
//! Re-exports the [`secrecy`] types used for the gateway's login credential
//! (the room token) and anything else that must never reach a log line.
//!
//! `SecretString` implements `Debug` with redaction, so deriving `Debug` on a
//! struct that holds one is safe. The value is zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct Login {
//!     gateway_id: String,
//!     room_token: SecretString,
//! }
//!
//! let login = Login {
//!     gateway_id: "gw-1".to_string(),
//!     room_token: SecretString::from("aaa.bbb.ccc"),
//! };
//!
//! assert!(!format!("{login:?}").contains("aaa.bbb.ccc"));
//! assert_eq!(login.room_token.expose_secret(), "aaa.bbb.ccc");
//! ```
//!
//! With the `serde` feature of `secrecy` enabled, secrets deserialize
//! directly from JSON or environment-derived maps.

// Re-export the main types from secrecy
pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Returns true when `token` has the shape of a compact JWT
/// (three segments separated by exactly two dots).
///
/// The control server only accepts room tokens of this shape, so a token
/// failing this check is rejected locally without a login round trip.
#[must_use]
pub fn is_compact_token(token: &SecretString) -> bool {
    let raw = token.expose_secret();
    raw.matches('.').count() == 2 && raw.split('.').all(|segment| !segment.is_empty())
}
