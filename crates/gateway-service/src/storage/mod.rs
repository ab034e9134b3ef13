//! Persistent storage of device records and scalar settings.
//!
//! All calls are synchronous and individually crash-consistent. Device
//! actors call the store inline; nothing here is held across an await.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::errors::GatewayError;
use crate::models::DeviceRecord;
use std::collections::BTreeMap;
use thiserror::Error;

/// Scalar key holding the control-link login credential.
pub const ROOM_TOKEN_KEY: &str = "RoomToken";

/// Scalar key holding the token used to register a new room.
pub const REG_TOKEN_KEY: &str = "RegToken";

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid record: {0}")]
    Invalid(String),
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => GatewayError::NotFound(id),
            other => GatewayError::Storage(other.to_string()),
        }
    }
}

/// Storage surface used by the gateway.
pub trait DeviceStore: Send + Sync {
    /// All stored devices keyed by id.
    fn get_devices(&self) -> Result<BTreeMap<String, DeviceRecord>, StoreError>;

    fn get_device(&self, id: &str) -> Result<DeviceRecord, StoreError>;

    /// Write `record` under `record.id`. With `rename_from`, the record
    /// stored under that id is removed in the same transaction.
    fn put_device(&self, record: &DeviceRecord, rename_from: Option<&str>)
        -> Result<(), StoreError>;

    /// Removing an unknown id is not an error.
    fn remove_device(&self, id: &str) -> Result<(), StoreError>;

    /// `None` when the key was never written.
    fn get_scalar(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put_scalar(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn delete_scalar(&self, key: &str) -> Result<(), StoreError>;
}
