//! SQLite-backed [`DeviceStore`].

use super::{DeviceStore, StoreError};
use crate::models::DeviceRecord;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

const DEVICE_COLUMNS: &str = "id, url, rec, audio_off, off, online, has_video, has_audio, \
                              width, height, updated_at";

/// SQLite store. The connection is serialized behind a mutex; every call is
/// a short synchronous statement or transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL keeps readers from blocking on the single writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                rec INTEGER NOT NULL DEFAULT 0,
                audio_off INTEGER NOT NULL DEFAULT 0,
                off INTEGER NOT NULL DEFAULT 0,
                online INTEGER NOT NULL DEFAULT 0,
                has_video INTEGER NOT NULL DEFAULT 0,
                has_audio INTEGER NOT NULL DEFAULT 0,
                width INTEGER NOT NULL DEFAULT 0,
                height INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceRecord> {
    let updated_at: Option<i64> = row.get(10)?;
    Ok(DeviceRecord {
        id: row.get(0)?,
        url: row.get(1)?,
        recording_enabled: row.get(2)?,
        audio_disabled: row.get(3)?,
        disabled: row.get(4)?,
        online: row.get(5)?,
        has_video: row.get(6)?,
        has_audio: row.get(7)?,
        width: row.get(8)?,
        height: row.get(9)?,
        updated_at: updated_at.and_then(DateTime::<Utc>::from_timestamp_millis),
    })
}

impl DeviceStore for SqliteStore {
    fn get_devices(&self) -> Result<BTreeMap<String, DeviceRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("SELECT {DEVICE_COLUMNS} FROM devices"))?;
        let rows = stmt.query_map([], record_from_row)?;

        let mut devices = BTreeMap::new();
        for row in rows {
            let record = row?;
            devices.insert(record.id.clone(), record);
        }
        Ok(devices)
    }

    fn get_device(&self, id: &str) -> Result<DeviceRecord, StoreError> {
        self.lock()
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
                params![id],
                record_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn put_device(
        &self,
        record: &DeviceRecord,
        rename_from: Option<&str>,
    ) -> Result<(), StoreError> {
        if record.id.is_empty() {
            return Err(StoreError::Invalid("device id is empty".to_string()));
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        if let Some(old_id) = rename_from.filter(|old| *old != record.id) {
            tx.execute("DELETE FROM devices WHERE id = ?1", params![old_id])?;
            debug!(target: "gw.storage", old_id, new_id = %record.id, "Device renamed");
        }
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO devices ({DEVICE_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                record.id,
                record.url,
                record.recording_enabled,
                record.audio_disabled,
                record.disabled,
                record.online,
                record.has_video,
                record.has_audio,
                record.width,
                record.height,
                record.updated_at.map(|at| at.timestamp_millis()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn remove_device(&self, id: &str) -> Result<(), StoreError> {
        self.lock()
            .execute("DELETE FROM devices WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn get_scalar(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .lock()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn put_scalar(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete_scalar(&self, key: &str) -> Result<(), StoreError> {
        self.lock()
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}
