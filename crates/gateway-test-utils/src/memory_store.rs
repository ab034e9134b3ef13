//! In-memory [`DeviceStore`] with switchable failures.

use gateway_service::models::DeviceRecord;
use gateway_service::storage::{DeviceStore, StoreError};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    devices: BTreeMap<String, DeviceRecord>,
    scalars: HashMap<String, Vec<u8>>,
    fail_puts: bool,
    fail_removes: bool,
    fail_scalars: bool,
    puts: usize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_device(self, record: DeviceRecord) -> Self {
        self.lock().devices.insert(record.id.clone(), record);
        self
    }

    #[must_use]
    pub fn with_scalar(self, key: &str, value: &str) -> Self {
        self.lock()
            .scalars
            .insert(key.to_string(), value.as_bytes().to_vec());
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn fail_puts(&self, fail: bool) {
        self.lock().fail_puts = fail;
    }

    pub fn fail_removes(&self, fail: bool) {
        self.lock().fail_removes = fail;
    }

    pub fn fail_scalars(&self, fail: bool) {
        self.lock().fail_scalars = fail;
    }

    pub fn device(&self, id: &str) -> Option<DeviceRecord> {
        self.lock().devices.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().devices.keys().cloned().collect()
    }

    pub fn scalar(&self, key: &str) -> Option<String> {
        self.lock()
            .scalars
            .get(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Successful `put_device` calls so far.
    pub fn put_count(&self) -> usize {
        self.lock().puts
    }
}

fn injected(op: &str) -> StoreError {
    StoreError::Invalid(format!("injected {op} failure"))
}

impl DeviceStore for MemoryStore {
    fn get_devices(&self) -> Result<BTreeMap<String, DeviceRecord>, StoreError> {
        Ok(self.lock().devices.clone())
    }

    fn get_device(&self, id: &str) -> Result<DeviceRecord, StoreError> {
        self.lock()
            .devices
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn put_device(
        &self,
        record: &DeviceRecord,
        rename_from: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_puts {
            return Err(injected("put"));
        }
        if record.id.is_empty() {
            return Err(StoreError::Invalid("empty id".to_string()));
        }
        if let Some(old) = rename_from.filter(|old| *old != record.id) {
            inner.devices.remove(old);
        }
        inner.devices.insert(record.id.clone(), record.clone());
        inner.puts += 1;
        Ok(())
    }

    fn remove_device(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_removes {
            return Err(injected("remove"));
        }
        inner.devices.remove(id);
        Ok(())
    }

    fn get_scalar(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().scalars.get(key).cloned())
    }

    fn put_scalar(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.fail_scalars {
            return Err(injected("scalar"));
        }
        inner.scalars.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete_scalar(&self, key: &str) -> Result<(), StoreError> {
        self.lock().scalars.remove(key);
        Ok(())
    }
}
