//! Namespace-scoped durable key-value storage.
//!
//! Each component opens its own handle for its own namespace and never touches
//! another component's keys. Reads that fail are treated like absent keys by
//! the `*_or` helpers; the error is logged and the supplied default returned.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StoredValue {
    U8(u8),
    Bool(bool),
    Str(String),
}

pub trait KeyValueStore {
    fn namespace(&self) -> &str;

    fn get_u8(&self, key: &str) -> Result<Option<u8>, StoreError>;
    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError>;
    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn put_u8(&mut self, key: &str, value: u8) -> Result<(), StoreError>;
    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError>;
    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Returns whether the key existed.
    fn remove(&mut self, key: &str) -> Result<bool, StoreError>;

    fn u8_or(&self, key: &str, default: u8) -> u8 {
        self.get_u8(key)
            .unwrap_or_else(|err| {
                warn!("{}/{key}: read failed, using default: {err}", self.namespace());
                None
            })
            .unwrap_or(default)
    }

    fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key)
            .unwrap_or_else(|err| {
                warn!("{}/{key}: read failed, using default: {err}", self.namespace());
                None
            })
            .unwrap_or(default)
    }

    fn str_or(&self, key: &str, default: &str) -> String {
        self.get_str(key)
            .unwrap_or_else(|err| {
                warn!("{}/{key}: read failed, using default: {err}", self.namespace());
                None
            })
            .unwrap_or_else(|| default.to_string())
    }
}

type Entries = BTreeMap<(String, String), StoredValue>;

/// In-memory store shared by any number of namespace handles. Counts writes so
/// callers can verify that a code path stayed off the durable medium.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<Entries>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, namespace: &str) -> MemoryNamespace {
        MemoryNamespace {
            store: self.clone(),
            namespace: namespace.to_string(),
        }
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn value(&self, namespace: &str, key: &str) -> Option<StoredValue> {
        self.lock()
            .ok()?
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Entries>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

pub struct MemoryNamespace {
    store: MemoryStore,
    namespace: String,
}

impl MemoryNamespace {
    fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let entries = self.store.lock()?;
        Ok(entries
            .get(&(self.namespace.clone(), key.to_string()))
            .cloned())
    }

    fn put(&mut self, key: &str, value: StoredValue) -> Result<(), StoreError> {
        let mut entries = self.store.lock()?;
        entries.insert((self.namespace.clone(), key.to_string()), value);
        self.store.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl KeyValueStore for MemoryNamespace {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn get_u8(&self, key: &str) -> Result<Option<u8>, StoreError> {
        match self.get(key)? {
            None => Ok(None),
            Some(StoredValue::U8(value)) => Ok(Some(value)),
            Some(_) => Err(StoreError::TypeMismatch {
                key: key.to_string(),
            }),
        }
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        match self.get(key)? {
            None => Ok(None),
            Some(StoredValue::Bool(value)) => Ok(Some(value)),
            Some(_) => Err(StoreError::TypeMismatch {
                key: key.to_string(),
            }),
        }
    }

    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.get(key)? {
            None => Ok(None),
            Some(StoredValue::Str(value)) => Ok(Some(value)),
            Some(_) => Err(StoreError::TypeMismatch {
                key: key.to_string(),
            }),
        }
    }

    fn put_u8(&mut self, key: &str, value: u8) -> Result<(), StoreError> {
        self.put(key, StoredValue::U8(value))
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.put(key, StoredValue::Bool(value))
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put(key, StoredValue::Str(value.to_string()))
    }

    fn remove(&mut self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.store.lock()?;
        let existed = entries
            .remove(&(self.namespace.clone(), key.to_string()))
            .is_some();
        self.store.writes.fetch_add(1, Ordering::SeqCst);
        Ok(existed)
    }
}
