//! In-process [`KeyValueStore`] used by tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{KeyValueStore, TrackerError};

#[derive(Debug, Default)]
struct State {
    sets: BTreeMap<String, BTreeSet<String>>,
    hashes: BTreeMap<String, BTreeMap<String, String>>,
    strings: BTreeMap<String, String>,
    failing: BTreeSet<String>,
}

/// A thread-safe in-memory stand-in for Redis.
///
/// Commands can be made to fail with [`MemoryKeyValueStore::fail_command`]
/// (by upper-case name: `SMEMBERS`, `HMGET`, `GET`, `SET`, `DEL`).
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    state: Mutex<State>,
}

impl MemoryKeyValueStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `SADD key member...`.
    pub fn add_members<I, S>(&self, key: &str, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .extend(members.into_iter().map(Into::into));
    }

    /// `HSET key field value`.
    pub fn set_hash_field(&self, key: &str, field: &str, value: impl Into<String>) {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
    }

    /// `SET key value` without going through the async trait.
    pub fn set_string(&self, key: &str, value: impl Into<String>) {
        self.lock().strings.insert(key.to_string(), value.into());
    }

    /// Makes every subsequent `command` fail.
    pub fn fail_command(&self, command: &str) {
        self.lock().failing.insert(command.to_string());
    }

    /// Returns `true` if `key` exists as any type.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        let state = self.lock();
        state.sets.contains_key(key) || state.hashes.contains_key(key) || state.strings.contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, command: &str, key: &str) -> Result<(), TrackerError> {
        if self.lock().failing.contains(command) {
            return Err(TrackerError::Command {
                command: format!("{command} {key}"),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn members_of(&self, key: &str) -> Result<Vec<String>, TrackerError> {
        self.check("SMEMBERS", key)?;
        Ok(self
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hash_fields_of(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<String>>, TrackerError> {
        self.check("HMGET", key)?;
        let state = self.lock();
        let hash = state.hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| hash.and_then(|h| h.get(*f).cloned()))
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, TrackerError> {
        self.check("GET", key)?;
        Ok(self.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), TrackerError> {
        self.check("SET", key)?;
        self.set_string(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, TrackerError> {
        self.check("DEL", key)?;
        let mut state = self.lock();
        let removed = state.sets.remove(key).is_some()
            | state.hashes.remove(key).is_some()
            | state.strings.remove(key).is_some();
        drop(state);
        Ok(removed)
    }
}
