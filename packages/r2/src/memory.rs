//! In-process [`ObjectStore`] used by tests and dry runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{ObjectStore, R2Error};

const BUCKET: &str = "memory";

/// An object held by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object bytes.
    pub body: Vec<u8>,
    /// `Content-Type` given on upload.
    pub content_type: String,
    /// `Cache-Control` given on upload.
    pub cache_control: String,
}

/// Operation to make fail in a [`MemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    /// `get` of a matching key.
    Get,
    /// `put` of a matching key.
    Put,
    /// `copy` whose destination matches.
    Copy,
    /// `list_by_prefix` of a matching prefix.
    List,
}

/// A thread-safe in-memory object store.
///
/// Failures can be injected per operation and key prefix with
/// [`MemoryStore::fail`]; injected failures are permanent (not transient).
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    failures: Mutex<Vec<(FailOn, String)>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `op` on a key starting with `prefix` fail.
    pub fn fail(&self, op: FailOn, prefix: impl Into<String>) {
        lock(&self.failures).push((op, prefix.into()));
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Returns a copy of the object at `key`, if any.
    #[must_use]
    pub fn object(&self, key: &str) -> Option<StoredObject> {
        lock(&self.objects).get(key).cloned()
    }

    /// All keys currently stored, in ascending order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.objects).is_empty()
    }

    fn should_fail(&self, op: FailOn, key: &str) -> bool {
        lock(&self.failures)
            .iter()
            .any(|(o, prefix)| *o == op && key.starts_with(prefix.as_str()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn injected() -> Box<dyn std::error::Error + Send + Sync> {
    "injected failure".into()
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, R2Error> {
        if self.should_fail(FailOn::Get, key) {
            return Err(R2Error::Download {
                bucket: BUCKET.to_string(),
                key: key.to_string(),
                transient: false,
                source: injected(),
            });
        }
        Ok(lock(&self.objects).get(key).map(|o| o.body.clone()))
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        cache_control: &str,
    ) -> Result<(), R2Error> {
        if self.should_fail(FailOn::Put, key) {
            return Err(R2Error::Upload {
                bucket: BUCKET.to_string(),
                key: key.to_string(),
                transient: false,
                source: injected(),
            });
        }
        lock(&self.objects).insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                cache_control: cache_control.to_string(),
            },
        );
        Ok(())
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<(), R2Error> {
        let copy_error = |source_err: Box<dyn std::error::Error + Send + Sync>| R2Error::Copy {
            bucket: BUCKET.to_string(),
            source_key: source.to_string(),
            destination_key: destination.to_string(),
            transient: false,
            source: source_err,
        };

        if self.should_fail(FailOn::Copy, destination) {
            return Err(copy_error(injected()));
        }

        let mut objects = lock(&self.objects);
        let object = objects
            .get(source)
            .cloned()
            .ok_or_else(|| copy_error("source object does not exist".into()))?;
        objects.insert(destination.to_string(), object);
        drop(objects);
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, R2Error> {
        if self.should_fail(FailOn::List, prefix) {
            return Err(R2Error::List {
                bucket: BUCKET.to_string(),
                prefix: prefix.to_string(),
                transient: false,
                source: injected(),
            });
        }
        Ok(lock(&self.objects)
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
