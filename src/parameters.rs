//! Secret parameter store contract and its caching wrapper.

use crate::{config::Config, error::Result};

use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use std::{
    collections::HashMap,
    fmt,
    sync::LazyLock,
    time::{Duration, Instant},
};

/// Stored secret. Strings that hold JSON are returned decoded.
pub type SecretValue = serde_json::Value;

static NOT_ALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9/_.-]").expect("valid regex"));

/// Parameter type on the store.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ParameterType {
    /// Plain text.
    String,
    /// Comma separated text.
    StringList,
    /// Encrypted text.
    #[default]
    SecureString,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::String => "String",
            Self::StringList => "StringList",
            Self::SecureString => "SecureString",
        })
    }
}

/// Replaces every character the store rejects with `-`.
pub fn allowed_name(name: &str) -> String {
    NOT_ALLOWED.replace_all(name, "-").into_owned()
}

/// Store friendly name, optionally prefixed and suffixed with the current UTC time.
pub fn safe_name(name: &str, prefix: Option<&str>, dated: bool) -> String {
    let mut name = match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}.{name}"),
        _ => name.to_string(),
    };
    if dated {
        name = format!("{name}.{}", Utc::now().format("%m.%d.%Y.%H.%M.%S"));
    }
    allowed_name(&name)
}

/// Secret storage.
pub trait ParameterStore: Send + Sync {
    /// Value of a parameter, `None` when it does not exist.
    fn get_parameter(&self, name: &str) -> Result<Option<SecretValue>>;

    /// Creates or overwrites a parameter and returns the name it was stored under.
    fn put_parameter(
        &self,
        name: &str,
        value: &SecretValue,
        parameter_type: ParameterType,
    ) -> Result<String>;

    /// Deletes a parameter. Returns whether it existed.
    fn delete_parameter(&self, name: &str) -> Result<bool>;
}

/// Process-local store for development and tests. Values are not encrypted.
#[derive(Debug, Default)]
pub struct MemoryParameterStore {
    values: Mutex<HashMap<String, SecretValue>>,
}

impl MemoryParameterStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParameterStore for MemoryParameterStore {
    fn get_parameter(&self, name: &str) -> Result<Option<SecretValue>> {
        Ok(self.values.lock().get(name).cloned())
    }

    fn put_parameter(
        &self,
        name: &str,
        value: &SecretValue,
        _parameter_type: ParameterType,
    ) -> Result<String> {
        self.values.lock().insert(name.to_string(), value.clone());
        Ok(name.to_string())
    }

    fn delete_parameter(&self, name: &str) -> Result<bool> {
        Ok(self.values.lock().remove(name).is_some())
    }
}

struct Entry {
    value: SecretValue,
    stored_at: Instant,
    sequence: u64,
}

#[derive(Default)]
struct Cache {
    entries: HashMap<String, Entry>,
    next_sequence: u64,
}

/// Wrapper keeping recently read parameters for a fixed time.
///
/// Only present values are cached. Writes through the wrapper refresh the cache and deletes
/// evict it.
pub struct CachedParameterStore<S> {
    inner: S,
    ttl: Duration,
    capacity: usize,
    cache: Mutex<Cache>,
}

impl<S: ParameterStore> CachedParameterStore<S> {
    /// Default number of cached parameters.
    pub const DEFAULT_CAPACITY: usize = 50;

    /// Wraps a store with an explicit lifetime.
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            capacity: Self::DEFAULT_CAPACITY,
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Wraps a store with the lifetime configured by `MODULAR_SDK_INNER_CACHE_TTL_SECONDS`.
    pub fn from_config(inner: S, config: &Config) -> Self {
        Self::new(inner, config.inner_cache_ttl())
    }

    /// Maximum number of cached parameters.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn remember(&self, name: &str, value: SecretValue) {
        let mut cache = self.cache.lock();
        let Cache {
            entries,
            next_sequence,
        } = &mut *cache;
        if !entries.contains_key(name) && entries.len() >= self.capacity {
            let ttl = self.ttl;
            entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.sequence)
                    .map(|(name, _)| name.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            name.to_string(),
            Entry {
                value,
                stored_at: Instant::now(),
                sequence: *next_sequence,
            },
        );
        *next_sequence += 1;
    }
}

impl<S: ParameterStore> ParameterStore for CachedParameterStore<S> {
    fn get_parameter(&self, name: &str) -> Result<Option<SecretValue>> {
        {
            let mut cache = self.cache.lock();
            match cache.entries.get(name) {
                Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                    return Ok(Some(entry.value.clone()));
                }
                Some(_) => {
                    cache.entries.remove(name);
                }
                None => {}
            }
        }
        let value = self.inner.get_parameter(name)?;
        if let Some(value) = &value {
            self.remember(name, value.clone());
        }
        Ok(value)
    }

    fn put_parameter(
        &self,
        name: &str,
        value: &SecretValue,
        parameter_type: ParameterType,
    ) -> Result<String> {
        let stored = self.inner.put_parameter(name, value, parameter_type)?;
        self.remember(&stored, value.clone());
        Ok(stored)
    }

    fn delete_parameter(&self, name: &str) -> Result<bool> {
        self.cache.lock().entries.remove(name);
        self.inner.delete_parameter(name)
    }
}

impl<S: fmt::Debug> fmt::Debug for CachedParameterStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedParameterStore")
            .field("inner", &self.inner)
            .field("ttl", &self.ttl)
            .field("cached", &self.cache.lock().entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingStore {
        store: MemoryParameterStore,
        reads: AtomicUsize,
    }

    impl ParameterStore for CountingStore {
        fn get_parameter(&self, name: &str) -> Result<Option<SecretValue>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.store.get_parameter(name)
        }

        fn put_parameter(
            &self,
            name: &str,
            value: &SecretValue,
            parameter_type: ParameterType,
        ) -> Result<String> {
            self.store.put_parameter(name, value, parameter_type)
        }

        fn delete_parameter(&self, name: &str) -> Result<bool> {
            self.store.delete_parameter(name)
        }
    }

    impl CountingStore {
        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[rstest]
    #[case::kept("a/b_c.d-e", "a/b_c.d-e")]
    #[case::replaced("tenant name:1", "tenant-name-1")]
    fn test_allowed_name(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(allowed_name(name), expected);
    }

    #[test]
    fn test_safe_name() {
        assert_eq!(safe_name("key", Some("caas"), false), "caas.key");
        let dated = safe_name("key", None, true);
        assert!(dated.starts_with("key."));
        assert_eq!(dated.split('.').count(), 7);
    }

    #[test]
    fn test_reads_are_cached() {
        let store = CachedParameterStore::new(CountingStore::default(), Duration::from_secs(60));
        store.inner().store.put_parameter("a", &json!({"k": 1}), ParameterType::SecureString).unwrap();

        assert_eq!(store.get_parameter("a").unwrap(), Some(json!({"k": 1})));
        assert_eq!(store.get_parameter("a").unwrap(), Some(json!({"k": 1})));
        assert_eq!(store.inner().reads(), 1);
    }

    #[test]
    fn test_missing_values_are_not_cached() {
        let store = CachedParameterStore::new(CountingStore::default(), Duration::from_secs(60));
        assert_eq!(store.get_parameter("a").unwrap(), None);
        assert_eq!(store.get_parameter("a").unwrap(), None);
        assert_eq!(store.inner().reads(), 2);
    }

    #[test]
    fn test_expired_values_are_read_again() {
        let store = CachedParameterStore::new(CountingStore::default(), Duration::ZERO);
        store.put_parameter("a", &json!("v"), ParameterType::String).unwrap();
        assert_eq!(store.get_parameter("a").unwrap(), Some(json!("v")));
        assert_eq!(store.inner().reads(), 1);
    }

    #[test]
    fn test_writes_refresh_and_deletes_evict() {
        let store = CachedParameterStore::new(CountingStore::default(), Duration::from_secs(60));
        assert_eq!(
            store.put_parameter("a", &json!("v"), ParameterType::default()).unwrap(),
            "a"
        );
        assert_eq!(store.get_parameter("a").unwrap(), Some(json!("v")));
        assert_eq!(store.inner().reads(), 0);

        assert!(store.delete_parameter("a").unwrap());
        assert!(!store.delete_parameter("a").unwrap());
        assert_eq!(store.get_parameter("a").unwrap(), None);
        assert_eq!(store.inner().reads(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let store = CachedParameterStore::new(CountingStore::default(), Duration::from_secs(60))
            .with_capacity(2);
        for name in ["a", "b", "c"] {
            store.put_parameter(name, &json!(name), ParameterType::String).unwrap();
        }
        assert_eq!(store.get_parameter("c").unwrap(), Some(json!("c")));
        assert_eq!(store.inner().reads(), 0);
        assert_eq!(store.get_parameter("a").unwrap(), Some(json!("a")));
        assert_eq!(store.inner().reads(), 1);
    }
}
