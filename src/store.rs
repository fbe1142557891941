//! Generic key/value persistence primitive.
//!
//! The transport persists two small values: the sticky endpoint choice and
//! the user's ping-interval override. Both go through this narrow trait so
//! hosts can back them with whatever storage survives a process restart.

use dashmap::DashMap;

/// String key/value persistence used for sticky state.
///
/// Implementations must be cheap to call from the transport's event loop;
/// no method is allowed to block on I/O for long.
pub trait KvStore: Send + Sync + 'static {
    /// Fetch the value for `key`, if any.
    fn get(&self, key: &str) -> Option<String>;
    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str);
    /// Remove `key` if present.
    fn remove(&self, key: &str);
}

/// In-memory [`KvStore`] backed by a [`DashMap`].
///
/// Suitable for tests and for hosts that do not need persistence across
/// restarts. Values live for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.insert(key.to_owned(), value.to_owned());
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}
