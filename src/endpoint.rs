//! Sticky endpoint selection with forced rotation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng as _;
use serde::{Deserialize, Serialize};

use crate::error::{Error, TransportError};
use crate::store::KvStore;

/// Store key for the persisted sticky choice.
pub const STICKY_ENDPOINT_KEY: &str = "socket.endpoint";

/// Persisted sticky choice with its wall-clock write time.
#[derive(Debug, Serialize, Deserialize)]
struct StickyRecord {
    url: String,
    at_ms: i64,
}

/// Chooses which of N interchangeable base URLs to dial.
///
/// The choice is sticky across reconnects and process restarts (bounded
/// TTL), rotates to the next candidate when the previous attempt is
/// suspected of failing because of a bad endpoint, and falls back to a
/// uniform random pick when no valid sticky value exists.
pub struct EndpointSelector {
    /// Immutable for the process lifetime
    candidates: Vec<String>,
    store: Arc<dyn KvStore>,
    ttl: Duration,
    force_rotate: bool,
}

impl std::fmt::Debug for EndpointSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointSelector")
            .field("candidates", &self.candidates)
            .field("ttl", &self.ttl)
            .field("force_rotate", &self.force_rotate)
            .finish_non_exhaustive()
    }
}

impl EndpointSelector {
    pub fn new(candidates: Vec<String>, store: Arc<dyn KvStore>, ttl: Duration) -> Result<Self, Error> {
        if candidates.is_empty() {
            return Err(TransportError::NoEndpoints.into());
        }
        Ok(Self {
            candidates,
            store,
            ttl,
            force_rotate: false,
        })
    }

    /// Resolve the base URL for the next dial, consuming any pending
    /// rotation request.
    pub fn choose(&mut self) -> String {
        let sticky = self.load_sticky();
        let url = match sticky {
            None => {
                let i = rand::rng().random_range(0..self.candidates.len());
                let url = self.candidates[i].clone();
                self.persist(&url);
                url
            }
            Some(current) if self.force_rotate => {
                let i = self
                    .candidates
                    .iter()
                    .position(|u| *u == current)
                    .unwrap_or(0);
                let url = self.candidates[(i + 1) % self.candidates.len()].clone();
                self.persist(&url);
                url
            }
            Some(current) => current,
        };
        self.force_rotate = false;
        url
    }

    /// Mark the current sticky endpoint as suspect; the next [`choose`]
    /// rotates past it.
    ///
    /// [`choose`]: Self::choose
    pub fn mark_suspect(&mut self) {
        self.force_rotate = true;
    }

    fn load_sticky(&self) -> Option<String> {
        let raw = self.store.get(STICKY_ENDPOINT_KEY)?;
        let record: StickyRecord = serde_json::from_str(&raw).ok()?;

        let age_ms = Utc::now().timestamp_millis().saturating_sub(record.at_ms);
        if age_ms < 0 || age_ms as u128 > self.ttl.as_millis() {
            return None;
        }
        self.candidates.contains(&record.url).then_some(record.url)
    }

    fn persist(&self, url: &str) {
        let record = StickyRecord {
            url: url.to_owned(),
            at_ms: Utc::now().timestamp_millis(),
        };
        if let Ok(json) = serde_json::to_string(&record) {
            self.store.set(STICKY_ENDPOINT_KEY, &json);
        }
    }
}
