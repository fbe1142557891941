//! Wire envelope shapes and outbound construction.
//!
//! Both directions speak compact JSON objects: `{t, d?}` outbound and
//! `{t?, d?, v?}` inbound. Transport-level annotations (ack id, lag hint,
//! timing hint) are injected here, into a payload the transport owns by
//! value, so caller data is never aliased or mutated in place.

use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound wire envelope.
///
/// `v`, when present, is the server-assigned strictly increasing sequence
/// number for events that must be applied in order exactly once.
#[non_exhaustive]
#[derive(Debug, Clone, Deserialize)]
pub struct Inbound {
    /// Message type; absent on version-only frames
    #[serde(default)]
    pub t: Option<String>,
    /// Payload
    #[serde(default)]
    pub d: Option<Value>,
    /// Sequence number
    #[serde(default)]
    pub v: Option<u64>,
}

/// Outbound wire envelope.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize)]
pub struct Outbound {
    /// Message type
    pub t: String,
    /// Payload, with any transport-injected annotations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
}

impl Outbound {
    #[must_use]
    pub fn new(msg_type: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            t: msg_type.into(),
            d: data,
        }
    }
}

/// Per-send options.
///
/// Callers must not pre-populate the annotation fields (`a`, `l`, `s`) in
/// their payload; the transport injects them when the matching option is
/// set.
#[non_exhaustive]
#[derive(Debug, Clone, Default, Builder)]
pub struct SendOptions {
    /// Register with the acknowledgement ledger and retry until acked
    #[builder(default)]
    pub ackable: bool,
    /// Inject the current smoothed lag as `d.l` (rounded milliseconds)
    #[builder(default)]
    pub with_lag: bool,
    /// Inject `d.s`, a base-36 encoding of `millis / 10`
    pub millis: Option<f64>,
    /// Drop instead of queueing when no socket is open (fire-and-forget)
    #[builder(default)]
    pub no_retry: bool,
    /// Authorization token; the send is dropped unless it matches the
    /// transport's current token
    pub sign: Option<String>,
}

/// Inject the lag annotation into a payload, creating the object if needed.
pub(crate) fn annotate_lag(data: &mut Option<Value>, average_lag_ms: f64) {
    let obj = ensure_object(data);
    obj.insert("l".to_owned(), Value::from(average_lag_ms.round() as u64));
}

/// Inject the timing hint: `round(millis * 0.1)` in base 36.
pub(crate) fn annotate_timing(data: &mut Option<Value>, millis: f64) {
    let obj = ensure_object(data);
    let scaled = (millis * 0.1).round().max(0.0) as u64;
    obj.insert("s".to_owned(), Value::from(to_base36(scaled)));
}

pub(crate) fn ensure_object(data: &mut Option<Value>) -> &mut serde_json::Map<String, Value> {
    if !matches!(data, Some(Value::Object(_))) {
        *data = Some(Value::Object(serde_json::Map::new()));
    }
    match data {
        Some(Value::Object(obj)) => obj,
        _ => unreachable!("data was just set to an object"),
    }
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_owned();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
