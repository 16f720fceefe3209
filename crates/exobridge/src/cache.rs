//! Response cache for calls marked idempotent.
//!
//! Keys are the session id plus the serialized envelope, so two calls hit the
//! same entry only if they would send byte-identical requests. Results that
//! contain refs are never cached: the objects behind them may be released.

use dashmap::DashMap;
use tagpack::Value;

use crate::frame::Envelope;

pub struct ResponseCache {
    entries: DashMap<String, (String, Value)>,
    capacity: usize,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }

    pub fn key(envelope: &Envelope) -> Option<String> {
        let body = serde_json::to_string(envelope).ok()?;
        Some(format!("{}\u{0}{}", envelope.session_id, body))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|e| e.value().1.clone())
    }

    /// Stores a result. Returns false if it was not cacheable or the cache is full.
    pub fn insert(&self, key: String, session_id: &str, value: &Value) -> bool {
        if self.entries.len() >= self.capacity || holds_refs(value) {
            return false;
        }
        self.entries.insert(key, (session_id.to_string(), value.clone()));
        true
    }

    pub fn forget_session(&self, session_id: &str) {
        self.entries.retain(|_, entry| entry.0 != session_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn holds_refs(value: &Value) -> bool {
    let mut found = false;
    value.visit(&mut |v| {
        if matches!(v, Value::Ref(_) | Value::StreamRef(_) | Value::Opaque(_)) {
            found = true;
        }
    });
    found
}
