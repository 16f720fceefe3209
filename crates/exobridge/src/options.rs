//! Per-call options, merged over the bridge configuration.

use std::time::Duration;

use crate::router::Affinity;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallOptions {
    /// Overrides both the profile and the default timeout.
    pub timeout: Option<Duration>,
    /// Named timeout from `BridgeConfig::timeout_profiles`.
    pub timeout_profile: Option<String>,
    /// Overrides the session's affinity mode for this call only.
    pub affinity: Option<Affinity>,
    pub pool_name: Option<String>,
    /// Serve repeated identical calls from the response cache.
    pub idempotent: bool,
    /// Run in this session instead of the caller's own.
    ///
    /// An id that names no live session opens one. Like an implicit session
    /// it is released once every clone of the calling context is dropped;
    /// other contexts naming the same id later only join it.
    pub session_id: Option<String>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_profile(mut self, profile: impl Into<String>) -> Self {
        self.timeout_profile = Some(profile.into());
        self
    }

    pub fn affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = Some(affinity);
        self
    }

    pub fn pool(mut self, pool_name: impl Into<String>) -> Self {
        self.pool_name = Some(pool_name.into());
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}
