//! # Configuration
//!
//! Process-wide defaults for the host bridge and for workers. Both load from
//! JSON and can be overridden from `EXOBRIDGE_*` environment variables:
//!
//! | variable | field |
//! |---|---|
//! | `EXOBRIDGE_DEFAULT_TIMEOUT_MS` | `default_timeout_ms` |
//! | `EXOBRIDGE_AFFINITY` | `affinity` |
//! | `EXOBRIDGE_DEFAULT_POOL` | `default_pool` |
//! | `EXOBRIDGE_SESSION_TTL_SECS` | `session_ttl_secs` |
//! | `EXOBRIDGE_MAX_REFS` | `max_refs` |
//! | `EXOBRIDGE_CALLBACK_TIMEOUT_MS` | `callback_timeout_ms` |

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tagpack::SymbolTable;

use crate::error::Error;
use crate::error::Result;
use crate::frame::SessionLimits;
use crate::options::CallOptions;
use crate::router::Affinity;

pub const DEFAULT_POOL: &str = "default";

fn default_profiles() -> HashMap<String, u64> {
    [
        ("default", 120_000),
        ("streaming", 1_800_000),
        ("ml_inference", 600_000),
        ("batch_job", 3_600_000),
    ]
    .into_iter()
    .map(|(name, ms)| (name.to_string(), ms))
    .collect()
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub default_timeout_ms: u64,
    pub timeout_profiles: HashMap<String, u64>,
    pub affinity: Affinity,
    pub default_pool: String,
    pub session_ttl_secs: u64,
    pub max_refs: usize,
    pub callback_timeout_ms: u64,
    pub cache_capacity: usize,
    /// Symbol names that decode as symbols rather than strings.
    pub symbols: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 120_000,
            timeout_profiles: default_profiles(),
            affinity: Affinity::Hint,
            default_pool: DEFAULT_POOL.to_string(),
            session_ttl_secs: 3600,
            max_refs: 1000,
            callback_timeout_ms: 30_000,
            cache_capacity: 1024,
            symbols: Vec::new(),
        }
    }
}

impl BridgeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies `EXOBRIDGE_*` overrides from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("EXOBRIDGE_DEFAULT_TIMEOUT_MS") {
            self.default_timeout_ms = parse_var("EXOBRIDGE_DEFAULT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("EXOBRIDGE_AFFINITY") {
            self.affinity = Affinity::parse(&v)
                .ok_or_else(|| Error::Config(format!("EXOBRIDGE_AFFINITY: unknown mode '{}'", v)))?;
        }
        if let Some(v) = lookup("EXOBRIDGE_DEFAULT_POOL") {
            self.default_pool = v;
        }
        if let Some(v) = lookup("EXOBRIDGE_SESSION_TTL_SECS") {
            self.session_ttl_secs = parse_var("EXOBRIDGE_SESSION_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("EXOBRIDGE_MAX_REFS") {
            self.max_refs = parse_var("EXOBRIDGE_MAX_REFS", &v)?;
        }
        if let Some(v) = lookup("EXOBRIDGE_CALLBACK_TIMEOUT_MS") {
            self.callback_timeout_ms = parse_var("EXOBRIDGE_CALLBACK_TIMEOUT_MS", &v)?;
        }
        Ok(())
    }

    /// The timeout of a call: explicit timeout, else named profile, else default.
    pub fn resolve_timeout(&self, options: &CallOptions) -> Result<Duration> {
        if let Some(timeout) = options.timeout {
            return Ok(timeout);
        }
        match &options.timeout_profile {
            Some(name) => self
                .timeout_profiles
                .get(name)
                .map(|ms| Duration::from_millis(*ms))
                .ok_or_else(|| Error::UnknownProfile(name.clone())),
            None => Ok(Duration::from_millis(self.default_timeout_ms)),
        }
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    /// Registry limits for sessions that don't set their own.
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            ttl_secs: self.session_ttl_secs,
            max_refs: self.max_refs,
        }
    }

    pub fn symbol_table(&self) -> SymbolTable {
        self.symbols.iter().cloned().collect()
    }
}

/// Worker-side settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub limits: SessionLimits,
    pub prune_interval_ms: u64,
    pub callback_timeout_ms: u64,
    pub symbols: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            limits: SessionLimits {
                ttl_secs: 3600,
                max_refs: 1000,
            },
            prune_interval_ms: 60_000,
            callback_timeout_ms: 30_000,
            symbols: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn symbol_table(&self) -> SymbolTable {
        self.symbols.iter().cloned().collect()
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{}: cannot parse '{}'", key, value)))
}
