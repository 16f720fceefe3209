//! # Bridge Builder
//!
//! Fluent setup for a bridge: configuration, symbol allowlist, pools and the
//! transports of their workers.

use tracing::info;

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::error::Error;
use crate::error::Result;
use crate::transport::Transport;

/// Fluent builder for a `Bridge`.
pub struct BridgeBuilder {
    config: BridgeConfig,
    pools: Vec<String>,
    workers: Vec<(String, Box<dyn Transport>)>,
}

impl BridgeBuilder {
    pub fn new() -> Self {
        Self {
            config: BridgeConfig::default(),
            pools: Vec::new(),
            workers: Vec::new(),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Adjusts the configuration in place.
    pub fn configure(mut self, f: impl FnOnce(&mut BridgeConfig)) -> Self {
        f(&mut self.config);
        self
    }

    /// Allows a symbol name to decode as `Value::Symbol`.
    pub fn symbol(mut self, name: impl Into<String>) -> Self {
        self.config.symbols.push(name.into());
        self
    }

    /// Declares a pool, even if no worker is added to it yet.
    pub fn pool(mut self, name: impl Into<String>) -> Self {
        self.pools.push(name.into());
        self
    }

    /// Adds a worker to the default pool.
    pub fn worker(self, transport: impl Transport) -> Self {
        let pool = self.config.default_pool.clone();
        self.pool_worker(pool, transport)
    }

    pub fn pool_worker(mut self, pool: impl Into<String>, transport: impl Transport) -> Self {
        self.workers.push((pool.into(), Box::new(transport)));
        self
    }

    /// Builds the bridge and connects every worker.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Bridge> {
        validate(&self.config)?;

        let bridge = Bridge::from_config(self.config);
        bridge.add_pool(&bridge.config().default_pool.clone());
        for pool in &self.pools {
            bridge.add_pool(pool);
        }

        let count = self.workers.len();
        for (pool, transport) in self.workers {
            bridge.add_worker(&pool, transport);
        }

        info!(workers = count, default_pool = %bridge.config().default_pool, "bridge ready");
        Ok(bridge)
    }
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(config: &BridgeConfig) -> Result<()> {
    if config.default_timeout_ms == 0 {
        return Err(Error::Config("default_timeout_ms must be positive".into()));
    }
    if config.callback_timeout_ms == 0 {
        return Err(Error::Config("callback_timeout_ms must be positive".into()));
    }
    if let Some((name, _)) = config.timeout_profiles.iter().find(|(_, ms)| **ms == 0) {
        return Err(Error::Config(format!("timeout profile '{}' must be positive", name)));
    }
    if config.default_pool.is_empty() {
        return Err(Error::Config("default_pool must not be empty".into()));
    }
    Ok(())
}
