// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-level configuration: the `clap::Parser` struct for
//! command-line/environment settings, plus the `ConfigSource` contract
//! the broker's runtime config object (the thing `config.reload`
//! re-reads) is read from.
//!
//! Grounded on the teacher's `config.rs` (`clap::Parser` with
//! `env = "COOP_..."` fallbacks, a `validate()` pass run once after
//! parsing) and `examples/artemonad-QuiverDB/follower/src/main.rs`'s
//! `toml::from_str` + `anyhow::Context` config-loading idiom.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

/// Per-node broker process settings.
#[derive(Debug, Parser)]
#[command(name = "flux-broker", version, about)]
pub struct BrokerConfig {
    /// This node's rank in the overlay.
    #[arg(long, env = "FLUX_BROKER_RANK", default_value = "0")]
    pub rank: u32,

    /// Total number of ranks in the overlay.
    #[arg(long, env = "FLUX_BROKER_SIZE", default_value = "1")]
    pub size: u32,

    /// Unix socket path local clients connect to.
    #[arg(long, env = "FLUX_BROKER_SOCKET", default_value = "/tmp/flux-broker.sock")]
    pub socket: PathBuf,

    /// Directory searched for hosted modules.
    #[arg(long, env = "FLUX_BROKER_MODULE_PATH")]
    pub module_path: Option<PathBuf>,

    /// Path to the broker's initial TOML runtime config.
    #[arg(long, env = "FLUX_BROKER_CONF")]
    pub conf_path: Option<PathBuf>,

    /// `hello.timeout`: seconds to wait for hwm descendants before
    /// forwarding a partial idset upstream.
    #[arg(long, env = "FLUX_HELLO_TIMEOUT", default_value = "10.0")]
    pub hello_timeout: f64,

    /// Log format (json or text).
    #[arg(long, env = "FLUX_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "FLUX_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl BrokerConfig {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rank >= self.size {
            anyhow::bail!("--rank ({}) must be less than --size ({})", self.rank, self.size);
        }
        if self.hello_timeout <= 0.0 {
            anyhow::bail!("--hello-timeout must be positive");
        }
        Ok(())
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }
}

/// Initialize tracing/logging from config. Uses `try_init` so it is
/// safe to call more than once (e.g. from tests).
pub fn init_tracing(config: &BrokerConfig) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Source of the broker's runtime config object, re-read on
/// `config.reload`.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> anyhow::Result<serde_json::Value>;
}

/// Reads a TOML file into a transport-agnostic `serde_json::Value`.
pub struct TomlConfigSource {
    path: PathBuf,
}

impl TomlConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for TomlConfigSource {
    fn load(&self) -> anyhow::Result<serde_json::Value> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading config {}", self.path.display()))?;
        let value: serde_json::Value = toml::from_str(&raw)
            .with_context(|| format!("parsing config {}", self.path.display()))?;
        Ok(value)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
