use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::RpcError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default, rename = "rpc")]
    pub rpcs: Vec<RpcDefinition>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Consumer tasks per request queue unless overridden per RPC.
    pub consumers: usize,
    pub slow_call_threshold_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { consumers: 4, slow_call_threshold_ms: 1_000 }
    }
}

impl ServerConfig {
    pub fn slow_call_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_threshold_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long one SYNC attempt waits for its reply.
    pub reply_timeout_ms: u64,
    /// Total SYNC attempts, and publish attempts for ASYNC sends.
    pub max_attempts: u32,
    pub retry_interval_ms: u64,
    pub slow_call_threshold_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 5_000,
            max_attempts: 3,
            retry_interval_ms: 100,
            slow_call_threshold_ms: 1_000,
        }
    }
}

impl ClientConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn slow_call_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_threshold_ms)
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.reply_timeout_ms == 0 {
            return Err(RpcError::config("client.reply_timeout_ms must be positive"));
        }
        if self.max_attempts == 0 {
            return Err(RpcError::config("client.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Per-RPC overrides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcDefinition {
    pub name: String,
    /// Message TTL of the SYNC request queue.
    pub ttl_ms: Option<u64>,
    pub consumers: Option<usize>,
}

impl RpcConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.server.consumers == 0 {
            return Err(RpcError::config("server.consumers must be at least 1"));
        }
        self.client.validate()?;

        let mut names = HashSet::new();
        for rpc in &self.rpcs {
            if rpc.name.trim().is_empty() {
                return Err(RpcError::config("rpc.name must not be blank"));
            }
            if !names.insert(rpc.name.as_str()) {
                return Err(RpcError::config(format!("rpc {} is defined twice", rpc.name)));
            }
            if rpc.consumers == Some(0) {
                return Err(RpcError::config(format!(
                    "rpc {}: consumers must be at least 1",
                    rpc.name
                )));
            }
        }
        Ok(())
    }

    pub fn definition(&self, rpc_name: &str) -> Option<&RpcDefinition> {
        self.rpcs.iter().find(|rpc| rpc.name == rpc_name)
    }

    pub fn consumers_for(&self, rpc_name: &str) -> usize {
        self.definition(rpc_name).and_then(|rpc| rpc.consumers).unwrap_or(self.server.consumers)
    }

    pub fn ttl_for(&self, rpc_name: &str) -> Option<Duration> {
        self.definition(rpc_name).and_then(|rpc| rpc.ttl_ms).map(Duration::from_millis)
    }
}
