//! Configuration for bulksend
//!
//! All durations serialize as whole seconds, so a JSON/TOML config reads
//! naturally (`"base_delay": 2`). Every field has a default; an empty config
//! document yields a working engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the engine
///
/// Split into sub-configs by concern:
/// - [`dispatch`](DispatchConfig) -- per-message attempts and timeouts
/// - [`reconnect`](ReconnectConfig) -- backoff policy for broken connections
/// - [`registry`](RegistryConfig) -- terminal-task retention
///
/// The sub-configs are serde-flattened, so a config document stays one flat
/// object on the wire.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Delivery behavior settings (attempts, timeouts)
    #[serde(flatten)]
    pub dispatch: DispatchConfig,

    /// Reconnect backoff policy
    #[serde(flatten)]
    pub reconnect: ReconnectConfig,

    /// Task retention settings
    #[serde(flatten)]
    pub registry: RegistryConfig,
}

/// Delivery behavior for individual messages
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Local attempts per message before it is counted failed (default: 3)
    #[serde(default = "default_send_attempts")]
    pub max_send_attempts: u32,

    /// Upper bound on a single send call (default: 30 seconds)
    #[serde(default = "default_send_timeout", with = "duration_serde")]
    pub send_timeout: Duration,

    /// How long one delivery attempt waits for the connection to recover
    /// before the attempt is counted (default: 90 seconds)
    #[serde(default = "default_recovery_wait", with = "duration_serde")]
    pub recovery_wait: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_send_attempts: 3,
            send_timeout: Duration::from_secs(30),
            recovery_wait: Duration::from_secs(90),
        }
    }
}

/// Backoff policy applied when a connection breaks
///
/// The delay schedule is deterministic doubling: `base_delay * 2^attempt`,
/// capped at `max_delay`. After `max_attempts` consecutive failures the
/// supervisor gives up and every task blocked on the connection fails.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt (default: 2 seconds)
    #[serde(default = "default_base_delay", with = "duration_serde")]
    pub base_delay: Duration,

    /// Cap on the doubled delay (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Consecutive failed attempts before giving up (default: 10)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound on a single connect attempt (default: 60 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            connect_timeout: Duration::from_secs(60),
        }
    }
}

/// Retention of finished tasks in the in-memory registry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// How long a terminal task stays queryable (default: 30 minutes)
    #[serde(default = "default_retention", with = "duration_serde")]
    pub retention: Duration,

    /// How often the eviction sweep runs (default: 60 seconds)
    #[serde(default = "default_sweep_interval", with = "duration_serde")]
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

fn default_send_attempts() -> u32 {
    3
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_recovery_wait() -> Duration {
    Duration::from_secs(90)
}

fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_max_attempts() -> u32 {
    10
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_retention() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

// Duration serialization helper - serializes as seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
