//! Centralized Configuration Management
//!
//! Timeouts are stored as integer milliseconds so the structures serialize
//! cleanly to TOML and environment variables; `Duration` accessors are provided
//! for the call sites.
//!
//! Loading is layered with figment, lowest priority first:
//! 1. Default values
//! 2. Configuration file (tessera.toml)
//! 3. Environment variables with the `TESSERA_` prefix (`__` separates levels)

use core::time::Duration;
use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TesseraError};

// ----------------------------------------------------------------------------
// Coordinator Configuration
// ----------------------------------------------------------------------------

/// Configuration for the join-party protocols
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Upper bound on one join-party attempt
    pub join_party_timeout_ms: u64,
    /// Extra time a member waits for the leader's decision on top of the join timeout
    pub member_grace_ms: u64,
    /// Lower bound of the random delay before a member first contacts the leader
    pub jitter_min_ms: u64,
    /// Upper bound of the random delay before a member first contacts the leader
    pub jitter_max_ms: u64,
    /// Interval between member retries towards the leader
    pub leader_retry_interval_ms: u64,
    /// Interval between leaderless re-broadcasts
    pub broadcast_interval_ms: u64,
    /// How long session teardown waits for a channel receiver before giving up
    pub drain_grace_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            join_party_timeout_ms: 10_000,
            member_grace_ms: 5_000,
            jitter_min_ms: 300,
            jitter_max_ms: 2_000,
            leader_retry_interval_ms: 500,
            broadcast_interval_ms: 1_000,
            drain_grace_ms: 1_000,
        }
    }
}

impl CoordinatorConfig {
    /// Short timeouts for in-memory tests
    pub fn testing() -> Self {
        Self {
            join_party_timeout_ms: 2_000,
            member_grace_ms: 1_000,
            jitter_min_ms: 0,
            jitter_max_ms: 50,
            leader_retry_interval_ms: 50,
            broadcast_interval_ms: 100,
            drain_grace_ms: 100,
        }
    }

    pub fn join_party_timeout(&self) -> Duration {
        Duration::from_millis(self.join_party_timeout_ms)
    }

    pub fn member_grace(&self) -> Duration {
        Duration::from_millis(self.member_grace_ms)
    }

    pub fn leader_retry_interval(&self) -> Duration {
        Duration::from_millis(self.leader_retry_interval_ms)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    /// Draw one member jitter from `[jitter_min, jitter_max]`
    pub fn draw_jitter(&self) -> Duration {
        let max = self.jitter_max_ms.max(self.jitter_min_ms);
        Duration::from_millis(fastrand::u64(self.jitter_min_ms..=max))
    }
}

// ----------------------------------------------------------------------------
// Stream Configuration
// ----------------------------------------------------------------------------

/// Configuration for transport stream deadlines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Deadline for opening an outbound stream
    pub open_timeout_ms: u64,
    /// Deadline for a single framed read
    pub read_timeout_ms: u64,
    /// Deadline for a single framed write
    pub write_timeout_ms: u64,
    /// Deadline for a member waiting on the leader's decision
    pub leader_response_timeout_ms: u64,
    /// Disable per-operation deadlines for simulated transports
    pub apply_deadline: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: 4_000,
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            leader_response_timeout_ms: 20 * 60 * 1_000,
            apply_deadline: true,
        }
    }
}

impl StreamConfig {
    /// Deadlines off, as used with the in-memory harness
    pub fn testing() -> Self {
        Self {
            apply_deadline: false,
            ..Self::default()
        }
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn leader_response_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_response_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Keysign Configuration
// ----------------------------------------------------------------------------

/// Configuration for signing requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignConfig {
    /// Upper bound on the wait for an externally produced signature
    pub keysign_timeout_ms: u64,
    /// Buffer size of per-topic message subscriptions
    pub subscription_buffer: usize,
}

impl Default for KeysignConfig {
    fn default() -> Self {
        Self {
            keysign_timeout_ms: 60_000,
            subscription_buffer: 32,
        }
    }
}

impl KeysignConfig {
    pub fn testing() -> Self {
        Self {
            keysign_timeout_ms: 5_000,
            subscription_buffer: 32,
        }
    }

    pub fn keysign_timeout(&self) -> Duration {
        Duration::from_millis(self.keysign_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Unified Configuration
// ----------------------------------------------------------------------------

/// Top-level configuration for a Tessera node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TesseraConfig {
    pub coordinator: CoordinatorConfig,
    pub streams: StreamConfig,
    pub keysign: KeysignConfig,
}

impl TesseraConfig {
    /// Configuration tuned for in-memory tests
    pub fn testing() -> Self {
        Self {
            coordinator: CoordinatorConfig::testing(),
            streams: StreamConfig::testing(),
            keysign: KeysignConfig::testing(),
        }
    }

    /// Load configuration from `tessera.toml` and `TESSERA_` environment variables
    pub fn load() -> Result<Self> {
        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file("tessera.toml"))
                .merge(Env::prefixed("TESSERA_").split("__")),
        )
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(path.as_ref())),
        )
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: TesseraConfig = figment
            .extract()
            .map_err(|e| TesseraError::config_error(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.coordinator.join_party_timeout_ms == 0 {
            return Err(TesseraError::config_error("Join party timeout cannot be zero"));
        }
        if self.coordinator.jitter_min_ms > self.coordinator.jitter_max_ms {
            return Err(TesseraError::config_error(
                "Jitter minimum cannot be greater than jitter maximum",
            ));
        }
        if self.coordinator.jitter_max_ms >= self.coordinator.join_party_timeout_ms {
            return Err(TesseraError::config_error(
                "Jitter maximum must be shorter than the join party timeout",
            ));
        }
        if self.coordinator.leader_retry_interval_ms == 0 {
            return Err(TesseraError::config_error("Leader retry interval cannot be zero"));
        }
        if self.coordinator.broadcast_interval_ms == 0 {
            return Err(TesseraError::config_error("Broadcast interval cannot be zero"));
        }
        if self.streams.apply_deadline
            && (self.streams.read_timeout_ms == 0 || self.streams.write_timeout_ms == 0)
        {
            return Err(TesseraError::config_error(
                "Stream read and write deadlines cannot be zero",
            ));
        }
        if self.keysign.subscription_buffer == 0 {
            return Err(TesseraError::config_error("Subscription buffer cannot be zero"));
        }
        Ok(())
    }
}
