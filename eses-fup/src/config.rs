// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

use crate::error::ConfigError;
use crate::fup_info::FwTargetKind;
use eses_messages::MAX_TUNNEL_CHUNK_SIZE;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Tunables for a tunneled firmware upgrade.
///
/// All durations are (de)serialized as integer milliseconds. Any field absent
/// from a config file takes its default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelFupConfig {
    /// Number of consecutive failures of a single tunneled command tolerated
    /// before the peer is reset.
    pub max_failure_retry_count: u32,

    /// Number of consecutive busy responses to a single tunneled command
    /// tolerated before the peer is reset.
    pub max_busy_retry_count: u32,

    /// Time since a tunneled command was first issued after which the peer is
    /// presumed hung, regardless of remaining retries.
    #[serde(with = "millis")]
    pub tunnel_cmd_time_limit: Duration,

    /// How long a peer LCC takes to come back after a power cycle.
    #[serde(with = "millis")]
    pub lcc_reset_time: Duration,

    /// Poll interval while waiting for the peer to come back from a reset.
    #[serde(with = "millis")]
    pub peer_reset_poll_time: Duration,

    /// Poll interval while waiting for an activated revision to appear.
    #[serde(with = "millis")]
    pub check_rev_poll_time: Duration,

    /// Number of consecutive empty chunk completions tolerated before the
    /// transfer is considered stalled.
    pub max_zero_byte_chunks: u32,

    /// Largest image chunk sent per download control page.
    pub max_chunk_size: u32,

    #[serde(with = "millis")]
    pub dl_log_interval: Duration,

    #[serde(with = "millis")]
    pub lcc_activation_log_interval: Duration,

    #[serde(with = "millis")]
    pub ps_activation_log_interval: Duration,

    /// Activation limit for LCC targets (activate plus reset).
    #[serde(with = "millis")]
    pub lcc_activate_time_limit: Duration,

    /// Activation limit for power supply, cooling and SPS targets.
    #[serde(with = "millis")]
    pub ps_activate_time_limit: Duration,
}

impl Default for TunnelFupConfig {
    fn default() -> Self {
        Self {
            max_failure_retry_count: 5,
            max_busy_retry_count: 5,
            tunnel_cmd_time_limit: Duration::from_millis(10_000),
            lcc_reset_time: Duration::from_millis(45_000),
            peer_reset_poll_time: Duration::from_millis(1_000),
            check_rev_poll_time: Duration::from_millis(3_000),
            max_zero_byte_chunks: 3,
            max_chunk_size: MAX_TUNNEL_CHUNK_SIZE,
            dl_log_interval: Duration::from_millis(60_000),
            lcc_activation_log_interval: Duration::from_millis(5_000),
            ps_activation_log_interval: Duration::from_millis(60_000),
            lcc_activate_time_limit: Duration::from_millis(70_000),
            ps_activate_time_limit: Duration::from_millis(300_000),
        }
    }
}

impl TunnelFupConfig {
    /// Load and validate a config file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            ConfigError::Io { path: path.to_owned(), err }
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|err| {
            ConfigError::Parse { path: path.to_owned(), err }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values a download control page constrains. Every chunk but
    /// the last is `max_chunk_size` bytes, so it must fit the page and keep
    /// later buffer offsets 8-byte aligned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let size = self.max_chunk_size;
        if size == 0 || size > MAX_TUNNEL_CHUNK_SIZE || size % 8 != 0 {
            return Err(ConfigError::InvalidChunkSize {
                size,
                max: MAX_TUNNEL_CHUNK_SIZE,
            });
        }
        Ok(())
    }

    pub fn activate_time_limit(&self, kind: FwTargetKind) -> Duration {
        if kind.is_lcc() {
            self.lcc_activate_time_limit
        } else {
            self.ps_activate_time_limit
        }
    }

    pub fn activation_log_interval(&self, kind: FwTargetKind) -> Duration {
        if kind == FwTargetKind::PowerSupply {
            self.ps_activation_log_interval
        } else {
            self.lcc_activation_log_interval
        }
    }
}

mod millis {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(
        d: &Duration,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        s.serialize_u64(ms)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
