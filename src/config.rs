//! # Configuration
//!
//! Tunables for the splicing core, loaded the way the reference implementation's
//! `Config` class did: built-in defaults, then a TOML file if present, then
//! environment variables (`SPLICECORE_*`) taking final precedence.
//!
//! Unlike a line-scanned config file, this parses real TOML via `serde`, since the
//! tunable set here is wider than a single URL.

use lazy_static::lazy_static;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::sync::RwLock;

use crate::error::{Result, SpliceError};

lazy_static! {
    static ref CONFIG: RwLock<Config> = RwLock::new(Config::defaults());
}

/// Splicing-core tunables.
///
/// Every field has a default recovered from the reference implementation's
/// `Config.h`; fields not present there (e.g. `psi_reemit_interval_ms`) are the
/// specification's own suggested defaults for its open questions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Gap, in milliseconds, after which a silent primary source triggers failover
    /// to the fallback source.
    pub max_live_gap_ms: u32,
    /// Consecutive "ready" signals from the primary required before switching
    /// back to it from fallback.
    pub min_consecutive_for_switch: u32,
    /// Budget, in milliseconds, to obtain a `StreamInfo` for the primary source
    /// before it is logged as not-ready.
    pub live_idr_timeout_ms: u32,
    /// Budget, in milliseconds, to obtain a `StreamInfo` for the fallback source.
    pub fallback_idr_timeout_ms: u32,
    /// Timeout for `wait_for_audio_sync`; on expiry the anchor degrades to
    /// `audio_sync_index = idr_index`.
    pub audio_sync_timeout_ms: u32,
    /// Bound on the rolling buffer of recently ingested packets, per source.
    pub rolling_buffer_capacity: usize,
    /// Hard cap on the Reassembler's internal byte buffer.
    pub reassembler_max_buffer: usize,
    /// Number of consecutive 188-byte-spaced headers verified before declaring sync.
    pub reassembler_verify_count: usize,
    /// Cadence, in milliseconds, for re-emitting PAT/PMT inside a long live segment.
    pub psi_reemit_interval_ms: u64,
    /// Minimum video PES-with-timestamp count observed before a source counts
    /// as media-healthy.
    pub min_video_pes_for_health: u32,
    /// Minimum audio PUSI count observed before a source counts as media-healthy.
    pub min_audio_pusi_for_health: u32,
    /// Fixed reconnect backoff delay, in milliseconds.
    pub reconnect_backoff_ms: u64,
    /// Log level passed to the env_logger builder by the binary entry point.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults()
    }
}

impl Config {
    /// Built-in defaults, matching the reference implementation where it specified one.
    pub fn defaults() -> Self {
        Self {
            max_live_gap_ms: 2000,
            min_consecutive_for_switch: 10,
            live_idr_timeout_ms: 10_000,
            fallback_idr_timeout_ms: 2_000,
            audio_sync_timeout_ms: 5_000,
            rolling_buffer_capacity: 1500,
            reassembler_max_buffer: 1 << 20,
            reassembler_verify_count: 3,
            psi_reemit_interval_ms: 100,
            min_video_pes_for_health: 5,
            min_audio_pusi_for_health: 2,
            reconnect_backoff_ms: 500,
            log_level: String::from("info"),
        }
    }

    /// Loads configuration: defaults, then an optional TOML file, then
    /// `SPLICECORE_*` environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::defaults();

        if let Some(path) = path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                config = toml::from_str(&content)
                    .map_err(|e| SpliceError::Config(format!("{path:?}: {e}")))?;
            }
        }

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u32("SPLICECORE_MAX_LIVE_GAP_MS") {
            self.max_live_gap_ms = v;
        }
        if let Some(v) = env_u32("SPLICECORE_MIN_CONSECUTIVE_FOR_SWITCH") {
            self.min_consecutive_for_switch = v;
        }
        if let Some(v) = env_u32("SPLICECORE_LIVE_IDR_TIMEOUT_MS") {
            self.live_idr_timeout_ms = v;
        }
        if let Some(v) = env_u32("SPLICECORE_FALLBACK_IDR_TIMEOUT_MS") {
            self.fallback_idr_timeout_ms = v;
        }
        if let Some(v) = env_u32("SPLICECORE_AUDIO_SYNC_TIMEOUT_MS") {
            self.audio_sync_timeout_ms = v;
        }
        if let Some(v) = env_usize("SPLICECORE_ROLLING_BUFFER_CAPACITY") {
            self.rolling_buffer_capacity = v;
        }
        if let Some(v) = env_usize("SPLICECORE_REASSEMBLER_MAX_BUFFER") {
            self.reassembler_max_buffer = v;
        }
        if let Some(v) = env_usize("SPLICECORE_REASSEMBLER_VERIFY_COUNT") {
            self.reassembler_verify_count = v;
        }
        if let Some(v) = env_u64("SPLICECORE_PSI_REEMIT_INTERVAL_MS") {
            self.psi_reemit_interval_ms = v;
        }
        if let Some(v) = env_u32("SPLICECORE_MIN_VIDEO_PES_FOR_HEALTH") {
            self.min_video_pes_for_health = v;
        }
        if let Some(v) = env_u32("SPLICECORE_MIN_AUDIO_PUSI_FOR_HEALTH") {
            self.min_audio_pusi_for_health = v;
        }
        if let Some(v) = env_u64("SPLICECORE_RECONNECT_BACKOFF_MS") {
            self.reconnect_backoff_ms = v;
        }
        if let Some(v) = env::var("SPLICECORE_LOG_LEVEL").ok() {
            self.log_level = v;
        }
    }

    /// Installs this configuration as the process-wide singleton.
    pub fn install(self) {
        if let Ok(mut config) = CONFIG.write() {
            *config = self;
        }
    }
}

fn env_u32(name: &str) -> Option<u32> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Returns a clone of the currently installed configuration.
pub fn current() -> Config {
    CONFIG.read().unwrap().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_implementation() {
        let config = Config::defaults();
        assert_eq!(config.max_live_gap_ms, 2000);
        assert_eq!(config.min_consecutive_for_switch, 10);
        assert_eq!(config.fallback_idr_timeout_ms, 2000);
    }

    #[test]
    fn env_override_wins_over_file_default() {
        std::env::set_var("SPLICECORE_MAX_LIVE_GAP_MS", "4242");
        let config = Config::load(None).unwrap();
        assert_eq!(config.max_live_gap_ms, 4242);
        std::env::remove_var("SPLICECORE_MAX_LIVE_GAP_MS");
    }

    #[test]
    fn env_override_reaches_every_field() {
        std::env::set_var("SPLICECORE_ROLLING_BUFFER_CAPACITY", "9001");
        std::env::set_var("SPLICECORE_REASSEMBLER_MAX_BUFFER", "65536");
        std::env::set_var("SPLICECORE_REASSEMBLER_VERIFY_COUNT", "7");
        std::env::set_var("SPLICECORE_PSI_REEMIT_INTERVAL_MS", "250");
        std::env::set_var("SPLICECORE_MIN_VIDEO_PES_FOR_HEALTH", "11");
        std::env::set_var("SPLICECORE_MIN_AUDIO_PUSI_FOR_HEALTH", "3");
        std::env::set_var("SPLICECORE_RECONNECT_BACKOFF_MS", "750");

        let config = Config::load(None).unwrap();
        assert_eq!(config.rolling_buffer_capacity, 9001);
        assert_eq!(config.reassembler_max_buffer, 65536);
        assert_eq!(config.reassembler_verify_count, 7);
        assert_eq!(config.psi_reemit_interval_ms, 250);
        assert_eq!(config.min_video_pes_for_health, 11);
        assert_eq!(config.min_audio_pusi_for_health, 3);
        assert_eq!(config.reconnect_backoff_ms, 750);

        for var in [
            "SPLICECORE_ROLLING_BUFFER_CAPACITY",
            "SPLICECORE_REASSEMBLER_MAX_BUFFER",
            "SPLICECORE_REASSEMBLER_VERIFY_COUNT",
            "SPLICECORE_PSI_REEMIT_INTERVAL_MS",
            "SPLICECORE_MIN_VIDEO_PES_FOR_HEALTH",
            "SPLICECORE_MIN_AUDIO_PUSI_FOR_HEALTH",
            "SPLICECORE_RECONNECT_BACKOFF_MS",
        ] {
            std::env::remove_var(var);
        }
    }
}
