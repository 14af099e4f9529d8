//! Transport configuration.
//!
//! `TransportConfig` controls how a [`TransportSession`](crate::session::TransportSession)
//! negotiates tiers and paces its render threads. It has sensible defaults via
//! [`Default`], a fluent [`TransportConfig::builder()`] with validation, JSON
//! loading, and environment overrides.
//!
//! # Examples
//!
//! ## Use defaults
//! ```rust
//! use frame_bridge::config::TransportConfig;
//! let cfg = TransportConfig::default();
//! assert_eq!(cfg.keep_alive_frames, 120);
//! ```
//!
//! ## Customize with the builder
//! ```rust
//! use frame_bridge::config::TransportConfig;
//! use frame_bridge::render::SyncMode;
//! use frame_bridge::transport::Tier;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = TransportConfig::builder()
//!     .max_tier(Tier::CrossApiInterop)
//!     .sync_mode(SyncMode::KeyedMutex)
//!     .sync_timeout_ms(50)
//!     .frame_interval_ms(8)
//!     .build()?; // returns Result<TransportConfig, ConfigError>
//! # Ok(()) }
//! ```
//!
//! # Environment
//!
//! - `FRAME_BRIDGE_SYNC_MODE`: `keyed-mutex`, `1` or `true` turns on the keyed mutex.
//! - `FRAME_BRIDGE_MAX_TIER`: `native`, `interop` or `cpu`.
//! - `FRAME_BRIDGE_OVERLAY`: `0` or `false` turns off diagnostics overlay lines.

use crate::render::SyncMode;
use crate::surface::{ChannelOrder, Origin};
use crate::transport::Tier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const ENV_SYNC_MODE: &str = "FRAME_BRIDGE_SYNC_MODE";
pub const ENV_MAX_TIER: &str = "FRAME_BRIDGE_MAX_TIER";
pub const ENV_OVERLAY: &str = "FRAME_BRIDGE_OVERLAY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Best tier negotiation may pick.
    pub max_tier: Tier,
    pub sync_mode: SyncMode,
    /// Bound on a keyed-mutex acquire. A timeout skips the frame.
    pub sync_timeout_ms: u64,
    /// Channel order of shared textures and CPU buffers handed to the host.
    pub host_channel_order: ChannelOrder,
    /// Row order the host expects.
    pub host_origin: Origin,
    /// Frames rendered unconditionally after start-up.
    pub keep_alive_frames: u32,
    pub frame_interval_ms: u64,
    pub event_capacity: usize,
    pub overlay_enabled: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_tier: Tier::NativeSharedMemory,
            sync_mode: SyncMode::InteropLock,
            sync_timeout_ms: 100,
            host_channel_order: ChannelOrder::Bgra,
            host_origin: Origin::TopLeft,
            keep_alive_frames: 120,
            frame_interval_ms: 16,
            event_capacity: crate::DEFAULT_CHANNEL_CAPACITY,
            overlay_enabled: true,
        }
    }
}

impl TransportConfig {
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::default()
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    /// Parses and validates a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let cfg: TransportConfig = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        validate(&cfg)?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Applies the `FRAME_BRIDGE_*` environment variables.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`. Unknown values are logged and ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup(ENV_SYNC_MODE) {
            match v.trim().to_ascii_lowercase().as_str() {
                "keyed-mutex" | "keyed_mutex" | "1" | "true" | "on" => self.sync_mode = SyncMode::KeyedMutex,
                "interop-lock" | "0" | "false" | "off" | "" => self.sync_mode = SyncMode::InteropLock,
                other => log::warn!("{ENV_SYNC_MODE}: unknown value {other:?}"),
            }
        }
        if let Some(v) = lookup(ENV_MAX_TIER) {
            match Tier::parse(&v) {
                Some(tier) => self.max_tier = tier,
                None => log::warn!("{ENV_MAX_TIER}: unknown tier {v:?}"),
            }
        }
        if let Some(v) = lookup(ENV_OVERLAY) {
            match v.trim().to_ascii_lowercase().as_str() {
                "0" | "false" | "off" => self.overlay_enabled = false,
                "1" | "true" | "on" => self.overlay_enabled = true,
                other => log::warn!("{ENV_OVERLAY}: unknown value {other:?}"),
            }
        }
        self
    }
}

/// Builder for [`TransportConfig`].
#[derive(Debug, Clone, Default)]
pub struct TransportConfigBuilder {
    inner: TransportConfig,
}

impl TransportConfigBuilder {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut TransportConfig)) -> Self {
        f(&mut self.inner);
        self
    }

    pub fn max_tier(self, tier: Tier) -> Self { self.map(|c| c.max_tier = tier) }
    pub fn sync_mode(self, mode: SyncMode) -> Self { self.map(|c| c.sync_mode = mode) }
    pub fn sync_timeout_ms(self, ms: u64) -> Self { self.map(|c| c.sync_timeout_ms = ms) }
    pub fn host_channel_order(self, order: ChannelOrder) -> Self { self.map(|c| c.host_channel_order = order) }
    pub fn host_origin(self, origin: Origin) -> Self { self.map(|c| c.host_origin = origin) }
    pub fn keep_alive_frames(self, n: u32) -> Self { self.map(|c| c.keep_alive_frames = n) }
    pub fn frame_interval_ms(self, ms: u64) -> Self { self.map(|c| c.frame_interval_ms = ms) }
    pub fn event_capacity(self, n: usize) -> Self { self.map(|c| c.event_capacity = n) }
    pub fn overlay_enabled(self, on: bool) -> Self { self.map(|c| c.overlay_enabled = on) }

    /// Apply multiple changes in one go.
    pub fn with(self, f: impl FnOnce(&mut TransportConfig)) -> Self { self.map(f) }

    /// Validate and build the final config.
    pub fn build(self) -> Result<TransportConfig, ConfigError> {
        validate(&self.inner)?;
        Ok(self.inner)
    }
}

// ---------- Validation ----------

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    ZeroFrameInterval,
    ZeroEventCapacity,
    SyncTimeoutOutOfRange(u64),
    Parse(String),
    Io(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroFrameInterval => write!(f, "frame_interval_ms must be at least 1"),
            ConfigError::ZeroEventCapacity => write!(f, "event_capacity must be at least 1"),
            ConfigError::SyncTimeoutOutOfRange(ms) => {
                write!(f, "sync_timeout_ms {ms} is out of range (expected 1..=10000)")
            }
            ConfigError::Parse(e) => write!(f, "invalid config: {e}"),
            ConfigError::Io(e) => write!(f, "cannot read config: {e}"),
        }
    }
}
impl std::error::Error for ConfigError {}

fn validate(c: &TransportConfig) -> Result<(), ConfigError> {
    if c.frame_interval_ms == 0 {
        return Err(ConfigError::ZeroFrameInterval);
    }
    if c.event_capacity == 0 {
        return Err(ConfigError::ZeroEventCapacity);
    }
    if !(1..=10_000).contains(&c.sync_timeout_ms) {
        return Err(ConfigError::SyncTimeoutOutOfRange(c.sync_timeout_ms));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let cfg = TransportConfig::builder().build().unwrap();
        assert_eq!(cfg, TransportConfig::default());
        assert_eq!(cfg.sync_timeout(), Duration::from_millis(100));
        assert_eq!(cfg.sync_mode, SyncMode::InteropLock);
    }

    #[test]
    fn builder_rejects_bad_values() {
        assert_eq!(
            TransportConfig::builder().frame_interval_ms(0).build(),
            Err(ConfigError::ZeroFrameInterval)
        );
        assert_eq!(
            TransportConfig::builder().sync_timeout_ms(0).build(),
            Err(ConfigError::SyncTimeoutOutOfRange(0))
        );
        assert_eq!(
            TransportConfig::builder().event_capacity(0).build(),
            Err(ConfigError::ZeroEventCapacity)
        );
    }

    #[test]
    fn json_partial_document() {
        let cfg = TransportConfig::from_json_str(r#"{ "max_tier": "cpu", "host_origin": "bottom-left" }"#).unwrap();
        assert_eq!(cfg.max_tier, Tier::CpuMediated);
        assert_eq!(cfg.host_origin, Origin::BottomLeft);
        assert_eq!(cfg.keep_alive_frames, 120);

        assert!(matches!(
            TransportConfig::from_json_str(r#"{ "frame_interval_ms": 0 }"#),
            Err(ConfigError::ZeroFrameInterval)
        ));
        assert!(matches!(TransportConfig::from_json_str("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn json_file_round_trip() {
        let cfg = TransportConfig::builder().sync_mode(SyncMode::KeyedMutex).build().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(cfg.to_json_string().unwrap().as_bytes()).unwrap();

        assert_eq!(TransportConfig::from_file(file.path()).unwrap(), cfg);
        assert!(matches!(
            TransportConfig::from_file(file.path().with_extension("missing")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_SYNC_MODE, "1"),
            (ENV_MAX_TIER, "interop"),
            (ENV_OVERLAY, "false"),
        ]
        .into_iter()
        .collect();
        let cfg = TransportConfig::default().with_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.sync_mode, SyncMode::KeyedMutex);
        assert_eq!(cfg.max_tier, Tier::CrossApiInterop);
        assert!(!cfg.overlay_enabled);
    }

    #[test]
    fn unknown_env_values_are_ignored() {
        let cfg = TransportConfig::default().with_overrides(|k| (k == ENV_MAX_TIER).then(|| "vulkan".to_string()));
        assert_eq!(cfg.max_tier, Tier::NativeSharedMemory);
    }
}
