//! Protocol and session configuration.
//!
//! [`ProtocolConfig`] carries every tunable limit of the codec and the proxy
//! layer. Defaults suit large-model servers; [`ProtocolConfig::from_env`]
//! overlays values from `AGGWIRE_*` environment variables.

use std::time::Duration;

/// Bytes in one mebibyte.
pub const MB: usize = 1024 * 1024;

/// Default maximum size of one incoming command (1 GB).
pub const DEFAULT_MAX_COMMAND_SIZE: usize = 1024 * MB;

/// Hard ceiling for doubling growth of an outgoing command buffer.
pub const DEFAULT_GROWTH_CEILING: usize = 100 * MB;

/// Parameters at or above this size are written in chunks.
pub const DEFAULT_LARGE_DATA_SIZE: usize = 256 * 1024;

/// Chunk size for large parameter writes.
pub const DEFAULT_CHUNK_SIZE: usize = MB;

/// Content smaller than this is never compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 4096;

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_LISTENER_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_VARIABLE_CACHE_CAPACITY: usize = 1024;
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 4096;

pub const ENV_MAX_COMMAND_SIZE_MB: &str = "AGGWIRE_COMMAND_MAX_SIZE_MB";
pub const ENV_COMPRESSION: &str = "AGGWIRE_COMPRESSION";
pub const ENV_REPLY_TIMEOUT_MS: &str = "AGGWIRE_REPLY_TIMEOUT_MS";
pub const ENV_VARIABLE_CACHE_CAPACITY: &str = "AGGWIRE_VARIABLE_CACHE_CAPACITY";

/// Wire protocol revision negotiated with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    /// Legacy delimited framing.
    V2,
    /// Length-prefixed binary framing.
    V3,
    V4,
}

impl ProtocolVersion {
    /// True when frames carry a length prefix and a type byte.
    pub fn is_binary(self) -> bool {
        self >= ProtocolVersion::V3
    }

    /// Remote add/remove listener commands exist from V3 on.
    pub fn supports_listener_commands(self) -> bool {
        self >= ProtocolVersion::V3
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::V3
    }
}

/// Limits and timeouts shared by the codec, the connection and the proxies.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Incoming commands above this size are rejected before allocation.
    pub max_command_size: usize,
    /// Outgoing buffer doubling stops here; beyond it growth is exact.
    pub growth_ceiling: usize,
    /// Parameter size from which writes are chunked and NUL padding trimmed.
    pub large_data_size: usize,
    pub chunk_size: usize,
    /// Compress outgoing binary frames.
    pub compression: bool,
    pub compression_threshold: usize,
    pub reply_timeout: Duration,
    /// Timeout for reads of metadata variables during initialization.
    pub metadata_timeout: Duration,
    pub listener_timeout: Duration,
    pub variable_cache_capacity: usize,
    /// Incoming events buffered for the consumer. The read loop never waits
    /// on a full channel: further events are dropped and counted in
    /// `ProtocolMetrics::events_dropped`. A dropped change event leaves the
    /// cached value in place until its TTL runs out.
    pub event_channel_capacity: usize,
    /// Send remote add/remove listener commands.
    pub manage_remote_listeners: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_command_size: DEFAULT_MAX_COMMAND_SIZE,
            growth_ceiling: DEFAULT_GROWTH_CEILING,
            large_data_size: DEFAULT_LARGE_DATA_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression: false,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            metadata_timeout: DEFAULT_METADATA_TIMEOUT,
            listener_timeout: DEFAULT_LISTENER_TIMEOUT,
            variable_cache_capacity: DEFAULT_VARIABLE_CACHE_CAPACITY,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            manage_remote_listeners: true,
        }
    }
}

impl ProtocolConfig {
    /// Defaults overlaid with `AGGWIRE_*` environment variables.
    ///
    /// Invalid values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_MAX_COMMAND_SIZE_MB) {
            if let Some(size) = parse_max_command_size(&raw) {
                config.max_command_size = size;
            }
        }

        if let Some(raw) = lookup(ENV_COMPRESSION) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.compression = true,
                "0" | "false" | "no" | "off" => config.compression = false,
                other => tracing::warn!("Invalid {} value '{}', ignoring", ENV_COMPRESSION, other),
            }
        }

        if let Some(raw) = lookup(ENV_REPLY_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.reply_timeout = Duration::from_millis(ms),
                _ => tracing::warn!("Invalid {} value '{}', ignoring", ENV_REPLY_TIMEOUT_MS, raw),
            }
        }

        if let Some(raw) = lookup(ENV_VARIABLE_CACHE_CAPACITY) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.variable_cache_capacity = n,
                _ => tracing::warn!(
                    "Invalid {} value '{}', ignoring",
                    ENV_VARIABLE_CACHE_CAPACITY,
                    raw
                ),
            }
        }

        config
    }
}

/// Positive megabyte counts up to `i32::MAX / MB` are accepted; larger ones
/// clamp to `i32::MAX / 2` bytes.
fn parse_max_command_size(raw: &str) -> Option<usize> {
    let limit_mb = i32::MAX as i64 / MB as i64;
    match raw.trim().parse::<i64>() {
        Ok(mb) if mb > 0 && mb <= limit_mb => {
            tracing::debug!("Maximum command size set to {} MB", mb);
            Some(mb as usize * MB)
        }
        Ok(mb) if mb > limit_mb => {
            let clamped = (i32::MAX / 2) as usize;
            tracing::warn!(
                "Maximum command size {} MB too large, using {} MB",
                mb,
                clamped / MB
            );
            Some(clamped)
        }
        _ => {
            tracing::warn!(
                "Invalid {} value '{}', using default",
                ENV_MAX_COMMAND_SIZE_MB,
                raw
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> ProtocolConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProtocolConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = ProtocolConfig::default();
        assert_eq!(config.max_command_size, 1024 * MB);
        assert_eq!(config.growth_ceiling, 100 * MB);
        assert!(!config.compression);
        assert!(config.manage_remote_listeners);
    }

    #[test]
    fn test_max_command_size_from_env() {
        let config = config_with(&[(ENV_MAX_COMMAND_SIZE_MB, "16")]);
        assert_eq!(config.max_command_size, 16 * MB);
    }

    #[test]
    fn test_max_command_size_clamped() {
        let config = config_with(&[(ENV_MAX_COMMAND_SIZE_MB, "5000")]);
        assert_eq!(config.max_command_size, (i32::MAX / 2) as usize);
    }

    #[test]
    fn test_invalid_values_ignored() {
        let config = config_with(&[
            (ENV_MAX_COMMAND_SIZE_MB, "-3"),
            (ENV_REPLY_TIMEOUT_MS, "soon"),
            (ENV_COMPRESSION, "maybe"),
        ]);
        assert_eq!(config.max_command_size, DEFAULT_MAX_COMMAND_SIZE);
        assert_eq!(config.reply_timeout, DEFAULT_REPLY_TIMEOUT);
        assert!(!config.compression);
    }

    #[test]
    fn test_compression_and_timeouts() {
        let config = config_with(&[
            (ENV_COMPRESSION, "true"),
            (ENV_REPLY_TIMEOUT_MS, "250"),
            (ENV_VARIABLE_CACHE_CAPACITY, "8"),
        ]);
        assert!(config.compression);
        assert_eq!(config.reply_timeout, Duration::from_millis(250));
        assert_eq!(config.variable_cache_capacity, 8);
    }

    #[test]
    fn test_version_capabilities() {
        assert!(!ProtocolVersion::V2.is_binary());
        assert!(ProtocolVersion::V3.is_binary());
        assert!(ProtocolVersion::V4.supports_listener_commands());
        assert!(!ProtocolVersion::V2.supports_listener_commands());
    }
}
