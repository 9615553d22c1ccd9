//! Node-level configuration for routine coordination
//!
//! Loaded from TOML. Durations are written in milliseconds:
//!
//! ```toml
//! start_timeout_ms = 5000
//! stop_timeout_ms = 2000
//! max_buffer_size = 65536
//! catch_up_on_join = true
//! max_frame_size = 1048576
//! ```

use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::{ConfigError, ContinuumResult};

/// Configuration shared by every protocol component of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutineConfig {
    /// Bound on a single execution-engine start call
    #[serde(rename = "start_timeout_ms", with = "duration_ms")]
    pub start_timeout: Duration,
    /// Bound on a single execution-engine stop call
    #[serde(rename = "stop_timeout_ms", with = "duration_ms")]
    pub stop_timeout: Duration,
    /// Largest buffer a routine may request
    pub max_buffer_size: usize,
    /// Replay completed routines to nodes that join the ring
    pub catch_up_on_join: bool,
    /// Largest encoded message accepted by the codec
    pub max_frame_size: usize,
}

impl Default for RoutineConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
            max_buffer_size: 64 * 1024,
            catch_up_on_join: true,
            max_frame_size: 1024 * 1024, // 1MB
        }
    }
}

impl RoutineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RoutineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> ContinuumResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_timeout.is_zero() {
            return Err(ConfigError::Invalid("start_timeout_ms must be positive".to_string()));
        }
        if self.stop_timeout.is_zero() {
            return Err(ConfigError::Invalid("stop_timeout_ms must be positive".to_string()));
        }
        if self.max_buffer_size == 0 {
            return Err(ConfigError::Invalid("max_buffer_size must be positive".to_string()));
        }
        if self.max_frame_size < 64 {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size {} is too small to hold a message",
                self.max_frame_size
            )));
        }
        // frame lengths travel as a 4-byte prefix
        if u32::try_from(self.max_frame_size).is_err() {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size {} does not fit a 32-bit length prefix",
                self.max_frame_size
            )));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
