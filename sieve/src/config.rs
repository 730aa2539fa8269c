//! Engine configuration.
//!
//! [`EngineConfig`] is loaded from JSON and validated before an engine is
//! built from it. Every field is optional in the file:
//!
//! ```json
//! {"slow_query_threshold_ms": 250, "lookback_delta_ms": 300000, "trace": "phases"}
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::storage::DEFAULT_LOOKBACK_MS;

/// Which tracer an engine installs for [`crate::Engine::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceMode {
    /// No tracing.
    #[default]
    Off,
    /// Plan and exec phase timings.
    Phases,
    /// Per-node evaluation tree.
    Nodes,
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Queries slower than this are logged with their trace.
    pub slow_query_threshold_ms: Option<u64>,
    /// Staleness lookback for instant fetches.
    pub lookback_delta_ms: u64,
    /// Tracer selection.
    pub trace: TraceMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: None,
            lookback_delta_ms: DEFAULT_LOOKBACK_MS.unsigned_abs(),
            trace: TraceMode::Off,
        }
    }
}

impl EngineConfig {
    /// Reads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid JSON, and
    /// [`ConfigError::InvalidValue`] if validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(ConfigError::from)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), ?config, "loaded engine config");
        Ok(config)
    }

    /// Checks field values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for a zero or oversized lookback
    /// and for a zero slow-query threshold.
    pub fn validate(&self) -> Result<()> {
        if self.lookback_delta_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lookback_delta_ms",
                reason: "lookback cannot be zero".to_string(),
            }
            .into());
        }

        if i64::try_from(self.lookback_delta_ms).is_err() {
            return Err(ConfigError::InvalidValue {
                field: "lookback_delta_ms",
                reason: format!("{} exceeds the timestamp range", self.lookback_delta_ms),
            }
            .into());
        }

        if self.slow_query_threshold_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "slow_query_threshold_ms",
                reason: "threshold cannot be zero; omit it to disable".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// The lookback as a signed millisecond offset. Clamped for unvalidated configs.
    pub fn lookback_ms(&self) -> i64 {
        i64::try_from(self.lookback_delta_ms).unwrap_or(i64::MAX)
    }
}
