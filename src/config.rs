//! Tunables for the sheet core.
//!
//! Every field has a default, so a config file only needs to name what it changes:
//!
//! ```json
//! { "autosave_debounce_ms": 1000, "critical_threshold": 0.9 }
//! ```

use crate::error::{Result, SheetError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Rows in a freshly created sheet; loaded sheets are padded up to this.
    pub default_rows: usize,
    pub min_rows: usize,
    /// Remote updates addressing a row past this are dropped.
    pub max_rows: usize,
    pub default_columns: usize,
    pub min_columns: usize,

    pub autosave_debounce_ms: u64,
    pub poll_interval_ms: u64,
    /// Every n-th poll tick also reloads sheet data.
    pub reload_every_ticks: u32,
    pub heartbeat_interval_ms: u64,
    /// Delay before the second presence request after a reconnect.
    pub presence_retry_delay_ms: u64,

    /// Fraction of the baseline consumed at which an inventory row is critical.
    pub critical_threshold: f64,

    pub default_column_width: u32,
    pub default_row_height: u32,
    pub collapsed_row_height: u32,

    pub baseline_column: String,
    pub total_column: String,
}

impl Default for CollabConfig {
    fn default() -> Self {
        CollabConfig {
            default_rows: 100,
            min_rows: 10,
            max_rows: 10_000,
            default_columns: 8,
            min_columns: 1,
            autosave_debounce_ms: 2000,
            poll_interval_ms: 5000,
            reload_every_ticks: 2,
            heartbeat_interval_ms: 30_000,
            presence_retry_delay_ms: 1500,
            critical_threshold: 0.80,
            default_column_width: 120,
            default_row_height: 24,
            collapsed_row_height: 4,
            baseline_column: "Maintaining".to_string(),
            total_column: "Total".to_string(),
        }
    }
}

impl CollabConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CollabConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Load `path` when it exists, otherwise use the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            log::debug!("no config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(SheetError::InvalidConfig(msg.to_string()));
        if self.min_rows == 0 {
            return fail("min_rows must be at least 1");
        }
        if self.min_columns == 0 {
            return fail("min_columns must be at least 1");
        }
        if self.default_rows < self.min_rows {
            return fail("default_rows is below min_rows");
        }
        if self.max_rows < self.default_rows {
            return fail("max_rows is below default_rows");
        }
        if self.default_columns < self.min_columns {
            return fail("default_columns is below min_columns");
        }
        if !(self.critical_threshold > 0.0 && self.critical_threshold <= 1.0) {
            return fail("critical_threshold must be in (0, 1]");
        }
        if self.autosave_debounce_ms == 0
            || self.poll_interval_ms == 0
            || self.heartbeat_interval_ms == 0
            || self.reload_every_ticks == 0
        {
            return fail("timer intervals must be non-zero");
        }
        if self.baseline_column.is_empty() || self.total_column.is_empty() {
            return fail("inventory column names cannot be empty");
        }
        Ok(())
    }

    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn presence_retry_delay(&self) -> Duration {
        Duration::from_millis(self.presence_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            CollabConfig::from_json_str(r#"{ "autosave_debounce_ms": 500, "min_rows": 5 }"#)
                .unwrap();
        assert_eq!(config.autosave_debounce(), Duration::from_millis(500));
        assert_eq!(config.min_rows, 5);
        assert_eq!(config.default_rows, 100);
        assert_eq!(config.baseline_column, "Maintaining");
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let err = CollabConfig::from_json_str(r#"{ "critical_threshold": 1.5 }"#).unwrap_err();
        assert!(matches!(err, SheetError::InvalidConfig(_)));
    }

    #[test]
    fn test_row_limit_must_cover_default_rows() {
        let err = CollabConfig::from_json_str(r#"{ "default_rows": 100, "max_rows": 50 }"#).unwrap_err();
        assert!(matches!(err, SheetError::InvalidConfig(_)));
        let config = CollabConfig::from_json_str(r#"{ "max_rows": 100 }"#).unwrap();
        assert_eq!(config.max_rows, 100);
    }

    #[test]
    fn test_load_from_file_and_missing_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "poll_interval_ms": 1000 }}"#).unwrap();
        let config = CollabConfig::load(file.path()).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));

        let dir = tempfile::tempdir().unwrap();
        let config = CollabConfig::load_or_default(dir.path().join("absent.json")).unwrap();
        assert_eq!(config, CollabConfig::default());
    }
}
