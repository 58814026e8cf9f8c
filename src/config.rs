//! Device manager configuration.

use std::time::Duration;
use uuid::Uuid;

use crate::data::Threshold;
use crate::error::{Error, Result};

/// Configuration for [`DeviceManager`](crate::DeviceManager).
///
/// # Example
///
/// ```
/// use smart_temp_ble::{ManagerConfig, TEMPERATURE_SERVICE_UUID};
/// use std::time::Duration;
///
/// let config = ManagerConfig::default()
///     .with_phase_timeout(Duration::from_secs(5))
///     .with_scan_filter(Some(TEMPERATURE_SERVICE_UUID));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerConfig {
    /// Maximum wait in each connecting/discovering phase.
    pub phase_timeout: Duration,
    /// Service UUID to filter scans by, `None` to see every advertiser.
    pub scan_filter: Option<Uuid>,
    /// Start scanning as soon as the manager is created.
    pub scan_on_start: bool,
    /// Capacity of the internal event and telemetry channels.
    pub event_capacity: usize,
    /// Threshold applied to both probes at startup.
    pub default_threshold: Threshold,
}

impl ManagerConfig {
    /// Default timeout per connection phase (10 seconds).
    pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default channel capacity.
    pub const DEFAULT_EVENT_CAPACITY: usize = 64;

    /// Set the per-phase timeout.
    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    /// Set the scan filter.
    pub fn with_scan_filter(mut self, filter: Option<Uuid>) -> Self {
        self.scan_filter = filter;
        self
    }

    /// Enable or disable scanning at startup.
    pub fn with_scan_on_start(mut self, scan_on_start: bool) -> Self {
        self.scan_on_start = scan_on_start;
        self
    }

    /// Set the channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the startup threshold for both probes.
    pub fn with_default_threshold(mut self, threshold: Threshold) -> Self {
        self.default_threshold = threshold;
        self
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.phase_timeout.is_zero() {
            return Err(Error::InvalidParameter {
                name: "phase_timeout".to_string(),
                value: format!("{:?}", self.phase_timeout),
            });
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidParameter {
                name: "event_capacity".to_string(),
                value: self.event_capacity.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            phase_timeout: Self::DEFAULT_PHASE_TIMEOUT,
            scan_filter: None,
            scan_on_start: false,
            event_capacity: Self::DEFAULT_EVENT_CAPACITY,
            default_threshold: Threshold::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.phase_timeout, Duration::from_secs(10));
        assert_eq!(config.scan_filter, None);
        assert!(!config.scan_on_start);
        assert_eq!(config.default_threshold.celsius(), 65.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(ManagerConfig::default()
            .with_phase_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(ManagerConfig::default()
            .with_event_capacity(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_builder_sets_fields() {
        let config = ManagerConfig::default()
            .with_scan_filter(Some(crate::TEMPERATURE_SERVICE_UUID))
            .with_scan_on_start(true)
            .with_event_capacity(8);
        assert_eq!(config.scan_filter, Some(crate::TEMPERATURE_SERVICE_UUID));
        assert!(config.scan_on_start);
        assert_eq!(config.event_capacity, 8);
    }
}
