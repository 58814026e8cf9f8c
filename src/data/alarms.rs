//! Threshold alerts.
//!
//! Per-probe user thresholds and the derived "temperature at or above
//! threshold" alert condition.

use crate::data::temperatures::{Probe, TemperatureReading};
use crate::error::{Error, Result};
use crate::utils::celsius_to_fahrenheit;

/// Threshold applied to both probes until the user changes it.
pub const DEFAULT_THRESHOLD_CELSIUS: f64 = 65.0;

/// A user-configured alert threshold in degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Threshold(f64);

impl Threshold {
    /// Create a threshold, rejecting NaN and infinities.
    pub fn new(celsius: f64) -> Result<Self> {
        if !celsius.is_finite() {
            return Err(Error::InvalidParameter {
                name: "threshold".to_string(),
                value: celsius.to_string(),
            });
        }
        Ok(Self(celsius))
    }

    /// The threshold in Celsius.
    pub fn celsius(&self) -> f64 {
        self.0
    }

    /// The threshold in Fahrenheit.
    pub fn fahrenheit(&self) -> f64 {
        celsius_to_fahrenheit(self.0)
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(DEFAULT_THRESHOLD_CELSIUS)
    }
}

/// Whether a probe's temperature has reached its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AlertState {
    /// Below threshold, or no reading.
    #[default]
    Clear,
    /// At or above threshold.
    Raised,
}

impl AlertState {
    /// Check if the alert is raised.
    pub fn is_raised(&self) -> bool {
        matches!(self, Self::Raised)
    }
}

impl From<bool> for AlertState {
    fn from(raised: bool) -> Self {
        if raised {
            Self::Raised
        } else {
            Self::Clear
        }
    }
}

/// Evaluate a reading against a threshold.
///
/// Raised iff the reading is valid and `value >= threshold`. Absent readings
/// never alert.
pub fn evaluate(reading: TemperatureReading, threshold: Threshold) -> AlertState {
    match reading {
        TemperatureReading::Valid(value) => AlertState::from(value >= threshold.celsius()),
        TemperatureReading::Absent => AlertState::Clear,
    }
}

/// Result of re-evaluating an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertChange {
    /// The alert went from clear to raised.
    Raised,
    /// The alert went from raised to clear.
    Cleared,
    /// No edge.
    Unchanged(AlertState),
}

impl AlertChange {
    fn between(old: AlertState, new: AlertState) -> Self {
        match (old, new) {
            (AlertState::Clear, AlertState::Raised) => Self::Raised,
            (AlertState::Raised, AlertState::Clear) => Self::Cleared,
            (_, state) => Self::Unchanged(state),
        }
    }

    /// The alert state after the change.
    pub fn state(&self) -> AlertState {
        match self {
            Self::Raised => AlertState::Raised,
            Self::Cleared => AlertState::Clear,
            Self::Unchanged(state) => *state,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ProbeAlert {
    threshold: Threshold,
    last_reading: Option<TemperatureReading>,
    state: AlertState,
}

impl ProbeAlert {
    fn reevaluate(&mut self) -> AlertChange {
        let new_state = self
            .last_reading
            .map(|reading| evaluate(reading, self.threshold))
            .unwrap_or_default();
        let change = AlertChange::between(self.state, new_state);
        self.state = new_state;
        change
    }
}

/// Tracks thresholds, last readings and alert state for both probes.
///
/// The alert state is derived; it is never set directly.
#[derive(Debug, Clone, Default)]
pub struct ThresholdEvaluator {
    probes: [ProbeAlert; 2],
}

impl ThresholdEvaluator {
    /// Create an evaluator with the default threshold on both probes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an evaluator with the same starting threshold on both probes.
    pub fn with_threshold(threshold: Threshold) -> Self {
        let mut evaluator = Self::default();
        for alert in &mut evaluator.probes {
            alert.threshold = threshold;
        }
        evaluator
    }

    /// Record a new reading and re-evaluate that probe.
    pub fn on_reading(&mut self, probe: Probe, reading: TemperatureReading) -> AlertChange {
        let alert = &mut self.probes[probe.index()];
        alert.last_reading = Some(reading);
        alert.reevaluate()
    }

    /// Change a probe's threshold and re-evaluate against its last reading.
    pub fn set_threshold(&mut self, probe: Probe, threshold: Threshold) -> AlertChange {
        let alert = &mut self.probes[probe.index()];
        alert.threshold = threshold;
        alert.reevaluate()
    }

    /// Forget both probes' readings, keeping thresholds.
    ///
    /// With no reading a probe's alert is clear.
    pub fn clear_readings(&mut self) -> [AlertChange; 2] {
        let mut changes = [AlertChange::Unchanged(AlertState::Clear); 2];
        for (change, alert) in changes.iter_mut().zip(self.probes.iter_mut()) {
            alert.last_reading = None;
            *change = alert.reevaluate();
        }
        changes
    }

    /// Current threshold for a probe.
    pub fn threshold(&self, probe: Probe) -> Threshold {
        self.probes[probe.index()].threshold
    }

    /// Current alert state for a probe.
    pub fn alert(&self, probe: Probe) -> AlertState {
        self.probes[probe.index()].state
    }

    /// Last reading seen for a probe.
    pub fn last_reading(&self, probe: Probe) -> Option<TemperatureReading> {
        self.probes[probe.index()].last_reading
    }
}
