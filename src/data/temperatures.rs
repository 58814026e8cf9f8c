//! Temperature data structures.
//!
//! Contains the probe channel identifiers and decoded per-probe readings.

use crate::utils::celsius_to_fahrenheit;

/// One of the thermometer's two probe channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Probe {
    /// First probe socket.
    P1,
    /// Second probe socket.
    P2,
}

impl Probe {
    /// Both probes, in channel order.
    pub const ALL: [Probe; 2] = [Probe::P1, Probe::P2];

    /// Zero-based channel index.
    pub fn index(&self) -> usize {
        match self {
            Self::P1 => 0,
            Self::P2 => 1,
        }
    }

    /// Look up a probe by zero-based channel index.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

impl std::fmt::Display for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P1 => write!(f, "P1"),
            Self::P2 => write!(f, "P2"),
        }
    }
}

/// A decoded temperature for one probe.
///
/// The device reports a dedicated value when no probe is plugged in; that
/// value is always decoded to [`TemperatureReading::Absent`], never to a number.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TemperatureReading {
    /// A measured temperature in degrees Celsius.
    Valid(f64),
    /// No probe connected on this channel.
    #[default]
    Absent,
}

impl TemperatureReading {
    /// Check if this reading carries a temperature.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Temperature in Celsius, `None` when absent.
    pub fn celsius(&self) -> Option<f64> {
        match self {
            Self::Valid(value) => Some(*value),
            Self::Absent => None,
        }
    }

    /// Temperature in Fahrenheit, `None` when absent.
    pub fn fahrenheit(&self) -> Option<f64> {
        self.celsius().map(celsius_to_fahrenheit)
    }
}

impl std::fmt::Display for TemperatureReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Valid(value) => write!(f, "{:.1}°C", value),
            Self::Absent => write!(f, "--"),
        }
    }
}

/// Readings decoded from a single notification, one per probe.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProbeReadings {
    /// Reading for probe 1.
    pub p1: TemperatureReading,
    /// Reading for probe 2.
    pub p2: TemperatureReading,
}

impl ProbeReadings {
    /// Create a reading pair.
    pub fn new(p1: TemperatureReading, p2: TemperatureReading) -> Self {
        Self { p1, p2 }
    }

    /// Get the reading for a probe.
    pub fn get(&self, probe: Probe) -> TemperatureReading {
        match probe {
            Probe::P1 => self.p1,
            Probe::P2 => self.p2,
        }
    }

    /// Iterate over `(probe, reading)` pairs in channel order.
    pub fn iter(&self) -> impl Iterator<Item = (Probe, TemperatureReading)> + '_ {
        Probe::ALL.into_iter().map(move |probe| (probe, self.get(probe)))
    }
}
