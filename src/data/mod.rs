//! Data structures for thermometer telemetry.
//!
//! This module contains the decoded temperature readings and the
//! threshold/alert types built on top of them.

pub mod alarms;
pub mod temperatures;

pub use alarms::{
    evaluate, AlertChange, AlertState, Threshold, ThresholdEvaluator, DEFAULT_THRESHOLD_CELSIUS,
};
pub use temperatures::{Probe, ProbeReadings, TemperatureReading};
