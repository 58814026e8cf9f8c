//! Protocol module for decoding thermometer notifications.
//!
//! This module contains the fixed-layout temperature payload decoder.

pub mod payload;

pub use payload::{decode, RawTemperature, MIN_PAYLOAD_LEN};
