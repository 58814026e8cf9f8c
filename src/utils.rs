//! Utility functions for the smart-temp-ble crate.

use crate::data::TemperatureReading;

/// Convert Celsius to Fahrenheit.
///
/// # Example
///
/// ```
/// use smart_temp_ble::celsius_to_fahrenheit;
///
/// let fahrenheit = celsius_to_fahrenheit(100.0);
/// assert!((fahrenheit - 212.0).abs() < 0.001);
/// ```
#[inline]
pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Convert Fahrenheit to Celsius.
///
/// # Example
///
/// ```
/// use smart_temp_ble::fahrenheit_to_celsius;
///
/// let celsius = fahrenheit_to_celsius(212.0);
/// assert!((celsius - 100.0).abs() < 0.001);
/// ```
#[inline]
pub fn fahrenheit_to_celsius(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

/// Fraction of a gauge's full scale covered by a reading, clamped to `0.0..=1.0`.
///
/// Absent readings and non-positive scales yield `0.0`.
///
/// # Example
///
/// ```
/// use smart_temp_ble::{data::TemperatureReading, utils::gauge_fraction};
///
/// assert_eq!(gauge_fraction(TemperatureReading::Valid(50.0), 100.0), 0.5);
/// assert_eq!(gauge_fraction(TemperatureReading::Valid(150.0), 100.0), 1.0);
/// assert_eq!(gauge_fraction(TemperatureReading::Absent, 100.0), 0.0);
/// ```
pub fn gauge_fraction(reading: TemperatureReading, full_scale: f64) -> f64 {
    match reading.celsius() {
        Some(value) if full_scale > 0.0 => (value / full_scale).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_celsius_to_fahrenheit() {
        assert!((celsius_to_fahrenheit(0.0) - 32.0).abs() < 0.001);
        assert!((celsius_to_fahrenheit(65.0) - 149.0).abs() < 0.001);
        assert!((celsius_to_fahrenheit(-40.0) - (-40.0)).abs() < 0.001);
    }

    #[test]
    fn test_fahrenheit_to_celsius() {
        assert!((fahrenheit_to_celsius(32.0) - 0.0).abs() < 0.001);
        assert!((fahrenheit_to_celsius(149.0) - 65.0).abs() < 0.001);
    }

    #[test]
    fn test_gauge_fraction_bounds() {
        assert_eq!(gauge_fraction(TemperatureReading::Valid(-5.0), 100.0), 0.0);
        assert_eq!(gauge_fraction(TemperatureReading::Valid(25.0), 0.0), 0.0);
        assert!((gauge_fraction(TemperatureReading::Valid(65.0), 100.0) - 0.65).abs() < 1e-9);
    }
}
