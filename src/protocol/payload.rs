//! Temperature notification payload decoding.
//!
//! The thermometer notifies a fixed-layout buffer on its temperature
//! characteristic:
//!
//! | Offset | Contents                                   |
//! |--------|--------------------------------------------|
//! | 0-2    | Header (ignored)                           |
//! | 3      | P1 whole value                             |
//! | 4      | P1 sub-unit value in the upper nibble      |
//! | 5      | P2 whole value                             |
//! | 6      | P2 sub-unit value in the upper nibble      |
//!
//! Each pair combines to `raw = byte[i] * 10 + (byte[i + 1] >> 4)`, read as
//! tenths of a degree Celsius.

use tracing::trace;

use crate::data::{ProbeReadings, TemperatureReading};
use crate::error::DecodeError;

/// Minimum number of bytes in a temperature payload.
pub const MIN_PAYLOAD_LEN: usize = 7;

/// Offset of the P1 value pair.
pub const P1_OFFSET: usize = 3;

/// Offset of the P2 value pair.
pub const P2_OFFSET: usize = 5;

/// Raw fixed-point temperature for one probe, in tenths of a degree Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawTemperature(pub u16);

impl RawTemperature {
    /// Raw value the device sends when no probe is plugged in.
    pub const ABSENT: Self = Self(1440);

    /// Combine a whole byte and a sub-unit byte.
    ///
    /// Only the upper nibble of `fraction` contributes.
    ///
    /// # Example
    ///
    /// ```
    /// use smart_temp_ble::protocol::RawTemperature;
    ///
    /// let raw = RawTemperature::from_bytes(65, 0x30);
    /// assert_eq!(raw.raw_value(), 653);
    /// assert_eq!(raw.to_celsius(), Some(65.3));
    /// ```
    pub fn from_bytes(whole: u8, fraction: u8) -> Self {
        Self(u16::from(whole) * 10 + u16::from(fraction >> 4))
    }

    /// Get the raw value.
    pub fn raw_value(&self) -> u16 {
        self.0
    }

    /// Check if this is the "probe not connected" value.
    pub fn is_absent(&self) -> bool {
        *self == Self::ABSENT
    }

    /// Convert the raw value to Celsius.
    ///
    /// # Returns
    ///
    /// `Some(temperature)` for a connected probe, `None` for the absent value.
    pub fn to_celsius(&self) -> Option<f64> {
        if self.is_absent() {
            None
        } else {
            Some(f64::from(self.0) / 10.0)
        }
    }

    /// Convert to a [`TemperatureReading`].
    pub fn to_reading(&self) -> TemperatureReading {
        self.to_celsius()
            .map(TemperatureReading::Valid)
            .unwrap_or(TemperatureReading::Absent)
    }
}

/// Decode a notification payload into both probe readings.
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] if `data` holds fewer than
/// [`MIN_PAYLOAD_LEN`] bytes. Trailing bytes beyond the layout are ignored.
///
/// # Example
///
/// ```
/// use smart_temp_ble::data::TemperatureReading;
/// use smart_temp_ble::protocol::decode;
///
/// let readings = decode(&[0, 0, 0, 65, 0, 70, 0]).unwrap();
/// assert_eq!(readings.p1, TemperatureReading::Valid(65.0));
/// assert_eq!(readings.p2, TemperatureReading::Valid(70.0));
/// ```
pub fn decode(data: &[u8]) -> Result<ProbeReadings, DecodeError> {
    if data.len() < MIN_PAYLOAD_LEN {
        return Err(DecodeError::TooShort {
            len: data.len(),
            required: MIN_PAYLOAD_LEN,
        });
    }

    let p1 = RawTemperature::from_bytes(data[P1_OFFSET], data[P1_OFFSET + 1]);
    let p2 = RawTemperature::from_bytes(data[P2_OFFSET], data[P2_OFFSET + 1]);

    trace!("Decoded raw temperatures: P1={}, P2={}", p1.0, p2.0);

    Ok(ProbeReadings::new(p1.to_reading(), p2.to_reading()))
}
