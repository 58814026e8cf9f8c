//! BLE Service and Characteristic UUIDs.
//!
//! The thermometer advertises 16-bit UUIDs, expanded here onto the
//! Bluetooth base UUID.

use uuid::Uuid;

/// The Bluetooth SIG base UUID (`0000xxxx-0000-1000-8000-00805f9b34fb`).
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(BASE_UUID_BITS);

const BASE_UUID_BITS: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// 16-bit short form of the temperature service.
pub const TEMPERATURE_SERVICE_SHORT: u16 = 0x1000;

/// 16-bit short form of the temperature notification characteristic.
pub const TEMPERATURE_CHARACTERISTIC_SHORT: u16 = 0x1002;

/// Temperature Service UUID.
pub const TEMPERATURE_SERVICE_UUID: Uuid = uuid_from_short(TEMPERATURE_SERVICE_SHORT);

/// Temperature Characteristic UUID (Notify).
pub const TEMPERATURE_CHARACTERISTIC_UUID: Uuid =
    uuid_from_short(TEMPERATURE_CHARACTERISTIC_SHORT);

/// Expand a 16-bit UUID onto the Bluetooth base UUID.
pub const fn uuid_from_short(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID_BITS | ((short as u128) << 96))
}

/// Check if a service UUID is the thermometer's temperature service.
pub fn is_temperature_service(uuid: &Uuid) -> bool {
    *uuid == TEMPERATURE_SERVICE_UUID
}

/// Check if a characteristic UUID is the temperature notification characteristic.
pub fn is_temperature_characteristic(uuid: &Uuid) -> bool {
    *uuid == TEMPERATURE_CHARACTERISTIC_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            TEMPERATURE_SERVICE_UUID.to_string(),
            "00001000-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            TEMPERATURE_CHARACTERISTIC_UUID.to_string(),
            "00001002-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_matches_btleplug_expansion() {
        assert_eq!(
            TEMPERATURE_SERVICE_UUID,
            btleplug::api::bleuuid::uuid_from_u16(TEMPERATURE_SERVICE_SHORT)
        );
    }

    #[test]
    fn test_is_temperature_service() {
        assert!(is_temperature_service(&TEMPERATURE_SERVICE_UUID));
        assert!(!is_temperature_service(&TEMPERATURE_CHARACTERISTIC_UUID));
        assert!(is_temperature_characteristic(&TEMPERATURE_CHARACTERISTIC_UUID));
    }
}
