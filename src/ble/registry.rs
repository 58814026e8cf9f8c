//! Registry of discovered peripherals.
//!
//! Peripherals are keyed by their stable platform identifier only; repeated
//! advertisements refresh an existing entry instead of adding a new row.

use std::collections::HashMap;
use tracing::trace;

/// Stable platform identifier of a peripheral.
///
/// On Linux/Windows this is the MAC address, on macOS a CoreBluetooth UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Wrap a platform identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A peripheral seen during scanning.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralHandle {
    /// Platform identifier.
    pub id: PeripheralId,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength of the latest advertisement in dBm.
    pub rssi: Option<i16>,
}

impl PeripheralHandle {
    /// Name shown for peripherals that do not advertise one.
    pub const UNKNOWN_NAME: &'static str = "Unknown Device";

    /// Create a handle.
    pub fn new(id: impl Into<String>, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            id: PeripheralId::new(id),
            name,
            rssi,
        }
    }

    /// The advertised name, or `"Unknown Device"`.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(Self::UNKNOWN_NAME)
    }
}

/// Key used to deduplicate discovery events.
pub fn registry_key(handle: &PeripheralHandle) -> &PeripheralId {
    &handle.id
}

/// Discovered peripherals in first-discovery order.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    entries: Vec<PeripheralHandle>,
    positions: HashMap<PeripheralId, usize>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovery event.
    ///
    /// Returns `true` if the peripheral was not known before.
    pub fn on_discovered(&mut self, handle: PeripheralHandle) -> bool {
        if let Some(&position) = self.positions.get(registry_key(&handle)) {
            let existing = &mut self.entries[position];
            trace!(
                "Refreshing {}: rssi {:?} -> {:?}",
                existing.id,
                existing.rssi,
                handle.rssi
            );
            existing.rssi = handle.rssi;
            if handle.name.is_some() {
                existing.name = handle.name;
            }
            return false;
        }

        self.positions
            .insert(registry_key(&handle).clone(), self.entries.len());
        self.entries.push(handle);
        true
    }

    /// Remove every entry.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.positions.clear();
    }

    /// Look up a peripheral by identifier.
    pub fn get(&self, id: &PeripheralId) -> Option<&PeripheralHandle> {
        self.positions.get(id).map(|&position| &self.entries[position])
    }

    /// Check if a peripheral is known.
    pub fn contains(&self, id: &PeripheralId) -> bool {
        self.positions.contains_key(id)
    }

    /// Number of known peripherals.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate in first-discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &PeripheralHandle> {
        self.entries.iter()
    }

    /// Copy the entries out for presentation.
    pub fn to_vec(&self) -> Vec<PeripheralHandle> {
        self.entries.clone()
    }
}
