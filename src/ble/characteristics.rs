//! GATT service and characteristic descriptors.
//!
//! These are the snapshot types handed to observers. They are created during
//! discovery and dropped when the connection leaves the Ready state; only
//! `last_value` changes in between.

use bytes::Bytes;
use uuid::Uuid;

use crate::utils;

/// Operations a characteristic supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties {
    /// Value can be read.
    pub read: bool,
    /// Value can be written (with or without response).
    pub write: bool,
    /// Value changes are pushed (notify or indicate).
    pub notify: bool,
}

impl CharacteristicProperties {
    /// Read only.
    pub const READ: Self = Self {
        read: true,
        write: false,
        notify: false,
    };

    /// Read and notify.
    pub const READ_NOTIFY: Self = Self {
        read: true,
        write: false,
        notify: true,
    };

    /// Read, write and notify.
    pub const ALL: Self = Self {
        read: true,
        write: true,
        notify: true,
    };
}

impl std::fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = [
            (self.read, "read"),
            (self.write, "write"),
            (self.notify, "notify"),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, name)| *name)
        .collect();

        write!(f, "{}", names.join("|"))
    }
}

/// A characteristic discovered on the connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Supported operations.
    pub properties: CharacteristicProperties,
    /// Most recent value from a read or notification, if any.
    pub last_value: Option<Bytes>,
}

impl CharacteristicDescriptor {
    /// Create a descriptor with no value yet.
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            last_value: None,
        }
    }

    /// The last value decoded as UTF-8, if present and valid.
    pub fn last_value_text(&self) -> Option<String> {
        self.last_value.as_deref().and_then(utils::payload_to_string)
    }
}

/// A service discovered on the connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics in discovery order.
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    /// Create a service descriptor.
    pub fn new(uuid: Uuid, characteristics: Vec<CharacteristicDescriptor>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    /// Get a characteristic of this service by UUID.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Find a characteristic anywhere in `services`.
pub fn find_characteristic<'a>(
    services: &'a [ServiceDescriptor],
    uuid: &Uuid,
) -> Option<&'a CharacteristicDescriptor> {
    services.iter().find_map(|s| s.characteristic(uuid))
}

/// Find a characteristic within a specific service.
pub fn find_in_service<'a>(
    services: &'a [ServiceDescriptor],
    service_uuid: &Uuid,
    characteristic_uuid: &Uuid,
) -> Option<&'a CharacteristicDescriptor> {
    services
        .iter()
        .find(|s| s.uuid == *service_uuid)
        .and_then(|s| s.characteristic(characteristic_uuid))
}

/// Store `value` as the last value of every characteristic with `uuid`.
///
/// Returns whether any characteristic matched.
pub fn record_value(services: &mut [ServiceDescriptor], uuid: &Uuid, value: &Bytes) -> bool {
    let mut matched = false;
    for characteristic in services
        .iter_mut()
        .flat_map(|s| s.characteristics.iter_mut())
        .filter(|c| c.uuid == *uuid)
    {
        characteristic.last_value = Some(value.clone());
        matched = true;
    }
    matched
}
