//! BLE Service and Characteristic UUIDs.
//!
//! Defaults for the primary service/characteristic the manager subscribes
//! to after connecting. Both can be overridden through
//! [`LinkConfig`](crate::config::LinkConfig).

use uuid::Uuid;

/// Default primary service UUID.
pub const DEFAULT_PRIMARY_SERVICE_UUID: Uuid =
    Uuid::from_u128(0xa074_98ca_ad5b_474e_940d_16f1fbe7e8cc);

/// Default primary characteristic UUID (Read, Notify).
pub const DEFAULT_PRIMARY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x51ff_12bb_3ed8_46e5_b4f9_d64e2fec021b);

/// Bluetooth SIG base UUID that 16-bit assigned numbers are expanded into.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb);

/// Expand a 16-bit SIG assigned number into a full UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// Return the 16-bit assigned number if `uuid` is built on the SIG base UUID.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let mask = !(0xffff_u128 << 96);
    if value & mask == BLUETOOTH_BASE_UUID.as_u128() {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_uuid_format() {
        assert_eq!(
            DEFAULT_PRIMARY_SERVICE_UUID.to_string(),
            "a07498ca-ad5b-474e-940d-16f1fbe7e8cc"
        );
        assert_eq!(
            DEFAULT_PRIMARY_CHARACTERISTIC_UUID.to_string(),
            "51ff12bb-3ed8-46e5-b4f9-d64e2fec021b"
        );
    }

    #[test]
    fn test_short_uuid() {
        let device_info = uuid_from_u16(0x180a);
        assert_eq!(
            device_info.to_string(),
            "0000180a-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(short_uuid(&device_info), Some(0x180a));
        assert_eq!(short_uuid(&DEFAULT_PRIMARY_SERVICE_UUID), None);
    }
}
