//! BLE building blocks.
//!
//! The connection state machine, GATT descriptors, well-known UUIDs, the
//! [`Transport`] contract the manager drives, and its btleplug
//! implementation.

pub mod characteristics;
pub mod connection;
pub mod platform;
pub mod transport;
pub mod uuids;

pub use characteristics::{CharacteristicDescriptor, CharacteristicProperties, ServiceDescriptor};
pub use connection::ConnectionState;
pub use platform::BtleplugTransport;
pub use transport::{
    Connection, NotificationEvent, NotificationStream, ScanEvent, ScanFilter, ScanRecord,
    ScanStream, Transport,
};
pub use uuids::*;
