// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-link
//!
//! Connection lifecycle management for a single Bluetooth Low Energy
//! peripheral.
//!
//! A [`LinkManager`] scans for peripherals, connects to the one you pick,
//! discovers its services, subscribes to a primary characteristic and keeps
//! the link alive: when the peripheral drops off without being asked to, it
//! schedules a reconnect according to a [`ReconnectPolicy`].
//!
//! ## Features
//!
//! - **Explicit state machine**: Idle, Scanning, Connecting, Discovering,
//!   Ready, Disconnected and ReconnectPending, with only legal transitions
//! - **Automatic reconnection**: fixed delay by default, optional backoff and
//!   attempt limit
//! - **Stale callback protection**: completions from a torn-down session
//!   never touch the current one
//! - **Observable**: broadcast events, callbacks and synchronous snapshots
//! - **Testable**: a scriptable [`mock::MockTransport`] drives the whole
//!   lifecycle without hardware
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_link::{ConnectionState, LinkConfig, LinkManager, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = LinkManager::with_btleplug(LinkConfig::default()).await?;
//!     manager.start_scan().await?;
//!
//!     // Wait for peripherals to be discovered
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     if let Some(peripheral) = manager.peripherals().first() {
//!         println!("Connecting to {}", peripheral);
//!         manager.connect(&peripheral.id).await?;
//!     }
//!
//!     let _handle = manager.on_notification(|event| {
//!         println!("{}: {}", event.characteristic_uuid, event.as_text_lossy());
//!     });
//!
//!     let mut events = manager.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!         if manager.state() == ConnectionState::Idle {
//!             break;
//!         }
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration and
//!   snapshot types

// Public modules
pub mod ble;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod link_manager;
pub mod mock;
pub mod peripheral;
pub mod reconnect;
pub mod utils;

mod actor;

// Re-exports for convenience
pub use ble::characteristics::{
    CharacteristicDescriptor, CharacteristicProperties, ServiceDescriptor,
};
pub use ble::connection::ConnectionState;
pub use ble::platform::BtleplugTransport;
pub use ble::transport::{NotificationEvent, ScanFilter, ScanRecord, Transport};
pub use ble::uuids::{DEFAULT_PRIMARY_CHARACTERISTIC_UUID, DEFAULT_PRIMARY_SERVICE_UUID};
pub use config::LinkConfig;
pub use dispatcher::{CallbackHandle, NotificationDispatcher, NotificationObserver};
pub use error::{Error, LinkFailure, Result};
pub use link_manager::{LinkEvent, LinkManager};
pub use peripheral::{PeripheralHandle, PeripheralRegistry};
pub use reconnect::{DisconnectCause, ReconnectDecision, ReconnectPolicy};
pub use utils::{payload_to_hex, payload_to_string, payload_to_string_lossy};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<LinkManager>();
        let _ = std::any::TypeId::of::<LinkEvent>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<ReconnectPolicy>();
        let _ = std::any::TypeId::of::<PeripheralHandle>();
        let _ = std::any::TypeId::of::<BtleplugTransport>();
    }

    #[test]
    fn test_payload_helpers() {
        assert_eq!(payload_to_string(b"ok").as_deref(), Some("ok"));
        assert_eq!(payload_to_hex(&[0xde, 0xad]), "DE AD");
    }
}
