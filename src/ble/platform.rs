//! [`Transport`] backed by the system Bluetooth stack via btleplug.

use async_trait::async_trait;
use btleplug::api::{
    CentralEvent, CentralState, CharPropFlags, Characteristic, Central, Manager as _,
    Peripheral as _, ScanFilter as BtleScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::future::{self, FutureExt};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::ble::characteristics::{
    CharacteristicDescriptor, CharacteristicProperties, ServiceDescriptor,
};
use crate::ble::transport::{
    Connection, NotificationEvent, NotificationStream, ScanEvent, ScanFilter, ScanRecord,
    ScanStream, Transport,
};
use crate::error::{Error, Result};
use crate::peripheral::PeripheralHandle;

/// Scan failure code reported when the adapter is powered off mid-scan.
pub const SCAN_CODE_ADAPTER_OFF: i32 = 1;

/// BLE transport on a btleplug adapter.
pub struct BtleplugTransport {
    /// The BLE adapter used for scanning and connecting.
    adapter: Adapter,
    /// Peripherals seen by the current scan, by id string.
    discovered: Arc<RwLock<HashMap<String, Peripheral>>>,
}

impl BtleplugTransport {
    /// Use the first adapter on the system.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            discovered: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn find_peripheral(&self, id: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.discovered.read().get(id).cloned() {
            return Ok(peripheral);
        }

        // Fall back to the adapter's cache, e.g. for a peripheral seen by
        // another process.
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == id)
            .ok_or_else(|| Error::PeripheralNotFound {
                identifier: id.to_string(),
            })
    }

    async fn scan_record(
        adapter: &Adapter,
        id: PeripheralId,
        discovered: &RwLock<HashMap<String, Peripheral>>,
    ) -> Option<ScanRecord> {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let identifier = id.to_string();
        discovered.write().insert(identifier.clone(), peripheral);

        Some(ScanRecord {
            id: identifier,
            name: properties.local_name,
            rssi: properties.rssi,
        })
    }
}

fn find_gatt_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| Error::CharacteristicNotFound {
            uuid: uuid.to_string(),
        })
}

fn properties_from_flags(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    type Link = Peripheral;

    async fn start_scan(&self, filter: &ScanFilter) -> Result<ScanStream> {
        info!("Starting BLE scan");

        self.discovered.write().clear();

        // Subscribe before starting so no early advertisement is missed.
        let events = self.adapter.events().await.map_err(Error::Bluetooth)?;

        self.adapter
            .start_scan(BtleScanFilter {
                services: filter.services.clone(),
            })
            .await
            .map_err(Error::Bluetooth)?;

        let adapter = self.adapter.clone();
        let discovered = self.discovered.clone();

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let discovered = discovered.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        trace!("Device seen: {:?}", id);
                        Self::scan_record(&adapter, id, &discovered)
                            .await
                            .map(ScanEvent::Discovered)
                    }
                    CentralEvent::StateUpdate(CentralState::PoweredOff) => {
                        debug!("Adapter powered off while scanning");
                        Some(ScanEvent::Failed {
                            code: SCAN_CODE_ADAPTER_OFF,
                        })
                    }
                    _ => None,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        info!("Stopping BLE scan");
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Connection<Peripheral>> {
        let target = self.find_peripheral(&peripheral.id).await?;
        let target_id = target.id();

        let mut events = self.adapter.events().await.map_err(Error::Bluetooth)?;

        if target.is_connected().await.unwrap_or(false) {
            info!("Peripheral already connected at BLE level");
        } else {
            target.connect().await.map_err(Error::Bluetooth)?;
        }

        info!("Connected to {}", peripheral);

        let disconnected = async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == target_id {
                        return "peripheral disconnected".to_string();
                    }
                }
            }
            "adapter event stream ended".to_string()
        }
        .boxed();

        Ok(Connection {
            link: target,
            disconnected,
        })
    }

    async fn discover_services(&self, link: &Peripheral) -> Result<Vec<ServiceDescriptor>> {
        link.discover_services().await.map_err(Error::Bluetooth)?;

        let services = link
            .services()
            .into_iter()
            .map(|service| {
                let characteristics = service
                    .characteristics
                    .into_iter()
                    .map(|c| {
                        debug!(
                            "Found characteristic: {} in service {}",
                            c.uuid, service.uuid
                        );
                        CharacteristicDescriptor::new(c.uuid, properties_from_flags(c.properties))
                    })
                    .collect();
                ServiceDescriptor::new(service.uuid, characteristics)
            })
            .collect();

        Ok(services)
    }

    async fn subscribe(&self, link: &Peripheral, characteristic: Uuid) -> Result<NotificationStream> {
        let gatt = find_gatt_characteristic(link, characteristic)?;

        debug!(
            "Subscribing to {}, properties: {:?}",
            characteristic, gatt.properties
        );

        // Take the stream first so the first notification is not lost.
        let notifications = link.notifications().await.map_err(Error::Bluetooth)?;
        link.subscribe(&gatt).await.map_err(Error::Bluetooth)?;

        let stream = notifications
            .filter(move |n| future::ready(n.uuid == characteristic))
            .map(|n| NotificationEvent::new(n.uuid, n.value));

        Ok(stream.boxed())
    }

    async fn read(&self, link: &Peripheral, characteristic: Uuid) -> Result<Bytes> {
        let gatt = find_gatt_characteristic(link, characteristic)?;
        let data = link.read(&gatt).await.map_err(Error::Bluetooth)?;

        trace!("Read {} bytes from characteristic {}", data.len(), characteristic);

        Ok(Bytes::from(data))
    }

    async fn write(&self, link: &Peripheral, characteristic: Uuid, value: Bytes) -> Result<()> {
        let gatt = find_gatt_characteristic(link, characteristic)?;

        let write_type = if gatt.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        link.write(&gatt, &value, write_type)
            .await
            .map_err(Error::Bluetooth)?;

        trace!("Wrote {} bytes to characteristic {}", value.len(), characteristic);

        Ok(())
    }

    async fn close(&self, link: &Peripheral) {
        match link.disconnect().await {
            Ok(()) => debug!("Closed link to {:?}", link.id()),
            Err(e) => debug!("Closing link to {:?} failed: {}", link.id(), e),
        }
    }
}

impl std::fmt::Debug for BtleplugTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugTransport")
            .field("discovered", &self.discovered.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_from_flags() {
        let props = properties_from_flags(CharPropFlags::READ | CharPropFlags::INDICATE);
        assert_eq!(props, CharacteristicProperties::READ_NOTIFY);

        let props = properties_from_flags(CharPropFlags::WRITE_WITHOUT_RESPONSE);
        assert!(props.write);
        assert!(!props.read);
        assert!(!props.notify);
    }
}
