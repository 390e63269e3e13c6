//! Link manager configuration.

use uuid::Uuid;

use crate::ble::transport::ScanFilter;
use crate::ble::uuids::{DEFAULT_PRIMARY_CHARACTERISTIC_UUID, DEFAULT_PRIMARY_SERVICE_UUID};
use crate::error::{Error, Result};
use crate::reconnect::ReconnectPolicy;

/// Default capacity of the lifecycle event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Default capacity of the notification broadcast channel.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

/// Configuration for a [`LinkManager`](crate::LinkManager).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkConfig {
    /// Advertised services to scan for. Empty scans for everything.
    pub scan_services: Vec<Uuid>,
    /// Service holding the primary characteristic.
    pub primary_service_uuid: Uuid,
    /// Characteristic subscribed to and read once the link is Ready.
    pub primary_characteristic_uuid: Uuid,
    /// What to do after an unsolicited disconnect.
    pub reconnect: ReconnectPolicy,
    /// Buffered lifecycle events per subscriber before lagging.
    pub event_capacity: usize,
    /// Buffered notifications per subscriber before lagging.
    pub notification_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            scan_services: Vec::new(),
            primary_service_uuid: DEFAULT_PRIMARY_SERVICE_UUID,
            primary_characteristic_uuid: DEFAULT_PRIMARY_CHARACTERISTIC_UUID,
            reconnect: ReconnectPolicy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

impl LinkConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only report peripherals advertising `service`.
    pub fn scan_for_service(mut self, service: Uuid) -> Self {
        if !self.scan_services.contains(&service) {
            self.scan_services.push(service);
        }
        self
    }

    /// Set the primary service and characteristic.
    pub fn primary_characteristic(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.primary_service_uuid = service;
        self.primary_characteristic_uuid = characteristic;
        self
    }

    /// Set the reconnection policy.
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the lifecycle event channel capacity.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the notification channel capacity.
    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }

    /// Scan filter derived from `scan_services`.
    pub fn scan_filter(&self) -> ScanFilter {
        ScanFilter::services(self.scan_services.clone())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig(
                "event_capacity must be > 0".to_string(),
            ));
        }
        if self.notification_capacity == 0 {
            return Err(Error::InvalidConfig(
                "notification_capacity must be > 0".to_string(),
            ));
        }
        self.reconnect.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::uuid_from_u16;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert!(config.scan_services.is_empty());
        assert_eq!(config.primary_service_uuid, DEFAULT_PRIMARY_SERVICE_UUID);
        assert_eq!(config.reconnect.delay, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scan_filter() {
        let service = uuid_from_u16(0x180f);
        let config = LinkConfig::new()
            .scan_for_service(service)
            .scan_for_service(service);
        assert_eq!(config.scan_filter().services, vec![service]);
    }

    #[test]
    fn test_validate() {
        assert!(LinkConfig::new().event_capacity(0).validate().is_err());
        assert!(LinkConfig::new().notification_capacity(0).validate().is_err());
        assert!(LinkConfig::new()
            .reconnect(ReconnectPolicy::fixed_delay(Duration::ZERO))
            .validate()
            .is_err());
    }
}
