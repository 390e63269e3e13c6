//! The contract the lifecycle manager expects from the BLE radio.
//!
//! Every call is asynchronous and the manager never awaits one on its own
//! task: completions are posted back to it as events. Implementations must
//! therefore be cheap to share (`Send + Sync`) and must tolerate calls for
//! links that have already been closed.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::ble::characteristics::ServiceDescriptor;
use crate::error::Result;
use crate::peripheral::PeripheralHandle;
use crate::utils;

/// Restricts which advertisements a scan reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report peripherals advertising one of these services.
    /// Empty means report everything.
    pub services: Vec<Uuid>,
}

impl ScanFilter {
    /// Filter on a set of advertised services.
    pub fn services(services: Vec<Uuid>) -> Self {
        Self { services }
    }
}

/// A single advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    /// Platform address or identifier.
    pub id: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

impl ScanRecord {
    /// Create a record for `id` with no name or rssi.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi: None,
        }
    }

    /// Set the advertised name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the signal strength.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }
}

/// Item produced by a scan stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A peripheral was seen (possibly again).
    Discovered(ScanRecord),
    /// The platform aborted the scan.
    Failed {
        /// Platform error code.
        code: i32,
    },
}

/// Notification event from a characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    /// UUID of the characteristic that sent the notification.
    pub characteristic_uuid: Uuid,
    /// The notification data.
    pub data: Bytes,
}

impl NotificationEvent {
    /// Create a notification event.
    pub fn new(characteristic_uuid: Uuid, data: impl Into<Bytes>) -> Self {
        Self {
            characteristic_uuid,
            data: data.into(),
        }
    }

    /// The payload decoded as UTF-8, if valid.
    pub fn as_text(&self) -> Option<String> {
        utils::payload_to_string(&self.data)
    }

    /// The payload decoded as UTF-8, replacing invalid sequences.
    pub fn as_text_lossy(&self) -> String {
        utils::payload_to_string_lossy(&self.data)
    }
}

/// Stream of scan results. Ends when the scan is stopped.
pub type ScanStream = BoxStream<'static, ScanEvent>;

/// Stream of notifications for one characteristic. Ends when the link closes.
pub type NotificationStream = BoxStream<'static, NotificationEvent>;

/// A live transport session returned by [`Transport::connect`].
pub struct Connection<L> {
    /// Handle used for every further call on this session.
    pub link: L,
    /// Resolves with a reason once the link is gone, whoever closed it.
    pub disconnected: BoxFuture<'static, String>,
}

impl<L: std::fmt::Debug> std::fmt::Debug for Connection<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("link", &self.link)
            .finish_non_exhaustive()
    }
}

/// Platform BLE operations used by the lifecycle manager.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Per-session handle.
    type Link: Clone + Send + Sync + std::fmt::Debug + 'static;

    /// Start scanning. Duplicate advertisements may be reported; the manager
    /// de-duplicates by id. Restarting requires `stop_scan` first.
    async fn start_scan(&self, filter: &ScanFilter) -> Result<ScanStream>;

    /// Stop an active scan. Stopping when idle is not an error.
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a peripheral. Resolves once the link is up or has failed,
    /// not when services are known.
    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Connection<Self::Link>>;

    /// Enumerate services and their characteristics.
    async fn discover_services(&self, link: &Self::Link) -> Result<Vec<ServiceDescriptor>>;

    /// Enable notifications for a characteristic.
    async fn subscribe(&self, link: &Self::Link, characteristic: Uuid)
        -> Result<NotificationStream>;

    /// Read a characteristic value.
    async fn read(&self, link: &Self::Link, characteristic: Uuid) -> Result<Bytes>;

    /// Write a characteristic value, waiting for the acknowledgement.
    async fn write(&self, link: &Self::Link, characteristic: Uuid, value: Bytes) -> Result<()>;

    /// Release the link. Idempotent; the session's `disconnected` future
    /// resolves afterwards if it had not already.
    async fn close(&self, link: &Self::Link);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_record_builder() {
        let record = ScanRecord::new("AA:BB").with_name("Sensor").with_rssi(-60);
        assert_eq!(record.id, "AA:BB");
        assert_eq!(record.name.as_deref(), Some("Sensor"));
        assert_eq!(record.rssi, Some(-60));
    }

    #[test]
    fn test_notification_text() {
        let event = NotificationEvent::new(Uuid::nil(), &b"42"[..]);
        assert_eq!(event.as_text().as_deref(), Some("42"));

        let event = NotificationEvent::new(Uuid::nil(), vec![0x34, 0xff]);
        assert_eq!(event.as_text(), None);
        assert_eq!(event.as_text_lossy(), "4\u{fffd}");
    }
}
