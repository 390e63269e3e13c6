//! Scriptable in-memory transport for testing.
//!
//! [`MockTransport`] implements [`Transport`] without any Bluetooth
//! hardware. Tests drive it from the outside: advertise peripherals, inject
//! failures, push notifications and drop links, then inspect the calls the
//! manager made.
//!
//! # Features
//!
//! - **Failure injection**: fail the next scan, connect, discovery, read,
//!   write or subscribe
//! - **Latency simulation**: delay connects and reads (works with paused
//!   tokio time)
//! - **Call log**: every transport call in the order it was made
//!
//! ```
//! use ble_link::mock::MockTransport;
//! use ble_link::{LinkConfig, LinkManager};
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = MockTransport::new();
//!     let manager = LinkManager::new(transport.clone(), LinkConfig::default()).unwrap();
//!     manager.start_scan().await.unwrap();
//! }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::future::FutureExt;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;
use uuid::Uuid;

use crate::ble::characteristics::{
    CharacteristicDescriptor, CharacteristicProperties, ServiceDescriptor,
};
use crate::ble::transport::{
    Connection, NotificationEvent, NotificationStream, ScanEvent, ScanFilter, ScanRecord,
    ScanStream, Transport,
};
use crate::ble::uuids::{DEFAULT_PRIMARY_CHARACTERISTIC_UUID, DEFAULT_PRIMARY_SERVICE_UUID};
use crate::error::{Error, LinkFailure, Result};
use crate::peripheral::PeripheralHandle;

/// Link handle issued by [`MockTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockLink {
    /// Sequence number of the connect that created it, from 1.
    pub id: u64,
}

/// A call made on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `start_scan`
    StartScan(ScanFilter),
    /// `stop_scan`
    StopScan,
    /// `connect` with the peripheral id.
    Connect(String),
    /// `discover_services`
    DiscoverServices(MockLink),
    /// `subscribe`
    Subscribe(MockLink, Uuid),
    /// `read`
    Read(MockLink, Uuid),
    /// `write`
    Write(MockLink, Uuid, Bytes),
    /// `close`
    Close(MockLink),
}

struct LiveLink {
    peripheral_id: String,
    disconnect_tx: Option<oneshot::Sender<String>>,
    subscriptions: Vec<(Uuid, mpsc::UnboundedSender<NotificationEvent>)>,
}

struct MockState {
    calls: Vec<TransportCall>,
    scan_tx: Option<mpsc::UnboundedSender<ScanEvent>>,
    scan_start_failure: Option<i32>,
    connect_latency: Duration,
    discovery_latency: Duration,
    read_latency: Duration,
    connect_failures: VecDeque<String>,
    discovery_failures: VecDeque<String>,
    subscribe_failures: VecDeque<String>,
    read_failures: VecDeque<String>,
    write_failures: VecDeque<String>,
    services: Vec<ServiceDescriptor>,
    values: HashMap<Uuid, Bytes>,
    links: HashMap<u64, LiveLink>,
    // Streams of dropped links stay open until their consumer drops them.
    orphaned: Vec<(Uuid, mpsc::UnboundedSender<NotificationEvent>)>,
    next_link: u64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            scan_tx: None,
            scan_start_failure: None,
            connect_latency: Duration::ZERO,
            discovery_latency: Duration::ZERO,
            read_latency: Duration::ZERO,
            connect_failures: VecDeque::new(),
            discovery_failures: VecDeque::new(),
            subscribe_failures: VecDeque::new(),
            read_failures: VecDeque::new(),
            write_failures: VecDeque::new(),
            services: MockTransport::default_services(),
            values: HashMap::new(),
            links: HashMap::new(),
            orphaned: Vec::new(),
            next_link: 0,
        }
    }
}

/// In-memory [`Transport`]. Clones share state.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockTransport")
            .field("scanning", &state.scan_tx.is_some())
            .field("live_links", &state.links.len())
            .field("calls", &state.calls.len())
            .finish()
    }
}

fn transport_error(reason: String) -> Error {
    Error::Bluetooth(btleplug::Error::Other(reason.into()))
}

impl MockTransport {
    /// Create a transport offering [`default_services`](Self::default_services).
    pub fn new() -> Self {
        Self::default()
    }

    /// The primary service with one read/write/notify characteristic.
    pub fn default_services() -> Vec<ServiceDescriptor> {
        vec![ServiceDescriptor::new(
            DEFAULT_PRIMARY_SERVICE_UUID,
            vec![CharacteristicDescriptor::new(
                DEFAULT_PRIMARY_CHARACTERISTIC_UUID,
                CharacteristicProperties::ALL,
            )],
        )]
    }

    // === Scripting ===

    /// Report an advertisement on the running scan. Returns false if no scan
    /// is running.
    pub fn advertise(&self, record: ScanRecord) -> bool {
        self.send_scan(ScanEvent::Discovered(record))
    }

    /// Abort the running scan with a platform code.
    pub fn fail_scan(&self, code: i32) -> bool {
        let sent = self.send_scan(ScanEvent::Failed { code });
        self.state.lock().scan_tx = None;
        sent
    }

    /// Make the next `start_scan` fail with `code`.
    pub fn fail_next_scan_start(&self, code: i32) {
        self.state.lock().scan_start_failure = Some(code);
    }

    /// Delay before each connect resolves.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.state.lock().connect_latency = latency;
    }

    /// Delay before each service discovery resolves. The result is
    /// delivered even if the link was closed in the meantime.
    pub fn set_discovery_latency(&self, latency: Duration) {
        self.state.lock().discovery_latency = latency;
    }

    /// Delay before each read resolves.
    pub fn set_read_latency(&self, latency: Duration) {
        self.state.lock().read_latency = latency;
    }

    /// Make the next connect fail. Queued failures are used in order.
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.state.lock().connect_failures.push_back(reason.into());
    }

    /// Make the next service discovery fail.
    pub fn fail_next_discovery(&self, reason: impl Into<String>) {
        self.state.lock().discovery_failures.push_back(reason.into());
    }

    /// Make the next subscribe fail.
    pub fn fail_next_subscribe(&self, reason: impl Into<String>) {
        self.state.lock().subscribe_failures.push_back(reason.into());
    }

    /// Make the next read fail.
    pub fn fail_next_read(&self, reason: impl Into<String>) {
        self.state.lock().read_failures.push_back(reason.into());
    }

    /// Make the next write fail.
    pub fn fail_next_write(&self, reason: impl Into<String>) {
        self.state.lock().write_failures.push_back(reason.into());
    }

    /// Services reported by discovery.
    pub fn set_services(&self, services: Vec<ServiceDescriptor>) {
        self.state.lock().services = services;
    }

    /// Value returned by reads of `uuid`. Writes also update it.
    pub fn set_read_value(&self, uuid: Uuid, value: impl Into<Bytes>) {
        self.state.lock().values.insert(uuid, value.into());
    }

    /// Push a notification to every open subscription of `uuid`. Returns
    /// how many subscriptions received it.
    ///
    /// Subscriptions of a dropped link still receive notifications until
    /// the consumer drops the stream, the way a platform stack may flush
    /// queued notifications after reporting the disconnect.
    pub fn notify(&self, uuid: Uuid, data: impl Into<Bytes>) -> usize {
        let event = NotificationEvent::new(uuid, data);
        let mut state = self.state.lock();
        let state = &mut *state;

        state.orphaned.retain(|(_, tx)| !tx.is_closed());
        for link in state.links.values_mut() {
            link.subscriptions.retain(|(_, tx)| !tx.is_closed());
        }

        state
            .links
            .values()
            .flat_map(|link| link.subscriptions.iter())
            .chain(state.orphaned.iter())
            .filter(|(subscribed, tx)| {
                *subscribed == uuid && tx.unbounded_send(event.clone()).is_ok()
            })
            .count()
    }

    /// Drop every live link as if the peripheral went away. Returns how many
    /// links were dropped.
    pub fn drop_link(&self, reason: impl Into<String>) -> usize {
        let reason = reason.into();
        let links: Vec<LiveLink> = {
            let mut state = self.state.lock();
            let links: Vec<LiveLink> = state.links.drain().map(|(_, l)| l).collect();
            for link in &links {
                state.orphaned.extend(link.subscriptions.iter().cloned());
            }
            links
        };
        let dropped = links.len();

        for mut link in links {
            trace!("Dropping mock link to {}", link.peripheral_id);
            if let Some(tx) = link.disconnect_tx.take() {
                let _ = tx.send(reason.clone());
            }
        }
        dropped
    }

    // === Inspection ===

    /// Every call made so far, oldest first.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    /// Forget the recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of `connect` calls made so far.
    pub fn connect_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, TransportCall::Connect(_)))
            .count()
    }

    /// Number of links opened and not yet closed or dropped.
    pub fn live_links(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Check if a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.state
            .lock()
            .scan_tx
            .as_ref()
            .map_or(false, |tx| !tx.is_closed())
    }

    fn send_scan(&self, event: ScanEvent) -> bool {
        match &self.state.lock().scan_tx {
            Some(tx) => tx.unbounded_send(event).is_ok(),
            None => false,
        }
    }

    fn record(&self, call: TransportCall) {
        trace!("Mock transport call: {:?}", call);
        self.state.lock().calls.push(call);
    }

    fn ensure_live(&self, link: &MockLink) -> Result<()> {
        if self.state.lock().links.contains_key(&link.id) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Link = MockLink;

    async fn start_scan(&self, filter: &ScanFilter) -> Result<ScanStream> {
        self.record(TransportCall::StartScan(filter.clone()));

        let mut state = self.state.lock();
        if let Some(code) = state.scan_start_failure.take() {
            return Err(LinkFailure::Scan { code }.into());
        }

        let (tx, rx) = mpsc::unbounded();
        state.scan_tx = Some(tx);
        Ok(rx.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(TransportCall::StopScan);
        self.state.lock().scan_tx = None;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Connection<MockLink>> {
        self.record(TransportCall::Connect(peripheral.id.clone()));

        let latency = self.state.lock().connect_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if let Some(reason) = state.connect_failures.pop_front() {
            return Err(transport_error(reason));
        }

        state.next_link += 1;
        let link = MockLink {
            id: state.next_link,
        };

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        state.links.insert(
            link.id,
            LiveLink {
                peripheral_id: peripheral.id.clone(),
                disconnect_tx: Some(disconnect_tx),
                subscriptions: Vec::new(),
            },
        );

        let disconnected = async move {
            disconnect_rx
                .await
                .unwrap_or_else(|_| "mock link released".to_string())
        }
        .boxed();

        Ok(Connection { link, disconnected })
    }

    async fn discover_services(&self, link: &MockLink) -> Result<Vec<ServiceDescriptor>> {
        self.record(TransportCall::DiscoverServices(*link));
        self.ensure_live(link)?;

        let latency = self.state.lock().discovery_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if let Some(reason) = state.discovery_failures.pop_front() {
            return Err(transport_error(reason));
        }
        Ok(state.services.clone())
    }

    async fn subscribe(&self, link: &MockLink, characteristic: Uuid) -> Result<NotificationStream> {
        self.record(TransportCall::Subscribe(*link, characteristic));

        let mut state = self.state.lock();
        if let Some(reason) = state.subscribe_failures.pop_front() {
            return Err(transport_error(reason));
        }

        let live = state.links.get_mut(&link.id).ok_or(Error::NotConnected)?;
        let (tx, rx) = mpsc::unbounded();
        live.subscriptions.push((characteristic, tx));
        Ok(rx.boxed())
    }

    async fn read(&self, link: &MockLink, characteristic: Uuid) -> Result<Bytes> {
        self.record(TransportCall::Read(*link, characteristic));

        let latency = self.state.lock().read_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.ensure_live(link)?;

        let mut state = self.state.lock();
        if let Some(reason) = state.read_failures.pop_front() {
            return Err(transport_error(reason));
        }
        Ok(state.values.get(&characteristic).cloned().unwrap_or_default())
    }

    async fn write(&self, link: &MockLink, characteristic: Uuid, value: Bytes) -> Result<()> {
        self.record(TransportCall::Write(*link, characteristic, value.clone()));
        self.ensure_live(link)?;

        let mut state = self.state.lock();
        if let Some(reason) = state.write_failures.pop_front() {
            return Err(transport_error(reason));
        }
        state.values.insert(characteristic, value);
        Ok(())
    }

    async fn close(&self, link: &MockLink) {
        self.record(TransportCall::Close(*link));

        let removed = self.state.lock().links.remove(&link.id);
        if let Some(mut live) = removed {
            if let Some(tx) = live.disconnect_tx.take() {
                let _ = tx.send("closed locally".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_scan_stream_receives_advertisements() {
        let transport = MockTransport::new();
        assert!(!transport.advertise(ScanRecord::new("P1")));

        let mut stream = transport.start_scan(&ScanFilter::default()).await.unwrap();
        assert!(transport.advertise(ScanRecord::new("P1")));
        assert_eq!(
            stream.next().await,
            Some(ScanEvent::Discovered(ScanRecord::new("P1")))
        );

        transport.stop_scan().await.unwrap();
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_close_resolves_disconnected() {
        let transport = MockTransport::new();
        let connection = transport
            .connect(&PeripheralHandle::new("P1"))
            .await
            .unwrap();
        assert_eq!(transport.live_links(), 1);

        transport.close(&connection.link).await;
        assert_eq!(connection.disconnected.await, "closed locally");
        assert_eq!(transport.live_links(), 0);
    }

    #[tokio::test]
    async fn test_drop_link_resolves_disconnected_with_reason() {
        let transport = MockTransport::new();
        let connection = transport
            .connect(&PeripheralHandle::new("P1"))
            .await
            .unwrap();

        transport.drop_link("out of range");
        assert_eq!(connection.disconnected.await, "out of range");
        assert!(transport.read(&connection.link, Uuid::nil()).await.is_err());
    }

    #[tokio::test]
    async fn test_failures_are_consumed_in_order() {
        let transport = MockTransport::new();
        transport.fail_next_connect("first");
        transport.fail_next_connect("second");

        let handle = PeripheralHandle::new("P1");
        assert!(transport.connect(&handle).await.is_err());
        assert!(transport.connect(&handle).await.is_err());
        assert!(transport.connect(&handle).await.is_ok());
        assert_eq!(transport.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_notify_reaches_matching_subscription() {
        let transport = MockTransport::new();
        let connection = transport
            .connect(&PeripheralHandle::new("P1"))
            .await
            .unwrap();
        let uuid = DEFAULT_PRIMARY_CHARACTERISTIC_UUID;

        let mut stream = transport.subscribe(&connection.link, uuid).await.unwrap();
        assert_eq!(transport.notify(Uuid::nil(), &b"x"[..]), 0);
        assert_eq!(transport.notify(uuid, &b"42"[..]), 1);

        let event = stream.next().await.unwrap();
        assert_eq!(event.as_text().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_dropped_link_stream_stays_open_until_released() {
        let transport = MockTransport::new();
        let connection = transport
            .connect(&PeripheralHandle::new("P1"))
            .await
            .unwrap();
        let uuid = DEFAULT_PRIMARY_CHARACTERISTIC_UUID;
        let mut stream = transport.subscribe(&connection.link, uuid).await.unwrap();

        assert_eq!(transport.drop_link("gone"), 1);
        assert_eq!(transport.notify(uuid, &b"late"[..]), 1);
        assert_eq!(stream.next().await.unwrap().as_text().as_deref(), Some("late"));

        drop(stream);
        assert_eq!(transport.notify(uuid, &b"later"[..]), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_latency_outlives_close() {
        let transport = MockTransport::new();
        transport.set_discovery_latency(Duration::from_secs(1));
        let connection = transport
            .connect(&PeripheralHandle::new("P1"))
            .await
            .unwrap();

        let discovery = {
            let transport = transport.clone();
            let link = connection.link;
            tokio::spawn(async move { transport.discover_services(&link).await })
        };
        tokio::task::yield_now().await;
        transport.close(&connection.link).await;

        let services = discovery.await.unwrap().unwrap();
        assert_eq!(services, MockTransport::default_services());
        assert_eq!(transport.live_links(), 0);
    }
}
