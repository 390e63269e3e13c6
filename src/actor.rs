//! The connection lifecycle actor.
//!
//! One task owns the connection state, the peripheral registry, the
//! discovered services and the active transport session. Caller commands
//! and transport completions reach it through two queues and are handled
//! one at a time. Transport calls are issued from short-lived tasks that
//! post their outcome back tagged with the session that issued them, so a
//! completion for a session that has since been torn down can be spotted
//! and ignored.

use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::characteristics::{self, CharacteristicProperties, ServiceDescriptor};
use crate::ble::connection::ConnectionState;
use crate::ble::transport::{Connection, NotificationEvent, ScanEvent, Transport};
use crate::config::LinkConfig;
use crate::dispatcher::NotificationDispatcher;
use crate::error::{Error, LinkFailure, Result};
use crate::link_manager::{LinkEvent, Snapshot};
use crate::peripheral::{PeripheralHandle, PeripheralRegistry};
use crate::reconnect::{DisconnectCause, ReconnectDecision};
use crate::utils;

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests from the [`LinkManager`](crate::LinkManager) handle.
pub(crate) enum Command {
    StartScan(Reply<()>),
    StopScan(Reply<()>),
    Connect { id: String, reply: Reply<()> },
    Disconnect(Reply<()>),
    Read { uuid: Uuid, reply: Reply<Bytes> },
    Write { uuid: Uuid, value: Bytes, reply: Reply<()> },
    Forget { id: String, reply: Reply<bool> },
    Shutdown(Reply<()>),
}

/// Identity of one connect attempt and the link it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Completions posted back by transport tasks.
enum TransportEvent<L> {
    Scan {
        generation: u64,
        event: ScanEvent,
    },
    Connected {
        session: SessionId,
        result: Result<Connection<L>>,
    },
    Discovered {
        session: SessionId,
        result: Result<Vec<ServiceDescriptor>>,
    },
    Subscribed {
        session: SessionId,
        uuid: Uuid,
        result: Result<()>,
    },
    Notification {
        session: SessionId,
        event: NotificationEvent,
    },
    ReadCompleted {
        session: SessionId,
        uuid: Uuid,
        result: Result<Bytes>,
        reply: Option<Reply<Bytes>>,
    },
    WriteCompleted {
        session: SessionId,
        uuid: Uuid,
        result: Result<()>,
        reply: Reply<()>,
    },
    LinkLost {
        session: SessionId,
        reason: String,
    },
    ReconnectDue {
        token: u64,
    },
}

/// The single live (or in-flight) connection.
struct ActiveConnection<L> {
    session: SessionId,
    peripheral: PeripheralHandle,
    /// Set once the transport reports the link is up.
    link: Option<L>,
    /// 0 for a caller-initiated connect, otherwise the automatic attempt number.
    attempt: u32,
    /// Disconnect watcher and notification forwarders for this session.
    tasks: Vec<JoinHandle<()>>,
}

struct ScanSession {
    generation: u64,
    task: JoinHandle<()>,
}

struct PendingReconnect {
    token: u64,
    peripheral: PeripheralHandle,
    attempt: u32,
    task: JoinHandle<()>,
}

pub(crate) struct LinkActor<T: Transport> {
    transport: Arc<T>,
    config: LinkConfig,
    state: ConnectionState,
    peripherals: PeripheralRegistry,
    services: Vec<ServiceDescriptor>,
    active: Option<ActiveConnection<T::Link>>,
    scan: Option<ScanSession>,
    /// Platform stop for the last scan, awaited before the next start.
    scan_stopping: Option<JoinHandle<()>>,
    reconnect: Option<PendingReconnect>,
    next_session: u64,
    next_scan: u64,
    next_timer: u64,
    events_tx: mpsc::UnboundedSender<TransportEvent<T::Link>>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent<T::Link>>,
    snapshot: Arc<RwLock<Snapshot>>,
    link_events: broadcast::Sender<LinkEvent>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl<T: Transport> LinkActor<T> {
    pub(crate) fn new(
        transport: T,
        config: LinkConfig,
        snapshot: Arc<RwLock<Snapshot>>,
        link_events: broadcast::Sender<LinkEvent>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            transport: Arc::new(transport),
            config,
            state: ConnectionState::Idle,
            peripherals: PeripheralRegistry::new(),
            services: Vec::new(),
            active: None,
            scan: None,
            scan_stopping: None,
            reconnect: None,
            next_session: 0,
            next_scan: 0,
            next_timer: 0,
            events_tx,
            events_rx,
            snapshot,
            link_events,
            dispatcher,
        }
    }

    /// Process commands and transport events until shut down.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("Link actor started");

        loop {
            tokio::select! {
                biased;
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.teardown();
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("Link manager handle dropped");
                        self.teardown();
                        break;
                    }
                }
            }
        }

        debug!("Link actor stopped");
    }

    // === Commands ===

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScan(reply) => {
                let _ = reply.send(self.start_scan());
            }
            Command::StopScan(reply) => {
                let _ = reply.send(self.stop_scan());
            }
            Command::Connect { id, reply } => {
                let _ = reply.send(self.connect(&id));
            }
            Command::Disconnect(reply) => {
                self.disconnect();
                let _ = reply.send(Ok(()));
            }
            Command::Read { uuid, reply } => match self.ready_link(&uuid, "read") {
                Ok((session, link)) => self.spawn_read(session, link, uuid, Some(reply)),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Write { uuid, value, reply } => match self.ready_link(&uuid, "write") {
                Ok((session, link)) => self.spawn_write(session, link, uuid, value, reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Forget { id, reply } => {
                let removed = self.peripherals.forget(&id);
                if removed {
                    debug!("Forgot peripheral {}", id);
                    self.refresh_snapshot();
                    self.publish_peripherals();
                }
                let _ = reply.send(Ok(removed));
            }
            Command::Shutdown(_) => unreachable!("shutdown is handled by the run loop"),
        }
    }

    fn start_scan(&mut self) -> Result<()> {
        let restart = match self.state {
            ConnectionState::Idle => false,
            ConnectionState::Scanning => true,
            state => {
                return Err(Error::InvalidState {
                    operation: "start scan",
                    state,
                })
            }
        };

        self.stop_scan_task();
        let previous_stop = self.scan_stopping.take();

        self.peripherals.clear();
        self.next_scan += 1;
        let generation = self.next_scan;

        info!("Starting BLE scan (generation {})", generation);

        let transport = self.transport.clone();
        let filter = self.config.scan_filter();
        let events_tx = self.events_tx.clone();

        let task = tokio::spawn(async move {
            // The platform rejects a start while the previous stop is in flight.
            if let Some(stop) = previous_stop {
                let _ = stop.await;
            }

            let mut stream = match transport.start_scan(&filter).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to start scan: {}", e);
                    let event = ScanEvent::Failed { code: e.scan_code() };
                    let _ = events_tx.send(TransportEvent::Scan { generation, event });
                    return;
                }
            };

            while let Some(event) = stream.next().await {
                if events_tx
                    .send(TransportEvent::Scan { generation, event })
                    .is_err()
                {
                    break;
                }
            }

            debug!("Scan stream ended");
        });

        self.scan = Some(ScanSession { generation, task });

        if restart {
            self.refresh_snapshot();
        } else {
            self.transition(ConnectionState::Scanning, None);
        }
        self.publish_peripherals();

        Ok(())
    }

    fn stop_scan(&mut self) -> Result<()> {
        if self.state != ConnectionState::Scanning {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        self.stop_scan_task();
        self.transition(ConnectionState::Idle, None);
        Ok(())
    }

    fn connect(&mut self, id: &str) -> Result<()> {
        match self.state {
            ConnectionState::Scanning => {}
            ConnectionState::Connecting | ConnectionState::Discovering => {
                return Err(Error::ConnectionInProgress)
            }
            state => {
                return Err(Error::InvalidState {
                    operation: "connect",
                    state,
                })
            }
        }

        let peripheral = self
            .peripherals
            .get(id)
            .cloned()
            .ok_or_else(|| Error::PeripheralNotFound {
                identifier: id.to_string(),
            })?;

        self.stop_scan_task();
        self.begin_connect(peripheral, 0);
        Ok(())
    }

    fn disconnect(&mut self) {
        info!("Disconnect requested in state {}", self.state);

        self.cancel_reconnect();
        self.stop_scan_task();
        self.teardown_active();
        self.transition(ConnectionState::Idle, None);
    }

    fn teardown(&mut self) {
        self.disconnect();
        self.peripherals.clear();
        self.refresh_snapshot();
    }

    /// Session and link for an operation on `uuid`, if the link is Ready and
    /// the characteristic supports `operation`.
    fn ready_link(&self, uuid: &Uuid, operation: &str) -> Result<(SessionId, T::Link)> {
        if !self.state.is_ready() {
            return Err(Error::NotConnected);
        }

        let characteristic = characteristics::find_characteristic(&self.services, uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })?;

        let supported = match operation {
            "read" => characteristic.properties.read,
            "write" => characteristic.properties.write,
            _ => false,
        };
        if !supported {
            return Err(Error::NotSupported {
                operation: format!(
                    "{} on {} ({})",
                    operation, uuid, characteristic.properties
                ),
            });
        }

        match &self.active {
            Some(ActiveConnection {
                session,
                link: Some(link),
                ..
            }) => Ok((*session, link.clone())),
            _ => Err(Error::NotConnected),
        }
    }

    // === Transport events ===

    fn handle_event(&mut self, event: TransportEvent<T::Link>) {
        match event {
            TransportEvent::Scan { generation, event } => self.on_scan(generation, event),
            TransportEvent::Connected { session, result } => self.on_connected(session, result),
            TransportEvent::Discovered { session, result } => self.on_discovered(session, result),
            TransportEvent::Subscribed {
                session,
                uuid,
                result,
            } => self.on_subscribed(session, uuid, result),
            TransportEvent::Notification { session, event } => {
                self.on_notification(session, event)
            }
            TransportEvent::ReadCompleted {
                session,
                uuid,
                result,
                reply,
            } => self.on_read(session, uuid, result, reply),
            TransportEvent::WriteCompleted {
                session,
                uuid,
                result,
                reply,
            } => self.on_write(session, uuid, result, reply),
            TransportEvent::LinkLost { session, reason } => self.on_link_lost(session, reason),
            TransportEvent::ReconnectDue { token } => self.on_reconnect_due(token),
        }
    }

    fn on_scan(&mut self, generation: u64, event: ScanEvent) {
        let current = self.scan.as_ref().map(|s| s.generation) == Some(generation);
        if !current || self.state != ConnectionState::Scanning {
            trace!("Ignoring scan event from generation {}", generation);
            return;
        }

        match event {
            ScanEvent::Discovered(record) => {
                let id = record.id.clone();
                let observation = self.peripherals.observe(record);
                self.refresh_snapshot();

                if observation.changes_list() {
                    debug!("Peripheral list changed ({:?}): {}", observation, id);
                    self.publish_peripherals();
                }
            }
            ScanEvent::Failed { code } => {
                self.stop_scan_task();
                self.transition(ConnectionState::Idle, Some(LinkFailure::Scan { code }));
            }
        }
    }

    fn on_connected(&mut self, session: SessionId, result: Result<Connection<T::Link>>) {
        if !self.is_current(session) || self.state != ConnectionState::Connecting {
            match result {
                Ok(connection) => {
                    debug!("Closing link from superseded session {}", session);
                    self.spawn_close(connection.link);
                }
                Err(e) => trace!("Ignoring failure from superseded session {}: {}", session, e),
            }
            return;
        }

        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                let failure = LinkFailure::Connect {
                    reason: e.to_string(),
                };
                let automatic = self.active.as_ref().map_or(false, |a| a.attempt > 0);
                self.fail_connection(failure, automatic);
                return;
            }
        };

        let Connection { link, disconnected } = connection;
        let events_tx = self.events_tx.clone();
        let watcher = tokio::spawn(async move {
            let reason = disconnected.await;
            let _ = events_tx.send(TransportEvent::LinkLost { session, reason });
        });

        if let Some(active) = self.active.as_mut() {
            info!("Connected to {} (session {})", active.peripheral, session);
            active.link = Some(link.clone());
            active.tasks.push(watcher);
        }

        self.transition(ConnectionState::Discovering, None);

        let transport = self.transport.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = transport.discover_services(&link).await;
            let _ = events_tx.send(TransportEvent::Discovered { session, result });
        });
    }

    fn on_discovered(&mut self, session: SessionId, result: Result<Vec<ServiceDescriptor>>) {
        if !self.is_current(session) || self.state != ConnectionState::Discovering {
            trace!("Ignoring discovery result from session {}", session);
            return;
        }

        let services = match result {
            Ok(services) => services,
            Err(e) => {
                let failure = LinkFailure::Discovery {
                    reason: e.to_string(),
                };
                let automatic = self.active.as_ref().map_or(false, |a| a.attempt > 0);
                self.fail_connection(failure, automatic);
                return;
            }
        };

        debug!(
            "Discovered {} services, {} characteristics",
            services.len(),
            services.iter().map(|s| s.characteristics.len()).sum::<usize>()
        );

        if let Some(active) = self.active.as_mut() {
            // Reaching Ready ends the reconnect chain.
            active.attempt = 0;
        }

        self.services = services;
        self.transition(ConnectionState::Ready, None);
        self.start_primary(session);
    }

    /// Subscribe to and read the configured primary characteristic.
    fn start_primary(&mut self, session: SessionId) {
        let service_uuid = self.config.primary_service_uuid;
        let uuid = self.config.primary_characteristic_uuid;

        let properties: CharacteristicProperties =
            match characteristics::find_in_service(&self.services, &service_uuid, &uuid) {
                Some(c) => c.properties,
                None => {
                    warn!(
                        "Primary characteristic {} not found in service {}",
                        uuid, service_uuid
                    );
                    return;
                }
            };

        let Some(link) = self.active.as_ref().and_then(|a| a.link.clone()) else {
            return;
        };

        if properties.notify {
            let transport = self.transport.clone();
            let events_tx = self.events_tx.clone();
            let link = link.clone();

            let forwarder = tokio::spawn(async move {
                let mut stream = match transport.subscribe(&link, uuid).await {
                    Ok(stream) => {
                        let _ = events_tx.send(TransportEvent::Subscribed {
                            session,
                            uuid,
                            result: Ok(()),
                        });
                        stream
                    }
                    Err(e) => {
                        let _ = events_tx.send(TransportEvent::Subscribed {
                            session,
                            uuid,
                            result: Err(e),
                        });
                        return;
                    }
                };

                while let Some(event) = stream.next().await {
                    if events_tx
                        .send(TransportEvent::Notification { session, event })
                        .is_err()
                    {
                        break;
                    }
                }
            });

            if let Some(active) = self.active.as_mut() {
                active.tasks.push(forwarder);
            }
        } else {
            debug!("Primary characteristic {} does not notify", uuid);
        }

        if properties.read {
            self.spawn_read(session, link, uuid, None);
        }
    }

    fn on_subscribed(&mut self, session: SessionId, uuid: Uuid, result: Result<()>) {
        if !self.is_current(session) {
            return;
        }

        match result {
            Ok(()) => debug!("Subscribed to notifications from {}", uuid),
            Err(e) => {
                let failure = LinkFailure::Subscribe {
                    uuid,
                    reason: e.to_string(),
                };
                warn!("{}", failure);
                self.publish(LinkEvent::Failure(failure));
            }
        }
    }

    fn on_notification(&mut self, session: SessionId, event: NotificationEvent) {
        if !self.is_current(session) || !self.state.is_ready() {
            trace!(
                "Dropping notification from {} received while {}",
                event.characteristic_uuid,
                self.state
            );
            return;
        }

        debug!(
            "Notification from {}: {}",
            event.characteristic_uuid,
            utils::payload_to_hex(&event.data)
        );

        characteristics::record_value(&mut self.services, &event.characteristic_uuid, &event.data);
        self.refresh_snapshot();
        self.dispatcher.dispatch(event);
    }

    fn on_read(
        &mut self,
        session: SessionId,
        uuid: Uuid,
        result: Result<Bytes>,
        reply: Option<Reply<Bytes>>,
    ) {
        if !self.is_current(session) || !self.state.is_ready() {
            trace!("Ignoring read of {} from session {}", uuid, session);
            if let Some(reply) = reply {
                let _ = reply.send(Err(Error::NotConnected));
            }
            return;
        }

        let result = match result {
            Ok(value) => {
                debug!("Read {} bytes from {}", value.len(), uuid);
                characteristics::record_value(&mut self.services, &uuid, &value);
                self.refresh_snapshot();
                self.publish(LinkEvent::CharacteristicRead {
                    uuid,
                    value: value.clone(),
                });
                Ok(value)
            }
            Err(e) => {
                let failure = LinkFailure::Read {
                    uuid,
                    reason: e.to_string(),
                };
                warn!("{}", failure);
                self.publish(LinkEvent::Failure(failure.clone()));
                Err(Error::Link(failure))
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn on_write(&mut self, session: SessionId, uuid: Uuid, result: Result<()>, reply: Reply<()>) {
        if !self.is_current(session) || !self.state.is_ready() {
            trace!("Ignoring write to {} from session {}", uuid, session);
            let _ = reply.send(Err(Error::NotConnected));
            return;
        }

        let result = match result {
            Ok(()) => {
                trace!("Write to {} acknowledged", uuid);
                self.publish(LinkEvent::CharacteristicWritten { uuid });
                Ok(())
            }
            Err(e) => {
                let failure = LinkFailure::Write {
                    uuid,
                    reason: e.to_string(),
                };
                warn!("{}", failure);
                self.publish(LinkEvent::Failure(failure.clone()));
                Err(Error::Link(failure))
            }
        };

        let _ = reply.send(result);
    }

    fn on_link_lost(&mut self, session: SessionId, reason: String) {
        if !self.is_current(session) {
            trace!("Ignoring disconnect of superseded session {}", session);
            return;
        }

        if !matches!(
            self.state,
            ConnectionState::Discovering | ConnectionState::Ready
        ) {
            trace!("Ignoring disconnect while {}", self.state);
            return;
        }

        warn!("Link lost in state {}: {}", self.state, reason);
        self.fail_connection(LinkFailure::UnsolicitedDisconnect { reason }, true);
    }

    fn on_reconnect_due(&mut self, token: u64) {
        let due = self.reconnect.as_ref().map(|r| r.token) == Some(token)
            && self.state == ConnectionState::ReconnectPending;
        if !due {
            trace!("Ignoring cancelled reconnect timer {}", token);
            return;
        }

        if let Some(pending) = self.reconnect.take() {
            info!(
                "Reconnecting to {} (attempt {})",
                pending.peripheral, pending.attempt
            );
            self.begin_connect(pending.peripheral, pending.attempt);
        }
    }

    // === Lifecycle helpers ===

    fn begin_connect(&mut self, peripheral: PeripheralHandle, attempt: u32) {
        self.next_session += 1;
        let session = SessionId(self.next_session);

        info!("Connecting to {} (session {})", peripheral, session);

        let transport = self.transport.clone();
        let events_tx = self.events_tx.clone();
        let target = peripheral.clone();
        tokio::spawn(async move {
            let result = transport.connect(&target).await;
            let _ = events_tx.send(TransportEvent::Connected { session, result });
        });

        self.active = Some(ActiveConnection {
            session,
            peripheral,
            link: None,
            attempt,
            tasks: Vec::new(),
        });
        self.transition(ConnectionState::Connecting, None);
    }

    /// Tear down the active connection after a failure and settle into
    /// ReconnectPending or Idle.
    fn fail_connection(&mut self, failure: LinkFailure, eligible: bool) {
        let previous = self.state;
        let Some(active) = self.teardown_active() else {
            return;
        };

        self.transition(ConnectionState::Disconnected, Some(failure));

        let decision = if eligible {
            self.config
                .reconnect
                .decide(previous, DisconnectCause::Unsolicited, active.attempt)
        } else {
            ReconnectDecision::Stop
        };

        match decision {
            ReconnectDecision::Reconnect { delay, attempt } => {
                self.schedule_reconnect(active.peripheral, attempt, delay)
            }
            ReconnectDecision::Stop => {
                if eligible {
                    info!("Reconnect policy exhausted for {}", active.peripheral);
                }
                self.transition(ConnectionState::Idle, None);
            }
        }
    }

    fn schedule_reconnect(&mut self, peripheral: PeripheralHandle, attempt: u32, delay: Duration) {
        self.next_timer += 1;
        let token = self.next_timer;

        info!(
            "Reconnect attempt {} to {} in {:?}",
            attempt, peripheral, delay
        );

        let events_tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(TransportEvent::ReconnectDue { token });
        });

        let peripheral_id = peripheral.id.clone();
        self.reconnect = Some(PendingReconnect {
            token,
            peripheral,
            attempt,
            task,
        });
        self.transition(ConnectionState::ReconnectPending, None);

        self.publish(LinkEvent::ReconnectScheduled {
            peripheral_id,
            attempt,
            delay,
        });
    }

    fn cancel_reconnect(&mut self) {
        if let Some(pending) = self.reconnect.take() {
            debug!("Cancelling reconnect to {}", pending.peripheral);
            pending.task.abort();
        }
    }

    fn stop_scan_task(&mut self) {
        if let Some(scan) = self.scan.take() {
            debug!("Stopping BLE scan (generation {})", scan.generation);
            scan.task.abort();

            let transport = self.transport.clone();
            self.scan_stopping = Some(tokio::spawn(async move {
                if let Err(e) = transport.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
            }));
        }
    }

    /// Drop the active connection, closing its link and stopping its tasks.
    fn teardown_active(&mut self) -> Option<ActiveConnection<T::Link>> {
        let mut active = self.active.take()?;

        for task in active.tasks.drain(..) {
            task.abort();
        }
        if let Some(link) = active.link.take() {
            self.spawn_close(link);
        }
        self.services.clear();

        Some(active)
    }

    fn spawn_close(&self, link: T::Link) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            transport.close(&link).await;
        });
    }

    fn spawn_read(
        &self,
        session: SessionId,
        link: T::Link,
        uuid: Uuid,
        reply: Option<Reply<Bytes>>,
    ) {
        let transport = self.transport.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = transport.read(&link, uuid).await;
            let _ = events_tx.send(TransportEvent::ReadCompleted {
                session,
                uuid,
                result,
                reply,
            });
        });
    }

    fn spawn_write(
        &self,
        session: SessionId,
        link: T::Link,
        uuid: Uuid,
        value: Bytes,
        reply: Reply<()>,
    ) {
        let transport = self.transport.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = transport.write(&link, uuid, value).await;
            let _ = events_tx.send(TransportEvent::WriteCompleted {
                session,
                uuid,
                result,
                reply,
            });
        });
    }

    fn is_current(&self, session: SessionId) -> bool {
        self.active.as_ref().map(|a| a.session) == Some(session)
    }

    // === Observation ===

    /// Move to `next` if it is a legal edge, publishing the change.
    fn transition(&mut self, next: ConnectionState, failure: Option<LinkFailure>) {
        let previous = self.state;
        if previous == next {
            return;
        }

        if !previous.can_transition_to(next) {
            error!("Refusing invalid transition {} -> {}", previous, next);
            return;
        }

        self.state = next;
        if next != ConnectionState::Ready {
            self.services.clear();
        }

        match &failure {
            Some(f) => warn!("Connection state changed: {} -> {} ({})", previous, next, f),
            None => info!("Connection state changed: {} -> {}", previous, next),
        }

        self.refresh_snapshot();
        self.publish(LinkEvent::StateChanged {
            from: previous,
            to: next,
            failure,
        });

        if previous == ConnectionState::Ready || next == ConnectionState::Ready {
            self.publish(LinkEvent::ServicesChanged {
                services: self.services.clone(),
            });
        }
    }

    fn refresh_snapshot(&self) {
        let active = self
            .active
            .as_ref()
            .map(|a| a.peripheral.clone())
            .or_else(|| self.reconnect.as_ref().map(|r| r.peripheral.clone()));

        let mut snapshot = self.snapshot.write();
        snapshot.state = self.state;
        snapshot.peripherals = self.peripherals.snapshot();
        snapshot.services = self.services.clone();
        snapshot.active_peripheral = active;
    }

    fn publish_peripherals(&self) {
        self.publish(LinkEvent::PeripheralsChanged {
            peripherals: self.peripherals.snapshot(),
        });
    }

    fn publish(&self, event: LinkEvent) {
        let _ = self.link_events.send(event);
    }
}
