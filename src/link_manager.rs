//! The public handle to the connection lifecycle.
//!
//! [`LinkManager`] is cheap to query: state, peripherals and services are
//! read from a snapshot the actor keeps current. Commands are queued to the
//! actor and resolve once it has accepted or rejected them, which is not the
//! same as the operation having finished. Progress is reported through
//! [`LinkEvent`]s.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actor::{Command, LinkActor, Reply};
use crate::ble::characteristics::{self, CharacteristicDescriptor, ServiceDescriptor};
use crate::ble::connection::ConnectionState;
use crate::ble::platform::BtleplugTransport;
use crate::ble::transport::{NotificationEvent, Transport};
use crate::config::LinkConfig;
use crate::dispatcher::{CallbackHandle, NotificationDispatcher, NotificationObserver};
use crate::error::{Error, LinkFailure, Result};
use crate::peripheral::PeripheralHandle;

/// Something observers may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The connection state changed.
    StateChanged {
        /// State before the change.
        from: ConnectionState,
        /// State after the change.
        to: ConnectionState,
        /// The failure that caused the change, if any.
        failure: Option<LinkFailure>,
    },
    /// A peripheral was added, renamed or removed, or the list was cleared.
    PeripheralsChanged {
        /// Current list in first-seen order.
        peripherals: Vec<PeripheralHandle>,
    },
    /// Services became available or were cleared.
    ServicesChanged {
        /// Current services. Empty unless Ready.
        services: Vec<ServiceDescriptor>,
    },
    /// A characteristic read completed.
    CharacteristicRead {
        /// Characteristic that was read.
        uuid: Uuid,
        /// Value read.
        value: Bytes,
    },
    /// A characteristic write was acknowledged.
    CharacteristicWritten {
        /// Characteristic that was written.
        uuid: Uuid,
    },
    /// A failure that did not change the connection state.
    Failure(LinkFailure),
    /// An automatic reconnect attempt has been scheduled.
    ReconnectScheduled {
        /// Peripheral that will be reconnected.
        peripheral_id: String,
        /// 1-based attempt number within the current chain.
        attempt: u32,
        /// Time until the attempt.
        delay: Duration,
    },
}

/// State shared with the handle for synchronous reads.
#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    pub(crate) state: ConnectionState,
    pub(crate) peripherals: Vec<PeripheralHandle>,
    pub(crate) services: Vec<ServiceDescriptor>,
    pub(crate) active_peripheral: Option<PeripheralHandle>,
}

/// Manages the connection to a single BLE peripheral.
///
/// Dropping the manager stops scanning, closes any open link and cancels a
/// pending reconnect.
pub struct LinkManager {
    /// Command queue to the actor.
    commands: mpsc::UnboundedSender<Command>,
    /// Latest state published by the actor.
    snapshot: Arc<RwLock<Snapshot>>,
    /// Lifecycle event channel.
    events_tx: broadcast::Sender<LinkEvent>,
    /// Notification fan-out.
    dispatcher: Arc<NotificationDispatcher>,
    config: LinkConfig,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Actor task handle.
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl LinkManager {
    /// Create a manager driving `transport`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new<T: Transport>(transport: T, config: LinkConfig) -> Result<Self> {
        config.validate()?;

        let snapshot = Arc::new(RwLock::new(Snapshot::default()));
        let (events_tx, _) = broadcast::channel(config.event_capacity);
        let dispatcher = Arc::new(NotificationDispatcher::new(config.notification_capacity));
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let actor = LinkActor::new(
            transport,
            config.clone(),
            snapshot.clone(),
            events_tx.clone(),
            dispatcher.clone(),
        );
        let handle = tokio::spawn(actor.run(commands_rx));

        Ok(Self {
            commands,
            snapshot,
            events_tx,
            dispatcher,
            config,
            callback_counter: AtomicU64::new(0),
            actor: Mutex::new(Some(handle)),
        })
    }

    /// Create a manager on the system's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available or the configuration
    /// is invalid.
    pub async fn with_btleplug(config: LinkConfig) -> Result<Self> {
        let transport = BtleplugTransport::new().await?;
        Self::new(transport, config)
    }

    async fn request<R>(&self, build: impl FnOnce(Reply<R>) -> Command) -> Result<R> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| Error::ManagerStopped)?;
        reply_rx.await.map_err(|_| Error::ManagerStopped)?
    }

    // === Commands ===

    /// Start scanning. Clears the peripheral list.
    ///
    /// Allowed while Idle. While already Scanning the scan is restarted.
    pub async fn start_scan(&self) -> Result<()> {
        self.request(Command::StartScan).await
    }

    /// Stop scanning and return to Idle. Does nothing unless Scanning.
    pub async fn stop_scan(&self) -> Result<()> {
        self.request(Command::StopScan).await
    }

    /// Connect to a peripheral found by the current scan.
    ///
    /// Returns once the attempt has started; watch for
    /// [`ConnectionState::Ready`] to know it succeeded.
    ///
    /// # Errors
    ///
    /// - [`Error::PeripheralNotFound`] if `id` is not in the peripheral list.
    /// - [`Error::ConnectionInProgress`] while Connecting or Discovering.
    /// - [`Error::InvalidState`] in any other state but Scanning.
    pub async fn connect(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| Command::Connect { id, reply }).await
    }

    /// Disconnect and return to Idle, cancelling any pending reconnect.
    ///
    /// Never triggers an automatic reconnect. Safe to call in any state.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Read a characteristic on the Ready link.
    pub async fn read(&self, uuid: Uuid) -> Result<Bytes> {
        self.request(|reply| Command::Read { uuid, reply }).await
    }

    /// Write a characteristic on the Ready link, waiting for the
    /// acknowledgement.
    pub async fn write(&self, uuid: Uuid, value: impl Into<Bytes>) -> Result<()> {
        let value = value.into();
        self.request(|reply| Command::Write { uuid, value, reply })
            .await
    }

    /// Remove a peripheral from the list. Returns whether it was present.
    pub async fn forget_peripheral(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.request(|reply| Command::Forget { id, reply }).await
    }

    /// Disconnect, stop the actor and wait for it to exit.
    ///
    /// Later commands fail with [`Error::ManagerStopped`]. Calling this more
    /// than once is not an error.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down link manager");

        match self.request(Command::Shutdown).await {
            Ok(()) | Err(Error::ManagerStopped) => {}
            Err(e) => return Err(e),
        }

        let handle = self.actor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Link actor exited abnormally: {}", e);
            }
        }

        Ok(())
    }

    // === Snapshot ===

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.snapshot.read().state
    }

    /// Check if the link is Ready.
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Peripherals found by the current scan, in first-seen order.
    pub fn peripherals(&self) -> Vec<PeripheralHandle> {
        self.snapshot.read().peripherals.clone()
    }

    /// Get a discovered peripheral by id.
    pub fn peripheral(&self, id: &str) -> Option<PeripheralHandle> {
        self.snapshot
            .read()
            .peripherals
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    /// Discovered services. Empty unless Ready.
    pub fn services(&self) -> Vec<ServiceDescriptor> {
        self.snapshot.read().services.clone()
    }

    /// Get a discovered characteristic, including its last known value.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<CharacteristicDescriptor> {
        characteristics::find_characteristic(&self.snapshot.read().services, uuid).cloned()
    }

    /// Peripheral being connected, connected, or waiting to be reconnected.
    pub fn active_peripheral(&self) -> Option<PeripheralHandle> {
        self.snapshot.read().active_peripheral.clone()
    }

    /// Configuration in use.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    // === Observers ===

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events_tx.subscribe()
    }

    /// Register a callback for state changes.
    ///
    /// Called with the previous state, the new state and the failure that
    /// caused the change, if any.
    pub fn on_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionState, ConnectionState, Option<&LinkFailure>) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let LinkEvent::StateChanged { from, to, failure } = event {
                callback(*from, *to, failure.as_ref());
            }
        })
    }

    /// Register a callback for every lifecycle event.
    ///
    /// A panicking callback is logged and keeps receiving later events.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&LinkEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.events_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                            warn!("Event callback {} panicked", callback_id);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event callback {} lagged, skipped {}", callback_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Event callback {} finished", callback_id);
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Subscribe to notifications as a broadcast stream.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.dispatcher.subscribe()
    }

    /// Register a callback for notifications.
    ///
    /// Callbacks run in registration order on a worker task.
    pub fn on_notification<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        self.dispatcher.on_notification(callback)
    }

    /// Register a notification observer.
    pub fn register_observer<O>(&self, observer: O) -> CallbackHandle
    where
        O: NotificationObserver + 'static,
    {
        self.dispatcher.register(observer)
    }
}

impl std::fmt::Debug for LinkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot.read();
        f.debug_struct("LinkManager")
            .field("state", &snapshot.state)
            .field("peripherals", &snapshot.peripherals.len())
            .field("active_peripheral", &snapshot.active_peripheral)
            .finish_non_exhaustive()
    }
}
