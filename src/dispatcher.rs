//! Notification fan-out.
//!
//! The lifecycle actor hands every accepted notification to the dispatcher
//! and moves on. A separate worker task calls the registered observers in
//! registration order, so a slow or panicking observer never holds up a
//! state transition. Broadcast subscribers get the same events through a
//! `tokio::sync::broadcast` channel.

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{trace, warn};

pub use crate::ble::transport::NotificationEvent;

/// Callback handle for unregistering callbacks.
///
/// Dropping the handle unregisters the callback.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

/// Receives characteristic notifications.
///
/// Called from the dispatcher's worker task. Keep it short; heavy work
/// belongs on a task of your own.
#[cfg_attr(test, mockall::automock)]
pub trait NotificationObserver: Send + Sync {
    /// Handle one notification.
    fn on_notification(&self, event: &NotificationEvent);
}

struct FnObserver<F>(F);

impl<F> NotificationObserver for FnObserver<F>
where
    F: Fn(&NotificationEvent) + Send + Sync,
{
    fn on_notification(&self, event: &NotificationEvent) {
        (self.0)(event)
    }
}

type ObserverList = Arc<RwLock<Vec<(u64, Arc<dyn NotificationObserver>)>>>;

/// Routes notifications to observers without blocking the caller.
pub struct NotificationDispatcher {
    observers: ObserverList,
    queue_tx: mpsc::UnboundedSender<NotificationEvent>,
    broadcast_tx: broadcast::Sender<NotificationEvent>,
    callback_counter: AtomicU64,
}

impl NotificationDispatcher {
    /// Create a dispatcher and spawn its worker on the current runtime.
    ///
    /// The worker exits once the dispatcher is dropped and its queue drains.
    pub fn new(broadcast_capacity: usize) -> Self {
        let observers: ObserverList = Arc::new(RwLock::new(Vec::new()));
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(broadcast_capacity.max(1));

        tokio::spawn(Self::run(observers.clone(), queue_rx));

        Self {
            observers,
            queue_tx,
            broadcast_tx,
            callback_counter: AtomicU64::new(0),
        }
    }

    /// Queue an event for every observer and broadcast subscriber.
    pub fn dispatch(&self, event: NotificationEvent) {
        trace!(
            "Dispatching {} byte notification from {}",
            event.data.len(),
            event.characteristic_uuid
        );

        let _ = self.broadcast_tx.send(event.clone());
        if self.queue_tx.send(event).is_err() {
            warn!("Notification worker has stopped, dropping event");
        }
    }

    /// Register an observer. It is called after every observer registered
    /// before it.
    pub fn register<O>(&self, observer: O) -> CallbackHandle
    where
        O: NotificationObserver + 'static,
    {
        self.register_arc(Arc::new(observer))
    }

    /// Register a closure as an observer.
    pub fn on_notification<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        self.register(FnObserver(callback))
    }

    /// Register a shared observer.
    pub fn register_arc(&self, observer: Arc<dyn NotificationObserver>) -> CallbackHandle {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        self.observers.write().push((callback_id, observer));

        let observers = Arc::downgrade(&self.observers);
        CallbackHandle::new(callback_id, move || {
            if let Some(observers) = observers.upgrade() {
                observers.write().retain(|(id, _)| *id != callback_id);
            }
        })
    }

    /// Subscribe to notifications as a broadcast stream.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    async fn run(observers: ObserverList, mut queue_rx: mpsc::UnboundedReceiver<NotificationEvent>) {
        while let Some(event) = queue_rx.recv().await {
            // Snapshot so observers can (un)register from inside a callback.
            let current: Vec<_> = observers.read().clone();

            for (id, observer) in current {
                let outcome = catch_unwind(AssertUnwindSafe(|| observer.on_notification(&event)));
                if outcome.is_err() {
                    warn!("Notification observer {} panicked", id);
                }
            }
        }

        trace!("Notification worker stopped");
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("observers", &self.observer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::timeout;
    use uuid::Uuid;

    fn event(data: &'static str) -> NotificationEvent {
        NotificationEvent::new(Uuid::nil(), Bytes::from_static(data.as_bytes()))
    }

    #[tokio::test]
    async fn test_observers_called_in_registration_order() {
        let dispatcher = NotificationDispatcher::new(8);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let mut handles = Vec::new();
        for index in 0..3 {
            let calls = calls.clone();
            let done_tx = done_tx.clone();
            handles.push(dispatcher.on_notification(move |e| {
                calls.lock().push((index, e.as_text_lossy()));
                if index == 2 {
                    let _ = done_tx.send(());
                }
            }));
        }

        dispatcher.dispatch(event("a"));
        dispatcher.dispatch(event("b"));

        for _ in 0..2 {
            timeout(Duration::from_secs(1), done_rx.recv())
                .await
                .expect("observer not called");
        }

        let expected: Vec<(i32, String)> = ["a", "b"]
            .iter()
            .flat_map(|d| (0..3).map(move |i| (i, d.to_string())))
            .collect();
        assert_eq!(*calls.lock(), expected);
    }

    #[tokio::test]
    async fn test_mock_observer_receives_event_once() {
        let dispatcher = NotificationDispatcher::new(8);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut observer = MockNotificationObserver::new();
        observer
            .expect_on_notification()
            .withf(|e: &NotificationEvent| e.data.as_ref() == b"42")
            .times(1)
            .returning(move |_| {
                let _ = tx.send(());
            });

        let _handle = dispatcher.register(observer);
        dispatcher.dispatch(event("42"));

        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("observer not called");
    }

    #[tokio::test]
    async fn test_panicking_observer_does_not_stop_others() {
        let dispatcher = NotificationDispatcher::new(8);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _failing = dispatcher.on_notification(|_| panic!("observer failure"));
        let _ok = dispatcher.on_notification(move |e| {
            let _ = tx.send(e.clone());
        });

        dispatcher.dispatch(event("first"));
        dispatcher.dispatch(event("second"));

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first.unwrap().as_text().as_deref(), Some("first"));
        assert_eq!(second.unwrap().as_text().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_dropped_handle_unregisters() {
        let dispatcher = NotificationDispatcher::new(8);
        let count = Arc::new(AtomicU64::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let counted = {
            let count = count.clone();
            dispatcher.on_notification(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _signal = dispatcher.on_notification(move |_| {
            let _ = tx.send(());
        });
        assert_eq!(dispatcher.observer_count(), 2);

        drop(counted);
        assert_eq!(dispatcher.observer_count(), 1);

        dispatcher.dispatch(event("x"));
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_broadcast_subscriber() {
        let dispatcher = NotificationDispatcher::new(8);
        let mut rx = dispatcher.subscribe();

        dispatcher.dispatch(event("hello"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.as_text().as_deref(), Some("hello"));
    }
}
