//! In-process transport
//!
//! Engines that share a [`LocalHub`] see each other's events, which lets
//! several engines in one process (or one test) behave like separate
//! nodes. Each connection can be cut and restored to simulate outages.

use super::{EventHandler, Messenger};
use async_trait::async_trait;
use parking_lot::Mutex;
use permsync_api::{InvalidationEvent, PermsError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const TRANSPORT: &str = "local";

/// Shared bus for [`LocalMessenger`]s
#[derive(Clone)]
pub struct LocalHub {
    tx: broadcast::Sender<String>,
}

impl LocalHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// A new connection to this hub
    pub fn connect(&self) -> LocalMessenger {
        LocalMessenger {
            tx: self.tx.clone(),
            connected: Arc::new(AtomicBool::new(true)),
            handler: Mutex::new(None),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// One connection to a [`LocalHub`]
pub struct LocalMessenger {
    tx: broadcast::Sender<String>,
    connected: Arc<AtomicBool>,
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LocalMessenger {
    /// Simulate losing the connection; events are dropped until
    /// [`reconnect`](Self::reconnect)
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        debug!("Local messenger disconnected");
    }

    /// Restore the connection and notify the handler
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::Release);
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler.on_connected();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Messenger for LocalMessenger {
    fn name(&self) -> &'static str {
        TRANSPORT
    }

    async fn publish(&self, event: &InvalidationEvent) -> Result<()> {
        if !self.is_connected() {
            return Err(PermsError::messaging(TRANSPORT, "not connected"));
        }
        // no receivers is not an error
        let _ = self.tx.send(event.encode()?);
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Result<()> {
        *self.handler.lock() = Some(handler.clone());

        let mut rx = self.tx.subscribe();
        let connected = self.connected.clone();
        let shutdown = self.shutdown.clone();
        handler.on_connected();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(payload) => {
                            if !connected.load(Ordering::Acquire) {
                                continue;
                            }
                            match InvalidationEvent::decode(&payload) {
                                Ok(event) => handler.on_event(event),
                                Err(e) => warn!(error = %e, "Dropping undecodable event"),
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Local messenger lagged, treating as reconnect");
                            handler.on_connected();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: AtomicUsize,
        connects: AtomicUsize,
    }

    impl EventHandler for Recorder {
        fn on_event(&self, _event: InvalidationEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        fn on_connected(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_events_reach_other_connections() {
        let hub = LocalHub::default();
        let (a, b) = (hub.connect(), hub.connect());
        let recorder = Arc::new(Recorder::default());
        b.subscribe(recorder.clone()).await.unwrap();
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 1);

        a.publish(&InvalidationEvent::all(uuid::Uuid::new_v4()))
            .await
            .unwrap();
        settle().await;
        assert_eq!(recorder.events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_drops_and_reconnect_notifies() {
        let hub = LocalHub::default();
        let (a, b) = (hub.connect(), hub.connect());
        let recorder = Arc::new(Recorder::default());
        b.subscribe(recorder.clone()).await.unwrap();

        b.disconnect();
        a.publish(&InvalidationEvent::all(uuid::Uuid::new_v4()))
            .await
            .unwrap();
        settle().await;
        assert_eq!(recorder.events.load(Ordering::SeqCst), 0);
        assert!(b
            .publish(&InvalidationEvent::all(uuid::Uuid::new_v4()))
            .await
            .is_err());

        b.reconnect();
        assert_eq!(recorder.connects.load(Ordering::SeqCst), 2);
        b.close().await.unwrap();
    }
}
