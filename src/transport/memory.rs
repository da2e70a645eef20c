//! In-process relay.
//!
//! [`MemoryRelay`] stores every published frame and fans it out to all
//! connected subscribers, including the publisher. Each client talks to it
//! through a [`MemoryTransport`], which carries the fault knobs:
//!
//! - [`AckMode`]: acknowledge, send without ack, hang, or reject
//! - connectivity: a disconnected client neither sends nor receives
//! - drop predicate: frames matching it are stored but not delivered live,
//!   so only a history query can find them
//! - history delay: queries answer late, with what the relay holds then

use crate::dag::current_timestamp_millis;
use crate::error::{Result, SyncError};
use crate::transport::{Frame, HistoryFilter, PublishAck, Transport};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Inbound channel capacity per subscriber.
const SUBSCRIBER_CAPACITY: usize = 4096;

/// How a transport answers publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Deliver and acknowledge.
    #[default]
    Ack,
    /// Deliver without acknowledgement.
    NoAck,
    /// Never answer and never deliver.
    Timeout,
    /// Refuse the frame.
    Reject,
}

type DropPredicate = Arc<dyn Fn(&Frame) -> bool + Send + Sync>;

struct Subscriber {
    client: usize,
    sender: mpsc::Sender<Frame>,
}

#[derive(Default)]
struct RelayInner {
    history: Vec<(u64, Frame)>,
    subscribers: Vec<Subscriber>,
    connected: Vec<(usize, watch::Receiver<bool>)>,
}

/// A shared in-memory relay.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayInner>>,
    next_client: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRelay")
            .field("stored", &self.stored_count())
            .finish()
    }
}

fn poisoned() -> SyncError {
    SyncError::transport("Relay lock poisoned")
}

impl MemoryRelay {
    /// Creates an empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a new connected client.
    pub fn connect(&self) -> MemoryTransport {
        let client = self.next_client.fetch_add(1, Ordering::SeqCst);
        let (connected, rx) = watch::channel(true);
        if let Ok(mut inner) = self.inner.lock() {
            inner.connected.push((client, rx));
        }
        MemoryTransport {
            relay: self.clone(),
            client,
            ack_mode: Mutex::new(AckMode::Ack),
            connected,
            drop_predicate: Mutex::new(None),
            duplicate: AtomicBool::new(false),
            history_delay: Mutex::new(None),
            history_queries: Mutex::new(Vec::new()),
        }
    }

    /// Number of stored frames.
    pub fn stored_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.history.len()).unwrap_or(0)
    }

    /// Stores and delivers a frame as if a remote peer had published it.
    pub fn inject(&self, frame: Frame) -> Result<()> {
        self.store_and_deliver(frame, None, false)
    }

    fn store_and_deliver(
        &self,
        frame: Frame,
        drop: Option<&DropPredicate>,
        duplicate: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        inner
            .history
            .push((current_timestamp_millis(), frame.clone()));

        if drop.is_some_and(|predicate| predicate(&frame)) {
            trace!(topic = %frame.topic, "Relay dropped frame from live delivery");
            return Ok(());
        }

        let online: Vec<usize> = inner
            .connected
            .iter()
            .filter(|(_, rx)| *rx.borrow())
            .map(|(client, _)| *client)
            .collect();
        let copies = if duplicate { 2 } else { 1 };
        inner.subscribers.retain(|subscriber| {
            if !online.contains(&subscriber.client) {
                return !subscriber.sender.is_closed();
            }
            for _ in 0..copies {
                if let Err(mpsc::error::TrySendError::Closed(_)) =
                    subscriber.sender.try_send(frame.clone())
                {
                    return false;
                }
            }
            true
        });
        Ok(())
    }

    fn add_subscriber(&self, client: usize) -> mpsc::Receiver<Frame> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_CAPACITY);
        if let Ok(mut inner) = self.inner.lock() {
            inner.subscribers.push(Subscriber { client, sender });
        }
        receiver
    }

    fn query(&self, filter: &HistoryFilter) -> Result<Vec<Frame>> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner
            .history
            .iter()
            .filter(|(stored_at, frame)| filter.matches(&frame.topic, *stored_at))
            .map(|(_, frame)| frame.clone())
            .collect())
    }
}

/// One client's connection to a [`MemoryRelay`].
pub struct MemoryTransport {
    relay: MemoryRelay,
    client: usize,
    ack_mode: Mutex<AckMode>,
    connected: watch::Sender<bool>,
    drop_predicate: Mutex<Option<DropPredicate>>,
    duplicate: AtomicBool,
    history_delay: Mutex<Option<Duration>>,
    history_queries: Mutex<Vec<HistoryFilter>>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("client", &self.client)
            .field("connected", &*self.connected.borrow())
            .finish()
    }
}

impl MemoryTransport {
    /// Changes how publishes are answered.
    pub fn set_ack_mode(&self, mode: AckMode) {
        if let Ok(mut ack_mode) = self.ack_mode.lock() {
            *ack_mode = mode;
        }
    }

    /// Toggles connectivity; observers of `connection()` see the change.
    pub fn set_connected(&self, connected: bool) {
        debug!(client = self.client, connected, "Memory transport connectivity");
        self.connected.send_replace(connected);
    }

    /// Drops live delivery of frames this client publishes when `predicate`
    /// returns true. Dropped frames remain queryable.
    pub fn set_drop_predicate<F>(&self, predicate: F)
    where
        F: Fn(&Frame) -> bool + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.drop_predicate.lock() {
            *slot = Some(Arc::new(predicate));
        }
    }

    /// Removes the drop predicate.
    pub fn clear_drop_predicate(&self) {
        if let Ok(mut slot) = self.drop_predicate.lock() {
            *slot = None;
        }
    }

    /// Delivers every frame this client publishes twice.
    pub fn set_duplicate(&self, duplicate: bool) {
        self.duplicate.store(duplicate, Ordering::SeqCst);
    }

    /// Delays every history answer by `delay`. `None` answers at once.
    pub fn set_history_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.history_delay.lock() {
            *slot = delay;
        }
    }

    /// Filters of every history query issued so far, oldest first.
    pub fn history_queries(&self) -> Vec<HistoryFilter> {
        self.history_queries
            .lock()
            .map(|queries| queries.clone())
            .unwrap_or_default()
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn publish_now(&self, frame: Frame) -> Result<PublishAck> {
        if !self.is_connected() {
            return Err(SyncError::transport("Not connected"));
        }
        let mode = *self.ack_mode.lock().map_err(|_| poisoned())?;
        let drop = self.drop_predicate.lock().map_err(|_| poisoned())?.clone();
        match mode {
            AckMode::Reject => Err(SyncError::transport("Relay rejected frame")),
            AckMode::Timeout => Ok(PublishAck::NoAck),
            AckMode::Ack | AckMode::NoAck => {
                self.relay.store_and_deliver(
                    frame,
                    drop.as_ref(),
                    self.duplicate.load(Ordering::SeqCst),
                )?;
                Ok(if mode == AckMode::Ack {
                    PublishAck::Ack
                } else {
                    PublishAck::NoAck
                })
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn publish(&self, frame: Frame) -> impl Future<Output = Result<PublishAck>> + Send {
        let hangs = self
            .ack_mode
            .lock()
            .map(|mode| *mode == AckMode::Timeout)
            .unwrap_or(false)
            && self.is_connected();
        let result = self.publish_now(frame);
        async move {
            if hangs {
                std::future::pending::<()>().await;
            }
            result
        }
    }

    fn subscribe(&self) -> mpsc::Receiver<Frame> {
        self.relay.add_subscriber(self.client)
    }

    fn query_history(
        &self,
        filter: HistoryFilter,
    ) -> impl Future<Output = Result<Vec<Frame>>> + Send {
        if let Ok(mut queries) = self.history_queries.lock() {
            queries.push(filter.clone());
        }
        let delay = self.history_delay.lock().ok().and_then(|delay| *delay);
        let relay = self.relay.clone();
        let connection = self.connected.subscribe();
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if !*connection.borrow() {
                return Err(SyncError::transport("Not connected"));
            }
            relay.query(&filter)
        }
    }

    fn connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(topic: &str, byte: u8) -> Frame {
        Frame {
            topic: topic.to_string(),
            payload: vec![byte],
        }
    }

    fn everything() -> HistoryFilter {
        HistoryFilter {
            topics: vec!["t".into()],
            start_ms: 0,
            end_ms: u64::MAX,
        }
    }

    #[tokio::test]
    async fn test_fanout_includes_publisher() {
        let relay = MemoryRelay::new();
        let a = relay.connect();
        let b = relay.connect();
        let mut a_rx = a.subscribe();
        let mut b_rx = b.subscribe();

        assert_eq!(a.publish(frame("t", 1)).await.unwrap(), PublishAck::Ack);
        assert_eq!(a_rx.recv().await.unwrap().payload, vec![1]);
        assert_eq!(b_rx.recv().await.unwrap().payload, vec![1]);
    }

    #[tokio::test]
    async fn test_dropped_frames_remain_queryable() {
        let relay = MemoryRelay::new();
        let a = relay.connect();
        let b = relay.connect();
        let mut b_rx = b.subscribe();
        a.set_drop_predicate(|f| f.payload == vec![1]);

        a.publish(frame("t", 1)).await.unwrap();
        a.publish(frame("t", 2)).await.unwrap();
        assert_eq!(b_rx.recv().await.unwrap().payload, vec![2]);

        let history = b.query_history(everything()).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_disconnected_client_is_isolated() {
        let relay = MemoryRelay::new();
        let a = relay.connect();
        let b = relay.connect();
        let mut b_rx = b.subscribe();
        let mut connection = b.connection();

        b.set_connected(false);
        assert!(connection.has_changed().unwrap());
        assert!(!*connection.borrow_and_update());
        assert!(b.publish(frame("t", 9)).await.is_err());
        assert!(b.query_history(everything()).await.is_err());

        a.publish(frame("t", 1)).await.unwrap();
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reject_and_no_ack() {
        let relay = MemoryRelay::new();
        let a = relay.connect();
        a.set_ack_mode(AckMode::Reject);
        assert!(matches!(
            a.publish(frame("t", 1)).await,
            Err(SyncError::Transport(_))
        ));
        assert_eq!(relay.stored_count(), 0);

        a.set_ack_mode(AckMode::NoAck);
        assert_eq!(a.publish(frame("t", 1)).await.unwrap(), PublishAck::NoAck);
        assert_eq!(relay.stored_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_history_sees_later_frames() {
        let relay = MemoryRelay::new();
        let a = relay.connect();
        a.set_history_delay(Some(Duration::from_millis(200)));

        let (frames, ()) = tokio::join!(a.query_history(everything()), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            a.publish(frame("t", 3)).await.unwrap();
        });
        assert_eq!(frames.unwrap().len(), 1);
        assert_eq!(a.history_queries(), vec![everything()]);
    }

    #[tokio::test]
    async fn test_duplicate_delivery() {
        let relay = MemoryRelay::new();
        let a = relay.connect();
        let mut rx = a.subscribe();
        a.set_duplicate(true);
        a.publish(frame("t", 5)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), rx.recv().await.unwrap());
    }
}
