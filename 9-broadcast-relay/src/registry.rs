use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc, Weak,
};

use chrono::{DateTime, Local};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Mutex, Notify,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{error::SendError, message::Announcement};

pub type ConnectionId = u64;
pub type SequenceIndex = u64;

/// Lifecycle of one client as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Connecting,
    Registered,
    Disconnecting,
    Gone,
}

impl HandlerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HandlerState::Connecting,
            1 => HandlerState::Registered,
            2 => HandlerState::Disconnecting,
            _ => HandlerState::Gone,
        }
    }
}

/// The part of a connection other tasks are allowed to touch.
///
/// Lines go through a bounded queue drained by the connection's writer task,
/// so `send` never blocks on the network.
pub struct ClientHandle {
    id: ConnectionId,
    name: String,
    outbound: mpsc::Sender<String>,
    closer: CancellationToken,
    state: AtomicU8,
}

impl ClientHandle {
    pub fn new(
        id: ConnectionId,
        name: impl Into<String>,
        outbound: mpsc::Sender<String>,
        closer: CancellationToken,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            outbound,
            closer,
            state: AtomicU8::new(HandlerState::Connecting as u8),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> HandlerState {
        HandlerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: HandlerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn send(&self, line: String) -> Result<(), SendError> {
        if self.state() == HandlerState::Gone {
            return Err(SendError::TargetGone);
        }
        match self.outbound.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::Backlogged),
            Err(TrySendError::Closed(_)) => Err(SendError::TargetGone),
        }
    }

    /// Asks the connection to shut down. Safe to call any number of times.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub unreachable: Vec<ConnectionId>,
}

/// Directory of every client that finished its handshake and has not left.
///
/// One mutex serializes membership changes and fan-out, which gives each
/// broadcast a stable view of membership and keeps per-client delivery in
/// submission order.
pub struct ClientRegistry {
    inner: Mutex<RegistryInner>,
    emptied: Notify,
}

struct RegistryInner {
    clients: Vec<RegisteredClient>,
    next_index: SequenceIndex,
    clock: MonotonicClock,
}

struct RegisteredClient {
    index: SequenceIndex,
    id: ConnectionId,
    handle: Weak<ClientHandle>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                clients: Vec::new(),
                next_index: 0,
                clock: MonotonicClock::default(),
            }),
            emptied: Notify::new(),
        }
    }

    pub async fn register(&self, handle: &Arc<ClientHandle>) -> SequenceIndex {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.clients.iter().find(|c| c.id == handle.id()) {
            return existing.index;
        }

        let index = inner.next_index;
        inner.next_index += 1;
        inner.clients.push(RegisteredClient {
            index,
            id: handle.id(),
            handle: Arc::downgrade(handle),
        });
        handle.set_state(HandlerState::Registered);
        index
    }

    /// Removes the client. Returns `false` when it was already absent.
    pub async fn deregister(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(position) = inner.clients.iter().position(|c| c.id == id) else {
            return false;
        };
        inner.clients.remove(position);
        if inner.clients.is_empty() {
            self.emptied.notify_waiters();
        }
        true
    }

    pub async fn broadcast(&self, line: &str, exclude: &[ConnectionId]) -> BroadcastReport {
        let inner = self.inner.lock().await;
        inner.fan_out(line, exclude)
    }

    /// Stamps the announcement and broadcasts the rendered line.
    pub async fn publish(
        &self,
        announcement: &Announcement,
        exclude: &[ConnectionId],
    ) -> BroadcastReport {
        let mut inner = self.inner.lock().await;
        let at = inner.clock.stamp();
        let line = announcement.render(at);
        inner.fan_out(&line, exclude)
    }

    pub async fn snapshot_size(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    /// Tells every registered client to shut down.
    pub async fn close_all(&self) {
        let inner = self.inner.lock().await;
        for handle in inner.clients.iter().filter_map(|c| c.handle.upgrade()) {
            handle.close();
        }
    }

    pub async fn wait_until_empty(&self) {
        loop {
            let emptied = self.emptied.notified();
            if self.snapshot_size().await == 0 {
                return;
            }
            emptied.await;
        }
    }
}

impl RegistryInner {
    fn fan_out(&self, line: &str, exclude: &[ConnectionId]) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for client in &self.clients {
            if exclude.contains(&client.id) {
                continue;
            }
            let Some(handle) = client.handle.upgrade() else {
                debug!(connection_id = client.id, "skipping dropped client");
                continue;
            };

            match handle.send(line.to_string()) {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    warn!(
                        connection_id = client.id,
                        name = handle.name(),
                        %error,
                        "broadcast target unreachable"
                    );
                    // The client's own task deregisters it once it observes the close.
                    handle.close();
                    report.unreachable.push(client.id);
                }
            }
        }

        report
    }
}

/// Wall-clock source that never goes backwards.
#[derive(Debug, Default)]
struct MonotonicClock {
    last: Option<DateTime<Local>>,
}

impl MonotonicClock {
    fn stamp(&mut self) -> DateTime<Local> {
        let now = Local::now();
        let stamp = match self.last {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn client(
        id: ConnectionId,
        name: &str,
        capacity: usize,
    ) -> (Arc<ClientHandle>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Arc::new(ClientHandle::new(id, name, tx, CancellationToken::new()));
        (handle, rx)
    }

    #[tokio::test]
    async fn register_hands_out_increasing_indices() {
        let registry = ClientRegistry::new();
        let (a, _rx_a) = client(1, "A", 8);
        let (b, _rx_b) = client(2, "B", 8);

        let first = registry.register(&a).await;
        let second = registry.register(&b).await;

        assert!(second > first);
        assert_eq!(registry.register(&a).await, first);
        assert_eq!(registry.snapshot_size().await, 2);
        assert_eq!(a.state(), HandlerState::Registered);
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_in_submission_order() {
        let registry = ClientRegistry::new();
        let (a, mut rx_a) = client(1, "A", 8);
        let (b, mut rx_b) = client(2, "B", 8);
        registry.register(&a).await;
        registry.register(&b).await;

        registry.broadcast("one", &[]).await;
        let report = registry.broadcast("two", &[]).await;
        assert_eq!(report.delivered, 2);
        assert!(report.unreachable.is_empty());

        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(rx.recv().await.as_deref(), Some("one"));
            assert_eq!(rx.recv().await.as_deref(), Some("two"));
        }
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_clients() {
        let registry = ClientRegistry::new();
        let (a, mut rx_a) = client(1, "A", 8);
        let (b, mut rx_b) = client(2, "B", 8);
        registry.register(&a).await;
        registry.register(&b).await;

        let report = registry.broadcast("only b", &[a.id()]).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(rx_b.recv().await.as_deref(), Some("only b"));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn deregister_twice_is_a_no_op() {
        let registry = ClientRegistry::new();
        let (a, _rx_a) = client(1, "A", 8);
        registry.register(&a).await;

        assert!(registry.deregister(a.id()).await);
        assert!(!registry.deregister(a.id()).await);
        assert_eq!(registry.snapshot_size().await, 0);
    }

    #[tokio::test]
    async fn one_dead_target_does_not_stop_the_fan_out() {
        let registry = ClientRegistry::new();
        let (a, mut rx_a) = client(1, "A", 8);
        let (b, rx_b) = client(2, "B", 8);
        let (c, mut rx_c) = client(3, "C", 8);
        registry.register(&a).await;
        registry.register(&b).await;
        registry.register(&c).await;
        drop(rx_b);

        let report = registry.broadcast("still here", &[]).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.unreachable, vec![b.id()]);
        assert!(b.is_closed());
        assert!(!a.is_closed());
        assert_eq!(rx_a.recv().await.as_deref(), Some("still here"));
        assert_eq!(rx_c.recv().await.as_deref(), Some("still here"));
    }

    #[tokio::test]
    async fn full_queue_counts_as_unreachable() {
        let registry = ClientRegistry::new();
        let (slow, _rx_slow) = client(1, "slow", 1);
        registry.register(&slow).await;

        registry.broadcast("first", &[]).await;
        let report = registry.broadcast("second", &[]).await;

        assert_eq!(report.unreachable, vec![slow.id()]);
        assert!(slow.is_closed());
    }

    #[tokio::test]
    async fn send_to_gone_client_reports_target_gone() {
        let (a, _rx_a) = client(1, "A", 8);
        a.set_state(HandlerState::Gone);
        assert_eq!(a.send("late".into()), Err(SendError::TargetGone));
    }

    #[tokio::test]
    async fn dropped_handles_are_skipped() {
        let registry = ClientRegistry::new();
        let (a, _rx_a) = client(1, "A", 8);
        registry.register(&a).await;
        drop(a);

        let report = registry.broadcast("nobody", &[]).await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn publish_renders_announcements() {
        let registry = ClientRegistry::new();
        let (a, mut rx_a) = client(1, "A", 8);
        registry.register(&a).await;

        registry
            .publish(
                &Announcement::Chat {
                    name: "A".into(),
                    text: "hi".into(),
                },
                &[],
            )
            .await;

        let line = rx_a.recv().await.expect("line");
        assert!(line.ends_with(" A: hi"), "unexpected line: {line}");
    }

    #[tokio::test]
    async fn wait_until_empty_returns_after_last_deregister() {
        let registry = Arc::new(ClientRegistry::new());
        let (a, _rx_a) = client(1, "A", 8);
        registry.register(&a).await;

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_until_empty().await })
        };
        registry.deregister(a.id()).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter finished")
            .expect("waiter task");
    }

    #[test]
    fn clock_never_goes_backwards() {
        let future = Local::now() + Duration::hours(1);
        let mut clock = MonotonicClock { last: Some(future) };

        assert_eq!(clock.stamp(), future);
        assert!(clock.stamp() >= future);
    }
}
