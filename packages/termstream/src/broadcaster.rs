//! Per-session fan-out
//!
//! One lock covers the encoder, the frame ring and the subscriber table, so
//! a subscriber's snapshot and the first live frame it sees are always
//! adjacent in sequence. Every subscriber has a bounded queue; a full queue
//! never blocks the publisher. The subscriber is marked lagging instead, an
//! error is charged to its supervisor, and it is brought back with either a
//! ring replay or a fresh snapshot. Live frames never resume across a gap.

use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use virtual_terminal::{Frame, FrameEncoder, Snapshot};

use crate::config::StreamConfig;
use crate::metrics::ServerMetrics;
use crate::ring::FrameRing;
use crate::session::ExitReason;
use crate::supervisor::{ConnectionSupervisor, SupervisorState, ThrashGuard};

pub type SubscriptionId = u64;

/// Terminal event sent once when the session exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitNotice {
    pub exit_code: Option<i32>,
    pub reason: ExitReason,
    pub signal: Option<String>,
}

/// What a subscriber receives, in order.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Snapshot(Snapshot),
    Frame(Frame),
    /// The subscriber fell behind; a snapshot follows
    Resync,
    Exit(ExitNotice),
}

/// The receiving half of a subscription.
pub struct Subscription {
    pub id: SubscriptionId,
    pub session_id: String,
    pub client_id: String,
    pub events: mpsc::Receiver<StreamEvent>,
    /// Cancelled when the supervisor severs this subscription
    pub severed: CancellationToken,
}

struct Subscriber {
    client_id: String,
    tx: mpsc::Sender<StreamEvent>,
    supervisor: ConnectionSupervisor,
    severed: CancellationToken,
    /// Highest seq delivered or folded into a delivered snapshot
    delivered_seq: u64,
    lagging: bool,
    subscribed_at: Instant,
}

enum Recovery {
    Recovered,
    Pending,
    Closed,
}

struct Inner {
    encoder: FrameEncoder,
    ring: FrameRing,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    exit: Option<ExitNotice>,
    thrash: ThrashGuard,
}

pub struct Broadcaster {
    session_id: String,
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    config: StreamConfig,
    metrics: Arc<ServerMetrics>,
    thrashing: CancellationToken,
}

impl Broadcaster {
    pub fn new(
        session_id: String,
        encoder: FrameEncoder,
        ring_len: usize,
        config: StreamConfig,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            session_id,
            inner: Mutex::new(Inner {
                encoder,
                ring: FrameRing::new(ring_len),
                subscribers: HashMap::new(),
                exit: None,
                thrash: ThrashGuard::new(config.thrash_window),
            }),
            next_id: AtomicU64::new(1),
            config,
            metrics,
            thrashing: CancellationToken::new(),
        }
    }

    /// Open a subscription. The first event is always a snapshot; live
    /// frames follow from `snapshot.seq + 1`. After exit the subscription
    /// gets the final snapshot and the exit notice, then closes.
    pub async fn subscribe(&self, client_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.outbound_queue);
        let severed = CancellationToken::new();

        let mut inner = self.inner.lock().await;
        let snapshot = inner.encoder.snapshot();
        let seq = snapshot.seq;
        // Fresh queue holds at least two events
        let _ = tx.try_send(StreamEvent::Snapshot(snapshot));
        self.metrics.snapshot_served();

        if let Some(notice) = inner.exit.clone() {
            let _ = tx.try_send(StreamEvent::Exit(notice));
        } else {
            inner.subscribers.insert(
                id,
                Subscriber {
                    client_id: client_id.to_string(),
                    tx,
                    supervisor: ConnectionSupervisor::from_config(&self.config),
                    severed: severed.clone(),
                    delivered_seq: seq,
                    lagging: false,
                    subscribed_at: Instant::now(),
                },
            );
            self.metrics.subscription_opened();
        }
        drop(inner);

        debug!(
            session_id = %self.session_id,
            sub_id = id,
            client_id,
            "Subscribed at seq {}",
            seq
        );

        Subscription {
            id,
            session_id: self.session_id.clone(),
            client_id: client_id.to_string(),
            events: rx,
            severed,
        }
    }

    /// Turn a batch of output into the next frame and fan it out. Returns
    /// the frame's seq, or `None` once the session has exited.
    pub async fn publish(&self, payload: Bytes) -> Option<u64> {
        let mut inner = self.inner.lock().await;
        if inner.exit.is_some() {
            return None;
        }
        let frame = inner
            .encoder
            .encode(payload, chrono::Utc::now().timestamp_millis());
        inner.ring.push(frame.clone());
        self.metrics.frame_published();
        let seq = frame.seq;
        self.fan_out(&mut inner, &frame);
        Some(seq)
    }

    fn fan_out(&self, inner: &mut Inner, frame: &Frame) {
        let now = Instant::now();
        let mut closed = Vec::new();
        let mut severed = Vec::new();

        let Inner {
            encoder,
            ring,
            subscribers,
            ..
        } = &mut *inner;
        for (id, sub) in subscribers.iter_mut() {
            if sub.lagging {
                self.metrics.frame_dropped();
                if let Recovery::Closed = self.try_recover(*id, sub, ring, encoder) {
                    closed.push(*id);
                }
                continue;
            }
            match sub.tx.try_send(StreamEvent::Frame(frame.clone())) {
                Ok(()) => sub.delivered_seq = frame.seq,
                Err(TrySendError::Full(_)) => {
                    sub.lagging = true;
                    self.metrics.frame_dropped();
                    let state = sub.supervisor.record_error(now);
                    warn!(
                        session_id = %self.session_id,
                        sub_id = *id,
                        "Subscriber queue full at seq {}, marked lagging ({:?})",
                        frame.seq,
                        state
                    );
                    if state == SupervisorState::Severed {
                        severed.push(*id);
                    }
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            self.remove_locked(inner, id);
        }
        for id in severed {
            self.sever_locked(inner, id, now);
        }
    }

    /// Bring a lagging subscriber back: replay from the ring if every missed
    /// frame is still held and fits in its queue, otherwise a resync notice
    /// plus a fresh snapshot.
    fn try_recover(
        &self,
        id: SubscriptionId,
        sub: &mut Subscriber,
        ring: &FrameRing,
        encoder: &mut FrameEncoder,
    ) -> Recovery {
        if sub.tx.is_closed() {
            return Recovery::Closed;
        }
        let capacity = sub.tx.capacity();

        if let Some(missed) = ring.since(sub.delivered_seq) {
            if missed.len() <= capacity {
                let count = missed.len();
                for frame in missed {
                    let seq = frame.seq;
                    if sub.tx.try_send(StreamEvent::Frame(frame)).is_err() {
                        return Recovery::Closed;
                    }
                    sub.delivered_seq = seq;
                }
                sub.lagging = false;
                self.metrics.ring_replay();
                debug!(
                    session_id = %self.session_id,
                    sub_id = id,
                    "Recovered lagging subscriber from ring ({} frames)",
                    count
                );
                return Recovery::Recovered;
            }
        }

        if capacity >= 2 {
            let snapshot = encoder.snapshot();
            sub.delivered_seq = snapshot.seq;
            if sub.tx.try_send(StreamEvent::Resync).is_err()
                || sub.tx.try_send(StreamEvent::Snapshot(snapshot)).is_err()
            {
                return Recovery::Closed;
            }
            sub.lagging = false;
            self.metrics.snapshot_resync();
            self.metrics.snapshot_served();
            debug!(
                session_id = %self.session_id,
                sub_id = id,
                "Resynced lagging subscriber with snapshot at seq {}",
                sub.delivered_seq
            );
            return Recovery::Recovered;
        }

        Recovery::Pending
    }

    /// Retry recovery for every lagging subscriber. Called periodically so
    /// an idle session still brings slow readers back.
    pub async fn recover_lagging(&self) {
        let mut inner = self.inner.lock().await;
        if inner.exit.is_some() {
            return;
        }
        let mut closed = Vec::new();
        let Inner {
            encoder,
            ring,
            subscribers,
            ..
        } = &mut *inner;
        for (id, sub) in subscribers.iter_mut().filter(|(_, s)| s.lagging) {
            if let Recovery::Closed = self.try_recover(*id, sub, ring, encoder) {
                closed.push(*id);
            }
        }
        for id in closed {
            self.remove_locked(&mut inner, id);
        }
    }

    /// Charge a transport error to a subscription's supervisor. Severs it
    /// when the threshold is reached. Returns `None` for unknown ids.
    pub async fn report_error(&self, id: SubscriptionId) -> Option<SupervisorState> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let state = inner.subscribers.get_mut(&id)?.supervisor.record_error(now);
        debug!(
            session_id = %self.session_id,
            sub_id = id,
            "Transport error reported ({:?})",
            state
        );
        if state == SupervisorState::Severed {
            self.sever_locked(&mut inner, id, now);
        }
        Some(state)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().await;
        if self.remove_locked(&mut inner, id) {
            debug!(session_id = %self.session_id, sub_id = id, "Unsubscribed");
        }
    }

    fn remove_locked(&self, inner: &mut Inner, id: SubscriptionId) -> bool {
        if inner.subscribers.remove(&id).is_some() {
            self.metrics.subscription_closed();
            true
        } else {
            false
        }
    }

    fn sever_locked(&self, inner: &mut Inner, id: SubscriptionId, now: Instant) {
        let Some(sub) = inner.subscribers.remove(&id) else {
            return;
        };
        sub.severed.cancel();
        self.metrics.subscription_closed();
        self.metrics.subscription_severed();
        warn!(
            session_id = %self.session_id,
            sub_id = id,
            "Subscription severed after {} transport errors",
            sub.supervisor.error_count()
        );

        if inner
            .thrash
            .record_sever(&sub.client_id, sub.subscribed_at, now)
            && !self.thrashing.is_cancelled()
        {
            warn!(
                session_id = %self.session_id,
                client_id = %sub.client_id,
                "Subscription severed again right after resubscribing"
            );
            self.thrashing.cancel();
        }
    }

    /// Fires when the session should be ended for excessive reconnection.
    pub fn thrashing(&self) -> CancellationToken {
        self.thrashing.clone()
    }

    pub async fn snapshot(&self) -> Snapshot {
        let mut inner = self.inner.lock().await;
        self.metrics.snapshot_served();
        inner.encoder.snapshot()
    }

    /// Record a new terminal size. Snapshots reflect it immediately; the
    /// next published frame announces it.
    pub async fn resize(&self, cols: u16, rows: u16) {
        self.inner.lock().await.encoder.resize(cols, rows);
    }

    pub async fn has_pending_resize(&self) -> bool {
        self.inner.lock().await.encoder.has_pending_resize()
    }

    /// Send the exit notice once to every live subscription and stop
    /// accepting output. Returns `false` if the session had already exited.
    pub async fn mark_exited(&self, notice: ExitNotice) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.exit.is_some() {
            return false;
        }
        inner.exit = Some(notice.clone());

        let subscribers = std::mem::take(&mut inner.subscribers);
        let count = subscribers.len();
        for (_, sub) in subscribers {
            self.metrics.subscription_closed();
            let mut pending = Vec::with_capacity(3);
            if sub.lagging {
                pending.push(StreamEvent::Resync);
                pending.push(StreamEvent::Snapshot(inner.encoder.snapshot()));
            }
            pending.push(StreamEvent::Exit(notice.clone()));
            self.deliver_in_order(sub.tx, pending);
        }

        info!(
            session_id = %self.session_id,
            "Exit notice sent to {} subscribers ({:?})",
            count,
            notice.reason
        );
        true
    }

    /// Queue events without blocking; whatever does not fit is handed to
    /// a task that waits up to the send timeout.
    fn deliver_in_order(&self, tx: mpsc::Sender<StreamEvent>, events: Vec<StreamEvent>) {
        let mut events = events.into_iter();
        while let Some(event) = events.next() {
            match tx.try_send(event) {
                Ok(()) => continue,
                Err(TrySendError::Closed(_)) => return,
                Err(TrySendError::Full(event)) => {
                    let timeout = self.config.send_timeout;
                    let rest: Vec<StreamEvent> = std::iter::once(event).chain(events).collect();
                    tokio::spawn(async move {
                        for event in rest {
                            if tx.send_timeout(event, timeout).await.is_err() {
                                break;
                            }
                        }
                    });
                    return;
                }
            }
        }
    }

    /// Drop every subscription (session deleted). Their streams end.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        let count = inner.subscribers.len();
        for _ in inner.subscribers.drain() {
            self.metrics.subscription_closed();
        }
        if count > 0 {
            debug!(
                session_id = %self.session_id,
                "Closed {} subscriptions",
                count
            );
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }

    pub async fn last_seq(&self) -> u64 {
        self.inner.lock().await.encoder.last_seq()
    }

    pub async fn exit_notice(&self) -> Option<ExitNotice> {
        self.inner.lock().await.exit.clone()
    }
}
