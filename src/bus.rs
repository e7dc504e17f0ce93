//! Bounded publish/subscribe event bus.
//!
//! Each event category has its own lane (a bounded queue) and its own
//! dispatcher task, so a backlog of bet events never delays system events.
//! Publishing never blocks: a full lane drops the event with a warning.
//! Events that sat in a lane longer than the TTL are discarded instead of
//! being delivered late.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::BusConfig;
use crate::model::TxId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BetSuccess,
    BetFailed,
    BreakerTripped,
    WatchdogFired,
    RecoveryCompleted,
    BalanceCorrected,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::BetSuccess => "BET_SUCCESS",
            EventKind::BetFailed => "BET_FAILED",
            EventKind::BreakerTripped => "BREAKER_TRIPPED",
            EventKind::WatchdogFired => "WATCHDOG_FIRED",
            EventKind::RecoveryCompleted => "RECOVERY_COMPLETED",
            EventKind::BalanceCorrected => "BALANCE_CORRECTED",
        }
    }

    pub fn lane(self) -> Lane {
        match self {
            EventKind::BetSuccess | EventKind::BetFailed => Lane::Bet,
            _ => Lane::System,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Bet,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub tx_id: Option<TxId>,
    /// Human-readable reason or detail.
    pub reason: String,
}

impl Event {
    pub fn bet_success(tx_id: TxId, reason: impl Into<String>) -> Self {
        Self {
            kind: EventKind::BetSuccess,
            tx_id: Some(tx_id),
            reason: reason.into(),
        }
    }

    pub fn bet_failed(tx_id: TxId, reason: impl Into<String>) -> Self {
        Self {
            kind: EventKind::BetFailed,
            tx_id: Some(tx_id),
            reason: reason.into(),
        }
    }

    pub fn system(kind: EventKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            tx_id: None,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    /// Dropped because a lane or a subscriber queue was full, or the bus
    /// was stopped.
    pub dropped: u64,
    /// Discarded by the TTL.
    pub stale: u64,
}

struct Envelope {
    event: Event,
    published: Instant,
}

struct Subscriber {
    /// Empty means every kind.
    kinds: HashSet<EventKind>,
    tx: mpsc::Sender<Event>,
}

struct Lanes {
    bet: mpsc::Sender<Envelope>,
    system: mpsc::Sender<Envelope>,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    stale: AtomicU64,
}

struct Shared {
    lanes: Mutex<Option<Lanes>>,
    subscribers: Mutex<Vec<Subscriber>>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
    subscriber_capacity: usize,
}

/// Cheap to clone; every clone publishes into the same lanes.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl EventBus {
    /// Create the lanes and spawn one dispatcher per lane. Must be called
    /// from within a tokio runtime.
    pub fn start(config: &BusConfig) -> Self {
        let (bet_tx, bet_rx) = mpsc::channel(config.lane_capacity);
        let (system_tx, system_rx) = mpsc::channel(config.lane_capacity);

        let shared = Arc::new(Shared {
            lanes: Mutex::new(Some(Lanes {
                bet: bet_tx,
                system: system_tx,
            })),
            subscribers: Mutex::new(Vec::new()),
            dispatchers: Mutex::new(Vec::new()),
            counters: Counters::default(),
            subscriber_capacity: config.subscriber_capacity.max(1),
        });

        let ttl = config.ttl();
        let handles = vec![
            tokio::spawn(dispatch(shared.clone(), bet_rx, ttl)),
            tokio::spawn(dispatch(shared.clone(), system_rx, ttl)),
        ];
        if let Ok(mut dispatchers) = shared.dispatchers.lock() {
            dispatchers.extend(handles);
        }

        Self { shared }
    }

    /// Non-blocking. Returns whether the event was queued.
    pub fn publish(&self, event: Event) -> bool {
        let counters = &self.shared.counters;
        let Ok(lanes) = self.shared.lanes.lock() else {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let Some(lanes) = lanes.as_ref() else {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(kind = %event.kind, "bus stopped, event dropped");
            return false;
        };

        let lane = match event.kind.lane() {
            Lane::Bet => &lanes.bet,
            Lane::System => &lanes.system,
        };
        let kind = event.kind;
        match lane.try_send(Envelope {
            event,
            published: Instant::now(),
        }) {
            Ok(()) => {
                counters.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(envelope)) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = %kind, tx = ?envelope.event.tx_id, "event lane full, event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Subscribe to the given kinds (all kinds when empty).
    pub fn subscribe(&self, kinds: &[EventKind]) -> ReceiverStream<Event> {
        let (tx, rx) = mpsc::channel(self.shared.subscriber_capacity);
        if let Ok(mut subscribers) = self.shared.subscribers.lock() {
            subscribers.push(Subscriber {
                kinds: kinds.iter().copied().collect(),
                tx,
            });
        }
        ReceiverStream::new(rx)
    }

    /// Close the lanes, let the dispatchers drain what is queued, then end
    /// every subscription.
    pub async fn stop(&self) {
        if let Ok(mut lanes) = self.shared.lanes.lock() {
            lanes.take();
        }
        let handles: Vec<_> = match self.shared.dispatchers.lock() {
            Ok(mut dispatchers) => dispatchers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(reason = %e, "event dispatcher ended abnormally");
            }
        }
        if let Ok(mut subscribers) = self.shared.subscribers.lock() {
            subscribers.clear();
        }
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.shared.counters;
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
        }
    }
}

async fn dispatch(shared: Arc<Shared>, mut rx: mpsc::Receiver<Envelope>, ttl: Duration) {
    while let Some(envelope) = rx.recv().await {
        let age = envelope.published.elapsed();
        if age > ttl {
            shared.counters.stale.fetch_add(1, Ordering::Relaxed);
            warn!(
                kind = %envelope.event.kind,
                age_ms = age.as_millis() as u64,
                "stale event discarded"
            );
            continue;
        }
        deliver(&shared, envelope.event);
    }
}

fn deliver(shared: &Shared, event: Event) {
    let Ok(mut subscribers) = shared.subscribers.lock() else {
        return;
    };
    subscribers.retain(|sub| !sub.tx.is_closed());
    for sub in subscribers.iter() {
        if !sub.kinds.is_empty() && !sub.kinds.contains(&event.kind) {
            continue;
        }
        match sub.tx.try_send(event.clone()) {
            Ok(()) => {
                shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = %event.kind, "subscriber queue full, event dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
