//! Shared fixtures: a scripted actor and a fully wired coordinator.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use stakeguard::actor::{Actor, ActorError, Evidence};
use stakeguard::breaker::CircuitBreaker;
use stakeguard::bus::{Event, EventBus};
use stakeguard::clock::ManualClock;
use stakeguard::config::{BreakerConfig, BusConfig, CoordinatorConfig, MoneyConfig};
use stakeguard::coordinator::Coordinator;
use stakeguard::guard::{GuardMode, InvariantGuard};
use stakeguard::ledger::LedgerStore;
use stakeguard::ledger::recovery::RecoveryLog;
use stakeguard::money::MoneyManager;
use stakeguard::{Amount, TxId, TxStatus};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

/// What the next irreversible action does.
#[derive(Debug, Clone)]
pub enum Outcome {
    Confirm,
    Reject,
    Raise(ActorError),
}

/// An actor whose every answer is set by the test.
pub struct ScriptedActor {
    pub session_valid: AtomicBool,
    pub odds: Mutex<f64>,
    pub navigate_error: Mutex<Option<ActorError>>,
    pub outcomes: Mutex<VecDeque<Outcome>>,
    pub evidence: Mutex<Evidence>,
    /// When set, the next quote or action blocks until a value arrives.
    pub quote_gate: Mutex<Option<mpsc::Receiver<()>>>,
    pub action_gate: Mutex<Option<mpsc::Receiver<()>>>,
    pub action_delay: Mutex<Duration>,
    pub actions: AtomicUsize,
}

impl ScriptedActor {
    pub fn new() -> Self {
        Self {
            session_valid: AtomicBool::new(true),
            odds: Mutex::new(2.0),
            navigate_error: Mutex::new(None),
            outcomes: Mutex::new(VecDeque::new()),
            evidence: Mutex::new(Evidence::Unknown),
            quote_gate: Mutex::new(None),
            action_gate: Mutex::new(None),
            action_delay: Mutex::new(Duration::ZERO),
            actions: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, outcome: Outcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn set_evidence(&self, evidence: Evidence) {
        *self.evidence.lock().unwrap() = evidence;
    }

    pub fn set_odds(&self, odds: f64) {
        *self.odds.lock().unwrap() = odds;
    }

    /// Block the next action until the returned sender fires.
    pub fn gate_action(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        *self.action_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn gate_quote(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        *self.quote_gate.lock().unwrap() = Some(rx);
        tx
    }

    fn wait(gate: &Mutex<Option<mpsc::Receiver<()>>>) {
        let rx = gate.lock().unwrap().take();
        if let Some(rx) = rx {
            let _ = rx.recv_timeout(Duration::from_secs(10));
        }
    }
}

impl Actor for ScriptedActor {
    fn is_session_valid(&self) -> bool {
        self.session_valid.load(Ordering::SeqCst)
    }

    fn navigate(&self, _target: &str) -> Result<bool, ActorError> {
        match self.navigate_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    fn get_quote(&self, _target: &str, _market: &str) -> Result<f64, ActorError> {
        Self::wait(&self.quote_gate);
        Ok(*self.odds.lock().unwrap())
    }

    fn execute_irreversible_action(
        &self,
        _target: &str,
        _market: &str,
        _stake: Amount,
    ) -> Result<bool, ActorError> {
        self.actions.fetch_add(1, Ordering::SeqCst);
        Self::wait(&self.action_gate);
        let delay = *self.action_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        match self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Confirm)
        {
            Outcome::Confirm => Ok(true),
            Outcome::Reject => Ok(false),
            Outcome::Raise(e) => Err(e),
        }
    }

    fn action_evidence(&self) -> Evidence {
        *self.evidence.lock().unwrap()
    }

    fn get_external_balance(&self) -> Result<Amount, ActorError> {
        Ok(Amount::from_units(1000))
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub clock: Arc<ManualClock>,
    pub actor: Arc<ScriptedActor>,
    pub ledger: Arc<LedgerStore>,
    pub breaker: Arc<CircuitBreaker>,
    pub recovery: Arc<RecoveryLog>,
    pub bus: EventBus,
    pub coordinator: Arc<Coordinator>,
    events: ReceiverStream<Event>,
}

/// A coordinator over a fresh 1000-unit ledger. Must be called from within
/// a tokio runtime.
pub fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let actor = Arc::new(ScriptedActor::new());
    let ledger = Arc::new(
        LedgerStore::open_with_clock(
            dir.path().join("ledger.db"),
            Amount::from_units(1000),
            InvariantGuard::new(GuardMode::Raise),
            clock.clone(),
        )
        .unwrap(),
    );
    let recovery = Arc::new(RecoveryLog::open(dir.path().join("recovery.log")).unwrap());
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), clock.clone()));
    let bus = EventBus::start(&BusConfig::default());
    let events = bus.subscribe(&[]);
    let money = Arc::new(MoneyManager::new(ledger.clone(), &MoneyConfig::default()).unwrap());
    let config = CoordinatorConfig {
        start_enabled: true,
        ..CoordinatorConfig::default()
    };
    let coordinator = Arc::new(Coordinator::new(
        actor.clone(),
        money,
        breaker.clone(),
        bus.clone(),
        recovery.clone(),
        clock.clone(),
        &config,
    ));

    Harness {
        dir,
        clock,
        actor,
        ledger,
        breaker,
        recovery,
        bus,
        coordinator,
        events,
    }
}

impl Harness {
    /// Stop the bus and return everything it delivered.
    pub async fn events(self) -> Vec<Event> {
        self.bus.stop().await;
        self.events.collect().await
    }

    pub fn status(&self, tx: &TxId) -> Option<TxStatus> {
        self.ledger.get(tx).unwrap().map(|r| r.status)
    }

    pub fn balance(&self) -> Amount {
        self.ledger.balance().unwrap().current
    }

    /// Poll until `tx` reaches `status`.
    pub fn wait_for(&self, tx: &TxId, status: TxStatus) {
        for _ in 0..200 {
            if self.status(tx) == Some(status) {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("{tx} never reached {status}");
    }
}
