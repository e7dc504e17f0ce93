//! Adaptive circuit breaker.
//!
//! Gates whether a new operation may begin. Failures are kept in a sliding
//! window and two independent thresholds can open the circuit: a burst (N
//! failures within a short window) and a sustained rate (M failures within a
//! long window). How long it stays open depends on the severity of the
//! failure that tripped it, never on which threshold fired. After the
//! cooldown exactly one probe operation is admitted (`HALF_OPEN`); its
//! outcome closes or re-opens the circuit.
//!
//! State survives restarts through an atomically rewritten JSON file.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::failure::Failure;

mod classify;
mod state;

pub use classify::{DefaultClassifier, FailureClassifier, Severity, classify_message, severity_of};
pub use state::BreakerState;
use state::{PersistedState, StateFile};

/// What kind of admission [`CircuitBreaker::try_admit`] granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single `HALF_OPEN` probe. Its outcome decides the circuit.
    Probe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripReason {
    Burst { count: usize, window_secs: u64 },
    Sustained { count: usize, window_secs: u64 },
    Structural(Severity),
    ProbeFailed,
    ProbeTimeout,
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripReason::Burst { count, window_secs } => {
                write!(f, "burst: {count} failures within {window_secs}s")
            }
            TripReason::Sustained { count, window_secs } => {
                write!(f, "sustained: {count} failures within {window_secs}s")
            }
            TripReason::Structural(severity) => write!(f, "structural failure ({severity})"),
            TripReason::ProbeFailed => write!(f, "half-open probe failed"),
            TripReason::ProbeTimeout => write!(f, "half-open probe timed out"),
        }
    }
}

/// A transition into `OPEN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trip {
    pub reason: TripReason,
    pub severity: Severity,
    /// `None` when structurally locked until a manual reset.
    pub cooldown_until: Option<u64>,
    /// The failure that tripped the circuit.
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub structural_lock: bool,
    pub cooldown_until: Option<u64>,
    pub failures_in_window: usize,
    pub probe_outstanding: bool,
    pub trips: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    None,
    Available,
    Outstanding { since: u64 },
}

struct Inner {
    state: BreakerState,
    failures: VecDeque<u64>,
    cooldown_until: Option<u64>,
    structural_lock: bool,
    probe: Probe,
    trips: u64,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    classifier: Box<dyn FailureClassifier>,
    clock: Arc<dyn Clock>,
    store: Option<StateFile>,
    inner: Mutex<Inner>,
}

/// Public API
impl CircuitBreaker {
    /// A breaker that keeps its state in memory only.
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            classifier: Box::new(DefaultClassifier),
            clock,
            store: None,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                cooldown_until: None,
                structural_lock: false,
                probe: Probe::None,
                trips: 0,
            }),
        }
    }

    /// A breaker persisted at `path`, restored from it if present.
    ///
    /// A stale `OPEN` whose cooldown fully elapsed during downtime is
    /// cleared. A `HALF_OPEN` probe that was outstanding when the process
    /// died is handed out again.
    pub fn with_state_file(
        config: BreakerConfig,
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut breaker = Self::new(config, clock);
        let store = StateFile::new(path);

        if let Some(saved) = store.load() {
            let now = breaker.clock.now_ms();
            let inner = breaker.inner.get_mut().unwrap_or_else(|e| e.into_inner());
            inner.state = saved.state;
            inner.cooldown_until = saved.cooldown_until;
            inner.structural_lock = saved.structural_lock;
            inner.failures = saved.failures.into_iter().collect();

            let stale = inner.state == BreakerState::Open
                && !inner.structural_lock
                && inner.cooldown_until.is_some_and(|until| now >= until);
            if stale {
                inner.state = BreakerState::Closed;
                inner.cooldown_until = None;
                inner.failures.clear();
                info!("breaker cooldown elapsed during downtime, reset to CLOSED");
            } else {
                if inner.state == BreakerState::HalfOpen {
                    inner.probe = Probe::Available;
                }
                info!(state = %inner.state, locked = inner.structural_lock, "breaker state restored");
            }
        }

        breaker.store = Some(store);
        breaker.prune_and_persist();
        breaker
    }

    /// Replace the failure classification policy.
    pub fn with_classifier(mut self, classifier: Box<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Ask to start an operation.
    ///
    /// - `CLOSED`: always admitted
    /// - `OPEN`: rejected until the cooldown deadline, then the circuit goes
    ///   `HALF_OPEN` and this caller receives the probe
    /// - `HALF_OPEN`: the probe is handed out at most once; a probe that has
    ///   been outstanding too long counts as a failure and re-opens
    pub fn try_admit(&self) -> Option<Admission> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();

        if inner.structural_lock {
            return None;
        }

        match inner.state {
            BreakerState::Closed => Some(Admission::Normal),
            BreakerState::Open => {
                if inner.cooldown_until.is_some_and(|until| now >= until) {
                    inner.state = BreakerState::HalfOpen;
                    inner.cooldown_until = None;
                    inner.probe = Probe::Outstanding { since: now };
                    self.persist(&inner);
                    warn!("breaker HALF_OPEN: one probe operation admitted");
                    Some(Admission::Probe)
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => match inner.probe {
                Probe::Available | Probe::None => {
                    inner.probe = Probe::Outstanding { since: now };
                    warn!("breaker HALF_OPEN: one probe operation admitted");
                    Some(Admission::Probe)
                }
                Probe::Outstanding { since } => {
                    if now.saturating_sub(since) > self.config.half_open_timeout_secs * 1000 {
                        error!("breaker HALF_OPEN probe timed out, re-opening");
                        self.register_failure(
                            &mut inner,
                            Severity::Operational,
                            "half-open probe timed out",
                            now,
                        );
                    }
                    None
                }
            },
        }
    }

    pub fn allow_request(&self) -> bool {
        self.try_admit().is_some()
    }

    /// Hand back an unused probe: the admitted operation was rejected before
    /// it had any side effect, so it proved nothing either way.
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen
            && matches!(inner.probe, Probe::Outstanding { .. })
        {
            inner.probe = Probe::Available;
            info!("breaker probe released unused");
        }
    }

    /// Clear the failure window and close the circuit. A structural lock is
    /// only ever cleared by [`manual_reset`](Self::manual_reset).
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.structural_lock {
            warn!("success recorded while structurally locked, circuit stays OPEN");
            return;
        }
        if inner.state != BreakerState::Closed {
            info!(from = %inner.state, "breaker CLOSED");
        }
        inner.failures.clear();
        inner.state = BreakerState::Closed;
        inner.cooldown_until = None;
        inner.probe = Probe::None;
        self.persist(&inner);
    }

    /// Record a failure. Returns the trip when this failure opened (or
    /// re-opened) the circuit. Validation failures are ignored.
    pub fn record_failure(&self, failure: &Failure) -> Option<Trip> {
        if failure.kind.is_some_and(|kind| !kind.counts_against_breaker()) {
            return None;
        }
        let severity = self.classifier.classify(failure);
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        self.register_failure(&mut inner, severity, &failure.message, now)
    }

    /// Administrative override: clear the lock, the window and any cooldown.
    pub fn manual_reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.structural_lock = false;
        inner.cooldown_until = None;
        inner.failures.clear();
        inner.probe = Probe::None;
        self.persist(&inner);
        warn!("breaker manually reset to CLOSED");
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock();
        BreakerStatus {
            state: inner.state,
            structural_lock: inner.structural_lock,
            cooldown_until: inner.cooldown_until,
            failures_in_window: inner.failures.len(),
            probe_outstanding: matches!(inner.probe, Probe::Outstanding { .. }),
            trips: inner.trips,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }
}

/// Private API
impl CircuitBreaker {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // breaker state stays meaningful even if a holder panicked
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register_failure(
        &self,
        inner: &mut Inner,
        severity: Severity,
        message: &str,
        now: u64,
    ) -> Option<Trip> {
        inner.failures.push_back(now);
        self.prune(inner, now);
        warn!(
            severity = %severity,
            failures = inner.failures.len(),
            reason = message,
            "breaker recorded failure"
        );

        let trip = if inner.state == BreakerState::HalfOpen {
            let reason = match inner.probe {
                Probe::Outstanding { since }
                    if now.saturating_sub(since) > self.config.half_open_timeout_secs * 1000 =>
                {
                    TripReason::ProbeTimeout
                }
                _ => TripReason::ProbeFailed,
            };
            if severity == Severity::StructuralFatal {
                Some(self.lock_open(inner, message))
            } else {
                Some(self.open(inner, reason, severity, self.config.operational_cooldown_secs, now, message))
            }
        } else {
            match severity {
                Severity::StructuralFatal => Some(self.lock_open(inner, message)),
                Severity::StructuralRecoverable => Some(self.open(
                    inner,
                    TripReason::Structural(severity),
                    severity,
                    self.config.recoverable_cooldown_secs,
                    now,
                    message,
                )),
                Severity::Transient | Severity::Operational => {
                    self.rate_limit(inner, now).map(|reason| {
                        let cooldown = if severity == Severity::Transient {
                            self.config.transient_cooldown_secs
                        } else {
                            self.config.operational_cooldown_secs
                        };
                        self.open(inner, reason, severity, cooldown, now, message)
                    })
                }
            }
        };

        self.persist(inner);
        trip
    }

    fn rate_limit(&self, inner: &Inner, now: u64) -> Option<TripReason> {
        let count = inner.failures.len();
        if count >= self.config.sustained_threshold {
            return Some(TripReason::Sustained {
                count,
                window_secs: self.config.sustained_window_secs,
            });
        }
        let burst = self.config.burst_threshold;
        if count >= burst {
            let start = inner.failures[count - burst];
            if now.saturating_sub(start) <= self.config.burst_window_secs * 1000 {
                return Some(TripReason::Burst {
                    count: burst,
                    window_secs: self.config.burst_window_secs,
                });
            }
        }
        None
    }

    fn open(
        &self,
        inner: &mut Inner,
        reason: TripReason,
        severity: Severity,
        cooldown_secs: u64,
        now: u64,
        message: &str,
    ) -> Trip {
        let mut until = now + cooldown_secs * 1000;
        if inner.state == BreakerState::Open {
            // a late failure never shortens a cooldown already running
            until = until.max(inner.cooldown_until.unwrap_or(0));
        }
        inner.state = BreakerState::Open;
        inner.cooldown_until = Some(until);
        inner.probe = Probe::None;
        inner.trips += 1;
        error!(reason = %reason, severity = %severity, cooldown_secs, "breaker OPEN");
        Trip {
            reason,
            severity,
            cooldown_until: Some(until),
            message: message.to_string(),
        }
    }

    fn lock_open(&self, inner: &mut Inner, message: &str) -> Trip {
        inner.state = BreakerState::Open;
        inner.structural_lock = true;
        inner.cooldown_until = None;
        inner.probe = Probe::None;
        inner.trips += 1;
        error!(reason = message, "structural fatal failure, breaker locked until manual reset");
        Trip {
            reason: TripReason::Structural(Severity::StructuralFatal),
            severity: Severity::StructuralFatal,
            cooldown_until: None,
            message: message.to_string(),
        }
    }

    fn prune(&self, inner: &mut Inner, now: u64) {
        let window = self.config.sustained_window_secs * 1000;
        while inner
            .failures
            .front()
            .is_some_and(|&t| now.saturating_sub(t) > window)
        {
            inner.failures.pop_front();
        }
    }

    fn prune_and_persist(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        self.prune(&mut inner, now);
        self.persist(&inner);
    }

    fn persist(&self, inner: &Inner) {
        if let Some(store) = &self.store {
            store.save(&PersistedState {
                state: inner.state,
                cooldown_until: inner.cooldown_until,
                structural_lock: inner.structural_lock,
                failures: inner.failures.iter().copied().collect(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::failure::FailureKind;

    fn breaker() -> (Arc<ManualClock>, CircuitBreaker) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let breaker = CircuitBreaker::new(BreakerConfig::default(), clock.clone());
        (clock, breaker)
    }

    fn transient() -> Failure {
        Failure::new(FailureKind::Transient, "timeout")
    }

    fn operational() -> Failure {
        Failure::new(FailureKind::Operational, "button missing")
    }

    #[test]
    fn burst_opens_until_cooldown_then_one_probe() {
        let (clock, breaker) = breaker();
        assert!(breaker.record_failure(&transient()).is_none());
        assert!(breaker.record_failure(&transient()).is_none());
        let trip = breaker.record_failure(&transient()).unwrap();
        assert!(matches!(trip.reason, TripReason::Burst { count: 3, .. }));
        assert!(!breaker.allow_request());

        clock.advance(Duration::from_secs(59));
        assert!(!breaker.allow_request());

        clock.advance(Duration::from_secs(1));
        assert_eq!(breaker.try_admit(), Some(Admission::Probe));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.allow_request());
        assert!(!breaker.allow_request());
    }

    #[test]
    fn spread_out_failures_do_not_burst() {
        let (clock, breaker) = breaker();
        for _ in 0..4 {
            assert!(breaker.record_failure(&operational()).is_none());
            clock.advance(Duration::from_secs(61));
        }
        assert!(breaker.allow_request());
    }

    #[test]
    fn sustained_threshold_opens_with_operational_cooldown() {
        let (clock, breaker) = breaker();
        for _ in 0..4 {
            breaker.record_failure(&operational());
            clock.advance(Duration::from_secs(600));
        }
        let trip = breaker.record_failure(&operational()).unwrap();
        assert!(matches!(trip.reason, TripReason::Sustained { count: 5, .. }));

        clock.advance(Duration::from_secs(119));
        assert!(!breaker.allow_request());
        clock.advance(Duration::from_secs(1));
        assert!(breaker.allow_request());
    }

    #[test]
    fn old_failures_fall_out_of_the_window() {
        let (clock, breaker) = breaker();
        for _ in 0..4 {
            breaker.record_failure(&operational());
        }
        // the third one tripped the burst; wait it all out
        clock.advance(Duration::from_secs(3601));
        assert!(breaker.allow_request());
        breaker.record_success();
        breaker.record_failure(&operational());
        assert_eq!(breaker.status().failures_in_window, 1);
    }

    #[test]
    fn probe_success_closes() {
        let (clock, breaker) = breaker();
        breaker.record_failure(&Failure::new(FailureKind::StructuralRecoverable, "login"));
        clock.advance(Duration::from_secs(600));
        assert_eq!(breaker.try_admit(), Some(Admission::Probe));
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.try_admit(), Some(Admission::Normal));
    }

    #[test]
    fn probe_failure_reopens_with_operational_cooldown() {
        let (clock, breaker) = breaker();
        breaker.record_failure(&Failure::new(FailureKind::StructuralRecoverable, "login"));
        clock.advance(Duration::from_secs(600));
        assert!(breaker.allow_request());

        let trip = breaker.record_failure(&transient()).unwrap();
        assert_eq!(trip.reason, TripReason::ProbeFailed);
        clock.advance(Duration::from_secs(119));
        assert!(!breaker.allow_request());
        clock.advance(Duration::from_secs(1));
        assert!(breaker.allow_request());
    }

    #[test]
    fn stuck_probe_times_out_and_reopens() {
        let (clock, breaker) = breaker();
        breaker.record_failure(&Failure::new(FailureKind::StructuralRecoverable, "session"));
        clock.advance(Duration::from_secs(600));
        assert!(breaker.allow_request());

        clock.advance(Duration::from_secs(181));
        assert!(!breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn released_probe_can_be_reissued() {
        let (clock, breaker) = breaker();
        breaker.record_failure(&Failure::new(FailureKind::StructuralRecoverable, "session"));
        clock.advance(Duration::from_secs(600));
        assert!(breaker.allow_request());
        breaker.release_probe();
        assert_eq!(breaker.try_admit(), Some(Admission::Probe));
        assert!(!breaker.allow_request());
    }

    #[test]
    fn fatal_locks_until_manual_reset() {
        let (clock, breaker) = breaker();
        let trip = breaker
            .record_failure(&Failure::new(FailureKind::StructuralFatal, "disk is full"))
            .unwrap();
        assert_eq!(trip.cooldown_until, None);

        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert!(!breaker.allow_request());
        breaker.record_success();
        assert!(!breaker.allow_request());

        breaker.manual_reset();
        assert!(breaker.allow_request());
        assert!(!breaker.status().structural_lock);
    }

    #[test]
    fn validation_failures_are_ignored() {
        let (_clock, breaker) = breaker();
        for _ in 0..10 {
            assert!(
                breaker
                    .record_failure(&Failure::new(FailureKind::Validation, "odds too low"))
                    .is_none()
            );
        }
        assert_eq!(breaker.status().failures_in_window, 0);
        assert!(breaker.allow_request());
    }

    #[test]
    fn untyped_failures_use_keywords() {
        let (_clock, breaker) = breaker();
        let trip = breaker
            .record_failure(&Failure::untyped("Captcha challenge"))
            .unwrap();
        assert_eq!(trip.severity, Severity::StructuralRecoverable);
    }

    #[test]
    fn custom_classifier_replaces_policy() {
        struct AlwaysFatal;
        impl FailureClassifier for AlwaysFatal {
            fn classify(&self, _failure: &Failure) -> Severity {
                Severity::StructuralFatal
            }
        }
        let (_clock, breaker) = breaker();
        let breaker = breaker.with_classifier(Box::new(AlwaysFatal));
        breaker.record_failure(&transient());
        assert!(breaker.status().structural_lock);
    }

    #[test]
    fn concurrent_callers_get_one_probe() {
        let (clock, breaker) = breaker();
        breaker.record_failure(&Failure::new(FailureKind::StructuralRecoverable, "session"));
        clock.advance(Duration::from_secs(600));

        let breaker = Arc::new(breaker);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let breaker = breaker.clone();
                std::thread::spawn(move || breaker.allow_request())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn open_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breaker_state.json");
        let clock = Arc::new(ManualClock::new(1_000_000));

        let breaker =
            CircuitBreaker::with_state_file(BreakerConfig::default(), &path, clock.clone());
        breaker.record_failure(&Failure::new(FailureKind::StructuralRecoverable, "session"));
        drop(breaker);

        clock.advance(Duration::from_secs(300));
        let breaker =
            CircuitBreaker::with_state_file(BreakerConfig::default(), &path, clock.clone());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
        drop(breaker);

        clock.advance(Duration::from_secs(400));
        let breaker = CircuitBreaker::with_state_file(BreakerConfig::default(), &path, clock);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.status().failures_in_window, 0);
    }

    #[test]
    fn structural_lock_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breaker_state.json");
        let clock = Arc::new(ManualClock::new(1_000_000));

        let breaker =
            CircuitBreaker::with_state_file(BreakerConfig::default(), &path, clock.clone());
        breaker.record_failure(&Failure::new(FailureKind::Invariant, "duplicate tx"));
        drop(breaker);

        clock.advance(Duration::from_secs(86_400));
        let breaker = CircuitBreaker::with_state_file(BreakerConfig::default(), &path, clock);
        assert!(breaker.status().structural_lock);
        assert!(!breaker.allow_request());
    }
}
