//! Execution coordinator.
//!
//! Drives one signal through the write-ahead lifecycle around the
//! irreversible action:
//!
//! `RESERVED` -> `PRE_COMMIT` -> action -> `PLACED`
//!
//! When the action does not confirm, the branch is picked by the evidence
//! the actor reports afterwards, never by how far the operation got.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::actor::{Actor, Evidence};
use crate::breaker::{Admission, CircuitBreaker, Trip};
use crate::bus::{Event, EventBus, EventKind};
use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::failure::{Failure, FailureKind};
use crate::ledger::recovery::{MarkerEvidence, RecoveryLog, RecoveryMarker};
use crate::ledger::LedgerStore;
use crate::money::{MoneyManager, Reservation};
use crate::model::{Signal, TxId};

mod error;
mod permit;
mod watchdog;

pub use error::{AfterAction, BetError};
pub use permit::Holder;
use permit::{ActionPermit, SingleFlight};
pub use watchdog::{WatchdogAction, WatchdogReport, run_watchdog};

pub struct Coordinator {
    actor: Arc<dyn Actor>,
    money: Arc<MoneyManager>,
    breaker: Arc<CircuitBreaker>,
    bus: EventBus,
    recovery: Arc<RecoveryLog>,
    clock: Arc<dyn Clock>,
    enabled: AtomicBool,
    in_flight: SingleFlight,
    permit: ActionPermit,
    max_bet_duration: Duration,
}

/// Public API
impl Coordinator {
    pub fn new(
        actor: Arc<dyn Actor>,
        money: Arc<MoneyManager>,
        breaker: Arc<CircuitBreaker>,
        bus: EventBus,
        recovery: Arc<RecoveryLog>,
        clock: Arc<dyn Clock>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            actor,
            money,
            breaker,
            bus,
            recovery,
            clock,
            enabled: AtomicBool::new(config.start_enabled),
            in_flight: SingleFlight::default(),
            permit: ActionPermit::default(),
            max_bet_duration: config.max_bet_duration(),
        }
    }

    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            info!("engine enabled");
        }
    }

    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            warn!("engine disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn ledger(&self) -> &Arc<LedgerStore> {
        self.money.ledger()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Number of match keys with an operation in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// The operation currently holding the action permit, if any.
    pub fn permit_holder(&self) -> Option<Holder> {
        self.permit.holder()
    }

    /// Process a signal under a fresh transaction id.
    pub fn process_signal(&self, signal: &Signal) -> Result<Reservation, BetError> {
        self.process(TxId::generate(), signal)
    }

    /// Process a signal end to end. Blocking: call it from a worker thread.
    ///
    /// Exactly one `BET_SUCCESS` or `BET_FAILED` is published per call,
    /// except when the deadlock watchdog took the operation over, in which
    /// case the watchdog already published it.
    pub fn process(&self, tx_id: TxId, signal: &Signal) -> Result<Reservation, BetError> {
        let result = self.execute(&tx_id, signal);
        match &result {
            Ok(placed) => {
                info!(tx = %tx_id, event = %signal.event, stake = %placed.stake, odds = placed.odds, "bet placed");
                self.bus.publish(Event::bet_success(
                    tx_id,
                    format!("placed {} at {}", placed.stake, placed.odds),
                ));
            }
            Err(BetError::Superseded) => {
                debug!(tx = %tx_id, "operation superseded, outcome already reported");
            }
            Err(e) => {
                warn!(tx = %tx_id, event = %signal.event, reason = %e, "bet failed");
                self.bus.publish(Event::bet_failed(tx_id, e.to_string()));
            }
        }
        result
    }
}

/// Private API
impl Coordinator {
    /// Admission, permit, and breaker bookkeeping around one operation.
    ///
    /// - Reject when disabled or when the match already has an operation
    ///   in flight
    /// - Ask the breaker for admission (a probe in `HALF_OPEN`)
    /// - Wait for the global action permit
    /// - Report the outcome to the breaker
    fn execute(&self, tx_id: &TxId, signal: &Signal) -> Result<Reservation, BetError> {
        if !self.is_enabled() {
            return Err(BetError::Disabled);
        }
        let key = signal.match_key();
        let _flight = self
            .in_flight
            .claim(&key)
            .ok_or_else(|| BetError::InFlight(key.clone()))?;
        let admission = self.breaker.try_admit().ok_or(BetError::BreakerOpen)?;

        let generation = match self.permit.acquire(tx_id, self.clock.now_ms()) {
            Ok(generation) => generation,
            Err(e) => {
                self.report(admission, &Err(e));
                return Err(BetError::PermitPoisoned);
            }
        };
        let result = self.run_permitted(generation, tx_id, signal);
        if !self.permit.release(generation) {
            return Err(BetError::Superseded);
        }
        if !matches!(result, Err(BetError::Superseded)) {
            self.report(admission, &result);
        }
        result
    }

    /// The critical section. Every ledger write goes through the permit so
    /// the watchdog never races it.
    fn run_permitted(
        &self,
        generation: u64,
        tx_id: &TxId,
        signal: &Signal,
    ) -> Result<Reservation, BetError> {
        if !self.actor.is_session_valid() {
            return Err(BetError::SessionInvalid);
        }
        if !self.actor.navigate(&signal.event)? {
            return Err(BetError::EventNotFound(signal.event.clone()));
        }
        let odds = self.actor.get_quote(&signal.event, &signal.market)?;

        let reservation = self
            .permit
            .with_current(generation, || {
                self.money
                    .get_stake_and_reserve(tx_id, signal.stake, odds, &signal.correlation())
            })
            .ok_or(BetError::Superseded)??;

        match self
            .permit
            .with_current(generation, || self.ledger().mark_pre_commit(tx_id))
        {
            None => return Err(BetError::Superseded),
            Some(Err(e)) => {
                self.refund_reserved(generation, tx_id);
                return Err(e.into());
            }
            Some(Ok(())) => {}
        }

        info!(tx = %tx_id, event = %signal.event, market = %signal.market, stake = %reservation.stake, "executing irreversible action");
        let outcome =
            self.actor
                .execute_irreversible_action(&signal.event, &signal.market, reservation.stake);

        match outcome {
            Ok(true) => self.confirm(generation, tx_id).map(|()| reservation),
            Ok(false) => Err(self.unconfirmed(
                generation,
                tx_id,
                Failure::new(FailureKind::Operational, "action not confirmed by actor"),
            )),
            Err(e) => Err(self.unconfirmed(generation, tx_id, Failure::from(&e))),
        }
    }

    /// The action confirmed: record `PLACED`. If that write fails (or the
    /// watchdog already resolved the row) the confirmation is kept in the
    /// recovery log for the next boot.
    fn confirm(&self, generation: u64, tx_id: &TxId) -> Result<(), BetError> {
        match self
            .permit
            .finish(generation, || self.ledger().mark_placed(tx_id))
        {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                error!(tx = %tx_id, reason = %e, "action confirmed but PLACED not recorded");
                self.write_marker(tx_id, MarkerEvidence::ConfirmedUnrecorded);
                Err(BetError::Unrecorded(e))
            }
            None => {
                error!(tx = %tx_id, "late confirmation after watchdog takeover");
                self.write_marker(tx_id, MarkerEvidence::LateConfirmation);
                Err(BetError::Superseded)
            }
        }
    }

    /// The action raised or returned `false`. Ask the actor what really
    /// happened. Only proof that the funds moved changes the outcome: the
    /// row is marked for promotion at the next boot. Anything else leaves
    /// the stake committed in `MANUAL_CHECK`, since after `PRE_COMMIT` only
    /// a human may refund it.
    fn unconfirmed(&self, generation: u64, tx_id: &TxId, cause: Failure) -> BetError {
        let evidence = self.actor.action_evidence();
        warn!(tx = %tx_id, cause = %cause, evidence = ?evidence, "irreversible action did not confirm");

        let resolved = self.permit.with_current(generation, || {
            if evidence == Evidence::Executed {
                self.write_marker(tx_id, MarkerEvidence::SideChannel);
                self.demote(tx_id);
                AfterAction::Marked
            } else {
                self.demote(tx_id);
                AfterAction::ManualCheck
            }
        });

        match resolved {
            Some(after) => BetError::ActionFailed { cause, after },
            None => {
                // the watchdog already moved the row to MANUAL_CHECK
                if evidence == Evidence::Executed {
                    self.write_marker(tx_id, MarkerEvidence::SideChannel);
                }
                BetError::Superseded
            }
        }
    }

    fn demote(&self, tx_id: &TxId) {
        if let Err(e) = self.ledger().demote_to_manual_check(tx_id) {
            // the row stays PRE_COMMIT; boot recovery demotes or promotes it
            error!(tx = %tx_id, reason = %e, "demotion to MANUAL_CHECK failed");
        }
    }

    fn refund_reserved(&self, generation: u64, tx_id: &TxId) {
        match self
            .permit
            .with_current(generation, || self.money.refund(tx_id))
        {
            Some(Ok(outcome)) => info!(tx = %tx_id, outcome = ?outcome, "reservation rolled back"),
            Some(Err(e)) => {
                // still RESERVED; boot recovery refunds it
                error!(tx = %tx_id, reason = %e, "rollback failed")
            }
            None => {}
        }
    }

    fn write_marker(&self, tx_id: &TxId, evidence: MarkerEvidence) {
        let marker = RecoveryMarker {
            tx_id: tx_id.clone(),
            evidence,
            recorded_at: self.clock.now_ms(),
        };
        if let Err(e) = self.recovery.record(&marker) {
            error!(tx = %tx_id, reason = %e, "recovery marker could not be written");
        }
    }

    fn report(&self, admission: Admission, result: &Result<Reservation, BetError>) {
        match result {
            Ok(_) => self.breaker.record_success(),
            Err(e) => {
                let failure = e.failure();
                if failure.kind == Some(FailureKind::Validation) {
                    if admission == Admission::Probe {
                        self.breaker.release_probe();
                    }
                } else if let Some(trip) = self.breaker.record_failure(&failure) {
                    self.publish_trip(&trip);
                }
            }
        }
    }

    fn publish_trip(&self, trip: &Trip) {
        self.bus.publish(Event::system(
            EventKind::BreakerTripped,
            format!("{} ({})", trip.reason, trip.message),
        ));
    }
}
