//! Stake and exposure policy.
//!
//! The money manager is the only caller of [`LedgerStore::reserve`]. Its
//! checks and the reservation run under one lock, so two concurrent
//! reservations can never both pass an exposure check that only one of
//! them fits under.

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::Amount;
use crate::config::{ConfigError, MoneyConfig};
use crate::failure::{Classify, FailureKind};
use crate::ledger::{LedgerError, LedgerStore, RollbackOutcome};
use crate::model::{Correlation, MatchKey, TxId};

#[derive(Debug, Error)]
pub enum StakeError {
    #[error("invalid odds {odds}: must be finite and above {floor}")]
    InvalidOdds { odds: f64, floor: f64 },

    #[error("stake {0} must be positive")]
    NonPositiveStake(Amount),

    #[error("stake {stake} exceeds available balance {balance}")]
    ExceedsBalance { stake: Amount, balance: Amount },

    #[error("stake {stake} exceeds the per-bet limit {limit}")]
    ExceedsStakeLimit { stake: Amount, limit: Amount },

    #[error("exposure {exposure} plus stake {stake} exceeds max exposure {limit}")]
    ExceedsExposure {
        exposure: Amount,
        stake: Amount,
        limit: Amount,
    },

    #[error("match {0} already has an open bet")]
    DuplicateMatch(MatchKey),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl Classify for StakeError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            StakeError::Ledger(e) => e.failure_kind(),
            _ => FailureKind::Validation,
        }
    }
}

/// A successful reservation.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub tx_id: TxId,
    pub stake: Amount,
    pub odds: f64,
}

/// Auxiliary accounting kept alongside the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoneyStats {
    pub reservations: u64,
    pub refunds: u64,
    pub wins: u64,
    pub losses: u64,
    /// Sum of `payout - stake` over settled bets.
    pub realized_pnl: Amount,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    InSync,
    /// Rows in flight or awaiting settlement make the ledger legitimately
    /// differ; nothing counted.
    Deferred { in_doubt: u64, unsettled: u64 },
    /// A disagreement was seen but is not yet confirmed.
    Pending { streak: u32, diff: Amount },
    Corrected { delta: Amount, balance: Amount },
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_exposure: Amount,
    max_stake_fraction: f64,
    min_odds: f64,
    reconcile_tolerance: Amount,
    reconcile_confirmations: u32,
}

#[derive(Default)]
struct State {
    stats: MoneyStats,
    streak: u32,
    last_diff: Option<Amount>,
}

pub struct MoneyManager {
    ledger: Arc<LedgerStore>,
    limits: Limits,
    state: Mutex<State>,
}

/// Public API
impl MoneyManager {
    pub fn new(ledger: Arc<LedgerStore>, config: &MoneyConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            ledger,
            limits: Limits {
                max_exposure: config.max_exposure()?,
                max_stake_fraction: config.max_stake_fraction,
                min_odds: config.min_odds,
                reconcile_tolerance: config.reconcile_tolerance()?,
                reconcile_confirmations: config.reconcile_confirmations,
            },
            state: Mutex::new(State::default()),
        })
    }

    pub fn ledger(&self) -> &Arc<LedgerStore> {
        &self.ledger
    }

    /// Validate a stake and reserve it.
    ///
    /// - Reject odds that are not finite or at/below the floor
    /// - Reject non-positive stakes and stakes above the balance
    /// - Reject stakes above `max_stake_fraction` of the bankroll
    /// - Reject when pending exposure plus the stake passes `max_exposure`
    /// - Reject a second reservation for a match that already has one pending
    pub fn get_stake_and_reserve(
        &self,
        tx_id: &TxId,
        requested: Amount,
        odds: f64,
        correlation: &Correlation,
    ) -> Result<Reservation, StakeError> {
        let mut state = self.lock()?;
        let result = self.check_and_reserve(tx_id, requested, odds, correlation);
        match &result {
            Ok(reservation) => {
                state.stats.reservations += 1;
                info!(tx = %tx_id, stake = %reservation.stake, odds, "stake reserved");
            }
            Err(e) => warn!(tx = %tx_id, stake = %requested, odds, reason = %e, "stake rejected"),
        }
        result
    }

    pub fn refund(&self, tx_id: &TxId) -> Result<RollbackOutcome, StakeError> {
        let mut state = self.lock()?;
        let outcome = self.ledger.rollback(tx_id)?;
        if matches!(outcome, RollbackOutcome::Refunded(_)) {
            state.stats.refunds += 1;
        }
        Ok(outcome)
    }

    /// Settle a winning bet. Returns the new balance.
    pub fn win(&self, tx_id: &TxId, payout: Amount) -> Result<Amount, StakeError> {
        let mut state = self.lock()?;
        let stake = self.stake_of(tx_id)?;
        let balance = self.ledger.settle(tx_id, payout)?;
        state.stats.wins += 1;
        state.stats.realized_pnl += payout - stake;
        info!(tx = %tx_id, payout = %payout, balance = %balance, "bet won");
        Ok(balance)
    }

    /// Settle a losing bet. Returns the (unchanged) balance.
    pub fn loss(&self, tx_id: &TxId) -> Result<Amount, StakeError> {
        let mut state = self.lock()?;
        let stake = self.stake_of(tx_id)?;
        let balance = self.ledger.settle(tx_id, Amount::ZERO)?;
        state.stats.losses += 1;
        state.stats.realized_pnl -= stake;
        info!(tx = %tx_id, stake = %stake, "bet lost");
        Ok(balance)
    }

    /// Compare the ledger against the external balance. A correction is only
    /// applied after `reconcile_confirmations` consecutive readings disagree
    /// by the same amount (within tolerance), and never while any row is in
    /// flight or placed but unsettled. The external balance already holds the
    /// payout of a finished match; correcting to it before `win` records that
    /// payout would count it twice.
    pub fn reconcile_balances(&self, external: Amount) -> Result<ReconcileOutcome, StakeError> {
        let mut state = self.lock()?;

        let in_doubt = self.ledger.in_doubt_count()?;
        let unsettled = self.ledger.unsettled_count()?;
        if in_doubt > 0 || unsettled > 0 {
            state.streak = 0;
            state.last_diff = None;
            debug!(in_doubt, unsettled, "reconciliation deferred");
            return Ok(ReconcileOutcome::Deferred {
                in_doubt,
                unsettled,
            });
        }

        let current = self.ledger.balance()?.current;
        let diff = external - current;
        let tolerance = self.limits.reconcile_tolerance;
        if diff.abs() <= tolerance {
            state.streak = 0;
            state.last_diff = None;
            return Ok(ReconcileOutcome::InSync);
        }

        let same = state
            .last_diff
            .is_some_and(|last| (last - diff).abs() <= tolerance);
        state.streak = if same { state.streak + 1 } else { 1 };
        state.last_diff = Some(diff);

        if state.streak < self.limits.reconcile_confirmations {
            warn!(
                ledger = %current,
                external = %external,
                streak = state.streak,
                "balance disagreement, waiting for confirmation"
            );
            return Ok(ReconcileOutcome::Pending {
                streak: state.streak,
                diff,
            });
        }

        let balance = self.ledger.apply_correction(diff, "reconcile")?;
        state.streak = 0;
        state.last_diff = None;
        warn!(delta = %diff, balance = %balance, "ledger corrected to external balance");
        Ok(ReconcileOutcome::Corrected {
            delta: diff,
            balance,
        })
    }

    pub fn stats(&self) -> MoneyStats {
        self.state.lock().map(|s| s.stats).unwrap_or_default()
    }
}

/// Private API
impl MoneyManager {
    fn lock(&self) -> Result<MutexGuard<'_, State>, StakeError> {
        self.state
            .lock()
            .map_err(|_| StakeError::Ledger(LedgerError::Poisoned))
    }

    fn check_and_reserve(
        &self,
        tx_id: &TxId,
        stake: Amount,
        odds: f64,
        correlation: &Correlation,
    ) -> Result<Reservation, StakeError> {
        let floor = self.limits.min_odds;
        if !odds.is_finite() || odds <= floor {
            return Err(StakeError::InvalidOdds { odds, floor });
        }
        if !stake.is_positive() {
            return Err(StakeError::NonPositiveStake(stake));
        }

        let balance = self.ledger.balance()?.current;
        if stake > balance {
            return Err(StakeError::ExceedsBalance { stake, balance });
        }
        let limit = balance.mul_ratio(self.limits.max_stake_fraction);
        if stake > limit {
            return Err(StakeError::ExceedsStakeLimit { stake, limit });
        }

        let exposure = self.ledger.pending_exposure()?;
        if exposure + stake > self.limits.max_exposure {
            return Err(StakeError::ExceedsExposure {
                exposure,
                stake,
                limit: self.limits.max_exposure,
            });
        }
        if self.ledger.has_pending_match(&correlation.match_key)? {
            return Err(StakeError::DuplicateMatch(correlation.match_key.clone()));
        }

        self.ledger.reserve(tx_id, stake, correlation)?;
        Ok(Reservation {
            tx_id: tx_id.clone(),
            stake,
            odds,
        })
    }

    fn stake_of(&self, tx_id: &TxId) -> Result<Amount, StakeError> {
        match self.ledger.get(tx_id)? {
            Some(record) => Ok(record.amount),
            // let the ledger raise the unknown-row violation
            None => Ok(Amount::ZERO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::{GuardMode, InvariantGuard};
    use crate::model::TxStatus;

    fn manager() -> (tempfile::TempDir, MoneyManager) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = LedgerStore::open(
            dir.path().join("ledger.db"),
            Amount::from_units(1000),
            InvariantGuard::new(GuardMode::Raise),
        )
        .unwrap();
        let manager = MoneyManager::new(Arc::new(ledger), &MoneyConfig::default()).unwrap();
        (dir, manager)
    }

    fn corr(event: &str) -> Correlation {
        Correlation {
            table_id: 1,
            match_key: MatchKey::new(1, event, "home"),
            label: event.to_string(),
        }
    }

    fn reserve(m: &MoneyManager, tx: &str, units: i64, odds: f64, event: &str) -> Result<Reservation, StakeError> {
        m.get_stake_and_reserve(&TxId::from(tx), Amount::from_units(units), odds, &corr(event))
    }

    #[test]
    fn valid_stake_is_reserved() {
        let (_dir, m) = manager();
        let r = reserve(&m, "A", 10, 2.0, "a").unwrap();
        assert_eq!(r.stake, Amount::from_units(10));
        assert_eq!(m.ledger().balance().unwrap().current, Amount::from_units(990));
        assert_eq!(m.stats().reservations, 1);
    }

    #[test]
    fn bad_odds_are_rejected_without_side_effect() {
        let (_dir, m) = manager();
        for odds in [1.01, 1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                reserve(&m, "A", 10, odds, "a"),
                Err(StakeError::InvalidOdds { .. })
            ));
        }
        assert!(m.ledger().records().unwrap().is_empty());
    }

    #[test]
    fn non_positive_stake_is_rejected() {
        let (_dir, m) = manager();
        assert!(matches!(
            reserve(&m, "A", 0, 2.0, "a"),
            Err(StakeError::NonPositiveStake(_))
        ));
    }

    #[test]
    fn stake_above_fraction_is_rejected() {
        let (_dir, m) = manager();
        let err = reserve(&m, "A", 201, 2.0, "a").unwrap_err();
        assert!(matches!(err, StakeError::ExceedsStakeLimit { .. }));
        assert_eq!(err.failure_kind(), FailureKind::Validation);
    }

    #[test]
    fn exposure_ceiling_counts_pending_rows() {
        let (_dir, m) = manager();
        reserve(&m, "A", 150, 2.0, "a").unwrap();
        assert!(matches!(
            reserve(&m, "B", 60, 2.0, "b"),
            Err(StakeError::ExceedsExposure { .. })
        ));
        reserve(&m, "C", 50, 2.0, "c").unwrap();
    }

    #[test]
    fn duplicate_match_is_rejected() {
        let (_dir, m) = manager();
        reserve(&m, "A", 10, 2.0, "Inter - Milan").unwrap();
        assert!(matches!(
            reserve(&m, "B", 10, 2.0, "inter milan"),
            Err(StakeError::DuplicateMatch(_))
        ));
    }

    #[test]
    fn settlement_wrappers_keep_bookkeeping() {
        let (_dir, m) = manager();
        for tx in ["A", "B"] {
            reserve(&m, tx, 10, 2.0, tx).unwrap();
            m.ledger().mark_pre_commit(&TxId::from(tx)).unwrap();
            m.ledger().mark_placed(&TxId::from(tx)).unwrap();
        }
        m.win(&TxId::from("A"), Amount::from_units(25)).unwrap();
        m.loss(&TxId::from("B")).unwrap();

        let stats = m.stats();
        assert_eq!((stats.wins, stats.losses), (1, 1));
        assert_eq!(stats.realized_pnl, Amount::from_units(5));
        assert_eq!(m.ledger().balance().unwrap().current, Amount::from_units(1005));
    }

    #[test]
    fn refund_voids_a_reservation() {
        let (_dir, m) = manager();
        reserve(&m, "A", 10, 2.0, "a").unwrap();
        assert_eq!(
            m.refund(&TxId::from("A")).unwrap(),
            RollbackOutcome::Refunded(Amount::from_units(10))
        );
        assert_eq!(
            m.ledger().get(&TxId::from("A")).unwrap().unwrap().status,
            TxStatus::Void
        );
        assert_eq!(m.stats().refunds, 1);
    }

    #[test]
    fn reconcile_needs_consecutive_confirmations() {
        let (_dir, m) = manager();
        let external = Amount::from_units(990);

        assert_eq!(
            m.reconcile_balances(Amount::from_units(1000)).unwrap(),
            ReconcileOutcome::InSync
        );
        assert!(matches!(
            m.reconcile_balances(external).unwrap(),
            ReconcileOutcome::Pending { streak: 1, .. }
        ));
        assert!(matches!(
            m.reconcile_balances(external).unwrap(),
            ReconcileOutcome::Pending { streak: 2, .. }
        ));
        assert_eq!(
            m.reconcile_balances(external).unwrap(),
            ReconcileOutcome::Corrected {
                delta: Amount::from_units(-10),
                balance: external,
            }
        );
        assert_eq!(m.ledger().balance().unwrap().current, external);
        assert_eq!(m.ledger().balance().unwrap().peak, Amount::from_units(1000));
        m.ledger().audit().unwrap();
    }

    #[test]
    fn noisy_readings_reset_the_streak() {
        let (_dir, m) = manager();
        m.reconcile_balances(Amount::from_units(990)).unwrap();
        m.reconcile_balances(Amount::from_units(990)).unwrap();
        m.reconcile_balances(Amount::from_units(1000)).unwrap();
        assert!(matches!(
            m.reconcile_balances(Amount::from_units(990)).unwrap(),
            ReconcileOutcome::Pending { streak: 1, .. }
        ));
    }

    #[test]
    fn reconcile_waits_for_in_flight_rows() {
        let (_dir, m) = manager();
        reserve(&m, "A", 10, 2.0, "a").unwrap();
        assert_eq!(
            m.reconcile_balances(Amount::from_units(500)).unwrap(),
            ReconcileOutcome::Deferred {
                in_doubt: 1,
                unsettled: 0,
            }
        );
    }

    #[test]
    fn reconcile_waits_for_unsettled_bets() {
        let (_dir, m) = manager();
        let a = TxId::from("A");
        reserve(&m, "A", 10, 2.0, "a").unwrap();
        m.ledger().mark_pre_commit(&a).unwrap();
        m.ledger().mark_placed(&a).unwrap();

        // the match already paid out externally, the ledger has not settled it
        let external = Amount::from_units(1015);
        for _ in 0..3 {
            assert_eq!(
                m.reconcile_balances(external).unwrap(),
                ReconcileOutcome::Deferred {
                    in_doubt: 0,
                    unsettled: 1,
                }
            );
        }
        assert_eq!(m.ledger().balance().unwrap().current, Amount::from_units(990));

        assert_eq!(m.win(&a, Amount::from_units(25)).unwrap(), external);
        assert_eq!(
            m.reconcile_balances(external).unwrap(),
            ReconcileOutcome::InSync
        );
        m.ledger().audit().unwrap();
    }
}
