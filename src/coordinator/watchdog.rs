//! Deadlock watchdog over the action permit.
//!
//! An operation that holds the permit longer than the maximum bet duration
//! is unwound from the outside: its reservation is refunded (or its
//! pre-commit demoted to manual check), the permit is freed, and the breaker
//! records a structural failure. The wedged external call itself is never
//! interrupted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::bus::{Event, EventKind};
use crate::failure::{Failure, FailureKind};
use crate::model::{TxId, TxStatus};

use super::Coordinator;

/// What the watchdog did to the stuck operation's ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Stuck before reserving; nothing to undo.
    NoReservation,
    Refunded,
    ManualCheck,
    /// The row had already moved on.
    Untouched(TxStatus),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogReport {
    pub tx_id: TxId,
    pub held: Duration,
    pub action: WatchdogAction,
}

impl Coordinator {
    /// One watchdog pass. Returns a report when it had to fire.
    pub fn check_watchdog(&self) -> Option<WatchdogReport> {
        let now = self.clock.now_ms();
        let max_ms = self.max_bet_duration.as_millis() as u64;
        let (holder, action) = self
            .permit
            .expire(now, max_ms, |holder| self.unwind(&holder.tx_id))?;

        let held = Duration::from_millis(now.saturating_sub(holder.since_ms));
        let reason = format!(
            "deadlock watchdog: action permit held for {}s ({action:?})",
            held.as_secs()
        );
        error!(tx = %holder.tx_id, held_secs = held.as_secs(), action = ?action, "deadlock watchdog fired");

        let failure = Failure::new(FailureKind::StructuralRecoverable, reason.clone());
        if let Some(trip) = self.breaker.record_failure(&failure) {
            self.publish_trip(&trip);
        }
        self.bus
            .publish(Event::system(EventKind::WatchdogFired, reason.clone()));
        self.bus
            .publish(Event::bet_failed(holder.tx_id.clone(), reason));

        Some(WatchdogReport {
            tx_id: holder.tx_id,
            held,
            action,
        })
    }

    fn unwind(&self, tx_id: &TxId) -> WatchdogAction {
        let record = match self.ledger().get(tx_id) {
            Ok(Some(record)) => record,
            Ok(None) => return WatchdogAction::NoReservation,
            Err(e) => return WatchdogAction::Failed(e.to_string()),
        };
        match record.status {
            TxStatus::Reserved => match self.money.refund(tx_id) {
                Ok(_) => WatchdogAction::Refunded,
                Err(e) => WatchdogAction::Failed(e.to_string()),
            },
            TxStatus::PreCommit => match self.ledger().demote_to_manual_check(tx_id) {
                Ok(()) => WatchdogAction::ManualCheck,
                Err(e) => WatchdogAction::Failed(e.to_string()),
            },
            status => WatchdogAction::Untouched(status),
        }
    }
}

/// Run [`Coordinator::check_watchdog`] every `interval` until `shutdown`
/// flips to `true`.
pub async fn run_watchdog(
    coordinator: Arc<Coordinator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs_f64(), "deadlock watchdog started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let coordinator = coordinator.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || coordinator.check_watchdog()).await {
                    error!(reason = %e, "watchdog pass panicked");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("deadlock watchdog stopped");
}
