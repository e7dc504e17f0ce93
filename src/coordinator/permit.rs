//! Single-flight set and the global action permit.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::model::{MatchKey, TxId};

use super::BetError;

/// Match keys with an operation in flight.
#[derive(Default)]
pub(crate) struct SingleFlight {
    keys: Mutex<HashSet<MatchKey>>,
}

impl SingleFlight {
    /// Claim `key`, or `None` if it is already claimed. The claim is
    /// released when the guard drops, on every exit path.
    pub(crate) fn claim(&self, key: &MatchKey) -> Option<FlightGuard<'_>> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(FlightGuard {
            set: self,
            key: key.clone(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.lock().map(|k| k.len()).unwrap_or(0)
    }
}

pub(crate) struct FlightGuard<'a> {
    set: &'a SingleFlight,
    key: MatchKey,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut keys = self.set.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.remove(&self.key);
    }
}

/// The operation currently holding the permit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    pub generation: u64,
    pub tx_id: TxId,
    pub since_ms: u64,
}

#[derive(Default)]
struct PermitState {
    next_generation: u64,
    holder: Option<Holder>,
    /// Generations taken over by the watchdog whose owner has not come back.
    expired: HashSet<u64>,
}

/// One irreversible action in flight at a time.
///
/// Each acquisition gets a fresh generation. Ledger writes made on behalf of
/// the holder run under the permit lock via [`with_current`](Self::with_current),
/// so they can never interleave with the watchdog unwinding the same
/// operation.
#[derive(Default)]
pub(crate) struct ActionPermit {
    state: Mutex<PermitState>,
    released: Condvar,
}

impl ActionPermit {
    /// Block until the permit is free, then take it.
    pub(crate) fn acquire(&self, tx_id: &TxId, now_ms: u64) -> Result<u64, BetError> {
        let mut state = self.lock()?;
        while state.holder.is_some() {
            state = self
                .released
                .wait(state)
                .map_err(|_| BetError::PermitPoisoned)?;
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        state.holder = Some(Holder {
            generation,
            tx_id: tx_id.clone(),
            since_ms: now_ms,
        });
        Ok(generation)
    }

    /// Run `f` under the permit lock if `generation` still holds the permit.
    pub(crate) fn with_current<T>(&self, generation: u64, f: impl FnOnce() -> T) -> Option<T> {
        let state = self.lock().ok()?;
        if !Self::holds(&state, generation) {
            return None;
        }
        let out = f();
        drop(state);
        Some(out)
    }

    /// Like [`with_current`](Self::with_current), and hand the permit on
    /// in the same critical section.
    pub(crate) fn finish<T>(&self, generation: u64, f: impl FnOnce() -> T) -> Option<T> {
        let mut state = self.lock().ok()?;
        if !Self::holds(&state, generation) {
            return None;
        }
        let out = f();
        state.holder = None;
        self.released.notify_one();
        Some(out)
    }

    /// Give the permit back. Returns `false` if the watchdog took it over.
    pub(crate) fn release(&self, generation: u64) -> bool {
        let Ok(mut state) = self.lock() else {
            return false;
        };
        if Self::holds(&state, generation) {
            state.holder = None;
            self.released.notify_one();
            return true;
        }
        !state.expired.remove(&generation)
    }

    /// If the holder has had the permit longer than `max_ms`, run `unwind`
    /// for it under the lock and free the permit.
    pub(crate) fn expire<T>(
        &self,
        now_ms: u64,
        max_ms: u64,
        unwind: impl FnOnce(&Holder) -> T,
    ) -> Option<(Holder, T)> {
        let mut state = self.lock().ok()?;
        let overdue = state
            .holder
            .as_ref()
            .is_some_and(|h| now_ms.saturating_sub(h.since_ms) > max_ms);
        if !overdue {
            return None;
        }
        let holder = state.holder.take()?;
        let out = unwind(&holder);
        state.expired.insert(holder.generation);
        self.released.notify_one();
        Some((holder, out))
    }

    pub(crate) fn holder(&self) -> Option<Holder> {
        self.lock().ok().and_then(|s| s.holder.clone())
    }

    fn holds(state: &PermitState, generation: u64) -> bool {
        state
            .holder
            .as_ref()
            .is_some_and(|h| h.generation == generation)
    }

    fn lock(&self) -> Result<MutexGuard<'_, PermitState>, BetError> {
        self.state.lock().map_err(|_| BetError::PermitPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn flight_claim_is_exclusive_until_dropped() {
        let flights = SingleFlight::default();
        let key = MatchKey::new(1, "Inter - Milan", "1");
        let guard = flights.claim(&key).unwrap();
        assert!(flights.claim(&key).is_none());
        assert_eq!(flights.len(), 1);
        drop(guard);
        assert!(flights.claim(&key).is_some());
    }

    #[test]
    fn permit_is_exclusive() {
        let permit = Arc::new(ActionPermit::default());
        let first = permit.acquire(&TxId::from("A"), 0).unwrap();

        let waiter = {
            let permit = permit.clone();
            thread::spawn(move || permit.acquire(&TxId::from("B"), 10).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(permit.holder().unwrap().tx_id, TxId::from("A"));

        assert!(permit.release(first));
        let second = waiter.join().unwrap();
        assert!(second > first);
        assert_eq!(permit.holder().unwrap().tx_id, TxId::from("B"));
    }

    #[test]
    fn expired_holder_loses_the_permit() {
        let permit = ActionPermit::default();
        let generation = permit.acquire(&TxId::from("A"), 1_000).unwrap();

        assert!(permit.expire(2_000, 5_000, |_| ()).is_none());
        let (holder, ()) = permit.expire(10_000, 5_000, |_| ()).unwrap();
        assert_eq!(holder.tx_id, TxId::from("A"));

        assert!(permit.with_current(generation, || ()).is_none());
        assert!(!permit.release(generation));
        assert!(permit.holder().is_none());
    }

    #[test]
    fn finish_frees_the_permit() {
        let permit = ActionPermit::default();
        let generation = permit.acquire(&TxId::from("A"), 0).unwrap();
        assert_eq!(permit.finish(generation, || 7), Some(7));
        assert!(permit.holder().is_none());
        assert!(permit.release(generation));
    }
}
