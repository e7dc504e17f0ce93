//! Concurrent signals for one match never double-commit.

mod common;

use std::sync::Barrier;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use common::harness;
use stakeguard::coordinator::BetError;
use stakeguard::{Amount, Signal, TxId, TxStatus};

#[tokio::test(flavor = "multi_thread")]
async fn one_commit_per_match() {
    const THREADS: usize = 8;

    let h = harness();
    *h.actor.action_delay.lock().unwrap() = Duration::from_millis(50);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let coordinator = h.coordinator.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let signal = Signal::new("Inter - Milan", "1", Amount::from_units(10));
                barrier.wait();
                coordinator.process(TxId::from(format!("tx-{i}")), &signal)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let placed = results.iter().filter(|r| r.is_ok()).count();
    assert!(placed >= 1);
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, BetError::InFlight(_) | BetError::Stake(_)), "{e}");
        }
    }

    let committed = h
        .ledger
        .records()
        .unwrap()
        .into_iter()
        .filter(|r| r.status != TxStatus::Void)
        .count();
    assert_eq!(committed, placed);
    assert!(committed <= 1, "{committed} live rows for a single match");
    assert_eq!(h.actor.actions.load(Ordering::SeqCst), placed);
    assert_eq!(h.coordinator.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn different_matches_are_serialized_by_the_permit() {
    let h = harness();
    *h.actor.action_delay.lock().unwrap() = Duration::from_millis(20);

    let handles: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|event| {
            let coordinator = h.coordinator.clone();
            thread::spawn(move || {
                coordinator.process_signal(&Signal::new(event, "1", Amount::from_units(10)))
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(h.ledger.records().unwrap().len(), 3);
    assert_eq!(h.balance(), Amount::from_units(970));
    h.ledger.audit().unwrap();
}
