use std::collections::HashSet;

use criterion::{BatchSize, BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use stakeguard::guard::{GuardMode, InvariantGuard};
use stakeguard::ledger::LedgerStore;
use stakeguard::model::{Correlation, MatchKey};
use stakeguard::{Amount, TxId};

/// Produces one correlation per transaction so that no two rows share a
/// match key.
pub struct SignalGenerator {
    next: u64,
    count: u64,
}

impl SignalGenerator {
    pub fn new(count: u64) -> Self {
        Self { next: 0, count }
    }
}

impl Iterator for SignalGenerator {
    type Item = (TxId, Correlation);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let n = self.next;
        self.next += 1;
        let label = format!("home {n} - away {n}");
        Some((
            TxId::from(format!("tx-{n}")),
            Correlation {
                table_id: (n % 4) as u32 + 1,
                match_key: MatchKey::new(1, &label, "1"),
                label,
            },
        ))
    }
}

fn fresh_store() -> (tempfile::TempDir, LedgerStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = LedgerStore::open(
        dir.path().join("ledger.db"),
        Amount::from_units(1_000_000),
        InvariantGuard::new(GuardMode::Raise),
    )
    .unwrap();
    (dir, store)
}

/// Every row walks RESERVED -> PRE_COMMIT -> PLACED -> SETTLED, three
/// fsync'd writes plus the settlement.
fn bench_full_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("lifecycle");
    group.sample_size(10);

    for count in [10u64, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                fresh_store,
                |(dir, store)| {
                    for (tx, corr) in SignalGenerator::new(count) {
                        store.reserve(&tx, Amount::from_units(1), &corr).unwrap();
                        store.mark_pre_commit(&tx).unwrap();
                        store.mark_placed(&tx).unwrap();
                        black_box(store.settle(&tx, Amount::from_units(2)).unwrap());
                    }
                    (dir, store)
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

/// Boot-time cost: recover a ledger full of rows stranded mid-flight, then
/// audit it.
fn bench_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery");
    group.sample_size(10);

    group.bench_function("200_stranded", |b| {
        b.iter_batched(
            || {
                let (dir, store) = fresh_store();
                for (i, (tx, corr)) in SignalGenerator::new(200).enumerate() {
                    store.reserve(&tx, Amount::from_units(1), &corr).unwrap();
                    if i % 2 == 0 {
                        store.mark_pre_commit(&tx).unwrap();
                    }
                }
                (dir, store)
            },
            |(dir, store)| {
                black_box(store.recover_on_boot(&HashSet::new()).unwrap());
                black_box(store.audit().unwrap());
                (dir, store)
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_full_lifecycle, bench_recovery);
criterion_main!(benches);
