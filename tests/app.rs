//! The booted application against the paper actor.

use std::sync::Arc;

use stakeguard::actor::PaperActor;
use stakeguard::app::{AdminError, App, BootError};
use stakeguard::bus::EventKind;
use stakeguard::config::Config;
use stakeguard::guard::GuardMode;
use stakeguard::ledger::Resolution;
use stakeguard::model::{Correlation, MatchKey};
use stakeguard::money::ReconcileOutcome;
use stakeguard::{Amount, Signal, TxId, TxStatus};
use tokio_stream::StreamExt;

fn config(dir: &tempfile::TempDir) -> Config {
    Config {
        data_dir: dir.path().to_path_buf(),
        guard_mode: GuardMode::Raise,
        ..Config::default()
    }
}

fn boot(config: Config) -> App {
    let actor = Arc::new(PaperActor::new(Amount::from_units(1000)));
    App::boot(config, actor).unwrap()
}

fn signals() -> impl tokio_stream::Stream<Item = Signal> + Unpin {
    tokio_stream::iter(vec![
        Signal::new("Inter - Milan", "1", Amount::from_units(10)),
        Signal::new("Roma - Lazio", "X", Amount::from_units(20)),
        Signal::new("Napoli - Juventus", "2", Amount::from_units(30)),
    ])
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_signals_drain_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let app = boot(config(&dir));
    let outcomes = app
        .bus()
        .subscribe(&[EventKind::BetSuccess, EventKind::BetFailed]);
    app.enable();

    assert_eq!(app.run(signals()).await, 3);
    app.shutdown().await;

    let records = app.ledger().records().unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == TxStatus::Placed));
    assert_eq!(
        app.ledger().balance().unwrap().current,
        Amount::from_units(940)
    );
    assert_eq!(
        app.reconcile_once(),
        Some(ReconcileOutcome::Deferred {
            in_doubt: 0,
            unsettled: 3,
        })
    );
    for record in &records {
        app.settle(&record.tx_id, Amount::ZERO).unwrap();
    }
    assert_eq!(app.reconcile_once(), Some(ReconcileOutcome::InSync));

    let events: Vec<_> = outcomes.collect().await;
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.kind == EventKind::BetSuccess));
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_app_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let app = boot(config(&dir));

    assert!(!app.status().unwrap().enabled);
    app.run(signals()).await;
    app.shutdown().await;
    assert!(app.ledger().records().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn admin_settles_and_rejects_bad_input() {
    let dir = tempfile::tempdir().unwrap();
    let app = boot(config(&dir));
    app.enable();
    app.run(signals()).await;
    app.shutdown().await;

    let records = app.ledger().records().unwrap();
    let (win, loss) = (records[0].tx_id.clone(), records[1].tx_id.clone());

    assert_eq!(
        app.settle(&win, Amount::from_units(20)).unwrap(),
        Amount::from_units(960)
    );
    assert_eq!(app.settle(&loss, Amount::ZERO).unwrap(), Amount::from_units(960));
    assert_eq!(app.status().unwrap().unsettled.len(), 1);

    assert!(matches!(
        app.settle(&win, Amount::from_units(20)),
        Err(AdminError::WrongStatus {
            status: TxStatus::Settled,
            ..
        })
    ));
    assert!(matches!(
        app.settle(&records[2].tx_id, Amount::from_units(-1)),
        Err(AdminError::NegativePayout(_))
    ));
    assert!(matches!(
        app.resolve(&TxId::from("nope"), Resolution::Placed),
        Err(AdminError::UnknownTx(_))
    ));
    assert!(matches!(
        app.resolve(&win, Resolution::NotPlaced),
        Err(AdminError::WrongStatus { .. })
    ));
    app.ledger().audit().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let app = boot(config(&dir));
        app.enable();
        app.run(signals()).await;
        app.shutdown().await;
    }

    let app = boot(config(&dir));
    assert!(app.recovery_report().is_clean());
    let status = app.status().unwrap();
    assert_eq!(status.balance.current, Amount::from_units(940));
    assert_eq!(status.unsettled.len(), 3);
    assert_eq!(status.pending.len(), 3);
    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn second_boot_on_a_held_data_dir_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let first = boot(config(&dir));
    let tx = TxId::from("in-flight");
    let label = "Inter - Milan".to_string();
    let correlation = Correlation {
        table_id: 1,
        match_key: MatchKey::new(1, &label, "1"),
        label,
    };
    first
        .ledger()
        .reserve(&tx, Amount::from_units(10), &correlation)
        .unwrap();

    let actor = Arc::new(PaperActor::new(Amount::from_units(1000)));
    let err = App::boot(config(&dir), actor).err().unwrap();
    assert!(matches!(err, BootError::DataDirInUse { .. }));

    // a refused boot never runs recovery over the live ledger
    let record = first.ledger().get(&tx).unwrap().unwrap();
    assert_eq!(record.status, TxStatus::Reserved);
    assert_eq!(
        first.ledger().balance().unwrap().current,
        Amount::from_units(990)
    );
    first.shutdown().await;
    drop(first);

    let second = boot(config(&dir));
    assert_eq!(second.recovery_report().refunded, vec![tx.clone()]);
    assert_eq!(second.ledger().get(&tx).unwrap().unwrap().status, TxStatus::Void);
    second.shutdown().await;
}
