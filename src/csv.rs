use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::Amount;
use crate::amount::AmountError;
use crate::breaker::BreakerStatus;
use crate::model::{BalanceSnapshot, Signal, TxRecord};

/// Errors that can occur when reading signals or writing reports
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("cannot open {path}: {source}")]
    Open { path: PathBuf, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: invalid stake: {source}")]
    InvalidStake { line: usize, source: AmountError },

    #[error("line {line}: empty {field}")]
    EmptyField { line: usize, field: &'static str },

    #[error("failed to write csv: {0}")]
    Write(csv::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct SignalRow {
    #[serde(rename = "match")]
    event: String,
    market: String,
    stake: f64,
    table: Option<u32>,
}

#[derive(Debug, Serialize)]
struct RecordRow<'a> {
    tx_id: &'a str,
    status: &'static str,
    amount: String,
    payout: String,
    table: u32,
    match_key: &'a str,
    label: &'a str,
    created_at: u64,
}

#[derive(Debug, Serialize)]
struct StatusRow {
    key: &'static str,
    value: String,
}

/// Read signals (`match,market,stake[,table]`) from a csv file
pub fn read_signals(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Signal, CsvError>>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<SignalRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            if row.event.is_empty() {
                return Err(CsvError::EmptyField {
                    line,
                    field: "match",
                });
            }
            if row.market.is_empty() {
                return Err(CsvError::EmptyField {
                    line,
                    field: "market",
                });
            }
            let stake = Amount::try_from_f64(row.stake)
                .map_err(|source| CsvError::InvalidStake { line, source })?;
            let mut signal = Signal::new(row.event, row.market, stake);
            if let Some(table) = row.table {
                signal.table_id = table;
            }
            Ok(signal)
        }))
}

const RECORD_HEADER: [&str; 8] = [
    "tx_id",
    "status",
    "amount",
    "payout",
    "table",
    "match_key",
    "label",
    "created_at",
];

/// Write ledger rows in csv format. The header is written even when there
/// are no rows.
pub fn write_records<'a>(
    records: impl IntoIterator<Item = &'a TxRecord>,
    out: impl io::Write,
) -> Result<(), CsvError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(out);
    writer
        .write_record(RECORD_HEADER)
        .map_err(CsvError::Write)?;

    for record in records {
        let row = RecordRow {
            tx_id: record.tx_id.as_str(),
            status: record.status.as_str(),
            amount: record.amount.to_string(),
            payout: record.payout.to_string(),
            table: record.table_id,
            match_key: record.match_key.as_str(),
            label: &record.label,
            created_at: record.created_at,
        };
        writer.serialize(&row).map_err(CsvError::Write)?;
    }

    writer.flush()?;
    Ok(())
}

/// Write the balance and breaker summary as `key,value` rows
pub fn write_status(
    balance: &BalanceSnapshot,
    breaker: &BreakerStatus,
    pending: usize,
    unsettled: usize,
    out: impl io::Write,
) -> Result<(), CsvError> {
    let rows = [
        ("current_balance", balance.current.to_string()),
        ("peak_balance", balance.peak.to_string()),
        ("initial_balance", balance.initial.to_string()),
        ("pending", pending.to_string()),
        ("unsettled", unsettled.to_string()),
        ("breaker_state", breaker.state.to_string()),
        ("structural_lock", breaker.structural_lock.to_string()),
        ("breaker_trips", breaker.trips.to_string()),
    ];

    let mut writer = csv::Writer::from_writer(out);
    for (key, value) in rows {
        writer
            .serialize(StatusRow { key, value })
            .map_err(CsvError::Write)?;
    }
    writer.flush()?;
    Ok(())
}
