//! CSV ingestion into the staging and fact tables.
//!
//! Files are addressed by header name, fields are trimmed, and every load is a
//! batch-replace of its table. Rows that do not parse are skipped and counted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::logger::warn_if_slow;
use corelib::time::parse_timestamp;
use corelib::{Bar, Factor, Quote, Symbol, Trade};
use csv_async::{AsyncReaderBuilder, StringRecord, Trim};
use futures::StreamExt;
use tokio::fs::File;
use tokio::io::BufReader;
use tracing::{info, instrument, warn};

use crate::error::AppError;
use crate::store::TableLoader;

const SLOW_LOAD: Duration = Duration::from_secs(5);

/// Outcome of loading one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadReport {
    pub table: &'static str,
    pub loaded: u64,
    pub skipped: usize,
}

/// One of the four CSV inputs, with its file name, target table and header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceFile {
    Trades,
    Quotes,
    Bars,
    Factors,
}

impl SourceFile {
    pub const ALL: [SourceFile; 4] = [
        SourceFile::Trades,
        SourceFile::Quotes,
        SourceFile::Bars,
        SourceFile::Factors,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            SourceFile::Trades => "trades.csv",
            SourceFile::Quotes => "quotes.csv",
            SourceFile::Bars => "bars.csv",
            SourceFile::Factors => "factors.csv",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            SourceFile::Trades => "stg_trades",
            SourceFile::Quotes => "stg_quotes",
            SourceFile::Bars => "fact_bars_1m",
            SourceFile::Factors => "fact_factors",
        }
    }

    pub fn columns(self) -> &'static [&'static str] {
        match self {
            SourceFile::Trades => &["symbol", "ts", "price", "size"],
            SourceFile::Quotes => &["symbol", "ts", "bid", "ask", "bid_size", "ask_size"],
            SourceFile::Bars => &["symbol", "ts", "open", "high", "low", "close", "volume"],
            SourceFile::Factors => &["symbol", "ts", "spread_bp", "vol_5m", "vol_30m", "fair_value"],
        }
    }
}

/// Loads every input present in `dir`. Missing files are skipped with a warning.
#[instrument(skip(loader, dir), target = "ingest", fields(dir = %dir.display()))]
pub async fn ingest_dir(loader: &dyn TableLoader, dir: &Path) -> Result<Vec<LoadReport>, AppError> {
    let mut reports = Vec::with_capacity(SourceFile::ALL.len());

    for source in SourceFile::ALL {
        let path = dir.join(source.file_name());
        if !tokio::fs::try_exists(&path).await? {
            warn!(path = %path.display(), "input file missing, skipping");
            continue;
        }

        reports.push(load_file(loader, source, &path).await?);
    }

    Ok(reports)
}

/// Reads `path` as `source` and batch-replaces the target table.
pub async fn load_file(
    loader: &dyn TableLoader,
    source: SourceFile,
    path: &Path,
) -> Result<LoadReport, AppError> {
    let (loaded, skipped) = match source {
        SourceFile::Trades => {
            let (rows, skipped) = read_rows(path, source.columns(), parse_trade).await?;
            (write(path, loader.replace_trades(&rows)).await?, skipped)
        }
        SourceFile::Quotes => {
            let (rows, skipped) = read_rows(path, source.columns(), parse_quote).await?;
            (write(path, loader.replace_quotes(&rows)).await?, skipped)
        }
        SourceFile::Bars => {
            let (rows, skipped) = read_rows(path, source.columns(), parse_bar).await?;
            (write(path, loader.replace_bars(&rows)).await?, skipped)
        }
        SourceFile::Factors => {
            let (rows, skipped) = read_rows(path, source.columns(), parse_factor).await?;
            (write(path, loader.replace_factors(&rows)).await?, skipped)
        }
    };

    let report = LoadReport {
        table: source.table(),
        loaded,
        skipped,
    };
    info!(table = report.table, loaded, skipped, "table loaded");
    Ok(report)
}

async fn write<F>(path: &Path, fut: F) -> Result<u64, AppError>
where
    F: Future<Output = Result<u64, crate::error::StoreError>>,
{
    warn_if_slow("table_load", SLOW_LOAD, fut)
        .await
        .map_err(|e| AppError::Ingest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/* =========================
CSV reading
========================= */

/// Header name → field position.
struct Columns {
    index: HashMap<String, usize>,
}

impl Columns {
    fn from_headers(headers: &StringRecord, required: &[&str]) -> Result<Self, String> {
        let index: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.to_ascii_lowercase(), i))
            .collect();

        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|c| !index.contains_key(*c))
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing columns: {}", missing.join(", ")));
        }

        Ok(Self { index })
    }

    fn raw<'r>(&self, record: &'r StringRecord, name: &str) -> Option<&'r str> {
        self.index.get(name).and_then(|&i| record.get(i))
    }

    fn text<'r>(&self, record: &'r StringRecord, name: &str) -> Result<&'r str, String> {
        match self.raw(record, name) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(format!("{name}: empty")),
        }
    }

    fn f64(&self, record: &StringRecord, name: &str) -> Result<f64, String> {
        parse_finite(name, self.text(record, name)?)
    }

    /// Empty field reads as absent.
    fn opt_f64(&self, record: &StringRecord, name: &str) -> Result<Option<f64>, String> {
        match self.raw(record, name) {
            None | Some("") => Ok(None),
            Some(v) => parse_finite(name, v).map(Some),
        }
    }

    fn i64(&self, record: &StringRecord, name: &str) -> Result<i64, String> {
        let v = self.text(record, name)?;
        v.parse().map_err(|_| format!("{name}: not an integer: {v:?}"))
    }

    fn symbol(&self, record: &StringRecord) -> Result<Symbol, String> {
        self.text(record, "symbol").map(Symbol::from)
    }

    fn timestamp(&self, record: &StringRecord) -> Result<chrono::DateTime<chrono::Utc>, String> {
        parse_timestamp(self.text(record, "ts")?).map_err(|e| e.to_string())
    }
}

/// Streams `path` and parses each record; unparseable records are counted.
async fn read_rows<T>(
    path: &Path,
    required: &[&str],
    parse: fn(&Columns, &StringRecord) -> Result<T, String>,
) -> Result<(Vec<T>, usize), AppError> {
    let ingest_err = |reason: String| AppError::Ingest {
        path: PathBuf::from(path),
        reason,
    };

    let file = File::open(path).await?;
    let mut csv_reader = AsyncReaderBuilder::new()
        .trim(Trim::All)
        .create_reader(BufReader::new(file));

    let headers = csv_reader
        .headers()
        .await
        .map_err(|e| ingest_err(e.to_string()))?
        .clone();
    let columns = Columns::from_headers(&headers, required).map_err(ingest_err)?;

    let mut records = csv_reader.records();
    let mut rows = Vec::new();
    let mut skipped = 0usize;
    let mut line = 1u64;

    while let Some(record) = records.next().await {
        line += 1;
        let parsed = record
            .map_err(|e| e.to_string())
            .and_then(|r| parse(&columns, &r));

        match parsed {
            Ok(row) => rows.push(row),
            Err(reason) => {
                warn!(target: "ingest", path = %path.display(), line, %reason, "skipping malformed csv row");
                skipped += 1;
            }
        }
    }

    Ok((rows, skipped))
}

fn parse_trade(c: &Columns, r: &StringRecord) -> Result<Trade, String> {
    Ok(Trade {
        symbol: c.symbol(r)?,
        timestamp: c.timestamp(r)?,
        price: c.f64(r, "price")?,
        size: c.i64(r, "size")?,
    })
}

fn parse_quote(c: &Columns, r: &StringRecord) -> Result<Quote, String> {
    Ok(Quote {
        symbol: c.symbol(r)?,
        timestamp: c.timestamp(r)?,
        bid: c.f64(r, "bid")?,
        ask: c.f64(r, "ask")?,
        bid_size: c.i64(r, "bid_size")?,
        ask_size: c.i64(r, "ask_size")?,
    })
}

fn parse_bar(c: &Columns, r: &StringRecord) -> Result<Bar, String> {
    Ok(Bar {
        symbol: c.symbol(r)?,
        timestamp: c.timestamp(r)?,
        open: c.f64(r, "open")?,
        high: c.f64(r, "high")?,
        low: c.f64(r, "low")?,
        close: c.f64(r, "close")?,
        volume: c.f64(r, "volume")?,
    })
}

fn parse_factor(c: &Columns, r: &StringRecord) -> Result<Factor, String> {
    Ok(Factor {
        symbol: c.symbol(r)?,
        timestamp: c.timestamp(r)?,
        spread_bp: c.f64(r, "spread_bp")?,
        vol_5m: c.opt_f64(r, "vol_5m")?,
        vol_30m: c.opt_f64(r, "vol_30m")?,
        fair_value: c.opt_f64(r, "fair_value")?,
    })
}

/// NaN and infinities parse but cannot be stored.
fn parse_finite(name: &str, v: &str) -> Result<f64, String> {
    let x: f64 = v.parse().map_err(|_| format!("{name}: not a number: {v:?}"))?;
    if !x.is_finite() {
        return Err(format!("{name}: not finite: {v:?}"));
    }
    Ok(x)
}
