use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveTime, SecondsFormat};
use corelib::TimeRange;
use csv_async::AsyncWriter;
use tokio::fs::File;
use tracing::{info, instrument};

use crate::error::AppError;
use crate::store::{AlertOrder, AlertQuery, AlertSink};

pub const REPORT_HEADER: [&str; 5] = ["symbol", "ts", "rule", "score", "details"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportSummary {
    pub path: PathBuf,
    pub rows: usize,
}

pub fn report_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("alerts_{}.csv", date.format("%Y-%m-%d")))
}

/// `[date 00:00, date+1 00:00)` in UTC.
pub fn day_range(date: NaiveDate) -> Result<TimeRange, AppError> {
    let next = date
        .succ_opt()
        .ok_or_else(|| AppError::Report(format!("no day after {date}")))?;

    Ok(TimeRange::between(
        date.and_time(NaiveTime::MIN).and_utc(),
        next.and_time(NaiveTime::MIN).and_utc(),
    ))
}

/// Writes every alert timestamped on `date` (UTC), highest score first.
/// An empty day still produces a header-only file.
#[instrument(skip(sink, dir), target = "report", fields(dir = %dir.display()))]
pub async fn export_daily(
    sink: &dyn AlertSink,
    dir: &Path,
    date: NaiveDate,
) -> Result<ReportSummary, AppError> {
    let query = AlertQuery::default()
        .in_range(day_range(date)?)
        .ordered_by(AlertOrder::ScoreDesc);
    let alerts = sink.query(&query).await.map_err(AppError::Store)?;

    tokio::fs::create_dir_all(dir).await?;
    let path = report_path(dir, date);
    let file = File::create(&path).await?;

    let report_err = |e: csv_async::Error| AppError::Report(e.to_string());
    let mut writer = AsyncWriter::from_writer(file);
    writer.write_record(&REPORT_HEADER).await.map_err(report_err)?;

    for a in &alerts {
        let ts = a.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
        let score = a.score.to_string();
        let details = a.details_text();
        writer
            .write_record(&[a.symbol.as_str(), ts.as_str(), a.rule.as_str(), score.as_str(), details.as_str()])
            .await
            .map_err(report_err)?;
    }
    writer.flush().await?;

    info!(path = %path.display(), rows = alerts.len(), "daily report written");
    Ok(ReportSummary {
        path,
        rows: alerts.len(),
    })
}
