use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use corelib::TimeRange;
use corelib::time::parse_timestamp;
use engine::{RuleEngine, RuleRegistry};
use tracing::info;

use crate::api::{self, ApiState};
use crate::config::AppConfig;
use crate::db::Db;
use crate::ingest::ingest_dir;
use crate::job::{JobSummary, SurveillanceJob};
use crate::report::export_daily;
use crate::store::SqlStore;

#[derive(Debug, Parser)]
#[clap(name = "surveillance", version, about = "Batch market surveillance over bars and factors")]
pub struct Cli {
    /// Overrides DATABASE_URL.
    #[clap(long, global = true)]
    pub database_url: Option<String>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create tables and indexes.
    Bootstrap,

    /// Load trades/quotes/bars/factors CSV files (batch-replace).
    Ingest {
        #[clap(long)]
        data_dir: Option<PathBuf>,
    },

    /// Evaluate the rules and record new alerts.
    Run {
        /// Inclusive lower bound (RFC 3339 or `YYYY-MM-DD HH:MM:SS`).
        #[clap(long, value_parser = parse_ts)]
        since: Option<DateTime<Utc>>,

        /// Exclusive upper bound.
        #[clap(long, value_parser = parse_ts)]
        until: Option<DateTime<Utc>>,

        /// Evaluate symbols one by one.
        #[clap(long)]
        sequential: bool,
    },

    /// Export one UTC day of alerts to CSV.
    Report {
        /// Defaults to today (UTC).
        #[clap(long)]
        date: Option<NaiveDate>,

        #[clap(long)]
        reports_dir: Option<PathBuf>,
    },

    /// Serve the read API.
    Serve {
        #[clap(long)]
        bind: Option<String>,
    },

    /// bootstrap → ingest → run → report.
    Pipeline,
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(raw).map_err(|e| e.to_string())
}

impl Cli {
    /// Folds command-line overrides into the environment config.
    pub fn apply(&self, cfg: &mut AppConfig) {
        if let Some(url) = &self.database_url {
            cfg.database_url = url.clone();
        }

        match &self.command {
            Command::Ingest {
                data_dir: Some(dir),
            } => cfg.data_dir = dir.clone(),
            Command::Run {
                sequential: true, ..
            } => cfg.parallel = false,
            Command::Report {
                reports_dir: Some(dir),
                ..
            } => cfg.reports_dir = dir.clone(),
            Command::Serve { bind: Some(addr) } => cfg.bind_addr = addr.clone(),
            _ => {}
        }
    }
}

pub async fn dispatch(command: Command, cfg: &AppConfig) -> anyhow::Result<()> {
    let db = Db::connect(&cfg.database_url)
        .await
        .with_context(|| format!("connecting to {}", cfg.database_url))?;
    let store = Arc::new(SqlStore::from_db(&db));

    match command {
        Command::Bootstrap => {
            db.migrate().await.context("bootstrapping schema")?;
            info!("schema ready");
        }

        Command::Ingest { .. } => {
            db.migrate().await.context("bootstrapping schema")?;
            ingest_dir(store.as_ref(), &cfg.data_dir).await?;
        }

        Command::Run { since, until, .. } => {
            db.migrate().await.context("bootstrapping schema")?;
            run_job(store, cfg, TimeRange { from: since, to: until }).await?;
        }

        Command::Report { date, .. } => {
            db.migrate().await.context("bootstrapping schema")?;
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            export_daily(store.as_ref(), &cfg.reports_dir, date).await?;
        }

        Command::Serve { .. } => {
            let state = ApiState {
                store: store.clone(),
                sink: store,
            };
            api::serve(&cfg.bind_addr, state).await?;
        }

        Command::Pipeline => {
            db.migrate().await.context("bootstrapping schema")?;
            ingest_dir(store.as_ref(), &cfg.data_dir).await?;
            run_job(store.clone(), cfg, TimeRange::all()).await?;
            export_daily(store.as_ref(), &cfg.reports_dir, Utc::now().date_naive()).await?;
        }
    }

    Ok(())
}

async fn run_job(store: Arc<SqlStore>, cfg: &AppConfig, range: TimeRange) -> anyhow::Result<JobSummary> {
    let engine = RuleEngine::new(RuleRegistry::reference(cfg.rules));
    let job = SurveillanceJob::new(store.clone(), store, engine, cfg.parallel);

    Ok(job.run(range).await?)
}
