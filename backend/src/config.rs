use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use engine::RuleConfig;

use crate::error::AppError;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string (`sqlite:` or `postgres:`).
    pub database_url: String,

    /// Directory holding `trades.csv`, `quotes.csv`, `bars.csv`, `factors.csv`.
    pub data_dir: PathBuf,

    /// Where daily alert reports are written.
    pub reports_dir: PathBuf,

    /// Read API listen address.
    pub bind_addr: String,

    // =========================
    // Rule configuration
    // =========================
    /// Fixed thresholds for `wide_spread` / `return_spike`. Not tuned at runtime.
    pub rules: RuleConfig,

    /// Evaluate symbols on the blocking pool instead of one by one.
    pub parallel: bool,

    /// JSON log lines (production) instead of pretty output.
    pub json_logs: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Missing keys take their
    /// defaults; present-but-invalid values are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RuleConfig::default();

        let rules = RuleConfig {
            wide_spread_threshold: parse_or(
                &lookup,
                "WIDE_SPREAD_THRESHOLD",
                defaults.wide_spread_threshold,
            )?,
            return_spike_threshold: parse_or(
                &lookup,
                "RETURN_SPIKE_THRESHOLD",
                defaults.return_spike_threshold,
            )?,
            return_window: parse_or(&lookup, "RETURN_SPIKE_WINDOW", defaults.return_window)?,
        };

        if rules.return_window < 2 {
            return Err(AppError::Config(format!(
                "RETURN_SPIKE_WINDOW must be >= 2, got {}",
                rules.return_window
            )));
        }

        Ok(Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://surveillance_dev.db?mode=rwc".to_string()),
            data_dir: lookup("SURVEILLANCE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/raw")),
            reports_dir: lookup("SURVEILLANCE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/reports")),
            bind_addr: lookup("SURVEILLANCE_BIND_ADDR")
                .unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            rules,
            parallel: parse_or(&lookup, "ENGINE_PARALLEL", true)?,
            json_logs: lookup("APP_ENV").is_some_and(|v| v == "production"),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{key}={raw:?}: {e}"))),
    }
}
