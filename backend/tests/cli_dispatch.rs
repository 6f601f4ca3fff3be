mod support;

use chrono::NaiveDate;
use uuid::Uuid;

use support::temp_dir;
use surveillance::cli::{Command, dispatch};
use surveillance::config::AppConfig;
use surveillance::report::report_path;

#[tokio::test]
async fn report_on_a_fresh_database_writes_a_header_only_file() {
    let dir = temp_dir("fresh-report");
    let mut cfg = AppConfig::from_lookup(|_| None).unwrap();
    cfg.database_url = format!("sqlite:file:{}?mode=memory&cache=shared", Uuid::new_v4());
    cfg.reports_dir = dir.clone();

    let date = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
    dispatch(
        Command::Report {
            date: Some(date),
            reports_dir: None,
        },
        &cfg,
    )
    .await
    .unwrap();

    let body = std::fs::read_to_string(report_path(&dir, date)).unwrap();
    assert_eq!(body.lines().collect::<Vec<_>>(), vec!["symbol,ts,rule,score,details"]);

    std::fs::remove_dir_all(&dir).ok();
}
