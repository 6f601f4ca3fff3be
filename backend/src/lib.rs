pub mod api;
pub mod cli;
pub mod config;
pub mod db;
pub mod ingest;
pub mod job;
pub mod report;
pub mod store;

pub mod error;
