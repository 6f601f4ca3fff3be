pub mod models;
pub mod time;

pub use models::*;
