pub mod error;
pub mod registry;
pub mod returns;
pub mod rules;
pub mod runner;
pub mod series;
pub mod window;

pub use error::{EngineError, RuleError};
pub use registry::RuleRegistry;
pub use rules::{Rule, RuleConfig, RuleInput, RowContext, RowRef};
pub use runner::{RuleEngine, RunReport};
pub use series::{Batch, SymbolSeries};
pub use window::{TrailingWindow, WindowStat};
