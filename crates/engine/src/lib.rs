//! Research Autopilot Engine: autonomous strategy-research sessions
//!
//! Provides:
//! - Session runner with supervised per-session run loops
//! - History fetch coordinator (cache, coalescing, throttling, rate-limit breaker)
//! - Two-round optimizer driving with grid refinement
//! - Robustness stress variants, regime coverage gate and champion tracking
//! - Append-only research ledger (in-memory and SQLite)
//! - HTTP clients for the optimizer service, Binance and an MT5 bridge

pub mod api;
pub mod champion;
pub mod config;
pub mod error;
pub mod export;
pub mod fingerprint;
pub mod guardrails;
pub mod history;
pub mod ledger;
pub mod optimizer;
pub mod policy;
pub mod regime;
pub mod registry;
pub mod robustness;
pub mod runner;
pub mod session;
pub mod types;

#[cfg(test)]
mod testkit;

// Re-exports for convenience
pub use api::{BinanceSource, HttpOptimizer, Mt5BridgeSource};
pub use config::{NormalizedConfig, ParamGrid, ResearchConfig, RobustnessLevel};
pub use error::{AutopilotError, CollaboratorError, ExperimentError, FetchError, ValidationError};
pub use export::{DashboardPoint, SessionExport};
pub use history::{CachedSeries, HistoryConfig, HistoryCoordinator, HistoryRequest, HistorySource};
pub use ledger::{Ledger, MemoryLedger, SqliteLedger};
pub use optimizer::Optimizer;
pub use regime::{RegimeClassifier, TrendVolatilityClassifier};
pub use runner::{ResearchAutopilot, SessionResults};
pub use session::{ExperimentRecord, ResearchSession, SessionStatus, SessionStep};
pub use types::*;
