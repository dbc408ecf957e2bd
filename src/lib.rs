//! Migration Scout Library
//!
//! Adaptive scoring and scheduling for tokens that migrated onto DEXes:
//! component extraction, EWMA smoothing, spam analysis, hybrid/legacy scoring,
//! lifecycle transitions and a self-tuning scheduler with overload guards.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod scheduler;
pub mod scoring;
pub mod sources;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use scheduler::{Collaborators, HealthReport, Scheduler};
pub use types::{ScoreSnapshot, Token, TokenStatus};
