//! Core types, configuration, and models for BookChat
//!
//! This crate provides:
//! - Configuration management (`Config`, environment parsing, per-component views)
//! - Data models (`Message`, `MessageId`, `Pin`) and the author → branch mapping
//! - Validation errors
//! - Lock-ordered mutexes, a clock abstraction and a periodic task helper
//! - Process-global metrics

#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod lock;
pub mod metrics;
pub mod models;
pub mod periodic;

// Re-export key types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ArchiveConfig, Config, RepoSettings, SigningConfig, SyncConfig};
pub use error::{Result as ValidationResult, ValidationError};
pub use identity::{BranchRef, branch_name_for, is_valid_author, validate_author};
pub use lock::{LockLevel, OrderedMutex, OrderedMutexGuard};
pub use metrics::{GlobalMetrics, GlobalMetricsSnapshot, global_metrics};
pub use models::{
    Message, MessageId, Pin, format_timestamp, signing_payload, sort_chronologically,
    truncate_to_micros, validate_content,
};
pub use periodic::PeriodicTask;
