//! Shared configuration, error types, ids, and usage metrics for Simmer crates.
//!
//! Architecture role:
//! - defines engine configuration passed across layers
//! - provides common [`SimmerError`] / [`Result`] contracts
//! - hosts per-session usage counters and the Prometheus export surface
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::EngineConfig;
pub use error::{Result, SimmerError};
pub use ids::SessionId;
pub use metrics::{UsageCounters, UsageRegistry};
