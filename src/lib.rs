//! # telemetry-rs
//!
//! Embedded observability and alerting pipeline for request-handling services.
//!
//! This crate provides a set of cooperating collectors (query pattern
//! aggregation, OS resource sampling, memory trend analysis, endpoint
//! metrics, client telemetry batching) feeding a cooldown-gated alert
//! dispatcher with console/email/webhook fan-out. Components are explicitly
//! constructed and dependency-injected; instrumentation failures are never
//! allowed to affect the operation being measured.

pub mod config;
pub mod error;
pub mod logging;
pub mod monitoring;
pub mod persist;
pub mod pipeline;
pub mod sanitize;

pub use config::TelemetryConfig;
pub use error::{Error, Result};
pub use pipeline::Pipeline;
