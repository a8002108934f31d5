//! Durable sink for rolled-up metrics.
//!
//! The pipeline periodically exports aggregate summaries (hourly query
//! rollups, per-endpoint request rollups, resource reports) to an optional
//! host-provided sink. Sink failures are logged and discarded; they never
//! propagate to the operation being measured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of rollup being persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupKind {
    /// Hourly query pattern summary
    QueryMetrics,
    /// Per-endpoint request metrics
    EndpointMetrics,
    /// Resource usage report
    ResourceReport,
}

/// A single rollup record handed to the sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupRecord {
    /// What the payload contains
    pub kind: RollupKind,
    /// When the rollup was generated
    pub generated_at: DateTime<Utc>,
    /// Serialized summary
    pub payload: serde_json::Value,
}

impl RollupRecord {
    /// Build a record from any serializable summary
    pub fn new<T: Serialize>(kind: RollupKind, summary: &T) -> serde_json::Result<Self> {
        Ok(Self {
            kind,
            generated_at: Utc::now(),
            payload: serde_json::to_value(summary)?,
        })
    }
}

/// Host-provided durable store for rollup records.
///
/// Implementations may write to a database, a file, or an external service.
/// Errors are reported back for logging only; the pipeline never retries a
/// failed persist.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Persist one rollup record
    async fn persist(&self, record: RollupRecord) -> anyhow::Result<()>;
}
