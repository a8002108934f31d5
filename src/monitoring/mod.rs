//! 監視パイプライン
//!
//! このモジュールは、クエリパターン集約、リソースサンプリング、
//! メモリトレンド分析、エンドポイントメトリクス、クライアントテレメトリ、
//! アラートディスパッチを提供します。各コンポーネントは独立した
//! ライフサイクル（開始/停止）を持ち、互いのメインループをブロックしません。

pub mod alerts;
pub mod api;
pub mod client;
pub mod leak;
pub mod query;
pub mod resource;
pub mod store;

pub use alerts::{Alert, AlertDispatcher, AlertSeverity, AlertType};
pub use api::{ApiMonitor, ApiMonitorConfig, EndpointMetrics, HealthMetrics, HealthStatus};
pub use client::{ClientBatcherConfig, ClientEvent, ClientTelemetryBatcher, ErrorBatch};
pub use leak::{LeakAnalysis, LeakDetector, LeakDetectorConfig, MemoryTrend, MonitorState};
pub use query::{QueryMetricsSummary, QueryMonitor, QueryMonitorConfig, QueryPatternStat};
pub use resource::{
    MemoryLeakProbe, ResourceReport, ResourceSampler, ResourceSamplerConfig, ResourceSnapshot,
};
pub use store::{BoundedStore, HeapSnapshot, Sample, SampleStats, Timestamped};
