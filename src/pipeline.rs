//! パイプライン構成ルート
//!
//! 設定から各監視コンポーネントを明示的に組み立てます。各コンポーネントは
//! 依存注入されたインスタンスであり、プロセス全域のグローバル状態には
//! 依存しません（テストは毎回新しいインスタンスを構築できます）。

use crate::config::TelemetryConfig;
use crate::monitoring::alerts::{
    AlertChannel, AlertDispatcher, ConsoleChannel, EmailChannel, WebhookChannel,
};
use crate::monitoring::{
    Alert, ApiMonitor, ClientTelemetryBatcher, HealthMetrics, LeakDetector, QueryMetricsSummary,
    QueryMonitor, ResourceReport, ResourceSampler,
};
use crate::persist::MetricsSink;
use crate::sanitize::Sanitizer;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 監視パイプライン
pub struct Pipeline {
    /// サニタイザ
    pub sanitizer: Arc<Sanitizer>,
    /// アラートディスパッチャ
    pub dispatcher: Arc<AlertDispatcher>,
    /// クエリ監視
    pub query: Arc<QueryMonitor>,
    /// リソースサンプラー
    pub resources: Arc<ResourceSampler>,
    /// トレンド分析器
    pub leak: Arc<LeakDetector>,
    /// エンドポイント監視
    pub api: Arc<ApiMonitor>,
    /// クライアントテレメトリ
    pub client_telemetry: Arc<ClientTelemetryBatcher>,
}

impl Pipeline {
    /// 設定からパイプラインを構築
    pub fn new(config: TelemetryConfig) -> Self {
        Self::with_sink(config, None)
    }

    /// 永続化シンク付きでパイプラインを構築
    pub fn with_sink(config: TelemetryConfig, sink: Option<Arc<dyn MetricsSink>>) -> Self {
        let sanitizer = Arc::new(Sanitizer::new(config.sanitizer.clone()));

        let channels: Vec<Arc<dyn AlertChannel>> = vec![
            Arc::new(ConsoleChannel::new(config.alerts.console.clone())),
            Arc::new(EmailChannel::new(config.alerts.email.clone())),
            Arc::new(WebhookChannel::new(
                config.alerts.webhook.clone(),
                config.environment.clone(),
            )),
        ];
        let dispatcher = Arc::new(AlertDispatcher::new(
            Duration::from_secs(config.alerts.cooldown_secs),
            channels,
        ));

        let query = Arc::new(QueryMonitor::new(
            config.query.clone(),
            sanitizer.clone(),
            dispatcher.clone(),
            sink.clone(),
        ));
        let resources = Arc::new(ResourceSampler::new(
            config.resource.clone(),
            dispatcher.clone(),
        ));
        let leak = Arc::new(LeakDetector::new(config.leak.clone(), dispatcher.clone()));
        let api = Arc::new(ApiMonitor::new(
            config.api.clone(),
            sanitizer.clone(),
            sink,
        ));
        let client_telemetry = Arc::new(ClientTelemetryBatcher::new(
            config.client.clone(),
            sanitizer.clone(),
        ));

        Self {
            sanitizer,
            dispatcher,
            query,
            resources,
            leak,
            api,
            client_telemetry,
        }
    }

    /// 全コンポーネントの定期タスクを開始
    pub async fn start(&self) {
        self.resources.start().await;
        self.leak.start_monitoring().await;
        self.query.start_reset_task().await;
        self.client_telemetry.start().await;
        info!("Telemetry pipeline started");
    }

    /// 全コンポーネントを停止し、残りのテレメトリをフラッシュ
    pub async fn shutdown(&self) {
        self.resources.stop().await;
        self.leak.stop_monitoring().await;
        self.query.stop_reset_task().await;
        self.client_telemetry.shutdown().await;
        info!("Telemetry pipeline shut down");
    }

    /// クエリメトリクスサマリを取得
    pub async fn get_metrics_summary(&self) -> QueryMetricsSummary {
        self.query.get_metrics_summary().await
    }

    /// ヘルスメトリクスを取得
    pub async fn get_health_metrics(&self) -> HealthMetrics {
        self.api.get_health_metrics().await
    }

    /// アクティブなアラートを取得
    pub async fn get_active_alerts(&self) -> Vec<Alert> {
        self.dispatcher.get_active_alerts().await
    }

    /// リソースレポートを生成
    pub async fn generate_resource_report(&self) -> ResourceReport {
        self.resources.generate_report().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipeline_construction() {
        let pipeline = Pipeline::new(TelemetryConfig::default());
        assert!(pipeline.get_active_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_start_shutdown() {
        let pipeline = Pipeline::new(TelemetryConfig::default());
        pipeline.start().await;
        pipeline.shutdown().await;
        // 再停止しても安全
        pipeline.shutdown().await;
    }
}
