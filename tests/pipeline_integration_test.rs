//! パイプライン全体の統合テスト

use async_trait::async_trait;
use std::sync::Arc;
use telemetry_rs::monitoring::alerts::{AlertType, ConsoleChannelConfig};
use telemetry_rs::monitoring::{ClientEvent, HealthStatus};
use telemetry_rs::persist::{MetricsSink, RollupKind, RollupRecord};
use telemetry_rs::{Pipeline, TelemetryConfig};
use tokio::sync::RwLock;

/// 永続化レコードを記録するテスト用シンク
struct RecordingSink {
    records: Arc<RwLock<Vec<RollupRecord>>>,
}

#[async_trait]
impl MetricsSink for RecordingSink {
    async fn persist(&self, record: RollupRecord) -> anyhow::Result<()> {
        self.records.write().await.push(record);
        Ok(())
    }
}

/// コンソール出力を無効化した設定
fn quiet_config() -> TelemetryConfig {
    let mut config = TelemetryConfig::default();
    config.alerts.console = ConsoleChannelConfig { enabled: false };
    config
}

#[tokio::test]
async fn test_end_to_end_slow_query_scenario() {
    let pipeline = Pipeline::new(quiet_config());

    // 同一パターンのスロークエリを100回記録（閾値 1000ms に対して 1500ms）
    for i in 0..100 {
        pipeline
            .query
            .record_query(
                &format!("SELECT * FROM tax_returns WHERE id = {}", i),
                1500.0,
                None,
            )
            .await;
    }

    let summary = pipeline.get_metrics_summary().await;

    // スローなユニークパターンは1つだけ
    assert_eq!(summary.slow_queries, 1);
    assert_eq!(summary.top_slow_queries[0].count, 100);
    assert_eq!(summary.top_slow_queries[0].avg_duration_ms, 1500.0);

    // クールダウンにより slow_query アラートは1件だけ配送される
    let active = pipeline.get_active_alerts().await;
    let slow_alerts: Vec<_> = active
        .iter()
        .filter(|a| a.alert_type == AlertType::SlowQuery)
        .collect();
    assert_eq!(slow_alerts.len(), 1);
}

#[tokio::test]
async fn test_alert_resolution_is_one_way() {
    let pipeline = Pipeline::new(quiet_config());

    pipeline
        .query
        .record_query("SELECT * FROM accounts WHERE id = 1", 2000.0, None)
        .await;

    let active = pipeline.get_active_alerts().await;
    assert!(!active.is_empty());
    let id = active[0].id.clone();

    assert!(pipeline.dispatcher.resolve_alert(&id).await);
    assert!(!pipeline.dispatcher.resolve_alert(&id).await);

    let remaining: Vec<_> = pipeline
        .get_active_alerts()
        .await
        .into_iter()
        .filter(|a| a.id == id)
        .collect();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn test_health_metrics_through_pipeline() {
    let pipeline = Pipeline::new(quiet_config());

    let token = pipeline.api.start_request("/api/returns", "GET");
    pipeline.api.complete_request(token, 200, None).await;

    let health = pipeline.get_health_metrics().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.total_requests, 1);

    // ヘルスメトリクスは JSON 化できる
    let json = serde_json::to_value(&health).unwrap();
    assert_eq!(json["status"], "healthy");
}

#[tokio::test]
async fn test_query_rollup_reaches_sink() {
    let records = Arc::new(RwLock::new(Vec::new()));
    let sink = Arc::new(RecordingSink {
        records: records.clone(),
    });
    let pipeline = Pipeline::with_sink(quiet_config(), Some(sink));

    pipeline
        .query
        .record_query("SELECT * FROM subscriptions WHERE id = 1", 10.0, None)
        .await;
    pipeline.query.export_and_reset().await;

    let stored = records.read().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].kind, RollupKind::QueryMetrics);
    assert_eq!(stored[0].payload["total_patterns"], 1);

    // エクスポート後はパターンマップが空
    drop(stored);
    assert_eq!(pipeline.get_metrics_summary().await.total_patterns, 0);
}

#[tokio::test]
async fn test_client_telemetry_through_pipeline() {
    let pipeline = Pipeline::new(quiet_config());

    pipeline
        .client_telemetry
        .record_client_error(
            ClientEvent::new("form submit failed for dave@example.com")
                .with_url("https://app.example.com/returns?session=xyz"),
        )
        .await;

    let pending = pipeline.client_telemetry.pending_entries().await;
    assert_eq!(pending[0].message, "form submit failed for [email]");
    assert_eq!(
        pending[0].url.as_deref(),
        Some("https://app.example.com/returns")
    );

    // シャットダウンで残りがフラッシュされる
    pipeline.shutdown().await;
    assert_eq!(pipeline.client_telemetry.stats().await.pending, 0);
}

#[tokio::test]
async fn test_resource_report_through_pipeline() {
    let pipeline = Pipeline::new(quiet_config());
    pipeline.resources.collect().await;

    let report = pipeline.generate_resource_report().await;
    assert!(report.current.cpu.cores >= 1);
    assert_eq!(report.memory.count, 1);
}
