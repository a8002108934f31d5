//! エンドポイント/リクエストメトリクス
//!
//! (メソッド, エンドポイント) 単位のカウンタ、レイテンシ、ステータスコード
//! ヒストグラム、直近エラーを追跡します。全エンドポイントを集約した
//! ヘルス分類と、一定リクエスト数ごとの永続化フックを提供します。

use crate::monitoring::store::{BoundedStore, Timestamped};
use crate::persist::{MetricsSink, RollupKind, RollupRecord};
use crate::sanitize::Sanitizer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::warn;

/// エンドポイント監視設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiMonitorConfig {
    /// スローリクエスト閾値（ms）
    pub slow_request_threshold_ms: f64,
    /// エンドポイントごとの直近エラー保持数
    pub recent_error_size: usize,
    /// 永続化フックの起動間隔（完了リクエスト数、0 で無効）
    pub persist_every_requests: u64,
    /// degraded 判定のエラー率閾値（%）
    pub degraded_error_rate_percent: f64,
    /// degraded 判定の平均レイテンシ閾値（ms）
    pub degraded_latency_ms: f64,
}

impl Default for ApiMonitorConfig {
    fn default() -> Self {
        Self {
            slow_request_threshold_ms: 3000.0,
            recent_error_size: 100,
            persist_every_requests: 100,
            degraded_error_rate_percent: 10.0,
            degraded_latency_ms: 3000.0,
        }
    }
}

/// リクエストエラー記録
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestError {
    /// 記録時刻
    pub timestamp: DateTime<Utc>,
    /// ステータスコード
    pub status: u16,
    /// サニタイズ済みエラーメッセージ
    pub message: String,
}

impl Timestamped for RequestError {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// エンドポイント単位のメトリクス
///
/// 不変条件: `success_count + failure_count == total_requests`
#[derive(Debug, Clone, Serialize)]
pub struct EndpointMetrics {
    /// エンドポイント
    pub endpoint: String,
    /// HTTP メソッド
    pub method: String,
    /// 総リクエスト数
    pub total_requests: u64,
    /// 成功数（2xx/3xx）
    pub success_count: u64,
    /// 失敗数
    pub failure_count: u64,
    /// 累積処理時間（ms）
    pub total_duration_ms: f64,
    /// 最小処理時間（ms）
    pub min_duration_ms: f64,
    /// 最大処理時間（ms）
    pub max_duration_ms: f64,
    /// ステータスコードヒストグラム
    pub status_codes: HashMap<u16, u64>,
    /// 直近エラー（容量固定、最新100件）
    pub recent_errors: BoundedStore<RequestError>,
}

impl EndpointMetrics {
    fn new(endpoint: String, method: String, recent_error_size: usize) -> Self {
        Self {
            endpoint,
            method,
            total_requests: 0,
            success_count: 0,
            failure_count: 0,
            total_duration_ms: 0.0,
            min_duration_ms: f64::MAX,
            max_duration_ms: f64::MIN,
            status_codes: HashMap::new(),
            recent_errors: BoundedStore::new(recent_error_size),
        }
    }

    /// 平均処理時間（ms）
    pub fn avg_duration_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_duration_ms / self.total_requests as f64
        }
    }
}

/// ヘルス分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// 正常
    Healthy,
    /// 劣化
    Degraded,
    /// 異常
    Unhealthy,
}

/// 全エンドポイント集約のヘルスメトリクス
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    /// 生成時刻
    pub generated_at: DateTime<Utc>,
    /// ヘルス分類
    pub status: HealthStatus,
    /// 総リクエスト数
    pub total_requests: u64,
    /// 総失敗数
    pub total_failures: u64,
    /// エラー率（%）
    pub error_rate_percent: f64,
    /// 平均レイテンシ（ms）
    pub avg_latency_ms: f64,
    /// 追跡中のエンドポイント数
    pub endpoint_count: usize,
    /// 下流依存の到達可否
    pub dependency_available: bool,
}

/// 進行中リクエストのトークン
///
/// `start_request` が発行し、`complete_request` に引き渡します。
#[derive(Debug)]
pub struct RequestToken {
    endpoint: String,
    method: String,
    started_at: Instant,
}

/// エンドポイント監視器
pub struct ApiMonitor {
    config: ApiMonitorConfig,
    sanitizer: Arc<Sanitizer>,
    sink: Option<Arc<dyn MetricsSink>>,
    endpoints: Arc<RwLock<HashMap<String, EndpointMetrics>>>,
    dependency_available: AtomicBool,
    completed_requests: AtomicU64,
}

impl ApiMonitor {
    /// 新しいエンドポイント監視器を作成
    pub fn new(
        config: ApiMonitorConfig,
        sanitizer: Arc<Sanitizer>,
        sink: Option<Arc<dyn MetricsSink>>,
    ) -> Self {
        Self {
            config,
            sanitizer,
            sink,
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            dependency_available: AtomicBool::new(true),
            completed_requests: AtomicU64::new(0),
        }
    }

    /// リクエストの計測を開始
    pub fn start_request(
        &self,
        endpoint: impl Into<String>,
        method: impl Into<String>,
    ) -> RequestToken {
        RequestToken {
            endpoint: endpoint.into(),
            method: method.into(),
            started_at: Instant::now(),
        }
    }

    /// リクエストの計測を完了
    pub async fn complete_request(&self, token: RequestToken, status: u16, error: Option<&str>) {
        let duration_ms = token.started_at.elapsed().as_secs_f64() * 1000.0;
        self.record_completion(&token.endpoint, &token.method, status, duration_ms, error)
            .await;
    }

    /// 完了済みリクエストを明示的な所要時間つきで記録
    ///
    /// ミドルウェアが独自に計時している場合の記録経路です。
    pub async fn record_completion(
        &self,
        endpoint: &str,
        method: &str,
        status: u16,
        duration_ms: f64,
        error: Option<&str>,
    ) {
        let success = (200..400).contains(&status);
        let key = format!("{} {}", method, endpoint);

        {
            let mut endpoints = self.endpoints.write().await;
            let metrics = endpoints.entry(key).or_insert_with(|| {
                EndpointMetrics::new(
                    endpoint.to_string(),
                    method.to_string(),
                    self.config.recent_error_size,
                )
            });

            metrics.total_requests += 1;
            if success {
                metrics.success_count += 1;
            } else {
                metrics.failure_count += 1;
            }
            metrics.total_duration_ms += duration_ms;
            metrics.min_duration_ms = metrics.min_duration_ms.min(duration_ms);
            metrics.max_duration_ms = metrics.max_duration_ms.max(duration_ms);
            *metrics.status_codes.entry(status).or_insert(0) += 1;

            if error.is_some() || status >= 400 {
                let message = match error {
                    Some(message) => self.sanitizer.sanitize(message),
                    None => format!("HTTP {}", status),
                };
                metrics.recent_errors.push(RequestError {
                    timestamp: Utc::now(),
                    status,
                    message,
                });
            }
        }

        // スローリクエストはログのみ（クールダウン付きアラート経路には乗せず、
        // 高頻度・低重要度の通知が本来のアラートを飢えさせないようにする）
        if duration_ms > self.config.slow_request_threshold_ms {
            warn!(
                "Slow request: {} {} took {:.0} ms (threshold: {:.0} ms, status: {})",
                method, endpoint, duration_ms, self.config.slow_request_threshold_ms, status
            );
        }

        let completed = self.completed_requests.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.persist_every_requests > 0
            && completed % self.config.persist_every_requests == 0
        {
            self.persist_rollup().await;
        }
    }

    /// 現在のメトリクスを永続化フックへ書き出す
    ///
    /// シンク障害は捕捉してログに残すだけで、計測対象の呼び出し元へは
    /// 決して伝播させません。
    async fn persist_rollup(&self) {
        let Some(sink) = self.sink.clone() else {
            return;
        };

        let snapshot = self.get_endpoint_metrics().await;
        match RollupRecord::new(RollupKind::EndpointMetrics, &snapshot) {
            Ok(record) => {
                // 遅いシンクが計測対象のリクエストを遅延させないよう切り離す
                tokio::spawn(async move {
                    if let Err(e) = sink.persist(record).await {
                        warn!("Failed to persist endpoint metrics rollup: {}", e);
                    }
                });
            }
            Err(e) => warn!("Failed to serialize endpoint metrics rollup: {}", e),
        }
    }

    /// 下流依存の到達可否を設定
    pub fn set_dependency_available(&self, available: bool) {
        self.dependency_available.store(available, Ordering::Relaxed);
    }

    /// 全エンドポイントのメトリクスを取得
    pub async fn get_endpoint_metrics(&self) -> Vec<EndpointMetrics> {
        let endpoints = self.endpoints.read().await;
        let mut all: Vec<EndpointMetrics> = endpoints.values().cloned().collect();
        all.sort_by(|a, b| (&a.method, &a.endpoint).cmp(&(&b.method, &b.endpoint)));
        all
    }

    /// 集約ヘルスメトリクスを取得
    pub async fn get_health_metrics(&self) -> HealthMetrics {
        let endpoints = self.endpoints.read().await;

        let mut total_requests = 0u64;
        let mut total_failures = 0u64;
        let mut total_duration_ms = 0.0;
        for metrics in endpoints.values() {
            total_requests += metrics.total_requests;
            total_failures += metrics.failure_count;
            total_duration_ms += metrics.total_duration_ms;
        }

        let error_rate_percent = if total_requests > 0 {
            total_failures as f64 / total_requests as f64 * 100.0
        } else {
            0.0
        };
        let avg_latency_ms = if total_requests > 0 {
            total_duration_ms / total_requests as f64
        } else {
            0.0
        };

        let dependency_available = self.dependency_available.load(Ordering::Relaxed);

        // 下流依存が落ちている場合は他の読みに関わらず unhealthy
        let status = if !dependency_available {
            HealthStatus::Unhealthy
        } else if error_rate_percent > self.config.degraded_error_rate_percent
            || avg_latency_ms > self.config.degraded_latency_ms
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthMetrics {
            generated_at: Utc::now(),
            status,
            total_requests,
            total_failures,
            error_rate_percent,
            avg_latency_ms,
            endpoint_count: endpoints.len(),
            dependency_available,
        }
    }

    /// 全エンドポイント状態を明示的にリセット
    pub async fn reset(&self) {
        let mut endpoints = self.endpoints.write().await;
        endpoints.clear();
        self.completed_requests.store(0, Ordering::Relaxed);
    }
}
