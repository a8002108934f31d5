//! クエリ監視システム
//!
//! 生のクエリテキストを安定したパターンキーに正規化し、パターン単位の
//! ローリング統計を維持します。スロークエリ・高頻度クエリを検知して
//! ディスパッチャへ送出し、一定間隔でサマリをエクスポートしてから
//! パターンマップをクリアします（クエリ文字列の組合せ爆発による
//! 無制限成長の防止）。

use crate::monitoring::alerts::{Alert, AlertDispatcher, AlertSeverity, AlertType};
use crate::monitoring::store::{BoundedStore, Timestamped};
use crate::persist::{MetricsSink, RollupKind, RollupRecord};
use crate::sanitize::Sanitizer;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// クエリ監視設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryMonitorConfig {
    /// スロークエリ閾値（ms）
    pub slow_query_threshold_ms: f64,
    /// 高頻度クエリ閾値（回/分）
    pub frequent_rate_per_minute: f64,
    /// リセット間隔（秒）
    pub reset_interval_secs: u64,
    /// ローカルアラート履歴の保持数
    pub alert_history_size: usize,
    /// クエリエラー履歴の保持数
    pub recent_error_size: usize,
    /// サマリに含める上位パターン数
    pub top_query_limit: usize,
}

impl Default for QueryMonitorConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: 1000.0,
            frequent_rate_per_minute: 100.0,
            reset_interval_secs: 3600,
            alert_history_size: 100,
            recent_error_size: 100,
            top_query_limit: 10,
        }
    }
}

/// パターン単位のローリング統計
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPatternStat {
    /// 正規化済みパターン（一意キー）
    pub pattern: String,
    /// 実行回数
    pub count: u64,
    /// 累積実行時間（ms）
    pub total_duration_ms: f64,
    /// 平均実行時間（ms、逐次更新）
    pub avg_duration_ms: f64,
    /// 最大実行時間（ms）
    pub max_duration_ms: f64,
    /// 最小実行時間（ms）
    pub min_duration_ms: f64,
    /// 初回観測時刻
    pub first_seen: DateTime<Utc>,
    /// 最終実行時刻
    pub last_executed: DateTime<Utc>,
}

impl QueryPatternStat {
    fn new(pattern: String, now: DateTime<Utc>) -> Self {
        Self {
            pattern,
            count: 0,
            total_duration_ms: 0.0,
            avg_duration_ms: 0.0,
            max_duration_ms: f64::MIN,
            min_duration_ms: f64::MAX,
            first_seen: now,
            last_executed: now,
        }
    }

    /// 1回の実行を統計へ反映
    ///
    /// 平均は `avg += (d - avg) / count` の逐次更新で保持します
    /// （長寿命プロセスでの総和の再計算・オーバーフローを避ける）。
    fn observe(&mut self, duration_ms: f64, now: DateTime<Utc>) {
        self.count += 1;
        self.total_duration_ms += duration_ms;
        self.avg_duration_ms += (duration_ms - self.avg_duration_ms) / self.count as f64;
        self.max_duration_ms = self.max_duration_ms.max(duration_ms);
        self.min_duration_ms = self.min_duration_ms.min(duration_ms);
        self.last_executed = now;
    }

    /// 初回観測からの実行レート（回/分）
    ///
    /// 経過時間は実際の初回観測時刻から計算します（`count * avg` による
    /// 推定は行わない）。観測直後の過大評価を抑えるため1秒を下限とします。
    fn rate_per_minute(&self, now: DateTime<Utc>) -> f64 {
        let elapsed_ms = (now - self.first_seen).num_milliseconds().max(1000) as f64;
        self.count as f64 / (elapsed_ms / 60_000.0)
    }
}

/// クエリエラー記録
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryError {
    /// 記録時刻
    pub timestamp: DateTime<Utc>,
    /// 対象パターン
    pub pattern: String,
    /// サニタイズ済みエラーメッセージ
    pub message: String,
}

impl Timestamped for QueryError {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// クエリメトリクスサマリ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMetricsSummary {
    /// 生成時刻
    pub generated_at: DateTime<Utc>,
    /// ユニークパターン数
    pub total_patterns: usize,
    /// 総クエリ数
    pub total_queries: u64,
    /// 平均がスロークエリ閾値を超えるユニークパターン数
    pub slow_queries: usize,
    /// 平均実行時間の上位パターン（閾値超過のみ）
    pub top_slow_queries: Vec<QueryPatternStat>,
    /// 実行回数の上位パターン
    pub top_frequent_queries: Vec<QueryPatternStat>,
}

/// クエリ監視器
pub struct QueryMonitor {
    config: QueryMonitorConfig,
    sanitizer: Arc<Sanitizer>,
    dispatcher: Arc<AlertDispatcher>,
    sink: Option<Arc<dyn MetricsSink>>,
    patterns: Arc<RwLock<HashMap<String, QueryPatternStat>>>,
    alert_history: Arc<RwLock<BoundedStore<Alert>>>,
    recent_errors: Arc<RwLock<BoundedStore<QueryError>>>,
    reset_task: Arc<RwLock<Option<JoinHandle<()>>>>,
    // 正規化パターン（構築時にコンパイル）
    single_quote_re: Regex,
    double_quote_re: Regex,
    number_re: Regex,
    whitespace_re: Regex,
}

impl QueryMonitor {
    /// 新しいクエリ監視器を作成
    pub fn new(
        config: QueryMonitorConfig,
        sanitizer: Arc<Sanitizer>,
        dispatcher: Arc<AlertDispatcher>,
        sink: Option<Arc<dyn MetricsSink>>,
    ) -> Self {
        Self {
            alert_history: Arc::new(RwLock::new(BoundedStore::new(config.alert_history_size))),
            recent_errors: Arc::new(RwLock::new(BoundedStore::new(config.recent_error_size))),
            config,
            sanitizer,
            dispatcher,
            sink,
            patterns: Arc::new(RwLock::new(HashMap::new())),
            reset_task: Arc::new(RwLock::new(None)),
            single_quote_re: Regex::new(r"'[^']*'").unwrap(),
            double_quote_re: Regex::new(r#""[^"]*""#).unwrap(),
            number_re: Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap(),
            whitespace_re: Regex::new(r"\s+").unwrap(),
        }
    }

    /// クエリテキストをパターンキーへ正規化
    ///
    /// 数値リテラルと引用文字列をプレースホルダに置換し、空白を畳み込みます。
    /// 同一入力には常に同一出力を返します。
    pub fn normalize(&self, raw: &str) -> String {
        let out = self.single_quote_re.replace_all(raw, "?");
        let out = self.double_quote_re.replace_all(&out, "?");
        let out = self.number_re.replace_all(&out, "?");
        let out = self.whitespace_re.replace_all(&out, " ");
        out.trim().to_string()
    }

    /// クエリ実行を記録
    pub async fn record_query(&self, raw: &str, duration_ms: f64, error: Option<&str>) {
        let now = Utc::now();
        let pattern = self.normalize(raw);

        let (stat, rate) = {
            let mut patterns = self.patterns.write().await;
            let stat = patterns
                .entry(pattern.clone())
                .or_insert_with(|| QueryPatternStat::new(pattern.clone(), now));
            stat.observe(duration_ms, now);
            (stat.clone(), stat.rate_per_minute(now))
        };

        if let Some(message) = error {
            let mut errors = self.recent_errors.write().await;
            errors.push(QueryError {
                timestamp: now,
                pattern: pattern.clone(),
                message: self.sanitizer.sanitize(message),
            });
        }

        // スロークエリ検知
        if duration_ms > self.config.slow_query_threshold_ms {
            let alert = Alert::new(
                AlertType::SlowQuery,
                AlertSeverity::Warning,
                "Slow query detected",
                format!(
                    "query took {:.0} ms (pattern avg {:.1} ms, threshold {:.0} ms)",
                    duration_ms, stat.avg_duration_ms, self.config.slow_query_threshold_ms
                ),
            )
            .with_metadata("pattern", serde_json::json!(pattern))
            .with_metadata("duration_ms", serde_json::json!(duration_ms))
            .with_metadata("avg_duration_ms", serde_json::json!(stat.avg_duration_ms))
            .with_metadata(
                "threshold_ms",
                serde_json::json!(self.config.slow_query_threshold_ms),
            );
            self.emit_alert(alert).await;
        }

        // 高頻度クエリ検知
        if rate > self.config.frequent_rate_per_minute {
            let alert = Alert::new(
                AlertType::FrequentQuery,
                AlertSeverity::Warning,
                "Frequent query detected",
                format!(
                    "pattern executed {:.0} times/min (threshold {:.0}/min, count {})",
                    rate, self.config.frequent_rate_per_minute, stat.count
                ),
            )
            .with_metadata("pattern", serde_json::json!(pattern))
            .with_metadata("rate_per_minute", serde_json::json!(rate))
            .with_metadata("count", serde_json::json!(stat.count));
            self.emit_alert(alert).await;
        }
    }

    /// アラートをローカル履歴へ追加し、ディスパッチャへ送出
    async fn emit_alert(&self, alert: Alert) {
        {
            let mut history = self.alert_history.write().await;
            history.push(alert.clone());
        }
        self.dispatcher.send_alert(alert).await;
    }

    /// ローカルアラート履歴を取得
    pub async fn get_alert_history(&self) -> Vec<Alert> {
        self.alert_history.read().await.snapshot()
    }

    /// 直近のクエリエラーを取得
    pub async fn get_recent_errors(&self) -> Vec<QueryError> {
        self.recent_errors.read().await.snapshot()
    }

    /// 現在の集約サマリを取得
    pub async fn get_metrics_summary(&self) -> QueryMetricsSummary {
        let patterns = self.patterns.read().await;
        Self::build_summary(&patterns, &self.config)
    }

    fn build_summary(
        patterns: &HashMap<String, QueryPatternStat>,
        config: &QueryMonitorConfig,
    ) -> QueryMetricsSummary {
        let total_queries = patterns.values().map(|s| s.count).sum();

        let mut slow: Vec<QueryPatternStat> = patterns
            .values()
            .filter(|s| s.avg_duration_ms > config.slow_query_threshold_ms)
            .cloned()
            .collect();
        let slow_queries = slow.len();
        slow.sort_by(|a, b| b.avg_duration_ms.total_cmp(&a.avg_duration_ms));
        slow.truncate(config.top_query_limit);

        let mut frequent: Vec<QueryPatternStat> = patterns.values().cloned().collect();
        frequent.sort_by(|a, b| b.count.cmp(&a.count));
        frequent.truncate(config.top_query_limit);

        QueryMetricsSummary {
            generated_at: Utc::now(),
            total_patterns: patterns.len(),
            total_queries,
            slow_queries,
            top_slow_queries: slow,
            top_frequent_queries: frequent,
        }
    }

    /// サマリをエクスポートしてパターンマップをクリア
    pub async fn export_and_reset(&self) {
        Self::export_and_reset_inner(&self.patterns, &self.sink, &self.config).await;
    }

    async fn export_and_reset_inner(
        patterns: &Arc<RwLock<HashMap<String, QueryPatternStat>>>,
        sink: &Option<Arc<dyn MetricsSink>>,
        config: &QueryMonitorConfig,
    ) {
        let summary = {
            let map = patterns.read().await;
            if map.is_empty() {
                return;
            }
            Self::build_summary(&map, config)
        };

        if let Some(sink) = sink {
            match RollupRecord::new(RollupKind::QueryMetrics, &summary) {
                Ok(record) => {
                    if let Err(e) = sink.persist(record).await {
                        warn!("Failed to persist query metrics rollup: {}", e);
                    }
                }
                Err(e) => warn!("Failed to serialize query metrics rollup: {}", e),
            }
        }

        let mut map = patterns.write().await;
        map.clear();
        info!(
            "Query pattern map reset ({} patterns exported)",
            summary.total_patterns
        );
    }

    /// 定期リセットタスクを開始
    pub async fn start_reset_task(&self) {
        let mut task = self.reset_task.write().await;
        if task.is_some() {
            return;
        }

        let patterns = self.patterns.clone();
        let sink = self.sink.clone();
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(config.reset_interval_secs));
            // 初回ティックは即時発火するため読み捨てる
            ticker.tick().await;

            loop {
                ticker.tick().await;
                Self::export_and_reset_inner(&patterns, &sink, &config).await;
            }
        });

        *task = Some(handle);
        info!(
            "Started query metrics reset task (interval: {}s)",
            self.config.reset_interval_secs
        );
    }

    /// 定期リセットタスクを停止（冪等）
    pub async fn stop_reset_task(&self) {
        let mut task = self.reset_task.write().await;
        if let Some(handle) = task.take() {
            handle.abort();
            info!("Stopped query metrics reset task");
        }
    }
}
