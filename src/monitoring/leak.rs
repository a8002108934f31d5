//! メモリリーク検知（トレンド分析器）
//!
//! ヒープスナップショットのスライディングウィンドウに対して最小二乗回帰を
//! 適用し、統計的な根拠（総増加量・傾き・決定係数）が揃った場合のみ
//! リーク疑いを報告します。状態機械は
//! `Idle → WarmingUp → Analyzing ⇄ LeakSuspected` と遷移します。

use crate::monitoring::alerts::{Alert, AlertDispatcher, AlertSeverity, AlertType};
use crate::monitoring::store::{BoundedStore, HeapSnapshot};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

const BYTES_PER_MB: f64 = 1_048_576.0;

/// トレンド分析器設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeakDetectorConfig {
    /// スナップショット間隔（秒）
    pub interval_secs: u64,
    /// 分析開始に必要なスナップショット数
    pub warmup_samples: usize,
    /// 保持するスナップショット数
    pub max_snapshots: usize,
    /// 検知に必要なウィンドウ内総増加量（MB）
    pub growth_threshold_mb: f64,
    /// 検知に必要な決定係数（R²）
    pub min_r_squared: f64,
    /// 警告推奨の増加レート（MB/分）
    pub warning_rate_mb_per_min: f64,
    /// 致命的推奨の増加レート（MB/分）
    pub critical_rate_mb_per_min: f64,
}

impl Default for LeakDetectorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            warmup_samples: 5,
            max_snapshots: 60,
            growth_threshold_mb: 50.0,
            min_r_squared: 0.7,
            warning_rate_mb_per_min: 5.0,
            critical_rate_mb_per_min: 10.0,
        }
    }
}

/// 監視状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    /// 停止中
    Idle,
    /// ウォームアップ中（サンプル不足）
    WarmingUp,
    /// 分析中（検知なし）
    Analyzing,
    /// リーク疑い
    LeakSuspected,
}

/// メモリトレンド
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTrend {
    /// 増加
    Growing,
    /// 安定
    Stable,
    /// 減少
    Shrinking,
}

/// 分析結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakAnalysis {
    /// リーク検知フラグ
    pub detected: bool,
    /// 現在の状態
    pub state: MonitorState,
    /// トレンド
    pub trend: MemoryTrend,
    /// ウィンドウ内サンプル数
    pub samples: usize,
    /// ウィンドウ内総増加量（MB）
    pub growth_mb: f64,
    /// 実時間あたりの増加レート（MB/分）
    ///
    /// 回帰の傾き（サンプルあたり）とは別の診断値です。
    pub growth_rate_mb_per_min: f64,
    /// 回帰の傾き（MB/サンプル）
    pub slope_mb_per_sample: f64,
    /// 決定係数（R²、[0, 1] にクランプ）
    pub r_squared: f64,
    /// 判定理由
    pub reason: String,
    /// 推奨アクション
    pub recommendations: Vec<String>,
}

/// 最小二乗回帰の結果
struct Regression {
    slope: f64,
    r_squared: f64,
}

/// トレンド分析器
pub struct LeakDetector {
    config: LeakDetectorConfig,
    dispatcher: Arc<AlertDispatcher>,
    snapshots: Arc<RwLock<BoundedStore<HeapSnapshot>>>,
    state: Arc<RwLock<MonitorState>>,
    monitor_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl LeakDetector {
    /// 新しいトレンド分析器を作成
    pub fn new(config: LeakDetectorConfig, dispatcher: Arc<AlertDispatcher>) -> Self {
        Self {
            snapshots: Arc::new(RwLock::new(BoundedStore::new(config.max_snapshots))),
            config,
            dispatcher,
            state: Arc::new(RwLock::new(MonitorState::Idle)),
            monitor_task: Arc::new(RwLock::new(None)),
        }
    }

    /// 現在の状態を取得
    pub async fn state(&self) -> MonitorState {
        *self.state.read().await
    }

    /// 現在のプロセスメモリのスナップショットを取得
    pub fn take_system_snapshot() -> HeapSnapshot {
        let mut sys = System::new();
        sys.refresh_memory();
        let total_memory_mb = sys.total_memory() as f64 / BYTES_PER_MB;

        let (heap_used_mb, virtual_mb) = match sysinfo::get_current_pid() {
            Ok(pid) => {
                sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                match sys.process(pid) {
                    Some(process) => (
                        process.memory() as f64 / BYTES_PER_MB,
                        process.virtual_memory() as f64 / BYTES_PER_MB,
                    ),
                    None => (sys.used_memory() as f64 / BYTES_PER_MB, 0.0),
                }
            }
            Err(_) => (sys.used_memory() as f64 / BYTES_PER_MB, 0.0),
        };

        HeapSnapshot {
            timestamp: Utc::now(),
            heap_used_mb,
            virtual_mb,
            total_memory_mb,
        }
    }

    /// スナップショットを記録
    pub async fn record_snapshot(&self, snapshot: HeapSnapshot) {
        let mut snapshots = self.snapshots.write().await;
        snapshots.push(snapshot);
    }

    /// 保持中のスナップショットを取得
    pub async fn get_snapshots(&self) -> Vec<HeapSnapshot> {
        self.snapshots.read().await.snapshot()
    }

    /// 保持中のスナップショットを破棄
    pub async fn reset(&self) {
        let mut snapshots = self.snapshots.write().await;
        snapshots.clear();
    }

    /// 定期監視を開始（既に起動済みなら何もしない）
    pub async fn start_monitoring(&self) {
        let mut task = self.monitor_task.write().await;
        if task.is_some() {
            return;
        }

        {
            let mut state = self.state.write().await;
            *state = MonitorState::WarmingUp;
        }

        let config = self.config.clone();
        let snapshots = self.snapshots.clone();
        let state = self.state.clone();
        let dispatcher = self.dispatcher.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs));
            // 初回ティックは即時発火するため、起動直後にスナップショットが取られる
            loop {
                ticker.tick().await;
                {
                    let mut store = snapshots.write().await;
                    store.push(Self::take_system_snapshot());
                }
                Self::evaluate_and_transition(&config, &snapshots, &state, &dispatcher).await;
            }
        });

        *task = Some(handle);
        info!(
            "Started memory trend monitoring (interval: {}s)",
            self.config.interval_secs
        );
    }

    /// 定期監視を停止（冪等、即座に以後のティックを止める）
    pub async fn stop_monitoring(&self) {
        let mut task = self.monitor_task.write().await;
        if let Some(handle) = task.take() {
            handle.abort();
            let mut state = self.state.write().await;
            *state = MonitorState::Idle;
            info!("Stopped memory trend monitoring");
        }
    }

    /// 現在のウィンドウを分析して状態を更新
    pub async fn analyze(&self) -> LeakAnalysis {
        Self::evaluate_and_transition(
            &self.config,
            &self.snapshots,
            &self.state,
            &self.dispatcher,
        )
        .await
    }

    async fn evaluate_and_transition(
        config: &LeakDetectorConfig,
        snapshots: &Arc<RwLock<BoundedStore<HeapSnapshot>>>,
        state: &Arc<RwLock<MonitorState>>,
        dispatcher: &Arc<AlertDispatcher>,
    ) -> LeakAnalysis {
        let window = snapshots.read().await.snapshot();
        let mut analysis = Self::analyze_window(&window, config);

        let next = if analysis.samples < config.warmup_samples {
            MonitorState::WarmingUp
        } else if analysis.detected {
            MonitorState::LeakSuspected
        } else {
            MonitorState::Analyzing
        };

        let previous = {
            let mut state = state.write().await;
            let previous = *state;
            *state = next;
            previous
        };
        analysis.state = next;

        // 検知イベントは LeakSuspected への遷移時に一度だけ報告する
        if next == MonitorState::LeakSuspected && previous != MonitorState::LeakSuspected {
            let severity = if analysis.growth_rate_mb_per_min > config.critical_rate_mb_per_min {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            let alert = Alert::new(
                AlertType::MemoryLeak,
                severity,
                "Memory leak suspected",
                format!(
                    "heap grew {:.1} MB over the window ({:.2} MB/min, R²={:.2})",
                    analysis.growth_mb, analysis.growth_rate_mb_per_min, analysis.r_squared
                ),
            )
            .with_metadata("growth_mb", serde_json::json!(analysis.growth_mb))
            .with_metadata(
                "growth_rate_mb_per_min",
                serde_json::json!(analysis.growth_rate_mb_per_min),
            )
            .with_metadata("r_squared", serde_json::json!(analysis.r_squared))
            .with_metadata(
                "slope_mb_per_sample",
                serde_json::json!(analysis.slope_mb_per_sample),
            );
            dispatcher.send_alert(alert).await;
        }

        analysis
    }

    /// ウィンドウの統計分析（純粋関数）
    fn analyze_window(window: &[HeapSnapshot], config: &LeakDetectorConfig) -> LeakAnalysis {
        let samples = window.len();

        if samples < config.warmup_samples {
            return LeakAnalysis {
                detected: false,
                state: MonitorState::WarmingUp,
                trend: MemoryTrend::Stable,
                samples,
                growth_mb: 0.0,
                growth_rate_mb_per_min: 0.0,
                slope_mb_per_sample: 0.0,
                r_squared: 0.0,
                reason: format!(
                    "insufficient samples ({}/{}); confidence too low for trend analysis",
                    samples, config.warmup_samples
                ),
                recommendations: vec![
                    "Not enough snapshots yet; keep the monitor running.".to_string()
                ],
            };
        }

        let values: Vec<f64> = window.iter().map(|s| s.heap_used_mb).collect();
        let regression = Self::linear_regression(&values);

        let first = &window[0];
        let last = &window[samples - 1];
        let growth_mb = last.heap_used_mb - first.heap_used_mb;

        // 増加レートはサンプル間隔ではなく実時間（分）で割る
        let elapsed_min = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 60_000.0;
        let growth_rate_mb_per_min = if elapsed_min > 0.0 {
            growth_mb / elapsed_min
        } else {
            0.0
        };

        let trend = if regression.slope > 0.01 {
            MemoryTrend::Growing
        } else if regression.slope < -0.01 {
            MemoryTrend::Shrinking
        } else {
            MemoryTrend::Stable
        };

        let detected = growth_mb > config.growth_threshold_mb
            && regression.slope > 0.0
            && regression.r_squared > config.min_r_squared;

        let reason = if detected {
            format!(
                "growth {:.1} MB exceeds {:.0} MB with slope {:.2} MB/sample and R² {:.2}",
                growth_mb, config.growth_threshold_mb, regression.slope, regression.r_squared
            )
        } else {
            format!(
                "growth {:.1} MB, slope {:.2} MB/sample, R² {:.2}; detection criteria not met",
                growth_mb, regression.slope, regression.r_squared
            )
        };

        let recommendations =
            Self::build_recommendations(detected, growth_rate_mb_per_min, config);

        LeakAnalysis {
            detected,
            state: MonitorState::Analyzing,
            trend,
            samples,
            growth_mb,
            growth_rate_mb_per_min,
            slope_mb_per_sample: regression.slope,
            r_squared: regression.r_squared,
            reason,
            recommendations,
        }
    }

    /// 増加レートに応じた推奨アクションを生成
    fn build_recommendations(
        detected: bool,
        rate_mb_per_min: f64,
        config: &LeakDetectorConfig,
    ) -> Vec<String> {
        if !detected {
            return vec!["Memory usage appears stable; continue monitoring.".to_string()];
        }

        if rate_mb_per_min > config.critical_rate_mb_per_min {
            vec![
                format!(
                    "Memory growth is critical ({:.1} MB/min). Restart the service immediately.",
                    rate_mb_per_min
                ),
                "Capture a heap profile before restarting to identify the retaining allocation."
                    .to_string(),
            ]
        } else if rate_mb_per_min > config.warning_rate_mb_per_min {
            vec![
                format!(
                    "Memory growth is elevated ({:.1} MB/min). Schedule a restart and review recent changes.",
                    rate_mb_per_min
                ),
                "Check long-lived caches and unbounded collections.".to_string(),
            ]
        } else {
            vec![format!(
                "Memory is growing slowly ({:.2} MB/min); continue monitoring the next window.",
                rate_mb_per_min
            )]
        }
    }

    /// サンプルインデックスに対するヒープ使用量の最小二乗回帰
    fn linear_regression(values: &[f64]) -> Regression {
        let n = values.len() as f64;

        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut sum_xy = 0.0;
        let mut sum_x2 = 0.0;
        for (i, y) in values.iter().enumerate() {
            let x = i as f64;
            sum_x += x;
            sum_y += y;
            sum_xy += x * y;
            sum_x2 += x * x;
        }

        let denominator = n * sum_x2 - sum_x * sum_x;
        if denominator.abs() < f64::EPSILON {
            return Regression {
                slope: 0.0,
                r_squared: 0.0,
            };
        }

        let slope = (n * sum_xy - sum_x * sum_y) / denominator;
        let intercept = (sum_y - slope * sum_x) / n;

        let mean = sum_y / n;
        let mut ss_res = 0.0;
        let mut ss_tot = 0.0;
        for (i, y) in values.iter().enumerate() {
            let predicted = slope * i as f64 + intercept;
            ss_res += (y - predicted) * (y - predicted);
            ss_tot += (y - mean) * (y - mean);
        }

        // 分散ゼロ（完全に平坦な系列）は信頼度ゼロとして扱う
        let r_squared = if ss_tot < f64::EPSILON {
            0.0
        } else {
            (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
        };

        Regression { slope, r_squared }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn make_detector() -> LeakDetector {
        let dispatcher = Arc::new(AlertDispatcher::new(
            std::time::Duration::from_secs(300),
            Vec::new(),
        ));
        LeakDetector::new(LeakDetectorConfig::default(), dispatcher)
    }

    /// 1分間隔のスナップショット系列を生成
    fn series(start_mb: f64, step_mb: f64, count: usize) -> Vec<HeapSnapshot> {
        let base = Utc::now() - ChronoDuration::minutes(count as i64);
        (0..count)
            .map(|i| HeapSnapshot {
                timestamp: base + ChronoDuration::minutes(i as i64),
                heap_used_mb: start_mb + step_mb * i as f64,
                virtual_mb: 0.0,
                total_memory_mb: 16384.0,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_growing_series_is_detected() {
        let detector = make_detector();
        // +5MB/サンプル × 12 で総増加 55MB > 閾値 50MB
        for snapshot in series(200.0, 5.0, 12) {
            detector.record_snapshot(snapshot).await;
        }

        let analysis = detector.analyze().await;
        assert!(analysis.detected);
        assert_eq!(analysis.trend, MemoryTrend::Growing);
        assert!(analysis.slope_mb_per_sample > 0.0);
        assert!(analysis.r_squared > 0.9);
        assert_eq!(analysis.state, MonitorState::LeakSuspected);
        assert_eq!(detector.state().await, MonitorState::LeakSuspected);
        assert!(!analysis.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_flat_series_is_not_detected() {
        let detector = make_detector();
        for snapshot in series(300.0, 0.0, 10) {
            detector.record_snapshot(snapshot).await;
        }

        let analysis = detector.analyze().await;
        assert!(!analysis.detected);
        assert_eq!(analysis.trend, MemoryTrend::Stable);
        assert_eq!(analysis.state, MonitorState::Analyzing);
    }

    #[tokio::test]
    async fn test_warmup_returns_low_confidence() {
        let detector = make_detector();
        for snapshot in series(200.0, 5.0, 3) {
            detector.record_snapshot(snapshot).await;
        }

        let analysis = detector.analyze().await;
        assert!(!analysis.detected);
        assert_eq!(analysis.state, MonitorState::WarmingUp);
        assert!(analysis.reason.contains("insufficient samples"));
    }

    #[tokio::test]
    async fn test_detection_is_not_sticky() {
        let detector = make_detector();
        for snapshot in series(200.0, 10.0, 10) {
            detector.record_snapshot(snapshot).await;
        }
        let analysis = detector.analyze().await;
        assert!(analysis.detected);
        assert_eq!(detector.state().await, MonitorState::LeakSuspected);

        // 健全なウィンドウに戻れば検知は解除される
        detector.reset().await;
        for snapshot in series(250.0, 0.0, 10) {
            detector.record_snapshot(snapshot).await;
        }
        let analysis = detector.analyze().await;
        assert!(!analysis.detected);
        assert_eq!(detector.state().await, MonitorState::Analyzing);
    }

    #[tokio::test]
    async fn test_noisy_growth_below_confidence_not_detected() {
        let detector = make_detector();
        // 総増加は大きいがジグザグで当てはまりが悪い系列
        let base = Utc::now() - ChronoDuration::minutes(10);
        let values = [200.0, 320.0, 180.0, 350.0, 190.0, 340.0, 200.0, 360.0];
        for (i, value) in values.iter().enumerate() {
            detector
                .record_snapshot(HeapSnapshot {
                    timestamp: base + ChronoDuration::minutes(i as i64),
                    heap_used_mb: *value,
                    virtual_mb: 0.0,
                    total_memory_mb: 16384.0,
                })
                .await;
        }

        let analysis = detector.analyze().await;
        assert!(analysis.r_squared < 0.7);
        assert!(!analysis.detected);
    }

    #[tokio::test]
    async fn test_growth_rate_uses_wall_clock() {
        let detector = make_detector();
        // 11分間で 55MB 増加 → 5 MB/分
        for snapshot in series(100.0, 5.0, 12) {
            detector.record_snapshot(snapshot).await;
        }

        let analysis = detector.analyze().await;
        assert!((analysis.growth_rate_mb_per_min - 5.0).abs() < 0.1);
        // 回帰の傾きはサンプルあたりの値で、別の診断値
        assert!((analysis.slope_mb_per_sample - 5.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn test_critical_rate_recommendation() {
        let config = LeakDetectorConfig::default();
        let recommendations = LeakDetector::build_recommendations(true, 15.0, &config);
        assert!(recommendations[0].contains("Restart the service immediately"));

        let recommendations = LeakDetector::build_recommendations(true, 7.0, &config);
        assert!(recommendations[0].contains("elevated"));

        let recommendations = LeakDetector::build_recommendations(true, 2.0, &config);
        assert!(recommendations[0].contains("growing slowly"));
    }

    #[tokio::test]
    async fn test_stop_monitoring_is_idempotent() {
        let detector = make_detector();
        detector.start_monitoring().await;
        assert_ne!(detector.state().await, MonitorState::Idle);

        detector.stop_monitoring().await;
        assert_eq!(detector.state().await, MonitorState::Idle);
        detector.stop_monitoring().await;
        assert_eq!(detector.state().await, MonitorState::Idle);
    }

    #[test]
    fn test_linear_regression_perfect_fit() {
        let values: Vec<f64> = (0..10).map(|i| 100.0 + 2.0 * i as f64).collect();
        let regression = LeakDetector::linear_regression(&values);
        assert!((regression.slope - 2.0).abs() < 1e-9);
        assert!((regression.r_squared - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_linear_regression_flat_series() {
        let values = vec![100.0; 10];
        let regression = LeakDetector::linear_regression(&values);
        assert_eq!(regression.slope, 0.0);
        assert_eq!(regression.r_squared, 0.0);
    }
}
