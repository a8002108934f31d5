//! リソースサンプラー
//!
//! OS レベルのメモリ・CPU・ディスク使用状況を一定周期で収集し、
//! 2段階閾値（warning / critical）でアラートを送出します。
//! サンプルは容量固定ストアに保持し、レポート生成に使用します。

use crate::monitoring::alerts::{Alert, AlertDispatcher, AlertSeverity, AlertType};
use crate::monitoring::store::{BoundedStore, Sample, SampleStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

const BYTES_PER_MB: f64 = 1_048_576.0;
const BYTES_PER_GB: f64 = 1_073_741_824.0;

/// 2段階閾値
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierThresholds {
    /// 警告閾値（%）
    pub warning: f64,
    /// 致命的閾値（%）
    pub critical: f64,
}

/// リソースサンプラー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSamplerConfig {
    /// 収集間隔（秒）
    pub interval_secs: u64,
    /// 履歴保持数
    pub history_size: usize,
    /// ペアチェックによるリーク判定のメモリ増加幅（ポイント）
    pub leak_delta_percent: f64,
    /// メモリ閾値
    pub memory: TierThresholds,
    /// CPU 閾値
    pub cpu: TierThresholds,
    /// ディスク閾値
    pub disk: TierThresholds,
}

impl Default for ResourceSamplerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            history_size: 100,
            leak_delta_percent: 10.0,
            memory: TierThresholds {
                warning: 80.0,
                critical: 90.0,
            },
            cpu: TierThresholds {
                warning: 80.0,
                critical: 95.0,
            },
            disk: TierThresholds {
                warning: 80.0,
                critical: 90.0,
            },
        }
    }
}

/// メモリ計測値
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryReading {
    /// 総メモリ（MB）
    pub total_mb: f64,
    /// 使用メモリ（MB）
    pub used_mb: f64,
    /// 空きメモリ（MB）
    pub free_mb: f64,
    /// 使用率（%）
    pub used_percent: f64,
}

/// CPU 計測値
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuReading {
    /// コア数
    pub cores: usize,
    /// ロードアベレージ（1分）
    pub load_one: f64,
    /// コア数で正規化した負荷率（0-100）
    pub load_percent: f64,
}

/// ディスク計測値
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskReading {
    /// マウントポイント
    pub mount_point: String,
    /// 総容量（GB）
    pub total_gb: f64,
    /// 空き容量（GB）
    pub available_gb: f64,
    /// 使用率（%）
    pub used_percent: f64,
}

/// リソーススナップショット
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// 記録時刻
    pub timestamp: DateTime<Utc>,
    /// メモリ
    pub memory: MemoryReading,
    /// CPU
    pub cpu: CpuReading,
    /// ディスク
    pub disk: DiskReading,
}

/// ペアチェックによるメモリリーク検査結果
///
/// 2点間の粗い比較であり、回帰ベースのトレンド分析とは独立した検査です。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLeakProbe {
    /// 開始時刻
    pub started_at: DateTime<Utc>,
    /// 終了時刻
    pub finished_at: DateTime<Utc>,
    /// 開始時の使用率（%）
    pub first_percent: f64,
    /// 終了時の使用率（%）
    pub second_percent: f64,
    /// 増加幅（ポイント）
    pub delta_percent: f64,
    /// リーク疑いフラグ
    pub leak_detected: bool,
}

/// リソースレポート
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceReport {
    /// 生成時刻
    pub generated_at: DateTime<Utc>,
    /// 現在のスナップショット
    pub current: ResourceSnapshot,
    /// メモリ使用率の統計
    pub memory: SampleStats,
    /// CPU 負荷率の統計
    pub cpu: SampleStats,
    /// ディスク使用率の統計
    pub disk: SampleStats,
}

/// ドメイン別サンプル履歴
struct ResourceHistory {
    memory: BoundedStore<Sample>,
    cpu: BoundedStore<Sample>,
    disk: BoundedStore<Sample>,
}

/// リソースサンプラー
pub struct ResourceSampler {
    config: ResourceSamplerConfig,
    dispatcher: Arc<AlertDispatcher>,
    history: Arc<RwLock<ResourceHistory>>,
    sampler_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl ResourceSampler {
    /// 新しいリソースサンプラーを作成
    pub fn new(config: ResourceSamplerConfig, dispatcher: Arc<AlertDispatcher>) -> Self {
        let history = ResourceHistory {
            memory: BoundedStore::new(config.history_size),
            cpu: BoundedStore::new(config.history_size),
            disk: BoundedStore::new(config.history_size),
        };

        Self {
            config,
            dispatcher,
            history: Arc::new(RwLock::new(history)),
            sampler_task: Arc::new(RwLock::new(None)),
        }
    }

    /// 現在のシステム状態を読み取る
    fn read_snapshot() -> ResourceSnapshot {
        let mut sys = System::new();
        sys.refresh_memory();

        let total = sys.total_memory() as f64;
        let used = sys.used_memory() as f64;
        let memory = MemoryReading {
            total_mb: total / BYTES_PER_MB,
            used_mb: used / BYTES_PER_MB,
            free_mb: sys.available_memory() as f64 / BYTES_PER_MB,
            used_percent: if total > 0.0 { used / total * 100.0 } else { 0.0 },
        };

        let cores = num_cpus::get().max(1);
        let load_one = System::load_average().one;
        let cpu = CpuReading {
            cores,
            load_one,
            load_percent: (load_one / cores as f64 * 100.0).clamp(0.0, 100.0),
        };

        ResourceSnapshot {
            timestamp: Utc::now(),
            memory,
            cpu,
            disk: Self::read_working_disk(),
        }
    }

    /// 作業ボリュームのディスク使用状況を読み取る
    fn read_working_disk() -> DiskReading {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let disks = Disks::new_with_refreshed_list();

        // カレントディレクトリを含む最長マウントポイントを選択
        let best = disks
            .list()
            .iter()
            .filter(|d| cwd.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .or_else(|| disks.list().first());

        match best {
            Some(disk) => {
                let total = disk.total_space() as f64;
                let available = disk.available_space() as f64;
                let used_percent = if total > 0.0 {
                    (total - available) / total * 100.0
                } else {
                    0.0
                };
                DiskReading {
                    mount_point: disk.mount_point().to_string_lossy().into_owned(),
                    total_gb: total / BYTES_PER_GB,
                    available_gb: available / BYTES_PER_GB,
                    used_percent,
                }
            }
            None => DiskReading {
                mount_point: String::new(),
                total_gb: 0.0,
                available_gb: 0.0,
                used_percent: 0.0,
            },
        }
    }

    /// 値を2段階閾値と比較
    fn check_tier(value: f64, thresholds: &TierThresholds) -> Option<(AlertSeverity, f64)> {
        if value > thresholds.critical {
            Some((AlertSeverity::Critical, thresholds.critical))
        } else if value > thresholds.warning {
            Some((AlertSeverity::Warning, thresholds.warning))
        } else {
            None
        }
    }

    /// スナップショットを閾値表と照合してアラートを生成
    ///
    /// メモリ・CPU・ディスクは互いに独立に評価されます。
    fn evaluate(snapshot: &ResourceSnapshot, config: &ResourceSamplerConfig) -> Vec<Alert> {
        let domains = [
            (
                AlertType::HighMemory,
                "Memory usage",
                snapshot.memory.used_percent,
                &config.memory,
            ),
            (
                AlertType::HighCpu,
                "CPU load",
                snapshot.cpu.load_percent,
                &config.cpu,
            ),
            (
                AlertType::HighDisk,
                "Disk usage",
                snapshot.disk.used_percent,
                &config.disk,
            ),
        ];

        let mut alerts = Vec::new();
        for (alert_type, label, value, thresholds) in domains {
            if let Some((severity, threshold)) = Self::check_tier(value, thresholds) {
                let title = match severity {
                    AlertSeverity::Critical => format!("{} critical", label),
                    _ => format!("{} high", label),
                };
                alerts.push(
                    Alert::new(
                        alert_type,
                        severity,
                        title,
                        format!("{} is {:.1}% (threshold: {:.0}%)", label, value, threshold),
                    )
                    .with_metadata("value_percent", serde_json::json!(value))
                    .with_metadata("threshold_percent", serde_json::json!(threshold)),
                );
            }
        }
        alerts
    }

    /// 1回の収集サイクルを実行
    async fn run_cycle(
        config: &ResourceSamplerConfig,
        history: &Arc<RwLock<ResourceHistory>>,
        dispatcher: &Arc<AlertDispatcher>,
    ) -> ResourceSnapshot {
        let snapshot = Self::read_snapshot();

        {
            let mut history = history.write().await;
            history.memory.push(Sample::new(snapshot.memory.used_percent));
            history.cpu.push(Sample::new(snapshot.cpu.load_percent));
            history.disk.push(Sample::new(snapshot.disk.used_percent));
        }

        for alert in Self::evaluate(&snapshot, config) {
            dispatcher.send_alert(alert).await;
        }

        snapshot
    }

    /// 即時に1回収集
    pub async fn collect(&self) -> ResourceSnapshot {
        Self::run_cycle(&self.config, &self.history, &self.dispatcher).await
    }

    /// 定期収集を開始（既に起動済みなら何もしない）
    pub async fn start(&self) {
        let mut task = self.sampler_task.write().await;
        if task.is_some() {
            return;
        }

        let config = self.config.clone();
        let history = self.history.clone();
        let dispatcher = self.dispatcher.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs));
            // 初回ティックは即時発火するため、起動直後に1回収集される
            loop {
                ticker.tick().await;
                Self::run_cycle(&config, &history, &dispatcher).await;
            }
        });

        *task = Some(handle);
        info!(
            "Started resource sampler (interval: {}s)",
            self.config.interval_secs
        );
    }

    /// 定期収集を停止（冪等）
    pub async fn stop(&self) {
        let mut task = self.sampler_task.write().await;
        if let Some(handle) = task.take() {
            handle.abort();
            info!("Stopped resource sampler");
        }
    }

    /// ペアチェックによる粗いメモリリーク検査
    ///
    /// 今すぐ1回サンプリングし、指定時間待ってから再サンプリングして、
    /// 使用率が設定幅を超えて増加していればリーク疑いとして報告します。
    pub async fn detect_memory_leak(&self, duration: Duration) -> MemoryLeakProbe {
        let started_at = Utc::now();
        let first = Self::read_snapshot().memory.used_percent;

        tokio::time::sleep(duration).await;

        let second = Self::read_snapshot().memory.used_percent;
        let delta = second - first;
        let leak_detected = delta > self.config.leak_delta_percent;

        if leak_detected {
            let alert = Alert::new(
                AlertType::MemoryLeak,
                AlertSeverity::Warning,
                "Possible memory leak",
                format!(
                    "memory usage grew {:.1} points over {:?} ({:.1}% -> {:.1}%)",
                    delta, duration, first, second
                ),
            )
            .with_metadata("delta_percent", serde_json::json!(delta))
            .with_metadata("first_percent", serde_json::json!(first))
            .with_metadata("second_percent", serde_json::json!(second));
            self.dispatcher.send_alert(alert).await;
        }

        MemoryLeakProbe {
            started_at,
            finished_at: Utc::now(),
            first_percent: first,
            second_percent: second,
            delta_percent: delta,
            leak_detected,
        }
    }

    /// リソースレポートを生成
    pub async fn generate_report(&self) -> ResourceReport {
        let history = self.history.read().await;
        ResourceReport {
            generated_at: Utc::now(),
            current: Self::read_snapshot(),
            memory: SampleStats::from_samples(&history.memory.snapshot()),
            cpu: SampleStats::from_samples(&history.cpu.snapshot()),
            disk: SampleStats::from_samples(&history.disk.snapshot()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sampler() -> ResourceSampler {
        let dispatcher = Arc::new(AlertDispatcher::new(Duration::from_secs(300), Vec::new()));
        ResourceSampler::new(ResourceSamplerConfig::default(), dispatcher)
    }

    fn synthetic_snapshot(memory: f64, cpu: f64, disk: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            timestamp: Utc::now(),
            memory: MemoryReading {
                total_mb: 16384.0,
                used_mb: 16384.0 * memory / 100.0,
                free_mb: 16384.0 * (100.0 - memory) / 100.0,
                used_percent: memory,
            },
            cpu: CpuReading {
                cores: 8,
                load_one: cpu / 100.0 * 8.0,
                load_percent: cpu,
            },
            disk: DiskReading {
                mount_point: "/".to_string(),
                total_gb: 512.0,
                available_gb: 512.0 * (100.0 - disk) / 100.0,
                used_percent: disk,
            },
        }
    }

    #[test]
    fn test_no_alerts_below_thresholds() {
        let config = ResourceSamplerConfig::default();
        let snapshot = synthetic_snapshot(50.0, 40.0, 60.0);
        assert!(ResourceSampler::evaluate(&snapshot, &config).is_empty());
    }

    #[test]
    fn test_warning_tier() {
        let config = ResourceSamplerConfig::default();
        let snapshot = synthetic_snapshot(85.0, 40.0, 60.0);

        let alerts = ResourceSampler::evaluate(&snapshot, &config);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::HighMemory);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
    }

    #[test]
    fn test_critical_tier_and_independent_domains() {
        let config = ResourceSamplerConfig::default();
        let snapshot = synthetic_snapshot(95.0, 96.0, 85.0);

        let alerts = ResourceSampler::evaluate(&snapshot, &config);
        assert_eq!(alerts.len(), 3);

        let memory = alerts
            .iter()
            .find(|a| a.alert_type == AlertType::HighMemory)
            .unwrap();
        assert_eq!(memory.severity, AlertSeverity::Critical);

        let cpu = alerts
            .iter()
            .find(|a| a.alert_type == AlertType::HighCpu)
            .unwrap();
        assert_eq!(cpu.severity, AlertSeverity::Critical);

        let disk = alerts
            .iter()
            .find(|a| a.alert_type == AlertType::HighDisk)
            .unwrap();
        assert_eq!(disk.severity, AlertSeverity::Warning);
    }

    #[test]
    fn test_cpu_tier_boundary() {
        let config = ResourceSamplerConfig::default();

        // CPU は 80/95 の閾値
        let snapshot = synthetic_snapshot(10.0, 90.0, 10.0);
        let alerts = ResourceSampler::evaluate(&snapshot, &config);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
    }

    #[tokio::test]
    async fn test_collect_pushes_history() {
        let sampler = make_sampler();
        let snapshot = sampler.collect().await;

        assert!(snapshot.memory.total_mb > 0.0);
        assert!(snapshot.cpu.cores >= 1);

        let report = sampler.generate_report().await;
        assert_eq!(report.memory.count, 1);
        assert_eq!(report.cpu.count, 1);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let sampler = make_sampler();
        sampler.start().await;
        sampler.start().await;
        sampler.stop().await;
        sampler.stop().await;
    }

    #[tokio::test]
    async fn test_memory_leak_probe_short_window() {
        let sampler = make_sampler();
        let probe = sampler
            .detect_memory_leak(Duration::from_millis(10))
            .await;

        // 10ms では使用率が10ポイントも増えない
        assert!(!probe.leak_detected);
        assert!(probe.finished_at >= probe.started_at);
    }
}
