//! サンプルストア型定義
//!
//! 容量固定の FIFO ストアと、各コレクタが記録するサンプル型を提供します。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// タイムスタンプを持つ型
pub trait Timestamped {
    /// 記録時刻を取得
    fn timestamp(&self) -> DateTime<Utc>;
}

/// 汎用メトリクスサンプル
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// 記録時刻
    pub timestamp: DateTime<Utc>,
    /// 値
    pub value: f64,
    /// ラベル（任意）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Sample {
    /// 新しいサンプルを作成
    pub fn new(value: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            value,
            label: None,
        }
    }

    /// ラベルを設定
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl Timestamped for Sample {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// プロセスメモリのスナップショット
///
/// トレンド分析器のサンプリングタスクのみが生成し、分析側からは読み取り専用です。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapSnapshot {
    /// 記録時刻
    pub timestamp: DateTime<Utc>,
    /// プロセスの使用メモリ（MB、回帰分析の対象系列）
    pub heap_used_mb: f64,
    /// 仮想メモリ（MB）
    pub virtual_mb: f64,
    /// システム総メモリ（MB）
    pub total_memory_mb: f64,
}

impl Timestamped for HeapSnapshot {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// 容量固定 FIFO ストア
///
/// 容量 `N` を超える挿入は最も古いエントリを追い出します。
/// 無制限には成長しません。
#[derive(Debug, Clone, Serialize)]
pub struct BoundedStore<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T: Clone> BoundedStore<T> {
    /// 指定容量でストアを作成
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// サンプルを追加（容量超過時は最古のエントリを追い出す）
    pub fn push(&mut self, item: T) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// 現在の内容の不変コピーを取得
    pub fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    /// 最新のエントリを取得
    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// 保持数を取得
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// 空かどうか
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 容量を取得
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 全エントリを削除
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone + Timestamped> BoundedStore<T> {
    /// 指定時刻より古いサンプルを削除
    pub fn clear_older_than(&mut self, cutoff: DateTime<Utc>) {
        self.items.retain(|item| item.timestamp() >= cutoff);
    }
}

/// サンプル系列の要約統計
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleStats {
    /// 最小値
    pub min: f64,
    /// 最大値
    pub max: f64,
    /// 平均値
    pub mean: f64,
    /// サンプル数
    pub count: usize,
}

impl SampleStats {
    /// サンプル列から統計を計算
    pub fn from_samples(samples: &[Sample]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut sum = 0.0;
        for sample in samples {
            min = min.min(sample.value);
            max = max.max(sample.value);
            sum += sample.value;
        }

        Self {
            min,
            max,
            mean: sum / samples.len() as f64,
            count: samples.len(),
        }
    }
}
