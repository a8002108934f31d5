//! アラート型定義

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// アラート種別
///
/// クールダウンはこの種別単位で適用されます。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// スロークエリ
    SlowQuery,
    /// 高頻度クエリ
    FrequentQuery,
    /// メモリ使用率超過
    HighMemory,
    /// CPU 負荷超過
    HighCpu,
    /// ディスク使用率超過
    HighDisk,
    /// メモリリーク疑い
    MemoryLeak,
    /// クライアント側エラー
    ClientError,
    /// その他
    Custom(String),
}

impl AlertType {
    /// 種別名を取得
    pub fn as_str(&self) -> &str {
        match self {
            Self::SlowQuery => "slow_query",
            Self::FrequentQuery => "frequent_query",
            Self::HighMemory => "high_memory",
            Self::HighCpu => "high_cpu",
            Self::HighDisk => "high_disk",
            Self::MemoryLeak => "memory_leak",
            Self::ClientError => "client_error",
            Self::Custom(name) => name,
        }
    }
}

/// アラート重要度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// 情報
    Info,
    /// 警告
    Warning,
    /// 致命的
    Critical,
}

impl AlertSeverity {
    /// 重要度名を取得
    pub fn as_str(&self) -> &str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// アラート
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// アラートID
    pub id: String,
    /// 種別
    pub alert_type: AlertType,
    /// 重要度
    pub severity: AlertSeverity,
    /// タイトル
    pub title: String,
    /// メッセージ
    pub message: String,
    /// 発生時刻
    pub timestamp: DateTime<Utc>,
    /// 付加情報
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// 解決済みフラグ
    pub resolved: bool,
    /// 解決時刻
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// 新しいアラートを作成
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            alert_type,
            severity,
            title: title.into(),
            message: message.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            resolved: false,
            resolved_at: None,
        }
    }

    /// 付加情報を追加
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// アラートを解決（active → resolved は一方向）
    pub fn resolve(&mut self) {
        if !self.resolved {
            self.resolved = true;
            self.resolved_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_creation() {
        let alert = Alert::new(
            AlertType::SlowQuery,
            AlertSeverity::Warning,
            "Slow query detected",
            "query exceeded threshold",
        )
        .with_metadata("duration_ms", serde_json::json!(1500.0));

        assert!(!alert.resolved);
        assert!(alert.resolved_at.is_none());
        assert_eq!(alert.metadata["duration_ms"], 1500.0);
    }

    #[test]
    fn test_resolve_is_one_way() {
        let mut alert = Alert::new(
            AlertType::HighMemory,
            AlertSeverity::Critical,
            "memory",
            "above threshold",
        );

        alert.resolve();
        let first_resolved_at = alert.resolved_at;
        assert!(alert.resolved);

        // 再解決しても解決時刻は変わらない
        alert.resolve();
        assert_eq!(alert.resolved_at, first_resolved_at);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AlertSeverity::Critical > AlertSeverity::Warning);
        assert!(AlertSeverity::Warning > AlertSeverity::Info);
    }

    #[test]
    fn test_alert_type_serialization() {
        let json = serde_json::to_string(&AlertType::SlowQuery).unwrap();
        assert_eq!(json, "\"slow_query\"");
    }
}
