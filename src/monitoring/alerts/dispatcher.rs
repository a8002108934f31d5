//! アラートディスパッチャ
//!
//! 各検知器からのアラートを受け取り、種別ごとのクールダウンを適用した上で
//! 有効な全チャネルへ並行配送します。チャネル障害は相互に分離されます。

use super::alert::{Alert, AlertType};
use super::channels::AlertChannel;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error};

/// 購読チャネルのバッファサイズ
const NOTIFY_BUFFER: usize = 64;

/// アラートディスパッチャ
pub struct AlertDispatcher {
    /// クールダウン幅
    cooldown: Duration,
    /// アラートテーブル（ID → アラート）
    alerts: Arc<RwLock<HashMap<String, Alert>>>,
    /// 種別ごとの最終送信時刻
    last_alert_times: Arc<RwLock<HashMap<AlertType, DateTime<Utc>>>>,
    /// 通知チャネル
    channels: Arc<RwLock<Vec<Arc<dyn AlertChannel>>>>,
    /// プロセス内購読者への通知
    notify_tx: broadcast::Sender<Alert>,
}

impl AlertDispatcher {
    /// 新しいディスパッチャを作成
    pub fn new(cooldown: Duration, channels: Vec<Arc<dyn AlertChannel>>) -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFY_BUFFER);

        Self {
            cooldown,
            alerts: Arc::new(RwLock::new(HashMap::new())),
            last_alert_times: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(channels)),
            notify_tx,
        }
    }

    /// 通知チャネルを追加
    pub async fn add_channel(&self, channel: Arc<dyn AlertChannel>) {
        let mut channels = self.channels.write().await;
        channels.push(channel);
    }

    /// アラート送信の購読を開始
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.notify_tx.subscribe()
    }

    /// アラートを送信
    ///
    /// 同一種別のクールダウンが有効な間は黙って破棄します。
    /// チャネル配送は並行に行われ、個々の失敗は他チャネルに影響しません。
    /// この呼び出し自体は失敗しません。戻り値は配送されたかどうかです。
    pub async fn send_alert(&self, alert: Alert) -> bool {
        let now = Utc::now();

        // クールダウンチェック（重要度によらず種別単位）
        {
            let last_times = self.last_alert_times.read().await;
            if let Some(last) = last_times.get(&alert.alert_type) {
                let elapsed = (now - *last).to_std().unwrap_or(Duration::ZERO);
                if elapsed < self.cooldown {
                    debug!(
                        "Alert suppressed by cooldown: type={}, elapsed={:?}",
                        alert.alert_type.as_str(),
                        elapsed
                    );
                    return false;
                }
            }
        }

        // テーブルに記録し、最終送信時刻を更新
        {
            let mut alerts = self.alerts.write().await;
            alerts.insert(alert.id.clone(), alert.clone());
        }
        {
            let mut last_times = self.last_alert_times.write().await;
            last_times.insert(alert.alert_type.clone(), now);
        }

        // 有効な全チャネルへ並行配送（all-settled）
        let sends: Vec<_> = {
            let channels = self.channels.read().await;
            channels
                .iter()
                .filter(|c| c.is_enabled())
                .map(|c| {
                    let channel = Arc::clone(c);
                    let alert = alert.clone();
                    async move {
                        if let Err(e) = channel.send(&alert).await {
                            error!("Alert channel '{}' failed: {}", channel.name(), e);
                        }
                    }
                })
                .collect()
        };
        futures::future::join_all(sends).await;

        // プロセス内購読者へ通知（購読者不在は無視）
        let _ = self.notify_tx.send(alert);

        true
    }

    /// アラートを解決（一方向遷移、解決済みへの再適用は no-op）
    pub async fn resolve_alert(&self, alert_id: &str) -> bool {
        let mut alerts = self.alerts.write().await;
        match alerts.get_mut(alert_id) {
            Some(alert) if !alert.resolved => {
                alert.resolve();
                true
            }
            _ => false,
        }
    }

    /// アクティブなアラートを取得
    pub async fn get_active_alerts(&self) -> Vec<Alert> {
        let alerts = self.alerts.read().await;
        let mut active: Vec<Alert> = alerts.values().filter(|a| !a.resolved).cloned().collect();
        active.sort_by_key(|a| a.timestamp);
        active
    }

    /// 全アラートを取得
    pub async fn get_all_alerts(&self) -> Vec<Alert> {
        let alerts = self.alerts.read().await;
        let mut all: Vec<Alert> = alerts.values().cloned().collect();
        all.sort_by_key(|a| a.timestamp);
        all
    }

    /// 解決済みアラートを削除（テーブル肥大化の抑制）
    pub async fn clear_resolved_alerts(&self) -> usize {
        let mut alerts = self.alerts.write().await;
        let before = alerts.len();
        alerts.retain(|_, alert| !alert.resolved);
        before - alerts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::alerts::alert::{AlertSeverity, AlertType};
    use crate::monitoring::alerts::channels::ConsoleChannelConfig;
    use crate::monitoring::alerts::ConsoleChannel;
    use async_trait::async_trait;

    /// 送信されたアラートを記録するテスト用チャネル
    struct RecordingChannel {
        sent: Arc<RwLock<Vec<Alert>>>,
        fail: bool,
    }

    #[async_trait]
    impl AlertChannel for RecordingChannel {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn is_enabled(&self) -> bool {
            true
        }

        async fn send(&self, alert: &Alert) -> crate::error::Result<()> {
            if self.fail {
                return Err(crate::error::Error::Channel("simulated failure".into()));
            }
            self.sent.write().await.push(alert.clone());
            Ok(())
        }
    }

    fn make_alert(alert_type: AlertType) -> Alert {
        Alert::new(alert_type, AlertSeverity::Warning, "title", "message")
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_same_type() {
        let sent = Arc::new(RwLock::new(Vec::new()));
        let channel = Arc::new(RecordingChannel {
            sent: sent.clone(),
            fail: false,
        });
        let dispatcher = AlertDispatcher::new(Duration::from_secs(300), vec![channel]);

        // 同一種別の2回目はクールダウンで破棄される
        assert!(dispatcher.send_alert(make_alert(AlertType::SlowQuery)).await);
        assert!(!dispatcher.send_alert(make_alert(AlertType::SlowQuery)).await);
        assert_eq!(sent.read().await.len(), 1);

        // 別種別は独立して配送される
        assert!(dispatcher.send_alert(make_alert(AlertType::HighCpu)).await);
        assert_eq!(sent.read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_second_alert_after_cooldown_expires() {
        let sent = Arc::new(RwLock::new(Vec::new()));
        let channel = Arc::new(RecordingChannel {
            sent: sent.clone(),
            fail: false,
        });
        let dispatcher = AlertDispatcher::new(Duration::from_millis(50), vec![channel]);

        assert!(dispatcher.send_alert(make_alert(AlertType::SlowQuery)).await);
        assert!(!dispatcher.send_alert(make_alert(AlertType::SlowQuery)).await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(dispatcher.send_alert(make_alert(AlertType::SlowQuery)).await);
        assert_eq!(sent.read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_channel_failure_is_isolated() {
        let sent = Arc::new(RwLock::new(Vec::new()));
        let failing = Arc::new(RecordingChannel {
            sent: Arc::new(RwLock::new(Vec::new())),
            fail: true,
        });
        let working = Arc::new(RecordingChannel {
            sent: sent.clone(),
            fail: false,
        });
        let dispatcher =
            AlertDispatcher::new(Duration::from_secs(300), vec![failing, working]);

        // 一方のチャネルが失敗しても他方には配送され、呼び出しは成功する
        assert!(dispatcher.send_alert(make_alert(AlertType::HighDisk)).await);
        assert_eq!(sent.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_is_one_way() {
        let dispatcher = AlertDispatcher::new(
            Duration::from_secs(300),
            vec![Arc::new(ConsoleChannel::new(ConsoleChannelConfig {
                enabled: false,
            }))],
        );

        let alert = make_alert(AlertType::MemoryLeak);
        let id = alert.id.clone();
        dispatcher.send_alert(alert).await;

        assert_eq!(dispatcher.get_active_alerts().await.len(), 1);
        assert!(dispatcher.resolve_alert(&id).await);

        // 解決済みへの再解決は no-op
        assert!(!dispatcher.resolve_alert(&id).await);
        assert!(dispatcher.get_active_alerts().await.is_empty());
        assert_eq!(dispatcher.get_all_alerts().await.len(), 1);

        // 存在しないIDも no-op
        assert!(!dispatcher.resolve_alert("missing").await);
    }

    #[tokio::test]
    async fn test_clear_resolved_alerts() {
        let dispatcher = AlertDispatcher::new(Duration::from_secs(300), Vec::new());

        let alert = make_alert(AlertType::HighMemory);
        let id = alert.id.clone();
        dispatcher.send_alert(alert).await;
        dispatcher.send_alert(make_alert(AlertType::HighCpu)).await;

        dispatcher.resolve_alert(&id).await;
        assert_eq!(dispatcher.clear_resolved_alerts().await, 1);
        assert_eq!(dispatcher.get_all_alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_subscriber_receives_sent_alert() {
        let dispatcher = AlertDispatcher::new(Duration::from_secs(300), Vec::new());
        let mut rx = dispatcher.subscribe();

        dispatcher.send_alert(make_alert(AlertType::SlowQuery)).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.alert_type, AlertType::SlowQuery);
    }
}
