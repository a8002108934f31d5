//! 通知チャネル実装
//!
//! コンソール（構造化ログ）、メール（テンプレート生成）、Webhook（JSON POST）の
//! 各チャネルを提供します。チャネルごとに有効/無効フラグと認証情報を設定します。

use super::alert::{Alert, AlertSeverity};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 通知チャネル
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// チャネル名を取得
    fn name(&self) -> &'static str;

    /// チャネルが有効かどうか
    fn is_enabled(&self) -> bool;

    /// アラートを送信
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// コンソールチャネル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleChannelConfig {
    /// 有効フラグ
    pub enabled: bool,
}

impl Default for ConsoleChannelConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// コンソールチャネル
///
/// 重要度に応じたレベルで構造化ログに出力します。
pub struct ConsoleChannel {
    config: ConsoleChannelConfig,
}

impl ConsoleChannel {
    /// 新しいコンソールチャネルを作成
    pub fn new(config: ConsoleChannelConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AlertChannel for ConsoleChannel {
    fn name(&self) -> &'static str {
        "console"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Critical => {
                error!(
                    alert_id = %alert.id,
                    alert_type = alert.alert_type.as_str(),
                    "CRITICAL ALERT: {} - {}",
                    alert.title,
                    alert.message
                );
            }
            AlertSeverity::Warning => {
                warn!(
                    alert_id = %alert.id,
                    alert_type = alert.alert_type.as_str(),
                    "ALERT: {} - {}",
                    alert.title,
                    alert.message
                );
            }
            AlertSeverity::Info => {
                info!(
                    alert_id = %alert.id,
                    alert_type = alert.alert_type.as_str(),
                    "alert: {} - {}",
                    alert.title,
                    alert.message
                );
            }
        }
        Ok(())
    }
}

/// メールチャネル設定
///
/// 認証情報は環境（設定ファイル・環境変数）から供給します。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailChannelConfig {
    /// 有効フラグ
    pub enabled: bool,
    /// SMTP ホスト
    pub smtp_host: String,
    /// SMTP ポート
    pub smtp_port: u16,
    /// SMTP ユーザー名
    pub smtp_username: Option<String>,
    /// SMTP パスワード
    pub smtp_password: Option<String>,
    /// 送信元アドレス
    pub from_address: String,
    /// 宛先アドレス
    pub to_addresses: Vec<String>,
}

impl Default for EmailChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            from_address: String::new(),
            to_addresses: Vec::new(),
        }
    }
}

/// メールチャネル
pub struct EmailChannel {
    config: EmailChannelConfig,
}

impl EmailChannel {
    /// 新しいメールチャネルを作成
    pub fn new(config: EmailChannelConfig) -> Self {
        Self { config }
    }

    /// 件名を生成
    fn build_subject(&self, alert: &Alert) -> String {
        format!(
            "[telemetry] {}: {}",
            alert.severity.as_str().to_uppercase(),
            alert.title
        )
    }

    /// 本文を生成（プレーンテキスト）
    fn build_body(&self, alert: &Alert) -> String {
        let mut body = format!(
            "{}\n\nType: {}\nSeverity: {}\nTime: {}\n",
            alert.message,
            alert.alert_type.as_str(),
            alert.severity.as_str(),
            alert.timestamp.to_rfc3339()
        );

        if !alert.metadata.is_empty() {
            body.push_str("\nDetails:\n");
            for (key, value) in &alert.metadata {
                body.push_str(&format!("  {}: {}\n", key, value));
            }
        }

        body
    }
}

#[async_trait]
impl AlertChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
            && !self.config.smtp_host.is_empty()
            && !self.config.from_address.is_empty()
            && !self.config.to_addresses.is_empty()
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let subject = self.build_subject(alert);
        let _body = self.build_body(alert);

        info!(
            "Would send email alert '{}' to {:?} via {}:{}",
            subject, self.config.to_addresses, self.config.smtp_host, self.config.smtp_port
        );

        debug!("Email alert rendered: {}", alert.id);
        Ok(())
    }
}

/// Webhook チャネル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookChannelConfig {
    /// 有効フラグ
    pub enabled: bool,
    /// 送信先 URL
    pub url: String,
    /// タイムアウト（秒）
    pub timeout_secs: u64,
}

impl Default for WebhookChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            timeout_secs: 10,
        }
    }
}

/// Webhook チャネル
///
/// `{alert, timestamp, environment}` の JSON を POST します。
pub struct WebhookChannel {
    config: WebhookChannelConfig,
    environment: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// 新しい Webhook チャネルを作成
    pub fn new(config: WebhookChannelConfig, environment: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            config,
            environment: environment.into(),
            client,
        }
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.url.is_empty()
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let payload = serde_json::json!({
            "alert": alert,
            "timestamp": chrono::Utc::now(),
            "environment": self.environment,
        });

        let response = self
            .client
            .post(&self.config.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Channel(format!("webhook POST failed: {}", e)))?;

        response
            .error_for_status()
            .map_err(|e| Error::Channel(format!("webhook returned error status: {}", e)))?;

        debug!("Sent webhook notification for alert: {}", alert.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::alerts::alert::AlertType;

    fn sample_alert() -> Alert {
        Alert::new(
            AlertType::HighMemory,
            AlertSeverity::Critical,
            "Memory usage critical",
            "memory usage is 93.1% (threshold: 90%)",
        )
        .with_metadata("value", serde_json::json!(93.1))
    }

    #[test]
    fn test_console_channel_enabled_by_default() {
        let channel = ConsoleChannel::new(ConsoleChannelConfig::default());
        assert!(channel.is_enabled());
    }

    #[test]
    fn test_email_channel_disabled_without_recipients() {
        let config = EmailChannelConfig {
            enabled: true,
            smtp_host: "smtp.example.com".to_string(),
            from_address: "alerts@example.com".to_string(),
            ..Default::default()
        };
        let channel = EmailChannel::new(config);
        assert!(!channel.is_enabled());
    }

    #[test]
    fn test_email_subject_and_body() {
        let config = EmailChannelConfig {
            enabled: true,
            smtp_host: "smtp.example.com".to_string(),
            from_address: "alerts@example.com".to_string(),
            to_addresses: vec!["ops@example.com".to_string()],
            ..Default::default()
        };
        let channel = EmailChannel::new(config);
        let alert = sample_alert();

        let subject = channel.build_subject(&alert);
        assert!(subject.contains("CRITICAL"));
        assert!(subject.contains("Memory usage critical"));

        let body = channel.build_body(&alert);
        assert!(body.contains("high_memory"));
        assert!(body.contains("93.1"));
    }

    #[test]
    fn test_webhook_channel_disabled_without_url() {
        let channel = WebhookChannel::new(WebhookChannelConfig::default(), "test");
        assert!(!channel.is_enabled());
    }

    #[tokio::test]
    async fn test_console_send_never_fails() {
        let channel = ConsoleChannel::new(ConsoleChannelConfig::default());
        assert!(channel.send(&sample_alert()).await.is_ok());
    }
}
