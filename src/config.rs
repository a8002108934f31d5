//! パイプライン設定
//!
//! デフォルト値 → 設定ファイル（TOML） → 環境変数の順で上書きされます。

use crate::error::{Error, Result};
use crate::monitoring::alerts::{ConsoleChannelConfig, EmailChannelConfig, WebhookChannelConfig};
use crate::monitoring::{
    ApiMonitorConfig, ClientBatcherConfig, LeakDetectorConfig, QueryMonitorConfig,
    ResourceSamplerConfig,
};
use crate::sanitize::SanitizerConfig;
use serde::{Deserialize, Serialize};

/// アラート設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// 同一種別アラートのクールダウン（秒）
    pub cooldown_secs: u64,
    /// コンソールチャネル
    pub console: ConsoleChannelConfig,
    /// メールチャネル
    pub email: EmailChannelConfig,
    /// Webhook チャネル
    pub webhook: WebhookChannelConfig,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            console: ConsoleChannelConfig::default(),
            email: EmailChannelConfig::default(),
            webhook: WebhookChannelConfig::default(),
        }
    }
}

/// パイプライン全体の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// 実行環境名（Webhook ペイロード等に含まれる）
    pub environment: String,
    /// サニタイザ
    pub sanitizer: SanitizerConfig,
    /// クエリ監視
    pub query: QueryMonitorConfig,
    /// リソースサンプラー
    pub resource: ResourceSamplerConfig,
    /// トレンド分析器
    pub leak: LeakDetectorConfig,
    /// エンドポイント監視
    pub api: ApiMonitorConfig,
    /// クライアントテレメトリ
    pub client: ClientBatcherConfig,
    /// アラート
    pub alerts: AlertsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            sanitizer: SanitizerConfig::default(),
            query: QueryMonitorConfig::default(),
            resource: ResourceSamplerConfig::default(),
            leak: LeakDetectorConfig::default(),
            api: ApiMonitorConfig::default(),
            client: ClientBatcherConfig::default(),
            alerts: AlertsConfig::default(),
        }
    }
}

impl TelemetryConfig {
    /// 設定ファイルから読み込み、環境変数で上書き
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder();

        // デフォルト値を設定
        let default_config = TelemetryConfig::default();
        settings = settings.add_source(
            config::Config::try_from(&default_config).map_err(|e| Error::Config(e.to_string()))?,
        );

        // 設定ファイルを読み込み（複数の場所を試行）
        let config_paths = ["telemetry.toml", "config/telemetry.toml"];
        for path in &config_paths {
            if std::path::Path::new(path).exists() {
                settings = settings.add_source(config::File::with_name(path));
                break;
            }
        }

        // 環境変数で上書き (TELEMETRY_ で始まる変数)
        settings = settings.add_source(
            config::Environment::with_prefix("TELEMETRY")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: TelemetryConfig = settings
            .build()
            .map_err(|e| Error::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;

        // チャネル認証情報の個別上書き
        if let Ok(url) = std::env::var("TELEMETRY_WEBHOOK_URL") {
            config.alerts.webhook.url = url;
            config.alerts.webhook.enabled = true;
        }
        if let Ok(password) = std::env::var("TELEMETRY_SMTP_PASSWORD") {
            config.alerts.email.smtp_password = Some(password);
        }

        Ok(config)
    }

    /// サンプル設定ファイルを生成
    pub fn generate_sample_config() -> Result<()> {
        let sample = TelemetryConfig::default();
        let toml_content = toml::to_string_pretty(&sample)
            .map_err(|e| Error::Config(format!("failed to render sample config: {}", e)))?;

        let content = format!(
            "# telemetry-rs configuration\n#\n\
             # このファイルを telemetry.toml として保存してください。\n\
             # 環境変数での上書きも可能です\n\
             # (例: TELEMETRY_ALERTS__COOLDOWN_SECS=600, TELEMETRY_WEBHOOK_URL=...)\n\n{}",
            toml_content
        );

        std::fs::write("telemetry.toml.example", content)?;
        Ok(())
    }
}
