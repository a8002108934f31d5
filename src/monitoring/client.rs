//! クライアントテレメトリバッチャー
//!
//! クライアント由来のエラー/イベントをサニタイズしてメモリ上のバッチに
//! 蓄積します。フラッシュ契機は「サイズ上限到達」「タイマー発火」
//! 「シャットダウン（ベストエフォートの最終フラッシュ）」の早い者勝ちです。
//! トークンバケット方式のレート制限が枯渇した分は黙って破棄し、
//! エラーストーム時の送出量を抑えます。フラッシュ失敗はリトライしません
//! （障害時の重複増幅を避ける）。

use crate::sanitize::Sanitizer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// バッチャー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientBatcherConfig {
    /// バッチサイズ上限
    pub batch_size: usize,
    /// フラッシュ間隔（秒）
    pub flush_interval_secs: u64,
    /// レート制限（エントリ数/分）
    pub rate_limit_per_minute: u32,
    /// フラッシュ先エンドポイント（未設定ならローカルログのみ）
    pub endpoint: Option<String>,
}

impl Default for ClientBatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval_secs: 5,
            rate_limit_per_minute: 100,
            endpoint: None,
        }
    }
}

/// クライアント由来のイベント
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEvent {
    /// 記録時刻
    pub timestamp: DateTime<Utc>,
    /// メッセージ（サニタイズ済みで保存される）
    pub message: String,
    /// スタックトレース
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// 発生元 URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// ユーザーエージェント
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl ClientEvent {
    /// 新しいイベントを作成
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            stack: None,
            url: None,
            user_agent: None,
        }
    }

    /// スタックトレースを設定
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// 発生元 URL を設定
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// ユーザーエージェントを設定
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// エラーバッチ
///
/// 蓄積とフラッシュの間にのみ存在する一時的な入れ物で、
/// 送信の成否にかかわらず破棄されます。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBatch {
    /// バッチID
    pub batch_id: String,
    /// 作成時刻
    pub created_at: DateTime<Utc>,
    /// エントリ
    pub entries: Vec<ClientEvent>,
}

/// トークンバケット
///
/// ローリングに補充される固定予算。枯渇中のエントリは破棄されます。
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    capacity: f64,
    refill_rate: f64,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
            capacity,
            refill_rate,
        }
    }

    fn refill_tokens(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        let tokens_to_add = elapsed * self.refill_rate;
        self.tokens = (self.tokens + tokens_to_add).min(self.capacity);
        self.last_refill = now;
    }

    fn consume_token(&mut self) -> bool {
        self.refill_tokens();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    batches_flushed: AtomicU64,
    last_flush_size: AtomicU64,
}

/// バッチャー統計
#[derive(Debug, Clone, Serialize)]
pub struct BatcherStats {
    /// 受理エントリ数
    pub accepted: u64,
    /// レート制限で破棄されたエントリ数
    pub dropped: u64,
    /// フラッシュしたバッチ数
    pub batches_flushed: u64,
    /// 直近フラッシュのエントリ数
    pub last_flush_size: u64,
    /// 未フラッシュのエントリ数
    pub pending: usize,
}

/// クライアントテレメトリバッチャー
pub struct ClientTelemetryBatcher {
    config: ClientBatcherConfig,
    sanitizer: Arc<Sanitizer>,
    client: reqwest::Client,
    entries: Arc<RwLock<Vec<ClientEvent>>>,
    bucket: Arc<Mutex<TokenBucket>>,
    counters: Arc<Counters>,
    flush_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl ClientTelemetryBatcher {
    /// 新しいバッチャーを作成
    pub fn new(config: ClientBatcherConfig, sanitizer: Arc<Sanitizer>) -> Self {
        let capacity = config.rate_limit_per_minute as f64;
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket::new(capacity, capacity / 60.0))),
            config,
            sanitizer,
            client: reqwest::Client::new(),
            entries: Arc::new(RwLock::new(Vec::new())),
            counters: Arc::new(Counters::default()),
            flush_task: Arc::new(RwLock::new(None)),
        }
    }

    /// クライアントエラーを記録
    ///
    /// レート制限の予算が尽きている間は黙って破棄し、false を返します。
    pub async fn record_client_error(&self, event: ClientEvent) -> bool {
        {
            let mut bucket = self.bucket.lock().await;
            if !bucket.consume_token() {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Client telemetry entry dropped by rate limiter");
                return false;
            }
        }

        let sanitized = ClientEvent {
            timestamp: event.timestamp,
            message: self.sanitizer.sanitize(&event.message),
            stack: event.stack.map(|s| self.sanitizer.sanitize(&s)),
            url: event.url.map(|u| self.sanitizer.sanitize_url(&u)),
            user_agent: event.user_agent,
        };

        let should_flush = {
            let mut entries = self.entries.write().await;
            entries.push(sanitized);
            entries.len() >= self.config.batch_size
        };
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);

        if should_flush {
            Self::flush_pending(&self.config, &self.entries, &self.counters, &self.client, false)
                .await;
        }

        true
    }

    /// 未フラッシュ分を取り出してバッチ化し、送信へ回す
    ///
    /// `wait_for_send` が真なら送信完了まで待つ（シャットダウン時の
    /// ベストエフォート用）。通常経路では送信を切り離し、
    /// 記録側の呼び出しをブロックしない。
    async fn flush_pending(
        config: &ClientBatcherConfig,
        entries: &Arc<RwLock<Vec<ClientEvent>>>,
        counters: &Arc<Counters>,
        client: &reqwest::Client,
        wait_for_send: bool,
    ) {
        let drained = {
            let mut entries = entries.write().await;
            if entries.is_empty() {
                return;
            }
            std::mem::take(&mut *entries)
        };

        let batch = ErrorBatch {
            batch_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            entries: drained,
        };

        counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
        counters
            .last_flush_size
            .store(batch.entries.len() as u64, Ordering::Relaxed);

        match &config.endpoint {
            Some(endpoint) => {
                let client = client.clone();
                let endpoint = endpoint.clone();
                if wait_for_send {
                    Self::deliver(&client, &endpoint, batch).await;
                } else {
                    tokio::spawn(async move {
                        Self::deliver(&client, &endpoint, batch).await;
                    });
                }
            }
            None => {
                debug!(
                    "No telemetry endpoint configured; batch {} ({} entries) logged locally",
                    batch.batch_id,
                    batch.entries.len()
                );
            }
        }
    }

    /// バッチを送信する
    ///
    /// 失敗してもリトライしない。バッチは成否にかかわらず破棄される。
    async fn deliver(client: &reqwest::Client, endpoint: &str, batch: ErrorBatch) {
        let batch_id = batch.batch_id.clone();
        let count = batch.entries.len();

        let result = client
            .post(endpoint)
            .json(&batch)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match result {
            Ok(_) => debug!("Flushed client telemetry batch {} ({} entries)", batch_id, count),
            Err(e) => warn!(
                "Client telemetry flush failed; batch {} ({} entries) discarded: {}",
                batch_id, count, e
            ),
        }
    }

    /// 定期フラッシュタスクを開始（既に起動済みなら何もしない）
    pub async fn start(&self) {
        let mut task = self.flush_task.write().await;
        if task.is_some() {
            return;
        }

        let config = self.config.clone();
        let entries = self.entries.clone();
        let counters = self.counters.clone();
        let client = self.client.clone();

        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(config.flush_interval_secs));
            loop {
                ticker.tick().await;
                Self::flush_pending(&config, &entries, &counters, &client, false).await;
            }
        });

        *task = Some(handle);
        info!(
            "Started client telemetry flush task (interval: {}s)",
            self.config.flush_interval_secs
        );
    }

    /// タスクを停止し、残りをベストエフォートでフラッシュする
    pub async fn shutdown(&self) {
        {
            let mut task = self.flush_task.write().await;
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }

        Self::flush_pending(&self.config, &self.entries, &self.counters, &self.client, true).await;
        info!("Client telemetry batcher shut down");
    }

    /// 未フラッシュのエントリを取得
    pub async fn pending_entries(&self) -> Vec<ClientEvent> {
        self.entries.read().await.clone()
    }

    /// 統計を取得
    pub async fn stats(&self) -> BatcherStats {
        BatcherStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            batches_flushed: self.counters.batches_flushed.load(Ordering::Relaxed),
            last_flush_size: self.counters.last_flush_size.load(Ordering::Relaxed),
            pending: self.entries.read().await.len(),
        }
    }
}
