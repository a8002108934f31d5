//! アラートシステム
//!
//! アラート型、通知チャネル、クールダウン付きディスパッチャを提供します。

pub mod alert;
pub mod channels;
pub mod dispatcher;

pub use alert::{Alert, AlertSeverity, AlertType};
pub use channels::{
    AlertChannel, ConsoleChannel, ConsoleChannelConfig, EmailChannel, EmailChannelConfig,
    WebhookChannel, WebhookChannelConfig,
};
pub use dispatcher::AlertDispatcher;
