//! 共通エラー型定義

use std::time::Duration;
use thiserror::Error;

/// blelink共通エラー型
#[derive(Debug, Error)]
pub enum BleError {
    /// 無線アダプタを取得できない（ハードウェアなし等）
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// アダプタの電源がオフ
    #[error("Bluetooth adapter is powered off")]
    AdapterOff,

    /// スキャンが既に実行中
    #[error("Scan already active")]
    ScanAlreadyActive,

    /// 接続タイムアウト
    #[error("Connection to {device} timed out after {timeout:?}")]
    ConnectTimeout { device: String, timeout: Duration },

    /// 接続拒否
    #[error("Connection to {device} rejected: {reason}")]
    ConnectRejected { device: String, reason: String },

    /// 切断要求により接続試行が中断された
    #[error("Connection to {0} cancelled")]
    ConnectCancelled(String),

    /// デバイスが見つからない
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// デバイスが接続されていない
    #[error("Device not connected: {0}")]
    DeviceNotConnected(String),

    /// 無効なパラメータ
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// 設定エラー
    #[error("Configuration error: {0}")]
    Config(String),

    /// プラットフォーム固有エラー
    #[error("Platform specific error: {0}")]
    Platform(String),

    /// IO エラー
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON パースエラー
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result型のエイリアス
pub type Result<T> = std::result::Result<T, BleError>;

impl BleError {
    /// 接続拒否エラーを作成
    pub fn rejected(device: impl ToString, reason: impl ToString) -> Self {
        BleError::ConnectRejected {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }

    /// 呼び出し側がリトライ可能なエラーか
    ///
    /// `AdapterUnavailable`は致命的。スキャン重複と接続失敗はリトライ可能。
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BleError::ScanAlreadyActive
                | BleError::ConnectTimeout { .. }
                | BleError::ConnectRejected { .. }
        )
    }

    /// エラーコードを返す（ログ・イベント用）
    pub fn error_code(&self) -> &str {
        match self {
            BleError::AdapterUnavailable(_) => "ADAPTER_UNAVAILABLE",
            BleError::AdapterOff => "ADAPTER_OFF",
            BleError::ScanAlreadyActive => "SCAN_ALREADY_ACTIVE",
            BleError::ConnectTimeout { .. } => "CONNECT_TIMEOUT",
            BleError::ConnectRejected { .. } => "CONNECT_REJECTED",
            BleError::ConnectCancelled(_) => "CONNECT_CANCELLED",
            BleError::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            BleError::DeviceNotConnected(_) => "DEVICE_NOT_CONNECTED",
            BleError::InvalidParameter(_) => "INVALID_PARAMETER",
            BleError::Config(_) => "CONFIG_ERROR",
            BleError::Platform(_) => "PLATFORM_ERROR",
            BleError::Io(_) => "IO_ERROR",
            BleError::Json(_) => "JSON_ERROR",
        }
    }
}
