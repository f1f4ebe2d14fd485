//! 共通設定管理モジュール

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use uuid::Uuid;

use crate::bluetooth::{ScanFilter, ScanOptions};
use crate::error::{BleError, Result};
use crate::protocol::{uuid as gatt, NUIMO_DEVICE_NAME};

/// スキャン設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanConfig {
    /// 対象デバイス名（完全一致、空なら全て）
    pub device_names: Vec<String>,

    /// デバイス名のプレフィックス
    pub name_prefix: Option<String>,

    /// アドバタイズされたサービスUUID
    pub service_uuids: Vec<Uuid>,

    /// 最低信号強度
    pub min_rssi: Option<i16>,

    /// スキャンタイムアウト（秒、0で継続スキャン）
    pub timeout_secs: u64,

    /// 消失判定までの時間（ミリ秒、0で無効）
    pub lost_device_timeout_ms: u64,

    /// 消失チェック間隔（ミリ秒）
    pub lost_check_interval_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            device_names: vec![NUIMO_DEVICE_NAME.to_string()],
            name_prefix: None,
            service_uuids: Vec::new(),
            min_rssi: None,
            timeout_secs: 10,
            lost_device_timeout_ms: 7000,
            lost_check_interval_ms: 1000,
        }
    }
}

impl ScanConfig {
    /// スキャンフィルターを作成
    pub fn filter(&self) -> ScanFilter {
        ScanFilter {
            names: self.device_names.clone(),
            name_prefix: self.name_prefix.clone(),
            services: self.service_uuids.clone(),
            min_rssi: self.min_rssi,
        }
    }

    /// スキャンタイムアウト（Noneで継続）
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn options(&self) -> ScanOptions {
        ScanOptions {
            lost_device_timeout: match self.lost_device_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            lost_check_interval: Duration::from_millis(self.lost_check_interval_ms),
        }
    }
}

/// 接続設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// 接続タイムアウト（ミリ秒）
    pub connect_timeout_ms: u64,

    /// 接続試行回数
    pub retry_attempts: u32,

    /// 最初のリトライまでの待ち時間（ミリ秒、以降倍々）
    pub retry_delay_ms: u64,

    /// 接続時に通知を有効化するキャラクタリスティック
    pub notify_characteristics: Vec<Uuid>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout_ms: 10_000,
            retry_attempts: 3,
            retry_delay_ms: 2000,
            notify_characteristics: gatt::NOTIFICATION_CHARS.to_vec(),
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// ロギング設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// ログレベル（EnvFilterの書式）
    pub level: String,

    /// ログ出力先（stdout / stderr）
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            output: "stdout".to_string(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// スキャン設定
    pub scan: ScanConfig,

    /// 接続設定
    pub connection: ConnectionConfig,

    /// ロギング設定
    pub logging: LoggingConfig,
}

impl Settings {
    /// 設定を読み込む
    ///
    /// 読み込み優先順位：
    /// 1. 環境変数
    /// 2. 設定ファイル（CONFIG_FILEで指定された場合）
    /// 3. デフォルト値
    pub fn new() -> Result<Self> {
        let mut settings = match env::var("CONFIG_FILE") {
            Ok(config_path) => Self::from_file(&config_path)?,
            Err(_) => Self::default(),
        };

        settings.override_from_env();
        settings.validate()?;

        Ok(settings)
    }

    /// 設定ファイルから読み込む
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BleError::Config(format!("Failed to read config file {}: {}", path, e)))?;
        Self::parse(path, &content)
    }

    /// 拡張子に応じて設定をパース
    fn parse(path: &str, content: &str) -> Result<Self> {
        if path.ends_with(".json") {
            serde_json::from_str(content)
                .map_err(|e| BleError::Config(format!("Failed to parse JSON config: {}", e)))
        } else if path.ends_with(".toml") {
            toml::from_str(content)
                .map_err(|e| BleError::Config(format!("Failed to parse TOML config: {}", e)))
        } else if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(content)
                .map_err(|e| BleError::Config(format!("Failed to parse YAML config: {}", e)))
        } else {
            Err(BleError::Config(format!("Unsupported config file format: {}", path)))
        }
    }

    /// 環境変数で設定を上書き
    pub fn override_from_env(&mut self) {
        self.override_with(|key| env::var(key).ok());
    }

    /// 任意の参照元で設定を上書き
    fn override_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // スキャン設定
        if let Some(names) = lookup("DEVICE_NAMES") {
            self.scan.device_names = names
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(timeout) = lookup("SCAN_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.scan.timeout_secs = timeout;
        }

        // 接続設定
        if let Some(timeout) = lookup("CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.connection.connect_timeout_ms = timeout;
        }
        if let Some(attempts) = lookup("RETRY_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.connection.retry_attempts = attempts;
        }

        // ロギング設定
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// 設定を検証
    pub fn validate(&self) -> Result<()> {
        if self.scan.device_names.iter().any(|n| n.trim().is_empty()) {
            return Err(BleError::Config("Device names cannot be empty".to_string()));
        }

        if self.scan.lost_device_timeout_ms > 0 && self.scan.lost_check_interval_ms == 0 {
            return Err(BleError::Config(
                "Lost check interval must be positive when lost detection is enabled".to_string(),
            ));
        }

        if self.connection.connect_timeout_ms == 0 {
            return Err(BleError::Config("Connect timeout must be positive".to_string()));
        }

        if self.connection.retry_attempts == 0 {
            return Err(BleError::Config("Retry attempts must be at least 1".to_string()));
        }

        if !matches!(self.logging.output.as_str(), "stdout" | "stderr") {
            return Err(BleError::Config(format!(
                "Unsupported log output: {}",
                self.logging.output
            )));
        }

        Ok(())
    }

    /// 設定をファイルに保存
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let content = if path.ends_with(".json") {
            serde_json::to_string_pretty(self)
                .map_err(|e| BleError::Config(format!("Failed to serialize to JSON: {}", e)))?
        } else if path.ends_with(".toml") {
            toml::to_string_pretty(self)
                .map_err(|e| BleError::Config(format!("Failed to serialize to TOML: {}", e)))?
        } else if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::to_string(self)
                .map_err(|e| BleError::Config(format!("Failed to serialize to YAML: {}", e)))?
        } else {
            return Err(BleError::Config(format!("Unsupported config file format: {}", path)));
        };

        std::fs::write(path, content)
            .map_err(|e| BleError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.scan.device_names, vec!["Nuimo".to_string()]);
        assert_eq!(settings.scan.timeout(), Some(Duration::from_secs(10)));
        assert_eq!(
            settings.scan.options().lost_device_timeout,
            Some(Duration::from_secs(7))
        );
        assert_eq!(settings.connection.connect_timeout(), Duration::from_secs(10));
        assert_eq!(settings.connection.notify_characteristics.len(), 4);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_means_continuous() {
        let mut settings = Settings::default();
        settings.scan.timeout_secs = 0;
        settings.scan.lost_device_timeout_ms = 0;
        assert_eq!(settings.scan.timeout(), None);
        assert_eq!(settings.scan.options().lost_device_timeout, None);
    }

    #[test]
    fn test_partial_toml() {
        let settings = Settings::parse(
            "blelink.toml",
            r#"
                [scan]
                device_names = ["Nuimo", "Nuimo Click"]
                min_rssi = -80

                [connection]
                retry_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(settings.scan.device_names.len(), 2);
        assert_eq!(settings.scan.min_rssi, Some(-80));
        assert_eq!(settings.scan.timeout_secs, 10);
        assert_eq!(settings.connection.retry_attempts, 5);
        assert_eq!(settings.connection.retry_delay_ms, 2000);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn test_json_and_yaml() {
        let json = Settings::parse("config.json", r#"{"scan": {"timeout_secs": 3}}"#).unwrap();
        assert_eq!(json.scan.timeout_secs, 3);

        let yaml = Settings::parse("config.yml", "logging:\n  level: debug\n").unwrap();
        assert_eq!(yaml.logging.level, "debug");

        assert!(matches!(
            Settings::parse("config.ini", ""),
            Err(BleError::Config(_))
        ));
    }

    #[test]
    fn test_override() {
        let vars: HashMap<&str, &str> = [
            ("DEVICE_NAMES", "Nuimo, Other ,"),
            ("SCAN_TIMEOUT", "0"),
            ("CONNECT_TIMEOUT_MS", "2500"),
            ("RETRY_ATTEMPTS", "not-a-number"),
            ("LOG_LEVEL", "blelink_common=debug"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.override_with(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(settings.scan.device_names, vec!["Nuimo".to_string(), "Other".to_string()]);
        assert_eq!(settings.scan.timeout(), None);
        assert_eq!(settings.connection.connect_timeout_ms, 2500);
        // 解釈できない値は無視
        assert_eq!(settings.connection.retry_attempts, 3);
        assert_eq!(settings.logging.level, "blelink_common=debug");
    }

    #[test]
    fn test_validate() {
        let mut settings = Settings::default();
        settings.connection.retry_attempts = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.logging.output = "syslog".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.scan.lost_check_interval_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("blelink-{}.toml", Uuid::new_v4()));
        let path = path.to_string_lossy().to_string();

        let mut settings = Settings::default();
        settings.scan.name_prefix = Some("Nui".to_string());
        settings.save_to_file(&path).unwrap();

        let loaded = Settings::from_file(&path).unwrap();
        assert_eq!(loaded.scan.name_prefix.as_deref(), Some("Nui"));
        assert_eq!(
            loaded.connection.notify_characteristics,
            settings.connection.notify_characteristics
        );

        let _ = std::fs::remove_file(&path);
    }
}
