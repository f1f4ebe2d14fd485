//! Bluetooth抽象化トレイト
//!
//! プラットフォームの無線機能は`RadioProvider`としてマネージャーに注入する。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;

/// デバイス識別子（Bluetoothアドレス）
///
/// 大文字に正規化して保持する。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(address: impl AsRef<str>) -> Self {
        DeviceId(address.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(address: &str) -> Self {
        DeviceId::new(address)
    }
}

impl From<String> for DeviceId {
    fn from(address: String) -> Self {
        DeviceId::new(address)
    }
}

/// アダプタ状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterState {
    Off,
    On,
    Unavailable,
}

/// アドバタイズのペイロード
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvertisementData {
    /// メーカー固有データ（会社ID -> データ）
    pub manufacturer_data: HashMap<u16, Vec<u8>>,

    /// サービスデータ
    pub service_data: HashMap<Uuid, Vec<u8>>,

    /// アドバタイズされたサービスUUID
    pub services: Vec<Uuid>,

    /// 送信電力
    pub tx_power_level: Option<i16>,
}

/// 無線から届いた1件のアドバタイズ
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub id: DeviceId,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub data: AdvertisementData,
}

/// 発見済みデバイス
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Bluetoothアドレス
    pub id: DeviceId,

    /// デバイス名
    pub name: Option<String>,

    /// 信号強度（RSSI）
    pub rssi: Option<i16>,

    /// 最新のアドバタイズペイロード
    pub advertisement: AdvertisementData,

    /// 初回発見時刻
    pub first_seen: DateTime<Utc>,

    /// 最終受信時刻
    pub last_seen: DateTime<Utc>,

    /// このスキャン中に受信したアドバタイズ数
    pub advertisement_count: u64,
}

impl DiscoveredDevice {
    pub(crate) fn from_advertisement(advertisement: Advertisement) -> Self {
        let now = Utc::now();
        DiscoveredDevice {
            id: advertisement.id,
            name: advertisement.local_name,
            rssi: advertisement.rssi,
            advertisement: advertisement.data,
            first_seen: now,
            last_seen: now,
            advertisement_count: 1,
        }
    }

    /// 同じデバイスからの新しいアドバタイズで上書き
    ///
    /// 名前が含まれないアドバタイズ（スキャンレスポンスなし）では既存の名前を残す。
    pub(crate) fn supersede(&mut self, advertisement: Advertisement) {
        if advertisement.local_name.is_some() {
            self.name = advertisement.local_name;
        }
        if advertisement.rssi.is_some() {
            self.rssi = advertisement.rssi;
        }
        self.advertisement = advertisement.data;
        self.last_seen = Utc::now();
        self.advertisement_count += 1;
    }
}

/// 無線サブシステムからのイベント
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// アドバタイズ受信
    Advertisement(Advertisement),

    /// リンク切断（リモート起因を含む）
    Disconnected(DeviceId),

    /// 電源状態の変化
    PowerChanged(AdapterState),

    /// キャラクタリスティック通知
    Notification {
        id: DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// スキャンフィルター
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// 完全一致するデバイス名（空なら全て）
    #[serde(default)]
    pub names: Vec<String>,

    /// デバイス名のプレフィックス
    #[serde(default)]
    pub name_prefix: Option<String>,

    /// アドバタイズされたサービスUUID（空なら全て）
    #[serde(default)]
    pub services: Vec<Uuid>,

    /// 最低信号強度
    #[serde(default)]
    pub min_rssi: Option<i16>,
}

impl ScanFilter {
    /// 全デバイスを通すフィルター
    pub fn any() -> Self {
        Self::default()
    }

    /// デバイス名で絞り込むフィルター
    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScanFilter {
            names: names.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// アドバタイズがフィルターに一致するか
    ///
    /// 名前条件は名前が無いアドバタイズを通さない。
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        if !self.names.is_empty() || self.name_prefix.is_some() {
            let name = match &advertisement.local_name {
                Some(name) => name,
                None => return false,
            };
            let name_ok = self.names.iter().any(|n| n == name)
                || self.name_prefix.as_deref().map_or(false, |p| name.starts_with(p));
            if !name_ok {
                return false;
            }
        }

        if !self.services.is_empty()
            && !self.services.iter().any(|s| advertisement.data.services.contains(s))
        {
            return false;
        }

        if let Some(min_rssi) = self.min_rssi {
            match advertisement.rssi {
                Some(rssi) if rssi >= min_rssi => {}
                _ => return false,
            }
        }

        true
    }
}

/// プラットフォームの無線
///
/// イベントは`events()`で購読する。同一デバイスのイベントは無線が報告した順に届く。
#[async_trait]
pub trait Radio: Send + Sync {
    /// 電源状態を取得
    async fn power_state(&self) -> Result<AdapterState>;

    /// スキャン開始
    async fn start_scan(&self, filter: &ScanFilter) -> Result<()>;

    /// ペアリング済みなど、スキャンせずに分かっているデバイス
    async fn known_devices(&self) -> Result<Vec<Advertisement>>;

    /// スキャン停止（停止済みでも成功）
    async fn stop_scan(&self) -> Result<()>;

    /// リンクを確立する（完了まで待機）
    async fn connect(&self, id: &DeviceId) -> Result<()>;

    /// リンクを切断する（未接続でも成功）
    async fn disconnect(&self, id: &DeviceId) -> Result<()>;

    /// キャラクタリスティック通知を有効化
    async fn subscribe(&self, id: &DeviceId, characteristic: Uuid) -> Result<()>;

    /// キャラクタリスティックへ書き込み
    async fn write(&self, id: &DeviceId, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// イベントを購読
    fn events(&self) -> broadcast::Receiver<RadioEvent>;
}

/// 無線を提供するプラットフォーム機能
///
/// ハードウェアが無い場合は`BleError::AdapterUnavailable`を返す。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RadioProvider: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn Radio>>;
}

/// Arc<T>にRadioProviderトレイトを実装
#[async_trait]
impl<T: RadioProvider + ?Sized> RadioProvider for Arc<T> {
    async fn open(&self) -> Result<Arc<dyn Radio>> {
        (**self).open().await
    }
}
