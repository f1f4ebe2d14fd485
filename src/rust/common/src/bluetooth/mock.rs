//! インメモリの無線実装（テスト・デモ用）

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::traits::{
    AdapterState, Advertisement, AdvertisementData, DeviceId, Radio, RadioEvent, RadioProvider,
    ScanFilter,
};
use crate::error::{BleError, Result};

/// 書き込み記録
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    pub id: DeviceId,
    pub characteristic: Uuid,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    power: AdapterState,
    scanning: bool,
    scan_starts: u32,
    scan_stops: u32,
    connected: HashSet<DeviceId>,
    connect_calls: u32,
    disconnect_calls: u32,
    connect_delay: Duration,
    power_query_delay: Duration,
    write_delay: Duration,
    known: Vec<Advertisement>,
    rejected: HashMap<DeviceId, String>,
    fail_subscriptions: bool,
    subscriptions: Vec<(DeviceId, Uuid)>,
    writes: Vec<RecordedWrite>,
}

/// テスト用の無線
///
/// `Disconnected`イベントは`drop_link`（リモート切断）でのみ発生し、
/// `disconnect`呼び出しでは発生しない。
#[derive(Clone)]
pub struct MockRadio {
    state: Arc<Mutex<MockState>>,
    events: broadcast::Sender<RadioEvent>,
}

impl MockRadio {
    /// 電源オンの無線を作成
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        MockRadio {
            state: Arc::new(Mutex::new(MockState {
                power: AdapterState::On,
                scanning: false,
                scan_starts: 0,
                scan_stops: 0,
                connected: HashSet::new(),
                connect_calls: 0,
                disconnect_calls: 0,
                connect_delay: Duration::ZERO,
                power_query_delay: Duration::ZERO,
                write_delay: Duration::ZERO,
                known: Vec::new(),
                rejected: HashMap::new(),
                fail_subscriptions: false,
                subscriptions: Vec::new(),
                writes: Vec::new(),
            })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // テスト中のpanicでポイズンしても状態は読めるようにする
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 電源状態を変更（オフで全リンクとスキャンが落ちる）
    pub fn set_power(&self, power: AdapterState) {
        {
            let mut state = self.lock();
            state.power = power;
            if power != AdapterState::On {
                state.scanning = false;
                state.connected.clear();
            }
        }
        let _ = self.events.send(RadioEvent::PowerChanged(power));
    }

    /// 接続完了までの遅延
    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// 電源状態の問い合わせにかかる時間
    pub fn set_power_query_delay(&self, delay: Duration) {
        self.lock().power_query_delay = delay;
    }

    /// 書き込み完了までの遅延
    pub fn set_write_delay(&self, delay: Duration) {
        self.lock().write_delay = delay;
    }

    /// ペアリング済みなど、スキャン前から既知のデバイスを登録
    pub fn add_known_device(&self, advertisement: Advertisement) {
        self.lock().known.push(advertisement);
    }

    /// 指定デバイスへの接続を拒否させる
    pub fn reject(&self, id: impl Into<DeviceId>, reason: &str) {
        self.lock().rejected.insert(id.into(), reason.to_string());
    }

    /// 拒否設定を解除
    pub fn accept(&self, id: impl Into<DeviceId>) {
        self.lock().rejected.remove(&id.into());
    }

    /// 通知の有効化を失敗させる
    pub fn set_fail_subscriptions(&self, fail: bool) {
        self.lock().fail_subscriptions = fail;
    }

    /// アドバタイズを受信させる（スキャン中のみ届く）
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        if !self.lock().scanning {
            return false;
        }
        self.events.send(RadioEvent::Advertisement(advertisement)).is_ok()
    }

    /// 名前とRSSIだけのアドバタイズを受信させる
    pub fn advertise_named(&self, address: &str, name: &str, rssi: i16) -> bool {
        self.advertise(Advertisement {
            id: DeviceId::new(address),
            local_name: Some(name.to_string()),
            rssi: Some(rssi),
            data: AdvertisementData::default(),
        })
    }

    /// リモート側からリンクを切る
    pub fn drop_link(&self, id: impl Into<DeviceId>) {
        let id = id.into();
        let was_connected = self.lock().connected.remove(&id);
        if was_connected {
            let _ = self.events.send(RadioEvent::Disconnected(id));
        }
    }

    /// キャラクタリスティック通知を送る
    pub fn notify(&self, id: impl Into<DeviceId>, characteristic: Uuid, value: Vec<u8>) {
        let _ = self.events.send(RadioEvent::Notification {
            id: id.into(),
            characteristic,
            value,
        });
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    pub fn scan_start_count(&self) -> u32 {
        self.lock().scan_starts
    }

    pub fn scan_stop_count(&self) -> u32 {
        self.lock().scan_stops
    }

    pub fn is_connected(&self, id: &DeviceId) -> bool {
        self.lock().connected.contains(id)
    }

    pub fn connected_count(&self) -> usize {
        self.lock().connected.len()
    }

    pub fn connect_calls(&self) -> u32 {
        self.lock().connect_calls
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.lock().disconnect_calls
    }

    pub fn subscriptions(&self) -> Vec<(DeviceId, Uuid)> {
        self.lock().subscriptions.clone()
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.lock().writes.clone()
    }
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Radio for MockRadio {
    async fn power_state(&self) -> Result<AdapterState> {
        let delay = self.lock().power_query_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.lock().power)
    }

    async fn known_devices(&self) -> Result<Vec<Advertisement>> {
        Ok(self.lock().known.clone())
    }

    async fn start_scan(&self, _filter: &ScanFilter) -> Result<()> {
        let mut state = self.lock();
        if state.power != AdapterState::On {
            return Err(BleError::AdapterOff);
        }
        state.scanning = true;
        state.scan_starts += 1;
        debug!("Mock scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let mut state = self.lock();
        state.scanning = false;
        state.scan_stops += 1;
        debug!("Mock scan stopped");
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            state.connect_calls += 1;
            if state.power != AdapterState::On {
                return Err(BleError::AdapterOff);
            }
            state.connect_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(reason) = state.rejected.get(id) {
            return Err(BleError::rejected(id, reason));
        }
        state.connected.insert(id.clone());
        Ok(())
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        let mut state = self.lock();
        state.disconnect_calls += 1;
        state.connected.remove(id);
        Ok(())
    }

    async fn subscribe(&self, id: &DeviceId, characteristic: Uuid) -> Result<()> {
        let mut state = self.lock();
        if !state.connected.contains(id) {
            return Err(BleError::DeviceNotConnected(id.to_string()));
        }
        if state.fail_subscriptions {
            return Err(BleError::Platform(format!(
                "descriptor write failed for {}",
                characteristic
            )));
        }
        state.subscriptions.push((id.clone(), characteristic));
        Ok(())
    }

    async fn write(&self, id: &DeviceId, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let delay = self.lock().write_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if !state.connected.contains(id) {
            return Err(BleError::DeviceNotConnected(id.to_string()));
        }
        state.writes.push(RecordedWrite {
            id: id.clone(),
            characteristic,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }
}

/// テスト用の無線プロバイダ
#[derive(Clone)]
pub struct MockProvider {
    radio: Option<MockRadio>,
}

impl MockProvider {
    /// 無線ありのプロバイダ
    pub fn present(radio: MockRadio) -> Self {
        MockProvider { radio: Some(radio) }
    }

    /// ハードウェアなしのプロバイダ
    pub fn absent() -> Self {
        MockProvider { radio: None }
    }
}

#[async_trait]
impl RadioProvider for MockProvider {
    async fn open(&self) -> Result<Arc<dyn Radio>> {
        match &self.radio {
            Some(radio) => Ok(Arc::new(radio.clone())),
            None => Err(BleError::AdapterUnavailable(
                "no Bluetooth hardware present".to_string(),
            )),
        }
    }
}
