//! 発見・接続マネージャー
//!
//! アダプタ・スキャン・接続管理を1つの窓口にまとめる。

use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::adapter::AdapterHandle;
use super::connection::{ConnectionManager, ConnectionState};
use super::events::{DiscoveryEvent, EventBus};
use super::led::LedMatrixWriter;
use super::scan::{ScanSession, ScanStream};
use super::traits::{AdapterState, DeviceId, DiscoveredDevice, RadioProvider, ScanFilter};
use crate::config::Settings;
use crate::error::{BleError, Result};
use crate::protocol::LedMatrix;

/// マネージャーの統計情報
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryStatistics {
    /// スキャンで追跡中のデバイス数
    pub tracked_devices: usize,

    /// 接続中のデバイス数
    pub connected_devices: usize,

    /// 接続試行回数
    pub connect_attempts: u64,

    /// 接続失敗回数
    pub connect_failures: u64,

    /// 開始したスキャン数
    pub scans_started: u64,

    /// 稼働時間（秒）
    pub uptime_seconds: u64,
}

/// 発見・接続マネージャー
pub struct DiscoveryManager {
    adapter: AdapterHandle,
    scan: ScanSession,
    connections: ConnectionManager,
    led: LedMatrixWriter,
    bus: EventBus,
    settings: Settings,
    started_at: Instant,
}

impl DiscoveryManager {
    /// 新しいマネージャーを作成
    ///
    /// 無線が取得できなくても作成できる。その場合、操作は`AdapterUnavailable`で失敗する。
    pub async fn new(provider: &dyn RadioProvider, settings: Settings) -> Self {
        let adapter = AdapterHandle::new(provider).await;
        let bus = EventBus::new();

        let scan = ScanSession::new(adapter.clone(), bus.clone(), settings.scan.options());
        let connections = ConnectionManager::new(
            adapter.clone(),
            bus.clone(),
            settings.connection.notify_characteristics.clone(),
        );

        DiscoveryManager {
            adapter,
            scan,
            connections,
            led: LedMatrixWriter::new(bus.clone()),
            bus,
            settings,
            started_at: Instant::now(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// ハードウェアが利用可能か
    pub async fn is_available(&self) -> bool {
        self.adapter.is_available().await
    }

    /// アダプタの電源がオンか
    pub async fn is_enabled(&self) -> bool {
        self.adapter.is_enabled().await
    }

    pub async fn adapter_state(&self) -> AdapterState {
        self.adapter.state().await
    }

    /// デバイス発見を開始
    ///
    /// 省略した引数は設定値を使う。
    pub async fn start_discovery(
        &self,
        filter: Option<ScanFilter>,
        timeout: Option<Duration>,
    ) -> Result<ScanStream> {
        let filter = filter.unwrap_or_else(|| self.settings.scan.filter());
        let timeout = timeout.or_else(|| self.settings.scan.timeout());
        self.scan.start(filter, timeout).await
    }

    /// 停止するまで続くデバイス発見を開始
    pub async fn start_continuous_discovery(&self, filter: Option<ScanFilter>) -> Result<ScanStream> {
        let filter = filter.unwrap_or_else(|| self.settings.scan.filter());
        self.scan.start(filter, None).await
    }

    /// デバイス発見を停止
    pub async fn stop_discovery(&self) -> Result<()> {
        self.scan.stop().await
    }

    pub async fn is_discovering(&self) -> bool {
        self.scan.is_active().await
    }

    /// 発見済みデバイスの一覧
    pub async fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.scan.devices().await
    }

    /// デバイスに接続（タイムアウトは設定値）
    pub async fn connect(&self, id: &DeviceId) -> Result<()> {
        self.connections
            .connect(id, self.settings.connection.connect_timeout())
            .await
    }

    /// リトライ付きで接続
    ///
    /// リトライ可能なエラーのみ再試行し、待ち時間は試行ごとに倍にする。
    pub async fn connect_with_retry(&self, id: &DeviceId) -> Result<()> {
        let max_attempts = self.settings.connection.retry_attempts.max(1);
        let mut delay = self.settings.connection.retry_delay();

        let mut attempt = 1;
        loop {
            info!("Connection attempt {}/{} for device: {}", attempt, max_attempts, id);

            match self.connect(id).await {
                Ok(()) => {
                    info!("Successfully connected to {} on attempt {}", id, attempt);
                    return Ok(());
                }
                Err(e) if e.is_recoverable() && attempt < max_attempts => {
                    warn!("Connection attempt {} failed for {}: {}", attempt, id, e);
                    info!("Waiting {:?} before retry attempt {}...", delay, attempt + 1);
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => {
                    warn!("Giving up on {} after {} attempt(s): {}", id, attempt, e);
                    return Err(e);
                }
            }
        }
    }

    /// デバイスを切断
    pub async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        self.connections.disconnect(id).await
    }

    /// 全デバイスを切断
    pub async fn disconnect_all(&self) -> Result<()> {
        self.connections.disconnect_all().await
    }

    pub async fn connection_state(&self, id: &DeviceId) -> ConnectionState {
        self.connections.state(id).await
    }

    pub async fn connected_devices(&self) -> Vec<DeviceId> {
        self.connections.connected_devices().await
    }

    /// LEDマトリクスを表示
    ///
    /// 前の書き込みが終わっていなければ最新のマトリクスだけが後で送られる。
    /// 書き込みが完了するたびに`DiscoveryEvent::LedMatrixWritten`を送信する。
    pub async fn display_led_matrix(
        &self,
        id: &DeviceId,
        matrix: &LedMatrix,
        display_interval_secs: f64,
    ) -> Result<()> {
        if display_interval_secs < 0.0 || display_interval_secs.is_nan() {
            return Err(BleError::InvalidParameter(format!(
                "display interval must be non-negative, got {}",
                display_interval_secs
            )));
        }

        let data = matrix.gatt_bytes(display_interval_secs);
        self.led.write(&self.connections, id, data).await
    }

    /// イベントを購読
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.bus.subscribe()
    }

    /// 統計情報を取得
    pub async fn statistics(&self) -> DiscoveryStatistics {
        DiscoveryStatistics {
            tracked_devices: self.scan.devices().await.len(),
            connected_devices: self.connections.connected_devices().await.len(),
            connect_attempts: self.connections.connect_attempts(),
            connect_failures: self.connections.connect_failures(),
            scans_started: self.scan.scans_started(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// スキャンを止め、全接続を切断する
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down discovery manager");
        self.stop_discovery().await?;
        self.disconnect_all().await
    }
}
