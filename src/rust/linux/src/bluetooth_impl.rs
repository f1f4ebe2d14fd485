//! Linux固有のBluetooth実装（btleplug / BlueZ）

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter as BtScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use blelink_common::bluetooth::{AdvertisementData, Advertisement};
use blelink_common::{
    AdapterState, BleError, DeviceId, Radio, RadioEvent, RadioProvider, Result, ScanFilter,
};

/// 無線イベントチャネルの容量
const RADIO_EVENT_CAPACITY: usize = 1024;

/// btleplugのエラーを変換
fn platform_error(context: &str, e: btleplug::Error) -> BleError {
    BleError::Platform(format!("{}: {}", context, e))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// BlueZの最初のアダプタを提供する
pub struct BtleplugProvider;

#[async_trait]
impl RadioProvider for BtleplugProvider {
    async fn open(&self) -> Result<Arc<dyn Radio>> {
        Ok(Arc::new(BtleplugRadio::new().await?))
    }
}

/// ローカル切断の記録
///
/// ここに載っているデバイスの切断イベントは`RadioEvent::Disconnected`にしない。
#[derive(Default)]
struct LocalDisconnects {
    pending: Mutex<HashSet<DeviceId>>,
}

impl LocalDisconnects {
    fn mark(&self, id: &DeviceId) {
        lock(&self.pending).insert(id.clone());
    }

    fn unmark(&self, id: &DeviceId) {
        lock(&self.pending).remove(id);
    }

    /// 記録があれば消してtrue
    fn take(&self, id: &DeviceId) -> bool {
        lock(&self.pending).remove(id)
    }
}

/// btleplugによる無線
pub struct BtleplugRadio {
    adapter: Adapter,
    events: broadcast::Sender<RadioEvent>,
    scanning: Arc<AtomicBool>,
    local_disconnects: Arc<LocalDisconnects>,
    notification_tasks: Arc<Mutex<HashMap<DeviceId, JoinHandle<()>>>>,
    event_pump: JoinHandle<()>,
}

impl BtleplugRadio {
    /// 最初のアダプタを開く
    pub async fn new() -> Result<Self> {
        info!("Creating Bluetooth manager...");
        let manager = Manager::new().await.map_err(|e| {
            error!("Failed to create BT manager: {}", e);
            BleError::AdapterUnavailable(format!("Failed to create BT manager: {}", e))
        })?;

        let adapters = manager.adapters().await.map_err(|e| {
            error!("Failed to get adapters: {}", e);
            BleError::AdapterUnavailable(format!("Failed to get adapters: {}", e))
        })?;

        let adapter = adapters.into_iter().next().ok_or_else(|| {
            error!("No Bluetooth adapter found");
            BleError::AdapterUnavailable("No Bluetooth adapter found".to_string())
        })?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Bluetooth adapter initialized: {}", info),
            Err(_) => info!("Bluetooth adapter initialized (info unavailable)"),
        }

        let central_events = adapter
            .events()
            .await
            .map_err(|e| platform_error("Failed to subscribe to adapter events", e))?;

        let (events, _) = broadcast::channel(RADIO_EVENT_CAPACITY);
        let scanning = Arc::new(AtomicBool::new(false));
        let local_disconnects = Arc::new(LocalDisconnects::default());
        let notification_tasks = Arc::new(Mutex::new(HashMap::new()));

        let pump = EventPump {
            adapter: adapter.clone(),
            events: events.clone(),
            scanning: scanning.clone(),
            local_disconnects: local_disconnects.clone(),
            notification_tasks: notification_tasks.clone(),
        };
        let event_pump = tokio::spawn(pump.run(central_events));

        Ok(BtleplugRadio {
            adapter,
            events,
            scanning,
            local_disconnects,
            notification_tasks,
            event_pump,
        })
    }

    /// アドレスからPeripheralを検索
    async fn find_peripheral(&self, id: &DeviceId) -> Result<Peripheral> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| platform_error("Failed to get peripherals", e))?;

        peripherals
            .into_iter()
            .find(|p| DeviceId::new(p.address().to_string()) == *id)
            .ok_or_else(|| BleError::DeviceNotFound(id.to_string()))
    }

    fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| BleError::Platform(format!("Characteristic {} not found", uuid)))
    }

    /// 通知をRadioEventに流すタスクを起動
    async fn start_notification_pump(&self, id: &DeviceId, peripheral: &Peripheral) -> Result<()> {
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| platform_error("Failed to open notification stream", e))?;

        let events = self.events.clone();
        let device = id.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let _ = events.send(RadioEvent::Notification {
                    id: device.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
            debug!("Notification stream for {} ended", device);
        });

        if let Some(previous) = lock(&self.notification_tasks).insert(id.clone(), task) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_notification_pump(&self, id: &DeviceId) {
        if let Some(task) = lock(&self.notification_tasks).remove(id) {
            task.abort();
        }
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.event_pump.abort();
        for (_, task) in lock(&self.notification_tasks).drain() {
            task.abort();
        }
    }
}

#[async_trait]
impl Radio for BtleplugRadio {
    async fn power_state(&self) -> Result<AdapterState> {
        // BlueZのadapter_stateは問い合わせ失敗も電源オフとして返すため、先に応答を確認する
        if let Err(e) = self.adapter.adapter_info().await {
            warn!("Adapter did not respond: {}", e);
            return Ok(AdapterState::Unavailable);
        }

        let state = self
            .adapter
            .adapter_state()
            .await
            .map_err(|e| platform_error("Failed to read adapter state", e))?;
        Ok(adapter_state_from(state))
    }

    async fn known_devices(&self) -> Result<Vec<Advertisement>> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| platform_error("Failed to get peripherals", e))?;

        let mut known = Vec::with_capacity(peripherals.len());
        for peripheral in peripherals {
            match peripheral.properties().await {
                Ok(Some(properties)) => known.push(advertisement_from(properties)),
                Ok(None) => {}
                Err(e) => debug!("Skipping peripheral {}: {}", peripheral.address(), e),
            }
        }
        debug!("{} device(s) already known to BlueZ", known.len());
        Ok(known)
    }

    async fn start_scan(&self, filter: &ScanFilter) -> Result<()> {
        info!("Starting BlueZ scan...");
        self.adapter
            .start_scan(BtScanFilter {
                services: filter.services.clone(),
            })
            .await
            .map_err(|e| {
                error!("Failed to start scan: {:?}", e);
                platform_error("Failed to start scan", e)
            })?;
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanning.store(false, Ordering::SeqCst);
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| platform_error("Failed to stop scan", e))
    }

    async fn connect(&self, id: &DeviceId) -> Result<()> {
        let peripheral = self.find_peripheral(id).await?;

        info!("Connecting to device: {}", id);
        peripheral.connect().await.map_err(|e| match e {
            btleplug::Error::TimedOut(timeout) => BleError::ConnectTimeout {
                device: id.to_string(),
                timeout,
            },
            other => BleError::rejected(id, other),
        })?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| BleError::rejected(id, format!("service discovery failed: {}", e)))?;

        self.start_notification_pump(id, &peripheral).await
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        self.stop_notification_pump(id);

        let peripheral = match self.find_peripheral(id).await {
            Ok(peripheral) => peripheral,
            Err(BleError::DeviceNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if !peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }

        self.local_disconnects.mark(id);
        if let Err(e) = peripheral.disconnect().await {
            self.local_disconnects.unmark(id);
            return Err(platform_error("Disconnect failed", e));
        }
        Ok(())
    }

    async fn subscribe(&self, id: &DeviceId, characteristic: Uuid) -> Result<()> {
        let peripheral = self.find_peripheral(id).await?;
        let characteristic = Self::find_characteristic(&peripheral, characteristic)?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| platform_error("Failed to enable notifications", e))
    }

    async fn write(&self, id: &DeviceId, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let peripheral = self.find_peripheral(id).await?;
        let characteristic = Self::find_characteristic(&peripheral, characteristic)?;

        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| platform_error("Write failed", e))
    }

    fn events(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }
}

/// CentralEventをRadioEventに変換するタスク
struct EventPump {
    adapter: Adapter,
    events: broadcast::Sender<RadioEvent>,
    scanning: Arc<AtomicBool>,
    local_disconnects: Arc<LocalDisconnects>,
    notification_tasks: Arc<Mutex<HashMap<DeviceId, JoinHandle<()>>>>,
}

impl EventPump {
    async fn run<S>(self, mut central_events: S)
    where
        S: futures::Stream<Item = CentralEvent> + Unpin,
    {
        while let Some(event) = central_events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id)
                | CentralEvent::DeviceUpdated(id)
                | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                | CentralEvent::ServiceDataAdvertisement { id, .. }
                | CentralEvent::ServicesAdvertisement { id, .. } => {
                    if self.scanning.load(Ordering::SeqCst) {
                        self.forward_advertisement(&id).await;
                    }
                }
                CentralEvent::DeviceConnected(id) => debug!("BlueZ reports connected: {:?}", id),
                CentralEvent::DeviceDisconnected(id) => self.forward_disconnect(&id).await,
                CentralEvent::StateUpdate(state) => {
                    let state = adapter_state_from(state);
                    info!("BlueZ reports adapter {:?}", state);
                    if state != AdapterState::On {
                        self.scanning.store(false, Ordering::SeqCst);
                    }
                    let _ = self.events.send(RadioEvent::PowerChanged(state));
                }
                _ => {}
            }
        }
        warn!("Adapter event stream ended");
    }

    async fn properties(&self, id: &PeripheralId) -> Option<PeripheralProperties> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        peripheral.properties().await.ok().flatten()
    }

    async fn forward_advertisement(&self, id: &PeripheralId) {
        if let Some(properties) = self.properties(id).await {
            let _ = self
                .events
                .send(RadioEvent::Advertisement(advertisement_from(properties)));
        }
    }

    async fn forward_disconnect(&self, id: &PeripheralId) {
        let device = match self.adapter.peripheral(id).await {
            Ok(peripheral) => DeviceId::new(peripheral.address().to_string()),
            Err(e) => {
                debug!("Disconnected peripheral {:?} is unknown: {}", id, e);
                return;
            }
        };

        if let Some(task) = lock(&self.notification_tasks).remove(&device) {
            task.abort();
        }

        if self.local_disconnects.take(&device) {
            debug!("Local disconnect of {} completed", device);
        } else {
            info!("Device {} disconnected remotely", device);
            let _ = self.events.send(RadioEvent::Disconnected(device));
        }
    }
}

/// btleplugのCentralStateを変換
fn adapter_state_from(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::On,
        CentralState::PoweredOff => AdapterState::Off,
        CentralState::Unknown => AdapterState::Unavailable,
    }
}

/// PeripheralPropertiesからアドバタイズを作成
fn advertisement_from(properties: PeripheralProperties) -> Advertisement {
    Advertisement {
        id: DeviceId::new(properties.address.to_string()),
        local_name: properties.local_name,
        rssi: properties.rssi,
        data: AdvertisementData {
            manufacturer_data: properties.manufacturer_data,
            service_data: properties.service_data,
            services: properties.services,
            tx_power_level: properties.tx_power_level,
        },
    }
}
