//! スキャンセッション
//!
//! 同時に実行できるスキャンは1つだけ。アドバタイズはデバイス識別子で重複排除し、
//! 同じデバイスの再受信は既存エントリを置き換える。

use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::adapter::AdapterHandle;
use super::events::{DiscoveryEvent, EventBus};
use super::traits::{AdapterState, Advertisement, DeviceId, DiscoveredDevice, Radio, RadioEvent, ScanFilter};
use crate::error::{BleError, Result};

/// スキャンで得られるイベント
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// このスキャンで初めて受信
    Found(DiscoveredDevice),

    /// 再受信（エントリを置き換えた）
    Updated(DiscoveredDevice),

    /// アドバタイズが途絶えた
    Lost(DeviceId),
}

impl ScanEvent {
    pub fn id(&self) -> &DeviceId {
        match self {
            ScanEvent::Found(device) | ScanEvent::Updated(device) => &device.id,
            ScanEvent::Lost(id) => id,
        }
    }
}

/// スキャンの動作設定
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// これ以上アドバタイズが無ければ消失とみなす（Noneで無効）
    pub lost_device_timeout: Option<Duration>,

    /// 消失チェックの間隔
    pub lost_check_interval: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            lost_device_timeout: Some(Duration::from_secs(7)),
            lost_check_interval: Duration::from_secs(1),
        }
    }
}

/// スキャン結果のストリーム
///
/// スキャン終了（停止・タイムアウト・電源オフ）で終端する。
#[derive(Debug)]
pub struct ScanStream {
    rx: mpsc::UnboundedReceiver<ScanEvent>,
}

impl ScanStream {
    /// 次のイベントを待つ
    pub async fn next_event(&mut self) -> Option<ScanEvent> {
        self.rx.recv().await
    }
}

impl Stream for ScanStream {
    type Item = ScanEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// 重複排除マップのエントリ
#[derive(Debug, Clone)]
struct TrackedDevice {
    device: DiscoveredDevice,
    seen_at: Instant,
}

type DeviceMap = Arc<RwLock<HashMap<DeviceId, TrackedDevice>>>;

/// 実行中のスキャン
struct ActiveScan {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    ended: Arc<AtomicBool>,
}

/// スキャンセッション
pub struct ScanSession {
    adapter: AdapterHandle,
    bus: EventBus,
    options: ScanOptions,
    devices: DeviceMap,
    active: Arc<Mutex<Option<ActiveScan>>>,
    scans_started: AtomicU64,
}

impl ScanSession {
    pub fn new(adapter: AdapterHandle, bus: EventBus, options: ScanOptions) -> Self {
        ScanSession {
            adapter,
            bus,
            options,
            devices: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(Mutex::new(None)),
            scans_started: AtomicU64::new(0),
        }
    }

    /// スキャンを開始
    ///
    /// `timeout`がNoneなら`stop()`まで継続する。
    pub async fn start(&self, filter: ScanFilter, timeout: Option<Duration>) -> Result<ScanStream> {
        let mut active = self.active.lock().await;

        if let Some(scan) = active.take() {
            if scan.ended.load(Ordering::SeqCst) {
                // 自然終了したスキャンの後始末
                let _ = scan.handle.await;
            } else {
                *active = Some(scan);
                return Err(BleError::ScanAlreadyActive);
            }
        }

        let radio = self.adapter.require_enabled().await?;

        // 取りこぼさないようにスキャン開始前に購読する
        let events = radio.events();
        radio.start_scan(&filter).await?;

        self.devices.write().await.clear();
        self.scans_started.fetch_add(1, Ordering::Relaxed);

        match timeout {
            Some(t) => info!("Scan started (timeout {:?}, filter {:?})", t, filter),
            None => info!("Continuous scan started (filter {:?})", filter),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let ended = Arc::new(AtomicBool::new(false));

        let known = match radio.known_devices().await {
            Ok(known) => known,
            Err(e) => {
                warn!("Failed to list known devices: {}", e);
                Vec::new()
            }
        };

        let mut worker = ScanWorker {
            radio,
            events,
            filter,
            deadline: timeout.map(|t| Instant::now() + t),
            options: self.options.clone(),
            devices: self.devices.clone(),
            tx,
            bus: self.bus.clone(),
            ended: ended.clone(),
        };

        // ペアリング済みなど既知のデバイスは無線の受信を待たずに報告する
        for advertisement in known {
            worker.handle_advertisement(advertisement).await;
        }

        let handle = tokio::spawn(worker.run(stop_rx));

        *active = Some(ActiveScan { stop_tx, handle, ended });

        Ok(ScanStream { rx })
    }

    /// スキャンを停止
    ///
    /// いつ呼んでもよい。実行中でなければ何もしない。
    pub async fn stop(&self) -> Result<()> {
        let mut active = self.active.lock().await;

        if let Some(scan) = active.take() {
            let _ = scan.stop_tx.send(());
            if let Err(e) = scan.handle.await {
                warn!("Scan task ended abnormally: {}", e);
            }
        }

        Ok(())
    }

    /// スキャン中か
    pub async fn is_active(&self) -> bool {
        let active = self.active.lock().await;
        active
            .as_ref()
            .map_or(false, |scan| !scan.ended.load(Ordering::SeqCst))
    }

    /// 現在の発見済みデバイス（1識別子につき1件）
    pub async fn devices(&self) -> Vec<DiscoveredDevice> {
        let devices = self.devices.read().await;
        let mut list: Vec<DiscoveredDevice> = devices.values().map(|t| t.device.clone()).collect();
        list.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// これまでに開始したスキャン数
    pub fn scans_started(&self) -> u64 {
        self.scans_started.load(Ordering::Relaxed)
    }
}

/// スキャン終了理由
#[derive(Debug)]
enum ScanEnd {
    Stopped,
    Timeout,
    PoweredOff(AdapterState),
    RadioClosed,
}

/// スキャンタスク
struct ScanWorker {
    radio: Arc<dyn Radio>,
    events: broadcast::Receiver<RadioEvent>,
    filter: ScanFilter,
    deadline: Option<Instant>,
    options: ScanOptions,
    devices: DeviceMap,
    tx: mpsc::UnboundedSender<ScanEvent>,
    bus: EventBus,
    ended: Arc<AtomicBool>,
}

impl ScanWorker {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) {
        // intervalはゼロ周期を受け付けない
        let period = self.options.lost_check_interval.max(Duration::from_millis(1));
        let mut lost_check = tokio::time::interval(period);
        let deadline = self.deadline;

        let end = loop {
            tokio::select! {
                // 送信側の破棄（セッション破棄）も停止として扱う
                _ = &mut stop_rx => break ScanEnd::Stopped,
                _ = wait_deadline(deadline) => break ScanEnd::Timeout,
                _ = lost_check.tick() => self.remove_lost_devices().await,
                event = self.events.recv() => match event {
                    Ok(RadioEvent::Advertisement(advertisement)) => {
                        self.handle_advertisement(advertisement).await;
                    }
                    Ok(RadioEvent::PowerChanged(state)) if state != AdapterState::On => {
                        break ScanEnd::PoweredOff(state);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Scan lagged behind radio events, {} advertisements dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break ScanEnd::RadioClosed,
                },
            }
        };

        match end {
            ScanEnd::PoweredOff(state) => warn!("Scan ended: adapter is {:?}", state),
            ref other => info!("Scan ended: {:?}", other),
        }

        if let Err(e) = self.radio.stop_scan().await {
            warn!("Failed to stop radio scan: {}", e);
        }

        self.bus.publish(DiscoveryEvent::ScanStopped);
        self.ended.store(true, Ordering::SeqCst);
        // ここでtxが破棄されストリームが終端する
    }

    async fn handle_advertisement(&mut self, advertisement: Advertisement) {
        if !self.filter.matches(&advertisement) {
            return;
        }

        let event = {
            let mut devices = self.devices.write().await;
            match devices.get_mut(&advertisement.id) {
                Some(tracked) => {
                    tracked.device.supersede(advertisement);
                    tracked.seen_at = Instant::now();
                    ScanEvent::Updated(tracked.device.clone())
                }
                None => {
                    let device = DiscoveredDevice::from_advertisement(advertisement);
                    info!("Found device: {} ({:?})", device.id, device.name);
                    devices.insert(
                        device.id.clone(),
                        TrackedDevice {
                            device: device.clone(),
                            seen_at: Instant::now(),
                        },
                    );
                    ScanEvent::Found(device)
                }
            }
        };

        self.emit(event);
    }

    async fn remove_lost_devices(&mut self) {
        let timeout = match self.options.lost_device_timeout {
            Some(timeout) => timeout,
            None => return,
        };

        let lost: Vec<DeviceId> = {
            let mut devices = self.devices.write().await;
            let lost: Vec<DeviceId> = devices
                .iter()
                .filter(|(_, tracked)| tracked.seen_at.elapsed() >= timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &lost {
                devices.remove(id);
            }
            lost
        };

        for id in lost {
            info!("Lost device: {}", id);
            self.emit(ScanEvent::Lost(id));
        }
    }

    fn emit(&self, event: ScanEvent) {
        debug!("Scan event for {}", event.id());
        let bus_event = match &event {
            ScanEvent::Found(device) => DiscoveryEvent::DeviceFound { device: device.clone() },
            ScanEvent::Updated(device) => DiscoveryEvent::DeviceUpdated { device: device.clone() },
            ScanEvent::Lost(id) => DiscoveryEvent::DeviceLost { id: id.clone() },
        };
        // ストリームが破棄されていてもスキャンは継続する
        let _ = self.tx.send(event);
        self.bus.publish(bus_event);
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
