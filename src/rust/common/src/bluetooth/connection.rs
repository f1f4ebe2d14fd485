//! デバイスごとの接続状態管理
//!
//! 同じデバイスへの操作はエントリごとの操作ロックで直列化する。
//! 異なるデバイスへの操作は互いに待たない。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::adapter::AdapterHandle;
use super::events::{DiscoveryEvent, EventBus};
use super::traits::{AdapterState, DeviceId, Radio, RadioEvent};
use crate::error::{BleError, Result};
use crate::protocol::GestureEvent;

/// 接続状態
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// 状態遷移が許されるか
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// 接続試行を中断した理由
#[derive(Debug, Clone, Copy)]
enum CancelReason {
    Disconnect,
    LinkLost,
    PoweredOff,
}

impl CancelReason {
    fn into_error(self, id: &DeviceId) -> BleError {
        match self {
            CancelReason::Disconnect => BleError::ConnectCancelled(id.to_string()),
            CancelReason::LinkLost => BleError::rejected(id, "link lost while connecting"),
            CancelReason::PoweredOff => BleError::AdapterOff,
        }
    }
}

/// デバイスごとのエントリ
///
/// 操作ロックの複製はエントリマップの書き込みロック中にだけ作る。
/// 誰も複製を持たない`Disconnected`のエントリは削除してよい。
struct Entry {
    state: ConnectionState,
    op_lock: Arc<Mutex<()>>,

    /// 切断要求のたびに進む。ロック待ちの接続試行はこれで中断を検知する
    epoch: u64,

    /// 実行中の接続試行への中断通知
    cancel: Option<oneshot::Sender<CancelReason>>,
}

impl Entry {
    fn new() -> Self {
        Entry {
            state: ConnectionState::Disconnected,
            op_lock: Arc::new(Mutex::new(())),
            epoch: 0,
            cancel: None,
        }
    }

    /// 実行中の操作も接続も無い
    fn is_idle(&self) -> bool {
        self.state == ConnectionState::Disconnected
            && self.cancel.is_none()
            && Arc::strong_count(&self.op_lock) == 1
    }
}

/// 監視タスクと共有する状態
struct Shared {
    entries: RwLock<HashMap<DeviceId, Entry>>,
    bus: EventBus,
}

impl Shared {
    /// 状態を更新しイベントを送信
    fn set_state(&self, id: &DeviceId, entry: &mut Entry, next: ConnectionState) {
        let previous = entry.state;
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            warn!("Unexpected connection transition for {}: {:?} -> {:?}", id, previous, next);
        }
        entry.state = next;
        debug!("{}: {:?} -> {:?}", id, previous, next);
        self.bus.publish(DiscoveryEvent::ConnectionStateChanged {
            id: id.clone(),
            previous,
            state: next,
        });
    }

    async fn update(&self, id: &DeviceId, next: ConnectionState) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(id.clone()).or_insert_with(Entry::new);
        self.set_state(id, entry, next);
    }

    /// 使われなくなったエントリを削除
    async fn release(&self, id: &DeviceId) {
        let mut entries = self.entries.write().await;
        if entries.get(id).map_or(false, Entry::is_idle) {
            entries.remove(id);
        }
    }

    async fn state(&self, id: &DeviceId) -> ConnectionState {
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| e.state)
            .unwrap_or_default()
    }

    /// リモート起因の切断
    async fn link_lost(&self, id: &DeviceId) {
        let mut entries = self.entries.write().await;
        let entry = match entries.get_mut(id) {
            Some(entry) => entry,
            None => return,
        };

        match entry.state {
            ConnectionState::Connecting => {
                if let Some(cancel) = entry.cancel.take() {
                    let _ = cancel.send(CancelReason::LinkLost);
                }
            }
            ConnectionState::Connected | ConnectionState::Disconnecting => {
                warn!("Link to {} lost", id);
                self.set_state(id, entry, ConnectionState::Disconnected);
                if entry.is_idle() {
                    entries.remove(id);
                }
            }
            ConnectionState::Disconnected => {}
        }
    }

    /// 電源オフで全接続を破棄
    async fn drop_all(&self) {
        let mut entries = self.entries.write().await;
        for (id, entry) in entries.iter_mut() {
            if let Some(cancel) = entry.cancel.take() {
                let _ = cancel.send(CancelReason::PoweredOff);
            }
            if matches!(
                entry.state,
                ConnectionState::Connected | ConnectionState::Disconnecting
            ) {
                self.set_state(id, entry, ConnectionState::Disconnected);
            }
        }
        entries.retain(|_, entry| !entry.is_idle());
    }

    async fn monitor(self: Arc<Self>, mut events: broadcast::Receiver<RadioEvent>) {
        loop {
            match events.recv().await {
                Ok(RadioEvent::Disconnected(id)) => self.link_lost(&id).await,
                Ok(RadioEvent::PowerChanged(state)) => {
                    info!("Adapter state changed: {:?}", state);
                    if state != AdapterState::On {
                        self.drop_all().await;
                    }
                    self.bus.publish(DiscoveryEvent::AdapterStateChanged { state });
                }
                Ok(RadioEvent::Notification {
                    id,
                    characteristic,
                    value,
                }) => match GestureEvent::decode(characteristic, &value) {
                    Some(event) => {
                        debug!("Gesture from {}: {:?}", id, event);
                        self.bus.publish(DiscoveryEvent::Gesture { id, event });
                    }
                    None => debug!("Ignoring notification on {} from {}", characteristic, id),
                },
                Ok(RadioEvent::Advertisement(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Connection monitor lagged, {} radio events dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Radio event stream closed");
                    break;
                }
            }
        }
    }
}

/// 接続マネージャー
pub struct ConnectionManager {
    adapter: AdapterHandle,
    shared: Arc<Shared>,
    notify_characteristics: Vec<Uuid>,
    monitor: Option<JoinHandle<()>>,
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
}

impl ConnectionManager {
    /// 新しい接続マネージャーを作成
    ///
    /// 無線がある場合は監視タスクを起動する（tokioランタイム内で呼ぶこと）。
    pub fn new(adapter: AdapterHandle, bus: EventBus, notify_characteristics: Vec<Uuid>) -> Self {
        let shared = Arc::new(Shared {
            entries: RwLock::new(HashMap::new()),
            bus,
        });

        let monitor = adapter.radio().ok().map(|radio| {
            let events = radio.events();
            tokio::spawn(shared.clone().monitor(events))
        });

        ConnectionManager {
            adapter,
            shared,
            notify_characteristics,
            monitor,
            connect_attempts: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
        }
    }

    /// デバイスに接続
    ///
    /// 接続済みなら何もしない。通知の有効化まで完了して`Connected`になる。
    pub async fn connect(&self, id: &DeviceId, timeout: Duration) -> Result<()> {
        // 最初のawaitより前に登録し、以降の切断要求をepochで検知できるようにする
        let (op_lock, epoch) = {
            let mut entries = self.shared.entries.write().await;
            let entry = entries.entry(id.clone()).or_insert_with(Entry::new);
            (entry.op_lock.clone(), entry.epoch)
        };

        let result = self.connect_registered(id, timeout, &op_lock, epoch).await;

        drop(op_lock);
        self.shared.release(id).await;
        result
    }

    async fn connect_registered(
        &self,
        id: &DeviceId,
        timeout: Duration,
        op_lock: &Mutex<()>,
        epoch: u64,
    ) -> Result<()> {
        let radio = self.adapter.require_enabled().await?;

        let _op = op_lock.lock().await;

        let mut cancel_rx = {
            let mut entries = self.shared.entries.write().await;
            let entry = entries.entry(id.clone()).or_insert_with(Entry::new);

            if entry.epoch != epoch {
                info!("Connect to {} cancelled before it started", id);
                return Err(BleError::ConnectCancelled(id.to_string()));
            }
            if entry.state.is_connected() {
                debug!("{} already connected", id);
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            entry.cancel = Some(tx);
            self.shared.set_state(id, entry, ConnectionState::Connecting);
            rx
        };

        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        info!("Connecting to {} (timeout {:?})", id, timeout);

        let result = self.establish(&radio, id, timeout, &mut cancel_rx).await;

        {
            let mut entries = self.shared.entries.write().await;
            let entry = entries.entry(id.clone()).or_insert_with(Entry::new);
            entry.cancel = None;
            match &result {
                Ok(()) => self.shared.set_state(id, entry, ConnectionState::Connected),
                Err(_) => self.shared.set_state(id, entry, ConnectionState::Disconnected),
            }
        }

        match &result {
            Ok(()) => info!("Connected to {}", id),
            Err(e) => {
                self.connect_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to connect to {}: {}", id, e);
            }
        }

        result
    }

    /// リンク確立と通知の有効化
    async fn establish(
        &self,
        radio: &Arc<dyn Radio>,
        id: &DeviceId,
        timeout: Duration,
        cancel_rx: &mut oneshot::Receiver<CancelReason>,
    ) -> Result<()> {
        let link = async {
            radio.connect(id).await.map_err(|e| match e {
                BleError::ConnectTimeout { .. }
                | BleError::ConnectRejected { .. }
                | BleError::AdapterOff
                | BleError::AdapterUnavailable(_) => e,
                other => BleError::rejected(id, other),
            })?;

            for characteristic in &self.notify_characteristics {
                radio.subscribe(id, *characteristic).await.map_err(|e| {
                    BleError::rejected(
                        id,
                        format!("enabling notifications on {} failed: {}", characteristic, e),
                    )
                })?;
            }

            Ok::<(), BleError>(())
        };

        let result = tokio::select! {
            result = tokio::time::timeout(timeout, link) => match result {
                Ok(result) => result,
                Err(_) => Err(BleError::ConnectTimeout {
                    device: id.to_string(),
                    timeout,
                }),
            },
            reason = &mut *cancel_rx => {
                Err(reason.unwrap_or(CancelReason::Disconnect).into_error(id))
            }
        };

        // リンク確立直後に届いた中断も反映する
        let result = match (result, cancel_rx.try_recv()) {
            (Ok(()), Ok(reason)) => Err(reason.into_error(id)),
            (result, _) => result,
        };

        if result.is_err() {
            if let Err(e) = radio.disconnect(id).await {
                debug!("Cleanup disconnect for {} failed: {}", id, e);
            }
        }

        result
    }

    /// デバイスを切断
    ///
    /// 未接続なら何もしない。接続試行中ならそれを中断する。
    pub async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        let op_lock = {
            let mut entries = self.shared.entries.write().await;
            let entry = match entries.get_mut(id) {
                Some(entry) => entry,
                None => return Ok(()),
            };
            entry.epoch += 1;
            if let Some(cancel) = entry.cancel.take() {
                info!("Cancelling in-flight connect to {}", id);
                let _ = cancel.send(CancelReason::Disconnect);
            }
            entry.op_lock.clone()
        };

        self.disconnect_locked(id, &op_lock).await;

        drop(op_lock);
        self.shared.release(id).await;
        Ok(())
    }

    async fn disconnect_locked(&self, id: &DeviceId, op_lock: &Mutex<()>) {
        let _op = op_lock.lock().await;

        match self.shared.state(id).await {
            ConnectionState::Connected => {
                self.shared.update(id, ConnectionState::Disconnecting).await;
                info!("Disconnecting from {}", id);
            }
            // ロックが取れたのに接続中のままなら、接続試行のFutureが途中で破棄されている
            ConnectionState::Connecting => warn!("Connect to {} was abandoned, tearing down", id),
            ConnectionState::Disconnected | ConnectionState::Disconnecting => return,
        }

        let result = match self.adapter.radio() {
            Ok(radio) => radio.disconnect(id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Radio disconnect for {} failed: {}", id, e);
        }

        self.shared.update(id, ConnectionState::Disconnected).await;
        info!("Disconnected from {}", id);
    }

    /// 全デバイスを切断
    pub async fn disconnect_all(&self) -> Result<()> {
        let ids: Vec<DeviceId> = {
            let entries = self.shared.entries.read().await;
            entries
                .iter()
                .filter(|(_, e)| e.state != ConnectionState::Disconnected || e.cancel.is_some())
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in ids {
            self.disconnect(&id).await?;
        }
        Ok(())
    }

    /// 接続状態（未知のデバイスは`Disconnected`）
    pub async fn state(&self, id: &DeviceId) -> ConnectionState {
        self.shared.state(id).await
    }

    /// 接続中のデバイス
    pub async fn connected_devices(&self) -> Vec<DeviceId> {
        let entries = self.shared.entries.read().await;
        let mut ids: Vec<DeviceId> = entries
            .iter()
            .filter(|(_, e)| e.state.is_connected())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// キャラクタリスティックへ書き込み
    pub async fn write(&self, id: &DeviceId, characteristic: Uuid, data: &[u8]) -> Result<()> {
        if !self.state(id).await.is_connected() {
            return Err(BleError::DeviceNotConnected(id.to_string()));
        }
        let radio = self.adapter.radio()?;
        debug!("Writing {} bytes to {} on {}", data.len(), characteristic, id);
        radio.write(id, characteristic, data).await
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn connect_failures(&self) -> u64 {
        self.connect_failures.load(Ordering::Relaxed)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::{MockProvider, MockRadio};
    use crate::protocol::{uuid as gatt, Gesture};
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(2);

    async fn manager_with(radio: &MockRadio, bus: EventBus) -> Arc<ConnectionManager> {
        let adapter = AdapterHandle::new(&MockProvider::present(radio.clone())).await;
        Arc::new(ConnectionManager::new(
            adapter,
            bus,
            gatt::NOTIFICATION_CHARS.to_vec(),
        ))
    }

    async fn wait_for_state(manager: &ConnectionManager, id: &DeviceId, expected: ConnectionState) {
        let deadline = Instant::now() + TIMEOUT;
        while manager.state(id).await != expected {
            assert!(Instant::now() < deadline, "state never became {:?}", expected);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(Disconnecting.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnecting.can_transition_to(Connected));
    }

    #[tokio::test]
    async fn test_connect_then_disconnect() {
        let radio = MockRadio::new();
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let manager = manager_with(&radio, bus).await;
        let id = DeviceId::new("aa:00:00:00:00:01");

        manager.connect(&id, TIMEOUT).await.unwrap();
        assert_eq!(manager.state(&id).await, ConnectionState::Connected);
        assert_eq!(radio.subscriptions().len(), gatt::NOTIFICATION_CHARS.len());
        assert_eq!(manager.connected_devices().await, vec![id.clone()]);

        manager.disconnect(&id).await.unwrap();
        assert_eq!(manager.state(&id).await, ConnectionState::Disconnected);
        assert!(!radio.is_connected(&id));

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DiscoveryEvent::ConnectionStateChanged { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let radio = MockRadio::new();
        let manager = manager_with(&radio, EventBus::new()).await;
        let id = DeviceId::new("aa:00:00:00:00:01");

        manager.connect(&id, TIMEOUT).await.unwrap();
        manager.connect(&id, TIMEOUT).await.unwrap();
        assert_eq!(radio.connect_calls(), 1);
        assert_eq!(manager.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let radio = MockRadio::new();
        let manager = manager_with(&radio, EventBus::new()).await;
        let id = DeviceId::new("aa:00:00:00:00:01");

        // 未知のデバイス
        manager.disconnect(&id).await.unwrap();

        manager.connect(&id, TIMEOUT).await.unwrap();
        manager.disconnect(&id).await.unwrap();
        manager.disconnect(&id).await.unwrap();
        assert_eq!(radio.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_inflight_connect() {
        let radio = MockRadio::new();
        radio.set_connect_delay(Duration::from_millis(500));
        let manager = manager_with(&radio, EventBus::new()).await;
        let id = DeviceId::new("aa:00:00:00:00:01");

        let task = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.connect(&id, TIMEOUT).await })
        };

        wait_for_state(&manager, &id, ConnectionState::Connecting).await;
        manager.disconnect(&id).await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(BleError::ConnectCancelled(_))));
        assert_eq!(manager.state(&id).await, ConnectionState::Disconnected);
        assert!(!radio.is_connected(&id));
    }

    #[tokio::test]
    async fn test_disconnect_while_checking_power_cancels_connect() {
        let radio = MockRadio::new();
        radio.set_power_query_delay(Duration::from_millis(50));
        let manager = manager_with(&radio, EventBus::new()).await;
        let id = DeviceId::new("aa:00:00:00:00:01");

        let task = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move { manager.connect(&id, TIMEOUT).await })
        };

        // 接続側はまだ電源状態の問い合わせ中
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.state(&id).await, ConnectionState::Disconnected);
        manager.disconnect(&id).await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(BleError::ConnectCancelled(_))));
        assert_eq!(manager.state(&id).await, ConnectionState::Disconnected);
        assert!(!radio.is_connected(&id));
        assert_eq!(radio.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_connect_is_torn_down() {
        let radio = MockRadio::new();
        radio.set_connect_delay(Duration::from_millis(500));
        let manager = manager_with(&radio, EventBus::new()).await;
        let id = DeviceId::new("aa:00:00:00:00:01");

        // 接続のFutureを途中で破棄する
        let abandoned = tokio::time::timeout(Duration::from_millis(50), manager.connect(&id, TIMEOUT)).await;
        assert!(abandoned.is_err());
        assert_eq!(manager.state(&id).await, ConnectionState::Connecting);

        manager.disconnect(&id).await.unwrap();
        assert_eq!(manager.state(&id).await, ConnectionState::Disconnected);
        assert_eq!(radio.disconnect_calls(), 1);

        manager.connect(&id, TIMEOUT).await.unwrap();
        assert_eq!(manager.state(&id).await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_idle_entries_released() {
        let radio = MockRadio::new();
        radio.reject("aa:00:00:00:00:02", "status 133");
        let manager = manager_with(&radio, EventBus::new()).await;
        let kept = DeviceId::new("aa:00:00:00:00:01");
        let rejected = DeviceId::new("aa:00:00:00:00:02");
        let dropped = DeviceId::new("aa:00:00:00:00:03");

        manager.connect(&kept, TIMEOUT).await.unwrap();
        assert!(manager.connect(&rejected, TIMEOUT).await.is_err());
        manager.connect(&dropped, TIMEOUT).await.unwrap();
        radio.drop_link(dropped.clone());
        wait_for_state(&manager, &dropped, ConnectionState::Disconnected).await;

        let tracked: Vec<DeviceId> = manager.shared.entries.read().await.keys().cloned().collect();
        assert_eq!(tracked, vec![kept.clone()]);

        manager.disconnect(&kept).await.unwrap();
        assert!(manager.shared.entries.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let radio = MockRadio::new();
        radio.set_connect_delay(Duration::from_millis(500));
        let manager = manager_with(&radio, EventBus::new()).await;
        let id = DeviceId::new("aa:00:00:00:00:01");

        let result = manager.connect(&id, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(BleError::ConnectTimeout { .. })));
        assert_eq!(manager.state(&id).await, ConnectionState::Disconnected);
        assert_eq!(manager.connect_failures(), 1);
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let radio = MockRadio::new();
        radio.reject("aa:00:00:00:00:01", "status 133");
        let manager = manager_with(&radio, EventBus::new()).await;
        let id = DeviceId::new("aa:00:00:00:00:01");

        match manager.connect(&id, TIMEOUT).await {
            Err(BleError::ConnectRejected { reason, .. }) => assert_eq!(reason, "status 133"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(manager.state(&id).await, ConnectionState::Disconnected);

        // 拒否が解除されればリトライで接続できる
        radio.accept("aa:00:00:00:00:01");
        manager.connect(&id, TIMEOUT).await.unwrap();
        assert_eq!(manager.state(&id).await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_failed_subscription_tears_down_link() {
        let radio = MockRadio::new();
        radio.set_fail_subscriptions(true);
        let manager = manager_with(&radio, EventBus::new()).await;
        let id = DeviceId::new("aa:00:00:00:00:01");

        let result = manager.connect(&id, TIMEOUT).await;
        assert!(matches!(result, Err(BleError::ConnectRejected { .. })));
        assert_eq!(manager.state(&id).await, ConnectionState::Disconnected);
        assert!(!radio.is_connected(&id));
    }

    #[tokio::test]
    async fn test_same_device_connects_serialized() {
        let radio = MockRadio::new();
        radio.set_connect_delay(Duration::from_millis(100));
        let manager = manager_with(&radio, EventBus::new()).await;
        let id = DeviceId::new("aa:00:00:00:00:01");

        let (a, b) = tokio::join!(manager.connect(&id, TIMEOUT), manager.connect(&id, TIMEOUT));
        a.unwrap();
        b.unwrap();

        // 2回目はロック取得後に接続済みを確認して終わる
        assert_eq!(radio.connect_calls(), 1);
        assert_eq!(radio.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_different_devices_connect_independently() {
        let radio = MockRadio::new();
        radio.set_connect_delay(Duration::from_millis(300));
        let manager = manager_with(&radio, EventBus::new()).await;
        let first = DeviceId::new("aa:00:00:00:00:01");
        let second = DeviceId::new("aa:00:00:00:00:02");

        let started = Instant::now();
        let (a, b) = tokio::join!(manager.connect(&first, TIMEOUT), manager.connect(&second, TIMEOUT));
        a.unwrap();
        b.unwrap();

        assert!(started.elapsed() < Duration::from_millis(550));
        assert_eq!(manager.connected_devices().await.len(), 2);
    }

    #[tokio::test]
    async fn test_absent_adapter() {
        let adapter = AdapterHandle::new(&MockProvider::absent()).await;
        let manager = ConnectionManager::new(adapter, EventBus::new(), Vec::new());
        let id = DeviceId::new("aa:00:00:00:00:01");

        let result = manager.connect(&id, TIMEOUT).await;
        assert!(matches!(result, Err(BleError::AdapterUnavailable(_))));
        manager.disconnect(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_drop() {
        let radio = MockRadio::new();
        let manager = manager_with(&radio, EventBus::new()).await;
        let id = DeviceId::new("aa:00:00:00:00:01");

        manager.connect(&id, TIMEOUT).await.unwrap();
        radio.drop_link(id.clone());

        wait_for_state(&manager, &id, ConnectionState::Disconnected).await;
        assert!(manager.connected_devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_power_off_destroys_connections() {
        let radio = MockRadio::new();
        let manager = manager_with(&radio, EventBus::new()).await;
        let first = DeviceId::new("aa:00:00:00:00:01");
        let second = DeviceId::new("aa:00:00:00:00:02");

        manager.connect(&first, TIMEOUT).await.unwrap();
        manager.connect(&second, TIMEOUT).await.unwrap();
        radio.set_power(AdapterState::Off);

        wait_for_state(&manager, &first, ConnectionState::Disconnected).await;
        wait_for_state(&manager, &second, ConnectionState::Disconnected).await;

        let result = manager.connect(&first, TIMEOUT).await;
        assert!(matches!(result, Err(BleError::AdapterOff)));
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let radio = MockRadio::new();
        let manager = manager_with(&radio, EventBus::new()).await;
        let id = DeviceId::new("aa:00:00:00:00:01");

        let result = manager.write(&id, gatt::LED_MATRIX_CHAR, &[0u8; 13]).await;
        assert!(matches!(result, Err(BleError::DeviceNotConnected(_))));

        manager.connect(&id, TIMEOUT).await.unwrap();
        manager.write(&id, gatt::LED_MATRIX_CHAR, &[1, 2, 3]).await.unwrap();

        let writes = radio.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].characteristic, gatt::LED_MATRIX_CHAR);
        assert_eq!(writes[0].data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_notification_published_as_gesture() {
        let radio = MockRadio::new();
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let manager = manager_with(&radio, bus).await;
        let id = DeviceId::new("aa:00:00:00:00:01");

        manager.connect(&id, TIMEOUT).await.unwrap();
        radio.notify(id.clone(), gatt::SENSOR_BUTTON_CHAR, vec![1]);

        let gesture = tokio::time::timeout(TIMEOUT, async {
            loop {
                if let Ok(DiscoveryEvent::Gesture { id, event }) = events.recv().await {
                    return (id, event);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(gesture.0, id);
        assert_eq!(gesture.1.gesture, Gesture::ButtonPress);
    }
}
