//! 発見・接続イベントの配信

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use super::connection::ConnectionState;
use super::traits::{AdapterState, DeviceId, DiscoveredDevice};
use crate::protocol::GestureEvent;

/// イベントチャネルの容量
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// マネージャーが外部に公開するイベント
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    /// デバイスを新たに発見
    DeviceFound { device: DiscoveredDevice },

    /// 既知デバイスのアドバタイズを更新
    DeviceUpdated { device: DiscoveredDevice },

    /// 一定時間アドバタイズが途絶えた
    DeviceLost { id: DeviceId },

    /// 接続状態の変化
    ConnectionStateChanged {
        id: DeviceId,
        previous: ConnectionState,
        state: ConnectionState,
    },

    /// アダプタ状態の変化
    AdapterStateChanged { state: AdapterState },

    /// スキャン終了
    ScanStopped,

    /// LEDマトリクスの書き込み完了
    LedMatrixWritten { id: DeviceId },

    /// 接続中デバイスからのジェスチャー
    Gesture { id: DeviceId, event: GestureEvent },
}

/// broadcastチャネルのラッパー
///
/// 購読者がいなくても送信は失敗扱いにしない。
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DiscoveryEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventBus { sender }
    }

    /// イベントを送信
    pub fn publish(&self, event: DiscoveryEvent) {
        trace!("Publishing event: {:?}", event);
        let _ = self.sender.send(event);
    }

    /// イベントを購読
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.sender.subscribe()
    }

    /// 購読者数
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(DiscoveryEvent::ScanStopped);
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_receives_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(DiscoveryEvent::AdapterStateChanged { state: AdapterState::Off });
        bus.publish(DiscoveryEvent::AdapterStateChanged { state: AdapterState::On });

        match rx.recv().await.unwrap() {
            DiscoveryEvent::AdapterStateChanged { state } => assert_eq!(state, AdapterState::Off),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            DiscoveryEvent::AdapterStateChanged { state } => assert_eq!(state, AdapterState::On),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = DiscoveryEvent::DeviceLost { id: DeviceId::new("aa:bb") };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "device_lost");
        assert_eq!(json["id"], "AA:BB");
    }
}
