//! LEDマトリクスの書き込み
//!
//! 書き込み中に届いたマトリクスは最新の1つだけを保留し、書き込み完了後に送る。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::connection::ConnectionManager;
use super::events::{DiscoveryEvent, EventBus};
use super::traits::DeviceId;
use crate::error::Result;
use crate::protocol::uuid as gatt;

/// デバイスごとの書き込み状況（マップにあれば書き込み中）
#[derive(Debug, Default)]
struct WriterSlot {
    pending: Option<Vec<u8>>,
}

/// LEDマトリクスライター
#[derive(Debug)]
pub struct LedMatrixWriter {
    slots: Mutex<HashMap<DeviceId, WriterSlot>>,
    bus: EventBus,
}

impl LedMatrixWriter {
    pub fn new(bus: EventBus) -> Self {
        LedMatrixWriter {
            slots: Mutex::new(HashMap::new()),
            bus,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<DeviceId, WriterSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// GATTバイト列を書き込む
    ///
    /// 同じデバイスへの書き込み中なら保留して即座に戻る。保留中の古いマトリクスは捨てる。
    /// 返すエラーは呼び出し元自身の書き込みのもの。
    pub async fn write(&self, connections: &ConnectionManager, id: &DeviceId, data: Vec<u8>) -> Result<()> {
        {
            let mut slots = self.slots();
            if let Some(slot) = slots.get_mut(id) {
                if slot.pending.replace(data).is_some() {
                    debug!("Superseded pending LED matrix for {}", id);
                }
                return Ok(());
            }
            slots.insert(id.clone(), WriterSlot::default());
        }

        let mut busy = Busy {
            writer: self,
            id,
            armed: true,
        };

        let result = self.write_one(connections, id, &data).await;

        loop {
            let next = {
                let mut slots = self.slots();
                match slots.get_mut(id).and_then(|slot| slot.pending.take()) {
                    Some(next) => next,
                    None => {
                        slots.remove(id);
                        busy.armed = false;
                        break;
                    }
                }
            };

            if let Err(e) = self.write_one(connections, id, &next).await {
                warn!("Deferred LED matrix write to {} failed: {}", id, e);
            }
        }

        result
    }

    async fn write_one(&self, connections: &ConnectionManager, id: &DeviceId, data: &[u8]) -> Result<()> {
        connections.write(id, gatt::LED_MATRIX_CHAR, data).await?;
        self.bus.publish(DiscoveryEvent::LedMatrixWritten { id: id.clone() });
        Ok(())
    }
}

/// 書き込み途中でFutureが破棄されたら書き込み中の印を外す
struct Busy<'a> {
    writer: &'a LedMatrixWriter,
    id: &'a DeviceId,
    armed: bool,
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.writer.slots().remove(self.id);
        }
    }
}
