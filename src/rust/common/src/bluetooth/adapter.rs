//! アダプタハンドル
//!
//! プロセスで唯一の無線参照を保持する。全セッションから読み取り専用で共有される。

use std::sync::Arc;
use tracing::{info, warn};

use super::traits::{AdapterState, Radio, RadioProvider};
use crate::error::{BleError, Result};

/// プラットフォーム無線のハンドル
#[derive(Clone)]
pub struct AdapterHandle {
    radio: Option<Arc<dyn Radio>>,

    /// 取得失敗時の理由
    unavailable_reason: Option<String>,
}

impl std::fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterHandle")
            .field("radio", &self.radio.as_ref().map(|_| "<dyn Radio>"))
            .field("unavailable_reason", &self.unavailable_reason)
            .finish()
    }
}

impl AdapterHandle {
    /// プロバイダから無線を取得
    ///
    /// 取得できなくても失敗しない。利用時に`AdapterUnavailable`となる。
    pub async fn new(provider: &dyn RadioProvider) -> Self {
        match provider.open().await {
            Ok(radio) => {
                info!("Bluetooth adapter acquired");
                AdapterHandle {
                    radio: Some(radio),
                    unavailable_reason: None,
                }
            }
            Err(e) => {
                warn!("Bluetooth adapter unavailable: {}", e);
                AdapterHandle {
                    radio: None,
                    unavailable_reason: Some(e.to_string()),
                }
            }
        }
    }

    /// 無線を取得
    pub fn radio(&self) -> Result<Arc<dyn Radio>> {
        self.radio.clone().ok_or_else(|| {
            BleError::AdapterUnavailable(
                self.unavailable_reason
                    .clone()
                    .unwrap_or_else(|| "no Bluetooth adapter".to_string()),
            )
        })
    }

    /// 現在の状態
    pub async fn state(&self) -> AdapterState {
        match &self.radio {
            Some(radio) => match radio.power_state().await {
                Ok(state) => state,
                Err(e) => {
                    warn!("Failed to read adapter power state: {}", e);
                    AdapterState::Unavailable
                }
            },
            None => AdapterState::Unavailable,
        }
    }

    /// ハードウェアが利用可能か
    pub async fn is_available(&self) -> bool {
        self.state().await != AdapterState::Unavailable
    }

    /// 電源がオンか
    pub async fn is_enabled(&self) -> bool {
        self.state().await == AdapterState::On
    }

    /// 電源オンの無線を取得
    pub async fn require_enabled(&self) -> Result<Arc<dyn Radio>> {
        let radio = self.radio()?;
        match radio.power_state().await? {
            AdapterState::On => Ok(radio),
            AdapterState::Off => Err(BleError::AdapterOff),
            AdapterState::Unavailable => Err(BleError::AdapterUnavailable(
                "adapter reported unavailable".to_string(),
            )),
        }
    }
}
