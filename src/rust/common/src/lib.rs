//! blelink 共通ライブラリ
//!
//! BLEデバイスの発見と接続管理。プラットフォームの無線は`RadioProvider`として注入する。

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod protocol;

// バージョン情報
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

// 主要な型の再エクスポート
pub use bluetooth::{
    AdapterHandle, AdapterState, ConnectionState, DeviceId, DiscoveredDevice, DiscoveryEvent,
    DiscoveryManager, DiscoveryStatistics, Radio, RadioEvent, RadioProvider, ScanEvent,
    ScanFilter, ScanStream,
};
pub use config::Settings;
pub use error::{BleError, Result};
pub use protocol::{Gesture, GestureEvent, LedMatrix};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "blelink-common");
    }
}
