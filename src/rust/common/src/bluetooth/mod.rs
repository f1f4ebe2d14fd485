//! Bluetooth共通モジュール

pub mod adapter;
pub mod connection;
pub mod events;
pub mod led;
pub mod manager;
pub mod scan;
pub mod traits;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// 再エクスポート
pub use adapter::AdapterHandle;
pub use connection::{ConnectionManager, ConnectionState};
pub use events::{DiscoveryEvent, EventBus};
pub use led::LedMatrixWriter;
pub use manager::{DiscoveryManager, DiscoveryStatistics};
pub use scan::{ScanEvent, ScanOptions, ScanSession, ScanStream};
pub use traits::{
    AdapterState, Advertisement, AdvertisementData, DeviceId, DiscoveredDevice, Radio, RadioEvent,
    RadioProvider, ScanFilter,
};
