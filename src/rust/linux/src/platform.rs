//! Linux固有のプラットフォーム処理

use std::path::Path;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{info, warn};

use blelink_common::{BleError, Result};

/// sysfsのBluetoothクラスディレクトリ
const SYSFS_BLUETOOTH: &str = "/sys/class/bluetooth";

/// シャットダウンシグナル受信器
pub struct ShutdownReceiver {
    rx: oneshot::Receiver<()>,
}

impl ShutdownReceiver {
    /// シグナルを待機
    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}

impl From<oneshot::Receiver<()>> for ShutdownReceiver {
    fn from(rx: oneshot::Receiver<()>) -> Self {
        ShutdownReceiver { rx }
    }
}

/// Linux固有のプラットフォーム処理
pub struct LinuxPlatform;

impl LinuxPlatform {
    /// Ctrl+C / SIGTERMハンドラーのセットアップ
    pub fn setup_shutdown_handler() -> Result<ShutdownReceiver> {
        let (tx, rx) = oneshot::channel();

        let mut sigterm = unix_signal(SignalKind::terminate())
            .map_err(|e| BleError::Platform(format!("Failed to setup SIGTERM handler: {}", e)))?;

        tokio::spawn(async move {
            tokio::select! {
                result = signal::ctrl_c() => match result {
                    Ok(()) => info!("Received Ctrl+C signal"),
                    Err(err) => {
                        warn!("Unable to listen for shutdown signal: {}", err);
                        return;
                    }
                },
                _ = sigterm.recv() => info!("Received SIGTERM signal"),
            }
            let _ = tx.send(());
        });

        Ok(ShutdownReceiver::from(rx))
    }

    /// プラットフォーム情報を取得
    pub fn get_platform_info() -> PlatformInfo {
        PlatformInfo {
            kernel: get_kernel_version(),
            distribution: std::fs::read_to_string("/etc/os-release")
                .ok()
                .and_then(|content| parse_pretty_name(&content))
                .unwrap_or_else(|| "Unknown".to_string()),
        }
    }

    /// sysfsに見えるHCIアダプタ名
    pub fn bluetooth_adapters() -> Vec<String> {
        let mut adapters: Vec<String> = match std::fs::read_dir(SYSFS_BLUETOOTH) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .filter(|name| is_hci_adapter(name))
                .collect(),
            Err(_) => Vec::new(),
        };
        adapters.sort();
        adapters
    }

    /// Bluetooth利用可能かチェック
    pub async fn check_bluetooth_available() -> bool {
        if Self::bluetooth_adapters().is_empty() {
            return false;
        }

        // bluetoothdが動いているか（systemctlが使えない環境ではアダプタの存在だけで判断）
        match tokio::process::Command::new("systemctl")
            .args(["is-active", "bluetooth"])
            .output()
            .await
        {
            Ok(output) => String::from_utf8_lossy(&output.stdout).trim() == "active",
            Err(_) => Path::new(SYSFS_BLUETOOTH).exists(),
        }
    }
}

/// プラットフォーム情報
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    pub kernel: String,
    pub distribution: String,
}

/// カーネルバージョンを取得
fn get_kernel_version() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "Unknown".to_string())
}

/// os-releaseのPRETTY_NAMEを取り出す
fn parse_pretty_name(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim_matches('"').to_string())
}

/// hci0, hci1, ... のみをアダプタとみなす（hci0:64 のような接続エントリは除く）
fn is_hci_adapter(name: &str) -> bool {
    name.strip_prefix("hci")
        .map_or(false, |n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pretty_name() {
        let content = "NAME=\"Debian GNU/Linux\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nID=debian\n";
        assert_eq!(
            parse_pretty_name(content).as_deref(),
            Some("Debian GNU/Linux 12 (bookworm)")
        );
        assert_eq!(parse_pretty_name("ID=arch\n"), None);
    }

    #[test]
    fn test_is_hci_adapter() {
        assert!(is_hci_adapter("hci0"));
        assert!(is_hci_adapter("hci12"));
        assert!(!is_hci_adapter("hci0:64"));
        assert!(!is_hci_adapter("hci"));
        assert!(!is_hci_adapter("rfkill0"));
    }
}
