//! blelink Linux版コマンドライン

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use blelink_common::{
    DeviceId, DiscoveryEvent, DiscoveryManager, LedMatrix, ScanEvent, ScanFilter, Settings, VERSION,
};

mod bluetooth_impl;
mod platform;

use bluetooth_impl::BtleplugProvider;
use platform::{LinuxPlatform, ShutdownReceiver};

/// BLEデバイスの発見と接続
#[derive(Debug, Parser)]
#[command(name = "blelink", version, about = "BLE peripheral discovery and session manager")]
struct Cli {
    /// 設定ファイル（.json / .toml / .yaml）
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// ログレベル（EnvFilterの書式）
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// デバイスをスキャンして一覧表示
    Scan {
        /// スキャン時間（秒）
        #[arg(short, long)]
        timeout: Option<u64>,

        /// 対象デバイス名（複数指定可）
        #[arg(short, long = "name")]
        names: Vec<String>,

        /// 結果をJSONで出力
        #[arg(long)]
        json: bool,
    },

    /// デバイスに接続してジェスチャーを表示
    Connect {
        /// Bluetoothアドレス
        address: String,

        /// LEDマトリクスに表示するパターン（81文字、' 'と'0'が消灯）
        #[arg(long)]
        pattern: Option<String>,

        /// LEDの表示時間（秒）
        #[arg(long, default_value_t = 2.0)]
        interval: f64,
    },

    /// 継続スキャンし、見つけたデバイスに自動接続
    Watch {
        /// 対象デバイス名（複数指定可）
        #[arg(short, long = "name")]
        names: Vec<String>,
    },
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => {
            let mut settings = Settings::from_file(path)?;
            settings.override_from_env();
            settings
        }
        None => Settings::new()?,
    };

    if let Some(level) = &cli.log_level {
        settings.logging.level = level.clone();
    }
    settings.validate()?;
    Ok(settings)
}

fn init_logging(settings: &Settings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.logging.level))
        .context("invalid log level")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if settings.logging.output == "stderr" {
        builder.with_writer(std::io::stderr).try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("setting default subscriber failed: {}", e))
}

/// 名前指定があれば設定のフィルターを置き換える
fn filter_with_names(settings: &Settings, names: Vec<String>) -> Option<ScanFilter> {
    if names.is_empty() {
        None
    } else {
        Some(ScanFilter {
            names,
            ..settings.scan.filter()
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    init_logging(&settings)?;

    const BUILD_NUMBER: &str = env!("BUILD_NUMBER");
    info!("blelink starting (Linux version {}, build #{})", VERSION, BUILD_NUMBER);

    let platform_info = LinuxPlatform::get_platform_info();
    info!("Platform: {} ({})", platform_info.distribution, platform_info.kernel);

    if !LinuxPlatform::check_bluetooth_available().await {
        warn!("Bluetooth service does not look available; adapter access may fail");
    }

    let manager = DiscoveryManager::new(&BtleplugProvider, settings).await;
    if !manager.is_available().await {
        anyhow::bail!("Bluetooth adapter unavailable");
    }

    let shutdown = LinuxPlatform::setup_shutdown_handler()?;

    let result = match cli.command {
        Command::Scan { timeout, names, json } => {
            run_scan(&manager, timeout, names, json, shutdown).await
        }
        Command::Connect {
            address,
            pattern,
            interval,
        } => run_connect(&manager, DeviceId::new(address), pattern, interval, shutdown).await,
        Command::Watch { names } => run_watch(&manager, names, shutdown).await,
    };

    if let Err(e) = manager.shutdown().await {
        warn!("Shutdown did not complete cleanly: {}", e);
    }
    info!("Shutdown completed");

    result
}

async fn run_scan(
    manager: &DiscoveryManager,
    timeout: Option<u64>,
    names: Vec<String>,
    json: bool,
    shutdown: ShutdownReceiver,
) -> anyhow::Result<()> {
    let filter = filter_with_names(manager.settings(), names);
    let mut stream = manager
        .start_discovery(filter, timeout.map(Duration::from_secs))
        .await?;

    let shutdown = shutdown.wait();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                manager.stop_discovery().await?;
                break;
            }
            event = stream.next() => match event {
                Some(ScanEvent::Found(device)) if !json => {
                    println!(
                        "+ {}  {:<20}  {} dBm",
                        device.id,
                        device.name.as_deref().unwrap_or("(unknown)"),
                        device.rssi.map_or("?".to_string(), |r| r.to_string())
                    );
                }
                Some(ScanEvent::Lost(id)) if !json => println!("- {}", id),
                Some(_) => {}
                None => break,
            },
        }
    }

    let devices = manager.discovered_devices().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else {
        println!("Scan complete. Found {} device(s)", devices.len());
    }
    Ok(())
}

async fn run_connect(
    manager: &DiscoveryManager,
    id: DeviceId,
    pattern: Option<String>,
    interval: f64,
    shutdown: ShutdownReceiver,
) -> anyhow::Result<()> {
    let mut events = manager.subscribe();

    manager
        .connect_with_retry(&id)
        .await
        .with_context(|| format!("failed to connect to {}", id))?;
    println!("Connected to {}", id);

    let matrix = pattern
        .as_deref()
        .map(LedMatrix::from_pattern)
        .unwrap_or_else(LedMatrix::busy);
    manager.display_led_matrix(&id, &matrix, interval).await?;

    let shutdown = shutdown.wait();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(DiscoveryEvent::Gesture { id: from, event }) if from == id => {
                    println!("{:?} {}", event.gesture, event.value.map_or(String::new(), |v| v.to_string()));
                }
                Ok(DiscoveryEvent::ConnectionStateChanged { id: from, state, .. }) if from == id && !state.is_connected() => {
                    println!("{} is now {:?}", id, state);
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Dropped {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.disconnect(&id).await?;
    Ok(())
}

async fn run_watch(
    manager: &DiscoveryManager,
    names: Vec<String>,
    shutdown: ShutdownReceiver,
) -> anyhow::Result<()> {
    let filter = filter_with_names(manager.settings(), names);
    let mut stream = manager.start_continuous_discovery(filter).await?;
    let mut events = manager.subscribe();

    // 接続はループを止めないよう並行に進める
    let mut connecting: FuturesUnordered<LocalBoxFuture<'_, (DeviceId, blelink_common::Result<()>)>> =
        FuturesUnordered::new();

    let shutdown = shutdown.wait();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = stream.next() => match event {
                Some(ScanEvent::Found(device)) => {
                    info!("Found {} ({:?}), connecting", device.id, device.name);
                    connecting.push(connect_and_greet(manager, device.id).boxed_local());
                }
                Some(ScanEvent::Lost(id)) => info!("{} went out of range", id),
                Some(ScanEvent::Updated(_)) => {}
                None => break,
            },
            Some((id, result)) = connecting.next(), if !connecting.is_empty() => {
                if let Err(e) = result {
                    warn!("Could not connect to {}: {}", id, e);
                }
            }
            event = events.recv() => match event {
                Ok(DiscoveryEvent::Gesture { id, event }) => {
                    println!("{}  {:?} {}", id, event.gesture, event.value.map_or(String::new(), |v| v.to_string()));
                }
                Ok(DiscoveryEvent::ConnectionStateChanged { id, previous, state }) => {
                    info!("{}: {:?} -> {:?}", id, previous, state);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Dropped {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    if !connecting.is_empty() {
        info!("Abandoning {} connection attempt(s)", connecting.len());
    }
    Ok(())
}

/// 接続してLEDにビジー表示を出す
async fn connect_and_greet(
    manager: &DiscoveryManager,
    id: DeviceId,
) -> (DeviceId, blelink_common::Result<()>) {
    let result = match manager.connect_with_retry(&id).await {
        Ok(()) => manager.display_led_matrix(&id, &LedMatrix::busy(), 2.0).await,
        Err(e) => Err(e),
    };
    (id, result)
}
