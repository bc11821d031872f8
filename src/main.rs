use ble_auto_connect::domain::settings::{Settings, SettingsService};
use ble_auto_connect::infrastructure::bluetooth::peripheral::PeripheralDirectory;
use ble_auto_connect::infrastructure::bluetooth::SessionConfig;
use ble_auto_connect::infrastructure::logging;
use ble_auto_connect::presentation::console;
use std::sync::Arc;

#[cfg(feature = "btleplug")]
async fn open_directory(settings: &Settings) -> anyhow::Result<Arc<dyn PeripheralDirectory>> {
    use ble_auto_connect::infrastructure::bluetooth::hardware::HardwareDirectory;
    use std::time::Duration;

    let directory = HardwareDirectory::new(
        settings.device_name_prefix.clone(),
        Duration::from_millis(settings.scan_timeout_ms),
    )
    .await?;
    Ok(Arc::new(directory))
}

#[cfg(not(feature = "btleplug"))]
async fn open_directory(settings: &Settings) -> anyhow::Result<Arc<dyn PeripheralDirectory>> {
    use ble_auto_connect::infrastructure::bluetooth::simulator::{
        SimulatedDirectory, SimulatedPeripheral,
    };

    let name = settings
        .device_name_prefix
        .clone()
        .unwrap_or_else(|| "Simulated UART".to_string());
    tracing::info!("No BLE backend compiled in, using simulated device '{}'", name);
    Ok(Arc::new(SimulatedDirectory::with_device(
        SimulatedPeripheral::echo_device(name),
    )))
}

fn load_settings() -> SettingsService {
    match SettingsService::new() {
        Ok(service) => {
            if !service.path().exists() {
                if let Err(e) = service.save() {
                    eprintln!("Failed to write default settings: {}", e);
                }
            }
            service
        }
        Err(e) => {
            eprintln!("Failed to locate settings, using defaults: {}", e);
            SettingsService::from_path(std::path::PathBuf::from("settings.json"))
        }
    }
}

fn main() -> anyhow::Result<()> {
    let settings_service = load_settings();
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    tracing::info!("Starting BLE Auto Connect");
    tracing::debug!("Settings loaded from {}", settings_service.path().display());

    let config = SessionConfig::from_settings(&settings)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let directory = open_directory(&settings).await?;
        console::run(directory, config).await
    })
}
