/// Modbus Testbed
///
/// Headless runner: loads (or creates) the persisted configuration and
/// serves the Battery and Master simulators until Ctrl-C.

use anyhow::Result;
use log::{error, info, warn};
use tokio::signal;

use modbus_testbed::{ConfigStore, ServerManager, ServerName};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    println!("🚀 Modbus Testbed");
    println!("=================");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| modbus_testbed::config::DEFAULT_CONFIG_PATH.to_string());
    let config_store = ConfigStore::new(&config_path);

    let config = match config_store.load() {
        Ok(config) => config,
        Err(e) => {
            warn!("Configuration at {} is unusable ({}), falling back to defaults", config_path, e);
            config_store.regenerate_defaults()?
        }
    };

    info!(
        "Battery: {} unit {} | Master: {} unit {}",
        config.battery_server.endpoint(),
        config.battery_server.unit_id,
        config.master_server.endpoint(),
        config.master_server.unit_id
    );

    let mut manager = ServerManager::new(config);

    for name in [ServerName::Battery, ServerName::Master] {
        if let Err(e) = manager.start(name).await {
            // One server failing (e.g. port 502 without privileges) must
            // not take the other down.
            error!("{} did not start: {}", name, e);
        }
    }

    if !manager.is_running(ServerName::Battery) && !manager.is_running(ServerName::Master) {
        anyhow::bail!("Neither server started, giving up");
    }

    info!("Press Ctrl-C to stop");
    signal::ctrl_c().await?;

    info!("Shutting down");
    manager.stop_all().await?;
    Ok(())
}
