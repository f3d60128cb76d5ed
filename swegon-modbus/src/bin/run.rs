use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use swegon_modbus::{
    client::DeviceClient, config::Config, coordinator::Coordinator,
    modbus::{connection::ModbusTransport, Value}, profile::DeviceProfile, shutdown, Error, Result,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[clap(
    name = "swegon-modbus",
    version,
    author,
    about = "Polls a Swegon CASA ventilation unit over Modbus"
)]
struct Cli {
    /// Path to the JSON configuration file
    #[clap(env = "SWEGON_CONFIG", value_hint = clap::ValueHint::FilePath)]
    config: PathBuf,

    /// Write a value once the unit has been read, e.g. `--set Temp_SP=21.5`
    #[clap(long = "set", value_name = "KEY=VALUE", value_parser = parse_assignment)]
    set: Vec<(String, f64)>,
}

fn parse_assignment(s: &str) -> std::result::Result<(String, f64), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    let value = value
        .trim()
        .parse()
        .map_err(|error| format!("invalid value for {key}: {error}"))?;
    Ok((key.trim().to_owned(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Cli::parse();

    let config = Config::from_path(&args.config)?;
    let profile = DeviceProfile::resolve(&config.device);
    if profile.is_empty() {
        warn!(device = %config.device, "No register profile for this device, nothing will be polled");
    }

    let client = DeviceClient::new(ModbusTransport::new(config.connection.clone()), profile);
    let (metadata_tx, mut metadata_rx) = mpsc::channel(1);
    let coordinator = Arc::new(Coordinator::new(
        config.name(),
        client,
        config.settings,
        metadata_tx,
    ));

    let (trigger, shutdown) = shutdown::channel();
    let poller = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run(shutdown).await })
    };

    let mut snapshots = coordinator.subscribe();
    let mut pending = args.set;
    let mut previous = snapshots.borrow().clone();

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                let mut changes: Vec<(&str, Value)> = snapshot
                    .iter()
                    .filter(|&(key, value)| previous.get(key) != Some(value))
                    .map(|(key, value)| (*key, *value))
                    .collect();
                changes.sort_by_key(|&(key, _)| key);
                for (key, value) in changes {
                    info!(key, %value, "Value changed");
                }
                previous = snapshot;

                if !pending.is_empty() && !previous.is_empty() {
                    for (key, value) in pending.drain(..) {
                        if !coordinator.write_value(&key, value).await {
                            warn!(key, value, "Could not apply --set");
                        }
                    }
                }
            }
            Some(metadata) = metadata_rx.recv() => {
                info!(
                    manufacturer = metadata.manufacturer,
                    model = %metadata.model,
                    serial_number = %metadata.serial_number,
                    firmware = %metadata.firmware,
                    "Registered device"
                );
                debug!(?metadata);
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutting down");
                break;
            }
        }
    }

    trigger.fire();
    poller
        .await
        .map_err(|error| Error::Other(error.to_string().into()))?;

    Ok(())
}
