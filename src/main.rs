use std::path::PathBuf;

use clap::Parser;
use log::{LevelFilter, debug, error, info, trace, warn};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;

mod actions;
mod config;
mod devices;
mod hci;
mod manager;
mod messages;
mod monitor;
mod mqtt;
mod presence;
mod sampler;
mod scanner;
mod settings;
mod stop;

use messages::{Announcement, RemoteCommand};
use settings::SharedSettings;

/// Bluetooth proximity automation: lock, mute and pause when your phone
/// walks away, undo it when it comes back.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable proximity sampling at start, whatever the config says
    #[arg(short, long)]
    enable: bool,

    /// Log debug output (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

fn reload(cli: &Cli, settings: &SharedSettings) {
    match config::AppConfig::load(&cli.config) {
        Ok(config) => {
            let enabled = settings.snapshot().enabled;
            let mut params = config.sampling_parameters();
            // The enabled flag is runtime state; a reload doesn't flip it.
            params.enabled = enabled;
            info!("Reloaded configuration from {}", cli.config.display());
            debug!("{:?}", params);
            settings.replace(params);
        }
        Err(err) => error!("Keeping current configuration: {:#}", err),
    }
}

fn apply_remote(command: RemoteCommand, settings: &SharedSettings) {
    info!("Remote command: {:?}", command);
    settings.update(|p| p.enabled = command == RemoteCommand::Enable);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = config::AppConfig::load(&cli.config)?;
    let mut params = config.sampling_parameters();
    if cli.enable {
        params.enabled = true;
    }
    match params.target_address.as_deref() {
        Some(address) => info!("Device: {} ({})", config.device_name(), address),
        None => warn!("No device address configured; pick one from the paired devices below"),
    }
    let sampler = sampler::HciSampler::new(
        sampler::KernelTransport,
        params.adapter_index,
        params.connect_timeout,
    );
    let settings = SharedSettings::new(params);

    let action_config = config.actions.clone().unwrap_or_default();
    let here = action_config.here.unwrap_or_default();
    let away = action_config.away.unwrap_or_default();
    for tool in actions::missing_tools(&here, &away) {
        warn!("{} not found in PATH, actions using it will fail", tool);
    }

    let (tx, mut rx) = broadcast::channel(32);
    let mut dispatcher = actions::Dispatcher::new(
        here,
        away,
        actions::SystemShell,
        tx.clone(),
        settings.clone(),
    );

    let (remote_tx, mut remote_rx) = broadcast::channel(8);
    let mqtt_client = match &config.mqtt {
        Some(mqtt_config) => {
            let (client, mut eventloop) = mqtt::MqttClient::new(mqtt_config);
            client.subscribe().await?;
            let loop_client = client.clone();
            let loop_tx = remote_tx.clone();
            tokio::task::spawn(async move {
                loop_client.event_loop(&mut eventloop, loop_tx).await;
            });
            dispatcher = dispatcher.with_mqtt(client.clone());
            Some(client)
        }
        None => None,
    };

    let core = manager::Manager::start(
        sampler,
        devices::BluetoothctlEnumerator::new(),
        dispatcher,
        settings.clone(),
        tx,
    )?;

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut adapter_usable = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = terminate.recv() => {
                info!("Terminated, shutting down");
                break;
            }
            _ = hangup.recv() => reload(&cli, &settings),
            Ok(command) = remote_rx.recv() => apply_remote(command, &settings),
            msg = rx.recv() => match msg {
                Ok(Announcement::Signal(rssi)) => trace!("Signal: {:?}", rssi),
                Ok(Announcement::Presence(presence)) => debug!("Presence: {:?}", presence),
                Ok(Announcement::DeviceListChanged(devices)) => {
                    info!("Found {} paired devices", devices.len());
                    for device in devices {
                        info!("  {}", device);
                    }
                }
                Ok(Announcement::AdapterUsable(usable)) => {
                    if adapter_usable != Some(usable) {
                        if usable {
                            info!("Bluetooth available");
                        } else {
                            warn!("Bluetooth unavailable, device selection disabled");
                        }
                        adapter_usable = Some(usable);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Announcement receiver lagged by {}", n)
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Announcement channel closed");
                    break;
                }
            },
        }
    }

    core.shutdown()?;

    if let Some(client) = mqtt_client {
        if let Err(err) = client.disconnect().await {
            error!("Error disconnecting MQTT client: {:?}", err);
        }
    }

    Ok(())
}
