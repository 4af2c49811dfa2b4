use std::sync::Arc;

use tracing::{info, warn};

mod api;
mod bus;
mod config;
mod hardware;
mod notify;
mod persist;
mod player;
mod process;
mod remote;
mod schedule;
mod state;
mod tda7318;

use api::{build_router, AppState};
use bus::{FilePowerSensor, I2cBus};
use config::Config;
use hardware::{ControllerConfig, DeviceStateController, Devices};
use player::{PlaybackSupervisor, PlayerConfig};
use process::CommandSpawner;
use remote::LircRemote;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let version = env!("CARGO_PKG_VERSION").to_string();
    let config = Config::from_env();

    let hardware = Arc::new(DeviceStateController::start(
        ControllerConfig { state_path: config.state_path.clone(), poll_interval: config.poll_interval },
        Devices {
            bus: Box::new(I2cBus::open(&config.i2c_bus, config.i2c_address)),
            sensor: Box::new(FilePowerSensor::new(&config.power_sensor)),
            remote: Arc::new(LircRemote::new(&config.lirc_socket, config.remote_name.clone())),
        },
    ));

    let player = Arc::new(PlaybackSupervisor::start(
        PlayerConfig {
            decoder: config.decoder.clone(),
            relay: config.relay.clone(),
            update_interval: config.player_update_interval,
        },
        Arc::new(CommandSpawner),
    ));

    let app = build_router(AppState { version: version.clone(), hardware: hardware.clone(), player: player.clone() });

    // Bind loopback by default; the front-end proxies to us.
    let addr = config.bind;
    info!("ampcontrol engine {version} starting on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    player.shutdown().await;
    hardware.shutdown().await;
    info!("ampcontrol engine stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
