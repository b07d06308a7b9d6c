// src/main.rs - cablebot host: control loop plus HTTP command surface

use cablebot_rs::config::load_or_default;
use cablebot_rs::machine::{Machine, MachineError};
use cablebot_rs::simulation::build_supervisor;
use cablebot_rs::web;
use cablebot_rs::web::controller_channel::ControllerRequest;
use cablebot_shared::StdTimeSync;
use cablebot_simulator::{PlantConfig, WinchPlant};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Cable-winch robot control host", long_about = None)]
struct Args {
    /// Path to the TOML config; built-in defaults are used when it does not exist
    #[arg(short, long, default_value = "cablebot.toml")]
    config: String,

    /// Address for the HTTP API, overriding `host.listen`
    #[arg(short, long)]
    listen: Option<String>,
}

fn log_level(name: &str) -> tracing::Level {
    name.parse().unwrap_or(tracing::Level::INFO)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let args = Args::parse();
    let config = load_or_default(&args.config).map_err(MachineError::from)?;

    tracing_subscriber::fmt()
        .with_max_level(log_level(&config.host.log_level))
        .init();
    tracing::info!("Starting cablebot host, config '{}'", args.config);
    tracing::info!(
        "Frame {}x{} mm, tick {} ms",
        config.frame.width,
        config.frame.height,
        config.host.tick_interval_ms
    );

    // Bus drivers are not part of this build; the axes run on the simulated plant.
    let plant = WinchPlant::new(PlantConfig::from_config(&config)).shared();
    let supervisor = build_supervisor(&config, &plant, Arc::new(StdTimeSync));
    let mut machine = Machine::new(supervisor, Duration::from_millis(config.host.tick_interval_ms)).with_plant(plant);
    if let Some(path) = &config.host.telemetry_log {
        machine = machine.with_telemetry_log(path)?;
    }

    let (controller_tx, controller_rx) = mpsc::channel::<ControllerRequest>(16);
    let machine_task = tokio::spawn(machine.run(controller_rx));

    let app = web::api::create_router(controller_tx.clone());
    let listen = args.listen.unwrap_or_else(|| config.host.listen.clone());
    let listener = tokio::net::TcpListener::bind(&listen).await.map_err(MachineError::from)?;
    tracing::info!("Web API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    let _ = controller_tx.send(ControllerRequest::Shutdown).await;
    machine_task.await?;
    Ok(())
}
