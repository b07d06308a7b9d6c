// src/machine.rs - host runtime: owns the supervisor and runs the tick loop

use crate::config::ConfigError;
use crate::motion::controller::MotionSupervisor;
use crate::telemetry::{write_json_lines, TelemetryEvent, DEFAULT_CAPACITY};
use crate::web::controller_channel::ControllerRequest;
use cablebot_simulator::{lock_plant, SharedPlant};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The supervisor plus whatever it runs on. Requests from the web layer are applied
/// between ticks, so the supervisor is only ever touched by the loop task.
pub struct Machine {
    supervisor: MotionSupervisor,
    plant: Option<SharedPlant>,
    tick_interval: Duration,
    events: VecDeque<TelemetryEvent>,
    telemetry_log: Option<File>,
}

impl Machine {
    pub fn new(supervisor: MotionSupervisor, tick_interval: Duration) -> Self {
        Self {
            supervisor,
            plant: None,
            tick_interval,
            events: VecDeque::with_capacity(DEFAULT_CAPACITY),
            telemetry_log: None,
        }
    }

    /// Steps this simulated plant by one tick interval before every control tick.
    pub fn with_plant(mut self, plant: SharedPlant) -> Self {
        self.plant = Some(plant);
        self
    }

    /// Appends every telemetry event to `path` as JSON lines.
    pub fn with_telemetry_log(mut self, path: &str) -> Result<Self, MachineError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        tracing::info!("Writing telemetry to {}", path);
        self.telemetry_log = Some(file);
        Ok(self)
    }

    pub fn supervisor(&self) -> &MotionSupervisor {
        &self.supervisor
    }

    pub fn tick(&mut self) {
        if let Some(plant) = &self.plant {
            lock_plant(plant).step(self.tick_interval);
        }
        self.supervisor.tick();
        self.collect_events();
    }

    fn collect_events(&mut self) {
        if self.supervisor.telemetry().is_empty() {
            return;
        }
        let drained = self.supervisor.telemetry_mut().drain();
        if let Some(file) = self.telemetry_log.as_mut() {
            if let Err(e) = write_json_lines(file, &drained) {
                tracing::warn!("Failed to write telemetry: {}", e);
            }
        }
        for event in drained {
            if self.events.len() == DEFAULT_CAPACITY {
                self.events.pop_front();
            }
            self.events.push_back(event);
        }
    }

    /// Applies one request. Returns false when the loop should stop.
    pub fn handle_request(&mut self, request: ControllerRequest) -> bool {
        match request {
            ControllerRequest::GetStatus { respond_to } => {
                let _ = respond_to.send(self.supervisor.snapshot());
            }
            ControllerRequest::Command { command, respond_to } => {
                tracing::info!("Command: {}", command.name());
                let result = self.supervisor.execute(command);
                self.collect_events();
                let _ = respond_to.send(result);
            }
            ControllerRequest::Jog { target, respond_to } => {
                let result = self.supervisor.jog(target);
                self.collect_events();
                let _ = respond_to.send(result);
            }
            ControllerRequest::DrainEvents { respond_to } => {
                self.collect_events();
                let _ = respond_to.send(self.events.drain(..).collect());
            }
            ControllerRequest::Shutdown => return false,
        }
        true
    }

    /// Runs until a `Shutdown` request arrives or every sender is gone.
    pub async fn run(mut self, mut requests: mpsc::Receiver<ControllerRequest>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("Control loop running every {:?}", self.tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                request = requests.recv() => match request {
                    Some(request) => {
                        if !self.handle_request(request) {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        self.supervisor.stop();
        self.collect_events();
        tracing::info!("Control loop stopped");
    }
}
