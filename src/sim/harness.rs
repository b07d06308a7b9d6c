//! CLI entry point for the simulation harness: scripted scenarios on the simulated plant
//! with CSV trace output.

use cablebot_rs::config::{load_or_default, Config};
use cablebot_rs::motion::controller::MotionSupervisor;
use cablebot_rs::simulation::SimRig;
use cablebot_rs::telemetry::TelemetryKind;
use cablebot_shared::{AxisId, MachineStatus};
use cablebot_simulator::trace::TraceRecorder;
use cablebot_simulator::{lock_plant, PlantConfig};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

/// Simulation Harness CLI
#[derive(Parser, Debug)]
#[command(name = "sim-harness", about = "Scripted winch scenarios on the simulated plant.")]
pub struct Cli {
    /// Path to a TOML config file (defaults are used when it does not exist)
    #[arg(short, long, default_value = "cablebot.toml")]
    config: String,

    /// Output directory for the CSV trace
    #[arg(short, long, default_value = "./sim_output")]
    output: PathBuf,

    /// Scenario to run
    #[arg(long, value_enum, default_value_t = Scenario::Home)]
    scenario: Scenario,

    /// Trace sample period in milliseconds
    #[arg(long, default_value_t = 50)]
    sample_ms: u64,

    /// Peak current noise of the plant (mA)
    #[arg(long, default_value_t = 20.0)]
    noise: f64,

    /// Jog target relative to the frame center, "x,y"
    #[arg(long, default_value = "200,100", value_parser = parse_point)]
    jog_to: (f64, f64),

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List available scenarios
    ListScenarios,
    /// Run the selected scenario (default)
    Run,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum Scenario {
    /// Retract all four belts
    Home,
    /// Home, then extend to the center
    Extend,
    /// Home, extend, hook up the sled and jog
    Jog,
    /// Home, extend, hook up the sled and run the full calibration
    Calibrate,
}

fn parse_point(s: &str) -> Result<(f64, f64), String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("Invalid point '{}': expected x,y", s))?;
    let x = x.trim().parse::<f64>().map_err(|e| format!("Invalid x in '{}': {}", s, e))?;
    let y = y.trim().parse::<f64>().map_err(|e| format!("Invalid y in '{}': {}", s, e))?;
    Ok((x, y))
}

struct Run {
    rig: SimRig,
    recorder: TraceRecorder<File>,
    sample: Duration,
    since_sample: Duration,
}

impl Run {
    /// Steps until `done` holds, the machine alarms, or `limit` passes.
    fn drive<F>(&mut self, label: &str, limit: Duration, mut done: F) -> bool
    where
        F: FnMut(&MotionSupervisor) -> bool,
    {
        let tick = self.rig.tick_interval();
        let mut elapsed = Duration::ZERO;
        while elapsed < limit {
            self.rig.step();
            elapsed += tick;
            self.since_sample += tick;
            if self.since_sample >= self.sample {
                self.since_sample = Duration::ZERO;
                if let Err(e) = self.recorder.record(&self.rig.trace_row()) {
                    tracing::warn!("Failed to write trace row: {}", e);
                }
            }
            if self.rig.supervisor.status() == MachineStatus::Alarm {
                println!("{}: machine alarmed: {:?}", label, self.rig.supervisor.last_fault());
                return false;
            }
            if done(&self.rig.supervisor) {
                println!("{}: done after {:.2} s", label, elapsed.as_secs_f64());
                return true;
            }
        }
        println!("{}: gave up after {:.0} s", label, limit.as_secs_f64());
        false
    }

    fn idle(supervisor: &MotionSupervisor) -> bool {
        supervisor.status() == MachineStatus::Idle && supervisor.mode().is_idle()
    }

    fn home(&mut self) -> bool {
        if let Err(e) = self.rig.supervisor.retract_all() {
            println!("retract refused: {}", e);
            return false;
        }
        self.drive("home", Duration::from_secs(120), Self::idle)
    }

    fn extend(&mut self) -> bool {
        if let Err(e) = self.rig.supervisor.extend_all() {
            println!("extend refused: {}", e);
            return false;
        }
        self.drive("extend", Duration::from_secs(120), Self::idle)
    }

    /// Hooks the sled onto the belts at the frame center.
    fn attach(&mut self, config: &Config) {
        let center = self.rig.supervisor.geometry().center();
        lock_plant(&self.rig.plant).attach(center[0], center[1]);
        println!(
            "sled attached at ({:.1}, {:.1}) on a {}x{} frame",
            center[0], center[1], config.frame.width, config.frame.height
        );
    }

    fn jog(&mut self, x: f64, y: f64) -> bool {
        if let Err(e) = self.rig.supervisor.jog([x, y, 0.0]) {
            println!("jog refused: {}", e);
            return false;
        }
        self.drive("jog", Duration::from_secs(30), |s| {
            AxisId::ALL.iter().all(|axis| s.axis(*axis).on_target(0.25))
        })
    }

    fn calibrate(&mut self) -> bool {
        if let Err(e) = self.rig.supervisor.calibrate() {
            println!("calibration refused: {}", e);
            return false;
        }
        let finished = self.drive("calibrate", Duration::from_secs(4 * 3600), Self::idle);
        for event in self.rig.supervisor.telemetry().iter() {
            match &event.kind {
                TelemetryKind::CalibrationFinished { accepted, fit_error, anchors, data } => {
                    println!(
                        "calibration finished: accepted={} fit_error={:?} points={}",
                        accepted,
                        fit_error,
                        data.len()
                    );
                    if let Some(anchors) = anchors {
                        for (name, anchor) in ["TL", "TR", "BL", "BR"].iter().zip(anchors.iter()) {
                            println!("  {} ({:.2}, {:.2})", name, anchor.x, anchor.y);
                        }
                    }
                }
                TelemetryKind::CalibrationAborted { waypoint, reason } => {
                    println!("calibration aborted at waypoint {}: {}", waypoint, reason);
                }
                _ => {}
            }
        }
        finished
    }
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    if let Some(Commands::ListScenarios) = cli.command {
        for scenario in Scenario::value_variants() {
            if let Some(value) = scenario.to_possible_value() {
                println!("{:<10} {}", value.get_name(), value.get_help().map(|h| h.to_string()).unwrap_or_default());
            }
        }
        return;
    }

    let config = match load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&cli.output) {
        eprintln!("Failed to create output directory {}: {e}", cli.output.display());
        std::process::exit(1);
    }
    let trace_path = cli.output.join(format!("{:?}.csv", cli.scenario).to_lowercase());
    let recorder = match TraceRecorder::create(&trace_path) {
        Ok(recorder) => recorder,
        Err(e) => {
            eprintln!("Failed to create {}: {e}", trace_path.display());
            std::process::exit(1);
        }
    };

    println!("Running scenario: {:?}", cli.scenario);
    let plant = PlantConfig::from_config(&config).with_noise(cli.noise);
    let mut run = Run {
        rig: SimRig::new(&config, plant),
        recorder,
        sample: Duration::from_millis(cli.sample_ms.max(1)),
        since_sample: Duration::ZERO,
    };

    let ok = match cli.scenario {
        Scenario::Home => run.home(),
        Scenario::Extend => run.home() && run.extend(),
        Scenario::Jog => {
            run.home() && run.extend() && {
                run.attach(&config);
                run.jog(cli.jog_to.0, cli.jog_to.1)
            }
        }
        Scenario::Calibrate => {
            run.home() && run.extend() && {
                run.attach(&config);
                run.calibrate()
            }
        }
    };

    match serde_json::to_string_pretty(&run.rig.supervisor.snapshot()) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize snapshot: {e}"),
    }
    let rows = run.recorder.rows();
    if let Err(e) = run.recorder.into_inner() {
        eprintln!("Failed to flush trace: {e}");
    }
    println!("Trace: {} rows in {}", rows, trace_path.display());
    if !ok {
        std::process::exit(2);
    }
}
