//! The supervisor wired to a simulated plant and a manual clock.
//!
//! Used by the integration tests, the `sim_harness` binary and the host when no
//! physical bus is attached.

use crate::config::Config;
use crate::motion::axis::AxisUnit;
use crate::motion::controller::MotionSupervisor;
use cablebot_shared::AxisId;
use cablebot_simulator::trace::TraceRow;
use cablebot_simulator::{axis_devices, lock_plant, PlantConfig, SharedPlant, SimBoard, SimClock, WinchPlant};
use std::sync::Arc;
use std::time::Duration;

pub struct SimRig {
    pub supervisor: MotionSupervisor,
    pub plant: SharedPlant,
    pub clock: SimClock,
    tick: Duration,
}

impl SimRig {
    pub fn new(config: &Config, plant: PlantConfig) -> Self {
        let plant = WinchPlant::new(plant).shared();
        let clock = SimClock::new();
        let supervisor = build_supervisor(config, &plant, Arc::new(clock.clone()));
        Self {
            supervisor,
            plant,
            clock,
            tick: Duration::from_millis(config.host.tick_interval_ms.max(1)),
        }
    }

    /// A plant built from the same frame as `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config, PlantConfig::from_config(config))
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick
    }

    /// Advances physics and the clock by one tick, then runs the supervisor.
    pub fn step(&mut self) {
        lock_plant(&self.plant).step(self.tick);
        self.clock.advance(self.tick);
        self.supervisor.tick();
    }

    pub fn run_for(&mut self, duration: Duration) {
        let ticks = (duration.as_secs_f64() / self.tick.as_secs_f64()).ceil() as u64;
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Steps until `done` holds or `limit` of simulated time has passed. Returns whether
    /// `done` was reached.
    pub fn run_until<F>(&mut self, limit: Duration, mut done: F) -> bool
    where
        F: FnMut(&MotionSupervisor) -> bool,
    {
        let start = self.clock.current_time();
        while self.clock.current_time() - start < limit {
            self.step();
            if done(&self.supervisor) {
                return true;
            }
        }
        false
    }

    /// One CSV row of the current state.
    pub fn trace_row(&self) -> TraceRow {
        let plant = lock_plant(&self.plant);
        let axis = |id: AxisId| self.supervisor.axis(id);
        let sled = plant.sled_position();
        TraceRow {
            time_s: self.clock.current_time().as_secs_f64(),
            status: self.supervisor.status().to_string(),
            mode: self.supervisor.mode().name().to_string(),
            tl_position: axis(AxisId::TopLeft).position(),
            tr_position: axis(AxisId::TopRight).position(),
            bl_position: axis(AxisId::BottomLeft).position(),
            br_position: axis(AxisId::BottomRight).position(),
            tl_current: axis(AxisId::TopLeft).motor_current(),
            tr_current: axis(AxisId::TopRight).motor_current(),
            bl_current: axis(AxisId::BottomLeft).motor_current(),
            br_current: axis(AxisId::BottomRight).motor_current(),
            sled_x: sled.map(|p| p[0]),
            sled_y: sled.map(|p| p[1]),
        }
    }
}

/// Four axes backed by `plant`, plus the board I/O.
pub fn build_supervisor(
    config: &Config,
    plant: &SharedPlant,
    clock: Arc<dyn cablebot_shared::TimeInterface>,
) -> MotionSupervisor {
    let axes = AxisId::ALL.map(|id| {
        let (encoder, motor) = axis_devices(plant, id);
        AxisUnit::new(id, &config.axis, encoder, motor)
    });
    MotionSupervisor::new(config, clock, axes).with_board(Box::new(SimBoard::new(plant.clone())))
}
