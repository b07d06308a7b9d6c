// src/safety.rs - per-tick interlocks and the encoder health tally

use crate::motion::axis::AxisUnit;
use cablebot_shared::config::SafetyConfig;
use cablebot_shared::{AxisId, MachineStatus};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;

/// Conditions that stop the machine.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultKind {
    #[error("overcurrent on {axis}: {current:.0} mA")]
    Overcurrent { axis: AxisId, current: f64 },
    #[error("belt slack on {axis}: power {power:.0} with no belt movement")]
    BeltSlack { axis: AxisId, power: f64 },
    #[error("encoder failure on {axis}: {failed} of {reads} reads failed")]
    EncoderFailure { axis: AxisId, failed: u32, reads: u32 },
    #[error("control loop stalled for {elapsed_ms} ms")]
    Liveness { elapsed_ms: u64 },
    #[error("stop requested: {reason}")]
    Requested { reason: String },
}

/// A non-fatal finding, reported once per trip window.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyFlag {
    pub axis: AxisId,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct SafetyReport {
    pub fault: Option<FaultKind>,
    pub flags: Vec<SafetyFlag>,
}

#[derive(Debug, Clone, Copy, Default)]
struct EncoderTally {
    reads: u32,
    failed: u32,
}

pub struct SafetyMonitor {
    config: SafetyConfig,
    overcurrent_ticks: [u32; 4],
    slack_ticks: [u32; 4],
    tripped: [bool; 4],
    position_flagged: [bool; 4],
    window_start: Option<Instant>,
    encoders: [EncoderTally; 4],
    encoder_window_start: Option<Instant>,
}

impl SafetyMonitor {
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            config: config.clone(),
            overcurrent_ticks: [0; 4],
            slack_ticks: [0; 4],
            tripped: [false; 4],
            position_flagged: [false; 4],
            window_start: None,
            encoders: [EncoderTally::default(); 4],
            encoder_window_start: None,
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Runs the current, slack and position checks on every axis.
    ///
    /// A fault is reported at most once per axis per trip window; the latches clear when
    /// the window rolls over, so a condition that persists trips again.
    pub fn check(&mut self, axes: &[AxisUnit; 4], status: MachineStatus, now: Instant) -> SafetyReport {
        self.roll_window(now);
        let mut report = SafetyReport::default();
        let moving = matches!(status, MachineStatus::Jog | MachineStatus::Cycle);

        for axis in axes {
            let i = axis.id().index();

            let current = axis.motor_current();
            if current > self.config.overcurrent_limit() {
                self.overcurrent_ticks[i] = self.overcurrent_ticks[i].saturating_add(1);
            } else {
                self.overcurrent_ticks[i] = 0;
            }

            let power = axis.motor_power();
            if power.abs() > self.config.slack_power_threshold && axis.belt_speed().abs() < self.config.slack_speed_threshold {
                self.slack_ticks[i] = self.slack_ticks[i].saturating_add(1);
            } else {
                self.slack_ticks[i] = 0;
            }

            if !self.tripped[i] {
                let fault = if self.overcurrent_ticks[i] > self.config.overcurrent_debounce {
                    Some(FaultKind::Overcurrent { axis: axis.id(), current })
                } else if self.slack_ticks[i] > self.config.slack_debounce {
                    Some(FaultKind::BeltSlack { axis: axis.id(), power })
                } else {
                    None
                };
                if let Some(fault) = fault {
                    self.tripped[i] = true;
                    tracing::error!("Safety trip: {}", fault);
                    if report.fault.is_none() {
                        report.fault = Some(fault);
                    }
                }
            }

            let error = axis.position_error();
            if moving && error.abs() > self.config.position_error_limit && !self.position_flagged[i] {
                self.position_flagged[i] = true;
                tracing::warn!("{} position error {:.2} mm", axis.id(), error);
                report.flags.push(SafetyFlag {
                    axis: axis.id(),
                    reason: format!("position error {:.2} mm", error),
                });
            }
        }
        report
    }

    fn roll_window(&mut self, now: Instant) {
        match self.window_start {
            Some(start) if now.saturating_duration_since(start) < self.config.trip_window() => {}
            Some(_) => {
                self.window_start = Some(now);
                self.tripped = [false; 4];
                self.position_flagged = [false; 4];
            }
            None => self.window_start = Some(now),
        }
    }

    /// Counts one round of encoder reads. At the end of each encoder window, an axis whose
    /// failure ratio is above the panic ratio yields a fault; above the warn ratio only
    /// logs.
    pub fn tally_encoders(&mut self, reads: [bool; 4], now: Instant) -> Option<FaultKind> {
        let start = *self.encoder_window_start.get_or_insert(now);
        for (tally, ok) in self.encoders.iter_mut().zip(reads) {
            tally.reads += 1;
            if !ok {
                tally.failed += 1;
            }
        }
        if now.saturating_duration_since(start) < self.config.encoder_window() {
            return None;
        }

        let mut fault = None;
        for axis in AxisId::ALL {
            let tally = self.encoders[axis.index()];
            if tally.reads == 0 {
                continue;
            }
            let ratio = tally.failed as f64 / tally.reads as f64;
            if ratio > self.config.encoder_panic_ratio {
                if fault.is_none() {
                    fault = Some(FaultKind::EncoderFailure {
                        axis,
                        failed: tally.failed,
                        reads: tally.reads,
                    });
                }
            } else if ratio > self.config.encoder_warn_ratio {
                tracing::warn!(
                    "Bad connection on {} encoder: {} of {} reads failed",
                    axis,
                    tally.failed,
                    tally.reads
                );
            }
        }
        self.encoders = [EncoderTally::default(); 4];
        self.encoder_window_start = Some(now);
        fault
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cablebot_shared::config::AxisConfig;
    use cablebot_simulator::{axis_devices, lock_plant, PlantConfig, SharedPlant, WinchPlant};
    use std::time::Duration;

    fn axes(plant: &SharedPlant) -> [AxisUnit; 4] {
        AxisId::ALL.map(|id| {
            let (encoder, motor) = axis_devices(plant, id);
            AxisUnit::new(id, &AxisConfig::default(), encoder, motor)
        })
    }

    fn plant() -> SharedPlant {
        WinchPlant::new(PlantConfig::default().with_noise(0.0).with_initial_payout(50.0)).shared()
    }

    #[test]
    fn overcurrent_needs_more_than_debounce_ticks() {
        let plant = plant();
        let mut axes = axes(&plant);
        let mut monitor = SafetyMonitor::new(&SafetyConfig::default());
        lock_plant(&plant).inject_current(AxisId::TopRight, Some(4001.0));
        let mut now = Instant::now();
        let mut trips = Vec::new();
        for tick in 0..40 {
            now += Duration::from_millis(5);
            for axis in axes.iter_mut() {
                axis.update(now);
            }
            if let Some(fault) = monitor.check(&axes, MachineStatus::Idle, now).fault {
                trips.push((tick, fault));
            }
        }
        assert_eq!(trips.len(), 1);
        // Ten samples to fill the buffer, then eleven over the limit.
        assert_eq!(trips[0].0, 19);
        assert!(matches!(trips[0].1, FaultKind::Overcurrent { axis: AxisId::TopRight, .. }));
    }

    #[test]
    fn current_at_the_limit_does_not_trip() {
        let plant = plant();
        let mut axes = axes(&plant);
        let mut monitor = SafetyMonitor::new(&SafetyConfig::default());
        lock_plant(&plant).inject_current(AxisId::BottomLeft, Some(4000.0));
        let mut now = Instant::now();
        for _ in 0..100 {
            now += Duration::from_millis(5);
            for axis in axes.iter_mut() {
                axis.update(now);
            }
            assert!(monitor.check(&axes, MachineStatus::Idle, now).fault.is_none());
        }
    }

    #[test]
    fn position_error_is_flagged_once_while_jogging() {
        let plant = plant();
        let mut axes = axes(&plant);
        axes[0].set_target(5.0);
        let mut monitor = SafetyMonitor::new(&SafetyConfig::default());
        let now = Instant::now();
        assert!(monitor.check(&axes, MachineStatus::Idle, now).flags.is_empty());
        let report = monitor.check(&axes, MachineStatus::Jog, now + Duration::from_millis(5));
        assert_eq!(report.flags.len(), 1);
        assert_eq!(report.flags[0].axis, AxisId::TopLeft);
        assert!(report.fault.is_none());
        assert!(monitor.check(&axes, MachineStatus::Jog, now + Duration::from_millis(10)).flags.is_empty());
        let later = now + Duration::from_millis(5100);
        assert_eq!(monitor.check(&axes, MachineStatus::Cycle, later).flags.len(), 1);
    }

    #[test]
    fn encoder_ratio_escalates_at_the_window_end() {
        let mut monitor = SafetyMonitor::new(&SafetyConfig::default());
        let start = Instant::now();
        let mut fault = None;
        for tick in 0..=200u64 {
            let now = start + Duration::from_millis(tick * 5);
            // BL fails two reads in three, TR one in five.
            let reads = [true, tick % 5 != 0, tick % 3 == 0, true];
            if let Some(f) = monitor.tally_encoders(reads, now) {
                fault = Some((tick, f));
                break;
            }
        }
        let (tick, fault) = fault.unwrap();
        assert_eq!(tick, 200);
        assert!(matches!(fault, FaultKind::EncoderFailure { axis: AxisId::BottomLeft, .. }));
    }

    #[test]
    fn fault_messages_name_the_axis() {
        let fault = FaultKind::Overcurrent { axis: AxisId::BottomRight, current: 4100.0 };
        assert_eq!(fault.to_string(), "overcurrent on BR: 4100 mA");
        assert_eq!(FaultKind::Liveness { elapsed_ms: 612 }.to_string(), "control loop stalled for 612 ms");
    }
}
