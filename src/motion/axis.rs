// src/motion/axis.rs - one winch: encoder, motor driver and position loop

use crate::motion::pid::PositionPid;
use cablebot_shared::config::AxisConfig;
use cablebot_shared::hardware_traits::{AbsoluteEncoder, MotorDriver, PWM_MAX};
use cablebot_shared::AxisId;
use std::time::{Duration, Instant};

/// Working variables of the self-limiting pull.
#[derive(Debug, Clone)]
struct RetractState {
    speed: u16,
    baseline: f64,
    threshold_hits: u32,
    ramp_toggle: bool,
    last_call: Option<Instant>,
    tight: bool,
}

impl RetractState {
    fn new(initial_baseline: f64) -> Self {
        Self {
            speed: 0,
            baseline: initial_baseline,
            threshold_hits: 0,
            ramp_toggle: true,
            last_call: None,
            tight: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ComplyState {
    amount: f64,
    last_position: f64,
    last_call: Option<Instant>,
}

/// A single belt axis.
///
/// Every method that depends on time takes `now` from the caller; the unit never reads a
/// clock and never blocks.
pub struct AxisUnit {
    id: AxisId,
    encoder: Box<dyn AbsoluteEncoder>,
    motor: Box<dyn MotorDriver>,
    pid: PositionPid,
    config: AxisConfig,
    cumulative: i64,
    target: f64,
    command: f64,
    current_samples: Vec<f64>,
    next_sample: usize,
    current_timer: Option<Instant>,
    belt_speed: f64,
    speed_timer: Option<Instant>,
    speed_last_position: f64,
    retract: RetractState,
    comply: ComplyState,
    homed: bool,
}

impl AxisUnit {
    pub fn new(
        id: AxisId,
        config: &AxisConfig,
        encoder: Box<dyn AbsoluteEncoder>,
        motor: Box<dyn MotorDriver>,
    ) -> Self {
        let pid = PositionPid::new(config.kp, config.ki, config.kd).with_output_limit(config.output_limit);
        let mut axis = Self {
            id,
            encoder,
            motor,
            pid,
            config: config.clone(),
            cumulative: 0,
            target: 0.0,
            command: 0.0,
            current_samples: vec![0.0; config.current_buffer_len.max(1)],
            next_sample: 0,
            current_timer: None,
            belt_speed: 0.0,
            speed_timer: None,
            speed_last_position: 0.0,
            retract: RetractState::new(config.initial_baseline),
            comply: ComplyState::default(),
            homed: false,
        };
        axis.zero();
        axis
    }

    pub fn id(&self) -> AxisId {
        self.id
    }

    /// Reads the encoder. On a failed read the last position is kept and false is
    /// returned so the caller can tally it.
    pub fn update_encoder_position(&mut self) -> bool {
        if !self.encoder.is_connected() {
            tracing::debug!("Encoder read failure on {}", self.id);
            return false;
        }
        self.cumulative = self.encoder.cumulative_position();
        true
    }

    /// Belt paid out past the datum, in mm.
    pub fn position(&self) -> f64 {
        -(self.cumulative as f64) * self.config.mm_per_count()
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn set_target(&mut self, target: f64) {
        self.target = target;
    }

    pub fn position_error(&self) -> f64 {
        self.position() - self.target
    }

    pub fn on_target(&self, tolerance: f64) -> bool {
        (self.target - self.position()).abs() < tolerance
    }

    /// Last commanded PID output.
    pub fn motor_power(&self) -> f64 {
        self.command
    }

    /// Belt speed in mm/s, refreshed by `update`.
    pub fn belt_speed(&self) -> f64 {
        self.belt_speed
    }

    /// Mean of the rolling current buffer.
    pub fn motor_current(&self) -> f64 {
        self.current_samples.iter().sum::<f64>() / self.current_samples.len() as f64
    }

    pub fn is_homed(&self) -> bool {
        self.homed
    }

    pub fn set_homed(&mut self, homed: bool) {
        self.homed = homed;
    }

    /// Refreshes the belt-speed estimate and the current buffer when their sample
    /// periods have elapsed.
    pub fn update(&mut self, now: Instant) {
        let position = self.position();
        match self.speed_timer {
            Some(since) => {
                let elapsed = now.saturating_duration_since(since);
                if elapsed >= Duration::from_millis(self.config.speed_sample_ms) && !elapsed.is_zero() {
                    self.belt_speed = (position - self.speed_last_position) / elapsed.as_secs_f64();
                    self.speed_timer = Some(now);
                    self.speed_last_position = position;
                }
            }
            None => {
                self.speed_timer = Some(now);
                self.speed_last_position = position;
            }
        }

        let due = self
            .current_timer
            .is_none_or(|since| now.saturating_duration_since(since) >= Duration::from_millis(self.config.current_sample_ms));
        if due {
            self.current_timer = Some(now);
            self.current_samples[self.next_sample] = self.motor.read_current();
            self.next_sample = (self.next_sample + 1) % self.current_samples.len();
        }
    }

    /// Drives the motor from the position loop, optionally clamped to `max_output`.
    pub fn recompute_pid(&mut self, max_output: Option<f64>) -> f64 {
        let mut output = self.pid.output(self.position(), self.target);
        if let Some(max) = max_output {
            output = output.clamp(-max.abs(), max.abs());
        }
        self.command = output;
        self.motor.run_at_pwm(output.round() as i32);
        output
    }

    /// Reels the belt in with a slowly rising speed until the current shows it is taut.
    ///
    /// Once it has returned true it keeps the motor stopped and keeps returning true
    /// until `reset` or `zero`.
    pub fn pull_tight(&mut self, now: Instant) -> bool {
        if self.retract.tight {
            self.motor.stop();
            return true;
        }
        let interval = Duration::from_millis(self.config.current_sample_ms);
        if let Some(last) = self.retract.last_call {
            if now.saturating_duration_since(last) < interval {
                return false;
            }
        }
        self.retract.last_call = Some(now);

        if self.retract.ramp_toggle {
            self.retract.speed = (self.retract.speed + 1).min(self.config.retract_speed_cap.min(PWM_MAX));
        }
        self.retract.ramp_toggle = !self.retract.ramp_toggle;
        self.motor.backward(self.retract.speed);

        let current = self.motor.read_current();
        let alpha = self.config.baseline_alpha;
        self.retract.baseline = alpha * current + (1.0 - alpha) * self.retract.baseline;
        if current - self.retract.baseline > self.config.incremental_current_threshold {
            self.retract.threshold_hits += 1;
        } else {
            self.retract.threshold_hits = 0;
        }

        if self.retract.speed > self.config.retract_settle_speed
            && (current > self.config.absolute_current_threshold || self.retract.threshold_hits > 2)
        {
            tracing::debug!(
                "{} pulled tight at speed {} (current {:.0}, baseline {:.0})",
                self.id,
                self.retract.speed,
                current,
                self.retract.baseline
            );
            self.motor.stop();
            self.retract.speed = 0;
            self.retract.baseline = self.config.initial_baseline;
            self.retract.threshold_hits = 0;
            self.retract.ramp_toggle = true;
            self.retract.tight = true;
            return true;
        }
        false
    }

    /// Yields to an external pull: keeps paying out while the belt is being drawn out,
    /// winds the drive down when it is not. Calls inside the comply interval are ignored.
    pub fn comply(&mut self, now: Instant) -> bool {
        let interval = Duration::from_millis(self.config.comply_interval_ms);
        if let Some(last) = self.comply.last_call {
            if now.saturating_duration_since(last) < interval {
                return true;
            }
        }

        let position = self.position();
        let moved = position - self.comply.last_position;
        if moved > 0.001 {
            self.motor.forward(pwm_from(self.comply.amount));
            let cap = self.config.output_limit.min(PWM_MAX as f64);
            self.comply.amount = (self.comply.amount.max(self.config.comply_floor) * self.config.comply_growth).min(cap);
        } else {
            self.comply.amount /= self.config.comply_decay;
            self.motor.forward(pwm_from(self.comply.amount));
        }

        self.comply.last_position = position;
        self.comply.last_call = Some(now);
        true
    }

    /// Pulls tight and, once taut, makes the fully retracted position the new datum.
    pub fn retract(&mut self, now: Instant) -> bool {
        if self.pull_tight(now) {
            self.zero();
            return true;
        }
        false
    }

    /// Complies until the belt reaches `target_length`, then holds there.
    pub fn extend(&mut self, target_length: f64, now: Instant) -> bool {
        if self.position() < target_length {
            self.comply(now);
            return false;
        }
        let position = self.position();
        self.set_target(position);
        self.stop();
        tracing::info!("{} belt position after extend: {:.2}", self.id, position);
        true
    }

    /// Full speed outward; the caller times the window.
    pub fn decompress_belt(&mut self) {
        self.motor.full_out();
    }

    pub fn stop(&mut self) {
        self.motor.stop();
        self.command = 0.0;
    }

    /// Clears the pull and comply working state.
    pub fn reset(&mut self, now: Instant) {
        self.retract.speed = 0;
        self.retract.baseline = self.config.initial_baseline;
        self.retract.threshold_hits = 0;
        self.retract.ramp_toggle = true;
        self.retract.tight = false;
        self.comply.amount = 0.0;
        self.comply.last_position = self.position();
        self.speed_timer = Some(now);
        self.speed_last_position = self.position();
        self.pid.reset();
    }

    /// Redefines the datum at the current belt position.
    pub fn zero(&mut self) {
        self.encoder.reset_cumulative_position(0);
        self.cumulative = 0;
        self.retract.tight = false;
        self.comply.last_position = 0.0;
        self.speed_last_position = 0.0;
    }
}

fn pwm_from(amount: f64) -> u16 {
    amount.round().clamp(0.0, PWM_MAX as f64) as u16
}
