pub mod clock;
pub mod devices;

use cablebot_shared::config::Config;
use cablebot_shared::hardware_traits::PWM_MAX;
use cablebot_shared::{AxisId, Point3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub type SharedPlant = Arc<Mutex<WinchPlant>>;

/// Locks the plant, recovering the data if a previous holder panicked.
pub fn lock_plant(plant: &SharedPlant) -> MutexGuard<'_, WinchPlant> {
    plant.lock().unwrap_or_else(|e| e.into_inner())
}

/// Physical parameters of the simulated machine.
#[derive(Debug, Clone)]
pub struct PlantConfig {
    /// True anchor positions, indexed by `AxisId::index`.
    pub anchors: [Point3; 4],
    /// Belt end extension plus arm length.
    pub belt_offset: f64,
    pub mm_per_revolution: f64,
    pub encoder_counts_per_revolution: u32,
    /// Belt speed at full PWM (mm/s).
    pub max_speed: f64,
    pub idle_current: f64,
    pub load_current_gain: f64,
    pub stall_current_base: f64,
    pub stall_current_gain: f64,
    /// Peak amplitude of the uniform current noise.
    pub current_noise: f64,
    pub seed: u64,
    /// Belt paid out at power-on (mm beyond the fully retracted stop).
    pub initial_payout: [f64; 4],
    /// Loose belt a spool can push out past the span before the coil binds (mm).
    pub loose_belt_limit: f64,
}

impl PlantConfig {
    /// A rectangular frame matching the configured width/height.
    pub fn from_config(config: &Config) -> Self {
        let w = config.frame.width;
        let h = config.frame.height;
        let anchors = match &config.frame.anchors {
            Some(a) => [a.top_left, a.top_right, a.bottom_left, a.bottom_right],
            None => [
                Point3::new(0.0, h, 0.0),
                Point3::new(w, h, 0.0),
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(w, 0.0, 0.0),
            ],
        };
        Self {
            anchors,
            belt_offset: config.frame.belt_end_extension + config.frame.arm_length,
            mm_per_revolution: config.axis.mm_per_revolution,
            encoder_counts_per_revolution: config.axis.encoder_counts_per_revolution,
            ..Self::default()
        }
    }

    pub fn with_anchors(mut self, anchors: [Point3; 4]) -> Self {
        self.anchors = anchors;
        self
    }

    pub fn with_initial_payout(mut self, payout: f64) -> Self {
        self.initial_payout = [payout; 4];
        self
    }

    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.current_noise = amplitude;
        self
    }
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            anchors: [
                Point3::new(0.0, 2000.0, 0.0),
                Point3::new(3000.0, 2000.0, 0.0),
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(3000.0, 0.0, 0.0),
            ],
            belt_offset: 153.4,
            mm_per_revolution: 44.0,
            encoder_counts_per_revolution: 4096,
            max_speed: 60.0,
            idle_current: 600.0,
            load_current_gain: 0.3,
            stall_current_base: 300.0,
            stall_current_gain: 4.0,
            current_noise: 20.0,
            seed: 7,
            initial_payout: [800.0; 4],
            loose_belt_limit: 25.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Spool {
    payout: f64,
    pwm: i32,
    stalled: bool,
    count_offset: i64,
    encoder_disconnected: bool,
    current_override: Option<f64>,
}

/// Four spools and, once attached, the sled they hold.
///
/// A belt can never be longer than the distance it spans: spools reeling in pull the
/// sled, and spools that are not reeling in get dragged out when the sled moves away.
/// When the reeling spools cannot all be satisfied they stall, which raises their
/// current draw. With the sled attached, a spool driven outward only unwinds up to
/// `loose_belt_limit` past the span; beyond that it pays out only what the sled pulls.
#[derive(Debug)]
pub struct WinchPlant {
    config: PlantConfig,
    spools: [Spool; 4],
    sled: Option<[f64; 2]>,
    fan_on: bool,
    servo_fault: bool,
    elapsed: Duration,
    rng: StdRng,
}

impl WinchPlant {
    pub fn new(config: PlantConfig) -> Self {
        let mut spools: [Spool; 4] = Default::default();
        for (spool, payout) in spools.iter_mut().zip(config.initial_payout) {
            spool.payout = payout.max(0.0);
        }
        let rng = StdRng::seed_from_u64(config.seed);
        tracing::info!("Winch plant initialized with payout {:?}", config.initial_payout);
        Self {
            config,
            spools,
            sled: None,
            fan_on: false,
            servo_fault: false,
            elapsed: Duration::ZERO,
            rng,
        }
    }

    pub fn shared(self) -> SharedPlant {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &PlantConfig {
        &self.config
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn payout(&self, axis: AxisId) -> f64 {
        self.spools[axis.index()].payout
    }

    pub fn pwm(&self, axis: AxisId) -> i32 {
        self.spools[axis.index()].pwm
    }

    pub fn is_stalled(&self, axis: AxisId) -> bool {
        self.spools[axis.index()].stalled
    }

    pub fn sled_position(&self) -> Option<[f64; 2]> {
        self.sled
    }

    /// True length from the anchor to the sled, including the fixed offsets.
    pub fn span(&self, axis: AxisId) -> Option<f64> {
        self.sled.map(|p| self.distance(axis.index(), p))
    }

    pub fn fan_on(&self) -> bool {
        self.fan_on
    }

    /// Hooks the belts onto the sled at `(x, y)`. Belts that are too short are paid out.
    pub fn attach(&mut self, x: f64, y: f64) {
        let p = [x, y];
        for i in 0..4 {
            let needed = self.distance(i, p) - self.config.belt_offset;
            if self.spools[i].payout < needed {
                self.spools[i].payout = needed;
            }
        }
        self.sled = Some(p);
        tracing::info!("Sled attached at ({:.1}, {:.1})", x, y);
    }

    pub fn detach(&mut self) {
        self.sled = None;
    }

    pub fn set_pwm(&mut self, axis: AxisId, pwm: i32) {
        let limit = PWM_MAX as i32;
        self.spools[axis.index()].pwm = pwm.clamp(-limit, limit);
    }

    pub fn inject_current(&mut self, axis: AxisId, current: Option<f64>) {
        self.spools[axis.index()].current_override = current;
    }

    pub fn set_encoder_connected(&mut self, axis: AxisId, connected: bool) {
        self.spools[axis.index()].encoder_disconnected = !connected;
    }

    pub fn set_servo_fault(&mut self, fault: bool) {
        self.servo_fault = fault;
    }

    pub(crate) fn set_fan(&mut self, on: bool) {
        self.fan_on = on;
    }

    pub(crate) fn servo_fault(&self) -> bool {
        self.servo_fault
    }

    pub fn read_current(&mut self, axis: AxisId) -> f64 {
        let spool = &self.spools[axis.index()];
        if let Some(current) = spool.current_override {
            return current;
        }
        let magnitude = spool.pwm.unsigned_abs() as f64;
        let mut current = self.config.idle_current + self.config.load_current_gain * magnitude;
        if spool.stalled {
            current += self.config.stall_current_base + self.config.stall_current_gain * magnitude;
        }
        let noise = self.config.current_noise;
        if noise > 0.0 {
            current += self.rng.random_range(-noise..=noise);
        }
        current.max(0.0)
    }

    pub fn encoder_count(&self, axis: AxisId) -> Option<i64> {
        let spool = &self.spools[axis.index()];
        if spool.encoder_disconnected {
            return None;
        }
        Some(self.raw_count(spool.payout) - spool.count_offset)
    }

    pub fn reset_encoder(&mut self, axis: AxisId, position: i64) {
        let raw = self.raw_count(self.spools[axis.index()].payout);
        self.spools[axis.index()].count_offset = raw - position;
    }

    /// Advances the plant by `dt`.
    pub fn step(&mut self, dt: Duration) {
        self.elapsed += dt;
        let dt_s = dt.as_secs_f64();
        let mut proposed = [0.0; 4];
        for (i, spool) in self.spools.iter_mut().enumerate() {
            spool.stalled = false;
            let speed = spool.pwm as f64 / PWM_MAX as f64 * self.config.max_speed;
            let mut next = spool.payout + speed * dt_s;
            if next < 0.0 {
                next = 0.0;
                spool.stalled = spool.pwm < 0;
            }
            proposed[i] = next;
        }

        if let Some(previous) = self.sled {
            let reeling: Vec<usize> = (0..4).filter(|&i| self.spools[i].pwm < 0).collect();
            let mut sled = previous;
            for _ in 0..40 {
                for &i in &reeling {
                    sled = self.project_inside(i, sled, proposed[i] + self.config.belt_offset);
                }
            }
            let feasible = reeling
                .iter()
                .all(|&i| self.distance(i, sled) <= proposed[i] + self.config.belt_offset + 1e-3);
            if !feasible {
                sled = previous;
                for &i in &reeling {
                    let needed = self.distance(i, previous) - self.config.belt_offset;
                    if proposed[i] < needed {
                        proposed[i] = needed;
                        self.spools[i].stalled = true;
                    }
                }
            }
            for i in 0..4 {
                if self.spools[i].pwm >= 0 {
                    let needed = self.distance(i, sled) - self.config.belt_offset;
                    if self.spools[i].pwm > 0 {
                        let loose = self.spools[i].payout.max(needed + self.config.loose_belt_limit);
                        proposed[i] = proposed[i].min(loose);
                    }
                    if proposed[i] < needed {
                        proposed[i] = needed;
                    }
                }
            }
            self.sled = Some(sled);
        }

        for (spool, payout) in self.spools.iter_mut().zip(proposed) {
            spool.payout = payout;
        }
    }

    fn raw_count(&self, payout: f64) -> i64 {
        let counts = self.config.encoder_counts_per_revolution as f64;
        (-payout * counts / self.config.mm_per_revolution).round() as i64
    }

    fn distance(&self, i: usize, p: [f64; 2]) -> f64 {
        self.config.anchors[i].distance_to(&Point3::new(p[0], p[1], 0.0))
    }

    /// Moves `p` onto the belt's reach circle if it lies outside it.
    fn project_inside(&self, i: usize, p: [f64; 2], length: f64) -> [f64; 2] {
        let anchor = self.config.anchors[i];
        let planar = (length * length - anchor.z * anchor.z).max(0.0).sqrt();
        let dx = p[0] - anchor.x;
        let dy = p[1] - anchor.y;
        let d = (dx * dx + dy * dy).sqrt();
        if d <= planar || d == 0.0 {
            return p;
        }
        let scale = planar / d;
        [anchor.x + dx * scale, anchor.y + dy * scale]
    }
}
