//! Hardware trait implementations backed by the shared plant.

use super::{lock_plant, SharedPlant};
use cablebot_shared::hardware_traits::{AbsoluteEncoder, BoardIo, MotorDriver, PWM_MAX};
use cablebot_shared::AxisId;

pub struct SimEncoder {
    plant: SharedPlant,
    axis: AxisId,
    last_count: i64,
}

impl SimEncoder {
    pub fn new(plant: SharedPlant, axis: AxisId) -> Self {
        Self { plant, axis, last_count: 0 }
    }
}

impl AbsoluteEncoder for SimEncoder {
    fn is_connected(&mut self) -> bool {
        lock_plant(&self.plant).encoder_count(self.axis).is_some()
    }

    fn cumulative_position(&mut self) -> i64 {
        if let Some(count) = lock_plant(&self.plant).encoder_count(self.axis) {
            self.last_count = count;
        }
        self.last_count
    }

    fn reset_cumulative_position(&mut self, position: i64) {
        lock_plant(&self.plant).reset_encoder(self.axis, position);
        self.last_count = position;
    }
}

pub struct SimMotor {
    plant: SharedPlant,
    axis: AxisId,
}

impl SimMotor {
    pub fn new(plant: SharedPlant, axis: AxisId) -> Self {
        Self { plant, axis }
    }
}

impl MotorDriver for SimMotor {
    fn forward(&mut self, pwm: u16) {
        lock_plant(&self.plant).set_pwm(self.axis, pwm.min(PWM_MAX) as i32);
    }

    fn backward(&mut self, pwm: u16) {
        lock_plant(&self.plant).set_pwm(self.axis, -(pwm.min(PWM_MAX) as i32));
    }

    fn stop(&mut self) {
        lock_plant(&self.plant).set_pwm(self.axis, 0);
    }

    fn full_out(&mut self) {
        self.forward(PWM_MAX);
    }

    fn read_current(&mut self) -> f64 {
        lock_plant(&self.plant).read_current(self.axis)
    }
}

pub struct SimBoard {
    plant: SharedPlant,
}

impl SimBoard {
    pub fn new(plant: SharedPlant) -> Self {
        Self { plant }
    }
}

impl BoardIo for SimBoard {
    fn set_cooling_fan(&mut self, on: bool) {
        lock_plant(&self.plant).set_fan(on);
    }

    fn servo_fault(&mut self) -> bool {
        lock_plant(&self.plant).servo_fault()
    }
}

/// Encoder and motor for one axis, boxed for the control core.
pub fn axis_devices(plant: &SharedPlant, axis: AxisId) -> (Box<dyn AbsoluteEncoder>, Box<dyn MotorDriver>) {
    (
        Box::new(SimEncoder::new(plant.clone(), axis)),
        Box::new(SimMotor::new(plant.clone(), axis)),
    )
}
