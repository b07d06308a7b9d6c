// Trait-based interfaces for the winch hardware (shared)
//
// The control core only talks to the bus drivers through these traits. The simulator
// implements them against a plant model; real builds implement them over I2C/PWM.

/// Maximum magnitude accepted by `MotorDriver` commands.
pub const PWM_MAX: u16 = 1023;

/// Multi-turn absolute encoder on the spool shaft.
pub trait AbsoluteEncoder: Send {
    /// False when the device does not answer on the bus.
    fn is_connected(&mut self) -> bool;
    /// Accumulated counts since the last reset, across full turns.
    fn cumulative_position(&mut self) -> i64;
    /// Redefines the accumulated count; used to move the datum.
    fn reset_cumulative_position(&mut self, position: i64);
}

/// Bidirectional H-bridge driving one spool. `forward` pays belt out.
pub trait MotorDriver: Send {
    fn forward(&mut self, pwm: u16);
    fn backward(&mut self, pwm: u16);
    fn stop(&mut self);
    fn full_out(&mut self);
    /// Instantaneous current sense reading in driver units.
    fn read_current(&mut self) -> f64;

    /// Signed drive: positive pays out, negative reels in, zero stops.
    fn run_at_pwm(&mut self, pwm: i32) {
        let magnitude = pwm.unsigned_abs().min(PWM_MAX as u32) as u16;
        if pwm > 0 {
            self.forward(magnitude);
        } else if pwm < 0 {
            self.backward(magnitude);
        } else {
            self.stop();
        }
    }
}

/// Board-level outputs and inputs that are not tied to one axis.
pub trait BoardIo: Send {
    fn set_cooling_fan(&mut self, on: bool);
    /// True while the servo driver reports a fault.
    fn servo_fault(&mut self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        last: Option<(char, u16)>,
    }

    impl MotorDriver for Recorder {
        fn forward(&mut self, pwm: u16) {
            self.last = Some(('f', pwm));
        }
        fn backward(&mut self, pwm: u16) {
            self.last = Some(('b', pwm));
        }
        fn stop(&mut self) {
            self.last = Some(('s', 0));
        }
        fn full_out(&mut self) {
            self.forward(PWM_MAX);
        }
        fn read_current(&mut self) -> f64 {
            0.0
        }
    }

    #[test]
    fn run_at_pwm_maps_sign_to_direction() {
        let mut motor = Recorder::default();
        motor.run_at_pwm(200);
        assert_eq!(motor.last, Some(('f', 200)));
        motor.run_at_pwm(-5000);
        assert_eq!(motor.last, Some(('b', PWM_MAX)));
        motor.run_at_pwm(0);
        assert_eq!(motor.last, Some(('s', 0)));
    }
}
