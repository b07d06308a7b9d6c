//! Position PID for one winch axis.
//!
//! Output is in PWM units: positive pays belt out, negative reels it in.

#[derive(Debug, Clone)]
pub struct PositionPid {
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    prev_measurement: Option<f64>,
    out_limit: f64,
}

impl PositionPid {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            integral: 0.0,
            prev_measurement: None,
            out_limit: f64::MAX,
        }
    }

    /// Symmetric clamp on the output and on the integrator.
    pub fn with_output_limit(mut self, limit: f64) -> Self {
        self.out_limit = limit.abs();
        self
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_measurement = None;
    }

    /// One controller step, called once per recompute.
    pub fn output(&mut self, measurement: f64, setpoint: f64) -> f64 {
        let error = setpoint - measurement;
        let p = self.kp * error;

        self.integral = (self.integral + self.ki * error).clamp(-self.out_limit, self.out_limit);

        // Derivative on measurement so setpoint jumps do not kick the output.
        let d = match self.prev_measurement {
            Some(prev) => self.kd * (prev - measurement),
            None => 0.0,
        };
        self.prev_measurement = Some(measurement);

        (p + self.integral + d).clamp(-self.out_limit, self.out_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proportional_only_by_default_tuning() {
        let mut pid = PositionPid::new(300.0, 0.0, 0.0).with_output_limit(1023.0);
        assert_eq!(pid.output(10.0, 11.0), 300.0);
        assert_eq!(pid.output(11.0, 10.0), -300.0);
        assert_eq!(pid.output(0.0, 100.0), 1023.0);
        assert_eq!(pid.output(100.0, 0.0), -1023.0);
    }

    #[test]
    fn integral_accumulates_and_clamps() {
        let mut pid = PositionPid::new(0.0, 10.0, 0.0).with_output_limit(25.0);
        assert_eq!(pid.output(0.0, 1.0), 10.0);
        assert_eq!(pid.output(0.0, 1.0), 20.0);
        assert_eq!(pid.output(0.0, 1.0), 25.0);
        pid.reset();
        assert_eq!(pid.output(0.0, 1.0), 10.0);
    }

    #[test]
    fn derivative_acts_on_measurement() {
        let mut pid = PositionPid::new(0.0, 0.0, 2.0);
        assert_eq!(pid.output(5.0, 0.0), 0.0);
        assert_eq!(pid.output(6.0, 0.0), -2.0);
    }
}
