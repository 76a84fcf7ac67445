//! Proportional–integral–derivative controller.

/// PID controller with a clamped integral term.
///
/// Drives the frequency correction from the filtered clock offset. The
/// derivative gain defaults to zero in this daemon, making it a PI
/// controller in practice; the derivative path is still implemented for
/// configurations that want it.
///
/// `update` takes the error and an optional timestamp in seconds. When
/// timestamps are provided the integral and derivative terms scale with the
/// real inter-sample interval; without them a unit interval is assumed
/// (appropriate for a 1 Hz pulse source).
#[derive(Debug, Clone)]
pub struct PidFilter {
    kp: f64,
    ki: f64,
    kd: f64,
    integral_max: f64,
    integral: f64,
    prev_error: Option<f64>,
    prev_time: Option<f64>,
}

impl PidFilter {
    /// # Panics
    ///
    /// Panics if `integral_max` is not positive.
    pub fn new(kp: f64, ki: f64, kd: f64, integral_max: f64) -> Self {
        assert!(integral_max > 0.0, "integral clamp must be positive");
        Self {
            kp,
            ki,
            kd,
            integral_max,
            integral: 0.0,
            prev_error: None,
            prev_time: None,
        }
    }

    /// Feeds one error sample and returns the control output.
    pub fn update(&mut self, error: f64, time_secs: Option<f64>) -> f64 {
        let dt = match (time_secs, self.prev_time) {
            (Some(now), Some(prev)) if now > prev => now - prev,
            _ => 1.0,
        };

        self.integral = (self.integral + error * dt)
            .clamp(-self.integral_max, self.integral_max);

        let derivative = match self.prev_error {
            Some(prev) => (error - prev) / dt,
            None => 0.0,
        };

        self.prev_error = Some(error);
        self.prev_time = time_secs;

        self.kp * error + self.ki * self.integral + self.kd * derivative
    }

    /// Clears the integral and derivative history.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = None;
        self.prev_time = None;
    }

    /// Replaces the controller gains, keeping accumulated state.
    pub fn set_gains(&mut self, kp: f64, ki: f64, kd: f64) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    /// Current integral accumulator value.
    pub fn integral(&self) -> f64 {
        self.integral
    }
}
