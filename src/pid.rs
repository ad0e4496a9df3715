//! PID position controller.
//!
//! Output is duty (signed, `±out_limit`); input is position error in ticks
//! and the period in seconds.
//!
//! Anti-windup has two parts. The integral is frozen (conditional
//! integration) in any period where the unclamped output would exceed
//! the limit in the direction of the error. Independently, the
//! accumulator is clamped so that `|ki * integral| <= out_limit`.
//!
//! The derivative acts on the error through a first-order low-pass; the
//! first update after a reset has no derivative term.

/// Controller gains.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PidGains {
    /// Proportional gain.
    pub kp: f32,
    /// Integral gain.
    pub ki: f32,
    /// Derivative gain.
    pub kd: f32,
    /// Weight of the newest raw derivative (1.0 disables filtering).
    pub derivative_alpha: f32,
}

/// PID state. Owned exclusively by the control loop.
#[derive(Clone, Debug)]
pub struct Pid {
    gains: PidGains,
    out_limit: f32,
    integral: f32,
    prev_error: f32,
    d_filtered: f32,
    first: bool,
    windup: bool,
}

#[inline]
fn abs(x: f32) -> f32 {
    if x < 0.0 {
        -x
    } else {
        x
    }
}

impl Pid {
    /// New controller with a zeroed state.
    pub fn new(gains: PidGains, out_limit: f32) -> Self {
        Self {
            gains,
            out_limit: abs(out_limit),
            integral: 0.0,
            prev_error: 0.0,
            d_filtered: 0.0,
            first: true,
            windup: false,
        }
    }

    /// Replace gains and limit and reset the state.
    pub fn reconfigure(&mut self, gains: PidGains, out_limit: f32) {
        *self = Self::new(gains, out_limit);
    }

    /// Zero the integral, derivative history and anti-windup flag.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = 0.0;
        self.d_filtered = 0.0;
        self.first = true;
        self.windup = false;
    }

    /// One controller step.
    pub fn update(&mut self, error: f32, dt: f32) -> f32 {
        let g = self.gains;
        let p = g.kp * error;

        let raw_d = if self.first || dt <= 0.0 {
            0.0
        } else {
            (error - self.prev_error) / dt
        };
        self.first = false;
        self.prev_error = error;
        let alpha = g.derivative_alpha.clamp(0.0, 1.0);
        self.d_filtered = alpha * raw_d + (1.0 - alpha) * self.d_filtered;
        let d = g.kd * self.d_filtered;

        let candidate = self.integral + error * dt;
        let unclamped = p + g.ki * candidate + d;
        let pushing_out = (unclamped > self.out_limit && error > 0.0)
            || (unclamped < -self.out_limit && error < 0.0);
        self.windup = pushing_out;
        if !pushing_out {
            self.integral = candidate;
        }
        if g.ki > 0.0 {
            let max_i = self.out_limit / g.ki;
            self.integral = self.integral.clamp(-max_i, max_i);
        } else {
            self.integral = 0.0;
        }

        (p + g.ki * self.integral + d).clamp(-self.out_limit, self.out_limit)
    }

    /// Current integral contribution to the output.
    pub fn integral_term(&self) -> f32 {
        self.gains.ki * self.integral
    }

    /// True if the last update froze the integral.
    pub fn windup_active(&self) -> bool {
        self.windup
    }

    /// Output clamp.
    pub fn out_limit(&self) -> f32 {
        self.out_limit
    }
}
