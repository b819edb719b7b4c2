//! Pure PID step for the adaptive concurrency limit.
//!
//! The controller tracks the error between measured and target time-to-first
//! -token and turns it into a concurrency limit between the configured
//! bounds. The state is two numbers; every update is a pure function of
//! `(state, error, dt)` with anti-windup clamping and finiteness guards.

#[derive(Debug, Clone)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Anti-windup bound: the integral term stays in `[-integral_limit, +integral_limit]`.
    pub integral_limit: f64,
    /// Target time-to-first-token, in seconds.
    pub target_ttft: f64,
    /// Limit applied when the error is zero.
    pub base_limit: f64,
    pub min_concurrent: f64,
    pub max_concurrent: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.1,
            ki: 0.01,
            kd: 0.0,
            integral_limit: 100.0,
            target_ttft: 0.2,
            base_limit: 50.0,
            min_concurrent: 1.0,
            max_concurrent: 100.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PidController {
    integral: f64,
    prev_error: Option<f64>,
}

impl PidController {
    pub fn new() -> Self {
        Self::default()
    }

    /// One control step: returns the new concurrency limit, or `None` when
    /// the sample is unusable (`dt <= 0`, non-finite inputs, or a non-finite
    /// intermediate). A rejected sample leaves the state untouched.
    pub fn update(&mut self, cfg: &PidConfig, measured_ttft: f64, dt: f64) -> Option<f64> {
        if dt <= 0.0 || !dt.is_finite() || !measured_ttft.is_finite() {
            return None;
        }

        let error = measured_ttft - cfg.target_ttft;
        let proposed_integral =
            (self.integral + error * dt).clamp(-cfg.integral_limit, cfg.integral_limit);
        let derivative = match self.prev_error {
            Some(prev) => cfg.kd * (error - prev) / dt,
            None => 0.0,
        };
        let output = cfg.kp * error + cfg.ki * proposed_integral + derivative;
        if !output.is_finite() {
            return None;
        }

        self.integral = proposed_integral;
        self.prev_error = Some(error);
        Some((cfg.base_limit - output).clamp(cfg.min_concurrent, cfg.max_concurrent))
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PidConfig {
        PidConfig {
            kp: 0.1,
            ki: 0.01,
            kd: 0.0,
            integral_limit: 100.0,
            target_ttft: 0.2,
            base_limit: 50.0,
            min_concurrent: 1.0,
            max_concurrent: 100.0,
        }
    }

    #[test]
    fn sustained_overshoot_walks_the_limit_down() {
        let cfg = cfg();
        let mut pid = PidController::new();
        let mut last = cfg.base_limit;
        for _ in 0..60 {
            let limit = pid.update(&cfg, 0.4, 1.0).expect("valid sample");
            assert!(limit <= last + 1e-9, "limit must be non-increasing");
            assert!(limit.is_finite());
            last = limit;
        }
        assert!(last < cfg.base_limit);
        assert!(pid.integral().abs() <= cfg.integral_limit);
    }

    #[test]
    fn integral_stays_clamped_under_any_error_sequence() {
        let cfg = cfg();
        let mut pid = PidController::new();
        for i in 0..1000 {
            let measured = if i % 3 == 0 { 50.0 } else { -50.0 };
            let _ = pid.update(&cfg, measured, 1.0);
            assert!(pid.integral() >= -cfg.integral_limit);
            assert!(pid.integral() <= cfg.integral_limit);
        }
    }

    #[test]
    fn non_positive_dt_does_not_mutate_state() {
        let cfg = cfg();
        let mut pid = PidController::new();
        pid.update(&cfg, 0.4, 1.0).unwrap();
        let before = pid.integral();
        assert!(pid.update(&cfg, 0.4, 0.0).is_none());
        assert!(pid.update(&cfg, 0.4, -1.0).is_none());
        assert_eq!(pid.integral(), before);
    }

    #[test]
    fn non_finite_measurement_is_dropped() {
        let cfg = cfg();
        let mut pid = PidController::new();
        assert!(pid.update(&cfg, f64::NAN, 1.0).is_none());
        assert!(pid.update(&cfg, f64::INFINITY, 1.0).is_none());
        assert_eq!(pid.integral(), 0.0);
    }

    #[test]
    fn output_respects_concurrency_bounds() {
        let cfg = cfg();
        let mut pid = PidController::new();
        // Huge positive error drives the limit to the floor, not below.
        for _ in 0..100 {
            if let Some(limit) = pid.update(&cfg, 1e6, 1.0) {
                assert!(limit >= cfg.min_concurrent);
                assert!(limit <= cfg.max_concurrent);
            }
        }
    }
}
