//! Discrete-time state observer for a brushed DC motor with a gear
//! reduction. Fuses the voltage just commanded to the motor with the
//! measured shaft angle to produce position/speed estimates that stay
//! usable even across the noisy, low-resolution tacho samples a LEGO
//! motor actually provides, and flags a stall when the model says the
//! motor should be moving but measurement says it isn't.
//!
//! Follows the `pbio_observer_*` call sites in `servo.c`: `update(time,
//! position, actuation, voltage)` each tick, `get_estimated_state`,
//! `get_feedback_voltage`, `get_feedforward_torque`,
//! `voltage_to_torque`/`torque_to_voltage`, `is_stalled`, `reset`.

use crate::angle::Angle;
use crate::devices::ObserverModel;
use crate::hal::{ticks_diff, Actuation, TICKS_PER_MS};

const TICK_HZ: i64 = 10_000;

/// Depth of the angle/time ring buffer backing [`Observer::get_speed`]. The
/// differentiator window is configurable in milliseconds, but the number of
/// retained samples is bounded here instead, which keeps the buffer
/// fixed-size without needing `alloc`.
const DIFFERENTIATOR_LEN: usize = 16;

/// Ring buffer of recent `(time, angle)` samples, differentiated over a
/// caller-supplied window to answer "what's the speed right now" without
/// amplifying tick-to-tick tacho jitter the way a naive one-sample
/// difference would.
#[derive(Debug, Copy, Clone, defmt::Format)]
struct Differentiator {
    samples: [(u32, Angle); DIFFERENTIATOR_LEN],
    len: usize,
    next: usize,
}

impl Default for Differentiator {
    fn default() -> Self {
        Differentiator {
            samples: [(0, Angle::ZERO); DIFFERENTIATOR_LEN],
            len: 0,
            next: 0,
        }
    }
}

impl Differentiator {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn push(&mut self, time: u32, angle: Angle) {
        self.samples[self.next] = (time, angle);
        self.next = (self.next + 1) % DIFFERENTIATOR_LEN;
        if self.len < DIFFERENTIATOR_LEN {
            self.len += 1;
        }
    }

    /// Average speed (mdeg/s) over the most recent `window_ticks`, found by
    /// locating the oldest retained sample within the window and dividing
    /// the angle swept by the elapsed time. Falls back to the oldest
    /// sample available if the window is wider than the buffer's history.
    fn get_speed(&self, now: u32, window_ticks: u32) -> i32 {
        if self.len < 2 {
            return 0;
        }
        let latest_idx = (self.next + DIFFERENTIATOR_LEN - 1) % DIFFERENTIATOR_LEN;
        let (latest_time, latest_angle) = self.samples[latest_idx];

        let mut oldest = self.samples[latest_idx];
        for i in 0..self.len {
            let idx = (self.next + DIFFERENTIATOR_LEN - 1 - i) % DIFFERENTIATOR_LEN;
            let (t, a) = self.samples[idx];
            oldest = (t, a);
            if ticks_diff(now, t) as u32 >= window_ticks {
                break;
            }
        }

        let dt = ticks_diff(latest_time, oldest.0);
        if dt <= 0 {
            return 0;
        }
        let dpos = latest_angle.diff_mdeg(oldest.1) as i64;
        (dpos * TICK_HZ / dt as i64) as i32
    }
}

/// Observer-only settings, kept distinct from [`ObserverModel`] because they
/// are derived from it (plus a couple of fixed constants) rather than being
/// intrinsic motor properties — mirrors `pbio_observer_settings_t`, which
/// `servo.c`'s `pbio_servo_initialize_settings` populates from the model.
#[derive(Debug, Copy, Clone, defmt::Format)]
pub struct ObserverSettings {
    pub stall_speed_limit: i32,
    pub stall_time: u32,
    pub feedback_voltage_negligible_mv: i32,
    pub feedback_voltage_stall_ratio_pct: i32,
    pub feedback_gain_low: i32,
    pub feedback_gain_high: i32,
    pub feedback_gain_threshold_mdeg: i32,
    pub coulomb_friction_speed_cutoff: i32,
}

impl ObserverSettings {
    /// Builds observer settings from a model the way
    /// `pbio_servo_initialize_settings` does: the negligible-feedback
    /// threshold is 2.5x the voltage that would overcome static friction
    /// alone, and the high gain is 7x the low one.
    pub fn from_model(model: &ObserverModel, stall_speed_limit: i32, stall_time: u32) -> Self {
        ObserverSettings {
            stall_speed_limit,
            stall_time,
            feedback_voltage_negligible_mv: model.torque_to_voltage(model.torque_friction) * 5 / 2,
            feedback_voltage_stall_ratio_pct: model.feedback_voltage_stall_ratio_pct,
            feedback_gain_low: model.feedback_gain_low,
            feedback_gain_high: model.feedback_gain_high,
            feedback_gain_threshold_mdeg: model.feedback_gain_threshold_mdeg,
            coulomb_friction_speed_cutoff: model.coulomb_friction_speed_cutoff,
        }
    }
}

/// Discrete-time observer state for one servo's motor.
#[derive(Debug, Copy, Clone, defmt::Format)]
pub struct Observer {
    model: ObserverModel,
    settings: ObserverSettings,
    position_estimate: Angle,
    speed_estimate: i32,
    feedback_voltage: i32,
    stall_start: Option<u32>,
    differentiator: Differentiator,
}

impl Observer {
    pub fn new(model: ObserverModel, settings: ObserverSettings, initial: Angle) -> Self {
        Observer {
            model,
            settings,
            position_estimate: initial,
            speed_estimate: 0,
            feedback_voltage: 0,
            stall_start: None,
            differentiator: Differentiator::default(),
        }
    }

    /// Re-synchronizes the estimate to a freshly read (or reset) tacho
    /// angle, used when the tacho itself is reset. Mirrors
    /// `pbio_observer_reset`.
    pub fn reset(&mut self, angle: Angle) {
        self.position_estimate = angle;
        self.speed_estimate = 0;
        self.feedback_voltage = 0;
        self.stall_start = None;
        self.differentiator.reset();
    }

    /// Coulomb + viscous friction torque opposing `speed`, blended linearly
    /// to zero within `coulomb_friction_speed_cutoff` so the sign-only
    /// Coulomb term doesn't toggle discontinuously through zero speed.
    fn friction_torque(&self, speed: i32) -> i64 {
        let cutoff = self.model.coulomb_friction_speed_cutoff.max(1);
        let coulomb = if speed.abs() >= cutoff {
            self.model.torque_friction as i64 * speed.signum() as i64
        } else {
            self.model.torque_friction as i64 * speed as i64 / cutoff as i64
        };
        let viscous = self.model.damping as i64 * speed as i64;
        coulomb + viscous
    }

    /// One discrete step of the plant model: given the voltage the driver
    /// was just commanded to apply and an elapsed tick count, returns the
    /// resulting `(position, speed)` prediction from `self`'s current
    /// estimate, ignoring measurement entirely.
    fn predict(&self, voltage_mv: i32, dt_ticks: i64) -> (Angle, i32) {
        let speed0 = self.speed_estimate as i64;
        let torque = self.model.voltage_to_torque(voltage_mv) as i64;
        let net_torque = torque - self.friction_torque(self.speed_estimate);
        let inertia = self.model.inertia.max(1) as i64;
        let accel = net_torque / inertia;

        let dpos = speed0 * dt_ticks / TICK_HZ + accel * dt_ticks * dt_ticks / (2 * TICK_HZ * TICK_HZ);
        let dspeed = accel * dt_ticks / TICK_HZ;

        (
            Angle::from_mdeg_i64(self.position_estimate.to_mdeg_i64() + dpos),
            (speed0 + dspeed) as i32,
        )
    }

    /// Advances the observer by one control tick.
    ///
    /// `voltage_mv` is the voltage the driver was just commanded with (the
    /// controller's torque output, already converted), `measured` the
    /// tacho's current reading, and `dt_ticks` the elapsed time since the
    /// previous call.
    pub fn update(&mut self, now: u32, measured: Angle, _actuation: Actuation, voltage_mv: i32, dt_ticks: u32) {
        let dt = dt_ticks as i64;

        // 1. Predict from the open-loop model.
        let (predicted_pos, predicted_speed) = self.predict(voltage_mv, dt);

        // 2. Feedback voltage from the position error, piecewise-affine in
        // the error magnitude so small drift gets gently nudged while large
        // divergence (e.g. after a missed step) snaps back quickly.
        let error = measured.diff_mdeg(predicted_pos);
        let gain = if error.abs() < self.settings.feedback_gain_threshold_mdeg {
            self.settings.feedback_gain_low
        } else {
            self.settings.feedback_gain_high
        };
        let feedback_voltage = ((gain as i64 * error as i64) / 1_000_000) as i32;
        self.feedback_voltage = feedback_voltage;

        // 3. Inject the feedback voltage as an extra torque over this same
        // tick, snapping the prediction toward the measurement.
        let feedback_torque = self.model.voltage_to_torque(feedback_voltage) as i64;
        let inertia = self.model.inertia.max(1) as i64;
        let correction_accel = feedback_torque / inertia;
        let dpos_corr = correction_accel * dt * dt / (2 * TICK_HZ * TICK_HZ);
        let dspeed_corr = correction_accel * dt / TICK_HZ;

        self.position_estimate = Angle::from_mdeg_i64(predicted_pos.to_mdeg_i64() + dpos_corr);
        self.speed_estimate = predicted_speed + dspeed_corr as i32;

        self.differentiator.push(now, measured);

        // 4. Stall timer: the applied voltage is clearly trying to move the
        // motor, but the estimate says it isn't, for long enough.
        let negligible = self.settings.feedback_voltage_negligible_mv;
        let stall_threshold = negligible.saturating_mul(self.settings.feedback_voltage_stall_ratio_pct) / 100;
        let trying_hard = voltage_mv.abs() > stall_threshold;
        let barely_moving = self.speed_estimate.abs() < self.settings.stall_speed_limit;
        if trying_hard && barely_moving {
            self.stall_start.get_or_insert(now);
        } else {
            self.stall_start = None;
        }
    }

    pub fn get_estimated_state(&self) -> (Angle, i32) {
        (self.position_estimate, self.speed_estimate)
    }

    /// The error-feedback voltage computed against `measured` (mV), used as
    /// a load proxy when the controller isn't active (`pbio_servo_get_load`
    /// and the per-tick log both read this directly).
    pub fn get_feedback_voltage(&self, measured: Angle) -> i32 {
        let error = measured.diff_mdeg(self.position_estimate);
        let gain = if error.abs() < self.settings.feedback_gain_threshold_mdeg {
            self.settings.feedback_gain_low
        } else {
            self.settings.feedback_gain_high
        };
        ((gain as i64 * error as i64) / 1_000_000) as i32
    }

    /// Torque needed to follow a reference `(speed, acceleration)` with no
    /// position error: inertial + friction + damping terms, none of which
    /// the feedback loop alone should have to supply.
    pub fn get_feedforward_torque(&self, ref_speed: i32, ref_accel: i32) -> i32 {
        let inertia_term = self.model.inertia as i64 * ref_accel as i64;
        let friction_term = self.friction_torque(ref_speed);
        (inertia_term + friction_term) as i32
    }

    pub fn voltage_to_torque(&self, voltage_mv: i32) -> i32 {
        self.model.voltage_to_torque(voltage_mv)
    }

    pub fn torque_to_voltage(&self, torque_unm: i32) -> i32 {
        self.model.torque_to_voltage(torque_unm)
    }

    /// True if the observer's own (non-controller) stall timer has run for
    /// at least `stall_time`, used when the servo is driven by an open-loop
    /// voltage/duty command rather than the PID controller.
    pub fn is_stalled(&self, now: u32) -> (bool, u32) {
        match self.stall_start {
            Some(start) => {
                let dur = ticks_diff(now, start).max(0) as u32;
                (dur >= self.settings.stall_time, dur)
            }
            None => (false, 0),
        }
    }

    /// User-visible speed, averaged over a `window` given in milliseconds.
    pub fn get_speed(&self, now: u32, window_ms: u32) -> i32 {
        self.differentiator.get_speed(now, window_ms * TICKS_PER_MS)
    }

    pub fn model(&self) -> &ObserverModel {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{controller_defaults, observer_model, DeviceTypeId};

    fn test_observer() -> Observer {
        let model = observer_model(DeviceTypeId::LargeMotor);
        let defaults = controller_defaults(DeviceTypeId::LargeMotor, 50);
        let settings = ObserverSettings::from_model(&model, defaults.stall_speed_limit, defaults.stall_time_ticks);
        Observer::new(model, settings, Angle::ZERO)
    }

    #[test]
    fn reset_snaps_estimate_to_measurement() {
        let mut obs = test_observer();
        let angle = Angle::new(2, 12_345);
        obs.reset(angle);
        let (pos, speed) = obs.get_estimated_state();
        assert_eq!(pos, angle);
        assert_eq!(speed, 0);
    }

    #[test]
    fn stationary_measurement_keeps_estimate_stable() {
        let mut obs = test_observer();
        for t in (0..5_000u32).step_by(50) {
            obs.update(t, Angle::ZERO, Actuation::Coast, 0, 50);
        }
        let (pos, speed) = obs.get_estimated_state();
        assert_eq!(pos, Angle::ZERO);
        assert_eq!(speed, 0);
    }

    #[test]
    fn blocked_output_with_high_voltage_declares_stall() {
        let mut obs = test_observer();
        let mut now = 0u32;
        let mut stalled = false;
        for _ in 0..100 {
            obs.update(now, Angle::ZERO, Actuation::Duty(1_000_000), 9_000, 50);
            now += 50;
            let (s, _) = obs.is_stalled(now);
            stalled = stalled || s;
        }
        assert!(stalled);
    }

    #[test]
    fn feedforward_torque_scales_with_reference() {
        let obs = test_observer();
        let ff_fast = obs.get_feedforward_torque(500_000, 0);
        let ff_slow = obs.get_feedforward_torque(100_000, 0);
        assert!(ff_fast.abs() >= ff_slow.abs());
    }

    #[test]
    fn voltage_torque_round_trip() {
        let obs = test_observer();
        let v = obs.torque_to_voltage(obs.voltage_to_torque(1_000));
        assert!((v - 1_000).abs() <= 1);
    }
}
