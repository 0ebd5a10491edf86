//! Per-port servo façade: binds a [`crate::hal::Tacho`], a
//! [`crate::hal::MotorDriver`], a [`crate::controller::Controller`] and a
//! [`crate::observer::Observer`] into the single object application code
//! (and [`crate::port`]) actually drives.
//!
//! Follows `pbio_servo_setup`, the `run_*` family, `track_target`, `stop`,
//! `pbio_servo_update` (including the detail that the observer updates
//! every tick regardless of whether a controller is actively tracking a
//! trajectory, and that a tick error coasts the motor and resets control
//! rather than propagating a panic), `is_stalled`, and `get_load`.

use crate::angle::{self, Angle};
use crate::controller::{Controller, ControllerSettings, ControlStatus, OnCompletion};
use crate::devices::{self, controller_defaults, gains_from_profile, observer_model, DeviceTypeId};
use crate::error::{Error, Result};
use crate::hal::{ticks_diff, Actuation, Clock, MotorDriver, Tacho};
use crate::logger::{LogRow, Logger};
use crate::observer::{Observer, ObserverSettings};

/// Ring depth for the per-servo diagnostic logger: several seconds at the
/// 10 kHz control tick rate kept small enough to fit comfortably on an
/// embedded stack.
const LOG_CAPACITY: usize = 256;

/// Converts a voltage (mV) into a duty-cycle command (ppm of full battery
/// voltage), clamped to what the driver can actually express.
fn voltage_to_ppm(voltage_mv: i32, max_voltage_mv: i32) -> i32 {
    if max_voltage_mv == 0 {
        return 0;
    }
    let ppm = (voltage_mv as i64 * 1_000_000 / max_voltage_mv as i64) as i32;
    ppm.clamp(-1_000_000, 1_000_000)
}

fn ppm_to_voltage(ppm: i32, max_voltage_mv: i32) -> i32 {
    ((ppm as i64 * max_voltage_mv as i64) / 1_000_000) as i32
}

/// Low two bits of the logged actuation/stall column: 0 coast, 1 brake, 2
/// torque/duty, matching `pbio_dcmotor_actuation_t`'s ordering.
fn actuation_kind_flag(actuation: Actuation) -> i32 {
    match actuation {
        Actuation::Coast => 0,
        Actuation::Brake => 1,
        Actuation::Duty(_) => 2,
    }
}

/// Notifies whatever owns a servo (e.g. a drive base built on top of two of
/// them) that the servo is about to be commanded directly, so the parent can
/// abandon whatever coordinated motion it had in flight instead of fighting
/// the new command. Mirrors `servo.c`'s `parent->stop_func(parent)` callback
/// as a trait a drive-base type implements instead of a pointer-based
/// callback — this crate defines the seam but never implements a
/// non-trivial parent itself.
pub trait ParentStop {
    fn stop_from_child(&mut self);
}

/// The default parent for a standalone servo: direct commands never need to
/// notify anything.
#[derive(Debug, Default, Copy, Clone, defmt::Format)]
pub struct NoParent;

impl ParentStop for NoParent {
    fn stop_from_child(&mut self) {}
}

/// Setup-time parameters for a servo on one port.
#[derive(Debug, Copy, Clone, defmt::Format)]
pub struct ServoSetup {
    pub device_type: DeviceTypeId,
    /// Degrees of the output shaft per degree the motor itself turns; 1 for
    /// a bare motor, >1 for anything behind a gear train.
    pub gear_ratio: i32,
    /// Tuning scale: smaller values track harder (higher kp) at the cost of
    /// smoothness. Must be at least 5, per
    /// [`crate::devices::validate_precision_profile`].
    pub precision_profile: i32,
    /// Coarser profile used only for the derivative term, matching a
    /// motor's factory defaults unless the caller wants a custom feel.
    pub precision_profile_reduced: i32,
    pub reverse: bool,
}

/// A single motor's control loop: owns its driver and tacho handles, and
/// drives a [`Controller`]/[`Observer`] pair each tick. Not `Clone`/`Copy`:
/// real driver/tacho implementations own hardware peripherals.
pub struct Servo<C, M, T, P = NoParent> {
    clock: C,
    driver: M,
    tacho: T,
    setup: ServoSetup,
    controller: Controller,
    observer: Observer,
    last_tick: u32,
    stop_pending: bool,
    log: Logger<LOG_CAPACITY>,
    parent: P,
}

impl<C: Clock, M: MotorDriver, T: Tacho> Servo<C, M, T, NoParent> {
    /// Builds and initializes a standalone servo (no parent) from its device
    /// type and the caller's precision/gearing choices, reading the tacho
    /// once to seed the observer at the shaft's current position.
    pub fn setup(clock: C, driver: M, tacho: T, setup: ServoSetup) -> Result<Self> {
        Self::setup_with_parent(clock, driver, tacho, setup, NoParent)
    }
}

impl<C: Clock, M: MotorDriver, T: Tacho, P: ParentStop> Servo<C, M, T, P> {
    /// Builds and initializes a servo whose direct commands must first
    /// notify `parent` (e.g. a drive base built on top of this motor) that
    /// it's being taken over.
    pub fn setup_with_parent(clock: C, driver: M, mut tacho: T, setup: ServoSetup, parent: P) -> Result<Self> {
        devices::validate_precision_profile(setup.precision_profile)?;
        if setup.gear_ratio <= 0 {
            return Err(Error::InvalidArg);
        }

        let model = observer_model(setup.device_type);
        let defaults = controller_defaults(setup.device_type, setup.precision_profile);
        let (kp, ki, kd) = gains_from_profile(
            setup.device_type,
            setup.precision_profile,
            setup.precision_profile_reduced,
        );

        let controller_settings = ControllerSettings {
            kp,
            ki,
            kd,
            speed_max: model.rated_max_speed * 8 / 10,
            accel: model.rated_max_speed * 4,
            decel: model.rated_max_speed * 4,
            integral_deadzone: defaults.integral_deadzone,
            integral_change_max: defaults.integral_change_max,
            stall_speed_limit: defaults.stall_speed_limit,
            stall_time: defaults.stall_time_ticks,
            max_torque: model.voltage_to_torque(model.max_voltage),
            pid_kp_low_speed_threshold: defaults.pid_kp_low_speed_threshold,
            kp_low_pct: defaults.kp_low_pct,
            low_error_threshold: defaults.low_error_threshold,
            position_tolerance: defaults.position_tolerance,
            speed_tolerance: defaults.speed_tolerance,
            smart_passive_hold_time: defaults.smart_passive_hold_time_ticks,
        };

        let observer_settings =
            ObserverSettings::from_model(&model, defaults.stall_speed_limit, defaults.stall_time_ticks);

        let angle = tacho.get_angle()?;
        let observer = Observer::new(model, observer_settings, angle);
        let now = clock.now_ticks();

        Ok(Servo {
            clock,
            driver,
            tacho,
            setup,
            controller: Controller::new(controller_settings),
            observer,
            last_tick: now,
            stop_pending: false,
            log: Logger::new(),
            parent,
        })
    }

    /// Enables or disables per-tick diagnostic logging (off by default, as
    /// on the original firmware — the buffer only fills while a caller has
    /// explicitly asked for it).
    pub fn set_logging_active(&mut self, active: bool) {
        self.log.set_active(active);
    }

    /// Logged rows in chronological order, if logging is (or was) active.
    pub fn log_rows(&self) -> impl Iterator<Item = &LogRow> {
        self.log.rows()
    }

    fn gear_ratio(&self) -> i32 {
        self.setup.gear_ratio
    }

    fn app_sign(&self) -> i32 {
        if self.setup.reverse {
            -1
        } else {
            1
        }
    }

    /// Resets the reported zero point. If `to_abs`, `angle_deg` is ignored
    /// and the tacho's own absolute marker (if any) is used instead.
    pub fn reset_angle(&mut self, angle_deg: i32, to_abs: bool) -> Result<()> {
        let requested = angle::app_to_ctl_long(angle_deg * self.app_sign(), self.gear_ratio());
        let actual = self.tacho.reset_angle(requested, to_abs)?;
        self.observer.reset(actual);
        self.controller.reset(actual);
        Ok(())
    }

    /// User-facing position in whole degrees at the output shaft.
    pub fn get_position_user(&self) -> Result<i32> {
        let angle = self.tacho.get_angle()?;
        Ok(angle.ctl_to_app_long(self.gear_ratio()) * self.app_sign())
    }

    /// User-facing speed in degrees/second, averaged over `window_ms`.
    pub fn get_speed_user(&self, window_ms: u32) -> i32 {
        let now = self.clock.now_ticks();
        let ctl_speed = self.observer.get_speed(now, window_ms);
        angle::ctl_to_app_speed(ctl_speed, self.gear_ratio()) * self.app_sign()
    }

    pub fn run_forever(&mut self, speed_deg_s: i32) -> Result<()> {
        self.parent.stop_from_child();
        let now = self.clock.now_ticks();
        let (pos, spd) = self.current_ctl_state()?;
        let ctl_speed = angle::app_to_ctl_speed(speed_deg_s * self.app_sign(), self.gear_ratio());
        self.controller
            .start_timed_control(now, pos, spd, crate::trajectory::DURATION_FOREVER_MS, ctl_speed, OnCompletion::CoastAfter)
    }

    pub fn run_time(&mut self, duration_ms: u32, speed_deg_s: i32, on_completion: OnCompletion) -> Result<()> {
        self.parent.stop_from_child();
        let now = self.clock.now_ticks();
        let (pos, spd) = self.current_ctl_state()?;
        let ctl_speed = angle::app_to_ctl_speed(speed_deg_s * self.app_sign(), self.gear_ratio());
        self.controller
            .start_timed_control(now, pos, spd, duration_ms, ctl_speed, on_completion)
    }

    /// Runs to an absolute target angle. Delegates to [`Servo::run_angle`]
    /// with a zero relative delta when `speed_deg_s == 0`, matching
    /// `run_target`'s fallback to the device's default speed there.
    pub fn run_target(&mut self, target_deg: i32, speed_deg_s: i32, on_completion: OnCompletion) -> Result<()> {
        self.parent.stop_from_child();
        let now = self.clock.now_ticks();
        let (pos, spd) = self.current_ctl_state()?;
        let target = angle::app_to_ctl_long(target_deg * self.app_sign(), self.gear_ratio());
        let ctl_speed = if speed_deg_s == 0 {
            self.controller.settings().speed_max
        } else {
            angle::app_to_ctl_speed(speed_deg_s.abs(), self.gear_ratio())
        };
        self.controller
            .start_position_control(now, pos, spd, target, ctl_speed, on_completion)
    }

    /// Runs a relative move from wherever the controller is currently
    /// heading, forcing a zero-length move (implying the caller accepts an
    /// instant hold) when `speed_deg_s == 0`, matching `run_angle`'s
    /// zero-speed special case.
    pub fn run_angle(&mut self, angle_deg: i32, speed_deg_s: i32, on_completion: OnCompletion) -> Result<()> {
        self.parent.stop_from_child();
        let now = self.clock.now_ticks();
        let (pos, spd) = self.current_ctl_state()?;
        let delta_deg = if speed_deg_s == 0 { 0 } else { angle_deg };
        let delta = angle::app_to_ctl_long(delta_deg * self.app_sign(), self.gear_ratio()).total_mdeg_saturating();
        let ctl_speed = if speed_deg_s == 0 {
            self.controller.settings().speed_max
        } else {
            angle::app_to_ctl_speed(speed_deg_s.abs(), self.gear_ratio())
        };
        self.controller
            .start_position_control_relative(now, pos, spd, delta, ctl_speed, on_completion)
    }

    /// Holds the current measured position, tracking external disturbances
    /// without accepting a new target.
    pub fn track_target(&mut self, target_deg: i32) -> Result<()> {
        self.parent.stop_from_child();
        let target = angle::app_to_ctl_long(target_deg * self.app_sign(), self.gear_ratio());
        let now = self.clock.now_ticks();
        self.controller.start_position_control_hold(now, target);
        Ok(())
    }

    /// Stops ongoing controlled motion, mirroring `pbio_servo_stop`'s
    /// per-`on_completion` branch instead of deferring to the next tick:
    /// [`OnCompletion::HoldAfter`]/[`OnCompletion::ContinueAfter`] install a
    /// hold at the current reference (if control was active) or measured
    /// position (otherwise) and leave the controller running; every other
    /// value stops the controller and actuates coast/brake immediately.
    pub fn stop(&mut self, on_completion: OnCompletion) -> Result<()> {
        self.parent.stop_from_child();

        if matches!(on_completion, OnCompletion::HoldAfter | OnCompletion::ContinueAfter) {
            let now = self.clock.now_ticks();
            let hold_target = if self.controller.is_active() {
                let ref_time = self.controller.get_ref_time(now);
                self.controller.trajectory().get_reference(ref_time).position
            } else {
                self.tacho.get_angle()?
            };
            self.controller.start_position_control_hold(now, hold_target);
            return Ok(());
        }

        self.controller.stop();
        self.stop_pending = true;
        match on_completion {
            OnCompletion::BrakeAfter | OnCompletion::BrakeAfterSmart => self.driver.set_duty(0),
            _ => self.driver.coast(),
        }
    }

    fn current_ctl_state(&self) -> Result<(Angle, i32)> {
        let angle = self.tacho.get_angle()?;
        let now = self.clock.now_ticks();
        let (_, speed_estimate) = self.observer.get_estimated_state();
        let _ = now;
        Ok((angle, speed_estimate))
    }

    /// Advances the control loop by one tick: reads the tacho, runs the
    /// controller (if active) and the observer (always, even when idle —
    /// otherwise the estimate would go stale the instant a move finishes),
    /// and commands the driver. A tacho read failure coasts the motor and
    /// clears the active trajectory rather than propagating a panic, since
    /// a single dropped sample shouldn't be fatal to an otherwise-healthy
    /// servo.
    pub fn update(&mut self) -> Result<()> {
        let now = self.clock.now_ticks();
        let dt = ticks_diff(now, self.last_tick).max(0) as u32;

        let angle = match self.tacho.get_angle() {
            Ok(a) => a,
            Err(e) => {
                let _ = self.driver.coast();
                self.controller.stop();
                self.last_tick = now;
                return Err(e);
            }
        };

        let ref_time = self.controller.get_ref_time(now);
        let r = self.controller.trajectory().get_reference(ref_time);
        let feedforward = self.observer.get_feedforward_torque(r.speed, r.acceleration);

        let (_, speed_estimate) = self.observer.get_estimated_state();
        let (torque, status) = self.controller.update(now, angle, speed_estimate, dt, feedforward);

        let actuation = if status.is_active() {
            if status.is_done() {
                self.finish_trajectory(now, angle);
                self.actuation_for_completion(angle)
            } else {
                let voltage = self.observer.torque_to_voltage(torque);
                let ppm = voltage_to_ppm(voltage, self.observer.model().max_voltage);
                Actuation::Duty(ppm)
            }
        } else {
            Actuation::Coast
        };

        match actuation {
            Actuation::Coast => {
                self.driver.coast()?;
            }
            Actuation::Brake => {
                self.driver.set_duty(0)?;
            }
            Actuation::Duty(ppm) => {
                self.driver.set_duty(ppm)?;
            }
        }

        let observer_voltage = match actuation {
            Actuation::Duty(ppm) => ppm_to_voltage(ppm, self.observer.model().max_voltage),
            Actuation::Coast | Actuation::Brake => 0,
        };

        if self.log.is_active() {
            let (est_position, est_speed) = self.observer.get_estimated_state();
            let stall_flag = (self.is_stalled() as i32) << 2;
            self.log.add_row(LogRow {
                time_ticks: now,
                position_deg: angle.ctl_to_app_long(self.gear_ratio()) * self.app_sign(),
                speed_deg_s: angle::ctl_to_app_speed(speed_estimate, self.gear_ratio()) * self.app_sign(),
                actuation_and_stall_flags: actuation_kind_flag(actuation) | stall_flag,
                voltage_mv: observer_voltage,
                est_position_deg: est_position.ctl_to_app_long(self.gear_ratio()) * self.app_sign(),
                est_speed_deg_s: angle::ctl_to_app_speed(est_speed, self.gear_ratio()) * self.app_sign(),
                feedback_torque_unm: torque,
                feedforward_torque_unm: feedforward,
                observer_feedback_voltage_mv: self.observer.get_feedback_voltage(angle),
            });
        }

        self.observer.update(now, angle, actuation, observer_voltage, dt);

        self.last_tick = now;
        Ok(())
    }

    fn finish_trajectory(&mut self, now: u32, angle: Angle) {
        match self.controller.on_completion() {
            OnCompletion::HoldAfter => {
                self.controller.start_position_control_hold(now, angle);
            }
            _ => {
                self.controller.stop();
                self.stop_pending = true;
            }
        }
    }

    fn actuation_for_completion(&self, _angle: Angle) -> Actuation {
        match self.controller.on_completion() {
            OnCompletion::BrakeAfter | OnCompletion::BrakeAfterSmart => Actuation::Brake,
            _ => Actuation::Coast,
        }
    }

    /// True if the controller (while tracking a trajectory) or the observer
    /// (while idle, e.g. under an open-loop duty command) judge the motor
    /// stalled.
    pub fn is_stalled(&self) -> bool {
        let now = self.clock.now_ticks();
        self.observer.is_stalled(now).0
    }

    /// Low-pass filtered load estimate (µNm), the negated sign of the
    /// controller's running torque average, matching `pbio_servo_get_load`.
    pub fn get_load(&self) -> Result<i32> {
        self.tacho.get_angle()?;
        Ok(-self.controller.pid_average())
    }

    /// True once a prior [`Servo::stop`] or a completed non-holding
    /// trajectory has left the motor idle; consumed (reset to false) by the
    /// caller so it fires exactly once per completion.
    pub fn take_stop_notification(&mut self) -> bool {
        let pending = self.stop_pending;
        self.stop_pending = false;
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::IoPoll;
    use core::cell::Cell;

    struct FakeClock {
        now: Cell<u32>,
    }
    impl Clock for FakeClock {
        fn now_ticks(&self) -> u32 {
            self.now.get()
        }
    }

    struct FakeDriver {
        last_ppm: i32,
        coasted: bool,
        set_duty_calls: u32,
    }
    impl MotorDriver for FakeDriver {
        fn coast(&mut self) -> Result<()> {
            self.coasted = true;
            Ok(())
        }
        fn set_duty(&mut self, ppm: i32) -> Result<()> {
            self.last_ppm = ppm;
            self.coasted = false;
            self.set_duty_calls += 1;
            Ok(())
        }
    }

    struct FakeTacho {
        angle: Angle,
    }
    impl Tacho for FakeTacho {
        fn get_angle(&self) -> Result<Angle> {
            Ok(self.angle)
        }
        fn reset_angle(&mut self, angle: Angle, _to_abs: bool) -> Result<Angle> {
            self.angle = angle;
            Ok(angle)
        }
    }

    // Silence unused-IoPoll-import warnings in builds where only some
    // hal items are exercised directly.
    #[allow(dead_code)]
    fn _use_iopoll(_: IoPoll<()>) {}

    fn setup() -> ServoSetup {
        ServoSetup {
            device_type: DeviceTypeId::LargeMotor,
            gear_ratio: 1,
            precision_profile: 50,
            precision_profile_reduced: 50,
            reverse: false,
        }
    }

    #[test]
    fn rejects_precision_profile_below_five() {
        let clock = FakeClock { now: Cell::new(0) };
        let driver = FakeDriver { last_ppm: 0, coasted: false, set_duty_calls: 0 };
        let tacho = FakeTacho { angle: Angle::ZERO };
        let mut s = setup();
        s.precision_profile = 1;
        let result = Servo::setup(clock, driver, tacho, s);
        assert_eq!(result.err(), Some(Error::InvalidArg));
    }

    #[test]
    fn run_target_drives_motor_toward_goal() {
        let clock = FakeClock { now: Cell::new(0) };
        let driver = FakeDriver { last_ppm: 0, coasted: false, set_duty_calls: 0 };
        let tacho = FakeTacho { angle: Angle::ZERO };
        let mut servo = Servo::setup(clock, driver, tacho, setup()).unwrap();
        servo.run_target(90, 200, OnCompletion::CoastAfter).unwrap();
        servo.clock.now.set(10);
        servo.update().unwrap();
        assert!(servo.driver.last_ppm > 0 || !servo.driver.coasted);
    }

    #[test]
    fn stop_then_update_coasts() {
        let clock = FakeClock { now: Cell::new(0) };
        let driver = FakeDriver { last_ppm: 0, coasted: false, set_duty_calls: 0 };
        let tacho = FakeTacho { angle: Angle::ZERO };
        let mut servo = Servo::setup(clock, driver, tacho, setup()).unwrap();
        servo.run_forever(100).unwrap();
        servo.stop(OnCompletion::CoastAfter).unwrap();
        // Coasting happens immediately in stop(), before the next update().
        assert!(servo.driver.coasted);
        assert!(!servo.controller.is_active());
        servo.clock.now.set(10);
        servo.update().unwrap();
        assert!(servo.driver.coasted);
        assert!(servo.take_stop_notification());
        assert!(!servo.take_stop_notification());
    }

    #[test]
    fn stop_brake_after_actuates_zero_duty_immediately() {
        let clock = FakeClock { now: Cell::new(0) };
        let driver = FakeDriver { last_ppm: 0, coasted: false, set_duty_calls: 0 };
        let tacho = FakeTacho { angle: Angle::ZERO };
        let mut servo = Servo::setup(clock, driver, tacho, setup()).unwrap();
        servo.run_forever(100).unwrap();
        servo.stop(OnCompletion::BrakeAfter).unwrap();
        assert_eq!(servo.driver.set_duty_calls, 1);
        assert_eq!(servo.driver.last_ppm, 0);
        assert!(!servo.driver.coasted);
        assert!(!servo.controller.is_active());
        assert!(servo.take_stop_notification());
    }

    #[test]
    fn stop_hold_after_leaves_controller_active_and_does_not_coast() {
        let clock = FakeClock { now: Cell::new(0) };
        let driver = FakeDriver { last_ppm: 0, coasted: false, set_duty_calls: 0 };
        let tacho = FakeTacho { angle: Angle::ZERO };
        let mut servo = Servo::setup(clock, driver, tacho, setup()).unwrap();
        servo.run_forever(100).unwrap();
        servo.clock.now.set(10);
        servo.update().unwrap();
        servo.stop(OnCompletion::HoldAfter).unwrap();

        assert!(servo.controller.is_active());
        assert!(!servo.driver.coasted);
        assert_eq!(servo.driver.set_duty_calls, 0);
        assert!(!servo.take_stop_notification());

        servo.clock.now.set(20);
        servo.update().unwrap();
        assert!(!servo.driver.coasted);
    }

    #[test]
    fn stop_continue_after_also_holds_without_coasting() {
        let clock = FakeClock { now: Cell::new(0) };
        let driver = FakeDriver { last_ppm: 0, coasted: false, set_duty_calls: 0 };
        let tacho = FakeTacho { angle: Angle::ZERO };
        let mut servo = Servo::setup(clock, driver, tacho, setup()).unwrap();
        servo.run_forever(100).unwrap();
        servo.stop(OnCompletion::ContinueAfter).unwrap();

        assert!(servo.controller.is_active());
        assert!(!servo.driver.coasted);
        assert_eq!(servo.driver.set_duty_calls, 0);
    }

    struct CountingParent {
        stops: u32,
    }
    impl ParentStop for CountingParent {
        fn stop_from_child(&mut self) {
            self.stops += 1;
        }
    }

    #[test]
    fn direct_command_notifies_parent_exactly_once() {
        let clock = FakeClock { now: Cell::new(0) };
        let driver = FakeDriver { last_ppm: 0, coasted: false, set_duty_calls: 0 };
        let tacho = FakeTacho { angle: Angle::ZERO };
        let mut servo = Servo::setup_with_parent(clock, driver, tacho, setup(), CountingParent { stops: 0 }).unwrap();
        servo.run_forever(100).unwrap();
        assert_eq!(servo.parent.stops, 1);
        servo.run_angle(10, 100, OnCompletion::CoastAfter).unwrap();
        assert_eq!(servo.parent.stops, 2);
    }
}
