//! PID position/speed servo controller driving a [`crate::trajectory::Trajectory`]
//! reference to a torque command, with anti-windup pausing and stall
//! detection built on the integrators in [`crate::integrator`].
//!
//! Follows `pbio_control_update` and the four `pbio_control_start_*` entry
//! points. This controller works entirely in control-unit `Angle`/mdeg —
//! gear-ratio conversion to/from app units is the caller's (`servo`) job,
//! which keeps this module testable without a motor model.

use crate::angle::Angle;
use crate::error::{Error, Result};
use crate::hal::ticks_diff;
use crate::integrator::{PositionIntegrator, SpeedIntegrator};
use crate::trajectory::{Reference, Trajectory, Vertex, DURATION_FOREVER_MS};

/// What the controller should do with the motor once its trajectory
/// finishes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
pub enum OnCompletion {
    /// Cut power; the motor coasts to a stop under whatever load it has.
    CoastAfter,
    /// Short the terminals; the motor brakes.
    BrakeAfter,
    /// Like [`Self::CoastAfter`], but the controller keeps actuating at the
    /// endpoint for `smart_passive_hold_time` after completion and
    /// remembers the endpoint afterward, so a following relative command
    /// that starts close to it chains exactly rather than drifting by
    /// whatever the motor coasted through. This is the completion mode a
    /// caller should reach for by default; plain [`Self::CoastAfter`]
    /// exists for callers (e.g. an explicit low-level stop) that want the
    /// endpoint-memory behavior suppressed.
    CoastAfterSmart,
    /// The braking counterpart of [`Self::CoastAfterSmart`].
    BrakeAfterSmart,
    /// Keep the position controller running at the endpoint indefinitely.
    HoldAfter,
    /// Don't decelerate at all — this command hands off to whatever comes
    /// next while still moving.
    ContinueAfter,
}

impl OnCompletion {
    /// True for completion modes that never actually stop actuating
    /// ([`Self::HoldAfter`]/[`Self::ContinueAfter`]).
    fn keeps_actuating(self) -> bool {
        matches!(self, OnCompletion::HoldAfter | OnCompletion::ContinueAfter)
    }

    /// True for the two completion modes that remember their endpoint for
    /// a following relative command and briefly keep actuating past
    /// nominal completion.
    fn is_passive_smart(self) -> bool {
        matches!(self, OnCompletion::CoastAfterSmart | OnCompletion::BrakeAfterSmart)
    }

    /// The actuation applied once the controller actually stops. Only
    /// meaningful for the passive variants; [`Controller::update`] never
    /// calls this for [`Self::HoldAfter`]/[`Self::ContinueAfter`].
    fn passive_actuation_is_brake(self) -> bool {
        matches!(self, OnCompletion::BrakeAfter | OnCompletion::BrakeAfterSmart)
    }
}

/// Which reference quantity the controller is tracking: a purely
/// time-driven reference or a purely position-driven one. Both run the
/// same PID loop, they just disagree about which integrator accumulates
/// error.
#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
pub enum ControllerType {
    Position,
    Timed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
enum ControlState {
    Idle,
    Active,
}

bitflags::bitflags! {
    /// Status bits describing the controller's current tick, mirroring
    /// `pbio_control_is_done`/`pbio_control_is_stalled`/the active-state
    /// check in `control.c` but collapsed into one value instead of three
    /// separate queries.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ControlStatus: u8 {
        const ACTIVE = 0b001;
        const STALLED = 0b010;
        const DONE = 0b100;
    }
}

impl ControlStatus {
    pub fn is_active(self) -> bool {
        self.contains(Self::ACTIVE)
    }

    pub fn is_stalled(self) -> bool {
        self.contains(Self::STALLED)
    }

    pub fn is_done(self) -> bool {
        self.contains(Self::DONE)
    }
}

// `bitflags!` doesn't derive `defmt::Format`; the generated struct's only
// field is private, so the simplest bridge is to format the raw bits.
impl defmt::Format for ControlStatus {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "ControlStatus({=u8:b})", self.bits())
    }
}

/// Tuning constants for one controller instance, derived from a device's
/// [`crate::devices::ControllerDefaults`] and the user's chosen precision
/// profile via [`crate::devices::gains_from_profile`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
pub struct ControllerSettings {
    pub kp: i32,
    pub ki: i32,
    pub kd: i32,
    pub speed_max: i32,
    pub accel: i32,
    pub decel: i32,
    pub integral_deadzone: i32,
    pub integral_change_max: i32,
    pub stall_speed_limit: i32,
    pub stall_time: u32,
    pub max_torque: i32,
    /// Commanded speed (mdeg/s) at or above which the full `kp` always
    /// applies; below it, `adaptive_kp` may reduce gain. Named
    /// `pid_kp_low_speed_threshold` in the original source.
    pub pid_kp_low_speed_threshold: i32,
    /// `kp` is scaled by this percentage (of itself) to get the reduced
    /// low-speed gain `kp_low`.
    pub kp_low_pct: i32,
    /// Position error (mdeg) below which the low-speed blend uses `kp_low`
    /// linearly; above it, the blend grows back towards `kp`. Named
    /// `pid_kp_low_error_threshold` in the original source.
    pub low_error_threshold: i32,
    /// Position error tolerance (mdeg) for completion of a zero-end-speed
    /// position command.
    pub position_tolerance: i32,
    /// Speed tolerance (mdeg/s) for completion of a zero-end-speed position
    /// command.
    pub speed_tolerance: i32,
    /// How long (ticks) a [`OnCompletion::CoastAfterSmart`]/
    /// [`OnCompletion::BrakeAfterSmart`] completion keeps actuating at the
    /// endpoint before actually going passive.
    pub smart_passive_hold_time: u32,
}

/// Fixed control-loop period assumed by the low-pass load filter, matching
/// `PBIO_CONFIG_CONTROL_LOOP_TIME_MS`.
const CONTROL_LOOP_TIME_MS: i64 = 5;

/// Position/speed PID controller tracking a single active trajectory.
#[derive(Debug, Copy, Clone, defmt::Format)]
pub struct Controller {
    settings: ControllerSettings,
    controller_type: ControllerType,
    state: ControlState,
    trajectory: Trajectory,
    on_completion: OnCompletion,
    position_integrator: PositionIntegrator,
    speed_integrator: SpeedIntegrator,
    paused_ticks: u32,
    last_update: u32,
    /// Low-pass filtered torque, used by `get_load()` as a load estimate.
    /// Mirrors `control.c`'s constant-coefficient running average over
    /// `ctl->pid_average`.
    pid_average: i32,
}

impl Controller {
    pub fn new(settings: ControllerSettings) -> Self {
        Controller {
            settings,
            controller_type: ControllerType::Position,
            state: ControlState::Idle,
            trajectory: Trajectory::make_constant(0, Angle::ZERO),
            on_completion: OnCompletion::CoastAfter,
            position_integrator: PositionIntegrator::new(),
            speed_integrator: SpeedIntegrator::new(),
            paused_ticks: 0,
            last_update: 0,
            pid_average: 0,
        }
    }

    /// Low-pass filtered torque output (µNm), used as a load estimate by
    /// the servo's `get_load()`.
    pub fn pid_average(&self) -> i32 {
        self.pid_average
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: ControllerSettings) {
        self.settings = settings;
    }

    /// True while a trajectory is being tracked (as opposed to idle/coasting
    /// between commands).
    pub fn is_active(&self) -> bool {
        matches!(self.state, ControlState::Active)
    }

    /// Reference time, frozen while the anti-windup pause is active so the
    /// trajectory doesn't keep advancing past a motor that can't keep up.
    pub fn get_ref_time(&self, now: u32) -> u32 {
        now.wrapping_sub(self.paused_ticks)
    }

    fn start(&mut self, controller_type: ControllerType, trajectory: Trajectory, on_completion: OnCompletion) {
        self.controller_type = controller_type;
        self.trajectory = trajectory;
        self.on_completion = on_completion;
        self.state = ControlState::Active;
        self.position_integrator.reset();
        self.speed_integrator.reset();
        self.paused_ticks = 0;
    }

    /// Starts tracking an absolute target angle.
    pub fn start_position_control(
        &mut self,
        now: u32,
        measured_position: Angle,
        measured_speed: i32,
        target: Angle,
        speed: i32,
        on_completion: OnCompletion,
    ) -> Result<()> {
        let continue_running = matches!(on_completion, OnCompletion::ContinueAfter);
        let start = Vertex {
            time: now,
            position: measured_position,
            speed: measured_speed,
        };
        let traj = Trajectory::new_angle_command(
            start,
            target,
            speed,
            self.settings.speed_max,
            self.settings.accel,
            self.settings.decel,
            continue_running,
        )?;
        self.start(ControllerType::Position, traj, on_completion);
        Ok(())
    }

    /// Starts tracking a target offset from wherever the controller is
    /// currently heading — if a trajectory is already active its endpoint is
    /// used as the anchor (so back-to-back relative commands compose
    /// correctly instead of measuring from momentary, noisy tacho readings)
    /// and the new leg re-anchors onto the old one's tail speed exactly when
    /// the two are tangent (same first-segment acceleration), avoiding a
    /// tiny velocity discontinuity at the splice.
    pub fn start_position_control_relative(
        &mut self,
        now: u32,
        measured_position: Angle,
        measured_speed: i32,
        delta: i32,
        speed: i32,
        on_completion: OnCompletion,
    ) -> Result<()> {
        let (anchor_position, anchor_speed) = if self.is_active() {
            let v = self.trajectory.get_last_vertex(self.get_ref_time(now));
            (v.position, v.speed)
        } else {
            (measured_position, measured_speed)
        };
        let target = anchor_position.add_mdeg(delta);
        self.start_position_control(now, anchor_position, anchor_speed, target, speed, on_completion)
    }

    /// Starts holding the current measured position, used by `track_target`
    /// and smart-passive.
    pub fn start_position_control_hold(&mut self, now: u32, measured_position: Angle) {
        let traj = Trajectory::make_constant(now, measured_position);
        self.start(ControllerType::Position, traj, OnCompletion::HoldAfter);
    }

    /// Starts tracking a fixed-duration (or forever) speed profile.
    pub fn start_timed_control(
        &mut self,
        now: u32,
        measured_position: Angle,
        measured_speed: i32,
        duration_ms: u32,
        speed: i32,
        on_completion: OnCompletion,
    ) -> Result<()> {
        let continue_running =
            matches!(on_completion, OnCompletion::ContinueAfter) || duration_ms == DURATION_FOREVER_MS;
        let start = Vertex {
            time: now,
            position: measured_position,
            speed: measured_speed,
        };
        let traj = Trajectory::new_time_command(
            start,
            duration_ms,
            speed,
            self.settings.speed_max,
            self.settings.accel,
            self.settings.decel,
            continue_running,
        )?;
        self.start(ControllerType::Timed, traj, on_completion);
        Ok(())
    }

    /// Stops tracking; the caller (servo) decides what actuation follows
    /// from `on_completion()`.
    pub fn stop(&mut self) {
        self.state = ControlState::Idle;
        self.position_integrator.reset();
        self.speed_integrator.reset();
        self.paused_ticks = 0;
        self.pid_average = 0;
    }

    pub fn reset(&mut self, position: Angle) {
        self.stop();
        self.trajectory = Trajectory::make_constant(0, position);
    }

    pub fn on_completion(&self) -> OnCompletion {
        self.on_completion
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    /// Reduced kp values are only needed for some motors under slow speed
    /// conditions; above `pid_kp_low_speed_threshold` (or with zero error)
    /// the nominal `kp` applies unconditionally. Below that threshold, two
    /// independent piecewise-affine blends are computed and the larger one
    /// wins, mirroring `pbio_control_get_pid_kp`:
    ///
    /// - `kp_pwa` grows slower than linear close to the reference (to avoid
    ///   jerk/current spikes while steadily tracking at low speed), then at
    ///   the configured rate further out.
    /// - `kp_target` is constrained by distance to the *final* target
    ///   instead of the instantaneous reference, so a reduced gain can never
    ///   prevent reaching the endpoint: full `kp` inside the saturation
    ///   band, reduced `kp` once far enough away that saturation isn't a
    ///   risk, blended in between.
    fn adaptive_kp(settings: &ControllerSettings, position_error: i32, target_error: i32, abs_command_speed: i32) -> i32 {
        if abs_command_speed >= settings.pid_kp_low_speed_threshold || position_error == 0 {
            return settings.kp;
        }

        let position_error = position_error.abs();
        let target_error = target_error.abs();

        let kp_low_pct = settings.kp_low_pct.max(1);
        let kp_low = settings.kp * kp_low_pct / 100;

        let kp_pwa = if position_error <= settings.low_error_threshold {
            kp_low
        } else {
            settings.kp - settings.low_error_threshold.saturating_mul(settings.kp - kp_low) / position_error
        };

        // Proportional control saturates where the error leads to maximum
        // actuation; below that, we can afford the reduced gain and still
        // guarantee we reach the target.
        let saturation_lower = (settings.max_torque as i64 * 1_000 / settings.kp.max(1) as i64) as i32;
        let saturation_upper = saturation_lower.saturating_mul(100) / kp_low_pct;

        let kp_target = if target_error < saturation_lower {
            settings.kp
        } else if target_error > saturation_upper {
            kp_low
        } else {
            // Gradually shift towards the higher value as we get closer to
            // the final target, to avoid a sudden transition.
            let span = (saturation_upper - saturation_lower).max(1) as i64;
            kp_low
                + (settings.kp as i64 * (100 - kp_low_pct) as i64 * (saturation_upper - target_error) as i64 / span / 100) as i32
        };

        // The most constrained objective is obtained by taking the highest value.
        kp_pwa.max(kp_target)
    }

    /// One control tick: computes the PID torque command and returns it
    /// alongside the current [`ControlStatus`]. `loop_ticks` is the elapsed
    /// time since the previous call (normally constant).
    pub fn update(
        &mut self,
        now: u32,
        measured_position: Angle,
        measured_speed: i32,
        loop_ticks: u32,
        feedforward_torque: i32,
    ) -> (i32, ControlStatus) {
        if !self.is_active() {
            return (0, ControlStatus::empty());
        }

        let ref_time = self.get_ref_time(now);
        let r: Reference = self.trajectory.get_reference(ref_time);
        let endpoint = self.trajectory.get_endpoint();

        let position_error = r.position.diff_mdeg(measured_position);
        let speed_error = r.speed - measured_speed;

        // Distance to the *final* target, used only to keep kp from being
        // reduced so far that the endpoint becomes unreachable; timed moves
        // have no fixed target, so this is unconstrained for them.
        let target_error = match self.controller_type {
            ControllerType::Position => endpoint.position.diff_mdeg(measured_position),
            ControllerType::Timed => i32::MAX,
        };

        let integrator_term = match self.controller_type {
            ControllerType::Position => {
                self.position_integrator.update(
                    position_error,
                    loop_ticks,
                    self.settings.integral_change_max,
                    self.settings.integral_deadzone,
                );
                self.position_integrator.value()
            }
            ControllerType::Timed => {
                self.speed_integrator.update(
                    position_error,
                    loop_ticks,
                    self.settings.integral_change_max,
                    self.settings.integral_deadzone,
                );
                self.speed_integrator.get_error(position_error) - position_error
            }
        };

        let kp = Self::adaptive_kp(&self.settings, position_error, target_error, self.trajectory.get_abs_command_speed());
        let proportional = (kp as i64 * position_error as i64) / 1_000;
        let integral = (self.settings.ki as i64 * integrator_term as i64) / 1_000;
        let derivative = (self.settings.kd as i64 * speed_error as i64) / 1_000;

        let pid_output = proportional + integral + derivative;
        let torque = (pid_output + feedforward_torque as i64).clamp(
            -self.settings.max_torque as i64,
            self.settings.max_torque as i64,
        ) as i32;

        // Anti-windup, mirroring `pbio_control_update`'s windup check: the
        // integrator pauses only once the *proportional* term alone would
        // already overrun a margin above the torque ceiling (not just
        // whenever the clamped output saturates), and only while doing so
        // keeps driving further the same way the reference is already
        // moving and accelerating — reversing either one means the motor is
        // catching up, not winding up further. The margin itself and the
        // sign checks use the nominal `kp`, not the (possibly reduced)
        // adaptive one used for the proportional term.
        let loop_ms = loop_ticks / crate::hal::TICKS_PER_MS;
        let windup_margin_mdeg = (measured_speed.unsigned_abs() as i64 * loop_ms as i64 / 1_000) * 2;
        let max_windup_torque =
            self.settings.max_torque as i64 + (windup_margin_mdeg * self.settings.kp as i64) / 1_000;
        // Speed rounded to zero when small, to avoid a false reverse-detect
        // right around a near-zero crossing.
        let speed_for_direction_check = if measured_speed.abs() < self.settings.stall_speed_limit {
            0
        } else {
            measured_speed
        };
        let direction_error = r.speed - speed_for_direction_check;
        let not_opposing_motion = direction_error == 0 || proportional.signum() != -(direction_error.signum() as i64);
        let not_opposing_acceleration = r.acceleration == 0 || proportional.signum() != -(r.acceleration.signum() as i64);
        let pushing_against_saturation =
            proportional.abs() >= max_windup_torque && not_opposing_motion && not_opposing_acceleration;

        let integrator = match self.controller_type {
            ControllerType::Position => &mut self.position_integrator,
            ControllerType::Timed => &mut self.speed_integrator,
        };

        let was_paused = integrator.is_paused();
        if pushing_against_saturation {
            integrator.pause(now);
        } else if was_paused {
            integrator.resume();
        }
        if integrator.is_paused() {
            self.paused_ticks = self.paused_ticks.saturating_add(loop_ticks);
        }

        let (stalled, _dur) = integrator.stalled(
            now,
            measured_speed,
            r.speed,
            self.settings.stall_speed_limit,
            self.settings.stall_time,
        );

        self.pid_average =
            ((self.pid_average as i64 * (100 - CONTROL_LOOP_TIME_MS) + torque as i64 * CONTROL_LOOP_TIME_MS) / 100) as i32;

        // Completion test, mirroring `pbio_control_check_completion`: timed
        // moves complete on elapsed time (never, if running forever);
        // position moves with a nonzero endpoint speed complete once the
        // target has been crossed; position moves settling to a stop
        // complete once within tolerance of both position and speed.
        let reached_target = match self.controller_type {
            ControllerType::Timed => !self.trajectory_continues() && ticks_diff(ref_time, endpoint.time) >= 0,
            ControllerType::Position => {
                if endpoint.speed != 0 {
                    target_error.signum() != endpoint.speed.signum()
                } else {
                    measured_speed.abs() < self.settings.speed_tolerance && target_error.abs() <= self.settings.position_tolerance
                }
            }
        };

        // Still within the smart-passive grace window: keep actuating past
        // nominal completion so a chained relative command can pick up
        // from the endpoint without ever having gone idle.
        let in_smart_window = reached_target
            && self.on_completion.is_passive_smart()
            && ticks_diff(ref_time, endpoint.time.wrapping_add(self.settings.smart_passive_hold_time)) < 0;

        let stop_now = reached_target && !self.on_completion.keeps_actuating() && !in_smart_window;

        self.last_update = now;

        let mut status = ControlStatus::ACTIVE;
        if stalled {
            status = status.union(ControlStatus::STALLED);
        }
        if stop_now {
            status = status.union(ControlStatus::DONE);
        }
        (torque, status)
    }

    fn trajectory_continues(&self) -> bool {
        self.trajectory.get_duration() == u32::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ControllerSettings {
        ControllerSettings {
            kp: 4_000,
            ki: 200,
            kd: 100,
            speed_max: 1_000_000,
            accel: 2_000_000,
            decel: 2_000_000,
            integral_deadzone: 200,
            integral_change_max: 10_000,
            stall_speed_limit: 5_000,
            stall_time: 2_000,
            max_torque: 200_000,
            pid_kp_low_speed_threshold: 200_000,
            kp_low_pct: 50,
            low_error_threshold: 5_000,
            position_tolerance: 500,
            speed_tolerance: 5_000,
            smart_passive_hold_time: 1_000,
        }
    }

    #[test]
    fn idle_controller_outputs_nothing() {
        let mut ctl = Controller::new(settings());
        let (torque, status) = ctl.update(0, Angle::ZERO, 0, 100, 0);
        assert_eq!(torque, 0);
        assert!(!status.is_active());
    }

    #[test]
    fn position_control_drives_toward_target() {
        let mut ctl = Controller::new(settings());
        ctl.start_position_control(0, Angle::ZERO, 0, Angle::new(0, 90_000), 500_000, OnCompletion::CoastAfter)
            .unwrap();
        let (torque, status) = ctl.update(10, Angle::ZERO, 0, 10, 0);
        assert!(status.is_active());
        assert!(torque > 0, "expected positive torque driving toward a positive target");
    }

    #[test]
    fn reports_done_once_settled_at_endpoint() {
        let mut ctl = Controller::new(settings());
        let target = Angle::new(0, 10_000);
        ctl.start_position_control(0, Angle::ZERO, 0, target, 500_000, OnCompletion::CoastAfter)
            .unwrap();
        let duration = ctl.trajectory().get_duration();
        let (_torque, status) = ctl.update(duration + 1_000, target, 0, 10, 0);
        assert!(status.is_done());
    }

    #[test]
    fn saturated_opposing_error_pauses_integrator_and_reports_stall() {
        let mut s = settings();
        s.max_torque = 10; // trivially easy to saturate
        let mut ctl = Controller::new(s);
        ctl.start_position_control(0, Angle::ZERO, 0, Angle::new(0, 90_000), 500_000, OnCompletion::CoastAfter)
            .unwrap();
        let mut now = 0u32;
        let mut stalled = false;
        for _ in 0..400 {
            now += 10;
            let (_torque, status) = ctl.update(now, Angle::ZERO, 0, 10, 0);
            stalled = stalled || status.is_stalled();
        }
        assert!(stalled);
    }

    #[test]
    fn relative_command_anchors_onto_active_trajectory_endpoint() {
        let mut ctl = Controller::new(settings());
        ctl.start_position_control(0, Angle::ZERO, 0, Angle::new(0, 50_000), 500_000, OnCompletion::ContinueAfter)
            .unwrap();
        let first_endpoint = ctl.trajectory().get_endpoint();
        ctl.start_position_control_relative(1, Angle::ZERO, 0, 40_000, 500_000, OnCompletion::CoastAfter)
            .unwrap();
        let new_target = ctl.trajectory().get_endpoint().position;
        assert_eq!(new_target, first_endpoint.position.add_mdeg(40_000));
    }

    #[test]
    fn adaptive_kp_is_unreduced_above_the_low_speed_threshold() {
        let s = settings();
        let kp = Controller::adaptive_kp(&s, 50_000, 200_000, s.pid_kp_low_speed_threshold);
        assert_eq!(kp, s.kp);
    }

    #[test]
    fn adaptive_kp_is_unreduced_at_zero_position_error() {
        let s = settings();
        let kp = Controller::adaptive_kp(&s, 0, 200_000, 0);
        assert_eq!(kp, s.kp);
    }

    #[test]
    fn adaptive_kp_is_reduced_far_from_a_distant_target_at_low_speed() {
        let s = settings();
        // abs_command_speed below threshold, and the final target itself is
        // far away (beyond the saturation band), so nothing forces kp back
        // up to guarantee reachability.
        let kp = Controller::adaptive_kp(&s, 50_000, 200_000, 0);
        assert!(kp < s.kp, "expected a reduced gain, got {kp}");
    }

    #[test]
    fn adaptive_kp_restores_full_gain_near_the_final_target() {
        let s = settings();
        // Same instantaneous position error and low command speed as above,
        // but the final target is now close (inside the saturation band) —
        // kp must come back up to guarantee the target is actually reached.
        let kp = Controller::adaptive_kp(&s, 50_000, 10_000, 0);
        assert_eq!(kp, s.kp);
    }
}
