//! Error integrators shared by the position and time control modes.
//!
//! Both integrators accumulate a per-tick error, clamp how much they can
//! move in a single tick, dead-band small errors to zero, and can be
//! paused/resumed by the controller's wind-up detector. A paused integrator
//! that's been paused for a while with the motor barely moving is how a
//! stall gets reported.

use crate::hal::ticks_diff;

/// Accumulates position error for position-mode control.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, defmt::Format)]
pub struct PositionIntegrator {
    count: i32,
    paused: bool,
    time_pause_begin: u32,
    stall_start: Option<u32>,
}

impl PositionIntegrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Accumulates `error` (a position error in mdeg) for one tick of
    /// `loop_ticks` duration, honoring `integral_change_max`/
    /// `integral_deadzone`. No-op while paused.
    pub fn update(&mut self, error: i32, loop_ticks: u32, integral_change_max: i32, integral_deadzone: i32) {
        if self.paused {
            return;
        }
        if error.abs() <= integral_deadzone {
            return;
        }
        let delta = error.saturating_mul(loop_ticks as i32);
        let delta = delta.clamp(-integral_change_max, integral_change_max);
        self.count = self.count.saturating_add(delta);
    }

    pub fn value(&self) -> i32 {
        self.count
    }

    /// Pauses accumulation (called when the wind-up detector trips),
    /// remembering when the pause started so a later `stalled` query can
    /// measure its duration.
    pub fn pause(&mut self, now: u32) {
        if !self.paused {
            self.paused = true;
            self.time_pause_begin = now;
        }
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.stall_start = None;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// True once the integrator has been paused, with the motor barely
    /// moving against a reference that's still pushing, for at least
    /// `stall_time` ticks.
    pub fn stalled(
        &mut self,
        now: u32,
        measured_speed: i32,
        ref_speed: i32,
        stall_speed_limit: i32,
        stall_time: u32,
    ) -> (bool, u32) {
        if !self.paused {
            self.stall_start = None;
            return (false, 0);
        }
        let pushing = ref_speed != 0 && measured_speed.signum() != -ref_speed.signum();
        let slow_enough = measured_speed.abs() < stall_speed_limit;
        if !(slow_enough && pushing) {
            self.stall_start = None;
            return (false, 0);
        }
        let start = *self.stall_start.get_or_insert(now);
        let dur = ticks_diff(now, start).max(0) as u32;
        (dur >= stall_time, dur)
    }
}

/// Integrates position error accumulated while running a timed trajectory,
/// so the proportional term stays consistent with real position even when
/// load slows the motor down relative to the reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, defmt::Format)]
pub struct SpeedIntegrator {
    count: i32,
    paused: bool,
    time_pause_begin: u32,
    stall_start: Option<u32>,
}

impl SpeedIntegrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn update(&mut self, position_error: i32, loop_ticks: u32, integral_change_max: i32, integral_deadzone: i32) {
        if self.paused {
            return;
        }
        if position_error.abs() <= integral_deadzone {
            return;
        }
        let delta = position_error.saturating_mul(loop_ticks as i32);
        let delta = delta.clamp(-integral_change_max, integral_change_max);
        self.count = self.count.saturating_add(delta);
    }

    /// The integrator-compensated error used in the proportional term: the
    /// raw error offset by the accumulated correction.
    pub fn get_error(&self, position_error: i32) -> i32 {
        position_error.saturating_add(self.count)
    }

    pub fn pause(&mut self, now: u32) {
        if !self.paused {
            self.paused = true;
            self.time_pause_begin = now;
        }
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.stall_start = None;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn stalled(
        &mut self,
        now: u32,
        measured_speed: i32,
        ref_speed: i32,
        stall_speed_limit: i32,
        stall_time: u32,
    ) -> (bool, u32) {
        if !self.paused {
            self.stall_start = None;
            return (false, 0);
        }
        let pushing = ref_speed != 0 && measured_speed.signum() != -ref_speed.signum();
        let slow_enough = measured_speed.abs() < stall_speed_limit;
        if !(slow_enough && pushing) {
            self.stall_start = None;
            return (false, 0);
        }
        let start = *self.stall_start.get_or_insert(now);
        let dur = ticks_diff(now, start).max(0) as u32;
        (dur >= stall_time, dur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadzone_suppresses_small_errors() {
        let mut integ = PositionIntegrator::new();
        integ.update(2, 5, 1000, 8);
        assert_eq!(integ.value(), 0);
    }

    #[test]
    fn change_per_tick_is_clamped() {
        let mut integ = PositionIntegrator::new();
        integ.update(1_000_000, 5, 100, 8);
        assert_eq!(integ.value(), 100);
    }

    #[test]
    fn paused_integrator_does_not_accumulate() {
        let mut integ = PositionIntegrator::new();
        integ.pause(0);
        integ.update(1000, 5, 1000, 8);
        assert_eq!(integ.value(), 0);
    }

    #[test]
    fn stall_requires_pause_slow_speed_and_opposing_reference() {
        let mut integ = PositionIntegrator::new();
        // Not paused: never stalled regardless of speeds.
        let (stalled, _) = integ.stalled(0, 0, 500, 20, 2000);
        assert!(!stalled);

        integ.pause(0);
        // Paused, slow, reference pushing forward against near-zero speed:
        // stall timer starts but hasn't reached stall_time yet.
        let (stalled, dur) = integ.stalled(100, 1, 500, 20, 2000);
        assert!(!stalled);
        assert_eq!(dur, 100);

        let (stalled, dur) = integ.stalled(2100, 1, 500, 20, 2000);
        assert!(stalled);
        assert_eq!(dur, 2100);
    }

    #[test]
    fn resume_clears_stall_timer() {
        let mut integ = PositionIntegrator::new();
        integ.pause(0);
        integ.stalled(2100, 1, 500, 20, 2000);
        integ.resume();
        let (stalled, dur) = integ.stalled(2200, 1, 500, 20, 2000);
        assert!(!stalled);
        assert_eq!(dur, 0);
    }

    #[test]
    fn speed_integrator_error_offsets_position_error() {
        let mut integ = SpeedIntegrator::new();
        integ.update(100, 5, 1000, 8);
        let err = integ.get_error(50);
        assert_eq!(err, 50 + integ.value_for_test());
    }

    impl SpeedIntegrator {
        fn value_for_test(&self) -> i32 {
            self.count
        }
    }
}
