//! 64-bit-equivalent signed angle, represented as a whole rotation count
//! plus a sub-rotation millidegree remainder, so the control loop never
//! needs a 64-bit multiply/divide on targets that lack one natively.

use core::cmp::Ordering;
use core::ops::Neg;

/// Millidegrees per full rotation.
pub const MDEG_PER_ROTATION: i32 = 360_000;

/// A signed angle: `rotations` whole turns plus `millidegrees` in
/// `[0, 360_000)`. Together these behave like a 64-bit millidegree value
/// without requiring 64-bit arithmetic anywhere in the control loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, defmt::Format)]
pub struct Angle {
    pub rotations: i32,
    pub millidegrees: i32,
}

impl Angle {
    pub const ZERO: Angle = Angle {
        rotations: 0,
        millidegrees: 0,
    };

    /// Builds an angle from a rotation count and an arbitrary (possibly
    /// out-of-range or negative) millidegree remainder, normalizing it into
    /// `[0, 360_000)` by carrying whole rotations.
    pub fn new(rotations: i32, millidegrees: i32) -> Self {
        let mut r = rotations;
        let mut m = millidegrees;
        while m < 0 {
            m += MDEG_PER_ROTATION;
            r -= 1;
        }
        while m >= MDEG_PER_ROTATION {
            m -= MDEG_PER_ROTATION;
            r += 1;
        }
        Angle {
            rotations: r,
            millidegrees: m,
        }
    }

    /// Total angle in millidegrees, saturating at `i32::MIN`/`i32::MAX`.
    /// Used only for user-facing display; control math uses [`diff_mdeg`]
    /// instead, since the full value overflows `i32` long before a real
    /// command would.
    pub fn total_mdeg_saturating(self) -> i32 {
        self.rotations
            .saturating_mul(MDEG_PER_ROTATION)
            .saturating_add(self.millidegrees)
    }

    /// `self - other`, returned as a saturated 32-bit millidegree
    /// difference. This is the only subtraction the controller performs;
    /// it never needs the true (possibly enormous) angle difference, only
    /// one bounded by what a single command could plausibly span.
    pub fn diff_mdeg(self, other: Angle) -> i32 {
        let d_rot = self.rotations.saturating_sub(other.rotations);
        let d_mdeg_from_rot = d_rot.saturating_mul(MDEG_PER_ROTATION);
        let d_mdeg = self.millidegrees - other.millidegrees;
        d_mdeg_from_rot.saturating_add(d_mdeg)
    }

    /// Returns a new angle offset by `delta` millidegrees (which may be
    /// negative or exceed one rotation).
    pub fn add_mdeg(self, delta: i32) -> Angle {
        Angle::new(self.rotations, self.millidegrees + delta)
    }

    /// Whole output-unit degrees (rounded toward zero), applying a gear
    /// ratio (`ctl_steps_per_app_step`) that divides control-unit
    /// millidegrees down to app-unit degrees at the gear train output.
    pub fn ctl_to_app_long(self, gear_ratio: i32) -> i32 {
        let total_mdeg = self.total_mdeg_saturating() as i64;
        let gear_ratio = gear_ratio as i64;
        ((total_mdeg / gear_ratio) / 1000) as i32
    }
}

impl Neg for Angle {
    type Output = Angle;
    fn neg(self) -> Angle {
        Angle::new(-self.rotations, -self.millidegrees)
    }
}

impl PartialOrd for Angle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Angle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rotations
            .cmp(&other.rotations)
            .then(self.millidegrees.cmp(&other.millidegrees))
    }
}

impl Angle {
    /// Builds an angle from a 64-bit millidegree total, used internally by
    /// the trajectory generator where intermediate sums can briefly exceed
    /// what a single `i32` millidegree/rotation pair could hold before
    /// being normalized back down.
    pub fn from_mdeg_i64(total: i64) -> Angle {
        let rotations = total.div_euclid(MDEG_PER_ROTATION as i64) as i32;
        let millidegrees = total.rem_euclid(MDEG_PER_ROTATION as i64) as i32;
        Angle { rotations, millidegrees }
    }

    /// The angle as a 64-bit millidegree total, the inverse of
    /// [`Angle::from_mdeg_i64`].
    pub fn to_mdeg_i64(self) -> i64 {
        self.rotations as i64 * MDEG_PER_ROTATION as i64 + self.millidegrees as i64
    }
}

/// Converts a user-facing whole-degree value (scaled by a gear ratio) into
/// control-unit millidegrees, the inverse of [`Angle::ctl_to_app_long`].
pub fn app_to_ctl_long(app_degrees: i32, gear_ratio: i32) -> Angle {
    let total_mdeg = app_degrees as i64 * gear_ratio as i64 * 1000;
    let rotations = (total_mdeg.div_euclid(MDEG_PER_ROTATION as i64)) as i32;
    let millidegrees = (total_mdeg.rem_euclid(MDEG_PER_ROTATION as i64)) as i32;
    Angle::new(rotations, millidegrees)
}

/// Scales a control-unit speed (mdeg/s) down to an app-unit speed (deg/s)
/// by the gear ratio.
pub fn ctl_to_app_speed(speed_mdeg_s: i32, gear_ratio: i32) -> i32 {
    speed_mdeg_s / gear_ratio / 1000
}

/// Scales an app-unit speed (deg/s) up to a control-unit speed (mdeg/s).
pub fn app_to_ctl_speed(speed_deg_s: i32, gear_ratio: i32) -> i32 {
    speed_deg_s * gear_ratio * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_overflowing_millidegrees() {
        let a = Angle::new(0, 360_500);
        assert_eq!(a, Angle::new(1, 500));
    }

    #[test]
    fn normalizes_negative_millidegrees() {
        let a = Angle::new(0, -500);
        assert_eq!(a, Angle::new(-1, 359_500));
    }

    #[test]
    fn diff_mdeg_basic() {
        let a = Angle::new(1, 0);
        let b = Angle::new(0, 0);
        assert_eq!(a.diff_mdeg(b), MDEG_PER_ROTATION);
        assert_eq!(b.diff_mdeg(a), -MDEG_PER_ROTATION);
    }

    #[test]
    fn diff_mdeg_saturates_instead_of_overflowing() {
        let a = Angle::new(i32::MAX, 0);
        let b = Angle::new(-1, 0);
        assert_eq!(a.diff_mdeg(b), i32::MAX);
    }

    #[test]
    fn wrap_detection_across_a_full_rotation() {
        // Starting at 3500 decidegrees (350_000 mdeg) then receiving a
        // measurement of 100 decidegrees (10_000 mdeg) should look like a
        // forward wrap past 360 degrees once the caller applies the
        // rotation-counting rule (tested directly in the lump module); here
        // we just confirm the raw angle arithmetic used to express it.
        let before = Angle::new(0, 350_000);
        let after = Angle::new(1, 10_000);
        assert_eq!(after.diff_mdeg(before), 20_000);
    }

    #[test]
    fn app_round_trip() {
        let ctl = app_to_ctl_long(90, 3);
        assert_eq!(ctl.ctl_to_app_long(3), 90);
    }
}
