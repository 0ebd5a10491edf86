//! Per-motor-type constants: electrical/mechanical model parameters and the
//! derived controller defaults computed from them.
//!
//! Settings are keyed on the LEGO UART type id reported during LUMP sync
//! rather than loaded at runtime, since the device population is closed and
//! known ahead of time.

/// LEGO UART device type ids relevant to the motor control core. Sensor-only
/// ids exist in the wire protocol but aren't enumerated here since this
/// crate never interprets their data payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
pub enum DeviceTypeId {
    MediumMotor = 38,
    LargeMotor = 39,
    ColorDistanceSensor = 61,
    TechnicLargeMotor = 47,
    TechnicXlMotor = 48,
    SpikeMediumMotor = 75,
    SpikeLargeMotor = 76,
}

/// Electrical/mechanical model of a brushed DC motor with a gear reduction,
/// used by [`crate::observer::Observer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
pub struct ObserverModel {
    /// Winding resistance-derived torque-per-volt gain (µNm per mV).
    pub torque_per_volt: i32,
    /// Back-EMF-derived speed-per-volt gain (mdeg/s per mV).
    pub speed_per_volt: i32,
    /// Rotor + gearbox inertia, expressed so `inertia * accel` is in µNm.
    pub inertia: i32,
    /// Viscous damping coefficient (µNm per mdeg/s).
    pub damping: i32,
    /// Coulomb (sign-only) friction torque (µNm).
    pub torque_friction: i32,
    /// Speed below which the coulomb friction term is blended to zero
    /// instead of toggling discontinuously at `speed == 0`.
    pub coulomb_friction_speed_cutoff: i32,
    /// Maximum voltage the driver can apply (mV).
    pub max_voltage: i32,
    /// Free-running (no-load) speed at `max_voltage` (mdeg/s).
    pub rated_max_speed: i32,
    pub feedback_gain_low: i32,
    pub feedback_gain_high: i32,
    pub feedback_gain_threshold_mdeg: i32,
    pub feedback_voltage_negligible_mv: i32,
    pub feedback_voltage_stall_ratio_pct: i32,
}

impl ObserverModel {
    pub fn torque_to_voltage(&self, torque_unm: i32) -> i32 {
        if self.torque_per_volt == 0 {
            return 0;
        }
        torque_unm / self.torque_per_volt
    }

    pub fn voltage_to_torque(&self, voltage_mv: i32) -> i32 {
        voltage_mv.saturating_mul(self.torque_per_volt)
    }
}

/// Defaults for [`crate::controller::ControllerSettings`] derived from a
/// motor type and a precision profile, mirroring
/// `pbio_servo_initialize_settings`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
pub struct ControllerDefaults {
    pub stall_speed_limit: i32,
    pub stall_time_ticks: u32,
    pub nominal_voltage_mv: i32,
    pub integral_deadzone: i32,
    pub integral_change_max: i32,
    pub smart_passive_hold_time_ticks: u32,
    pub position_tolerance: i32,
    pub speed_tolerance: i32,
    /// Commanded speed (mdeg/s) at or above which `adaptive_kp` never
    /// reduces gain. `pid_kp_low_speed_threshold` in the original source.
    pub pid_kp_low_speed_threshold: i32,
    /// Percentage of `kp` used as the reduced low-speed gain.
    pub kp_low_pct: i32,
    /// Position error (mdeg) below which the low-speed blend is linear in
    /// the reduced gain. `pid_kp_low_error_threshold` in the original
    /// source.
    pub low_error_threshold: i32,
}

/// Looks up the observer model for a device type. Values are representative
/// of the LEGO motor families the control core targets; unknown ids fall
/// back to the large-motor profile since that's the most conservative
/// (lowest gain, so a misidentified motor undershoots rather than
/// oscillates).
pub fn observer_model(type_id: DeviceTypeId) -> ObserverModel {
    let torque_friction = match type_id {
        DeviceTypeId::MediumMotor | DeviceTypeId::SpikeMediumMotor => 80_000,
        _ => 130_000,
    };
    let max_voltage = 9_000;
    let rated_max_speed = match type_id {
        DeviceTypeId::MediumMotor | DeviceTypeId::SpikeMediumMotor => 1_560_000,
        _ => 1_050_000,
    };
    let torque_per_volt = 2_800;
    let feedback_voltage_negligible_mv = torque_to_voltage_static(torque_per_volt, torque_friction);
    let feedback_gain_low = 200;

    ObserverModel {
        torque_per_volt,
        speed_per_volt: rated_max_speed / max_voltage,
        inertia: match type_id {
            DeviceTypeId::MediumMotor | DeviceTypeId::SpikeMediumMotor => 2_000,
            _ => 5_000,
        },
        damping: 6,
        torque_friction,
        coulomb_friction_speed_cutoff: 500,
        max_voltage,
        rated_max_speed,
        feedback_gain_low,
        // The high gain kicks in once the position error grows past the
        // threshold and is always 7x the low gain, per servo.c's
        // initialize_settings.
        feedback_gain_high: feedback_gain_low * 7,
        feedback_gain_threshold_mdeg: 20_000,
        feedback_voltage_negligible_mv,
        feedback_voltage_stall_ratio_pct: 75,
    }
}

/// Validates a user-chosen precision profile the way
/// `pbio_servo_initialize_settings` does: profiles below 5 would produce a
/// kp large enough to saturate the driver on the first tick of any move.
pub fn validate_precision_profile(precision_profile: i32) -> crate::error::Result<()> {
    if precision_profile < 5 {
        return Err(crate::error::Error::InvalidArg);
    }
    Ok(())
}

fn torque_to_voltage_static(torque_per_volt: i32, torque: i32) -> i32 {
    if torque_per_volt == 0 {
        0
    } else {
        torque / torque_per_volt
    }
}

/// Loads the nominal-voltage-derived controller defaults for a device type
/// at a given `precision_profile` (a user-chosen gear-ratio-like scale
/// factor: larger values trade settling speed for smoother, lower-current
/// motion). Mirrors the nominal-voltage/precision-profile derivation in
/// `pbio_servo_initialize_settings`.
pub fn controller_defaults(type_id: DeviceTypeId, precision_profile: i32) -> ControllerDefaults {
    let model = observer_model(type_id);
    let nominal_voltage_mv = model.max_voltage.min(7_500);
    let nominal_torque = model.voltage_to_torque(nominal_voltage_mv);
    let _ = nominal_torque; // kp/ki/kd derivation lives in controller::gains_from_profile

    ControllerDefaults {
        stall_speed_limit: 20_000,
        stall_time_ticks: 2_000, // 200 ms at 10 kHz ticks
        nominal_voltage_mv,
        integral_deadzone: 8_000,
        integral_change_max: 15_000,
        smart_passive_hold_time_ticks: 1_000, // 100 ms
        position_tolerance: 1_000,            // 1 deg
        speed_tolerance: 5_000,                // 5 deg/s
        // Representative of the per-type reduced-settings table in
        // `pbio_servo_get_reduced_settings` (not retained in the pack): a
        // motor running faster than this never needs gain reduction.
        pid_kp_low_speed_threshold: model.rated_max_speed / 5,
        kp_low_pct: 50,
        low_error_threshold: 5_000, // 5 deg
    }
}

/// Derives (kp, ki, kd) from a nominal torque and a precision profile,
/// mirroring `pid_kp = nominal_torque/precision_profile`,
/// `pid_ki = pid_kp/2`, `pid_kd = pid_kp_reduced/8` (the derivative term
/// takes a separate, coarser precision value than `kp`/`ki`).
pub fn gains_from_profile(type_id: DeviceTypeId, precision_profile: i32, precision_profile_reduced: i32) -> (i32, i32, i32) {
    let model = observer_model(type_id);
    let nominal_voltage_mv = model.max_voltage.min(7_500);
    let nominal_torque = model.voltage_to_torque(nominal_voltage_mv);
    let kp = nominal_torque / precision_profile.max(1);
    let ki = kp / 2;
    let kd_base = nominal_torque / precision_profile_reduced.max(1);
    let kd = kd_base / 8;
    (kp, ki, kd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn torque_to_voltage_round_trips_within_rounding() {
        let model = observer_model(DeviceTypeId::LargeMotor);
        let v = model.torque_to_voltage(model.voltage_to_torque(1000));
        // Integer rounding loses at most one torque_per_volt step.
        assert!((v - 1000).abs() <= 1);
    }

    #[test]
    fn nominal_voltage_is_capped_at_7500mv() {
        let d = controller_defaults(DeviceTypeId::LargeMotor, 100);
        assert_eq!(d.nominal_voltage_mv, 7_500);
    }

    #[test]
    fn gains_scale_inversely_with_precision_profile() {
        let (kp_loose, _, _) = gains_from_profile(DeviceTypeId::LargeMotor, 200, 200);
        let (kp_tight, _, _) = gains_from_profile(DeviceTypeId::LargeMotor, 50, 50);
        assert!(kp_tight > kp_loose);
    }
}
