//! Piecewise constant-acceleration reference curves.
//!
//! A trajectory is an accel ramp, a constant-speed cruise, and a decel ramp
//! back to rest (or, for a "continuing" command, no decel ramp at all — the
//! curve just keeps cruising). It is stored as four vertices plus the
//! constant acceleration that applies across each of the three segments
//! between them, per the "starting vertex plus three segment accelerations
//! and three segment end-times" representation.

use crate::angle::Angle;
use crate::error::{Error, Result};
use crate::hal::TICKS_PER_MS;

const TICK_HZ: i64 = 10_000;

/// Sentinel duration (ms) meaning "run until told otherwise".
pub const DURATION_FOREVER_MS: u32 = u32::MAX;

/// A point on the reference curve.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, defmt::Format)]
pub struct Vertex {
    pub time: u32,
    pub position: Angle,
    pub speed: i32,
}

/// A reference sample returned by [`Trajectory::get_reference`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
pub struct Reference {
    pub position: Angle,
    pub speed: i32,
    pub acceleration: i32,
    pub time: u32,
}

/// A piecewise constant-acceleration motion curve.
#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
pub struct Trajectory {
    vertices: [Vertex; 4],
    /// Acceleration applying across `[vertices[i], vertices[i+1])`.
    accelerations: [i32; 3],
    /// True if the curve never decelerates (it keeps cruising forever past
    /// `vertices[3]`).
    continues_forever: bool,
}

fn segment_end(start_pos_mdeg: i64, start_speed: i64, accel: i64, dt_ticks: i64) -> (i64, i64) {
    let speed = start_speed + accel * dt_ticks / TICK_HZ;
    let pos = start_pos_mdeg + start_speed * dt_ticks / TICK_HZ
        + accel * dt_ticks * dt_ticks / (2 * TICK_HZ * TICK_HZ);
    (pos, speed)
}

fn clamp_abs(v: i32, max_abs: i32) -> i32 {
    v.clamp(-max_abs, max_abs)
}

impl Trajectory {
    /// Installs a zero-length curve that just holds `position`, used for
    /// `track_target` / position-hold commands, which skip ramping
    /// entirely.
    pub fn make_constant(time: u32, position: Angle) -> Trajectory {
        let v = Vertex {
            time,
            position,
            speed: 0,
        };
        Trajectory {
            vertices: [v; 4],
            accelerations: [0; 3],
            continues_forever: false,
        }
    }

    /// Builds a trajectory that runs from `start` to `target` at up to
    /// `speed_cmd` (sign ignored — direction is taken from the sign of the
    /// displacement), accelerating/decelerating at `accel`/`decel`
    /// (magnitudes, both must be positive). If `continue_running`, the
    /// curve reaches `target` while still moving at cruise speed instead of
    /// decelerating to rest there.
    pub fn new_angle_command(
        start: Vertex,
        target: Angle,
        speed_cmd: i32,
        speed_max: i32,
        accel: i32,
        decel: i32,
        continue_running: bool,
    ) -> Result<Trajectory> {
        if accel <= 0 || decel <= 0 {
            return Err(Error::InvalidArg);
        }

        let disp = target.diff_mdeg(start.position) as i64;
        let dir: i64 = if disp != 0 {
            disp.signum()
        } else if speed_cmd != 0 {
            speed_cmd.signum() as i64
        } else {
            1
        };
        let speed_cruise = dir * clamp_abs(speed_cmd.abs(), speed_max.abs()) as i64;

        build_profile(start, disp, speed_cruise, accel as i64, decel as i64, continue_running)
    }

    /// Builds a trajectory that runs at `speed_cmd` for `duration_ms`
    /// (or forever, if `duration_ms == DURATION_FOREVER_MS`), ramping at
    /// `accel`/`decel`.
    pub fn new_time_command(
        start: Vertex,
        duration_ms: u32,
        speed_cmd: i32,
        speed_max: i32,
        accel: i32,
        decel: i32,
        continue_running: bool,
    ) -> Result<Trajectory> {
        if accel <= 0 || decel <= 0 {
            return Err(Error::InvalidArg);
        }

        let speed_cruise = clamp_abs(speed_cmd, speed_max.abs()) as i64;
        let a1 = if speed_cruise >= start.speed as i64 {
            accel as i64
        } else {
            -(accel as i64)
        };
        let t1 = if speed_cruise == start.speed as i64 {
            0
        } else {
            (speed_cruise - start.speed as i64).abs() * TICK_HZ / accel as i64
        };
        let (pos1, spd1) = segment_end(0, start.speed as i64, a1, t1);
        let v1 = Vertex {
            time: start.time + t1 as u32,
            position: Angle::from_mdeg_i64(start.position.to_mdeg_i64() + pos1),
            speed: spd1 as i32,
        };

        if duration_ms == DURATION_FOREVER_MS {
            return Ok(Trajectory {
                vertices: [start, v1, v1, v1],
                accelerations: [a1 as i32, 0, 0],
                continues_forever: true,
            });
        }

        let duration_ticks = (duration_ms as i64) * (TICKS_PER_MS as i64);
        let total_t = duration_ticks;

        if continue_running {
            // No decel phase: cruise for whatever time remains.
            let t_cruise = (total_t - t1).max(0);
            let (pos2, _spd2) = segment_end(pos1, spd1, 0, t_cruise);
            let v3 = Vertex {
                time: start.time + (t1 + t_cruise) as u32,
                position: Angle::from_mdeg_i64(start.position.to_mdeg_i64() + pos2),
                speed: spd1 as i32,
            };
            return Ok(Trajectory {
                vertices: [start, v1, v3, v3],
                accelerations: [a1 as i32, 0, 0],
                continues_forever: true,
            });
        }

        // Decelerating finish: may need a triangle fallback if t1 + t3 would
        // exceed the total duration.
        let a = accel as i64;
        let d = decel as i64;
        let t3_nominal = speed_cruise.abs() * TICK_HZ / d;

        let (t1_actual, peak_speed, t3_actual) = if t1 + t3_nominal <= total_t {
            (t1, speed_cruise, t3_nominal)
        } else {
            // Triangle fallback: solve for peak speed m (same sign as
            // cruise) such that ramp time + decel time exactly fills
            // `total_t`.
            let s = if speed_cruise != 0 {
                speed_cruise.signum()
            } else {
                1
            };
            let w0 = start.speed as i64;
            let m = ((total_t * a * d) + w0 * d) / (a + d);
            let m = m.max(0) * s;
            let t1p = (m - w0).abs() * TICK_HZ / a;
            let t3p = m.abs() * TICK_HZ / d;
            (t1p, m, t3p)
        };

        let a1 = if peak_speed >= start.speed as i64 { a } else { -a };
        let (pos1, spd1) = segment_end(0, start.speed as i64, a1, t1_actual);
        let v1 = Vertex {
            time: start.time + t1_actual as u32,
            position: Angle::from_mdeg_i64(start.position.to_mdeg_i64() + pos1),
            speed: spd1 as i32,
        };

        let a3 = if peak_speed >= 0 { -d } else { d };
        let (pos3, spd3) = segment_end(pos1, spd1, a3, t3_actual);
        let v3 = Vertex {
            time: start.time + (t1_actual + t3_actual) as u32,
            position: Angle::from_mdeg_i64(start.position.to_mdeg_i64() + pos3),
            speed: spd3 as i32,
        };

        Ok(Trajectory {
            vertices: [start, v1, v1, v3],
            accelerations: [a1 as i32, 0, a3 as i32],
            continues_forever: false,
        })
    }

    /// Position/speed/acceleration reference at time `t`.
    pub fn get_reference(&self, t: u32) -> Reference {
        let v = &self.vertices;
        if (t as i32).wrapping_sub(v[0].time as i32) <= 0 {
            return Reference {
                position: v[0].position,
                speed: v[0].speed,
                acceleration: self.accelerations[0],
                time: t,
            };
        }
        for i in 0..3 {
            let seg_end = v[i + 1].time;
            if (t as i32).wrapping_sub(seg_end as i32) < 0 || (i == 2 && !self.continues_forever) {
                let dt = (t.wrapping_sub(v[i].time)) as i64;
                let (pos, speed) = segment_end(
                    v[i].position.to_mdeg_i64(),
                    v[i].speed as i64,
                    self.accelerations[i] as i64,
                    dt,
                );
                return Reference {
                    position: Angle::from_mdeg_i64(pos),
                    speed: speed as i32,
                    acceleration: self.accelerations[i],
                    time: t,
                };
            }
        }
        // Past the end: hold still, or keep cruising forever.
        let end = v[3];
        if self.continues_forever {
            let dt = (t.wrapping_sub(end.time)) as i64;
            let (pos, _speed) =
                segment_end(end.position.to_mdeg_i64(), end.speed as i64, 0, dt);
            Reference {
                position: Angle::from_mdeg_i64(pos),
                speed: end.speed,
                acceleration: 0,
                time: t,
            }
        } else {
            Reference {
                position: end.position,
                speed: end.speed,
                acceleration: 0,
                time: t,
            }
        }
    }

    pub fn get_endpoint(&self) -> Vertex {
        self.vertices[3]
    }

    /// The vertex opening the segment active at `t` — used to re-anchor a
    /// follow-up trajectory so repeated commands don't accumulate drift.
    pub fn get_last_vertex(&self, t: u32) -> Vertex {
        let v = &self.vertices;
        let mut last = v[0];
        for i in 0..4 {
            if (t as i32).wrapping_sub(v[i].time as i32) >= 0 {
                last = v[i];
            }
        }
        last
    }

    /// Magnitude of the commanded cruise speed, used for gain scheduling.
    pub fn get_abs_command_speed(&self) -> i32 {
        self.vertices[1].speed.unsigned_abs() as i32
    }

    /// Total duration from start to end, or [`DURATION_FOREVER_MS`]-worth of
    /// ticks if this trajectory never completes.
    pub fn get_duration(&self) -> u32 {
        if self.continues_forever {
            u32::MAX
        } else {
            self.vertices[3].time.wrapping_sub(self.vertices[0].time)
        }
    }

    pub fn start_time(&self) -> u32 {
        self.vertices[0].time
    }

    /// Acceleration of the first segment (`a0` in the original), used to
    /// detect whether a freshly built trajectory is tangent to the one it
    /// replaces so the controller can re-anchor onto it exactly.
    pub fn first_acceleration(&self) -> i32 {
        self.accelerations[0]
    }
}

/// Shared accel/cruise/decel construction for angle commands (time commands
/// have their own variant above since their "remaining distance" isn't known
/// up front — it falls out of the fixed duration instead).
fn build_profile(
    start: Vertex,
    disp: i64,
    speed_cruise: i64,
    accel: i64,
    decel: i64,
    continue_running: bool,
) -> Result<Trajectory> {
    let w0 = start.speed as i64;

    let a1 = if speed_cruise >= w0 { accel } else { -accel };
    let t1 = if speed_cruise == w0 {
        0
    } else {
        (speed_cruise - w0).abs() * TICK_HZ / accel
    };
    let (pos1, spd1) = segment_end(0, w0, a1, t1);

    if continue_running {
        // Cruise all the way to the target; no decel phase.
        let remaining = disp - pos1;
        let t_cruise = if spd1 != 0 {
            remaining / spd1
        } else {
            0
        };
        let t_cruise = t_cruise.max(0);
        let v1 = Vertex {
            time: start.time + t1 as u32,
            position: Angle::from_mdeg_i64(start.position.to_mdeg_i64() + pos1),
            speed: spd1 as i32,
        };
        let end_pos = pos1 + spd1 * t_cruise / TICK_HZ;
        let v3 = Vertex {
            time: start.time + (t1 + t_cruise) as u32,
            position: Angle::from_mdeg_i64(start.position.to_mdeg_i64() + end_pos),
            speed: spd1 as i32,
        };
        return Ok(Trajectory {
            vertices: [start, v1, v3, v3],
            accelerations: [a1 as i32, 0, 0],
            continues_forever: true,
        });
    }

    // Nominal decel phase, assuming cruise speed is reached.
    let t3_nominal = speed_cruise.abs() * TICK_HZ / decel;
    let a3 = if speed_cruise >= 0 { -decel } else { decel };
    let (pos3_rel, _spd3) = segment_end(0, speed_cruise, a3, t3_nominal);

    let cruise_disp = disp - pos1 - pos3_rel;
    // If the cruise distance has the opposite sign of the cruise speed,
    // the ramps alone overshoot the target: fall back to a triangle with a
    // reduced peak speed.
    let needs_triangle = cruise_disp.signum() != speed_cruise.signum() && cruise_disp != 0;

    if !needs_triangle {
        let t_cruise = if speed_cruise != 0 {
            cruise_disp / speed_cruise
        } else {
            0
        };
        let v1 = Vertex {
            time: start.time + t1 as u32,
            position: Angle::from_mdeg_i64(start.position.to_mdeg_i64() + pos1),
            speed: spd1 as i32,
        };
        let v2_pos = pos1 + cruise_disp;
        let v2 = Vertex {
            time: start.time + (t1 + t_cruise) as u32,
            position: Angle::from_mdeg_i64(start.position.to_mdeg_i64() + v2_pos),
            speed: spd1 as i32,
        };
        let v3_pos = v2_pos + pos3_rel;
        let v3 = Vertex {
            time: v2.time + t3_nominal as u32,
            position: Angle::from_mdeg_i64(start.position.to_mdeg_i64() + v3_pos),
            speed: 0,
        };
        Ok(Trajectory {
            vertices: [start, v1, v2, v3],
            accelerations: [a1 as i32, 0, a3 as i32],
            continues_forever: false,
        })
    } else {
        // Triangle: solve for peak speed m (same sign as disp) such that
        // ramping 0..m then m..0 covers exactly `disp - pos_from_w0_phase`.
        // For the common case w0 == 0 this reduces to m = sqrt(2*accel*decel*|disp| / (accel+decel)).
        let s = disp.signum();
        let target = disp.abs();
        // m^2 * (decel + accel) / (2*accel*decel) == target, solving for m
        // via integer sqrt on the scaled value.
        let num = 2 * accel * decel * target;
        let den = accel + decel;
        let m_sq = num / den;
        let m = isqrt(m_sq).max(0);
        let peak = s * m;

        let a1 = if peak >= w0 { accel } else { -accel };
        let t1 = if peak == w0 { 0 } else { (peak - w0).abs() * TICK_HZ / accel };
        let (pos1, spd1) = segment_end(0, w0, a1, t1);
        let v1 = Vertex {
            time: start.time + t1 as u32,
            position: Angle::from_mdeg_i64(start.position.to_mdeg_i64() + pos1),
            speed: spd1 as i32,
        };

        let a3 = if peak >= 0 { -decel } else { decel };
        let t3 = peak.abs() * TICK_HZ / decel;
        let (pos3, _spd3) = segment_end(pos1, spd1, a3, t3);
        let v3 = Vertex {
            time: v1.time + t3 as u32,
            position: Angle::from_mdeg_i64(start.position.to_mdeg_i64() + pos3),
            speed: 0,
        };

        Ok(Trajectory {
            vertices: [start, v1, v1, v3],
            accelerations: [a1 as i32, 0, a3 as i32],
            continues_forever: false,
        })
    }
}

/// Integer square root (Newton's method), used only for the triangle
/// fallback's peak-speed solve.
fn isqrt(n: i64) -> i64 {
    if n <= 0 {
        return 0;
    }
    let mut x = n;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_rest(pos: Angle) -> Vertex {
        Vertex {
            time: 0,
            position: pos,
            speed: 0,
        }
    }

    #[test]
    fn trapezoid_reaches_exact_endpoint() {
        // run_target(500 deg/s, 1000 deg) with a=d=2000 deg/s^2 from rest.
        let target = Angle::new(0, 1_000_000);
        let traj = Trajectory::new_angle_command(
            at_rest(Angle::ZERO),
            target,
            500_000,
            500_000,
            2_000_000,
            2_000_000,
            false,
        )
        .unwrap();
        let end = traj.get_endpoint();
        assert_eq!(end.position, target);
        assert_eq!(end.speed, 0);
        let r = traj.get_reference(end.time);
        assert_eq!(r.position, target);
    }

    #[test]
    fn triangle_fallback_does_not_overshoot() {
        let target = Angle::new(0, 100_000);
        let traj = Trajectory::new_angle_command(
            at_rest(Angle::ZERO),
            target,
            500_000,
            500_000,
            2_000_000,
            2_000_000,
            false,
        )
        .unwrap();
        let end = traj.get_endpoint();
        assert_eq!(end.position, target);
        // Peak speed should stay below the cruise limit in this fallback.
        assert!(traj.get_abs_command_speed() < 500_000);
    }

    #[test]
    fn sign_law_backward_target() {
        // Target behind the start: commanded speed direction must reverse.
        let target = Angle::new(0, -100_000).add_mdeg(0);
        let traj = Trajectory::new_angle_command(
            at_rest(Angle::new(0, 200_000)),
            Angle::new(0, 100_000),
            300_000,
            500_000,
            1_000_000,
            1_000_000,
            false,
        )
        .unwrap();
        assert!(traj.vertices[1].speed < 0);
        let _ = target;
    }

    #[test]
    fn invalid_accel_rejected() {
        let r = Trajectory::new_angle_command(
            at_rest(Angle::ZERO),
            Angle::new(0, 1000),
            1000,
            1000,
            0,
            1000,
            false,
        );
        assert_eq!(r, Err(Error::InvalidArg));
    }

    #[test]
    fn forever_time_command_keeps_cruising() {
        let traj = Trajectory::new_time_command(
            at_rest(Angle::ZERO),
            DURATION_FOREVER_MS,
            200_000,
            500_000,
            2_000_000,
            2_000_000,
            true,
        )
        .unwrap();
        assert_eq!(traj.get_duration(), u32::MAX);
        let far_future = traj.get_reference(1_000_000);
        assert_eq!(far_future.speed, 200_000);
    }

    #[test]
    fn get_last_vertex_picks_active_segment_start() {
        let target = Angle::new(0, 1_000_000);
        let traj = Trajectory::new_angle_command(
            at_rest(Angle::ZERO),
            target,
            500_000,
            500_000,
            2_000_000,
            2_000_000,
            false,
        )
        .unwrap();
        let v = traj.get_last_vertex(0);
        assert_eq!(v.time, 0);
    }
}
