//! Abstractions over the environment this crate is embedded in: a
//! monotonic clock, a motor driver, a tachometer, and a byte-oriented UART.
//!
//! Binding straight to a peripheral HAL would tie the control core to one
//! MCU family, so the boundary is a set of traits instead: the control core
//! builds and tests identically on host (against a simulated clock/UART)
//! and on target (against real registers, wired up by a downstream crate).
//! No impl here ever touches a register — that wiring is board bring-up,
//! out of scope.

use crate::angle::Angle;
use crate::error::Result;

/// Monotonic clock ticking at 10 kHz (100 µs per tick). Implementations
/// must never go backwards; wrap-around is handled by callers using
/// signed differences, so a `u32` tick counter is sufficient for uptimes
/// well beyond a year.
pub trait Clock {
    fn now_ticks(&self) -> u32;
}

/// Signed tick difference `a - b`, correct across a `u32` wraparound.
pub fn ticks_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

pub const TICKS_PER_MS: u32 = 10;

pub fn ms_to_ticks(ms: u32) -> u32 {
    ms * TICKS_PER_MS
}

pub fn ticks_to_ms(ticks: u32) -> u32 {
    ticks / TICKS_PER_MS
}

/// The commanded actuation applied to a motor driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
pub enum Actuation {
    /// High-impedance; motor spins freely.
    Coast,
    /// Both terminals shorted; motor resists motion.
    Brake,
    /// Drive at a duty cycle in `[-1_000_000, 1_000_000]` (parts per million
    /// of full battery voltage).
    Duty(i32),
}

/// Sink for commanded motor actuation. `ppm` is parts-per-million of full
/// battery voltage.
pub trait MotorDriver {
    fn coast(&mut self) -> Result<()>;
    fn set_duty(&mut self, ppm: i32) -> Result<()>;
}

/// Source of absolute shaft angle, typically a quadrature encoder fed by
/// an ISR-driven counter.
pub trait Tacho {
    fn get_angle(&self) -> Result<Angle>;
    /// Resets the reported angle. If `to_abs` is set, `angle` is ignored
    /// and the tacho instead snaps to whatever absolute marker the shaft
    /// carries (e.g. an absolute encoder's power-on position); the
    /// resulting angle is returned either way so the caller (servo) can
    /// reset the observer to match.
    fn reset_angle(&mut self, angle: Angle, to_abs: bool) -> Result<Angle>;
}

/// Outcome of a non-blocking UART operation that may still be in flight.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoPoll<T> {
    Pending,
    Ready(T),
}

/// A byte-oriented UART with configurable baud rate. Reads and writes are
/// polled rather than blocking, since the control core runs on a single
/// cooperative event loop with no thread to block on.
pub trait Uart {
    fn set_baud(&mut self, rate: u32) -> Result<()>;
    fn flush(&mut self);

    /// Starts (or continues) writing `buf`. Returns `Ready(())` once every
    /// byte has been accepted by the driver.
    fn poll_write(&mut self, buf: &[u8]) -> Result<IoPoll<()>>;

    /// Starts (or continues) filling `buf` with `buf.len()` bytes. Returns
    /// `Ready(())` once the buffer is full.
    fn poll_read(&mut self, buf: &mut [u8]) -> Result<IoPoll<()>>;
}
