//! Per-port device orchestration: owns one [`crate::lump::LumpDevice`] and
//! the UART it's wired to, and exposes the public, synchronous-looking API
//! application code actually calls (`is_ready`, `set_mode`, `get_data`,
//! `get_angle`, ...). All of the actual protocol work happens in
//! [`crate::lump`]; this module is the thin per-port wrapper that picks
//! which backend (LUMP today) serves a given physical port.

use crate::angle::Angle;
use crate::error::Result;
use crate::hal::{Clock, Uart};
use crate::lump::LumpDevice;

/// One physical motor/sensor port: a UART peripheral plus the LUMP
/// connection state machine layered over it.
pub struct Port<C, U> {
    clock: C,
    uart: U,
    device: LumpDevice,
}

impl<C: Clock, U: Uart> Port<C, U> {
    pub fn new(clock: C, uart: U) -> Self {
        Port {
            clock,
            uart,
            device: LumpDevice::new(),
        }
    }

    /// Advances the port's connection state machine. Call this frequently
    /// (every control tick is the intended cadence) — it never blocks.
    pub fn poll(&mut self) -> Result<()> {
        let now_ms = crate::hal::ticks_to_ms(self.clock.now_ticks());
        self.device.poll(&mut self.uart, now_ms)
    }

    pub fn is_ready(&self) -> Result<()> {
        self.device.is_ready()
    }

    pub fn type_id(&self) -> u8 {
        self.device.type_id()
    }

    pub fn mode(&self) -> u8 {
        self.device.mode()
    }

    pub fn assert_type_id(&self, expected: u8) -> Result<u8> {
        self.device.assert_type_id(expected)
    }

    pub fn set_mode(&mut self, mode: u8) -> Result<()> {
        self.device.set_mode(mode)
    }

    pub fn get_data(&self, mode: u8) -> Result<&[u8]> {
        self.device.get_data(mode)
    }

    pub fn set_mode_with_data(&mut self, mode: u8, data: &[u8]) -> Result<()> {
        self.device.set_mode_with_data(mode, data)
    }

    pub fn get_angle(&self, get_abs_angle: bool) -> Result<Angle> {
        self.device.get_angle(get_abs_angle)
    }

    /// Forces the device to exit and re-run the sync handshake, useful for
    /// legacy sensors that only re-calibrate on reset.
    pub fn request_reset(&mut self) -> Result<()> {
        self.device.request_reset()
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

    struct NullUart;
    impl Uart for NullUart {
        fn set_baud(&mut self, _rate: u32) -> Result<()> {
            Ok(())
        }
        fn flush(&mut self) {}
        fn poll_write(&mut self, _buf: &[u8]) -> Result<IoPoll<()>> {
            Ok(IoPoll::Pending)
        }
        fn poll_read(&mut self, _buf: &mut [u8]) -> Result<IoPoll<()>> {
            Ok(IoPoll::Pending)
        }
    }

    #[test]
    fn fresh_port_is_not_ready() {
        let port = Port::new(FakeClock { now: Cell::new(0) }, NullUart);
        assert!(port.is_ready().is_err());
    }

    #[test]
    fn poll_does_not_panic_with_no_data_available() {
        let mut port = Port::new(FakeClock { now: Cell::new(0) }, NullUart);
        port.poll().unwrap();
        port.poll().unwrap();
    }
}
