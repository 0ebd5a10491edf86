//! Minimal on-target bring-up binary: wires `pbio_motor_core` to RTT logging
//! and a panic handler so the control loop can be exercised on real
//! hardware. Real register access (UART/timer/GPIO binding to an actual
//! motor/tacho) is board bring-up and stays out of this crate's scope —
//! this binary drives the core against a stand-in clock/driver/tacho so it
//! links and runs, proving the wiring rather than a real motor move.

#![no_main]
#![no_std]

use cortex_m_rt::entry;
use defmt::println;
use defmt_rtt as _;
use panic_probe as _;

use pbio_motor_core::angle::Angle;
use pbio_motor_core::devices::DeviceTypeId;
use pbio_motor_core::error::Result;
use pbio_motor_core::hal::{Clock, MotorDriver, Tacho};
use pbio_motor_core::servo::{OnCompletion, Servo, ServoSetup};

/// Free-running tick counter a hardware systick/timer ISR would bump on a
/// real board; here the main loop advances the same static directly since
/// nothing binds an actual timer interrupt. A `Servo` only ever reads it
/// through the `Clock` impl, so ownership of the ticking stays with `main`.
static TICKS: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(0);

struct DemoClock;

impl Clock for DemoClock {
    fn now_ticks(&self) -> u32 {
        TICKS.load(core::sync::atomic::Ordering::Relaxed)
    }
}

/// Stand-in for a PWM/H-bridge motor driver; a real binding would program a
/// timer's duty-cycle register here instead.
struct DemoDriver;

impl MotorDriver for DemoDriver {
    fn coast(&mut self) -> Result<()> {
        Ok(())
    }
    fn set_duty(&mut self, _ppm: i32) -> Result<()> {
        Ok(())
    }
}

/// Stand-in for a quadrature-decoded tachometer; a real binding would read
/// a GPIO-edge-driven counter here instead.
struct DemoTacho {
    angle: Angle,
}

impl Tacho for DemoTacho {
    fn get_angle(&self) -> Result<Angle> {
        Ok(self.angle)
    }
    fn reset_angle(&mut self, angle: Angle, _to_abs: bool) -> Result<Angle> {
        self.angle = angle;
        Ok(angle)
    }
}

#[entry]
fn main() -> ! {
    println!("pbio_motor_core demo: bring-up binary, no real hardware bound");

    let mut servo = Servo::setup(
        DemoClock,
        DemoDriver,
        DemoTacho { angle: Angle::ZERO },
        ServoSetup {
            device_type: DeviceTypeId::LargeMotor,
            gear_ratio: 1,
            precision_profile: 50,
            precision_profile_reduced: 50,
            reverse: false,
        },
    )
    .expect("stub tacho never fails setup");

    servo
        .run_target(90, 200, OnCompletion::HoldAfter)
        .expect("stub driver never fails a command");

    loop {
        TICKS.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        if let Err(e) = servo.update() {
            println!("servo tick error: {}", e.as_str());
        }
        cortex_m::asm::delay(1_000);
    }
}
