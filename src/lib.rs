//! Motor control core: trajectory generation, the PID servo controller, the
//! discrete-time state observer, the LUMP sensor/motor protocol, and the
//! per-port device lifecycle that drives it all.
//!
//! `no_std` by default (the `std` feature only widens what's available to
//! host-side tests — the library itself never requires it), and never
//! allocates: every buffer is fixed-capacity, `heapless`-backed bounded
//! firmware state.

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_code)]

pub mod angle;
pub mod controller;
pub mod devices;
pub mod error;
pub mod hal;
pub mod integrator;
pub mod logger;
pub mod lump;
pub mod observer;
pub mod port;
pub mod registry;
pub mod servo;
pub mod trajectory;

pub use angle::Angle;
pub use error::{Error, Result};
