//! Crate-wide error type.
//!
//! Errors are values, never exceptions: nothing in this crate panics or
//! allocates on the error path, and leaf drivers (tacho, motor, UART) are
//! expected to return one of these instead of retrying internally.

/// Failure modes surfaced anywhere in the motor control core.
#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
pub enum Error {
    /// An argument was out of range or otherwise nonsensical, e.g. a
    /// non-positive acceleration or gear ratio.
    InvalidArg,
    /// The call is not valid in the current state, e.g. issuing a run
    /// command to a servo whose update loop isn't registered.
    InvalidOp,
    /// No device is attached to the port, or it is not of the expected type.
    NoDev,
    /// The operation can't complete yet; retry later. Not fatal.
    Again,
    /// A blocking operation (typically UART I/O) exceeded its deadline.
    Timeout,
    /// The underlying transport reported a hardware-level fault.
    Io,
    /// A state machine exhausted its retry budget and gave up.
    Failed,
    /// The requested feature isn't supported by this device type.
    NotSupported,
}

impl Error {
    /// A short machine name, useful for logging without pulling in `Debug`
    /// formatting machinery on the embedded target.
    pub const fn as_str(self) -> &'static str {
        match self {
            Error::InvalidArg => "invalid_arg",
            Error::InvalidOp => "invalid_op",
            Error::NoDev => "no_dev",
            Error::Again => "again",
            Error::Timeout => "timeout",
            Error::Io => "io",
            Error::Failed => "failed",
            Error::NotSupported => "not_supported",
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
