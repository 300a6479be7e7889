//! Stable status codes and transfer-status taxonomy for the engine's public API.
//!
//! These integers are part of the wire/API contract: they must never be renumbered.

use std::fmt;

/// A stable, externally-visible result code.
///
/// Mirrors the original engine's `Status` enum one-for-one; the numeric values
/// are load-bearing and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    ParamInvalid = 103_900,
    Timeout = 103_901,
    NotConnected = 103_902,
    AlreadyConnected = 103_903,
    NotifyFailed = 103_904,
    Unsupported = 103_905,
    ResourceExhausted = 203_900,
    Failed = 503_900,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({})", self.code())
    }
}

impl From<Status> for i32 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

/// Outcome of polling a transfer request.
///
/// Distinct from [`Status`]: a `TransferSync`/`TransferAsync` call can itself
/// return `Status::Success` (the batch was launched) while the transfer it
/// launched is still `Waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Waiting,
    Completed,
    Timeout,
    Failed,
}
