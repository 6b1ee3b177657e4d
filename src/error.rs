//! Error type of the NVM core.

use thiserror::Error;

use crate::controller::Status;
use crate::deferred::Completion;
use crate::region::{MemoryKind, Operation};

/// Every failure an NVM operation can report.
///
/// A stalled option commit is not represented here: it ends in
/// [`Controller::system_reset`](crate::Controller::system_reset).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Request validation
    #[error("request of {len} bytes is too short, at least {min} bytes are required")]
    RequestTooShort { len: usize, min: usize },
    #[error("page {page} is beyond the last page {max}")]
    PageOutOfRange { page: u16, max: u16 },
    #[error("address {address:#010x} is not aligned to {alignment} bytes")]
    Misaligned { address: u32, alignment: usize },
    #[error("{len} bytes at {address:#010x} do not fit in the {kind} region")]
    AddressOutOfBounds {
        address: u32,
        len: usize,
        kind: MemoryKind,
    },
    #[error("no memory region is mapped at {0:#010x}")]
    AddressNotMapped(u32),
    #[error("option bytes must be written from the start of the area ({start:#010x}), not {address:#010x}")]
    OptionAddress { address: u32, start: u32 },
    #[error("{operation} is not supported by the {kind} region")]
    Unsupported { kind: MemoryKind, operation: Operation },
    #[error("no {0} region is registered")]
    UnsupportedRegion(MemoryKind),
    #[error("invalid write protection state {0:#04x}")]
    InvalidState(u8),
    #[error("invalid read protection level {0:#04x}")]
    InvalidRdpLevel(u8),
    #[error("invalid memory layout: {0}")]
    InvalidLayout(String),

    // Controller faults
    #[error("programming the double word at {address:#010x} failed: {status:?}")]
    Program { address: u32, status: Status },
    #[error("erase failed: {status:?}")]
    Erase { status: Status },
    #[error("{failed} of {total} page erases failed")]
    PagesFailed { failed: usize, total: usize },
    #[error("option byte programming failed: {status:?}")]
    OptionProgram { status: Status },
}

impl Error {
    /// What is left to do after the failed operation.
    ///
    /// A failed option program may already have changed option registers,
    /// so the option reload is still due.
    pub fn completion(&self) -> Completion {
        match self {
            Error::OptionProgram { .. } => Completion::ReloadOptions,
            _ => Completion::Done,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
