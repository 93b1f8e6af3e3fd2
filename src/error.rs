//! Layered error taxonomy: a crate-level [`Error`] wraps architecture-specific
//! errors, which in turn wrap leaf errors from individual subsystems. Every
//! leaf derives [`thiserror::Error`] with a single-line [`docsplay::Display`]
//! message so call sites can propagate with `?` end to end.

use crate::ap::AccessPortError;
use crate::dp::DebugPortError;
use crate::rom_table::RomTableError;
use crate::sequences::FlashError;

/// Top level error returned by any CORE operation.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum Error {
    /// An ARM-specific error occurred.
    Arm(#[from] ArmError),

    /// The requested core or AP does not exist.
    CoreNotFound(u8),

    /// An operation could not be performed because it lacked the permission
    /// to do so: {0}
    MissingPermissions(String),

    /// Another error occurred: {0}
    Other(#[from] anyhow::Error),
}

/// Errors originating from the ADIv5 transport stack (DP/AP/ROM-table/Flash).
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum ArmError {
    /// A timeout occurred during an operation.
    Timeout,

    /// An error occurred while using a debug port.
    DebugPort(#[from] DebugPortError),

    /// An error occurred while using an access port.
    AccessPort(#[from] AccessPortError),

    /// An error occurred while reading the ROM table.
    RomTable(#[from] RomTableError),

    /// A flash driver error occurred.
    Flash(#[from] FlashError),

    /// The core has to be halted for the operation, but was not.
    CoreNotHalted,

    /// The link layer reported a transport fault on register address
    /// 0x{0:02x}.
    TransportFault(u8),

    /// The current target device is not recognised by any installed driver.
    NoMatchingTarget,
}

/// The acknowledgement returned by the Link layer for one register
/// transaction, mirroring the ADIv5 `OK`/`WAIT`/`FAULT` response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The transaction completed normally.
    Ok,
    /// The target asked the host to retry; the DP/AP engine backs off and
    /// retries a bounded number of times.
    Wait,
    /// The transaction faulted; a sticky error is now latched on the DP.
    Fault,
}
