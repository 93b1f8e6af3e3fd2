//! Family-specific attach/detach/reset/halt-resume/mass-erase hooks.
//!
//! Targets vary by family (plain Cortex-M, protected DSU, SAM D rev-B
//! quirks, ...). Rather than a class hierarchy, each family implements this
//! trait and overrides only the hooks it needs to diverge on; everything
//! else falls back to the plain Cortex-M sequence. See SPEC_FULL.md §9
//! ("Polymorphism by capability").

pub mod samd;

use crate::ap::AccessPort;
use crate::cortex_m::{self, CortexMError};
use crate::link::Link;
use crate::platform::Platform;

/// Default platform attach/halt timeout, matching the 1500 ms end-to-end
/// scenario budget.
pub const DEFAULT_ATTACH_TIMEOUT_MS: u32 = 1500;

/// Errors raised by a family Flash driver. Kept distinct from
/// [`CortexMError`] because Flash failures (protection, timeout) are
/// meaningfully different from attach/halt failures even though both
/// eventually fold into the crate's top-level error.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum FlashError {
    /// A memory transaction to the Flash controller failed.
    #[error(transparent)]
    AccessPort(#[from] crate::ap::AccessPortError),

    /// A Cortex-M attach/halt step failed as part of a Flash operation.
    #[error(transparent)]
    CortexM(#[from] CortexMError),

    /// The device does not match this driver's probe guard.
    DeviceMismatch,

    /// `INTFLAG.READY` did not assert within the operation timeout.
    OperationTimeout,

    /// The DSU reported a protection error (`STATUSB.PERR`).
    ProtectionError,

    /// The DSU reported a general failure (`STATUSB.FAIL`).
    OperationFailed,
}

/// Per-family attach/detach/reset/halt-resume/mass-erase hooks.
///
/// A family that needs no special handling simply uses
/// [`GenericCortexMSequence`], which forwards every hook to the plain
/// Cortex-M routines in [`crate::cortex_m`].
pub trait DebugSequence {
    /// Bring the core to a halted, vector-catch-armed state after probe.
    fn attach(
        &mut self,
        ap: &mut AccessPort,
        link: &mut impl Link,
        platform: &mut impl Platform,
    ) -> Result<(), CortexMError> {
        cortex_m::cortexm_prepare(ap, link, platform, false, DEFAULT_ATTACH_TIMEOUT_MS)
    }

    /// Release resources claimed by [`Self::attach`] (DEMCR restore, any
    /// family-specific extended-reset bit).
    fn detach(&mut self, ap: &mut AccessPort, link: &mut impl Link) -> Result<(), CortexMError> {
        cortex_m::restore_demcr(ap, link)
    }

    /// Reset the target, returning it halted if `halt_after` is set.
    fn reset(
        &mut self,
        ap: &mut AccessPort,
        link: &mut impl Link,
        _halt_after: bool,
    ) -> Result<(), CortexMError> {
        cortex_m::system_reset_request(ap, link)
    }

    /// Resume execution (or single-step) from a halted core. Left to the
    /// generic core-control primitives; families rarely need to override
    /// this hook.
    fn halt_resume(&mut self, _ap: &mut AccessPort, _link: &mut impl Link, _resume: bool) -> Result<(), CortexMError> {
        Ok(())
    }

    /// Erase the whole device, bypassing per-region erase. Returns `Ok(false)`
    /// when the family has no mass-erase capability rather than an error, so
    /// callers can distinguish "not supported" from "attempted and failed".
    fn mass_erase(
        &mut self,
        _ap: &mut AccessPort,
        _link: &mut impl Link,
        _platform: &mut impl Platform,
    ) -> Result<bool, FlashError> {
        Ok(false)
    }
}

/// The no-special-casing Cortex-M sequence: every hook is the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericCortexMSequence;

impl DebugSequence for GenericCortexMSequence {}
