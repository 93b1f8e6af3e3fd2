//! Cortex-M attach sequence: halting a core under debug control and
//! preparing it for vector-catch-on-reset. See SPEC_FULL.md §4.2/§4.5.

use bitfield::bitfield;
use tracing::{debug, instrument, trace, warn};

use crate::ap::{AccessPort, AccessPortError};
use crate::link::Link;
use crate::platform::Platform;

/// Debug Halting Control and Status Register, address per the Armv7-M/
/// Armv8-M architecture reference manual.
pub const DHCSR_ADDR: u32 = 0xE000_EDF0;
/// Debug Exception and Monitor Control Register.
pub const DEMCR_ADDR: u32 = 0xE000_EDFC;
/// Application Interrupt and Reset Control Register.
pub const AIRCR_ADDR: u32 = 0xE000_ED0C;

const DHCSR_DEBUG_KEY: u32 = 0xA05F << 16;
const AIRCR_VECTKEY: u32 = 0x05FA << 16;

bitfield! {
    #[derive(Clone, Copy)]
    pub struct Dhcsr(u32);
    impl Debug;
    pub s_reset_st, _: 25;
    pub s_retire_st, _: 24;
    pub s_lockup, _: 19;
    pub s_sleep, _: 18;
    pub s_halt, _: 17;
    pub s_regrdy, _: 16;
    pub c_maskints, set_c_maskints: 3;
    pub c_step, set_c_step: 2;
    pub c_halt, set_c_halt: 1;
    pub c_debugen, set_c_debugen: 0;
}

impl Dhcsr {
    /// Any write to bits [15:0] requires this key in bits [31:16].
    pub fn with_write_key(mut self) -> Self {
        self.0 = (self.0 & 0xFFFF) | DHCSR_DEBUG_KEY;
        self
    }

    /// An all-ones read indicates the bus access itself failed (a
    /// disconnected or not-yet-clocked debug fabric) rather than reflecting
    /// real core state.
    fn looks_bogus(self) -> bool {
        self.0 == 0xFFFF_FFFF
    }
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct Demcr(u32);
    impl Debug;
    pub trcena, set_trcena: 24;
    pub vc_harderr, set_vc_harderr: 10;
    pub vc_corereset, set_vc_corereset: 0;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct Aircr(u32);
    impl Debug;
    pub sysresetreq, set_sysresetreq: 2;
}

#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum CortexMError {
    /// A memory transaction to the core's debug registers failed.
    #[error(transparent)]
    AccessPort(#[from] AccessPortError),

    /// The core could not be halted within the platform timeout.
    HaltTimeout,

    /// DHCSR never cleared `S_RESET_ST` after deasserting nRST.
    ResetReleaseTimeout,
}

const TRNCNT_START: u16 = 0x80;
const TRNCNT_MAX: u16 = 0xFFF;

/// Halt a core that may be asleep (e.g. in WFI), escalating the DP's
/// `TRNCNT` field over the course of the attempt so a sleeping bus fabric
/// gets a wider transaction window. A direct single-shot DHCSR write is
/// racy against a core that is not yet clocked for debug access.
#[instrument(skip(ap, link, platform))]
pub fn initial_halt(
    ap: &mut AccessPort,
    link: &mut impl Link,
    platform: &impl Platform,
    mindp: bool,
    timeout_ms: u32,
) -> Result<(), CortexMError> {
    let mut halt = Dhcsr(0);
    halt.set_c_debugen(true);
    halt.set_c_halt(true);
    let halt_word = halt.with_write_key().0;

    let deadline = platform.timeout_set(timeout_ms);
    let mut reset_seen = false;
    let mut trn_cnt = TRNCNT_START;

    loop {
        ap.write_word32(link, DHCSR_ADDR, halt_word)?;
        let raw = ap.read_word32(link, DHCSR_ADDR)?;
        let status = Dhcsr(raw);

        if !status.looks_bogus() {
            if status.s_reset_st() && !reset_seen {
                // Tolerate one reset observed mid-halt; don't let it mask a
                // later genuine halt failure.
                trace!("core reset observed during halt attempt");
                reset_seen = true;
            } else if status.c_debugen() && status.s_halt() {
                debug!("core halted");
                return Ok(());
            }
        }

        if platform.timeout_is_expired(&deadline) {
            warn!("initial_halt timed out");
            return Err(CortexMError::HaltTimeout);
        }

        if !mindp {
            trn_cnt = trn_cnt.saturating_mul(2).min(TRNCNT_MAX);
            let _ = ap.dp.borrow_mut().set_trn_cnt(link, trn_cnt);
        }
    }
}

/// Prepare a halted core for vector-catch-on-reset and restore its state
/// once the platform deasserts nRST: save DEMCR, enable trace plus
/// hard-fault/core-reset vector catch, release reset, and wait for the
/// reset-sticky bit to clear.
#[instrument(skip(ap, link, platform))]
pub fn cortexm_prepare(
    ap: &mut AccessPort,
    link: &mut impl Link,
    platform: &mut impl Platform,
    mindp: bool,
    timeout_ms: u32,
) -> Result<(), CortexMError> {
    initial_halt(ap, link, platform, mindp, timeout_ms)?;

    let saved = ap.read_word32(link, DEMCR_ADDR)?;
    ap.demcr_saved = Some(saved);

    let mut demcr = Demcr(saved);
    demcr.set_trcena(true);
    demcr.set_vc_harderr(true);
    demcr.set_vc_corereset(true);
    ap.write_word32(link, DEMCR_ADDR, demcr.0)?;

    platform.nrst_set(false);

    let deadline = platform.timeout_set(timeout_ms);
    loop {
        let status = Dhcsr(ap.read_word32(link, DHCSR_ADDR)?);
        if !status.s_reset_st() {
            return Ok(());
        }
        if platform.timeout_is_expired(&deadline) {
            warn!("reset release timed out waiting for S_RESET_ST to clear");
            return Err(CortexMError::ResetReleaseTimeout);
        }
    }
}

/// Restore the DEMCR value saved by [`cortexm_prepare`], if any.
pub fn restore_demcr(ap: &mut AccessPort, link: &mut impl Link) -> Result<(), CortexMError> {
    if let Some(saved) = ap.demcr_saved.take() {
        ap.write_word32(link, DEMCR_ADDR, saved)?;
    }
    Ok(())
}

/// Issue `SYSRESETREQ` via AIRCR, the generic (non-SAM-D) reset path.
pub fn system_reset_request(ap: &mut AccessPort, link: &mut impl Link) -> Result<(), CortexMError> {
    let mut aircr = Aircr(0);
    aircr.set_sysresetreq(true);
    let word = aircr.0 | AIRCR_VECTKEY;
    ap.write_word32(link, AIRCR_ADDR, word)?;
    Ok(())
}
