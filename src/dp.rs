//! ADIv5 Debug Port engine.
//!
//! One [`DebugPort`] represents a session with a single physical target
//! connection: DPIDR decode, the system/debug power-up handshake, the
//! CDBGRSTREQ reset handshake, and the SELECT-bank shadow that every AP
//! access is serialised through. See SPEC_FULL.md §4.1.

use bitfield::bitfield;
use jep106::JEP106Code;
use tracing::{debug, instrument, warn};

use crate::error::Ack;
use crate::link::{Link, RegisterAddress};
use crate::platform::Platform;

/// The legacy JTAG IDCODE of an ARM DPv0, which never exposes a DPIDR
/// register and so skips step 1 of the init contract.
pub const JTAG_IDCODE_ARM_DPV0: u32 = 0x0BA0_0477;

/// JEP-106 designer code of Raspberry Pi (continuation count / id byte),
/// used by the RP2040 rescue-probe special case.
const JEP106_RASPBERRY_CC: u8 = 0x9;
const JEP106_RASPBERRY_ID: u8 = 0x27;
const RASPBERRY_RESCUE_PARTNO: u8 = 0x02;

/// TARGETID bits [27:1]: TPARTNO[27:12] and TDESIGNER[11:1]. TREVISION
/// ([31:28]) is dropped and replaced with the DP's own instance id to build
/// TARGETSEL.
const TARGETID_FIELDS_MASK: u32 = 0x0FFF_FFFE;

const POWER_UP_TIMEOUT_MS: u32 = 200;
const RESET_ACK_TIMEOUT_MS: u32 = 200;
const MAX_WAIT_RETRIES: u8 = 3;

bitfield! {
    #[derive(Clone, Copy)]
    pub struct Abort(u32);
    impl Debug;
    pub _, set_orunerrclr: 5;
    pub _, set_wderrclr: 4;
    pub _, set_stkerrclr: 3;
    pub _, set_stkcmpclr: 2;
    pub _, set_dapabort: 1;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct Ctrl(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub cdbgrstack, _: 27;
    pub cdbgrstreq, set_cdbgrstreq: 26;
    pub u16, trn_cnt, set_trn_cnt: 23, 12;
    pub sticky_err, _: 5;
    pub orun_detect, set_orun_detect: 0;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct Select(u32);
    impl Debug;
    pub u8, ap_sel, set_ap_sel: 31, 24;
    pub u8, ap_bank_sel, set_ap_bank_sel: 7, 4;
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct Dpidr(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u8, part_no, _: 27, 20;
    pub min, _: 16;
    pub u8, version, _: 15, 12;
    u8, jep_cc, _: 11, 8;
    u8, jep_id, _: 7, 1;
}

/// The Debug Port protocol version decoded from DPIDR bits [15:12].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugPortVersion {
    DPv0,
    DPv1,
    DPv2,
    Unsupported,
}

impl From<u8> for DebugPortVersion {
    fn from(value: u8) -> Self {
        match value {
            0 => DebugPortVersion::DPv0,
            1 => DebugPortVersion::DPv1,
            2 => DebugPortVersion::DPv2,
            _ => DebugPortVersion::Unsupported,
        }
    }
}

/// Errors raised while initialising or operating a [`DebugPort`].
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum DebugPortError {
    /// The link layer reported a transport fault while reading DPIDR.
    DpidrReadFailed,

    /// The power-up acknowledgement was not observed within the timeout.
    PowerUpTimeout,

    /// A register transaction exhausted its WAIT retry budget.
    WaitExhausted,

    /// A register transaction faulted; ABORT has been issued.
    TransportFault,
}

/// A session with one target's Debug Port.
///
/// `select` is the exclusively-owned SELECT shadow: the engine only issues a
/// SELECT write when the desired bank differs from what is already
/// programmed on silicon, matching the "SELECT discipline" in SPEC_FULL.md
/// §4.1.
pub struct DebugPort {
    pub version: DebugPortVersion,
    pub designer: JEP106Code,
    pub part_no: u8,
    pub mindp: bool,
    pub instance: u8,
    /// DPv2 line-select value for multidrop SWD, `(instance<<28) |
    /// targetid_fields | 1`. Zero on DPv0/DPv1, where there is nothing to
    /// select among.
    pub targetsel: u32,
    /// Set when [`Self::init`] took the Raspberry RP2040 rescue path: no
    /// real AP exists on this target, and [`crate::ap::AccessPort::rescue`]
    /// must be used in place of normal enumeration.
    pub rescue: bool,
    select: Select,
    fault: bool,
}

impl DebugPort {
    /// Step 1-7 of the initialisation contract. Step 8 (AP enumeration) is
    /// driven by the caller, since it needs to construct [`crate::ap::AccessPort`]
    /// values that borrow this DP.
    #[instrument(skip(link, platform))]
    pub fn init(
        link: &mut impl Link,
        platform: &impl Platform,
        idcode: u32,
        instance: u8,
    ) -> Result<Self, DebugPortError> {
        let dpidr = if idcode == JTAG_IDCODE_ARM_DPV0 {
            Dpidr(0)
        } else {
            let (ack, value) = link.read_register(RegisterAddress::dp(0x0));
            if ack != Ack::Ok {
                warn!("DPIDR read failed, ack = {:?}", ack);
                return Err(DebugPortError::DpidrReadFailed);
            }
            Dpidr(value)
        };

        let mut designer = JEP106Code::new(dpidr.jep_cc(), dpidr.jep_id());
        let mut version = DebugPortVersion::from(dpidr.version());
        if designer.id == 0 {
            // DPIDR decoded to designer zero: downgrade to DPv0.
            version = DebugPortVersion::DPv0;
        }

        let mut dp = DebugPort {
            version,
            designer,
            part_no: dpidr.part_no(),
            mindp: dpidr.min(),
            instance,
            targetsel: 0,
            rescue: false,
            select: Select(0),
            fault: false,
        };

        if dp.version == DebugPortVersion::DPv2 {
            // Read TARGETID on SELECT bank 2; the generic read/write helpers
            // below always restore bank 0 for everything except this one
            // deliberate detour.
            dp.write_select_bank(link, 2)?;
            let (ack, targetid) = link.read_register(RegisterAddress::dp(0x4));
            dp.write_select_bank(link, 0)?;
            if ack == Ack::Ok {
                designer = JEP106Code::new(((targetid >> 1) & 0x7f) as u8, ((targetid >> 8) & 0x7f) as u8);
                dp.targetsel = (dp.instance as u32) << 28 | (targetid & TARGETID_FIELDS_MASK) | 1;
                debug!(?designer, targetsel = dp.targetsel, "read TARGETID on bank 2");
            }
        }

        if designer.cc == JEP106_RASPBERRY_CC
            && designer.id == JEP106_RASPBERRY_ID
            && dp.part_no == RASPBERRY_RESCUE_PARTNO
        {
            debug!("Raspberry rescue-probe DP detected, installing synthetic AP");
            dp.rescue = true;
            return Ok(dp);
        }

        if dp.read_ctrlstat(link).is_err() {
            // Step 5: a CTRL/STAT read timeout gets one DAPABORT + retry
            // before we give up on bringing the DP up at all.
            dp.abort(link, true);
            dp.read_ctrlstat(link)?;
        }

        dp.power_up(link, platform)?;
        dp.reset_pulse(link, platform);

        Ok(dp)
    }

    fn write_select_bank(&mut self, link: &mut impl Link, dp_bank: u8) -> Result<(), DebugPortError> {
        let mut select = self.select;
        select.set_dp_bank_sel(dp_bank);
        let ack = link.write_register(RegisterAddress::dp(0x8), select.0);
        if ack != Ack::Ok {
            return Err(DebugPortError::TransportFault);
        }
        self.select = select;
        Ok(())
    }

    fn read_ctrlstat(&mut self, link: &mut impl Link) -> Result<Ctrl, DebugPortError> {
        for _ in 0..MAX_WAIT_RETRIES {
            let (ack, value) = link.read_register(RegisterAddress::dp(0x4));
            match ack {
                Ack::Ok => return Ok(Ctrl(value)),
                Ack::Wait => continue,
                Ack::Fault => {
                    self.abort(link, false);
                }
            }
        }
        Err(DebugPortError::WaitExhausted)
    }

    /// Issue DAPABORT, optionally also clearing the sticky-error bits.
    fn abort(&mut self, link: &mut impl Link, clear_sticky: bool) {
        let mut abort = Abort(0);
        abort.set_dapabort(true);
        if clear_sticky {
            abort.set_stkerrclr(true);
            abort.set_wderrclr(true);
            abort.set_orunerrclr(true);
        }
        let _ = link.write_register(RegisterAddress::dp(0x0), abort.0);
        self.fault = true;
    }

    fn power_up(&mut self, link: &mut impl Link, platform: &impl Platform) -> Result<(), DebugPortError> {
        let mut ctrl = Ctrl(0);
        ctrl.set_csyspwrupreq(true);
        ctrl.set_cdbgpwrupreq(true);
        let ack = link.write_register(RegisterAddress::dp(0x4), ctrl.0);
        if ack != Ack::Ok {
            return Err(DebugPortError::TransportFault);
        }

        let timeout = platform.timeout_set(POWER_UP_TIMEOUT_MS);
        loop {
            let status = self.read_ctrlstat(link)?;
            if status.csyspwrupack() && status.cdbgpwrupack() {
                debug!("power-up acknowledged");
                return Ok(());
            }
            if platform.timeout_is_expired(&timeout) {
                return Err(DebugPortError::PowerUpTimeout);
            }
        }
    }

    /// Pulse CDBGRSTREQ. A timeout waiting for CDBGRSTACK is logged but not
    /// fatal: some silicon never asserts the ack bit.
    fn reset_pulse(&mut self, link: &mut impl Link, platform: &impl Platform) {
        let mut ctrl = Ctrl(0);
        ctrl.set_csyspwrupreq(true);
        ctrl.set_cdbgpwrupreq(true);
        ctrl.set_cdbgrstreq(true);
        if link.write_register(RegisterAddress::dp(0x4), ctrl.0) != Ack::Ok {
            return;
        }

        let timeout = platform.timeout_set(RESET_ACK_TIMEOUT_MS);
        loop {
            match self.read_ctrlstat(link) {
                Ok(status) if status.cdbgrstack() => break,
                Ok(_) => {}
                Err(_) => break,
            }
            if platform.timeout_is_expired(&timeout) {
                warn!("CDBGRSTACK timeout (non-fatal)");
                break;
            }
        }

        ctrl.set_cdbgrstreq(false);
        let _ = link.write_register(RegisterAddress::dp(0x4), ctrl.0);
    }

    /// Ensure SELECT is programmed with the given AP index and register
    /// bank, writing SELECT only when it would change.
    pub(crate) fn select_ap_bank(
        &mut self,
        link: &mut impl Link,
        ap_sel: u8,
        ap_bank: u8,
    ) -> Result<(), DebugPortError> {
        if self.select.ap_sel() == ap_sel && self.select.ap_bank_sel() == ap_bank {
            return Ok(());
        }
        let mut select = Select(0);
        select.set_ap_sel(ap_sel);
        select.set_ap_bank_sel(ap_bank);
        let ack = link.write_register(RegisterAddress::dp(0x8), select.0);
        if ack != Ack::Ok {
            return Err(DebugPortError::TransportFault);
        }
        self.select = select;
        Ok(())
    }

    /// Read/write a raw DP register with bounded WAIT retry, matching the
    /// generic transaction policy used by `read_ctrlstat`.
    pub fn read_raw(&mut self, link: &mut impl Link, offset: u8) -> Result<u32, DebugPortError> {
        for _ in 0..MAX_WAIT_RETRIES {
            let (ack, value) = link.read_register(RegisterAddress::dp(offset));
            match ack {
                Ack::Ok => return Ok(value),
                Ack::Wait => continue,
                Ack::Fault => self.abort(link, false),
            }
        }
        Err(DebugPortError::WaitExhausted)
    }

    pub fn write_raw(&mut self, link: &mut impl Link, offset: u8, value: u32) -> Result<(), DebugPortError> {
        for _ in 0..MAX_WAIT_RETRIES {
            match link.write_register(RegisterAddress::dp(offset), value) {
                Ack::Ok => return Ok(()),
                Ack::Wait => continue,
                Ack::Fault => self.abort(link, false),
            }
        }
        Err(DebugPortError::WaitExhausted)
    }

    /// Escalate TRNCNT in CTRL/STAT; used by [`crate::cortex_m::initial_halt`].
    pub fn set_trn_cnt(&mut self, link: &mut impl Link, trn_cnt: u16) -> Result<(), DebugPortError> {
        let mut ctrl = Ctrl(0);
        ctrl.set_csyspwrupreq(true);
        ctrl.set_cdbgpwrupreq(true);
        ctrl.set_trn_cnt(trn_cnt);
        self.write_raw(link, 0x4, ctrl.0)
    }

    pub fn fault(&self) -> bool {
        self.fault
    }

    pub fn clear_fault(&mut self) {
        self.fault = false;
    }

    /// Read an AP register, programming SELECT's AP-index and bank fields
    /// first if they differ from the current shadow. `offset` is the byte
    /// offset within the target AP's register bank.
    pub fn ap_read(&mut self, link: &mut impl Link, ap_sel: u8, offset: u8) -> Result<u32, DebugPortError> {
        self.select_ap_bank(link, ap_sel, (offset >> 4) & 0xF)?;
        for _ in 0..MAX_WAIT_RETRIES {
            let (ack, value) = link.read_register(RegisterAddress::ap(offset));
            match ack {
                Ack::Ok => return Ok(value),
                Ack::Wait => continue,
                Ack::Fault => self.abort(link, false),
            }
        }
        Err(DebugPortError::WaitExhausted)
    }

    pub fn ap_write(
        &mut self,
        link: &mut impl Link,
        ap_sel: u8,
        offset: u8,
        value: u32,
    ) -> Result<(), DebugPortError> {
        self.select_ap_bank(link, ap_sel, (offset >> 4) & 0xF)?;
        for _ in 0..MAX_WAIT_RETRIES {
            match link.write_register(RegisterAddress::ap(offset), value) {
                Ack::Ok => return Ok(()),
                Ack::Wait => continue,
                Ack::Fault => self.abort(link, false),
            }
        }
        Err(DebugPortError::WaitExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeLink, FakePlatform};

    #[test]
    fn init_decodes_dpidr_and_powers_up() {
        let mut link = FakeLink::default();
        // DPIDR: version 1, designer ARM (0x23B -> cc=0x4, id=0x3B<<1|1), part 0
        link.dpidr = 0x2BA0_1477;
        link.auto_power_up = true;
        let platform = FakePlatform::default();

        let dp = DebugPort::init(&mut link, &platform, 0x6BA0_2477, 0).expect("dp init");
        assert_eq!(dp.version, DebugPortVersion::DPv1);
        assert!(!dp.fault());
    }

    #[test]
    fn power_up_timeout_is_reported() {
        let mut link = FakeLink::default();
        link.dpidr = 0x2BA0_1477;
        link.auto_power_up = false;
        let platform = FakePlatform::default();

        let err = DebugPort::init(&mut link, &platform, 0x6BA0_2477, 0).unwrap_err();
        assert!(matches!(err, DebugPortError::PowerUpTimeout));
    }

    #[test]
    fn select_ap_bank_is_idempotent() {
        let mut link = FakeLink::default();
        link.dpidr = 0x2BA0_1477;
        link.auto_power_up = true;
        let platform = FakePlatform::default();
        let mut dp = DebugPort::init(&mut link, &platform, 0x6BA0_2477, 0).expect("dp init");

        link.select_writes = 0;
        dp.select_ap_bank(&mut link, 1, 2).unwrap();
        dp.select_ap_bank(&mut link, 1, 2).unwrap();
        assert_eq!(link.select_writes, 1, "second identical SELECT must be elided");
    }

    #[test]
    fn dpv2_derives_targetsel_from_targetid_and_instance() {
        let mut link = FakeLink::default();
        link.dpidr = 0x2BA0_2477; // same as the DPv1 fixture but with version = 2
        link.auto_power_up = true;
        let platform = FakePlatform::default();

        let dp = DebugPort::init(&mut link, &platform, 0x6BA0_2477, 3).expect("dp init");
        assert_eq!(dp.version, DebugPortVersion::DPv2);
        assert_eq!(dp.instance, 3);
        // FakeLink answers every DP offset-0x4 read with the power-up-ack
        // pattern regardless of SELECT bank, so TARGETID reads back as
        // 0xF000_0000; masked to the TPARTNO/TDESIGNER fields that is 0.
        assert_eq!(dp.targetsel, (3u32 << 28) | 1);
    }

    #[test]
    fn raspberry_rescue_designer_and_partno_sets_rescue_flag() {
        let mut link = FakeLink::default();
        // partno = 0x02 (bits 27:20), version = 1 (bits 15:12),
        // jep_cc = 0x9 (bits 11:8), jep_id = 0x27 (bits 7:1).
        link.dpidr = (0x02 << 20) | (1 << 12) | (0x9 << 8) | (0x27 << 1);
        link.auto_power_up = true;
        let platform = FakePlatform::default();

        let dp = DebugPort::init(&mut link, &platform, 0x6BA0_2477, 0).expect("dp init");
        assert!(dp.rescue);
        // The rescue path returns before the power-up handshake; CTRLSTAT
        // reads were never driven by this init call, so no fault is latched.
        assert!(!dp.fault());
    }
}
