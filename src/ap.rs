//! ADIv5 Access Port engine.
//!
//! Built on top of a [`DebugPort`]: CSW/TAR/DRW sequencing, auto-increment
//! handling across the 10-bit TAR window, and the width-selection alignment
//! rule. See SPEC_FULL.md §4.2.

use std::cell::RefCell;
use std::rc::Rc;

use bitfield::bitfield;
use jep106::JEP106Code;
use tracing::{debug, trace, warn};

use crate::dp::DebugPort;
use crate::link::Link;

const REG_CSW: u8 = 0x00;
const REG_TAR: u8 = 0x04;
const REG_DRW: u8 = 0x0C;
const REG_BASE2: u8 = 0xF0;
const REG_BASE: u8 = 0xF8;
const REG_IDR: u8 = 0xFC;

/// Sentinel BASE value marking an AP with no ROM table.
pub const BASE_SENTINEL: u32 = 0xFFFF_FFFF;

/// Upper bound on AP enumeration; stops early after this many consecutive
/// invalid indices, per SPEC_FULL.md §4.1 step 8.
pub const MAX_CONSECUTIVE_INVALID_APS: u8 = 8;

bitfield! {
    #[derive(Clone, Copy)]
    pub struct Csw(u32);
    impl Debug;
    pub u8, size, set_size: 2, 0;
    pub u8, addr_inc, set_addr_inc: 5, 4;
    pub device_en, set_device_en: 6;
    pub trans_in_progress, _: 7;
}

/// Transfer width chosen per the alignment rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSize {
    U8 = 0,
    U16 = 1,
    U32 = 2,
}

impl DataSize {
    /// Minimum of `alignof(addr)` and `alignof(len)` over {byte, half, word}.
    pub fn choose(addr: u32, len: usize) -> Self {
        if addr % 4 == 0 && len % 4 == 0 {
            DataSize::U32
        } else if addr % 2 == 0 && len % 2 == 0 {
            DataSize::U16
        } else {
            DataSize::U8
        }
    }

    fn bytes(self) -> u32 {
        match self {
            DataSize::U8 => 1,
            DataSize::U16 => 2,
            DataSize::U32 => 4,
        }
    }
}

#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum AccessPortError {
    /// The debug port reported an error during an AP transaction.
    #[error(transparent)]
    DebugPort(#[from] crate::dp::DebugPortError),

    /// The access port's BASE or IDR indicates it has no ROM table or does
    /// not exist.
    NotPresent,

    /// A CSW read observed a transaction already in progress; the AP may be
    /// wedged.
    TransactionInProgress,
}

/// A discovered, validated Access Port.
///
/// Shares ownership of its [`DebugPort`] through an `Rc<RefCell<_>>`, which
/// is the idiomatic stand-in for the explicit DP refcount described in
/// SPEC_FULL.md §9: the count rises on `Rc::clone` and falls when the last
/// clone (including this `AccessPort`) drops.
pub struct AccessPort {
    pub dp: Rc<RefCell<DebugPort>>,
    pub ap_sel: u8,
    pub idr: u32,
    pub base: u64,
    csw_cache: Csw,
    pub designer: JEP106Code,
    pub part_no: u16,
    pub demcr_saved: Option<u32>,
}

impl AccessPort {
    /// Validate and construct the AP at `ap_sel`, or `None` if it is not
    /// present (BASE is the sentinel, or IDR is zero).
    pub fn probe(
        dp: Rc<RefCell<DebugPort>>,
        link: &mut impl Link,
        ap_sel: u8,
    ) -> Result<Option<Self>, AccessPortError> {
        let (idr, base_lo) = {
            let mut dp_ref = dp.borrow_mut();
            let idr = dp_ref.ap_read(link, ap_sel, REG_IDR)?;
            let base_lo = dp_ref.ap_read(link, ap_sel, REG_BASE)?;
            (idr, base_lo)
        };

        if idr == 0 {
            return Ok(None);
        }
        let base_addr = (base_lo & 0xFFFF_F000) as u64;
        if base_addr as u32 == BASE_SENTINEL & 0xFFFF_F000 && (base_lo & 0x1) == 0 {
            return Ok(None);
        }

        let base = if base_lo & 0x2 != 0 {
            let base_hi = dp.borrow_mut().ap_read(link, ap_sel, REG_BASE2)?;
            ((base_hi as u64) << 32) | base_addr
        } else {
            base_addr
        };

        let mut csw = Csw(0);
        csw.set_addr_inc(0b01);
        csw.set_size(DataSize::U32 as u8);
        dp.borrow_mut().ap_write(link, ap_sel, REG_CSW, csw.0)?;

        debug!(ap_sel, idr, base, "validated AP");
        Ok(Some(AccessPort {
            dp,
            ap_sel,
            idr,
            base,
            csw_cache: csw,
            designer: JEP106Code::new(0, 0),
            part_no: 0,
            demcr_saved: None,
        }))
    }

    /// Construct the synthetic AP installed on the RP2040 rescue path: there
    /// is no real AP to read IDR/BASE from, so this bypasses [`Self::probe`]
    /// entirely and hands back a placeholder the rescue sequence drives
    /// directly through `dp`.
    pub fn rescue(dp: Rc<RefCell<DebugPort>>) -> Self {
        AccessPort {
            dp,
            ap_sel: 0,
            idr: 0,
            base: BASE_SENTINEL as u64,
            csw_cache: Csw(0),
            designer: JEP106Code::new(0, 0),
            part_no: 0,
            demcr_saved: None,
        }
    }

    pub fn read_register(&mut self, link: &mut impl Link, offset: u8) -> Result<u32, AccessPortError> {
        Ok(self.dp.borrow_mut().ap_read(link, self.ap_sel, offset)?)
    }

    pub fn write_register(&mut self, link: &mut impl Link, offset: u8, value: u32) -> Result<(), AccessPortError> {
        Ok(self.dp.borrow_mut().ap_write(link, self.ap_sel, offset, value)?)
    }

    fn program_csw(&mut self, link: &mut impl Link, size: DataSize) -> Result<(), AccessPortError> {
        let mut csw = self.csw_cache;
        csw.set_size(size as u8);
        csw.set_addr_inc(0b01);
        self.dp.borrow_mut().ap_write(link, self.ap_sel, REG_CSW, csw.0)?;
        self.csw_cache = csw;
        Ok(())
    }

    /// Read `len` bytes of target memory starting at `addr` into `dest`.
    ///
    /// Implements the transfer loop of SPEC_FULL.md §4.2: a single width is
    /// chosen for the whole transfer, a priming read is issued once TAR is
    /// set, TAR is reprogrammed whenever a 10-bit window boundary is
    /// crossed (discarding the stale read that follows), and the final word
    /// is fetched from RDBUFF to satisfy the ADIv5 pipelined-read
    /// requirement. Each DRW read's data belongs to the previous request, so
    /// extraction always uses the address from *before* that step's
    /// increment — crucially, before a crossing reprogram ever runs, so no
    /// pending word is thrown away with the discarded re-prime read.
    pub fn mem_read(&mut self, link: &mut impl Link, addr: u32, dest: &mut [u8]) -> Result<(), AccessPortError> {
        if dest.is_empty() {
            return Ok(());
        }
        let size = DataSize::choose(addr, dest.len());
        self.program_csw(link, size)?;
        self.dp.borrow_mut().ap_write(link, self.ap_sel, REG_TAR, addr)?;
        // Prime the pipeline; this read's result belongs to whatever
        // transaction preceded it and is not meaningful here.
        let _ = self.dp.borrow_mut().ap_read(link, self.ap_sel, REG_DRW)?;

        let step = size.bytes();
        let num_words = (dest.len() as u32 + step - 1) / step;
        let mut cur = addr;
        let mut written = 0usize;

        for _ in 0..num_words.saturating_sub(1) {
            let word = self.dp.borrow_mut().ap_read(link, self.ap_sel, REG_DRW)?;
            let n = (step as usize).min(dest.len() - written);
            Self::extract_into(word, cur, step, &mut dest[written..written + n]);
            written += n;

            let next = cur.wrapping_add(step);
            if (next ^ cur) & 0xFFFF_FC00 != 0 {
                trace!(cur, next, "TAR window crossed, reprogramming");
                self.dp.borrow_mut().ap_write(link, self.ap_sel, REG_TAR, next)?;
                // Re-prime the pipeline: the read just issued after
                // reprogramming TAR does not yet reflect `next`.
                let _ = self.dp.borrow_mut().ap_read(link, self.ap_sel, REG_DRW)?;
            }
            cur = next;
        }

        // Final word: ADIv5 pipelines reads by one, so the last datum lives
        // in RDBUFF rather than the last DRW read issued above.
        let rdbuff = self.dp.borrow_mut().read_raw(link, 0xC)?;
        let n = dest.len() - written;
        Self::extract_into(rdbuff, cur, step, &mut dest[written..written + n]);
        Ok(())
    }

    /// Read a single aligned 32-bit word of target memory. A thin
    /// convenience wrapper around [`Self::mem_read`] used throughout the
    /// ROM-table walker and flash drivers.
    pub fn read_word32(&mut self, link: &mut impl Link, addr: u32) -> Result<u32, AccessPortError> {
        let mut buf = [0u8; 4];
        self.mem_read(link, addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write a single aligned 32-bit word of target memory.
    pub fn write_word32(&mut self, link: &mut impl Link, addr: u32, value: u32) -> Result<(), AccessPortError> {
        self.mem_write_sized(link, addr, &value.to_le_bytes())
    }

    /// Write `src` to target memory at `addr`, honouring the same alignment
    /// and TAR-window rules as [`Self::mem_read`]. Writes are fire-and-forget;
    /// callers needing an ordering barrier should follow with a dummy
    /// `read_register` of RDBUFF (`offset = 0xC` is a DP register, reachable
    /// through [`crate::dp::DebugPort::read_raw`]).
    pub fn mem_write_sized(&mut self, link: &mut impl Link, addr: u32, src: &[u8]) -> Result<(), AccessPortError> {
        if src.is_empty() {
            return Ok(());
        }
        let size = DataSize::choose(addr, src.len());
        self.program_csw(link, size)?;
        self.dp.borrow_mut().ap_write(link, self.ap_sel, REG_TAR, addr)?;

        let step = size.bytes() as usize;
        let mut cur = addr;
        for chunk in src.chunks(step) {
            let word = Self::pack(chunk, cur, step as u32);
            self.dp.borrow_mut().ap_write(link, self.ap_sel, REG_DRW, word)?;
            let next = cur.wrapping_add(step as u32);
            if (next ^ cur) & 0xFFFF_FC00 != 0 {
                self.dp.borrow_mut().ap_write(link, self.ap_sel, REG_TAR, next)?;
            }
            cur = next;
        }
        Ok(())
    }

    /// Create the completion barrier Flash drivers rely on before polling
    /// status: a read of RDBUFF after the last DRW write.
    pub fn write_barrier(&mut self, link: &mut impl Link) -> Result<(), AccessPortError> {
        let _ = self.dp.borrow_mut().read_raw(link, 0xC)?;
        Ok(())
    }

    fn extract_into(word: u32, addr: u32, width: u32, dest: &mut [u8]) {
        let shift = (addr & (4 - width)) * 8;
        let lane = (word >> shift).to_le_bytes();
        dest[..width as usize].copy_from_slice(&lane[..width as usize]);
    }

    fn pack(chunk: &[u8], addr: u32, width: u32) -> u32 {
        let mut bytes = [0u8; 4];
        bytes[..chunk.len()].copy_from_slice(chunk);
        let value = u32::from_le_bytes(bytes);
        let shift = (addr & (4 - width)) * 8;
        value << shift
    }
}

/// IDR class (designer + class + type, low 16 bits of variant/revision
/// dropped) for the Kinetis MDM-AP "wake up the debug interface" quirk.
const KINETIS_MDM_AP_IDR: u32 = 0x001C_0000;
/// IDR class for the nRF51 MDM-AP.
const NRF51_MDM_AP_IDR: u32 = 0x002A_0000;
/// IDR class for the EFM32 "authentication access port".
const EFM32_AAP_IDR: u32 = 0x1430_0000;

/// Kinetis MDM-AP `STAT` register, offset 0x00. Bit 0 is the flash
/// mass-erase-in-progress acknowledge.
const KINETIS_MDM_STAT: u8 = 0x00;
const KINETIS_MDM_STAT_FMEACK: u32 = 1 << 0;

/// EFM32 AAP `DEVICEID` register. The top nibble distinguishes Series-0 from
/// Series-1/2 parts, which need different unlock command sequences.
const EFM32_AAP_DEVICEID: u8 = 0x04;

fn ap_idr_class(idr: u32) -> u32 {
    idr & 0xFFFF_0000
}

/// Probe a newly-validated AP for family-specific "wake up the debug
/// interface" quirks (Kinetis MDM-AP, nRF51 MDM-AP, EFM32 AAP), per
/// SPEC_FULL.md §4.1. Each probe is narrow and fallible: a read error is
/// logged and swallowed rather than aborting enumeration, since these quirks
/// are opportunistic and most targets have none of these APs at all.
fn probe_family_ap_quirks(ap: &mut AccessPort, link: &mut impl Link) {
    match ap_idr_class(ap.idr) {
        KINETIS_MDM_AP_IDR => match ap.read_register(link, KINETIS_MDM_STAT) {
            Ok(stat) => {
                let already_erasing = stat & KINETIS_MDM_STAT_FMEACK != 0;
                debug!(ap_sel = ap.ap_sel, already_erasing, "Kinetis MDM-AP recognized");
            }
            Err(e) => warn!(ap_sel = ap.ap_sel, error = %e, "Kinetis MDM-AP STAT read failed"),
        },
        NRF51_MDM_AP_IDR => {
            // Presence alone registers the recover/erase_mass monitor command;
            // the nRF51 has no other discoverable AP to probe here.
            debug!(ap_sel = ap.ap_sel, "nRF51 MDM-AP recognized");
        }
        EFM32_AAP_IDR => match ap.read_register(link, EFM32_AAP_DEVICEID) {
            Ok(device_id) => {
                let series1_plus = device_id >> 28 != 0;
                debug!(ap_sel = ap.ap_sel, device_id, series1_plus, "EFM32 AAP recognized");
            }
            Err(e) => warn!(ap_sel = ap.ap_sel, error = %e, "EFM32 AAP DEVICEID read failed"),
        },
        _ => {}
    }
}

/// Enumerate APs 0..=255, stopping early after
/// [`MAX_CONSECUTIVE_INVALID_APS`] consecutive invalid indices, rejecting an
/// AP whose BASE duplicates the previous valid AP's BASE (a vendor quirk
/// seen on some silicon). Each validated AP is run through
/// [`probe_family_ap_quirks`] before being returned.
///
/// A DP that took the RP2040 rescue path (see [`DebugPort::rescue`]) has no
/// real AP to enumerate; this installs the single synthetic rescue AP
/// instead and returns immediately.
pub fn enumerate_access_ports(
    dp: &Rc<RefCell<DebugPort>>,
    link: &mut impl Link,
) -> Result<Vec<AccessPort>, AccessPortError> {
    if dp.borrow().rescue {
        return Ok(vec![AccessPort::rescue(dp.clone())]);
    }

    let mut found = Vec::new();
    let mut consecutive_invalid = 0u8;
    let mut last_base: Option<u64> = None;

    for ap_sel in 0u16..=255 {
        let ap_sel = ap_sel as u8;
        match AccessPort::probe(dp.clone(), link, ap_sel)? {
            Some(mut ap) => {
                consecutive_invalid = 0;
                if last_base == Some(ap.base) {
                    warn!(ap_sel, base = ap.base, "duplicate BASE, ending enumeration");
                    break;
                }
                last_base = Some(ap.base);
                probe_family_ap_quirks(&mut ap, link);
                found.push(ap);
            }
            None => {
                consecutive_invalid += 1;
                if consecutive_invalid >= MAX_CONSECUTIVE_INVALID_APS {
                    break;
                }
            }
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeLink;

    fn fake_dp() -> Rc<RefCell<DebugPort>> {
        let mut link = FakeLink::default();
        link.dpidr = 0x2BA0_1477;
        let platform = crate::test_support::FakePlatform::default();
        let dp = DebugPort::init(&mut link, &platform, 0x6BA0_2477, 0).unwrap();
        Rc::new(RefCell::new(dp))
    }

    #[test]
    fn invalid_ap_has_sentinel_base() {
        let mut link = FakeLink::default();
        link.dpidr = 0x2BA0_1477;
        let platform = crate::test_support::FakePlatform::default();
        let dp = Rc::new(RefCell::new(DebugPort::init(&mut link, &platform, 0x6BA0_2477, 0).unwrap()));
        let ap = AccessPort::probe(dp, &mut link, 0).unwrap();
        assert!(ap.is_none());
    }

    #[test]
    fn rescue_dp_enumerates_a_single_synthetic_ap() {
        let mut link = FakeLink::default();
        // partno = 0x02, jep_cc = 0x9, jep_id = 0x27: Raspberry rescue DP.
        link.dpidr = (0x02 << 20) | (1 << 12) | (0x9 << 8) | (0x27 << 1);
        let platform = crate::test_support::FakePlatform::default();
        let dp = Rc::new(RefCell::new(DebugPort::init(&mut link, &platform, 0x6BA0_2477, 0).unwrap()));
        assert!(dp.borrow().rescue);

        let aps = enumerate_access_ports(&dp, &mut link).unwrap();
        assert_eq!(aps.len(), 1);
        assert_eq!(aps[0].ap_sel, 0);
        assert_eq!(aps[0].idr, 0);
    }

    #[test]
    fn mem_read_write_round_trip() {
        let dp = fake_dp();
        let mut link = FakeLink::default();
        link.dpidr = 0x2BA0_1477;
        link.aps.entry(0).or_default().idr = 0x0477_0001;
        link.aps.entry(0).or_default().base = 0x1000;

        let mut ap = AccessPort::probe(dp, &mut link, 0).unwrap().unwrap();
        let src = [0xDEu8, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04];
        ap.mem_write_sized(&mut link, 0x2000_0000, &src).unwrap();

        let mut readback = [0u8; 8];
        ap.mem_read(&mut link, 0x2000_0000, &mut readback).unwrap();
        assert_eq!(src, readback);
    }

    #[test]
    fn mem_read_across_tar_window_boundary_keeps_all_words_in_order() {
        let dp = fake_dp();
        let mut link = FakeLink::default();
        link.dpidr = 0x2BA0_1477;
        link.aps.entry(0).or_default().idr = 0x0477_0001;
        link.aps.entry(0).or_default().base = 0x1000;
        link.poke32(0x3F8, 0x1111_1111);
        link.poke32(0x3FC, 0x2222_2222);
        link.poke32(0x400, 0x3333_3333);

        let mut ap = AccessPort::probe(dp, &mut link, 0).unwrap().unwrap();
        let mut dest = [0u8; 12];
        ap.mem_read(&mut link, 0x3F8, &mut dest).unwrap();

        assert_eq!(u32::from_le_bytes(dest[0..4].try_into().unwrap()), 0x1111_1111);
        assert_eq!(u32::from_le_bytes(dest[4..8].try_into().unwrap()), 0x2222_2222);
        assert_eq!(u32::from_le_bytes(dest[8..12].try_into().unwrap()), 0x3333_3333);
    }

    #[test]
    fn size_selection_follows_alignment_rule() {
        assert_eq!(DataSize::choose(0x1000, 4), DataSize::U32);
        assert_eq!(DataSize::choose(0x1002, 2), DataSize::U16);
        assert_eq!(DataSize::choose(0x1001, 1), DataSize::U8);
        assert_eq!(DataSize::choose(0x1002, 4), DataSize::U16);
    }

    #[test]
    fn enumeration_stops_after_consecutive_invalid_aps() {
        let dp = fake_dp();
        let mut link = FakeLink::default();
        let aps = enumerate_access_ports(&dp, &mut link).unwrap();
        assert!(aps.is_empty());
    }

    #[test]
    fn kinetis_mdm_ap_is_recognized_without_aborting_enumeration() {
        let dp = fake_dp();
        let mut link = FakeLink::default();
        link.aps.entry(0).or_default().idr = KINETIS_MDM_AP_IDR | 0x0001;
        link.aps.entry(0).or_default().base = 0x2000;
        link.aps.entry(1).or_default().idr = 0x0477_0001;
        link.aps.entry(1).or_default().base = 0x3000;

        let aps = enumerate_access_ports(&dp, &mut link).unwrap();
        assert_eq!(aps.len(), 2);
        assert_eq!(aps[0].ap_sel, 0);
        assert_eq!(aps[1].ap_sel, 1);
    }
}
