//! Atmel/Microchip SAM D family Flash driver: device identification, NVMC
//! erase/write sequences, DSU mass-erase, and the user-row (lock bits,
//! boot protection) mutation path. See SPEC_FULL.md §4.4/§4.6.

use tracing::{debug, warn};

use crate::ap::AccessPort;
use crate::cortex_m::{self, CortexMError, DHCSR_ADDR};
use crate::link::Link;
use crate::platform::Platform;
use crate::sequences::{DebugSequence, FlashError};

const DFSR_ADDR: u32 = 0xE000_ED30;
const DFSR_RESETALL: u32 = 0x1F;

pub const ROW_SIZE: u32 = 256;
pub const PAGE_SIZE: u32 = 64;

const NVMC_BASE: u32 = 0x4100_4000;
const NVMC_CTRLA: u32 = NVMC_BASE;
const NVMC_INTFLAG: u32 = NVMC_BASE + 0x14;
const NVMC_ADDRESS: u32 = NVMC_BASE + 0x1C;

const CMD_KEY: u32 = 0xA500;
const CMD_ERASEROW: u32 = 0x0002;
const CMD_WRITEPAGE: u32 = 0x0004;
const CMD_ERASEAUXROW: u32 = 0x0005;
const CMD_WRITEAUXPAGE: u32 = 0x0006;
const CMD_LOCK: u32 = 0x0040;
const CMD_UNLOCK: u32 = 0x0041;

const NVMC_READY: u32 = 1 << 0;

const USER_ROW_LOW: u32 = 0x0080_4000;
const USER_ROW_HIGH: u32 = 0x0080_4004;
const SERIAL_WORD_BASE: u32 = 0x0080_A00C;

const DSU_BASE: u32 = 0x4100_2000;
const DSU_EXT_ACCESS: u32 = DSU_BASE + 0x100;
const DSU_CTRLSTAT: u32 = DSU_EXT_ACCESS;
const DSU_ADDRESS: u32 = DSU_EXT_ACCESS + 0x4;
const DSU_LENGTH: u32 = DSU_EXT_ACCESS + 0x8;
const DSU_DID: u32 = DSU_EXT_ACCESS + 0x18;

/// The DSU also exposes a CoreSight-style identification window one page up
/// from its control registers: PIDR0-3 at `+0xFE0`, CIDR0-3 at `+0xFF0`,
/// each register's low byte significant.
const DSU_ID_COMPONENT_BASE: u32 = DSU_BASE + 0x1000;

/// Assemble the low 32 bits of a component's PIDR (PIDR0-3 only; PIDR4-7
/// never carry a bit relevant to the SAM D family check).
fn read_pidr_low(ap: &mut AccessPort, link: &mut impl Link, component_base: u32) -> Result<u32, FlashError> {
    let mut bytes = [0u32; 4];
    for (i, word) in bytes.iter_mut().enumerate() {
        *word = ap.read_word32(link, component_base + 0xFE0 + 4 * i as u32)? & 0xFF;
    }
    Ok(bytes[0] | (bytes[1] << 8) | (bytes[2] << 16) | (bytes[3] << 24))
}

/// Assemble the full (unmasked) CIDR, including the component-class nibble.
fn read_cidr_full(ap: &mut AccessPort, link: &mut impl Link, component_base: u32) -> Result<u32, FlashError> {
    let mut bytes = [0u32; 4];
    for (i, word) in bytes.iter_mut().enumerate() {
        *word = ap.read_word32(link, component_base + 0xFF0 + 4 * i as u32)? & 0xFF;
    }
    Ok(bytes[0] | (bytes[1] << 8) | (bytes[2] << 16) | (bytes[3] << 24))
}

const CTRL_CHIP_ERASE: u32 = 1 << 4;
const CTRL_MBIST: u32 = 1 << 3;
const STATUSA_PERR: u32 = 1 << 12;
const STATUSA_FAIL: u32 = 1 << 11;
const STATUSA_CRSTEXT: u32 = 1 << 9;
const STATUSA_DONE: u32 = 1 << 8;
const STATUSB_PROT: u32 = 1 << 16;

const DID_MASK: u32 = 0xFF38_0000;
const DID_CONST_VALUE: u32 = 0x1000_0000;

const PID_MASK: u32 = 0x00F7_FFFF;
const PID_CONST_VALUE: u32 = 0x0001_FCD0;
const CID_VALUE: u32 = 0xB105_100D;

const MASS_ERASE_TIMEOUT_MS: u32 = 500;
const NVM_READY_TIMEOUT_MS: u32 = 500;

/// Classify a DSU `CTRLSTAT` read against the three terminal bits shared by
/// chip-erase and MBIST. Returns `None` while the operation is still
/// in-flight.
fn classify_dsu_status(status: u32) -> Option<Result<(), FlashError>> {
    if status & STATUSA_PERR != 0 {
        Some(Err(FlashError::ProtectionError))
    } else if status & STATUSA_FAIL != 0 {
        Some(Err(FlashError::OperationFailed))
    } else if status & STATUSA_DONE != 0 {
        Some(Ok(()))
    } else {
        None
    }
}

/// `devsel -> (pin, mem, variant)` row for the D21/L21/L22 families, where
/// the device-select field does not follow a closed formula.
struct PartRow {
    devsel: u8,
    pin: char,
    mem: u8,
    variant: char,
}

macro_rules! part {
    ($devsel:expr, $pin:expr, $mem:expr, $variant:expr) => {
        PartRow {
            devsel: $devsel,
            pin: $pin,
            mem: $mem,
            variant: $variant,
        }
    };
}

static D21_PARTS: &[PartRow] = &[
    part!(0x00, 'J', 18, 'A'),
    part!(0x01, 'J', 17, 'A'),
    part!(0x02, 'J', 16, 'A'),
    part!(0x03, 'J', 15, 'A'),
    part!(0x05, 'G', 18, 'A'),
    part!(0x06, 'G', 17, 'A'),
    part!(0x07, 'G', 16, 'A'),
    part!(0x08, 'G', 15, 'A'),
    part!(0x0A, 'E', 18, 'A'),
    part!(0x0B, 'E', 17, 'A'),
    part!(0x0C, 'E', 16, 'A'),
    part!(0x0D, 'E', 15, 'A'),
    part!(0x0F, 'G', 18, 'A'),
    part!(0x10, 'G', 17, 'A'),
    part!(0x20, 'J', 16, 'B'),
    part!(0x21, 'J', 15, 'B'),
    part!(0x23, 'G', 16, 'B'),
    part!(0x24, 'G', 15, 'B'),
    part!(0x26, 'E', 16, 'B'),
    part!(0x27, 'E', 15, 'B'),
    part!(0x55, 'E', 16, 'B'),
    part!(0x56, 'E', 15, 'B'),
    part!(0x62, 'E', 16, 'C'),
    part!(0x63, 'E', 15, 'C'),
];

static L21_PARTS: &[PartRow] = &[
    part!(0x00, 'J', 18, 'A'),
    part!(0x01, 'J', 17, 'A'),
    part!(0x02, 'J', 16, 'A'),
    part!(0x05, 'G', 18, 'A'),
    part!(0x06, 'G', 17, 'A'),
    part!(0x07, 'G', 16, 'A'),
    part!(0x0A, 'E', 18, 'A'),
    part!(0x0B, 'E', 17, 'A'),
    part!(0x0C, 'E', 16, 'A'),
    part!(0x0D, 'E', 15, 'A'),
    part!(0x0F, 'J', 18, 'B'),
    part!(0x10, 'J', 17, 'B'),
    part!(0x11, 'J', 16, 'B'),
    part!(0x14, 'G', 18, 'B'),
    part!(0x15, 'G', 17, 'B'),
    part!(0x16, 'G', 16, 'B'),
    part!(0x19, 'E', 18, 'B'),
    part!(0x1A, 'E', 17, 'B'),
    part!(0x1B, 'E', 16, 'B'),
    part!(0x1C, 'E', 15, 'B'),
];

static L22_PARTS: &[PartRow] = &[
    part!(0x00, 'N', 18, 'A'),
    part!(0x01, 'N', 17, 'A'),
    part!(0x02, 'N', 16, 'A'),
    part!(0x05, 'J', 18, 'A'),
    part!(0x06, 'J', 17, 'A'),
    part!(0x07, 'J', 16, 'A'),
    part!(0x0A, 'G', 18, 'A'),
    part!(0x0B, 'G', 17, 'A'),
    part!(0x0C, 'G', 16, 'A'),
];

/// Decoded device descriptor, built from the DSU's Device Identification
/// Register.
#[derive(Debug, Clone)]
pub struct SamdDescriptor {
    pub family: char,
    pub series: u8,
    pub revision: char,
    pub pin: char,
    pub mem: u8,
    pub variant: char,
    pub package: &'static str,
    pub ram_size: u32,
    pub flash_size: u32,
}

/// Decode a DID into a device descriptor. Series 20 and 9 derive pin/mem
/// from a formula over the device-select field; series 21/22 and 10/11 look
/// the field up in a static table (no closed formula exists for those
/// families).
pub fn parse_device_id(did: u32) -> SamdDescriptor {
    let family_bits = (did >> 23) & 0x3F;
    let series_bits = (did >> 16) & 0x1F;
    let revision_bits = (did >> 8) & 0x0F;
    let devsel = (did & 0xFF) as u8;

    let family = match family_bits {
        1 => 'L',
        2 => 'C',
        _ => 'D',
    };

    let (series, parts): (u8, &[PartRow]) = match series_bits {
        0 => (20, &[]),
        1 => (21, if family == 'L' { L21_PARTS } else { D21_PARTS }),
        2 if family == 'L' => (22, L22_PARTS),
        2 => (10, &[]),
        3 => (11, &[]),
        4 => (9, &[]),
        _ => (0, &[]),
    };

    let revision = (b'A' + revision_bits as u8) as char;

    let mut descr = SamdDescriptor {
        family,
        series,
        revision,
        pin: 'u',
        mem: 0,
        variant: 'A',
        package: "",
        ram_size: 0x8000,
        flash_size: 0x4_0000,
    };

    match series {
        20 => {
            descr.pin = match devsel / 5 {
                0 => 'J',
                1 => 'G',
                2 => 'E',
                _ => 'u',
            };
            descr.mem = 18u8.saturating_sub(devsel % 5);
        }
        21 | 22 => {
            if let Some(row) = parts.iter().find(|p| p.devsel == devsel) {
                descr.pin = row.pin;
                descr.mem = row.mem;
                descr.variant = row.variant;
            }
        }
        10 | 11 => {
            descr.package = match devsel / 3 {
                0 => "M",
                1 => "SS",
                _ => "",
            };
            descr.pin = 'D';
            descr.mem = 14u8.saturating_sub(devsel % 3);
        }
        9 => {
            descr.ram_size = 4096;
            match devsel {
                0 => {
                    descr.pin = 'D';
                    descr.mem = 14;
                    descr.flash_size = 16384;
                    descr.package = "M";
                }
                7 => {
                    descr.pin = 'C';
                    descr.mem = 13;
                    descr.flash_size = 8192;
                }
                _ => {}
            }
        }
        _ => {}
    }

    descr
}

/// Family-specific attach/detach/halt-resume quirk, decided from the
/// descriptor at probe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Errata {
    /// No special handling.
    None,
    /// Series 20 rev B: detach/halt-resume also clear `CRSTEXT`.
    Series20RevB,
    /// Series 11: attach releases `CRSTEXT` before the generic attach.
    Series11,
}

/// A probed SAM D target: its descriptor, the errata quirk selected for it,
/// and whether the DSU reported protection at probe time.
pub struct SamdTarget {
    pub descriptor: SamdDescriptor,
    pub protected: bool,
    errata: Errata,
    /// Set once a protected-attach has run; the next attach uses the plain
    /// Cortex-M sequence instead, mirroring the one-shot patch-back in the
    /// original firmware.
    rescued: bool,
}

impl SamdTarget {
    /// Probe guard: verify CID/PID match the SAM D family constants, then
    /// read and decode DID. Returns `Ok(None)` (not an error) when the part
    /// simply isn't a SAM D, so callers can try the next family driver.
    pub fn probe(ap: &mut AccessPort, link: &mut impl Link) -> Result<Option<Self>, FlashError> {
        let cid = read_cidr_full(ap, link, DSU_ID_COMPONENT_BASE)?;
        let pid = read_pidr_low(ap, link, DSU_ID_COMPONENT_BASE)?;
        if cid != CID_VALUE || pid & PID_MASK != PID_CONST_VALUE {
            return Ok(None);
        }

        let did = ap.read_word32(link, DSU_DID)?;
        if did & DID_MASK != DID_CONST_VALUE {
            return Ok(None);
        }

        let descriptor = parse_device_id(did);
        let ctrlstat = ap.read_word32(link, DSU_CTRLSTAT)?;
        let protected = ctrlstat & STATUSB_PROT != 0;

        let errata = if descriptor.series == 20 && descriptor.revision == 'B' {
            Errata::Series20RevB
        } else if descriptor.series == 11 {
            Errata::Series11
        } else {
            Errata::None
        };

        debug!(?descriptor, protected, "SAM D device identified");
        Ok(Some(SamdTarget {
            descriptor,
            protected,
            errata,
            rescued: false,
        }))
    }

    /// Human-readable part string, e.g. `Atmel SAMD21G18A (rev B)`.
    pub fn part_string(&self) -> String {
        let d = &self.descriptor;
        let base = format!(
            "Atmel SAM{}{:02}{}{}{}{} (rev {})",
            d.family, d.series, d.pin, d.mem, d.variant, d.package, d.revision
        );
        if self.protected {
            format!("{base} (PROT=1)")
        } else {
            base
        }
    }

    fn clear_crstext_if_set(&self, ap: &mut AccessPort, link: &mut impl Link) -> Result<(), FlashError> {
        let ctrlstat = ap.read_word32(link, DSU_CTRLSTAT)?;
        if ctrlstat & STATUSA_CRSTEXT != 0 {
            ap.write_word32(link, DSU_CTRLSTAT, STATUSA_CRSTEXT)?;
        }
        Ok(())
    }

    fn unlock(&self, ap: &mut AccessPort, link: &mut impl Link) -> Result<(), FlashError> {
        ap.write_word32(link, NVMC_CTRLA, CMD_KEY | CMD_UNLOCK)?;
        Ok(())
    }

    fn lock(&self, ap: &mut AccessPort, link: &mut impl Link) -> Result<(), FlashError> {
        ap.write_word32(link, NVMC_CTRLA, CMD_KEY | CMD_LOCK)?;
        Ok(())
    }

    /// Poll `INTFLAG.READY`, bailing out on a sticky ADI fault (the
    /// transaction already triggered an ABORT) or on timeout, rather than
    /// spinning forever.
    fn poll_nvm_ready(&self, ap: &mut AccessPort, link: &mut impl Link, platform: &mut impl Platform) -> Result<(), FlashError> {
        let deadline = platform.timeout_set(NVM_READY_TIMEOUT_MS);
        loop {
            if ap.dp.borrow().fault() {
                warn!("ADI fault latched while waiting for NVMC ready");
                return Err(FlashError::OperationFailed);
            }
            let intflag = ap.read_word32(link, NVMC_INTFLAG)?;
            if intflag & NVMC_READY != 0 {
                return Ok(());
            }
            platform.tick();
            if platform.timeout_is_expired(&deadline) {
                return Err(FlashError::OperationTimeout);
            }
        }
    }

    /// Erase a range by issuing one `ERASEROW` per 256-byte row it spans.
    pub fn flash_erase(
        &self,
        ap: &mut AccessPort,
        link: &mut impl Link,
        platform: &mut impl Platform,
        addr: u32,
        len: u32,
    ) -> Result<(), FlashError> {
        let mut addr = addr;
        let mut remaining = len;
        while remaining > 0 {
            ap.write_word32(link, NVMC_ADDRESS, addr >> 1)?;
            self.unlock(ap, link)?;
            ap.write_word32(link, NVMC_CTRLA, CMD_KEY | CMD_ERASEROW)?;
            self.poll_nvm_ready(ap, link, platform)?;
            self.lock(ap, link)?;

            addr = addr.wrapping_add(ROW_SIZE);
            remaining = remaining.saturating_sub(ROW_SIZE);
        }
        Ok(())
    }

    /// Write one page (must not cross a page boundary).
    pub fn flash_write(
        &self,
        ap: &mut AccessPort,
        link: &mut impl Link,
        platform: &mut impl Platform,
        dest: u32,
        src: &[u8],
    ) -> Result<(), FlashError> {
        ap.mem_write_sized(link, dest, src)?;
        ap.write_barrier(link)?;
        self.unlock(ap, link)?;
        ap.write_word32(link, NVMC_CTRLA, CMD_KEY | CMD_WRITEPAGE)?;
        self.poll_nvm_ready(ap, link, platform)?;
        self.lock(ap, link)?;
        Ok(())
    }

    /// Chip-erase via the DSU, with a 500 ms timeout and per-tick progress
    /// reporting.
    pub fn mass_erase(
        &self,
        ap: &mut AccessPort,
        link: &mut impl Link,
        platform: &mut impl Platform,
    ) -> Result<(), FlashError> {
        ap.write_word32(link, DSU_CTRLSTAT, STATUSA_DONE | STATUSA_PERR | STATUSA_FAIL)?;
        ap.write_word32(link, DSU_CTRLSTAT, CTRL_CHIP_ERASE)?;

        let deadline = platform.timeout_set(MASS_ERASE_TIMEOUT_MS);
        loop {
            let status = ap.read_word32(link, DSU_CTRLSTAT)?;
            if let Some(outcome) = classify_dsu_status(status) {
                if outcome.is_err() {
                    warn!(?outcome, "mass erase did not complete cleanly");
                }
                return outcome;
            }
            platform.tick();
            if platform.timeout_is_expired(&deadline) {
                return Err(FlashError::OperationTimeout);
            }
        }
    }

    fn user_row_mutate(
        &self,
        ap: &mut AccessPort,
        link: &mut impl Link,
        platform: &mut impl Platform,
        edit: impl FnOnce(u32, u32) -> (u32, u32),
    ) -> Result<(), FlashError> {
        let high = ap.read_word32(link, USER_ROW_HIGH)?;
        let low = ap.read_word32(link, USER_ROW_LOW)?;

        ap.write_word32(link, NVMC_ADDRESS, USER_ROW_LOW >> 1)?;
        ap.write_word32(link, NVMC_CTRLA, CMD_KEY | CMD_ERASEAUXROW)?;
        self.poll_nvm_ready(ap, link, platform)?;

        let (new_low, new_high) = edit(low, high);
        ap.write_word32(link, USER_ROW_LOW, new_low)?;
        ap.write_word32(link, USER_ROW_HIGH, new_high)?;
        ap.write_word32(link, NVMC_CTRLA, CMD_KEY | CMD_WRITEAUXPAGE)?;
        Ok(())
    }

    /// `lock_flash` / `unlock_flash`: rewrite the lock-bit half-word (bits
    /// 48-63, i.e. the top 16 bits of the high word) of the user row.
    pub fn set_flash_lock(
        &self,
        ap: &mut AccessPort,
        link: &mut impl Link,
        platform: &mut impl Platform,
        value: u16,
    ) -> Result<(), FlashError> {
        self.user_row_mutate(ap, link, platform, |low, high| {
            (low, (high & 0x0000_FFFF) | ((value as u32) << 16))
        })
    }

    /// `bootprot`: rewrite the 3-bit boot-protection level (bits 0-2 of the
    /// low word).
    pub fn set_bootprot(
        &self,
        ap: &mut AccessPort,
        link: &mut impl Link,
        platform: &mut impl Platform,
        level: u8,
    ) -> Result<(), FlashError> {
        let level = level & 0x7;
        self.user_row_mutate(ap, link, platform, |low, high| ((low & !0x7) | level as u32, high))
    }

    /// Current boot-protection level, decoded without mutation.
    pub fn bootprot(&self, ap: &mut AccessPort, link: &mut impl Link) -> Result<u8, FlashError> {
        Ok((ap.read_word32(link, USER_ROW_LOW)? & 0x7) as u8)
    }

    /// `user_row`: raw low/high words for diagnostics.
    pub fn user_row(&self, ap: &mut AccessPort, link: &mut impl Link) -> Result<(u32, u32), FlashError> {
        let low = ap.read_word32(link, USER_ROW_LOW)?;
        let high = ap.read_word32(link, USER_ROW_HIGH)?;
        Ok((low, high))
    }

    /// `serial`: the 128-bit unique serial number as four big-endian words.
    pub fn serial(&self, ap: &mut AccessPort, link: &mut impl Link) -> Result<[u32; 4], FlashError> {
        let mut words = [0u32; 4];
        for (n, word) in words.iter_mut().enumerate() {
            let addr = SERIAL_WORD_BASE + 0x30 * ((n as u32 + 3) / 4) + n as u32 * 4;
            *word = ap.read_word32(link, addr)?;
        }
        Ok(words)
    }

    /// `mbist`: DSU built-in memory self-test over the full Flash range.
    /// Returns `Ok(None)` on pass, `Ok(Some(fail_addr))` on a located
    /// failure.
    pub fn mbist(&self, ap: &mut AccessPort, link: &mut impl Link) -> Result<Option<u32>, FlashError> {
        ap.write_word32(link, DSU_ADDRESS, 0)?;
        ap.write_word32(link, DSU_LENGTH, self.descriptor.flash_size)?;
        ap.write_word32(link, DSU_CTRLSTAT, STATUSA_FAIL)?;
        ap.write_word32(link, DSU_CTRLSTAT, CTRL_MBIST)?;

        loop {
            let status = ap.read_word32(link, DSU_CTRLSTAT)?;
            match classify_dsu_status(status) {
                Some(Ok(())) => return Ok(None),
                Some(Err(FlashError::OperationFailed)) => {
                    let fail_addr = ap.read_word32(link, DSU_ADDRESS)?;
                    return Ok(Some(fail_addr));
                }
                Some(Err(other)) => return Err(other),
                None => {}
            }
        }
    }
}

impl DebugSequence for SamdTarget {
    fn attach(
        &mut self,
        ap: &mut AccessPort,
        link: &mut impl Link,
        platform: &mut impl Platform,
    ) -> Result<(), CortexMError> {
        if self.protected && !self.rescued {
            warn!("attaching to protected device; issue a mass erase to regain access");
            self.rescued = true;
            return Ok(());
        }

        if self.errata == Errata::Series11 {
            let _ = self.clear_crstext_if_set(ap, link);
        }

        cortex_m::cortexm_prepare(ap, link, platform, false, super::DEFAULT_ATTACH_TIMEOUT_MS)
    }

    fn detach(&mut self, ap: &mut AccessPort, link: &mut impl Link) -> Result<(), CortexMError> {
        cortex_m::restore_demcr(ap, link)?;
        if self.errata == Errata::Series20RevB {
            let _ = self.clear_crstext_if_set(ap, link);
        }
        Ok(())
    }

    /// Asserting nRST resets the ADI logic on this family, so reset instead
    /// goes through `AIRCR.SYSRESETREQ` and clears `CRSTEXT` by hand.
    fn reset(&mut self, ap: &mut AccessPort, link: &mut impl Link, _halt_after: bool) -> Result<(), CortexMError> {
        // Clears S_RESET_ST left over from any prior reset before we wait on it below.
        let _ = ap.read_word32(link, DHCSR_ADDR);
        cortex_m::system_reset_request(ap, link)?;
        let _ = self.clear_crstext_if_set(ap, link);

        loop {
            let dhcsr = crate::cortex_m::Dhcsr(ap.read_word32(link, DHCSR_ADDR)?);
            if !dhcsr.s_reset_st() {
                break;
            }
        }

        ap.write_word32(link, DFSR_ADDR, DFSR_RESETALL)?;
        ap.dp.borrow_mut().clear_fault();
        Ok(())
    }

    fn halt_resume(&mut self, ap: &mut AccessPort, link: &mut impl Link, _resume: bool) -> Result<(), CortexMError> {
        if self.errata == Errata::Series20RevB {
            let _ = self.clear_crstext_if_set(ap, link);
        }
        Ok(())
    }

    fn mass_erase(
        &mut self,
        ap: &mut AccessPort,
        link: &mut impl Link,
        platform: &mut impl Platform,
    ) -> Result<bool, FlashError> {
        SamdTarget::mass_erase(self, ap, link, platform)?;
        Ok(true)
    }
}
