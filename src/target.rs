//! The `Target` handle produced by a successful probe: its Flash regions,
//! RAM map, and the family hooks installed by [`crate::sequences`]. See
//! SPEC_FULL.md §3.

use crate::ap::AccessPort;
use crate::cortex_m::CortexMError;
use crate::link::Link;
use crate::platform::Platform;
use crate::sequences::{DebugSequence, FlashError};

/// A contiguous RAM window reported by a target (for display/sanity checks;
/// this crate does not itself allocate from it).
#[derive(Debug, Clone, Copy)]
pub struct RamRegion {
    pub start: u32,
    pub length: u32,
}

/// `(start, length, block_size, page_size)` description of one Flash bank.
/// Erase/write dispatch goes through the owning target's [`DebugSequence`]
/// rather than a per-region callback, since every region on a given part
/// shares the same driver.
#[derive(Debug, Clone, Copy)]
pub struct FlashRegion {
    pub start: u32,
    pub length: u32,
    pub block_size: u32,
    pub page_size: u32,
}

impl FlashRegion {
    /// Whether `[addr, addr+len)` falls entirely within this region.
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        let end = self.start as u64 + self.length as u64;
        let range_end = addr as u64 + len as u64;
        addr as u64 >= self.start as u64 && range_end <= end
    }
}

/// A probed target: its Flash layout, RAM map, driver name, and the
/// attach/detach/reset/mass-erase hooks for the family it matched.
pub struct Target<S: DebugSequence> {
    pub driver_name: &'static str,
    pub flash_regions: Vec<FlashRegion>,
    pub ram_regions: Vec<RamRegion>,
    pub sequence: S,
}

impl<S: DebugSequence> Target<S> {
    pub fn new(driver_name: &'static str, sequence: S) -> Self {
        Target {
            driver_name,
            flash_regions: Vec::new(),
            ram_regions: Vec::new(),
            sequence,
        }
    }

    pub fn with_flash_region(mut self, region: FlashRegion) -> Self {
        self.flash_regions.push(region);
        self
    }

    pub fn with_ram_region(mut self, region: RamRegion) -> Self {
        self.ram_regions.push(region);
        self
    }

    /// Find the region a write/erase at `(addr, len)` belongs to, so a
    /// caller can reject a request crossing a region boundary before it
    /// reaches the driver.
    pub fn region_for(&self, addr: u32, len: u32) -> Option<&FlashRegion> {
        self.flash_regions.iter().find(|r| r.contains(addr, len))
    }

    pub fn attach(&mut self, ap: &mut AccessPort, link: &mut impl Link, platform: &mut impl Platform) -> Result<(), CortexMError> {
        self.sequence.attach(ap, link, platform)
    }

    pub fn detach(&mut self, ap: &mut AccessPort, link: &mut impl Link) -> Result<(), CortexMError> {
        self.sequence.detach(ap, link)
    }

    pub fn reset(&mut self, ap: &mut AccessPort, link: &mut impl Link, halt_after: bool) -> Result<(), CortexMError> {
        self.sequence.reset(ap, link, halt_after)
    }

    pub fn halt_resume(&mut self, ap: &mut AccessPort, link: &mut impl Link, resume: bool) -> Result<(), CortexMError> {
        self.sequence.halt_resume(ap, link, resume)
    }

    pub fn mass_erase(&mut self, ap: &mut AccessPort, link: &mut impl Link, platform: &mut impl Platform) -> Result<bool, FlashError> {
        self.sequence.mass_erase(ap, link, platform)
    }
}
