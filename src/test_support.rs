//! Fake [`Link`]/[`Platform`] implementations shared by the unit tests in
//! this crate. Not part of the public API.

use std::cell::Cell;
use std::collections::HashMap;

use crate::error::Ack;
use crate::link::{Link, RegisterAddress};
use crate::platform::Platform;

const CSW: u8 = 0x00;
const TAR: u8 = 0x04;
const DRW: u8 = 0x0C;
const BASE2: u8 = 0xF0;
const BASE: u8 = 0xF8;
const IDR: u8 = 0xFC;

#[derive(Default, Clone, Copy)]
pub struct ApState {
    pub csw: u32,
    pub tar: u32,
    pub base: u32,
    pub idr: u32,
    /// Data latched by the last DRW read but not yet delivered to the
    /// caller, modelling the ADIv5 pipelined-read delay: the value a DRW
    /// read returns belongs to the *previous* transaction, and the final
    /// word of a sequence is retrieved from RDBUFF instead.
    pending: Option<u32>,
}

fn step_bytes(csw: u32) -> u32 {
    match csw & 0b111 {
        0 => 1,
        1 => 2,
        _ => 4,
    }
}

/// A software model of a single target's address space plus enough AP/DP
/// register behaviour to exercise the engines in this crate without real
/// silicon.
pub struct FakeLink {
    pub dpidr: u32,
    pub auto_power_up: bool,
    pub select_writes: u32,
    select: u32,
    pub aps: HashMap<u8, ApState>,
    pub mem: HashMap<u32, u8>,
    /// When set, the next register transaction reports `Ack::Fault` instead
    /// of succeeding, then clears itself — models a one-shot transport fault
    /// for exercising sticky-fault handling without real silicon.
    pub inject_fault: bool,
}

impl Default for FakeLink {
    fn default() -> Self {
        FakeLink {
            dpidr: 0,
            auto_power_up: true,
            select_writes: 0,
            select: 0,
            aps: HashMap::new(),
            mem: HashMap::new(),
            inject_fault: false,
        }
    }
}

impl FakeLink {
    fn current_ap(&self) -> u8 {
        (self.select >> 24) as u8
    }

    fn current_bank_offset(&self, addr_bits: u8) -> u8 {
        (((self.select >> 4) & 0xF) as u8) << 4 | (addr_bits << 2)
    }

    fn read_mem32(&self, addr: u32) -> u32 {
        let mut v = 0u32;
        for i in 0..4u32 {
            v |= (*self.mem.get(&(addr + i)).unwrap_or(&0xFF) as u32) << (8 * i);
        }
        v
    }

    fn write_mem32(&mut self, addr: u32, value: u32) {
        for i in 0..4u32 {
            self.mem.insert(addr + i, ((value >> (8 * i)) & 0xFF) as u8);
        }
    }

    /// Seed a byte in the simulated target address space (used to plant
    /// CIDR/PIDR/DEVTYPE/DEVARCH/NVMC/DSU fixtures for higher level tests).
    pub fn poke(&mut self, addr: u32, value: u8) {
        self.mem.insert(addr, value);
    }

    pub fn poke32(&mut self, addr: u32, value: u32) {
        self.write_mem32(addr, value);
    }
}

impl Link for FakeLink {
    fn read_register(&mut self, addr: RegisterAddress) -> (Ack, u32) {
        if self.inject_fault {
            self.inject_fault = false;
            return (Ack::Fault, 0);
        }
        if addr.is_ap {
            let ap_sel = self.current_ap();
            let offset = self.current_bank_offset(addr.addr_bits);
            let ap = *self.aps.entry(ap_sel).or_default();
            let value = match offset {
                CSW => ap.csw,
                TAR => ap.tar,
                DRW => {
                    let fresh = self.read_mem32(ap.tar);
                    let step = step_bytes(ap.csw);
                    let entry = self.aps.entry(ap_sel).or_default();
                    let delivered = entry.pending.take().unwrap_or(0);
                    entry.pending = Some(fresh);
                    entry.tar = entry.tar.wrapping_add(step);
                    delivered
                }
                BASE => ap.base,
                BASE2 => 0,
                IDR => ap.idr,
                _ => 0,
            };
            (Ack::Ok, value)
        } else {
            let offset = addr.addr_bits << 2;
            let value = match offset {
                0x0 => self.dpidr,
                0x4 => {
                    if self.auto_power_up {
                        0xF000_0000
                    } else {
                        0
                    }
                }
                0x8 => self.select,
                // RDBUFF: peek the latched pending word for the currently
                // selected AP without advancing anything.
                0xC => {
                    let ap_sel = self.current_ap();
                    self.aps.get(&ap_sel).and_then(|a| a.pending).unwrap_or(0)
                }
                _ => 0,
            };
            (Ack::Ok, value)
        }
    }

    fn write_register(&mut self, addr: RegisterAddress, data: u32) -> Ack {
        if self.inject_fault {
            self.inject_fault = false;
            return Ack::Fault;
        }
        if addr.is_ap {
            let ap_sel = self.current_ap();
            let offset = self.current_bank_offset(addr.addr_bits);
            let ap = self.aps.entry(ap_sel).or_default();
            match offset {
                CSW => ap.csw = data,
                TAR => {
                    ap.tar = data;
                    ap.pending = None;
                }
                DRW => {
                    let tar = ap.tar;
                    let step = step_bytes(ap.csw);
                    self.write_mem32(tar, data);
                    let entry = self.aps.entry(ap_sel).or_default();
                    entry.tar = entry.tar.wrapping_add(step);
                }
                _ => {}
            }
        } else {
            let offset = addr.addr_bits << 2;
            if offset == 0x8 {
                if data != self.select {
                    self.select_writes += 1;
                }
                self.select = data;
            }
        }
        Ack::Ok
    }
}

pub struct FakePlatform {
    now_ms: Cell<u32>,
    pub advance_per_poll: u32,
    pub nrst: Cell<bool>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        FakePlatform {
            now_ms: Cell::new(0),
            advance_per_poll: 1,
            nrst: Cell::new(true),
        }
    }
}

impl Platform for FakePlatform {
    fn time_ms(&self) -> u32 {
        let t = self.now_ms.get();
        self.now_ms.set(t + self.advance_per_poll);
        t
    }

    fn delay_ms(&mut self, _ms: u32) {}

    fn nrst_set(&mut self, asserted: bool) {
        self.nrst.set(asserted);
    }

    fn nrst_get(&self) -> bool {
        self.nrst.get()
    }
}
