//! ARM ADIv5 Debug Port / Access Port transport engine, CoreSight ROM-table
//! walker, and Cortex-M/SAM D target driver, meant to be embedded directly
//! into probe firmware rather than a hosted debug application.
//!
//! A caller supplies a [`link::Link`] (the raw SWD/JTAG wire protocol) and a
//! [`platform::Platform`] (clock, timeout, nRST); this crate owns everything
//! from [`dp::DebugPort`] init up through identifying and driving a target.

pub mod ap;
pub mod cortex_m;
pub mod dp;
pub mod error;
pub mod link;
pub mod platform;
pub mod rom_table;
pub mod sequences;
pub mod target;

#[cfg(test)]
mod test_support;

pub use error::{ArmError, Error};
