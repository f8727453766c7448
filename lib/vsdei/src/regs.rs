// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to a vCPU's guest register file.

use serde::{Deserialize, Serialize};

use crate::bits::{AARCH64_GPRS, SDEI_CONTEXT_REGS};

/// The subset of vCPU register state that SDEI emulation reads and writes.
///
/// Implementations are expected to operate on the register state of a vCPU
/// which is stopped in a VM exit, so accesses are infallible.
pub trait GuestRegs {
    /// Reads general-purpose register `x{idx}`.
    ///
    /// # Panics
    ///
    /// Implementations may panic if `idx` is not less than 31.
    fn reg(&self, idx: usize) -> u64;
    fn set_reg(&mut self, idx: usize, val: u64);

    fn pc(&self) -> u64;
    fn set_pc(&mut self, val: u64);

    fn pstate(&self) -> u64;
    fn set_pstate(&mut self, val: u64);

    /// Sets the EL1 exception return address.
    fn set_elr_el1(&mut self, val: u64);

    /// Sets the EL1 saved program status.
    fn set_spsr_el1(&mut self, val: u64);
}

/// A plain in-memory register file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegFile {
    pub x: [u64; AARCH64_GPRS],
    pub pc: u64,
    pub pstate: u64,
    pub elr_el1: u64,
    pub spsr_el1: u64,
}

impl GuestRegs for RegFile {
    fn reg(&self, idx: usize) -> u64 {
        self.x[idx]
    }
    fn set_reg(&mut self, idx: usize, val: u64) {
        self.x[idx] = val;
    }
    fn pc(&self) -> u64 {
        self.pc
    }
    fn set_pc(&mut self, val: u64) {
        self.pc = val;
    }
    fn pstate(&self) -> u64 {
        self.pstate
    }
    fn set_pstate(&mut self, val: u64) {
        self.pstate = val;
    }
    fn set_elr_el1(&mut self, val: u64) {
        self.elr_el1 = val;
    }
    fn set_spsr_el1(&mut self, val: u64) {
        self.spsr_el1 = val;
    }
}

/// Guest context interrupted by an event delivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    pub regs: [u64; SDEI_CONTEXT_REGS],
    pub pc: u64,
    pub pstate: u64,
}

impl EventContext {
    /// Captures the preserved registers, PC, and PSTATE from `regs`.
    pub fn capture(regs: &dyn GuestRegs) -> Self {
        let mut ctx = Self {
            pc: regs.pc(),
            pstate: regs.pstate(),
            ..Default::default()
        };
        for (idx, val) in ctx.regs.iter_mut().enumerate() {
            *val = regs.reg(idx);
        }
        ctx
    }

    /// Writes the preserved general-purpose registers back into `regs`.
    ///
    /// PC and PSTATE are left for the caller, since completion may resume
    /// somewhere other than the interrupted context.
    pub fn restore_gprs(&self, regs: &mut dyn GuestRegs) {
        for (idx, val) in self.regs.iter().enumerate() {
            regs.set_reg(idx, *val);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capture_then_restore() {
        let mut rf = RegFile::default();
        for (i, x) in rf.x.iter_mut().enumerate() {
            *x = 0x100 + i as u64;
        }
        rf.pc = 0xffff_0000_0000_1000;
        rf.pstate = 0x3c5;

        let ctx = EventContext::capture(&rf);
        assert_eq!(ctx.regs[17], 0x111);
        assert_eq!(ctx.pc, rf.pc);

        let mut other = RegFile { x: [0; AARCH64_GPRS], ..rf.clone() };
        ctx.restore_gprs(&mut other);
        assert_eq!(other.x[..SDEI_CONTEXT_REGS], rf.x[..SDEI_CONTEXT_REGS]);
        // x18 and above are not part of the preserved set
        assert_eq!(other.x[18], 0);
    }
}
