// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Constant definitions for SDEI emulation. These are drawn from the Arm
//! Software Delegated Exception Interface specification, version 1.0, and the
//! SMC Calling Convention.
//!
//! Where possible, constants in this module are given names that match those
//! used in the SDEI specification.

/// Function identifiers are SMC64 fast calls in the standard secure service
/// range.
pub const SDEI_1_0_FN_BASE: u32 = 0xc400_0020;

pub const SDEI_1_0_FN_SDEI_VERSION: u32 = SDEI_1_0_FN_BASE;
pub const SDEI_1_0_FN_SDEI_EVENT_REGISTER: u32 = SDEI_1_0_FN_BASE + 0x01;
pub const SDEI_1_0_FN_SDEI_EVENT_ENABLE: u32 = SDEI_1_0_FN_BASE + 0x02;
pub const SDEI_1_0_FN_SDEI_EVENT_DISABLE: u32 = SDEI_1_0_FN_BASE + 0x03;
pub const SDEI_1_0_FN_SDEI_EVENT_CONTEXT: u32 = SDEI_1_0_FN_BASE + 0x04;
pub const SDEI_1_0_FN_SDEI_EVENT_COMPLETE: u32 = SDEI_1_0_FN_BASE + 0x05;
pub const SDEI_1_0_FN_SDEI_EVENT_COMPLETE_AND_RESUME: u32 =
    SDEI_1_0_FN_BASE + 0x06;
pub const SDEI_1_0_FN_SDEI_EVENT_UNREGISTER: u32 = SDEI_1_0_FN_BASE + 0x07;
pub const SDEI_1_0_FN_SDEI_EVENT_STATUS: u32 = SDEI_1_0_FN_BASE + 0x08;
pub const SDEI_1_0_FN_SDEI_EVENT_GET_INFO: u32 = SDEI_1_0_FN_BASE + 0x09;
pub const SDEI_1_0_FN_SDEI_EVENT_ROUTING_SET: u32 = SDEI_1_0_FN_BASE + 0x0a;
pub const SDEI_1_0_FN_SDEI_PE_MASK: u32 = SDEI_1_0_FN_BASE + 0x0b;
pub const SDEI_1_0_FN_SDEI_PE_UNMASK: u32 = SDEI_1_0_FN_BASE + 0x0c;
pub const SDEI_1_0_FN_SDEI_INTERRUPT_BIND: u32 = SDEI_1_0_FN_BASE + 0x0d;
pub const SDEI_1_0_FN_SDEI_INTERRUPT_RELEASE: u32 = SDEI_1_0_FN_BASE + 0x0e;
pub const SDEI_1_0_FN_SDEI_PRIVATE_RESET: u32 = SDEI_1_0_FN_BASE + 0x11;
pub const SDEI_1_0_FN_SDEI_SHARED_RESET: u32 = SDEI_1_0_FN_BASE + 0x12;

/// Last function identifier in the SDEI 1.0 range.
pub const SDEI_1_0_FN_LAST: u32 = SDEI_1_0_FN_SDEI_SHARED_RESET;

pub const SDEI_VERSION_MAJOR_SHIFT: u32 = 48;
pub const SDEI_VERSION_MAJOR_MASK: u64 = 0x7fff;
pub const SDEI_VERSION_MINOR_SHIFT: u32 = 32;
pub const SDEI_VERSION_MINOR_MASK: u64 = 0xffff;
pub const SDEI_VERSION_VENDOR_MASK: u64 = 0xffff_ffff;

/// Encodes the value returned by `SDEI_VERSION`.
pub const fn sdei_version(major: u64, minor: u64, vendor: u32) -> u64 {
    ((major & SDEI_VERSION_MAJOR_MASK) << SDEI_VERSION_MAJOR_SHIFT)
        | ((minor & SDEI_VERSION_MINOR_MASK) << SDEI_VERSION_MINOR_SHIFT)
        | vendor as u64
}

pub const SDEI_EVENT_REGISTER_RM_ANY: u64 = 0;
pub const SDEI_EVENT_REGISTER_RM_PE: u64 = 1;

pub const SDEI_EVENT_INFO_EV_TYPE: u64 = 0;
pub const SDEI_EVENT_INFO_EV_SIGNALED: u64 = 1;
pub const SDEI_EVENT_INFO_EV_PRIORITY: u64 = 2;
pub const SDEI_EVENT_INFO_EV_ROUTING_MODE: u64 = 3;
pub const SDEI_EVENT_INFO_EV_ROUTING_AFF: u64 = 4;

bitflags! {
    /// Bits returned by `SDEI_EVENT_STATUS`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventStatus: u64 {
        const REGISTERED = 1 << 0;
        const ENABLED = 1 << 1;
        const RUNNING = 1 << 2;
    }
}

/// Number of general-purpose registers (x0-x17) preserved across event
/// delivery and readable through `SDEI_EVENT_CONTEXT`.
pub const SDEI_CONTEXT_REGS: usize = 18;

/// Number of general-purpose registers in the AArch64 register file.
pub const AARCH64_GPRS: usize = 31;

pub const PSR_MODE_EL1H: u64 = 0x0000_0005;
pub const PSR_F_BIT: u64 = 0x0000_0040;
pub const PSR_I_BIT: u64 = 0x0000_0080;
pub const PSR_A_BIT: u64 = 0x0000_0100;
pub const PSR_D_BIT: u64 = 0x0000_0200;

/// PSTATE installed on handler entry (and on complete-and-resume): EL1 with
/// its own stack pointer, with debug, SError, IRQ, and FIQ all masked.
pub const SDEI_HANDLER_PSTATE: u64 =
    PSR_MODE_EL1H | PSR_D_BIT | PSR_A_BIT | PSR_I_BIT | PSR_F_BIT;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn version_encoding() {
        assert_eq!(sdei_version(1, 0, 0), 1 << 48);
        assert_eq!(sdei_version(1, 2, 0xabcd), (1 << 48) | (2 << 32) | 0xabcd);
    }

    #[test]
    fn handler_pstate() {
        assert_eq!(SDEI_HANDLER_PSTATE, 0x3c5);
    }
}
