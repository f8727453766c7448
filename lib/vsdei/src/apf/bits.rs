// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Constants of the asynchronous page fault guest interface.

/// Vendor-specific hypervisor service call (SMC64 fast call) through which
/// the guest configures asynchronous page faults.
pub const ARM_SMCCC_VENDOR_HYP_APF_FUNC_ID: u32 = 0xc600_0002;

pub const APF_FUNC_VERSION: u32 = 0;
pub const APF_FUNC_SLOTS: u32 = 1;
pub const APF_FUNC_SDEI: u32 = 2;
pub const APF_FUNC_IRQ: u32 = 3;
pub const APF_FUNC_ENABLE: u32 = 4;
pub const APF_FUNC_IRQ_ACK: u32 = 5;

/// Interface version: v1.0.0.
pub const APF_VERSION: u32 = 0x01_0000;

/// Outstanding faults tracked per vCPU.
pub const APF_SLOTS: u64 = 64;

pub const SMCCC_RET_SUCCESS: i64 = 0;
pub const SMCCC_RET_NOT_SUPPORTED: i64 = -1;
pub const SMCCC_RET_NOT_REQUIRED: i64 = -2;
pub const SMCCC_RET_INVALID_PARAMETER: i64 = -3;

bitflags! {
    /// Flags in the low bits of the control word written by the guest. The
    /// remaining bits hold the address of the shared record.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ApfControl: u64 {
        const ENABLED = 1 << 0;
        const SEND_ALWAYS = 1 << 1;
    }
}

/// The shared record is 64-byte aligned; its address occupies the control
/// word above these bits.
pub const APF_RECORD_ADDR_MASK: u64 = !0x3f;

/// Offsets within the shared `{ reason: u32, token: u32 }` record.
pub const APF_RECORD_REASON: usize = 0;
pub const APF_RECORD_TOKEN: usize = 4;

pub const APF_REASON_PAGE_NOT_PRESENT: u32 = 1;
pub const APF_REASON_PAGE_READY: u32 = 2;

/// Tokens carry the vCPU index in their low bits and a per-vCPU sequence
/// number above.
pub const APF_TOKEN_SEQ_SHIFT: u32 = 12;
