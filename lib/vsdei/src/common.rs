// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::Display;
use std::ops::Add;

use serde::{Deserialize, Serialize};

/// Index of a vCPU within its VM.
///
/// This is the value used to key per-vCPU state of private events, and the
/// value a pinned shared event names as its routing affinity.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct VcpuId(u32);

impl VcpuId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

impl From<u32> for VcpuId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<VcpuId> for u32 {
    fn from(value: VcpuId) -> Self {
        value.0
    }
}

impl Display for VcpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An address within a guest VM.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GuestAddr(pub u64);

impl GuestAddr {
    pub fn offset<T: Sized>(&self, count: usize) -> Self {
        Self(self.0 + (count * std::mem::size_of::<T>()) as u64)
    }
}

impl Add<usize> for GuestAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs as u64)
    }
}

/// Access to guest physical memory, as needed by the asynchronous page fault
/// shared record.
pub trait GuestMemory: Send + Sync + 'static {
    /// Reads a 32-bit value at `addr`, returning `None` if the address is not
    /// backed by guest memory.
    fn read_u32(&self, addr: GuestAddr) -> Option<u32>;

    /// Writes a 32-bit value at `addr`, returning `false` if the address is
    /// not backed by guest memory.
    fn write_u32(&self, addr: GuestAddr, val: u32) -> bool;
}

pub use crate::lifecycle::Lifecycle;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_addr_offset() {
        let base = GuestAddr(0x1000);
        assert_eq!(base.offset::<u32>(1), GuestAddr(0x1004));
        assert_eq!(base + 0x40, GuestAddr(0x1040));
    }

    #[test]
    fn vcpu_id_conversions() {
        let id = VcpuId::from(3);
        assert_eq!(u32::from(id), 3);
        assert_eq!(id.to_string(), "3");
    }
}
