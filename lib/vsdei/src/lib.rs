// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Emulation of the Arm Software Delegated Exception Interface (SDEI) for
//! virtual machines, and the asynchronous page fault mechanism built on it.
//!
//! A VM's SDEI state is held by an [`Sdei`] instance, which owns the table
//! of virtual events defined for the machine and the guest's registrations
//! of those events. Each vCPU attaches to it through an [`SdeiVcpu`], which
//! carries the per-vCPU mask, the pending set, and the two priority lanes of
//! in-flight events along with their saved register contexts.

#![allow(clippy::style)]

pub extern crate usdt;
#[macro_use]
extern crate bitflags;

pub mod apf;
pub mod bits;
pub mod common;
pub mod event;
pub mod hypercall;
pub mod intr_pins;
pub mod lifecycle;
pub mod migrate;
pub mod mgmt;
pub mod notifier;
pub mod regs;
pub mod registration;
pub mod status;
pub mod vcpu;
pub mod vm;


pub use common::{GuestAddr, VcpuId};
pub use status::SdeiStatus;
pub use vcpu::SdeiVcpu;
pub use vm::{InjectError, Sdei, VcpuError};
pub use vsdei_types::{EventDesc, EventKind, EventPriority, SdeiConfig};
