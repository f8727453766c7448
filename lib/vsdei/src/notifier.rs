// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Observation of event delivery by other subsystems.
//!
//! A subsystem which owns an event (such as asynchronous page fault
//! handling) can attach a notifier to it with
//! [`Sdei::register_notifier`](crate::Sdei::register_notifier). The notifier
//! is called on the vCPU's own thread, with no SDEI locks held, after each
//! delivery and completion of that event. For any one instance of the event,
//! [`NotifyPhase::Delivered`] is always reported before
//! [`NotifyPhase::Completed`].

use thiserror::Error;

use crate::common::VcpuId;

/// Transition of an event instance reported to its notifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyPhase {
    /// The event was delivered: the vCPU is about to enter its handler.
    Delivered,
    /// The handler completed and the interrupted context was restored.
    Completed,
}

pub type NotifyFn = dyn Fn(VcpuId, u32, NotifyPhase) + Send + Sync + 'static;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifierError {
    #[error("event {0:#x} is not defined")]
    NotFound(u32),
}
