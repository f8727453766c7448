// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest registrations of virtual events.
//!
//! A registration record exists for an event number from the first time any
//! vCPU registers it until the last index is unregistered and no instance of
//! the event remains in flight. Private events keep one [`IndexState`] per
//! vCPU (keyed by vCPU index); shared events use the single index 0.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use strum::FromRepr;
use vsdei_types::EventKind;

use crate::common::VcpuId;
use crate::event::VirtualEvent;
use crate::status::SdeiStatus;
use crate::vm::Sdei;

/// Routing mode of a shared event.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, FromRepr, Serialize, Deserialize,
)]
#[repr(u64)]
pub enum RouteMode {
    /// Deliver to whichever vCPU the injector names.
    #[default]
    Any = 0,
    /// Deliver to the vCPU named by the routing affinity.
    Pe = 1,
}

/// Registration state of one index of an event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IndexState {
    pub registered: bool,
    pub enabled: bool,
    /// Handler entry point.
    pub entry: u64,
    /// Opaque argument passed to the handler in x1.
    pub arg: u64,
    /// Unregistered while an instance was running; the index is removed once
    /// that instance completes.
    pub unregister_pending: bool,
}

/// Index of the registration state used by `vcpu` for an event of `kind`.
pub fn index_for(kind: EventKind, vcpu: VcpuId) -> u32 {
    match kind {
        EventKind::Private => vcpu.into(),
        EventKind::Shared => 0,
    }
}

pub struct EventRegistration {
    event: VirtualEvent,
    indexes: BTreeMap<u32, IndexState>,
    route_mode: RouteMode,
    route_affinity: u64,
    run_count: Arc<AtomicU32>,
}

impl EventRegistration {
    pub(crate) fn new(event: VirtualEvent) -> Self {
        Self {
            event,
            indexes: BTreeMap::new(),
            route_mode: RouteMode::Any,
            route_affinity: 0,
            run_count: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn event(&self) -> &VirtualEvent {
        &self.event
    }

    pub fn index(&self, index: u32) -> Option<&IndexState> {
        self.indexes.get(&index)
    }

    pub(crate) fn index_mut(&mut self, index: u32) -> Option<&mut IndexState> {
        self.indexes.get_mut(&index)
    }

    pub fn indexes(&self) -> impl Iterator<Item = (u32, &IndexState)> {
        self.indexes.iter().map(|(idx, st)| (*idx, st))
    }

    /// Whether index `index` is registered and enabled.
    pub fn is_armed(&self, index: u32) -> bool {
        self.indexes.get(&index).map_or(false, |st| st.registered && st.enabled)
    }

    /// Number of delivered but not yet completed instances, across all vCPUs.
    pub fn run_count(&self) -> u32 {
        self.run_count.load(Ordering::Acquire)
    }

    pub fn route(&self) -> (RouteMode, u64) {
        (self.route_mode, self.route_affinity)
    }

    pub(crate) fn set_route(&mut self, mode: RouteMode, affinity: u64) {
        self.route_mode = mode;
        self.route_affinity = affinity;
    }

    /// The vCPU a pinned shared event must be delivered to.
    pub fn pinned_target(&self) -> Option<VcpuId> {
        match (self.event.kind, self.route_mode) {
            (EventKind::Shared, RouteMode::Pe) => {
                u32::try_from(self.route_affinity).ok().map(VcpuId::new)
            }
            _ => None,
        }
    }

    pub(crate) fn insert_index(&mut self, index: u32, state: IndexState) {
        self.indexes.insert(index, state);
    }

    pub(crate) fn remove_index(&mut self, index: u32) -> Option<IndexState> {
        self.indexes.remove(&index)
    }

    /// A record with no indexes and nothing in flight can be freed.
    pub fn is_idle(&self) -> bool {
        self.indexes.is_empty() && self.run_count() == 0
    }

    /// Records an in-flight instance of this event at `index`.
    pub(crate) fn acquire(&self, index: u32, vm: Weak<Sdei>) -> RunGuard {
        self.run_count.fetch_add(1, Ordering::AcqRel);
        RunGuard {
            number: self.event.number,
            index,
            count: self.run_count.clone(),
            vm,
        }
    }

    pub(crate) fn shares_counter(&self, count: &Arc<AtomicU32>) -> bool {
        Arc::ptr_eq(&self.run_count, count)
    }

    /// Carries the in-flight counter of a record being replaced over to its
    /// replacement, so outstanding instances stay accounted for.
    pub(crate) fn adopt_counter(&mut self, old: &EventRegistration) {
        self.run_count = old.run_count.clone();
    }
}

/// Accounting for one delivered instance of an event.
///
/// Dropping the guard retires the instance. When that leaves the
/// registration with a deferred unregistration to finish, the record is torn
/// down under the VM lock, so a guard must never be dropped while that lock
/// (or a vCPU lock) is held.
pub struct RunGuard {
    number: u32,
    index: u32,
    count: Arc<AtomicU32>,
    vm: Weak<Sdei>,
}

impl RunGuard {
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
        if let Some(vm) = self.vm.upgrade() {
            vm.release_run(self.number, self.index, &self.count);
        }
    }
}

/// Table of registration records for a VM, keyed by event number.
pub struct RegistrationTable {
    entries: BTreeMap<u32, EventRegistration>,
    capacity: usize,
}

impl RegistrationTable {
    pub fn new(capacity: usize) -> Self {
        Self { entries: BTreeMap::new(), capacity }
    }

    pub fn get(&self, number: u32) -> Option<&EventRegistration> {
        self.entries.get(&number)
    }

    pub(crate) fn get_mut(
        &mut self,
        number: u32,
    ) -> Option<&mut EventRegistration> {
        self.entries.get_mut(&number)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventRegistration> {
        self.entries.values()
    }

    /// The first record with an event number greater than `after`, or the
    /// first record overall when `after` is `None`.
    pub fn next_after(&self, after: Option<u32>) -> Option<&EventRegistration> {
        let lower = match after {
            Some(num) => Bound::Excluded(num),
            None => Bound::Unbounded,
        };
        self.entries.range((lower, Bound::Unbounded)).next().map(|(_, r)| r)
    }

    /// Registers `event` at `index` with the given handler.
    ///
    /// The record is created on first registration. Routing information is
    /// only retained for shared events.
    pub(crate) fn register(
        &mut self,
        event: &VirtualEvent,
        index: u32,
        entry: u64,
        arg: u64,
        route: (RouteMode, u64),
    ) -> SdeiStatus {
        if !self.entries.contains_key(&event.number) && self.is_full() {
            return SdeiStatus::OutOfResource;
        }
        let reg = self
            .entries
            .entry(event.number)
            .or_insert_with(|| EventRegistration::new(*event));
        if let Some(st) = reg.index(index) {
            if st.registered || st.unregister_pending {
                return SdeiStatus::Denied;
            }
        }

        reg.insert_index(
            index,
            IndexState { registered: true, entry, arg, ..Default::default() },
        );
        if event.kind == EventKind::Shared {
            reg.set_route(route.0, route.1);
        }
        SdeiStatus::Success
    }

    /// Removes `index` from the record for `number`, freeing the record if
    /// nothing else holds it. Returns `true` if the record was freed.
    pub(crate) fn remove_index(&mut self, number: u32, index: u32) -> bool {
        if let Some(reg) = self.entries.get_mut(&number) {
            reg.remove_index(index);
        }
        self.remove_if_idle(number)
    }

    pub(crate) fn remove_if_idle(&mut self, number: u32) -> bool {
        match self.entries.get(&number) {
            Some(reg) if reg.is_idle() => {
                self.entries.remove(&number);
                true
            }
            _ => false,
        }
    }

    /// Installs `reg`, replacing any existing record for the same event.
    pub(crate) fn insert(&mut self, reg: EventRegistration) {
        self.entries.insert(reg.event.number, reg);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use vsdei_types::{EventDesc, EventPriority};

    const PRIV: u32 = 0x4040_0000;
    const SHARED: u32 = 0x4040_0001;

    fn event(number: u32, kind: EventKind) -> VirtualEvent {
        EventDesc {
            number,
            kind,
            priority: EventPriority::Normal,
            signaled: true,
        }
    }

    #[test]
    fn lazy_creation_and_double_register() {
        let mut table = RegistrationTable::new(4);
        let ev = event(PRIV, EventKind::Private);
        let route = (RouteMode::Any, 0);

        assert!(table.get(PRIV).is_none());
        assert_eq!(
            table.register(&ev, 1, 0x1000, 0x2000, route),
            SdeiStatus::Success
        );

        let reg = table.get(PRIV).unwrap();
        let st = reg.index(1).unwrap();
        assert!(st.registered && !st.enabled);
        assert_eq!((st.entry, st.arg), (0x1000, 0x2000));

        assert_eq!(table.register(&ev, 1, 0, 0, route), SdeiStatus::Denied);
        // another vCPU has its own index
        assert_eq!(table.register(&ev, 2, 0, 0, route), SdeiStatus::Success);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn route_only_kept_for_shared() {
        let mut table = RegistrationTable::new(4);
        let pe = (RouteMode::Pe, 3);
        table.register(&event(PRIV, EventKind::Private), 0, 0, 0, pe);
        table.register(&event(SHARED, EventKind::Shared), 0, 0, 0, pe);

        assert_eq!(table.get(PRIV).unwrap().route(), (RouteMode::Any, 0));
        assert_eq!(table.get(SHARED).unwrap().route(), pe);
        assert_eq!(
            table.get(SHARED).unwrap().pinned_target(),
            Some(VcpuId::new(3))
        );
    }

    #[test]
    fn capacity_limit() {
        let mut table = RegistrationTable::new(1);
        let route = (RouteMode::Any, 0);
        table.register(&event(PRIV, EventKind::Private), 0, 0, 0, route);

        assert_eq!(
            table.register(&event(SHARED, EventKind::Shared), 0, 0, 0, route),
            SdeiStatus::OutOfResource
        );
        // existing records may still gain indexes
        assert_eq!(
            table.register(&event(PRIV, EventKind::Private), 1, 0, 0, route),
            SdeiStatus::Success
        );
    }

    #[test]
    fn guard_holds_record() {
        let mut table = RegistrationTable::new(4);
        let ev = event(PRIV, EventKind::Private);
        table.register(&ev, 0, 0, 0, (RouteMode::Any, 0));

        let guard = table.get(PRIV).unwrap().acquire(0, Weak::new());
        assert_eq!(table.get(PRIV).unwrap().run_count(), 1);
        assert!(!table.remove_index(PRIV, 0));
        assert!(table.get(PRIV).is_some());

        drop(guard);
        assert_eq!(table.get(PRIV).unwrap().run_count(), 0);
        assert!(table.remove_if_idle(PRIV));
        assert!(table.is_empty());
    }

    #[test]
    fn iterate_by_number() {
        let mut table = RegistrationTable::new(4);
        let route = (RouteMode::Any, 0);
        table.register(&event(SHARED, EventKind::Shared), 0, 0, 0, route);
        table.register(&event(PRIV, EventKind::Private), 0, 0, 0, route);

        let first = table.next_after(None).unwrap().event().number;
        assert_eq!(first, PRIV);
        let second = table.next_after(Some(first)).unwrap().event().number;
        assert_eq!(second, SHARED);
        assert!(table.next_after(Some(second)).is_none());
    }
}
