// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VM-scoped SDEI state: the event registry, the registration table, and the
//! set of attached vCPUs.
//!
//! All of it sits behind a single lock. Operations which must also touch a
//! vCPU's event state take that vCPU's lock while holding the VM lock, never
//! the other way around.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, Weak};

use slog::{debug, info, warn, Logger};
use thiserror::Error;
use vsdei_types::{is_virtual_event, EventDesc, EventKind, SdeiConfig};

use crate::bits::*;
use crate::common::{Lifecycle, VcpuId};
use crate::event::{DefineError, EventRegistry};
use crate::migrate::{
    MigrateSingle, MigrateStateError, Migrator, PayloadOffer, PayloadOutput,
};
use crate::notifier::{NotifierError, NotifyFn};
use crate::registration::{
    index_for, EventRegistration, RegistrationTable, RouteMode,
};
use crate::status::SdeiStatus;
use crate::vcpu::{KickFn, SdeiVcpu, VcpuEvents};

#[usdt::provider(provider = "vsdei")]
mod probes {
    fn sdei_inject(vcpu: u32, num: u32, immediate: bool, target: u32) {}
    fn sdei_inject_busy(vcpu: u32, num: u32) {}
    fn sdei_cancel(vcpu: u32, num: u32) {}
    fn sdei_unregister_deferred(num: u32, index: u32) {}
}

const TYPE_NAME: &str = "sdei";

/// Errors returned when raising or withdrawing an event on a vCPU.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InjectError {
    #[error("event is not registered and enabled for the target vCPU")]
    NotRegistered,

    #[error("target vCPU cannot take the event immediately")]
    Busy,

    #[error("event is not pending on the target vCPU")]
    NotPending,

    #[error("vCPU {0} is not attached")]
    NoVcpu(VcpuId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VcpuError {
    #[error("vCPU {0} is already attached")]
    AlreadyExists(VcpuId),

    #[error("vCPU {0} exceeds the supported maximum of {1}")]
    Unsupported(VcpuId, u32),
}

pub(crate) type VcpuMap = BTreeMap<VcpuId, Arc<VcpuEvents>>;

pub(crate) struct VmState {
    pub(crate) registry: EventRegistry,
    pub(crate) table: RegistrationTable,
    pub(crate) vcpus: VcpuMap,
}

/// Whether the instance of a registration at `index` is currently running.
///
/// A private index is only ever run by the vCPU it belongs to. A shared
/// event has a single index, which is in flight while any instance is.
pub(crate) fn in_flight(
    vcpus: &VcpuMap,
    reg: &EventRegistration,
    index: u32,
) -> bool {
    match reg.event().kind {
        EventKind::Private => {
            let number = reg.event().number;
            vcpus.get(&VcpuId::new(index)).map_or(false, |v| {
                v.state.lock().unwrap().is_running(number)
            })
        }
        EventKind::Shared => reg.run_count() > 0,
    }
}

/// Withdraws `number` from every pending set it may occupy for `index`.
fn clear_pending(vcpus: &VcpuMap, kind: EventKind, number: u32, index: u32) {
    match kind {
        EventKind::Private => {
            if let Some(v) = vcpus.get(&VcpuId::new(index)) {
                v.state.lock().unwrap().pending.remove(&number);
            }
        }
        EventKind::Shared => {
            for v in vcpus.values() {
                v.state.lock().unwrap().pending.remove(&number);
            }
        }
    }
}

fn routable(vcpus: &VcpuMap, affinity: u64) -> bool {
    u32::try_from(affinity)
        .map_or(false, |id| vcpus.contains_key(&VcpuId::new(id)))
}

/// SDEI emulation state for one VM.
pub struct Sdei {
    pub(crate) log: Logger,
    vendor: u32,
    pub(crate) max_vcpus: u32,
    pub(crate) inner: Mutex<VmState>,
    pub(crate) this: Weak<Sdei>,
}

impl Sdei {
    /// Creates the SDEI state for a VM, seeding its registry with the event
    /// table from `config`.
    pub fn new(
        log: &Logger,
        config: &SdeiConfig,
    ) -> Result<Arc<Self>, DefineError> {
        let registry = EventRegistry::new(config.events.iter())?;
        let log = log.new(slog::o!("component" => TYPE_NAME));
        info!(
            log,
            "creating SDEI emulation";
            "events" => registry.len(),
            "max_registrations" => config.max_registrations,
            "vendor" => config.vendor,
        );

        Ok(Arc::new_cyclic(|this| Self {
            log,
            vendor: config.vendor,
            max_vcpus: config.max_vcpus,
            inner: Mutex::new(VmState {
                registry,
                table: RegistrationTable::new(config.max_registrations),
                vcpus: BTreeMap::new(),
            }),
            this: this.clone(),
        }))
    }

    /// Attaches vCPU `id`.
    ///
    /// `kick` is called whenever another thread makes an event deliverable
    /// on this vCPU, so that the vCPU can be forced out of guest context to
    /// run [`SdeiVcpu::run_pending`].
    pub fn create_vcpu(
        self: &Arc<Self>,
        id: VcpuId,
        kick: Option<Box<KickFn>>,
    ) -> Result<SdeiVcpu, VcpuError> {
        if u32::from(id) >= self.max_vcpus {
            return Err(VcpuError::Unsupported(id, self.max_vcpus));
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.vcpus.contains_key(&id) {
            return Err(VcpuError::AlreadyExists(id));
        }
        let events = Arc::new(VcpuEvents::new(id, kick));
        inner.vcpus.insert(id, events.clone());
        drop(inner);

        Ok(SdeiVcpu::new(self.clone(), events))
    }

    pub(crate) fn detach_vcpu(&self, id: VcpuId) {
        self.inner.lock().unwrap().vcpus.remove(&id);
    }

    /// Value reported by `SDEI_VERSION`.
    pub fn version(&self) -> u64 {
        sdei_version(1, 0, self.vendor)
    }

    /// Attaches `notifier` to event `number`, replacing any prior notifier.
    pub fn register_notifier(
        &self,
        number: u32,
        notifier: Arc<NotifyFn>,
    ) -> Result<(), NotifierError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.registry.set_notifier(number, notifier) {
            return Err(NotifierError::NotFound(number));
        }
        debug!(self.log, "notifier attached"; "event" => number);
        Ok(())
    }

    /// Whether vCPU `id` is running an event handler, or `None` if no such
    /// vCPU is attached.
    pub fn vcpu_running(&self, id: VcpuId) -> Option<bool> {
        let inner = self.inner.lock().unwrap();
        let vcpu = inner.vcpus.get(&id)?;
        let busy = vcpu.state.lock().unwrap().is_busy();
        Some(busy)
    }

    /// Makes event `number` pending on `vcpu`.
    ///
    /// The event must be registered and enabled for the vCPU (or, for a
    /// shared event, at all). A shared event pinned to a vCPU is redirected
    /// to that vCPU. With `immediate` set, the request fails with
    /// [`InjectError::Busy`] unless the target is unmasked and has nothing
    /// pending or running, so that the event is certain to be the next thing
    /// the vCPU delivers.
    pub fn inject(
        &self,
        vcpu: VcpuId,
        number: u32,
        immediate: bool,
    ) -> Result<(), InjectError> {
        let target = {
            let inner = self.inner.lock().unwrap();
            let reg =
                inner.table.get(number).ok_or(InjectError::NotRegistered)?;
            let index = index_for(reg.event().kind, vcpu);
            if !reg.is_armed(index) {
                return Err(InjectError::NotRegistered);
            }
            let target_id = reg.pinned_target().unwrap_or(vcpu);
            let target = inner
                .vcpus
                .get(&target_id)
                .ok_or(InjectError::NoVcpu(target_id))?
                .clone();

            let mut state = target.state.lock().unwrap();
            if immediate && (state.masked || state.has_work()) {
                probes::sdei_inject_busy!(|| (u32::from(vcpu), number));
                return Err(InjectError::Busy);
            }
            state.pending.insert(number);
            if state.masked {
                return Ok(());
            }
            drop(state);
            target
        };

        probes::sdei_inject!(|| (
            u32::from(vcpu),
            number,
            immediate,
            u32::from(target.id)
        ));
        if target.id != vcpu {
            debug!(
                self.log,
                "redirected pinned event";
                "event" => number,
                "vcpu" => u32::from(target.id),
            );
        }
        target.request_delivery(true);
        Ok(())
    }

    /// Withdraws a pending, not yet delivered, instance of `number` from
    /// `vcpu`.
    pub fn cancel(&self, vcpu: VcpuId, number: u32) -> Result<(), InjectError> {
        let inner = self.inner.lock().unwrap();
        let reg = inner.table.get(number).ok_or(InjectError::NotRegistered)?;
        let target_id = reg.pinned_target().unwrap_or(vcpu);
        let target =
            inner.vcpus.get(&target_id).ok_or(InjectError::NoVcpu(target_id))?;

        let mut state = target.state.lock().unwrap();
        if state.is_running(number) {
            return Err(InjectError::Busy);
        }
        if !state.pending.remove(&number) {
            return Err(InjectError::NotPending);
        }
        probes::sdei_cancel!(|| (u32::from(vcpu), number));
        Ok(())
    }

    pub(crate) fn register(
        &self,
        vcpu: VcpuId,
        num: u64,
        entry: u64,
        arg: u64,
        route_mode: u64,
        affinity: u64,
    ) -> SdeiStatus {
        if !is_virtual_event(num) {
            return SdeiStatus::InvalidParameters;
        }
        let Some(mode) = RouteMode::from_repr(route_mode) else {
            return SdeiStatus::InvalidParameters;
        };

        let mut guard = self.inner.lock().unwrap();
        let VmState { registry, table, vcpus } = &mut *guard;
        let Some(event) = registry.find(num).copied() else {
            return SdeiStatus::InvalidParameters;
        };
        if event.kind == EventKind::Shared
            && mode == RouteMode::Pe
            && !routable(vcpus, affinity)
        {
            return SdeiStatus::InvalidParameters;
        }

        // A deferred unregistration whose instance has since retired can be
        // finished now rather than blocking the new registration.
        let index = index_for(event.kind, vcpu);
        if let Some(reg) = table.get(event.number) {
            let stale = reg.index(index).map_or(false, |st| {
                st.unregister_pending && !in_flight(vcpus, reg, index)
            });
            if stale {
                table.remove_index(event.number, index);
            }
        }

        let res =
            table.register(&event, index, entry, arg, (mode, affinity));
        if res == SdeiStatus::OutOfResource {
            warn!(
                self.log,
                "registration table full";
                "event" => event.number,
                "capacity" => table.len(),
            );
        }
        res
    }

    pub(crate) fn enable(
        &self,
        vcpu: VcpuId,
        num: u64,
        enable: bool,
    ) -> SdeiStatus {
        if !is_virtual_event(num) {
            return SdeiStatus::InvalidParameters;
        }
        let num = num as u32;

        let mut guard = self.inner.lock().unwrap();
        let VmState { table, vcpus, .. } = &mut *guard;
        let Some(reg) = table.get_mut(num) else {
            return SdeiStatus::InvalidParameters;
        };
        let kind = reg.event().kind;
        let index = index_for(kind, vcpu);
        match reg.index_mut(index) {
            Some(st) if st.registered => {
                if st.enabled == enable {
                    return SdeiStatus::Denied;
                }
                st.enabled = enable;
            }
            _ => return SdeiStatus::Denied,
        }
        if enable {
            return SdeiStatus::Success;
        }

        clear_pending(vcpus, kind, num, index);
        if in_flight(vcpus, reg, index) {
            SdeiStatus::Pending
        } else {
            SdeiStatus::Success
        }
    }

    pub(crate) fn unregister(&self, vcpu: VcpuId, num: u64) -> SdeiStatus {
        if !is_virtual_event(num) {
            return SdeiStatus::InvalidParameters;
        }
        let num = num as u32;

        let mut guard = self.inner.lock().unwrap();
        let VmState { table, vcpus, .. } = &mut *guard;
        let Some(reg) = table.get_mut(num) else {
            return SdeiStatus::InvalidParameters;
        };
        let kind = reg.event().kind;
        let index = index_for(kind, vcpu);
        match reg.index_mut(index) {
            Some(st) if st.registered => {
                st.registered = false;
                st.enabled = false;
            }
            _ => return SdeiStatus::Denied,
        }
        clear_pending(vcpus, kind, num, index);

        if in_flight(vcpus, reg, index) {
            if let Some(st) = reg.index_mut(index) {
                st.unregister_pending = true;
            }
            probes::sdei_unregister_deferred!(|| (num, index));
            return SdeiStatus::Pending;
        }
        table.remove_index(num, index);
        SdeiStatus::Success
    }

    pub(crate) fn status(
        &self,
        vcpu: &VcpuEvents,
        num: u64,
    ) -> Result<u64, SdeiStatus> {
        if !is_virtual_event(num) {
            return Err(SdeiStatus::InvalidParameters);
        }
        let num = num as u32;

        let inner = self.inner.lock().unwrap();
        if inner.registry.find(num as u64).is_none() {
            return Err(SdeiStatus::InvalidParameters);
        }
        let Some(reg) = inner.table.get(num) else {
            return Ok(0);
        };

        let mut status = EventStatus::empty();
        let index = index_for(reg.event().kind, vcpu.id);
        if let Some(st) = reg.index(index) {
            status.set(EventStatus::REGISTERED, st.registered);
            status.set(EventStatus::ENABLED, st.enabled);
        }
        let running = match reg.event().kind {
            EventKind::Private => vcpu.state.lock().unwrap().is_running(num),
            EventKind::Shared => reg.run_count() > 0,
        };
        status.set(EventStatus::RUNNING, running);
        Ok(status.bits())
    }

    pub(crate) fn get_info(
        &self,
        num: u64,
        field: u64,
    ) -> Result<u64, SdeiStatus> {
        if !is_virtual_event(num) {
            return Err(SdeiStatus::InvalidParameters);
        }

        let inner = self.inner.lock().unwrap();
        let Some(event) = inner.registry.find(num) else {
            return Err(SdeiStatus::InvalidParameters);
        };
        match field {
            SDEI_EVENT_INFO_EV_TYPE => Ok(event.kind.info_value()),
            SDEI_EVENT_INFO_EV_SIGNALED => Ok(event.signaled as u64),
            SDEI_EVENT_INFO_EV_PRIORITY => Ok(event.priority.info_value()),
            SDEI_EVENT_INFO_EV_ROUTING_MODE | SDEI_EVENT_INFO_EV_ROUTING_AFF => {
                if event.kind == EventKind::Private {
                    return Err(SdeiStatus::InvalidParameters);
                }
                let (mode, affinity) = inner
                    .table
                    .get(event.number)
                    .filter(|reg| {
                        reg.index(0).map_or(false, |st| st.registered)
                    })
                    .map(|reg| reg.route())
                    .unwrap_or_default();
                if field == SDEI_EVENT_INFO_EV_ROUTING_MODE {
                    Ok(mode as u64)
                } else {
                    Ok(affinity)
                }
            }
            _ => Err(SdeiStatus::InvalidParameters),
        }
    }

    pub(crate) fn routing_set(
        &self,
        num: u64,
        route_mode: u64,
        affinity: u64,
    ) -> SdeiStatus {
        if !is_virtual_event(num) {
            return SdeiStatus::InvalidParameters;
        }
        let Some(mode) = RouteMode::from_repr(route_mode) else {
            return SdeiStatus::InvalidParameters;
        };

        let mut guard = self.inner.lock().unwrap();
        let VmState { registry, table, vcpus } = &mut *guard;
        match registry.find(num) {
            Some(ev) if ev.kind == EventKind::Shared => {}
            _ => return SdeiStatus::InvalidParameters,
        }
        let Some(reg) = table.get_mut(num as u32) else {
            return SdeiStatus::InvalidParameters;
        };
        if mode == RouteMode::Pe && !routable(vcpus, affinity) {
            return SdeiStatus::InvalidParameters;
        }
        match reg.index(0) {
            Some(st) if st.registered && !st.enabled => {}
            _ => return SdeiStatus::Denied,
        }
        if reg.run_count() > 0 {
            return SdeiStatus::Denied;
        }

        reg.set_route(mode, affinity);
        SdeiStatus::Success
    }

    /// Unregisters every event of `kind`, VM-wide.
    ///
    /// Indexes with a running instance are left for teardown when that
    /// instance completes.
    pub(crate) fn reset_events(&self, kind: EventKind) -> SdeiStatus {
        let mut guard = self.inner.lock().unwrap();
        let VmState { table, vcpus, .. } = &mut *guard;

        let numbers: Vec<u32> = table
            .iter()
            .filter(|reg| reg.event().kind == kind)
            .map(|reg| reg.event().number)
            .collect();
        for num in numbers {
            let Some(reg) = table.get_mut(num) else {
                continue;
            };
            let indexes: Vec<u32> = reg.indexes().map(|(idx, _)| idx).collect();
            for index in indexes {
                clear_pending(vcpus, kind, num, index);
                if in_flight(vcpus, reg, index) {
                    if let Some(st) = reg.index_mut(index) {
                        st.registered = false;
                        st.enabled = false;
                        st.unregister_pending = true;
                    }
                } else {
                    reg.remove_index(index);
                }
            }
            table.remove_if_idle(num);
        }

        debug!(self.log, "reset events"; "kind" => %kind);
        SdeiStatus::Success
    }

    /// Retires one instance of `number` at `index`, finishing a deferred
    /// unregistration if this was the instance it waited on.
    pub(crate) fn release_run(
        &self,
        number: u32,
        index: u32,
        count: &Arc<AtomicU32>,
    ) {
        let mut guard = self.inner.lock().unwrap();
        let VmState { table, vcpus, .. } = &mut *guard;
        let Some(reg) = table.get(number) else {
            return;
        };
        // The record was replaced (by reset or import) since this instance
        // was delivered.
        if !reg.shares_counter(count) {
            return;
        }
        let pending = reg.index(index).map_or(false, |st| st.unregister_pending);
        if pending && !in_flight(vcpus, reg, index) {
            let freed = table.remove_index(number, index);
            debug!(
                self.log,
                "completed deferred unregistration";
                "event" => number,
                "index" => index,
                "freed" => freed,
            );
        } else if table.remove_if_idle(number) {
            // The index went away while this instance was being completed.
            debug!(self.log, "freed idle registration"; "event" => number);
        }
    }
}

impl Lifecycle for Sdei {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn reset(&self) {
        let mut retired = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.table.clear();
            for vcpu in inner.vcpus.values() {
                retired.extend(vcpu.reset());
            }
        }
        // Retiring the instances takes the VM lock.
        drop(retired);
    }

    fn migrate(&'_ self) -> Migrator<'_> {
        Migrator::Single(self)
    }
}

impl MigrateSingle for Sdei {
    fn export(&self) -> Result<PayloadOutput, MigrateStateError> {
        let inner = self.inner.lock().unwrap();
        let events = inner.registry.iter().map(Into::into).collect();
        let registrations = inner
            .table
            .iter()
            .map(|reg| crate::mgmt::RegistrationState::from(reg).into())
            .collect();
        Ok(migrate::SdeiVmV1 { events, registrations }.into())
    }

    fn import(&self, mut offer: PayloadOffer) -> Result<(), MigrateStateError> {
        let migrate::SdeiVmV1 { events, registrations } = offer.parse()?;

        let mut inner = self.inner.lock().unwrap();
        let events: Vec<EventDesc> =
            events.into_iter().map(Into::into).collect();
        let registry = inner
            .registry
            .rebuild(events.iter())
            .map_err(|e| MigrateStateError::ImportFailed(e.to_string()))?;

        let mut table = RegistrationTable::new(inner.table.capacity());
        for reg in registrations {
            if table.is_full() {
                return Err(MigrateStateError::ImportFailed(
                    "registration table capacity exceeded".to_string(),
                ));
            }
            let reg = crate::mgmt::build_registration(
                &registry,
                self.max_vcpus,
                reg.into(),
            )
            .map_err(|e| MigrateStateError::ImportFailed(e.to_string()))?;
            let number = reg.event().number;
            table.insert(reg);
            table.remove_if_idle(number);
        }

        inner.registry = registry;
        let old = std::mem::replace(&mut inner.table, table);
        drop(inner);
        // Dropping the old records cannot retire instances: in-flight guards
        // hold their own references to the counters.
        drop(old);
        Ok(())
    }
}

pub(crate) mod migrate {
    use serde::{Deserialize, Serialize};
    use vsdei_types::{EventDesc, EventKind, EventPriority};

    use crate::mgmt::{IndexRecord, RegistrationState};
    use crate::migrate::{Schema, SchemaId};
    use crate::registration::RouteMode;

    #[derive(Debug, Serialize, Deserialize)]
    pub struct EventV1 {
        pub number: u32,
        pub shared: bool,
        pub critical: bool,
        pub signaled: bool,
    }

    impl From<&EventDesc> for EventV1 {
        fn from(ev: &EventDesc) -> Self {
            Self {
                number: ev.number,
                shared: ev.kind == EventKind::Shared,
                critical: ev.priority == EventPriority::Critical,
                signaled: ev.signaled,
            }
        }
    }

    impl From<EventV1> for EventDesc {
        fn from(ev: EventV1) -> Self {
            Self {
                number: ev.number,
                kind: if ev.shared {
                    EventKind::Shared
                } else {
                    EventKind::Private
                },
                priority: if ev.critical {
                    EventPriority::Critical
                } else {
                    EventPriority::Normal
                },
                signaled: ev.signaled,
            }
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct IndexV1 {
        pub index: u32,
        pub entry: u64,
        pub arg: u64,
        pub registered: bool,
        pub enabled: bool,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct RegistrationV1 {
        pub number: u32,
        pub refcount: u32,
        pub route_pe: bool,
        pub route_affinity: u64,
        pub indexes: Vec<IndexV1>,
    }

    impl From<RegistrationState> for RegistrationV1 {
        fn from(st: RegistrationState) -> Self {
            Self {
                number: st.number,
                refcount: st.refcount,
                route_pe: st.route_mode == RouteMode::Pe,
                route_affinity: st.route_affinity,
                indexes: st
                    .indexes
                    .into_iter()
                    .map(|rec| IndexV1 {
                        index: rec.index,
                        entry: rec.entry,
                        arg: rec.arg,
                        registered: rec.registered,
                        enabled: rec.enabled,
                    })
                    .collect(),
            }
        }
    }

    impl From<RegistrationV1> for RegistrationState {
        fn from(v1: RegistrationV1) -> Self {
            Self {
                number: v1.number,
                refcount: v1.refcount,
                route_mode: if v1.route_pe {
                    RouteMode::Pe
                } else {
                    RouteMode::Any
                },
                route_affinity: v1.route_affinity,
                indexes: v1
                    .indexes
                    .into_iter()
                    .map(|rec| IndexRecord {
                        index: rec.index,
                        entry: rec.entry,
                        arg: rec.arg,
                        registered: rec.registered,
                        enabled: rec.enabled,
                    })
                    .collect(),
            }
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct SdeiVmV1 {
        pub events: Vec<EventV1>,
        pub registrations: Vec<RegistrationV1>,
    }

    impl Schema<'_> for SdeiVmV1 {
        fn id() -> SchemaId {
            (super::TYPE_NAME, 1)
        }
    }
}
