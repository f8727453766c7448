// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host management of SDEI state, bypassing the guest call path.
//!
//! The VMM uses these interfaces to define events before boot, to inspect
//! the guest's registrations, and to seed registrations and per-vCPU state
//! directly when restoring a saved VM.

use serde::{Deserialize, Serialize};
use slog::info;
use thiserror::Error;
use vsdei_types::{EventKind, EventPriority};

use crate::event::{DefineError, EventRegistry, VirtualEvent};
use crate::registration::{
    index_for, EventRegistration, IndexState, RouteMode,
};
use crate::regs::EventContext;
use crate::vcpu::{RunningEvent, SdeiVcpu};
use crate::vm::Sdei;

/// Version of the management interface: v1.0.0.
pub const SDEI_API_VERSION: u32 = 0x01_0000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("event {0:#x} is not defined")]
    UndefinedEvent(u32),

    #[error("event {0:#x} is not registered for this vCPU")]
    NotRegistered(u32),

    #[error("index {1} is not valid for event {0:#x}")]
    BadIndex(u32, u32),

    #[error("index {1} of event {0:#x} is enabled but not registered")]
    EnabledUnregistered(u32, u32),

    #[error("event {0:#x} does not belong in the {1} lane")]
    WrongLane(u32, EventPriority),

    #[error("registration table is full")]
    NoCapacity,
}

/// Registration of one index of an event.
///
/// An index that is neither registered nor enabled is awaiting completion of
/// an in-flight instance before it is torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub index: u32,
    pub entry: u64,
    pub arg: u64,
    pub registered: bool,
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationState {
    pub number: u32,
    /// Instances in flight when the record was read.
    pub refcount: u32,
    pub route_mode: RouteMode,
    pub route_affinity: u64,
    pub indexes: Vec<IndexRecord>,
}

impl From<&EventRegistration> for RegistrationState {
    fn from(reg: &EventRegistration) -> Self {
        let (route_mode, route_affinity) = reg.route();
        Self {
            number: reg.event().number,
            refcount: reg.run_count(),
            route_mode,
            route_affinity,
            indexes: reg
                .indexes()
                .map(|(index, st)| IndexRecord {
                    index,
                    entry: st.entry,
                    arg: st.arg,
                    registered: st.registered,
                    enabled: st.enabled,
                })
                .collect(),
        }
    }
}

/// Builds a registration record from its persisted form, validating it
/// against the event table.
///
/// The in-flight count is not carried over: it is rebuilt as vCPU state
/// naming running instances is restored.
pub(crate) fn build_registration(
    registry: &EventRegistry,
    max_vcpus: u32,
    st: RegistrationState,
) -> Result<EventRegistration, StateError> {
    let event: VirtualEvent = registry
        .find(st.number as u64)
        .copied()
        .ok_or(StateError::UndefinedEvent(st.number))?;
    if st.indexes.is_empty() {
        return Err(StateError::NotRegistered(st.number));
    }

    // With nothing in flight, an index awaiting deferred unregistration has
    // nothing left to wait for.
    let idle = st.refcount == 0;
    let mut reg = EventRegistration::new(event);
    for rec in st.indexes {
        let valid = match event.kind {
            EventKind::Private => rec.index < max_vcpus,
            EventKind::Shared => rec.index == 0,
        };
        if !valid {
            return Err(StateError::BadIndex(st.number, rec.index));
        }
        if rec.enabled && !rec.registered {
            return Err(StateError::EnabledUnregistered(st.number, rec.index));
        }
        if !rec.registered && idle {
            continue;
        }
        reg.insert_index(
            rec.index,
            IndexState {
                registered: rec.registered,
                enabled: rec.enabled,
                entry: rec.entry,
                arg: rec.arg,
                unregister_pending: !rec.registered,
            },
        );
    }
    if event.kind == EventKind::Shared {
        reg.set_route(st.route_mode, st.route_affinity);
    }
    Ok(reg)
}

/// An event instance occupying a vCPU lane, with the context it interrupted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningState {
    pub number: u32,
    pub ctx: EventContext,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuState {
    pub masked: bool,
    pub critical: Option<RunningState>,
    pub normal: Option<RunningState>,
    pub pending: Vec<u32>,
}

impl Sdei {
    pub fn api_version(&self) -> u32 {
        SDEI_API_VERSION
    }

    /// Adds an event to the VM's event table.
    pub fn define_event(&self, event: VirtualEvent) -> Result<(), DefineError> {
        let mut inner = self.inner.lock().unwrap();
        inner.registry.define(event)?;
        info!(
            self.log,
            "defined event";
            "event" => event.number,
            "kind" => %event.kind,
            "priority" => %event.priority,
        );
        Ok(())
    }

    /// The registration with the lowest event number greater than `after`,
    /// or the first registration when `after` is `None`.
    pub fn next_registration(
        &self,
        after: Option<u32>,
    ) -> Option<RegistrationState> {
        let inner = self.inner.lock().unwrap();
        inner.table.next_after(after).map(RegistrationState::from)
    }

    /// Installs a registration record, replacing any existing record for the
    /// same event. Instances of the event already in flight stay accounted
    /// to the new record.
    pub fn set_registration(
        &self,
        st: RegistrationState,
    ) -> Result<(), StateError> {
        let mut inner = self.inner.lock().unwrap();
        let mut reg = build_registration(&inner.registry, self.max_vcpus, st)?;
        match inner.table.get(reg.event().number) {
            Some(old) => reg.adopt_counter(old),
            None if inner.table.is_full() => {
                return Err(StateError::NoCapacity);
            }
            None => {}
        }
        let number = reg.event().number;
        inner.table.insert(reg);
        inner.table.remove_if_idle(number);
        Ok(())
    }
}

impl SdeiVcpu {
    /// Reads the event state of this vCPU.
    pub fn state(&self) -> VcpuState {
        let state = self.events.state.lock().unwrap();
        let lane = |run: &RunningEvent| RunningState {
            number: run.number,
            ctx: run.ctx,
        };
        VcpuState {
            masked: state.masked,
            critical: state.critical.as_ref().map(lane),
            normal: state.normal.as_ref().map(lane),
            pending: state.pending.iter().copied().collect(),
        }
    }

    /// Replaces the event state of this vCPU.
    ///
    /// Running instances must belong to registrations already present (see
    /// [`Sdei::set_registration`]), in the lane matching their priority, and
    /// pending events must be registered and enabled for this vCPU.
    pub fn set_state(&self, new: VcpuState) -> Result<(), StateError> {
        let id = self.id();
        let retired = {
            let inner = self.sdei.inner.lock().unwrap();

            let lanes = [
                (new.critical, EventPriority::Critical),
                (new.normal, EventPriority::Normal),
            ];
            for (run, prio) in lanes.iter() {
                let Some(run) = run else {
                    continue;
                };
                let reg = inner
                    .table
                    .get(run.number)
                    .ok_or(StateError::NotRegistered(run.number))?;
                if reg.event().priority != *prio {
                    return Err(StateError::WrongLane(run.number, *prio));
                }
                let index = index_for(reg.event().kind, id);
                if reg.index(index).is_none() {
                    return Err(StateError::BadIndex(run.number, index));
                }
            }
            for num in new.pending.iter().copied() {
                let reg = inner
                    .table
                    .get(num)
                    .ok_or(StateError::NotRegistered(num))?;
                if !reg.is_armed(index_for(reg.event().kind, id)) {
                    return Err(StateError::NotRegistered(num));
                }
            }

            let mut state = self.events.state.lock().unwrap();
            let retired = state.reset();
            for (run, prio) in lanes {
                let Some(run) = run else {
                    continue;
                };
                let Some(reg) = inner.table.get(run.number) else {
                    continue;
                };
                let index = index_for(reg.event().kind, id);
                *state.lane_mut(prio) = Some(RunningEvent {
                    number: run.number,
                    priority: prio,
                    ctx: run.ctx,
                    notifier: inner.registry.notifier(run.number),
                    guard: reg.acquire(index, self.sdei.this.clone()),
                });
            }
            state.masked = new.masked;
            state.pending = new.pending.into_iter().collect();
            if !state.masked && !state.pending.is_empty() {
                self.events.request_delivery(false);
            }
            retired
        };
        drop(retired);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use vsdei_types::EventDesc;

    fn registry() -> EventRegistry {
        EventRegistry::new(&[
            EventDesc::default_event(),
            EventDesc {
                number: 0x4040_0001,
                kind: EventKind::Shared,
                priority: EventPriority::Normal,
                signaled: true,
            },
        ])
        .unwrap()
    }

    fn record(index: u32, registered: bool, enabled: bool) -> IndexRecord {
        IndexRecord { index, entry: 0x1000, arg: 0x2000, registered, enabled }
    }

    fn state(number: u32, indexes: Vec<IndexRecord>) -> RegistrationState {
        RegistrationState {
            number,
            refcount: 0,
            route_mode: RouteMode::Pe,
            route_affinity: 1,
            indexes,
        }
    }

    #[test]
    fn build_validates_indexes() {
        let reg = registry();
        assert_eq!(
            build_registration(&reg, 4, state(0x4040_0002, vec![])).err(),
            Some(StateError::UndefinedEvent(0x4040_0002))
        );
        assert_eq!(
            build_registration(&reg, 4, state(0x4040_0000, vec![])).err(),
            Some(StateError::NotRegistered(0x4040_0000))
        );
        assert_eq!(
            build_registration(
                &reg,
                4,
                state(0x4040_0000, vec![record(4, true, false)])
            )
            .err(),
            Some(StateError::BadIndex(0x4040_0000, 4))
        );
        assert_eq!(
            build_registration(
                &reg,
                4,
                state(0x4040_0001, vec![record(1, true, false)])
            )
            .err(),
            Some(StateError::BadIndex(0x4040_0001, 1))
        );
        assert_eq!(
            build_registration(
                &reg,
                4,
                state(0x4040_0000, vec![record(0, false, true)])
            )
            .err(),
            Some(StateError::EnabledUnregistered(0x4040_0000, 0))
        );
    }

    #[test]
    fn build_round_trips() {
        let reg = registry();
        let shared = state(0x4040_0001, vec![record(0, true, true)]);
        let built = build_registration(&reg, 4, shared.clone()).unwrap();
        assert_eq!(RegistrationState::from(&built), shared);

        // routing is dropped for private events
        let mut private = state(
            0x4040_0000,
            vec![record(1, true, false), record(2, false, false)],
        );
        private.refcount = 1;
        let built = build_registration(&reg, 4, private).unwrap();
        assert_eq!(built.route(), (RouteMode::Any, 0));
        assert!(!built.index(1).unwrap().unregister_pending);
        assert!(built.index(2).unwrap().unregister_pending);
    }

    #[test]
    fn build_drops_settled_unregistrations() {
        let reg = registry();
        let private = state(
            0x4040_0000,
            vec![record(1, true, true), record(2, false, false)],
        );
        let built = build_registration(&reg, 4, private).unwrap();
        assert!(built.index(1).is_some());
        assert!(built.index(2).is_none());

        let gone = state(0x4040_0000, vec![record(2, false, false)]);
        let built = build_registration(&reg, 4, gone).unwrap();
        assert!(built.is_idle());
    }
}
