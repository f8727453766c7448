// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-vCPU event state and the delivery engine.
//!
//! Every vCPU has a mask, a set of pending event numbers, and two lanes of
//! in-flight events: one for critical events and one for normal ones. A
//! critical event may interrupt the handler of a normal event, but nothing
//! interrupts a critical handler and a normal handler is never interrupted by
//! another normal event.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use slog::{debug, Logger};
use vsdei_types::{EventKind, EventPriority};

use crate::bits::*;
use crate::common::{Lifecycle, VcpuId};
use crate::hypercall::{self, HypercallOutcome};
use crate::migrate::{
    MigrateSingle, MigrateStateError, Migrator, PayloadOffer, PayloadOutput,
};
use crate::notifier::{NotifyFn, NotifyPhase};
use crate::registration::{index_for, RunGuard};
use crate::regs::{EventContext, GuestRegs};
use crate::status::SdeiStatus;
use crate::vm::Sdei;

#[usdt::provider(provider = "vsdei")]
mod probes {
    fn sdei_deliver(vcpu: u32, num: u32, critical: bool, entry: u64) {}
    fn sdei_complete(vcpu: u32, num: u32, resume: bool) {}
}

const TYPE_NAME: &str = "sdei-vcpu";

/// Callback forcing a vCPU out of guest context so it can service a
/// delivery request.
pub type KickFn = dyn Fn() + Send + Sync + 'static;

/// An event instance occupying one of a vCPU's lanes.
pub(crate) struct RunningEvent {
    pub(crate) number: u32,
    pub(crate) priority: EventPriority,
    pub(crate) ctx: EventContext,
    pub(crate) notifier: Option<Arc<NotifyFn>>,
    pub(crate) guard: RunGuard,
}

pub(crate) struct VcpuEventState {
    pub(crate) masked: bool,
    pub(crate) critical: Option<RunningEvent>,
    pub(crate) normal: Option<RunningEvent>,
    pub(crate) pending: BTreeSet<u32>,
}

impl Default for VcpuEventState {
    fn default() -> Self {
        Self {
            masked: true,
            critical: None,
            normal: None,
            pending: BTreeSet::new(),
        }
    }
}

impl VcpuEventState {
    pub(crate) fn lane_mut(
        &mut self,
        prio: EventPriority,
    ) -> &mut Option<RunningEvent> {
        match prio {
            EventPriority::Critical => &mut self.critical,
            EventPriority::Normal => &mut self.normal,
        }
    }

    pub(crate) fn is_running(&self, number: u32) -> bool {
        [&self.critical, &self.normal]
            .into_iter()
            .flatten()
            .any(|run| run.number == number)
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.critical.is_some() || self.normal.is_some()
    }

    /// Anything pending or running.
    pub(crate) fn has_work(&self) -> bool {
        self.is_busy() || !self.pending.is_empty()
    }

    /// The innermost in-flight event: the critical lane when occupied.
    fn active(&self) -> Option<&RunningEvent> {
        self.critical.as_ref().or(self.normal.as_ref())
    }

    fn take_active(&mut self) -> Option<RunningEvent> {
        self.critical.take().or_else(|| self.normal.take())
    }

    /// Picks the next pending event to deliver, if any may be delivered now.
    ///
    /// `prio_of` yields the priority of a pending event which is still armed
    /// for this vCPU; pending entries for which it yields `None` are dropped.
    fn select(
        &mut self,
        prio_of: impl Fn(u32) -> Option<EventPriority>,
    ) -> Option<(u32, EventPriority)> {
        if self.masked || self.critical.is_some() {
            return None;
        }
        self.pending.retain(|num| prio_of(*num).is_some());

        let mut first_normal = None;
        for num in self.pending.iter().copied() {
            match prio_of(num) {
                Some(EventPriority::Critical) => {
                    return Some((num, EventPriority::Critical));
                }
                Some(EventPriority::Normal) if first_normal.is_none() => {
                    first_normal = Some(num);
                }
                _ => {}
            }
        }
        if self.normal.is_some() {
            return None;
        }
        first_normal.map(|num| (num, EventPriority::Normal))
    }

    /// Masks the vCPU and clears all pending and running state, returning the
    /// instances which were in flight so the caller can retire them once no
    /// locks are held.
    pub(crate) fn reset(&mut self) -> Vec<RunningEvent> {
        self.masked = true;
        self.pending.clear();
        [self.critical.take(), self.normal.take()]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Event state of one vCPU, as shared between the vCPU and its VM.
pub(crate) struct VcpuEvents {
    pub(crate) id: VcpuId,
    pub(crate) state: Mutex<VcpuEventState>,
    request: AtomicBool,
    kick: Option<Box<KickFn>>,
}

impl VcpuEvents {
    pub(crate) fn new(id: VcpuId, kick: Option<Box<KickFn>>) -> Self {
        Self {
            id,
            state: Mutex::new(VcpuEventState::default()),
            request: AtomicBool::new(false),
            kick,
        }
    }

    /// Flags that delivery should be attempted on the vCPU's next entry,
    /// kicking it out of guest context if `kick` is set.
    ///
    /// Must not be called with the vCPU's state lock held when kicking.
    pub(crate) fn request_delivery(&self, kick: bool) {
        self.request.store(true, Ordering::Release);
        if kick {
            if let Some(kick) = self.kick.as_ref() {
                kick();
            }
        }
    }

    fn take_request(&self) -> bool {
        self.request.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn reset(&self) -> Vec<RunningEvent> {
        let retired = self.state.lock().unwrap().reset();
        self.request.store(false, Ordering::Release);
        retired
    }
}

/// Handle through which a vCPU makes SDEI calls and takes event deliveries.
///
/// Dropping the handle detaches the vCPU from its VM.
pub struct SdeiVcpu {
    pub(crate) sdei: Arc<Sdei>,
    pub(crate) events: Arc<VcpuEvents>,
    log: Logger,
    destroyed: AtomicBool,
}

impl SdeiVcpu {
    pub(crate) fn new(sdei: Arc<Sdei>, events: Arc<VcpuEvents>) -> Self {
        let log = sdei.log.new(slog::o!("vcpu" => u32::from(events.id)));
        Self { sdei, events, log, destroyed: AtomicBool::new(false) }
    }

    pub fn id(&self) -> VcpuId {
        self.events.id
    }

    pub fn sdei(&self) -> &Arc<Sdei> {
        &self.sdei
    }

    /// Whether a delivery request is outstanding for this vCPU.
    pub fn delivery_requested(&self) -> bool {
        self.events.request.load(Ordering::Acquire)
    }

    /// Handles an SDEI call made by the guest on this vCPU.
    pub fn hypercall(&self, regs: &mut dyn GuestRegs) -> HypercallOutcome {
        hypercall::dispatch(Some(self), regs)
    }

    pub fn version(&self) -> u64 {
        self.sdei.version()
    }

    pub fn register(
        &self,
        num: u64,
        entry: u64,
        arg: u64,
        route_mode: u64,
        affinity: u64,
    ) -> SdeiStatus {
        self.sdei.register(self.id(), num, entry, arg, route_mode, affinity)
    }

    /// Enables (or disables) `num` for this vCPU.
    ///
    /// Disabling an event with an instance in flight succeeds with
    /// [`SdeiStatus::Pending`]: the instance runs to completion, but no
    /// further instances are delivered.
    pub fn enable(&self, num: u64, enable: bool) -> SdeiStatus {
        self.sdei.enable(self.id(), num, enable)
    }

    pub fn unregister(&self, num: u64) -> SdeiStatus {
        self.sdei.unregister(self.id(), num)
    }

    pub fn status(&self, num: u64) -> Result<u64, SdeiStatus> {
        self.sdei.status(&self.events, num)
    }

    pub fn get_info(&self, num: u64, field: u64) -> Result<u64, SdeiStatus> {
        self.sdei.get_info(num, field)
    }

    pub fn routing_set(
        &self,
        num: u64,
        route_mode: u64,
        affinity: u64,
    ) -> SdeiStatus {
        self.sdei.routing_set(num, route_mode, affinity)
    }

    /// Unregisters all events of `kind`.
    pub fn reset_events(&self, kind: EventKind) -> SdeiStatus {
        self.sdei.reset_events(kind)
    }

    /// Reads preserved register `idx` of the interrupted context of the
    /// innermost running event.
    pub fn context(&self, idx: u64) -> Result<u64, SdeiStatus> {
        let idx = usize::try_from(idx)
            .ok()
            .filter(|idx| *idx < SDEI_CONTEXT_REGS)
            .ok_or(SdeiStatus::InvalidParameters)?;
        let state = self.events.state.lock().unwrap();
        let run = state.active().ok_or(SdeiStatus::Denied)?;
        Ok(run.ctx.regs[idx])
    }

    /// Masks (or unmasks) event delivery on this vCPU.
    pub fn pe_mask(&self, mask: bool) -> SdeiStatus {
        let mut state = self.events.state.lock().unwrap();
        if state.masked == mask {
            return SdeiStatus::Denied;
        }
        state.masked = mask;
        if !mask && !state.pending.is_empty() {
            // Serviced before the vCPU re-enters the guest.
            self.events.request_delivery(false);
        }
        SdeiStatus::Success
    }

    pub fn is_masked(&self) -> bool {
        self.events.state.lock().unwrap().masked
    }

    /// Consumes an outstanding delivery request, delivering the next
    /// eligible event into `regs` if there is one.
    ///
    /// Intended to be called by the vCPU run loop before each guest entry.
    pub fn run_pending(&self, regs: &mut dyn GuestRegs) -> bool {
        if !self.events.take_request() {
            return false;
        }
        self.deliver(regs)
    }

    /// Delivers the next eligible pending event into `regs`.
    ///
    /// Returns `true` if an event handler was entered.
    pub fn deliver(&self, regs: &mut dyn GuestRegs) -> bool {
        let id = self.id();
        let (number, entry, arg, priority, notifier) = {
            let inner = self.sdei.inner.lock().unwrap();
            let mut state = self.events.state.lock().unwrap();

            let selected = state.select(|num| {
                let reg = inner.table.get(num)?;
                let index = index_for(reg.event().kind, id);
                reg.is_armed(index).then_some(reg.event().priority)
            });
            let Some((number, priority)) = selected else {
                return false;
            };
            let Some(reg) = inner.table.get(number) else {
                return false;
            };
            let index = index_for(reg.event().kind, id);
            let Some(st) = reg.index(index).copied() else {
                return false;
            };

            state.pending.remove(&number);
            let notifier = inner.registry.notifier(number);
            *state.lane_mut(priority) = Some(RunningEvent {
                number,
                priority,
                ctx: EventContext::capture(regs),
                notifier: notifier.clone(),
                guard: reg.acquire(index, self.sdei.this.clone()),
            });
            (number, st.entry, st.arg, priority, notifier)
        };

        let (pc, pstate) = (regs.pc(), regs.pstate());
        for idx in 0..SDEI_CONTEXT_REGS {
            regs.set_reg(idx, 0);
        }
        regs.set_reg(0, number as u64);
        regs.set_reg(1, arg);
        regs.set_reg(2, pc);
        regs.set_reg(3, pstate);
        regs.set_pc(entry);
        regs.set_pstate(SDEI_HANDLER_PSTATE);

        probes::sdei_deliver!(|| (
            u32::from(id),
            number,
            priority == EventPriority::Critical,
            entry
        ));
        if let Some(notify) = notifier {
            notify(id, number, NotifyPhase::Delivered);
        }
        true
    }

    /// Completes the innermost running event, restoring the context it
    /// interrupted.
    ///
    /// With `resume_addr` set, the interrupted PC and PSTATE are placed in
    /// ELR_EL1/SPSR_EL1 and execution continues at `resume_addr` in the
    /// handler entry mode, as if an exception had been taken there.
    pub fn complete(
        &self,
        regs: &mut dyn GuestRegs,
        resume_addr: Option<u64>,
    ) -> SdeiStatus {
        let done = {
            let mut state = self.events.state.lock().unwrap();
            let Some(done) = state.take_active() else {
                debug!(self.log, "complete with no event running");
                return SdeiStatus::Denied;
            };
            if !state.masked && !state.pending.is_empty() {
                self.events.request_delivery(false);
            }
            done
        };

        done.ctx.restore_gprs(regs);
        match resume_addr {
            Some(addr) => {
                regs.set_elr_el1(done.ctx.pc);
                regs.set_spsr_el1(done.ctx.pstate);
                regs.set_pc(addr);
                regs.set_pstate(SDEI_HANDLER_PSTATE);
            }
            None => {
                regs.set_pc(done.ctx.pc);
                regs.set_pstate(done.ctx.pstate);
            }
        }

        let RunningEvent { number, notifier, guard, .. } = done;
        drop(guard);
        probes::sdei_complete!(|| (
            u32::from(self.id()),
            number,
            resume_addr.is_some()
        ));
        if let Some(notify) = notifier {
            notify(self.id(), number, NotifyPhase::Completed);
        }
        SdeiStatus::Success
    }

    /// Detaches the vCPU from its VM, retiring anything it had in flight.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sdei.detach_vcpu(self.id());
        let retired = self.events.reset();
        if !retired.is_empty() {
            debug!(
                self.log,
                "retiring in-flight events on destroy";
                "count" => retired.len(),
            );
        }
    }
}

impl Drop for SdeiVcpu {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Lifecycle for SdeiVcpu {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn reset(&self) {
        drop(self.events.reset());
    }

    fn migrate(&'_ self) -> Migrator<'_> {
        Migrator::Single(self)
    }
}

impl MigrateSingle for SdeiVcpu {
    fn export(&self) -> Result<PayloadOutput, MigrateStateError> {
        Ok(migrate::SdeiVcpuV1::from(self.state()).into())
    }

    fn import(&self, mut offer: PayloadOffer) -> Result<(), MigrateStateError> {
        let data: migrate::SdeiVcpuV1 = offer.parse()?;
        self.set_state(data.into())
            .map_err(|e| MigrateStateError::ImportFailed(e.to_string()))
    }
}

pub(crate) mod migrate {
    use serde::{Deserialize, Serialize};

    use crate::mgmt::{RunningState, VcpuState};
    use crate::migrate::{Schema, SchemaId};
    use crate::regs::EventContext;

    #[derive(Debug, Serialize, Deserialize)]
    pub struct LaneV1 {
        pub number: u32,
        pub ctx: EventContext,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct SdeiVcpuV1 {
        pub masked: bool,
        pub critical: Option<LaneV1>,
        pub normal: Option<LaneV1>,
        pub pending: Vec<u32>,
    }

    impl From<VcpuState> for SdeiVcpuV1 {
        fn from(st: VcpuState) -> Self {
            let lane = |run: RunningState| LaneV1 {
                number: run.number,
                ctx: run.ctx,
            };
            Self {
                masked: st.masked,
                critical: st.critical.map(lane),
                normal: st.normal.map(lane),
                pending: st.pending,
            }
        }
    }

    impl From<SdeiVcpuV1> for VcpuState {
        fn from(v1: SdeiVcpuV1) -> Self {
            let lane =
                |l: LaneV1| RunningState { number: l.number, ctx: l.ctx };
            Self {
                masked: v1.masked,
                critical: v1.critical.map(lane),
                normal: v1.normal.map(lane),
                pending: v1.pending,
            }
        }
    }

    impl Schema<'_> for SdeiVcpuV1 {
        fn id() -> SchemaId {
            (super::TYPE_NAME, 1)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn prio_table(num: u32) -> Option<EventPriority> {
        match num {
            1 | 2 => Some(EventPriority::Normal),
            10 | 11 => Some(EventPriority::Critical),
            _ => None,
        }
    }

    #[test]
    fn select_prefers_lowest_critical() {
        let mut st = VcpuEventState { masked: false, ..Default::default() };
        st.pending.extend([2, 11, 10, 1]);
        assert_eq!(st.select(prio_table), Some((10, EventPriority::Critical)));
    }

    #[test]
    fn select_prunes_stale() {
        let mut st = VcpuEventState { masked: false, ..Default::default() };
        st.pending.extend([5, 2]);
        assert_eq!(st.select(prio_table), Some((2, EventPriority::Normal)));
        assert!(!st.pending.contains(&5));
    }

    #[test]
    fn masked_selects_nothing() {
        let mut st = VcpuEventState::default();
        assert!(st.masked);
        st.pending.extend([10, 1]);
        assert_eq!(st.select(prio_table), None);
        assert_eq!(st.pending.len(), 2);
    }
}
