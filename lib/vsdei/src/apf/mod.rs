// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous page faults, delivered through SDEI.
//!
//! When a guest access faults on memory the host must first page in, the
//! host may instead tell the guest that the page is not present, letting it
//! schedule other work. The notification is an SDEI event (injected for
//! immediate delivery) carrying a token in a record shared with the guest.
//! Once the page is available, the host either withdraws the notification,
//! if the guest has not seen it yet, or reports the page ready through an
//! interrupt, which the guest acknowledges with a hypercall.
//!
//! Tracking of the faults themselves, and the work that resolves them, is
//! left to the embedding VMM, which calls into [`ApfVcpu`] at each step.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use slog::{debug, info, warn, Logger};
use thiserror::Error;

use crate::common::{GuestAddr, GuestMemory, Lifecycle, VcpuId};
use crate::hypercall::HypercallOutcome;
use crate::intr_pins::IntrPin;
use crate::migrate::{
    MigrateSingle, MigrateStateError, Migrator, PayloadOffer, PayloadOutput,
};
use crate::notifier::{NotifyFn, NotifyPhase};
use crate::regs::GuestRegs;
use crate::vm::Sdei;

pub mod bits;

use bits::*;

#[usdt::provider(provider = "vsdei")]
mod probes {
    fn apf_not_present(vcpu: u32, token: u32, injected: bool) {}
    fn apf_page_present(vcpu: u32, token: u32, cancelled: bool) {}
    fn apf_irq_ack(vcpu: u32) {}
}

const TYPE_NAME: &str = "sdei-apf";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApfError {
    #[error("vCPU {0} is already attached")]
    AlreadyExists(VcpuId),

    #[error("control update failed with status {0}")]
    Control(i64),
}

#[derive(Default)]
struct Control {
    sdei_event: u32,
    irq: u32,
    pin: Option<Arc<dyn IntrPin>>,
    control_block: u64,
    send_user_only: bool,
    notpresent_pending: bool,
    notpresent_token: u32,
    pageready_pending: bool,
    seq: u32,
}

impl Control {
    fn flags(&self) -> ApfControl {
        ApfControl::from_bits_truncate(self.control_block)
    }

    fn enabled(&self) -> bool {
        self.flags().contains(ApfControl::ENABLED)
    }

    fn record(&self) -> GuestAddr {
        GuestAddr(self.control_block & APF_RECORD_ADDR_MASK)
    }
}

/// Asynchronous page fault state of a VM.
pub struct AsyncPf {
    log: Logger,
    sdei: Arc<Sdei>,
    mem: Arc<dyn GuestMemory>,
    vcpus: Mutex<BTreeMap<VcpuId, Weak<Mutex<Control>>>>,
    this: Weak<AsyncPf>,
}

impl AsyncPf {
    pub fn new(
        log: &Logger,
        sdei: Arc<Sdei>,
        mem: Arc<dyn GuestMemory>,
    ) -> Arc<Self> {
        let log = log.new(slog::o!("component" => TYPE_NAME));
        Arc::new_cyclic(|this| Self {
            log,
            sdei,
            mem,
            vcpus: Mutex::new(BTreeMap::new()),
            this: this.clone(),
        })
    }

    pub fn version(&self) -> u32 {
        APF_VERSION
    }

    pub fn create_vcpu(
        self: &Arc<Self>,
        id: VcpuId,
    ) -> Result<ApfVcpu, ApfError> {
        let mut vcpus = self.vcpus.lock().unwrap();
        if vcpus.get(&id).and_then(Weak::upgrade).is_some() {
            return Err(ApfError::AlreadyExists(id));
        }
        let ctl = Arc::new(Mutex::new(Control::default()));
        vcpus.insert(id, Arc::downgrade(&ctl));
        Ok(ApfVcpu { apf: self.clone(), id, ctl })
    }

    fn notifier(&self) -> Arc<NotifyFn> {
        let this = self.this.clone();
        Arc::new(move |vcpu, num, phase| {
            if let Some(apf) = this.upgrade() {
                apf.handle_sdei(vcpu, num, phase);
            }
        })
    }

    fn handle_sdei(&self, vcpu: VcpuId, num: u32, phase: NotifyPhase) {
        let ctl =
            self.vcpus.lock().unwrap().get(&vcpu).and_then(Weak::upgrade);
        let Some(ctl) = ctl else {
            return;
        };
        let mut ctl = ctl.lock().unwrap();
        if num != ctl.sdei_event {
            warn!(
                self.log,
                "notification for unexpected event";
                "vcpu" => u32::from(vcpu),
                "event" => num,
                "expected" => ctl.sdei_event,
            );
            return;
        }
        if phase == NotifyPhase::Delivered && ctl.notpresent_pending {
            ctl.notpresent_pending = false;
            ctl.notpresent_token = 0;
        }
    }

    fn read_record(&self, ctl: &Control) -> Option<(u32, u32)> {
        let base = ctl.record();
        let reason = self.mem.read_u32(base + APF_RECORD_REASON)?;
        let token = self.mem.read_u32(base + APF_RECORD_TOKEN)?;
        Some((reason, token))
    }

    fn write_record(&self, ctl: &Control, reason: u32, token: u32) -> bool {
        let base = ctl.record();
        // The token must be visible before the reason which announces it.
        self.mem.write_u32(base + APF_RECORD_TOKEN, token)
            && self.mem.write_u32(base + APF_RECORD_REASON, reason)
    }

    fn clear_record(&self, ctl: &Control) {
        let base = ctl.record();
        self.mem.write_u32(base + APF_RECORD_REASON, 0);
        self.mem.write_u32(base + APF_RECORD_TOKEN, 0);
    }

    fn enable(&self, id: VcpuId, ctl: &mut Control, data: u64) -> i64 {
        let flags = ApfControl::from_bits_truncate(data);
        let enabled = ctl.enabled();
        let enable = flags.contains(ApfControl::ENABLED);
        if enable == enabled {
            debug!(
                self.log,
                "async page faults already in requested state";
                "vcpu" => u32::from(id),
                "enabled" => enabled,
            );
            return SMCCC_RET_NOT_REQUIRED;
        }

        if !enable {
            ctl.control_block = data;
            return SMCCC_RET_SUCCESS;
        }

        if ctl.sdei_event == 0 || ctl.irq == 0 || ctl.pin.is_none() {
            warn!(
                self.log,
                "enable without SDEI event or IRQ configured";
                "vcpu" => u32::from(id),
                "event" => ctl.sdei_event,
                "irq" => ctl.irq,
            );
            return SMCCC_RET_INVALID_PARAMETER;
        }
        if let Err(e) =
            self.sdei.register_notifier(ctl.sdei_event, self.notifier())
        {
            warn!(self.log, "failed to attach notifier"; "error" => %e);
            return SMCCC_RET_NOT_SUPPORTED;
        }
        let record = GuestAddr(data & APF_RECORD_ADDR_MASK);
        if self.mem.read_u32(record + APF_RECORD_TOKEN).is_none() {
            warn!(
                self.log,
                "shared record outside guest memory";
                "vcpu" => u32::from(id),
                "gpa" => record.0,
            );
            return SMCCC_RET_NOT_SUPPORTED;
        }

        ctl.send_user_only = !flags.contains(ApfControl::SEND_ALWAYS);
        ctl.control_block = data;
        info!(
            self.log,
            "async page faults enabled";
            "vcpu" => u32::from(id),
            "gpa" => record.0,
            "send_user_only" => ctl.send_user_only,
        );
        SMCCC_RET_SUCCESS
    }
}

/// Asynchronous page fault state of one vCPU.
pub struct ApfVcpu {
    apf: Arc<AsyncPf>,
    id: VcpuId,
    ctl: Arc<Mutex<Control>>,
}

impl ApfVcpu {
    pub fn id(&self) -> VcpuId {
        self.id
    }

    pub fn set_sdei_event(&self, num: u32) {
        self.ctl.lock().unwrap().sdei_event = num;
    }

    pub fn sdei_event(&self) -> u32 {
        self.ctl.lock().unwrap().sdei_event
    }

    /// Sets the interrupt used to signal page-ready, and the pin raising it.
    pub fn set_irq(&self, irq: u32, pin: Arc<dyn IntrPin>) {
        let mut ctl = self.ctl.lock().unwrap();
        ctl.irq = irq;
        ctl.pin = Some(pin);
    }

    pub fn irq(&self) -> u32 {
        self.ctl.lock().unwrap().irq
    }

    pub fn control(&self) -> u64 {
        self.ctl.lock().unwrap().control_block
    }

    /// Applies a control word, as the guest would through the enable call.
    pub fn set_control(&self, data: u64) -> Result<(), ApfError> {
        let mut ctl = self.ctl.lock().unwrap();
        match self.apf.enable(self.id, &mut ctl, data) {
            SMCCC_RET_SUCCESS => Ok(()),
            err => Err(ApfError::Control(err)),
        }
    }

    /// Whether a not-present notification may be sent now.
    ///
    /// `privileged` reports whether the faulting access was made by the
    /// guest kernel.
    pub fn not_present_allowed(&self, privileged: bool) -> bool {
        let ctl = self.ctl.lock().unwrap();
        if !ctl.enabled() {
            return false;
        }
        if ctl.send_user_only && privileged {
            return false;
        }
        // Delivery must land in the guest's normal context.
        if self.apf.sdei.vcpu_running(self.id) != Some(false) {
            return false;
        }
        // The guest has not yet consumed the previous notification.
        matches!(self.apf.read_record(&ctl), Some((0, 0)))
    }

    /// Allocates the token identifying a new outstanding fault.
    pub fn next_token(&self) -> u32 {
        let mut ctl = self.ctl.lock().unwrap();
        let token = (ctl.seq << APF_TOKEN_SEQ_SHIFT) | u32::from(self.id);
        ctl.seq = ctl.seq.wrapping_add(1);
        token
    }

    /// Notifies the guest that the page for `token` is not present.
    ///
    /// Returns `true` if the notification was raised.
    pub fn page_not_present(&self, token: u32) -> bool {
        let mut ctl = self.ctl.lock().unwrap();
        let apf = &self.apf;
        if !apf.write_record(&ctl, APF_REASON_PAGE_NOT_PRESENT, token) {
            warn!(
                apf.log,
                "failed to write not-present record";
                "vcpu" => u32::from(self.id),
                "token" => token,
            );
            apf.clear_record(&ctl);
            return false;
        }

        ctl.notpresent_pending = true;
        ctl.notpresent_token = token;
        let injected = match apf.sdei.inject(self.id, ctl.sdei_event, true) {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    apf.log,
                    "not-present injection refused";
                    "vcpu" => u32::from(self.id),
                    "error" => %e,
                );
                ctl.notpresent_pending = false;
                ctl.notpresent_token = 0;
                apf.clear_record(&ctl);
                false
            }
        };
        probes::apf_not_present!(|| (u32::from(self.id), token, injected));
        injected
    }

    /// Whether the page-ready notification for `token` may be sent now.
    pub fn page_present_allowed(&self, token: u32) -> bool {
        let ctl = self.ctl.lock().unwrap();
        if !ctl.enabled() {
            return true;
        }
        if ctl.pageready_pending {
            return false;
        }
        let Some((reason, rec_token)) = self.apf.read_record(&ctl) else {
            return false;
        };
        // A not-present notification for the same fault which has not been
        // delivered yet can simply be withdrawn.
        if ctl.notpresent_pending
            && reason == APF_REASON_PAGE_NOT_PRESENT
            && token == ctl.notpresent_token
            && rec_token == ctl.notpresent_token
        {
            return true;
        }
        reason == 0 && rec_token == 0
    }

    /// Reports that the page for `token` is now present.
    pub fn page_present(&self, token: u32) {
        let mut ctl = self.ctl.lock().unwrap();
        let apf = &self.apf;

        if ctl.notpresent_pending
            && ctl.notpresent_token == token
            && apf.sdei.cancel(self.id, ctl.sdei_event).is_ok()
        {
            ctl.notpresent_pending = false;
            ctl.notpresent_token = 0;
            apf.clear_record(&ctl);
            probes::apf_page_present!(|| (u32::from(self.id), token, true));
            return;
        }

        if !apf.write_record(&ctl, APF_REASON_PAGE_READY, token) {
            warn!(
                apf.log,
                "failed to write page-ready record";
                "vcpu" => u32::from(self.id),
                "token" => token,
            );
            apf.clear_record(&ctl);
            return;
        }
        ctl.pageready_pending = true;
        if let Some(pin) = ctl.pin.as_ref() {
            pin.assert();
        }
        probes::apf_page_present!(|| (u32::from(self.id), token, false));
    }

    /// The guest has consumed the page-ready notification.
    pub fn irq_ack(&self) {
        let mut ctl = self.ctl.lock().unwrap();
        if !ctl.pageready_pending {
            return;
        }
        if let Some(pin) = ctl.pin.as_ref() {
            pin.deassert();
        }
        ctl.pageready_pending = false;
        probes::apf_irq_ack!(|| u32::from(self.id));
    }

    /// Handles the asynchronous page fault vendor call, if `regs` holds one.
    ///
    /// The sub-function is taken from x1. The status is returned in x0 and
    /// any value in x1.
    pub fn hypercall(&self, regs: &mut dyn GuestRegs) -> HypercallOutcome {
        if regs.reg(0) as u32 != ARM_SMCCC_VENDOR_HYP_APF_FUNC_ID {
            return HypercallOutcome::NotHandled;
        }

        let (ret, val) = match regs.reg(1) as u32 {
            APF_FUNC_VERSION => (SMCCC_RET_SUCCESS, APF_VERSION as u64),
            APF_FUNC_SLOTS => (SMCCC_RET_SUCCESS, APF_SLOTS),
            APF_FUNC_SDEI => (SMCCC_RET_SUCCESS, self.sdei_event() as u64),
            APF_FUNC_IRQ => (SMCCC_RET_SUCCESS, self.irq() as u64),
            APF_FUNC_ENABLE => {
                let data = (regs.reg(3) << 32) | (regs.reg(2) & 0xffff_ffff);
                let mut ctl = self.ctl.lock().unwrap();
                (self.apf.enable(self.id, &mut ctl, data), 0)
            }
            APF_FUNC_IRQ_ACK => {
                self.irq_ack();
                (SMCCC_RET_SUCCESS, 0)
            }
            _ => (SMCCC_RET_NOT_SUPPORTED, 0),
        };

        regs.set_reg(0, ret as u64);
        regs.set_reg(1, val);
        regs.set_reg(2, 0);
        regs.set_reg(3, 0);
        HypercallOutcome::Handled
    }
}

impl Drop for ApfVcpu {
    fn drop(&mut self) {
        let mut vcpus = self.apf.vcpus.lock().unwrap();
        let ours = vcpus
            .get(&self.id)
            .map_or(false, |w| w.as_ptr() == Arc::as_ptr(&self.ctl));
        if ours {
            vcpus.remove(&self.id);
        }
    }
}

impl Lifecycle for ApfVcpu {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    /// Disables asynchronous page faults, keeping the host-configured event
    /// and interrupt.
    fn reset(&self) {
        let mut ctl = self.ctl.lock().unwrap();
        if ctl.pageready_pending {
            if let Some(pin) = ctl.pin.as_ref() {
                pin.deassert();
            }
        }
        ctl.control_block = 0;
        ctl.send_user_only = false;
        ctl.notpresent_pending = false;
        ctl.notpresent_token = 0;
        ctl.pageready_pending = false;
        ctl.seq = 0;
    }

    fn migrate(&'_ self) -> Migrator<'_> {
        Migrator::Single(self)
    }
}

impl MigrateSingle for ApfVcpu {
    fn export(&self) -> Result<PayloadOutput, MigrateStateError> {
        let ctl = self.ctl.lock().unwrap();
        Ok(migrate::ApfVcpuV1 {
            sdei_event: ctl.sdei_event,
            irq: ctl.irq,
            control_block: ctl.control_block,
            send_user_only: ctl.send_user_only,
            notpresent_pending: ctl.notpresent_pending,
            notpresent_token: ctl.notpresent_token,
            pageready_pending: ctl.pageready_pending,
            seq: ctl.seq,
        }
        .into())
    }

    fn import(&self, mut offer: PayloadOffer) -> Result<(), MigrateStateError> {
        let data: migrate::ApfVcpuV1 = offer.parse()?;
        let mut ctl = self.ctl.lock().unwrap();

        if ApfControl::from_bits_truncate(data.control_block)
            .contains(ApfControl::ENABLED)
        {
            if ctl.pin.is_none() {
                return Err(MigrateStateError::ImportFailed(
                    "no interrupt pin configured".to_string(),
                ));
            }
            self.apf
                .sdei
                .register_notifier(data.sdei_event, self.apf.notifier())
                .map_err(|e| MigrateStateError::ImportFailed(e.to_string()))?;
        }

        ctl.sdei_event = data.sdei_event;
        ctl.irq = data.irq;
        ctl.control_block = data.control_block;
        ctl.send_user_only = data.send_user_only;
        ctl.notpresent_pending = data.notpresent_pending;
        ctl.notpresent_token = data.notpresent_token;
        ctl.pageready_pending = data.pageready_pending;
        ctl.seq = data.seq;
        if let Some(pin) = ctl.pin.as_ref() {
            if data.pageready_pending {
                pin.assert();
            } else {
                pin.deassert();
            }
        }
        Ok(())
    }
}

pub mod migrate {
    use serde::{Deserialize, Serialize};

    use crate::migrate::{Schema, SchemaId};

    #[derive(Debug, Serialize, Deserialize)]
    pub struct ApfVcpuV1 {
        pub sdei_event: u32,
        pub irq: u32,
        pub control_block: u64,
        pub send_user_only: bool,
        pub notpresent_pending: bool,
        pub notpresent_token: u32,
        pub pageready_pending: bool,
        pub seq: u32,
    }

    impl Schema<'_> for ApfVcpuV1 {
        fn id() -> SchemaId {
            (super::TYPE_NAME, 1)
        }
    }
}
