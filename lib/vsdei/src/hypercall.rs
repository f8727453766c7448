// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoding of guest SDEI calls.
//!
//! The function identifier is taken from x0 and arguments from x1-x5.
//! Results are returned in x0, with x1-x3 cleared.

use strum::FromRepr;
use vsdei_types::EventKind;

use crate::bits::*;
use crate::regs::GuestRegs;
use crate::status::SdeiStatus;
use crate::vcpu::SdeiVcpu;

#[usdt::provider(provider = "vsdei")]
mod probes {
    fn sdei_call(func: u32, arg1: u64, arg2: u64) {}
    fn sdei_call_ret(func: u32, ret: u64) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum Function {
    Version = SDEI_1_0_FN_SDEI_VERSION,
    EventRegister = SDEI_1_0_FN_SDEI_EVENT_REGISTER,
    EventEnable = SDEI_1_0_FN_SDEI_EVENT_ENABLE,
    EventDisable = SDEI_1_0_FN_SDEI_EVENT_DISABLE,
    EventContext = SDEI_1_0_FN_SDEI_EVENT_CONTEXT,
    EventComplete = SDEI_1_0_FN_SDEI_EVENT_COMPLETE,
    EventCompleteAndResume = SDEI_1_0_FN_SDEI_EVENT_COMPLETE_AND_RESUME,
    EventUnregister = SDEI_1_0_FN_SDEI_EVENT_UNREGISTER,
    EventStatus = SDEI_1_0_FN_SDEI_EVENT_STATUS,
    EventGetInfo = SDEI_1_0_FN_SDEI_EVENT_GET_INFO,
    EventRoutingSet = SDEI_1_0_FN_SDEI_EVENT_ROUTING_SET,
    PeMask = SDEI_1_0_FN_SDEI_PE_MASK,
    PeUnmask = SDEI_1_0_FN_SDEI_PE_UNMASK,
    InterruptBind = SDEI_1_0_FN_SDEI_INTERRUPT_BIND,
    InterruptRelease = SDEI_1_0_FN_SDEI_INTERRUPT_RELEASE,
    PrivateReset = SDEI_1_0_FN_SDEI_PRIVATE_RESET,
    SharedReset = SDEI_1_0_FN_SDEI_SHARED_RESET,
}

impl Function {
    /// Decodes the function identifier held in x0, if it names an SDEI call.
    ///
    /// Identifiers in the SDEI range which name no function yield
    /// `Some(None)`.
    pub fn decode(x0: u64) -> Option<Option<Self>> {
        let id = x0 as u32;
        if !(SDEI_1_0_FN_BASE..=SDEI_1_0_FN_LAST).contains(&id) {
            return None;
        }
        Some(Self::from_repr(id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HypercallOutcome {
    /// The call is not an SDEI call; registers are untouched.
    NotHandled,
    /// The call was handled and its results written back.
    Handled,
}

fn value_or_status(res: Result<u64, SdeiStatus>) -> u64 {
    res.unwrap_or_else(SdeiStatus::to_ret)
}

/// Executes the SDEI call described by `regs` on behalf of `vcpu`.
///
/// A vCPU without SDEI support (`None`) sees every SDEI call fail with
/// [`SdeiStatus::NotSupported`].
pub fn dispatch(
    vcpu: Option<&SdeiVcpu>,
    regs: &mut dyn GuestRegs,
) -> HypercallOutcome {
    let Some(func) = Function::decode(regs.reg(0)) else {
        return HypercallOutcome::NotHandled;
    };
    let fid = regs.reg(0) as u32;
    let args =
        [regs.reg(1), regs.reg(2), regs.reg(3), regs.reg(4), regs.reg(5)];
    probes::sdei_call!(|| (fid, args[0], args[1]));

    let ret = match (vcpu, func) {
        (None, _)
        | (_, None)
        | (_, Some(Function::InterruptBind))
        | (_, Some(Function::InterruptRelease)) => {
            Some(SdeiStatus::NotSupported.to_ret())
        }
        (Some(vcpu), Some(func)) => call(vcpu, func, &args, regs),
    };

    if let Some(ret) = ret {
        probes::sdei_call_ret!(|| (fid, ret));
        regs.set_reg(0, ret);
        for idx in 1..=3 {
            regs.set_reg(idx, 0);
        }
    }
    HypercallOutcome::Handled
}

fn call(
    vcpu: &SdeiVcpu,
    func: Function,
    args: &[u64; 5],
    regs: &mut dyn GuestRegs,
) -> Option<u64> {
    let [a1, a2, a3, a4, a5] = *args;
    let status = match func {
        Function::Version => return Some(vcpu.version()),
        Function::EventRegister => vcpu.register(a1, a2, a3, a4, a5),
        Function::EventEnable => vcpu.enable(a1, true),
        Function::EventDisable => vcpu.enable(a1, false),
        Function::EventContext => return Some(value_or_status(vcpu.context(a1))),
        Function::EventComplete | Function::EventCompleteAndResume => {
            let resume =
                (func == Function::EventCompleteAndResume).then_some(a1);
            // A successful completion has already rewritten the context the
            // guest returns to.
            return match vcpu.complete(regs, resume) {
                SdeiStatus::Success => None,
                err => Some(err.to_ret()),
            };
        }
        Function::EventUnregister => vcpu.unregister(a1),
        Function::EventStatus => return Some(value_or_status(vcpu.status(a1))),
        Function::EventGetInfo => {
            return Some(value_or_status(vcpu.get_info(a1, a2)))
        }
        Function::EventRoutingSet => vcpu.routing_set(a1, a2, a3),
        Function::PeMask => vcpu.pe_mask(true),
        Function::PeUnmask => vcpu.pe_mask(false),
        Function::PrivateReset => vcpu.reset_events(EventKind::Private),
        Function::SharedReset => vcpu.reset_events(EventKind::Shared),
        Function::InterruptBind | Function::InterruptRelease => {
            SdeiStatus::NotSupported
        }
    };
    Some(status.to_ret())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::regs::RegFile;

    #[test]
    fn decode_range() {
        assert_eq!(Function::decode(0xc400_0020), Some(Some(Function::Version)));
        assert_eq!(
            Function::decode(0xc400_0032),
            Some(Some(Function::SharedReset))
        );
        // gaps in the range are still SDEI calls
        assert_eq!(Function::decode(0xc400_002f), Some(None));
        assert_eq!(Function::decode(0xc400_001f), None);
        assert_eq!(Function::decode(0xc400_0033), None);
        assert_eq!(Function::decode(0x8400_0000), None);
    }

    #[test]
    fn unsupported_without_vcpu() {
        let mut regs = RegFile::default();
        regs.x[0] = SDEI_1_0_FN_SDEI_VERSION as u64;
        regs.x[1] = 0xdead;
        assert_eq!(dispatch(None, &mut regs), HypercallOutcome::Handled);
        assert_eq!(
            SdeiStatus::from_ret(regs.x[0]),
            Some(SdeiStatus::NotSupported)
        );
        assert_eq!(regs.x[1], 0);
    }

    #[test]
    fn foreign_call_untouched() {
        let mut regs = RegFile::default();
        regs.x[0] = 0x8400_0000;
        regs.x[1] = 0xdead;
        let before = regs.clone();
        assert_eq!(dispatch(None, &mut regs), HypercallOutcome::NotHandled);
        assert_eq!(regs, before);
    }
}
