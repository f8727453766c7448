// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by the vsdei crates.
//!
//! This crate defines the event-table description types used both by the
//! library (which builds a VM's event registry from them) and by the
//! configuration crate (which parses them from TOML), so that neither has to
//! depend on the other.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Number of the event every VM gets when no explicit table is supplied. It
/// is the event used for internal notifications such as asynchronous page
/// faults.
pub const DEFAULT_EVENT_NUM: u32 = 0x4040_0000;

/// Event numbers are 32 bits wide; the two bits at this shift select the
/// namespace the number belongs to.
pub const EVENT_NUM_TYPE_SHIFT: u32 = 22;
pub const EVENT_NUM_TYPE_MASK: u64 = 0b11;
pub const EVENT_NUM_TYPE_PHYS: u64 = 0;
pub const EVENT_NUM_TYPE_VIRT: u64 = 1;

/// Width of the per-event VCPU bitmaps in the kernel state layout.
pub const DEFAULT_MAX_VCPUS: u32 = 512;

/// Returns `true` if `num` is a well-formed event number in the virtual
/// namespace, i.e. one that a guest may legally name.
pub fn is_virtual_event(num: u64) -> bool {
    if num >> 32 != 0 {
        return false;
    }

    (num >> EVENT_NUM_TYPE_SHIFT) & EVENT_NUM_TYPE_MASK == EVENT_NUM_TYPE_VIRT
}

/// Whether an event has per-VCPU state or one machine-wide instance.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// One registration and run state per VCPU.
    Private,
    /// A single registration, optionally routed to a pinned VCPU.
    Shared,
}

impl EventKind {
    /// The value reported for the event type by `EVENT_GET_INFO`.
    pub fn info_value(self) -> u64 {
        match self {
            EventKind::Private => 0,
            EventKind::Shared => 1,
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Private => write!(f, "private"),
            EventKind::Shared => write!(f, "shared"),
        }
    }
}

/// Delivery priority of an event.
///
/// A critical event may preempt a running normal event; nothing preempts a
/// critical event, and a normal event never preempts another normal event.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Normal,
    Critical,
}

impl EventPriority {
    /// The value reported for the event priority by `EVENT_GET_INFO`.
    pub fn info_value(self) -> u64 {
        match self {
            EventPriority::Normal => 0,
            EventPriority::Critical => 1,
        }
    }
}

impl Display for EventPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventPriority::Normal => write!(f, "normal"),
            EventPriority::Critical => write!(f, "critical"),
        }
    }
}

/// Static description of one virtual event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDesc {
    pub number: u32,

    #[serde(rename = "type")]
    pub kind: EventKind,

    pub priority: EventPriority,

    /// Whether the event may be raised by an explicit signal, as opposed to
    /// only by an internal notifier.
    #[serde(default)]
    pub signaled: bool,
}

impl EventDesc {
    /// The event every VM is seeded with by default.
    pub const fn default_event() -> Self {
        Self {
            number: DEFAULT_EVENT_NUM,
            kind: EventKind::Private,
            priority: EventPriority::Critical,
            signaled: true,
        }
    }
}

/// Per-VM configuration of the SDEI emulation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdeiConfig {
    /// Vendor-defined bits reported in the low word of `SDEI_VERSION`.
    #[serde(default)]
    pub vendor: u32,

    /// Maximum number of live registration records for the VM.
    #[serde(default = "default_max_registrations")]
    pub max_registrations: usize,

    /// Maximum number of VCPUs the VM may create.
    #[serde(default = "default_max_vcpus")]
    pub max_vcpus: u32,

    /// The VM's event table.
    #[serde(default = "default_events", rename = "event")]
    pub events: Vec<EventDesc>,
}

fn default_max_registrations() -> usize {
    64
}

fn default_max_vcpus() -> u32 {
    DEFAULT_MAX_VCPUS
}

fn default_events() -> Vec<EventDesc> {
    vec![EventDesc::default_event()]
}

impl Default for SdeiConfig {
    fn default() -> Self {
        Self {
            vendor: 0,
            max_registrations: default_max_registrations(),
            max_vcpus: default_max_vcpus(),
            events: default_events(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_test::{assert_tokens, Token};

    #[test]
    fn virtual_event_numbers() {
        assert!(is_virtual_event(DEFAULT_EVENT_NUM as u64));
        assert!(is_virtual_event(0x0040_0001));

        // physical namespace
        assert!(!is_virtual_event(0));
        assert!(!is_virtual_event(0x4000_0000));
        // reserved namespaces
        assert!(!is_virtual_event(0x0080_0000));
        assert!(!is_virtual_event(0x00c0_0000));
        // wider than 32 bits
        assert!(!is_virtual_event(0x1_0040_0000));
    }

    #[test]
    fn event_kind_tokens() {
        assert_tokens(
            &EventKind::Private,
            &[Token::UnitVariant { name: "EventKind", variant: "private" }],
        );
        assert_tokens(
            &EventPriority::Critical,
            &[Token::UnitVariant {
                name: "EventPriority",
                variant: "critical",
            }],
        );
    }

    #[test]
    fn config_defaults_fill_in() {
        let cfg: SdeiConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, SdeiConfig::default());
        assert_eq!(cfg.events, vec![EventDesc::default_event()]);
    }

    #[test]
    fn event_desc_uses_type_key() {
        let raw = r#"{"number": 4194305, "type": "shared",
                      "priority": "normal"}"#;
        let desc: EventDesc = serde_json::from_str(raw).unwrap();
        assert_eq!(desc.number, 0x0040_0001);
        assert_eq!(desc.kind, EventKind::Shared);
        assert_eq!(desc.priority, EventPriority::Normal);
        assert!(!desc.signaled);
    }
}
