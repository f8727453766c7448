// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The catalog of virtual events known to a VM.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use vsdei_types::{is_virtual_event, EventDesc};

use crate::notifier::NotifyFn;

/// Static properties of one virtual event.
pub type VirtualEvent = EventDesc;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefineError {
    #[error("event {0:#x} is already defined")]
    AlreadyExists(u32),

    #[error("event number {0:#x} is not in the virtual namespace")]
    InvalidNumber(u64),
}

struct Entry {
    event: VirtualEvent,
    notifier: Option<Arc<NotifyFn>>,
}

/// Immutable (after VM setup) table of the virtual events defined for a VM,
/// along with the notifier, if any, attached to each.
#[derive(Default)]
pub struct EventRegistry {
    events: BTreeMap<u32, Entry>,
}

impl EventRegistry {
    /// Builds a registry from the supplied event table.
    pub fn new<'a>(
        events: impl IntoIterator<Item = &'a EventDesc>,
    ) -> Result<Self, DefineError> {
        let mut this = Self::default();
        for ev in events {
            this.define(*ev)?;
        }
        Ok(this)
    }

    pub fn find(&self, number: u64) -> Option<&VirtualEvent> {
        let number = u32::try_from(number).ok()?;
        self.events.get(&number).map(|ent| &ent.event)
    }

    pub fn define(&mut self, event: VirtualEvent) -> Result<(), DefineError> {
        if !is_virtual_event(event.number as u64) {
            return Err(DefineError::InvalidNumber(event.number as u64));
        }
        if self.events.contains_key(&event.number) {
            return Err(DefineError::AlreadyExists(event.number));
        }
        self.events.insert(event.number, Entry { event, notifier: None });
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualEvent> {
        self.events.values().map(|ent| &ent.event)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Attaches `notifier` to event `number`, replacing any notifier which
    /// was previously attached. Returns `false` if no such event exists.
    pub(crate) fn set_notifier(
        &mut self,
        number: u32,
        notifier: Arc<NotifyFn>,
    ) -> bool {
        match self.events.get_mut(&number) {
            Some(ent) => {
                ent.notifier = Some(notifier);
                true
            }
            None => false,
        }
    }

    pub(crate) fn notifier(&self, number: u32) -> Option<Arc<NotifyFn>> {
        self.events.get(&number)?.notifier.clone()
    }

    /// Builds a replacement registry from `events`, carrying over the
    /// notifiers attached to any events the two have in common.
    pub(crate) fn rebuild<'a>(
        &self,
        events: impl IntoIterator<Item = &'a EventDesc>,
    ) -> Result<Self, DefineError> {
        let mut next = Self::new(events)?;
        for (num, ent) in next.events.iter_mut() {
            ent.notifier = self.notifier(*num);
        }
        Ok(next)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use vsdei_types::{EventKind, EventPriority, DEFAULT_EVENT_NUM};

    fn shared_normal(number: u32) -> VirtualEvent {
        EventDesc {
            number,
            kind: EventKind::Shared,
            priority: EventPriority::Normal,
            signaled: false,
        }
    }

    #[test]
    fn default_table() {
        let reg = EventRegistry::new(&[EventDesc::default_event()]).unwrap();
        let ev = reg.find(DEFAULT_EVENT_NUM as u64).unwrap();
        assert_eq!(ev.kind, EventKind::Private);
        assert_eq!(ev.priority, EventPriority::Critical);
        assert!(ev.signaled);
        assert!(reg.find(0x4040_0001).is_none());
        assert!(reg.find(1 << 32 | DEFAULT_EVENT_NUM as u64).is_none());
    }

    #[test]
    fn define_rejects_bad_numbers() {
        let mut reg = EventRegistry::default();
        assert_eq!(
            reg.define(shared_normal(0x10)),
            Err(DefineError::InvalidNumber(0x10))
        );
        assert_eq!(reg.define(shared_normal(0x4040_0001)), Ok(()));
        assert_eq!(
            reg.define(shared_normal(0x4040_0001)),
            Err(DefineError::AlreadyExists(0x4040_0001))
        );
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn notifier_requires_event() {
        let mut reg =
            EventRegistry::new(&[shared_normal(0x4040_0001)]).unwrap();
        let noop: Arc<NotifyFn> = Arc::new(|_, _, _| {});

        assert!(!reg.set_notifier(0x4040_0002, noop.clone()));
        assert!(reg.notifier(0x4040_0001).is_none());
        assert!(reg.set_notifier(0x4040_0001, noop));
        assert!(reg.notifier(0x4040_0001).is_some());
    }

    #[test]
    fn rebuild_keeps_notifiers() {
        let mut reg = EventRegistry::new(&[
            EventDesc::default_event(),
            shared_normal(0x4040_0001),
        ])
        .unwrap();
        let noop: Arc<NotifyFn> = Arc::new(|_, _, _| {});
        reg.set_notifier(0x4040_0001, noop);

        let next = reg
            .rebuild(&[shared_normal(0x4040_0001), shared_normal(0x4040_0002)])
            .unwrap();
        assert_eq!(next.len(), 2);
        assert!(next.find(DEFAULT_EVENT_NUM as u64).is_none());
        assert!(next.notifier(0x4040_0001).is_some());
        assert!(next.notifier(0x4040_0002).is_none());
    }
}
