// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(clippy::mutex_atomic)]

use std::sync::Mutex;

/// A level-triggered interrupt line into the guest.
pub trait IntrPin: Send + Sync + 'static {
    fn assert(&self);
    fn deassert(&self);
    fn is_asserted(&self) -> bool;
}

type LevelFn = dyn Fn(bool) + Send + Sync + 'static;

/// An interrupt pin which forwards level transitions to a callback, such as
/// one raising an SPI through the hypervisor's interrupt controller.
///
/// The callback is invoked only on 0->1 and 1->0 transitions.
pub struct FuncPin {
    asserted: Mutex<bool>,
    func: Box<LevelFn>,
}

impl FuncPin {
    pub fn new(func: Box<LevelFn>) -> Self {
        Self { asserted: Mutex::new(false), func }
    }
}

impl IntrPin for FuncPin {
    fn assert(&self) {
        let mut asserted = self.asserted.lock().unwrap();
        if !*asserted {
            *asserted = true;
            (self.func)(true);
        }
    }
    fn deassert(&self) {
        let mut asserted = self.asserted.lock().unwrap();
        if *asserted {
            *asserted = false;
            (self.func)(false);
        }
    }
    fn is_asserted(&self) -> bool {
        let asserted = self.asserted.lock().unwrap();
        *asserted
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn counting_pin() -> (FuncPin, Arc<Mutex<Vec<bool>>>) {
        let levels = Arc::new(Mutex::new(Vec::new()));
        let seen = levels.clone();
        let pin = FuncPin::new(Box::new(move |lvl| {
            seen.lock().unwrap().push(lvl);
        }));
        (pin, levels)
    }

    #[test]
    fn transitions_only() {
        let (pin, levels) = counting_pin();
        pin.assert();
        pin.assert();
        assert!(pin.is_asserted());
        pin.deassert();
        pin.deassert();
        assert!(!pin.is_asserted());
        assert_eq!(*levels.lock().unwrap(), vec![true, false]);
    }
}
