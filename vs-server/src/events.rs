// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Typed subscription callbacks for worker lifecycle events.

use std::sync::Mutex;

type Slot<T> = Box<dyn Fn(&T) + Send + Sync + 'static>;

/// A list of subscribers invoked synchronously, in connection order, when
/// the event fires.
pub struct Signal<T = ()> {
    slots: Mutex<Vec<Slot<T>>>,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn connect(&self, f: impl Fn(&T) + Send + Sync + 'static) {
        self.slots.lock().unwrap().push(Box::new(f));
    }

    pub fn emit(&self, arg: &T) {
        let slots = self.slots.lock().unwrap();
        for slot in slots.iter() {
            slot(arg);
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    #[test]
    fn test_signal_dispatch() {
        let signal: Signal<u32> = Signal::new();
        let sum = Arc::new(AtomicU32::new(0));

        let sum1 = sum.clone();
        signal.connect(move |v| {
            sum1.fetch_add(*v, Ordering::SeqCst);
        });
        let sum2 = sum.clone();
        signal.connect(move |v| {
            sum2.fetch_add(*v * 10, Ordering::SeqCst);
        });

        signal.emit(&3);
        assert_eq!(sum.load(Ordering::SeqCst), 33);
    }
}
