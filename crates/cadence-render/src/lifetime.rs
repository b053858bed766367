// SPDX-License-Identifier: CEPL-1.0
//! Deferred LIFO teardown of long-lived GPU objects.

use tracing::{debug, warn};

type Destructor<D> = Box<dyn FnOnce(&D)>;

/// Ordered list of teardown actions, flushed once after the GPU is idle.
///
/// Every entry captures only the native handles it frees; the device is lent
/// back at flush time, so nothing here keeps the device alive. Registries are
/// plain values: an application may hold several independent ones.
pub struct ResourceLifetimeRegistry<D> {
    label: &'static str,
    entries: Vec<Destructor<D>>,
}

impl<D> ResourceLifetimeRegistry<D> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            entries: Vec::new(),
        }
    }

    pub fn register(&mut self, destroy: impl FnOnce(&D) + 'static) {
        self.entries.push(Box::new(destroy));
    }

    /// Runs every entry newest-first and leaves the registry empty.
    pub fn flush_all(&mut self, device: &D) {
        if self.entries.is_empty() {
            return;
        }
        debug!(
            registry = self.label,
            count = self.entries.len(),
            "flushing deferred destructors"
        );
        while let Some(destroy) = self.entries.pop() {
            destroy(device);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<D> Drop for ResourceLifetimeRegistry<D> {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            warn!(
                registry = self.label,
                leaked = self.entries.len(),
                "registry dropped without flush; GPU objects leaked"
            );
        }
    }
}

impl<D> std::fmt::Debug for ResourceLifetimeRegistry<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLifetimeRegistry")
            .field("label", &self.label)
            .field("pending", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Log(RefCell<Vec<u32>>);

    #[test]
    fn flush_runs_in_reverse_registration_order() {
        let mut registry = ResourceLifetimeRegistry::<Log>::new("test");
        for i in 0..16 {
            registry.register(move |log: &Log| log.0.borrow_mut().push(i));
        }
        assert_eq!(registry.len(), 16);

        let log = Log(RefCell::new(Vec::new()));
        registry.flush_all(&log);

        let expected: Vec<u32> = (0..16).rev().collect();
        assert_eq!(*log.0.borrow(), expected);
        assert!(registry.is_empty());
    }

    #[test]
    fn second_flush_is_a_no_op() {
        let calls = Rc::new(RefCell::new(0));
        let mut registry = ResourceLifetimeRegistry::<()>::new("test");
        let c = calls.clone();
        registry.register(move |_| *c.borrow_mut() += 1);

        registry.flush_all(&());
        registry.flush_all(&());
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn registries_are_independent() {
        let log = Log(RefCell::new(Vec::new()));
        let mut a = ResourceLifetimeRegistry::<Log>::new("a");
        let mut b = ResourceLifetimeRegistry::<Log>::new("b");
        a.register(|l: &Log| l.0.borrow_mut().push(1));
        b.register(|l: &Log| l.0.borrow_mut().push(2));

        b.flush_all(&log);
        assert_eq!(*log.0.borrow(), vec![2]);
        assert_eq!(a.len(), 1);
        a.flush_all(&log);
        assert_eq!(*log.0.borrow(), vec![2, 1]);
    }
}
