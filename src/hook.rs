//! Observer lists with token-based unsubscribe.
//!
//! Dispatch works on a snapshot of the callback list taken under a short
//! borrow, so a callback is free to subscribe, unsubscribe (itself
//! included) or drop handles while it runs. Changes made during dispatch
//! take effect from the next dispatch onwards.

use std::fmt;
use std::rc::Rc;

/// A token identifying one subscription on an observer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

pub(crate) struct Hooks<T: ?Sized> {
    entries: Vec<(u64, Rc<T>)>,
    next: u64,
}

impl<T: ?Sized> Hooks<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next: 0,
        }
    }

    pub fn add(&mut self, cb: Rc<T>) -> Subscription {
        let id = self.next;
        self.next += 1;
        self.entries.push((id, cb));
        Subscription(id)
    }

    /// Removes a subscription. Returns false if the token was already
    /// removed or never belonged to this list.
    pub fn remove(&mut self, sub: Subscription) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(id, _)| *id != sub.0);
        self.entries.len() != before
    }

    pub fn snapshot(&self) -> Vec<Rc<T>> {
        self.entries.iter().map(|(_, cb)| Rc::clone(cb)).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<T: ?Sized> fmt::Debug for Hooks<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn tokens_are_distinct_and_single_use() {
        let mut hooks: Hooks<dyn Fn()> = Hooks::new();
        let a = hooks.add(Rc::new(|| {}));
        let b = hooks.add(Rc::new(|| {}));
        assert_ne!(a, b);
        assert!(hooks.remove(a));
        assert!(!hooks.remove(a));
        assert_eq!(hooks.len(), 1);
    }

    #[test]
    fn snapshot_is_isolated_from_removal() {
        let mut hooks: Hooks<dyn Fn(&Cell<u32>)> = Hooks::new();
        let sub = hooks.add(Rc::new(|n: &Cell<u32>| n.set(n.get() + 1)));

        let snap = hooks.snapshot();
        hooks.remove(sub);

        let count = Cell::new(0);
        for cb in &snap {
            cb(&count);
        }
        assert_eq!(count.get(), 1);
        assert!(hooks.snapshot().is_empty());
    }
}
