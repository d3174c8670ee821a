// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

/// Returned when subscribing; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callbacks subscribed to one kind of event.
///
/// Emitting calls a snapshot of the subscribers taken before the first call, so a listener may
/// subscribe or unsubscribe others (or itself) while being notified.
pub(crate) struct Listeners<A: ?Sized> {
    next: Cell<u64>,
    entries: RefCell<Vec<(ListenerId, Rc<dyn Fn(&A)>)>>,
}

impl<A: ?Sized> Default for Listeners<A> {
    fn default() -> Self {
        Self {
            next: Cell::new(0),
            entries: RefCell::new(Vec::new()),
        }
    }
}

impl<A: ?Sized> Listeners<A> {
    pub(crate) fn add(&self, listener: impl Fn(&A) + 'static) -> ListenerId {
        let id = ListenerId(self.next.get());
        self.next.set(id.0 + 1);
        let listener: Rc<dyn Fn(&A)> = Rc::new(listener);
        self.entries.borrow_mut().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub(crate) fn emit(&self, event: &A) {
        let snapshot: Vec<_> = self
            .entries
            .borrow()
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }
}

impl<A: ?Sized> fmt::Debug for Listeners<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_to_current_subscribers() {
        let listeners = Listeners::<[u8]>::default();
        let seen = Rc::new(Cell::new(0usize));
        let counter = seen.clone();
        let id = listeners.add(move |bytes: &[u8]| counter.set(counter.get() + bytes.len()));
        listeners.emit(&[1, 2, 3]);
        assert_eq!(seen.get(), 3);

        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.emit(&[4]);
        assert_eq!(seen.get(), 3);
    }

    #[test]
    fn listeners_may_unsubscribe_while_notified() {
        let listeners = Rc::new(Listeners::<u8>::default());
        let calls = Rc::new(Cell::new(0));
        let id = Rc::new(Cell::new(None));

        let (registry, counter, own_id) = (listeners.clone(), calls.clone(), id.clone());
        id.set(Some(listeners.add(move |_| {
            counter.set(counter.get() + 1);
            if let Some(own) = own_id.get() {
                registry.remove(own);
            }
        })));

        listeners.emit(&0);
        listeners.emit(&0);
        assert_eq!(calls.get(), 1);
        assert_eq!(listeners.len(), 0);
    }
}
