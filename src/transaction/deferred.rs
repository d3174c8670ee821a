// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use futures::{
    FutureExt,
    channel::oneshot,
    future::Shared,
};
use std::cell::RefCell;

/// A settle-once outcome that any number of waiters can observe.
///
/// Waiters see [`oneshot::Canceled`] if the deferred is dropped without being settled.
pub(crate) struct Deferred<T: Clone> {
    sender: RefCell<Option<oneshot::Sender<T>>>,
    receiver: Shared<oneshot::Receiver<T>>,
}

impl<T: Clone> Deferred<T> {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            sender: RefCell::new(Some(sender)),
            receiver: receiver.shared(),
        }
    }

    /// Settles with `value`. Returns `false` if already settled, in which case `value` is
    /// dropped.
    pub(crate) fn settle(&self, value: T) -> bool {
        let Some(sender) = self.sender.borrow_mut().take() else {
            return false;
        };
        // the receiver lives in `self`, so sending cannot fail
        let _ = sender.send(value);
        true
    }

    #[cfg(test)]
    pub(crate) fn is_settled(&self) -> bool {
        self.sender.borrow().is_none()
    }

    pub(crate) fn wait(&self) -> Shared<oneshot::Receiver<T>> {
        self.receiver.clone()
    }
}
