// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Tracking whether a collection is loading additional data.
//!
//! Collections that sync on demand load the rows a query needs only when it asks for them. A
//! [`SubsetLoadTracker`] counts those loads while they are in flight and notifies subscribers
//! when loading starts (the count leaves zero) or ends (it returns to zero). Loads that finish in
//! between do not produce notifications.
use crate::{
    BoxError,
    listeners::{ListenerId, Listeners},
};
use futures::future::{FutureExt, LocalBoxFuture};
use std::{cell::Cell, fmt, future::Future, rc::Rc};
use tracing::trace;

/// The outcome of asking a sync layer for more data.
pub enum LoadSubset {
    /// Nothing needed loading.
    Ready,
    Loading(LocalBoxFuture<'static, Result<(), BoxError>>),
}

impl LoadSubset {
    pub fn loading<Fut, E>(future: Fut) -> Self
    where
        Fut: Future<Output = Result<(), E>> + 'static,
        E: Into<BoxError>,
    {
        Self::Loading(async move { future.await.map_err(Into::into) }.boxed_local())
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Waits until the data is loaded.
    pub async fn settle(self) -> Result<(), BoxError> {
        match self {
            Self::Ready => Ok(()),
            Self::Loading(future) => future.await,
        }
    }
}

impl fmt::Debug for LoadSubset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("Ready"),
            Self::Loading(_) => f.write_str("Loading"),
        }
    }
}

/// Emitted when a tracker starts or stops loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadingSubsetChange {
    pub is_loading_subset: bool,
    pub previous_is_loading_subset: bool,
}

#[derive(Default)]
struct TrackerInner {
    pending: Cell<usize>,
    listeners: Listeners<LoadingSubsetChange>,
}

impl TrackerInner {
    fn notify(&self, is_loading_subset: bool) {
        trace!(is_loading_subset, "subset loading changed");
        self.listeners.emit(&LoadingSubsetChange {
            is_loading_subset,
            previous_is_loading_subset: !is_loading_subset,
        });
    }
}

/// Reference-counts in-flight loads.
///
/// Clones share the same count.
#[derive(Clone, Default)]
pub struct SubsetLoadTracker(Rc<TrackerInner>);

impl SubsetLoadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loading_subset(&self) -> bool {
        self.0.pending.get() > 0
    }

    pub fn pending_loads(&self) -> usize {
        self.0.pending.get()
    }

    pub fn on_loading_subset_change(&self, listener: impl Fn(&LoadingSubsetChange) + 'static) -> ListenerId {
        self.0.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.0.listeners.remove(id)
    }

    /// Starts tracking `load`.
    ///
    /// The returned value must be awaited (through [`LoadSubset::settle`] or by polling the
    /// future) for the load to make progress. It stops counting once the load succeeds or fails,
    /// or when it is dropped unfinished.
    pub fn load_subset(&self, load: LoadSubset) -> LoadSubset {
        match load {
            LoadSubset::Ready => LoadSubset::Ready,
            LoadSubset::Loading(future) => {
                let guard = LoadGuard::start(Rc::clone(&self.0));
                LoadSubset::Loading(
                    async move {
                        let _guard = guard;
                        future.await
                    }
                    .boxed_local(),
                )
            }
        }
    }
}

impl fmt::Debug for SubsetLoadTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubsetLoadTracker")
            .field("pending", &self.0.pending.get())
            .finish()
    }
}

/// Counts one in-flight load for as long as it lives.
struct LoadGuard(Rc<TrackerInner>);

impl LoadGuard {
    fn start(tracker: Rc<TrackerInner>) -> Self {
        let previous = tracker.pending.get();
        tracker.pending.set(previous + 1);
        if previous == 0 {
            tracker.notify(true);
        }
        Self(tracker)
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        let remaining = self.0.pending.get().saturating_sub(1);
        self.0.pending.set(remaining);
        if remaining == 0 {
            self.0.notify(false);
        }
    }
}
