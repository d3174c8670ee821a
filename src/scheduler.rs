// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Work deferred until a transaction's `mutate` scope ends.
//!
//! Side effects triggered by writes inside [`Transaction::mutate`](crate::Transaction::mutate),
//! such as change notifications, are queued here under the transaction's id instead of running
//! immediately. When the scope exits the queue is flushed, so each job runs once per scope no
//! matter how many writes scheduled it. Re-scheduling a job id that is already queued replaces
//! its closure but keeps its place in the queue.
//!
//! Jobs may depend on other jobs of the same transaction; a job only runs once every dependency
//! that is still queued has run.
use crate::{FastMap, FastSet, TransactionId};
use std::{cell::RefCell, collections::VecDeque, fmt, rc::Rc};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("jobs {jobs:?} of transaction {context} depend on each other and cannot run")]
    UnresolvedDependencies {
        context: TransactionId,
        jobs: Vec<String>,
    },
}

/// A unit of deferred work.
pub struct Job {
    id: String,
    dependencies: Vec<String>,
    run: Box<dyn FnOnce()>,
}

impl Job {
    pub fn new(id: impl Into<String>, run: impl FnOnce() + 'static) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            run: Box::new(run),
        }
    }

    /// Only run this job after `dependency`, if that is queued too.
    #[must_use]
    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Queue {
    order: VecDeque<String>,
    jobs: FastMap<String, Box<dyn FnOnce()>>,
    dependencies: FastMap<String, Vec<String>>,
    completed: FastSet<String>,
}

impl Queue {
    fn is_ready(&self, job: &str) -> bool {
        self.dependencies.get(job).is_none_or(|dependencies| {
            dependencies
                .iter()
                .all(|dependency| !self.jobs.contains_key(dependency) || self.completed.contains(dependency))
        })
    }
}

type ClearListener = Rc<dyn Fn(&TransactionId)>;

/// Per-transaction job queues.
#[derive(Default)]
pub struct Scheduler {
    queues: RefCell<FastMap<TransactionId, Queue>>,
    clear_listeners: RefCell<Vec<ClearListener>>,
}

impl Scheduler {
    /// Queues `job` under `context`, or runs it right away without a context.
    pub fn schedule(&self, context: Option<&TransactionId>, job: Job) {
        let Some(context) = context else {
            (job.run)();
            return;
        };
        let mut queues = self.queues.borrow_mut();
        let queue = queues.entry(context.clone()).or_insert_with(Queue::default);
        if queue.jobs.insert(job.id.clone(), job.run).is_none() {
            queue.order.push_back(job.id.clone());
        }
        trace!(transaction = %context, job = %job.id, "job scheduled");
        queue.dependencies.insert(job.id, job.dependencies);
    }

    /// Runs every job queued under `context` in dependency order.
    ///
    /// Jobs run without any internal borrow held, so they may schedule further work; work
    /// scheduled under the same context is picked up by this flush.
    pub fn flush(&self, context: &TransactionId) -> Result<(), SchedulerError> {
        let mut stalled = 0;
        loop {
            let next = {
                let mut queues = self.queues.borrow_mut();
                let Some(queue) = queues.get_mut(context) else {
                    return Ok(());
                };
                let Some(job) = queue.order.pop_front() else {
                    queues.remove(context);
                    return Ok(());
                };
                if queue.is_ready(&job) {
                    stalled = 0;
                    queue.dependencies.remove(&job);
                    queue.jobs.remove(&job).map(|run| (job, run))
                } else {
                    queue.order.push_back(job);
                    stalled += 1;
                    if stalled >= queue.order.len() {
                        let jobs = queue.order.iter().cloned().collect();
                        queues.remove(context);
                        return Err(SchedulerError::UnresolvedDependencies {
                            context: context.clone(),
                            jobs,
                        });
                    }
                    None
                }
            };
            if let Some((job, run)) = next {
                trace!(transaction = %context, %job, "running job");
                run();
                if let Some(queue) = self.queues.borrow_mut().get_mut(context) {
                    queue.completed.insert(job);
                }
            }
        }
    }

    /// Drops every job queued under `context` without running it.
    pub fn clear(&self, context: &TransactionId) {
        self.queues.borrow_mut().remove(context);
        let listeners = self.clear_listeners.borrow().clone();
        for listener in listeners {
            listener(context);
        }
    }

    /// Drops a single queued job.
    pub fn clear_job(&self, context: &TransactionId, job: &str) {
        let mut queues = self.queues.borrow_mut();
        let Some(queue) = queues.get_mut(context) else {
            return;
        };
        queue.jobs.remove(job);
        queue.dependencies.remove(job);
        queue.order.retain(|queued| queued != job);
        if queue.order.is_empty() {
            queues.remove(context);
        }
    }

    pub fn has_pending_jobs(&self, context: &TransactionId) -> bool {
        self.queues
            .borrow()
            .get(context)
            .is_some_and(|queue| !queue.order.is_empty())
    }

    /// Registers `listener` to be told whenever a context's queue is cleared.
    pub fn on_clear(&self, listener: impl Fn(&TransactionId) + 'static) {
        self.clear_listeners.borrow_mut().push(Rc::new(listener));
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("contexts", &self.queues.borrow().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let job = move |name: &'static str| -> Box<dyn FnOnce()> {
            let sink = sink.clone();
            Box::new(move || sink.borrow_mut().push(name))
        };
        (log, job)
    }

    #[test]
    fn jobs_without_context_run_immediately() {
        let scheduler = Scheduler::default();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        scheduler.schedule(None, Job::new("now", move || flag.set(true)));
        assert!(ran.get());
    }

    #[test]
    fn rescheduling_replaces_the_job() {
        let scheduler = Scheduler::default();
        let context = TransactionId::from("tx");
        let (log, job) = recorder();
        scheduler.schedule(Some(&context), Job::new("emit", job("first")));
        scheduler.schedule(Some(&context), Job::new("emit", job("second")));
        assert!(scheduler.has_pending_jobs(&context));
        scheduler.flush(&context).unwrap();
        assert_eq!(*log.borrow(), ["second"]);
        assert!(!scheduler.has_pending_jobs(&context));
    }

    #[test]
    fn dependencies_run_first() {
        let scheduler = Scheduler::default();
        let context = TransactionId::from("tx");
        let (log, job) = recorder();
        scheduler.schedule(Some(&context), Job::new("b", job("b")).depends_on("a"));
        scheduler.schedule(Some(&context), Job::new("a", job("a")));
        scheduler.schedule(Some(&context), Job::new("c", job("c")).depends_on("not-queued"));
        scheduler.flush(&context).unwrap();
        assert_eq!(*log.borrow(), ["a", "c", "b"]);
    }

    #[test]
    fn cycles_are_reported() {
        let scheduler = Scheduler::default();
        let context = TransactionId::from("tx");
        let (log, job) = recorder();
        scheduler.schedule(Some(&context), Job::new("a", job("a")).depends_on("b"));
        scheduler.schedule(Some(&context), Job::new("b", job("b")).depends_on("a"));
        let error = scheduler.flush(&context).unwrap_err();
        assert!(matches!(error, SchedulerError::UnresolvedDependencies { ref jobs, .. } if jobs.len() == 2));
        assert!(log.borrow().is_empty());
        assert!(!scheduler.has_pending_jobs(&context));
    }

    #[test]
    fn clearing_drops_work_and_notifies() {
        let scheduler = Scheduler::default();
        let context = TransactionId::from("tx");
        let (log, job) = recorder();
        let cleared = Rc::new(Cell::new(0));
        let count = cleared.clone();
        scheduler.on_clear(move |_| count.set(count.get() + 1));

        scheduler.schedule(Some(&context), Job::new("a", job("a")));
        scheduler.schedule(Some(&context), Job::new("b", job("b")));
        scheduler.clear_job(&context, "a");
        scheduler.flush(&context).unwrap();
        assert_eq!(*log.borrow(), ["b"]);

        scheduler.schedule(Some(&context), Job::new("c", job("c")));
        scheduler.clear(&context);
        scheduler.flush(&context).unwrap();
        assert_eq!(*log.borrow(), ["b"]);
        assert_eq!(cleared.get(), 1);
    }

    #[test]
    fn jobs_can_schedule_more_work() {
        let scheduler = Rc::new(Scheduler::default());
        let context = TransactionId::from("tx");
        let (log, job) = recorder();
        let follow_up = job("follow-up");
        let inner = scheduler.clone();
        let ctx = context.clone();
        scheduler.schedule(
            Some(&context),
            Job::new("first", move || inner.schedule(Some(&ctx), Job::new("second", follow_up))),
        );
        scheduler.flush(&context).unwrap();
        assert_eq!(*log.borrow(), ["follow-up"]);
    }
}
