// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use super::handle::{Transaction, TransactionConfig, TransactionId};
use crate::{BoxError, Scheduler, TransactionError};
use futures::{
    future::LocalBoxFuture,
    task::{LocalSpawn, LocalSpawnExt, SpawnError},
};
use smallvec::SmallVec;
use std::{
    cell::RefCell,
    fmt,
    future::Future,
    rc::Rc,
};
use tracing::{debug, error};

/// Owns the transactions of one thread.
///
/// A context holds:
///
/// - the registry of every transaction that has not yet completed or failed, in creation order,
///   which is what a failing transaction scans for conflicts;
/// - the ambient stack, whose top is the transaction that bare collection writes join;
/// - the [`Scheduler`] whose per-transaction work is drained once per `mutate` scope;
/// - the executor that drives commit functions.
///
/// Handles are cheap to clone. Dropping the last handle abandons every transaction that has not
/// settled yet.
#[derive(Clone)]
pub struct TransactionContext(Rc<ContextInner>);

pub(crate) struct ContextInner {
    registry: RefCell<Vec<Transaction>>,
    ambient: RefCell<SmallVec<[Transaction; 4]>>,
    scheduler: Scheduler,
    spawner: Box<dyn LocalSpawn>,
}

impl TransactionContext {
    /// Creates a context whose commits run on `spawner`.
    pub fn new(spawner: impl LocalSpawn + 'static) -> Self {
        Self(Rc::new(ContextInner {
            registry: RefCell::new(Vec::new()),
            ambient: RefCell::new(SmallVec::new()),
            scheduler: Scheduler::default(),
            spawner: Box::new(spawner),
        }))
    }

    pub fn create_transaction(&self, config: TransactionConfig) -> Result<Transaction, TransactionError> {
        let Some(commit_fn) = config.commit_fn.clone() else {
            return Err(TransactionError::MissingMutationFunction);
        };
        let tx = Transaction::new(Rc::downgrade(&self.0), commit_fn, config);
        self.0.registry.borrow_mut().push(tx.clone());
        debug!(transaction = %tx.id(), "transaction created");
        Ok(tx)
    }

    /// Wraps a local write and its server call into an action that can be invoked repeatedly.
    ///
    /// Every invocation creates a transaction from `config`, runs `on_mutate` with it as the
    /// ambient transaction and returns it. Its commit function is `commit_fn`, called with the
    /// variables of that invocation. With auto-commit (the default) the transaction is
    /// committed as soon as `on_mutate` returns.
    ///
    /// If `on_mutate` fails, the transaction is rolled back and the error returned. An `id` set
    /// on `config` is ignored, since ids must be unique.
    ///
    /// ```rust
    /// # use futures::executor::LocalPool;
    /// # use optimist::{BoxError, Collection, CollectionConfig, CollectionError, MutationOptions,
    /// #     TransactionConfig, TransactionContext, record};
    /// let mut pool = LocalPool::new();
    /// let context = TransactionContext::new(pool.spawner());
    /// let todos = Collection::new(&context, CollectionConfig::keyed_by("todos", "id"));
    ///
    /// let add_todo = context.create_optimistic_action(
    ///     TransactionConfig::default(),
    ///     {
    ///         let todos = todos.clone();
    ///         move |title: &String| {
    ///             todos.insert([record! { "id" => 1, "title" => (title.as_str()) }], MutationOptions::default())?;
    ///             Ok::<_, CollectionError>(())
    ///         }
    ///     },
    ///     |_title: String, _tx| async move {
    ///         // POST the new todo
    ///         Ok::<_, BoxError>(())
    ///     },
    /// );
    ///
    /// let tx = add_todo("Buy milk".to_string()).unwrap();
    /// assert_eq!(todos.len(), 1);
    /// pool.run_until(tx.is_persisted()).unwrap();
    /// ```
    pub fn create_optimistic_action<V, M, E, F, Fut, CE>(
        &self,
        config: TransactionConfig,
        on_mutate: M,
        commit_fn: F,
    ) -> impl Fn(V) -> Result<Transaction, E> + use<V, M, E, F, Fut, CE>
    where
        V: Clone + 'static,
        M: Fn(&V) -> Result<(), E> + 'static,
        E: From<TransactionError>,
        F: Fn(V, Transaction) -> Fut + 'static,
        Fut: Future<Output = Result<(), CE>> + 'static,
        CE: Into<BoxError>,
    {
        let context = self.clone();
        let config = TransactionConfig { id: None, ..config };
        let commit_fn = Rc::new(commit_fn);
        move |variables: V| {
            let persist = Rc::clone(&commit_fn);
            let captured = variables.clone();
            let tx = context.create_transaction(
                config
                    .clone()
                    .commit_fn(move |tx| persist(captured.clone(), tx)),
            )?;
            if let Err(error) = tx.mutate(|| on_mutate(&variables)) {
                debug!(transaction = %tx.id(), "optimistic action failed, rolling back");
                tx.rollback()?;
                return Err(error);
            }
            Ok(tx)
        }
    }

    /// The transaction bare collection writes currently join, if any.
    pub fn active_transaction(&self) -> Option<Transaction> {
        self.0.ambient.borrow().last().cloned()
    }

    /// Every transaction that has neither completed nor failed, in creation order.
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.0.registered()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.0.scheduler
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("pending", &self.0.registry.borrow().len())
            .field("ambient", &self.0.ambient.borrow().len())
            .finish_non_exhaustive()
    }
}

impl ContextInner {
    pub(crate) fn registered(&self) -> Vec<Transaction> {
        self.registry.borrow().clone()
    }

    pub(crate) fn unregister(&self, tx: &Transaction) {
        self.registry.borrow_mut().retain(|registered| !registered.ptr_eq(tx));
    }

    pub(crate) fn spawn(&self, future: LocalBoxFuture<'static, ()>) -> Result<(), SpawnError> {
        self.spawner.spawn_local(future)
    }

    fn push_ambient(&self, tx: Transaction) {
        self.ambient.borrow_mut().push(tx);
    }

    fn pop_ambient(&self, tx: &Transaction) {
        let mut ambient = self.ambient.borrow_mut();
        if let Some(index) = ambient.iter().rposition(|entry| entry.ptr_eq(tx)) {
            ambient.remove(index);
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        for tx in self.registry.get_mut().drain(..) {
            tx.abandon();
        }
    }
}

/// Keeps a transaction on the ambient stack for as long as it lives.
pub(crate) struct Membership<'a> {
    context: &'a ContextInner,
    tx: Transaction,
}

impl<'a> Membership<'a> {
    pub(crate) fn enter(context: &'a ContextInner, tx: &Transaction) -> Self {
        context.push_ambient(tx.clone());
        Self {
            context,
            tx: tx.clone(),
        }
    }
}

impl Drop for Membership<'_> {
    fn drop(&mut self) {
        self.context.pop_ambient(&self.tx);
    }
}

/// Discards stale scheduler work for a transaction on entry and drains it on exit.
pub(crate) struct SchedulerScope<'a> {
    context: &'a ContextInner,
    id: TransactionId,
}

impl<'a> SchedulerScope<'a> {
    pub(crate) fn enter(context: &'a ContextInner, id: &TransactionId) -> Self {
        context.scheduler.clear(id);
        Self {
            context,
            id: id.clone(),
        }
    }
}

impl Drop for SchedulerScope<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.context.scheduler.flush(&self.id) {
            error!(transaction = %self.id, %err, "failed to flush scheduled work");
        }
    }
}
