//! A todo list backed by a pretend server that echoes accepted writes through the sync layer.
//!
//! Run with `RUST_LOG=optimist=debug cargo run --example todo_list` to watch the transactions.
use futures::executor::LocalPool;
use optimist::{
    BoxError, ChangeMessage, Collection, CollectionConfig, CollectionError, Key, MutationOptions,
    MutationType, SyncOperation, SyncWriter, Transaction, TransactionConfig, TransactionContext,
    record,
};
use std::{cell::RefCell, rc::Rc};
use tracing_subscriber::EnvFilter;

/// Accepts every write with a non-empty title and echoes it back, like a real backend would.
#[derive(Clone, Default)]
struct Server {
    sync: Rc<RefCell<Option<SyncWriter>>>,
}

impl Server {
    fn persist(&self, tx: Transaction) -> Result<(), BoxError> {
        let mutations = tx.mutations();
        for mutation in &mutations {
            let title = mutation.modified.get_field("title").and_then(|t| t.as_str());
            if mutation.kind != MutationType::Delete && title.is_none_or(str::is_empty) {
                return Err(format!("{} needs a title", mutation.global_key).into());
            }
        }
        let sync = self.sync.borrow();
        let Some(sync) = sync.as_ref() else {
            return Err("server is not connected".into());
        };
        sync.begin();
        for mutation in mutations {
            let operation = match mutation.kind {
                MutationType::Insert => SyncOperation::insert(mutation.modified),
                MutationType::Update => SyncOperation::update(mutation.modified),
                MutationType::Delete => SyncOperation::delete(mutation.original),
            };
            sync.write(operation.with_metadata(record! { "version" => 1 }))?;
        }
        sync.commit()?;
        Ok(())
    }
}

fn print_changes(changes: &[ChangeMessage]) {
    for change in changes {
        let row = serde_json::Value::from(change.value());
        println!("  {} {} {row}", change.kind(), change.key());
    }
}

fn print_list(todos: &Collection) {
    for (key, row) in todos.entries() {
        let marker = if todos.is_optimistic(&key) { "*" } else { " " };
        println!("  {marker} {key}: {}", serde_json::Value::from(row));
    }
}

fn main() -> Result<(), CollectionError> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let mut pool = LocalPool::new();
    let context = TransactionContext::new(pool.spawner());
    let server = Server::default();

    let handler = |server: &Server| {
        let server = server.clone();
        move |tx: Transaction| {
            let server = server.clone();
            async move { server.persist(tx) }
        }
    };
    let todos = Collection::new(
        &context,
        CollectionConfig::keyed_by("todos", "id")
            .on_insert(handler(&server))
            .on_update(handler(&server))
            .on_delete(handler(&server)),
    );
    *server.sync.borrow_mut() = Some(todos.sync_writer());
    todos.subscribe_changes(print_changes);

    println!("inserting two todos");
    todos.insert(
        [
            record! { "id" => 1, "title" => "Buy milk", "done" => false },
            record! { "id" => 2, "title" => "Walk the dog", "done" => false },
        ],
        MutationOptions::default(),
    )?;
    print_list(&todos);
    pool.run_until_stalled();
    println!("after the server confirmed");
    print_list(&todos);

    println!("editing inside one transaction");
    let tx = context.create_transaction(TransactionConfig::new(move |tx| {
        let server = server.clone();
        async move { server.persist(tx) }
    }))?;
    tx.mutate(|| {
        todos.update_one(1, MutationOptions::default(), |draft| draft.set("done", true))?;
        todos.insert(
            [record! { "id" => 3, "title" => "Water plants", "done" => false }],
            MutationOptions::default(),
        )?;
        todos.delete([2], MutationOptions::default())
    })?;
    pool.run_until_stalled();
    println!("transaction {} is {}", tx.id(), tx.state());
    print_list(&todos);

    println!("inserting a todo the server rejects");
    let rejected = todos.insert([record! { "id" => 4, "title" => "" }], MutationOptions::default())?;
    print_list(&todos);
    pool.run_until_stalled();
    if let Some(error) = rejected.error() {
        println!("transaction {} failed: {error}", rejected.id());
    }
    print_list(&todos);
    assert!(!todos.has(&Key::from(4)));
    Ok(())
}
