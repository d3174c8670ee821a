//! Tests for on-demand subset loading and the loading flag it drives.

mod common;

use common::setup;
use futures::{channel::oneshot, task::LocalSpawnExt};
use optimist::{
    BoxError, Collection, CollectionConfig, LoadSubset, LoadSubsetOptions, LoadingSubsetChange,
    SyncMode, SyncOperation, Value,
};
use std::{cell::RefCell, rc::Rc};

/// Requests the loader has received, each with the sender that finishes it.
type Requests = Rc<RefCell<Vec<(LoadSubsetOptions, oneshot::Sender<Result<(), BoxError>>)>>>;

fn on_demand(context: &optimist::TransactionContext) -> (Collection, Requests) {
    let requests: Requests = Rc::default();
    let sink = requests.clone();
    let collection = Collection::new(
        context,
        CollectionConfig::keyed_by("todos", "id")
            .sync_mode(SyncMode::OnDemand)
            .load_subset(move |options| {
                let (done, finished) = oneshot::channel();
                sink.borrow_mut().push((options.clone(), done));
                LoadSubset::loading(async move {
                    finished.await.unwrap_or_else(|_| Err("load abandoned".into()))
                })
            }),
    );
    (collection, requests)
}

#[test]
fn overlapping_loads_report_a_single_loading_period() {
    let (mut pool, context) = setup();
    let (todos, requests) = on_demand(&context);
    let changes = Rc::new(RefCell::new(Vec::<LoadingSubsetChange>::new()));
    let sink = changes.clone();
    todos
        .subset_tracker()
        .on_loading_subset_change(move |change| sink.borrow_mut().push(*change));

    let first = LoadSubsetOptions {
        limit: Some(10),
        ..LoadSubsetOptions::default()
    };
    let second = LoadSubsetOptions {
        filter: Some(optimist::record! { "done" => false }),
        ..LoadSubsetOptions::default()
    };
    for options in [&first, &second] {
        let load = todos.load_subset(options);
        pool.spawner()
            .spawn_local(async move {
                let _ = load.settle().await;
            })
            .unwrap();
    }
    pool.run_until_stalled();
    assert!(todos.is_loading_subset());
    assert_eq!(todos.subset_tracker().pending_loads(), 2);

    let mut requests = requests.borrow_mut().drain(..).collect::<Vec<_>>().into_iter();
    let (options, done) = requests.next().unwrap();
    assert_eq!(options, first);
    // the sync layer delivers the rows, then resolves the load
    todos
        .sync_writer()
        .write_immediate([SyncOperation::insert(optimist::record! { "id" => 1 })])
        .unwrap();
    done.send(Ok(())).unwrap();
    pool.run_until_stalled();
    assert!(todos.is_loading_subset());

    let (options, done) = requests.next().unwrap();
    assert_eq!(options, second);
    done.send(Err("timeout".into())).unwrap();
    pool.run_until_stalled();

    assert!(!todos.is_loading_subset());
    assert_eq!(todos.len(), 1);
    assert_eq!(
        *changes.borrow(),
        [
            LoadingSubsetChange {
                is_loading_subset: true,
                previous_is_loading_subset: false,
            },
            LoadingSubsetChange {
                is_loading_subset: false,
                previous_is_loading_subset: true,
            },
        ]
    );
}

#[test]
fn dropped_loads_stop_counting() {
    let (_pool, context) = setup();
    let (todos, requests) = on_demand(&context);
    let load = todos.load_subset(&LoadSubsetOptions::default());
    assert!(todos.is_loading_subset());
    drop(load);
    assert!(!todos.is_loading_subset());
    assert_eq!(requests.borrow().len(), 1);
}

#[test]
fn unsubscribed_listeners_are_not_called() {
    let (_pool, context) = setup();
    let (todos, _requests) = on_demand(&context);
    let calls = Rc::new(RefCell::new(0));
    let counter = calls.clone();
    let id = todos
        .subset_tracker()
        .on_loading_subset_change(move |_| *counter.borrow_mut() += 1);
    assert!(todos.subset_tracker().unsubscribe(id));

    drop(todos.load_subset(&LoadSubsetOptions::default()));
    assert_eq!(*calls.borrow(), 0);
}

#[test]
fn unloading_is_forwarded_to_the_sync_layer() {
    let (_pool, context) = setup();
    let unloaded = Rc::new(RefCell::new(Vec::new()));
    let sink = unloaded.clone();
    let todos = Collection::new(
        &context,
        CollectionConfig::keyed_by("todos", "id")
            .sync_mode(SyncMode::OnDemand)
            .unload_subset(move |options| sink.borrow_mut().push(options.limit)),
    );
    // without a loader there is nothing to wait for
    assert!(todos.load_subset(&LoadSubsetOptions::default()).is_ready());

    todos.unload_subset(&LoadSubsetOptions {
        limit: Some(5),
        cursor: Some(Value::from(20)),
        ..LoadSubsetOptions::default()
    });
    assert_eq!(*unloaded.borrow(), [Some(5)]);
}
