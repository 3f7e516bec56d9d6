//! The controller behind its async service handle

use futures::future::join_all;
use pretty_assertions::assert_eq;
use std::sync::Arc;

use seqhook::collab::sim::{CharTokenizer, EvictionCacheStore, RecordingScheduler};
use seqhook::coord::BroadcastEventSink;
use seqhook::{
    ControllerConfig, ControllerState, LifecycleController, LifecycleService, RootSpec, SequenceId, SequenceOutput,
    SequenceStatus,
};

fn controller() -> LifecycleController {
    LifecycleController::new(
        ControllerConfig::development(),
        Box::new(RecordingScheduler::new()),
        Arc::new(CharTokenizer),
        Arc::new(EvictionCacheStore::new()),
    )
    .unwrap()
}

fn out(id: SequenceId, text: &str) -> SequenceOutput {
    SequenceOutput::new(id, text.chars().map(|c| c as u32).collect()).with_text(text)
}

#[tokio::test]
async fn test_ticks_through_handle() {
    let (handle, task) = LifecycleService::spawn(controller(), 8);

    let p = handle.register_root(RootSpec::new(vec![1, 2]).with_id(5)).await.unwrap();
    let report = handle.tick(vec![out(p, "<spawn>x</spawn><sync/>")]).await.unwrap();
    assert_eq!(report.spawned_ids(), vec![6]);
    assert_eq!(report.blocked, vec![p]);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.blocked(), vec![p]);
    assert_eq!(snapshot.get(p).unwrap().sync_target, Some(vec![6]));

    let report = handle.tick(vec![out(6, "<return>r1</return>")]).await.unwrap();
    assert_eq!(report.resumed_ids(), vec![p]);

    handle.shutdown().await.unwrap();
    let controller = task.await.unwrap();
    assert_eq!(controller.sequence(p).unwrap().status(), SequenceStatus::Resuming);
    assert_eq!(controller.stats().merges, 1);

    assert!(handle.stats().await.is_err());
}

#[tokio::test]
async fn test_concurrent_readers_see_consistent_state() {
    let (handle, task) = LifecycleService::spawn(controller(), 4);
    let p = handle.register_root(RootSpec::new(vec![1])).await.unwrap();
    handle.tick(vec![out(p, "<spawn>a</spawn><spawn>b</spawn>")]).await.unwrap();

    let snapshots = join_all((0..8).map(|_| {
        let handle = handle.clone();
        async move { handle.snapshot().await }
    }))
    .await;
    for snapshot in snapshots {
        let snapshot = snapshot.unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get(p).unwrap().child_ids.len(), 2);
    }

    let stats = join_all((0..4).map(|_| handle.stats())).await;
    assert!(stats.iter().all(|s| s.as_ref().map(|s| s.children_spawned == 2).unwrap_or(false)));

    drop(handle);
    let controller = task.await.unwrap();
    assert_eq!(controller.state().store.len(), 3);
}

#[tokio::test]
async fn test_checkpoint_and_cancel_through_handle() {
    let (handle, task) = LifecycleService::spawn(controller(), 8);
    let p = handle.register_root(RootSpec::new(vec![1]).with_id(1)).await.unwrap();
    handle.tick(vec![out(p, "<spawn>a</spawn>")]).await.unwrap();

    let bytes = handle.checkpoint().await.unwrap();
    let state = ControllerState::from_bytes(&bytes).unwrap();
    assert_eq!(state.store.len(), 2);
    assert_eq!(state.graph.children(p), &[2]);

    let report = handle.cancel(p).await.unwrap();
    assert_eq!(report.cancelled, vec![1, 2]);
    assert!(handle.cancel(p).await.is_err());

    handle.shutdown().await.unwrap();
    let controller = task.await.unwrap();
    assert!(controller.state().store.is_empty());
}

#[tokio::test]
async fn test_broadcast_sink_delivers_events() {
    let sink = Arc::new(BroadcastEventSink::new(64));
    let mut events = sink.subscribe();
    let (handle, task) = LifecycleService::spawn(controller().with_event_sink(sink.clone()), 8);

    let p = handle.register_root(RootSpec::new(vec![1])).await.unwrap();
    handle.tick(vec![out(p, "<spawn>a</spawn>")]).await.unwrap();

    let first = events.recv().await.unwrap();
    let second = events.recv().await.unwrap();
    assert_eq!(first.tick, 0);
    assert_eq!(second.tick, 1);
    assert!(first.sequence < second.sequence);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
