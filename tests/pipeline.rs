//! Branch-triggered pipelines driven through the dispatcher.

mod common;

use std::sync::Arc;
use std::time::Duration;

use keel::pipeline::{
    AutoApprove, BranchRouter, Dispatch, EnvironmentPipeline, ManualApproval, PipelineDispatcher,
    PipelineState, SourceEvent, StaticConfigSource, gate_for,
};
use keel::reconciler::Reconciler;
use keel::state::{MemoryStateStore, StateStore};

use common::{Recorder, config};

const CIDR: &str = "10.0.0.0/16";

fn reconciler(store: &MemoryStateStore, recorder: &Recorder) -> Reconciler {
    Reconciler::new(Arc::new(store.clone()), recorder.registry())
}

#[tokio::test]
async fn events_queued_behind_an_approval_collapse_to_the_latest() {
    let config = config(CIDR, 2);
    let store = MemoryStateStore::new("prod");
    let recorder = Recorder::new();
    let (gate, approvals) = ManualApproval::channel(Duration::from_secs(30));
    let pipeline = EnvironmentPipeline::new(
        reconciler(&store, &recorder),
        Arc::new(gate),
        Arc::new(StaticConfigSource::new(config.clone())),
    );
    let mut states = pipeline.subscribe();

    let router = BranchRouter::from_config(&config).expect("routes");
    let (mut dispatcher, mut reports) = PipelineDispatcher::new(router);
    dispatcher.spawn(pipeline);

    let first = dispatcher.dispatch(SourceEvent::new("refs/heads/main", "c1")).await;
    assert_eq!(
        first,
        Dispatch::Queued {
            environment: String::from("prod")
        }
    );
    states
        .wait_for(|s| *s == PipelineState::AwaitingApproval)
        .await
        .expect("pipeline alive");

    let second = dispatcher.dispatch(SourceEvent::new("main", "c2")).await;
    let third = dispatcher.dispatch(SourceEvent::new("main", "c3")).await;
    assert!(matches!(second, Dispatch::Queued { .. }));
    assert_eq!(
        third,
        Dispatch::Coalesced {
            environment: String::from("prod"),
            superseded: SourceEvent::new("main", "c2"),
        }
    );

    approvals.approve().await.expect("gate listening");

    let report = reports.recv().await.expect("first report");
    assert_eq!(report.event.commit, "c1");
    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(report.applied.len(), 4);

    // c2 never runs; c3 finds nothing to do and skips the gate
    let report = reports.recv().await.expect("second report");
    assert_eq!(report.event.commit, "c3");
    assert!(report.succeeded(), "{:?}", report.error);
    assert!(report.applied.is_empty());

    dispatcher.shutdown().await;
    assert!(reports.recv().await.is_none());
    assert_eq!(store.commit_count().await, 1);
}

#[tokio::test]
async fn environments_do_not_wait_for_each_other() {
    let config = config(CIDR, 2);
    let recorder = Recorder::new();
    let staging_store = MemoryStateStore::new("staging");
    let prod_store = MemoryStateStore::new("prod");

    let router = BranchRouter::from_config(&config).expect("routes");
    let (mut dispatcher, mut reports) = PipelineDispatcher::new(router);
    let source = Arc::new(StaticConfigSource::new(config.clone()));

    let (prod_gate, prod_approvals) =
        gate_for(config.environment("prod").expect("prod declared"));
    let prod_approvals = prod_approvals.expect("prod is manual");
    let prod = EnvironmentPipeline::new(reconciler(&prod_store, &recorder), prod_gate, source.clone());
    let mut prod_states = prod.subscribe();
    dispatcher.spawn(prod);
    dispatcher.spawn(EnvironmentPipeline::new(
        reconciler(&staging_store, &recorder),
        Arc::new(AutoApprove),
        source,
    ));

    dispatcher.dispatch(SourceEvent::new("main", "p1")).await;
    prod_states
        .wait_for(|s| *s == PipelineState::AwaitingApproval)
        .await
        .expect("prod alive");

    dispatcher.dispatch(SourceEvent::new("develop", "s1")).await;
    let report = reports.recv().await.expect("staging report");
    assert_eq!(report.environment, "staging");
    assert!(report.succeeded(), "{:?}", report.error);
    assert!(prod_store.is_locked().await.expect("lock state"));

    prod_approvals.reject("change freeze").await.expect("gate listening");
    let report = reports.recv().await.expect("prod report");
    assert_eq!(report.environment, "prod");
    assert_eq!(report.state, PipelineState::Failed);
    assert!(prod_store.stored_snapshot().await.is_none());
    assert!(!prod_store.is_locked().await.expect("lock state"));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn failed_cycle_reports_partial_progress() {
    let config = config(CIDR, 2);
    let store = MemoryStateStore::new("staging");
    let recorder = Recorder::new();
    recorder.fail_on("app");
    let pipeline = EnvironmentPipeline::new(
        reconciler(&store, &recorder),
        Arc::new(AutoApprove),
        Arc::new(StaticConfigSource::new(config)),
    );

    let report = pipeline
        .run(
            SourceEvent::new("develop", "c1"),
            &tokio_util::sync::CancellationToken::new(),
        )
        .await;

    assert_eq!(report.state, PipelineState::Failed);
    let partial = report.partial.expect("partial detail");
    assert_eq!(partial.failed_module(), Some("app"));
    // declaration order breaks ties, so app runs before dns
    let applied: Vec<&str> = report.applied.iter().map(|s| s.module.as_str()).collect();
    assert_eq!(applied, vec!["network", "cluster"]);
    assert!(partial.remaining.contains(&String::from("dns")));

    let stored = store.stored_snapshot().await.expect("partial committed");
    assert_eq!(stored.module_names(), vec!["cluster", "network"]);
}

#[tokio::test]
async fn approval_slower_than_the_lock_ttl_still_commits() {
    let config = config(CIDR, 2);
    let store = MemoryStateStore::new("prod").with_lock_ttl(Duration::from_secs(1));
    let recorder = Recorder::new();
    let (gate, approvals) = ManualApproval::channel(Duration::from_secs(30));
    let pipeline = EnvironmentPipeline::new(
        reconciler(&store, &recorder),
        Arc::new(gate),
        Arc::new(StaticConfigSource::new(config.clone())),
    );
    let mut states = pipeline.subscribe();

    let router = BranchRouter::from_config(&config).expect("routes");
    let (mut dispatcher, mut reports) = PipelineDispatcher::new(router);
    dispatcher.spawn(pipeline);

    dispatcher.dispatch(SourceEvent::new("main", "c1")).await;
    states
        .wait_for(|s| *s == PipelineState::AwaitingApproval)
        .await
        .expect("pipeline alive");
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(store.is_locked().await.expect("lock state"));

    approvals.approve().await.expect("gate listening");
    let report = reports.recv().await.expect("report");
    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(report.applied.len(), 4);
    assert_eq!(store.commit_count().await, 1);
    assert!(!store.is_locked().await.expect("lock state"));

    dispatcher.shutdown().await;
}
