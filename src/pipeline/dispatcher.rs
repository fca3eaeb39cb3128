//! Routes events to per-environment workers.
//!
//! Each environment gets one worker task with a single-slot mailbox. While
//! a cycle runs, newer events overwrite the slot, so when the environment
//! becomes free only the latest event is run. Environments never wait on
//! each other.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::controller::{CycleReport, EnvironmentPipeline};
use super::routing::BranchRouter;
use super::source::SourceEvent;

/// What happened to a dispatched event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Dispatch {
    /// No environment is triggered by the event's branch.
    Ignored,
    /// The event will run next.
    Queued {
        /// Target environment.
        environment: String,
    },
    /// The event replaced a pending one, which will never run.
    Coalesced {
        /// Target environment.
        environment: String,
        /// The dropped event.
        superseded: SourceEvent,
    },
}

#[derive(Debug, Default)]
struct Mailbox {
    slot: Mutex<Option<SourceEvent>>,
    notify: Notify,
}

struct Worker {
    mailbox: Arc<Mailbox>,
    handle: JoinHandle<()>,
}

/// Fans events out to environment pipelines.
pub struct PipelineDispatcher {
    router: BranchRouter,
    workers: BTreeMap<String, Worker>,
    shutdown: CancellationToken,
    closing: CancellationToken,
    reports: mpsc::UnboundedSender<CycleReport>,
}

impl std::fmt::Debug for PipelineDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDispatcher")
            .field("router", &self.router)
            .field("environments", &self.workers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PipelineDispatcher {
    /// Creates a dispatcher and the receiver for cycle reports.
    #[must_use]
    pub fn new(router: BranchRouter) -> (Self, mpsc::UnboundedReceiver<CycleReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        (
            Self {
                router,
                workers: BTreeMap::new(),
                shutdown: CancellationToken::new(),
                closing: CancellationToken::new(),
                reports,
            },
            rx,
        )
    }

    /// Starts the worker for a pipeline's environment.
    ///
    /// Replaces (and stops) any previous worker for the same environment.
    pub fn spawn(&mut self, pipeline: EnvironmentPipeline) {
        let environment = pipeline.environment().to_string();
        let mailbox = Arc::new(Mailbox::default());
        let signals = WorkerSignals {
            shutdown: self.shutdown.child_token(),
            closing: self.closing.clone(),
        };
        let reports = self.reports.clone();

        info!(environment = %environment, "Starting pipeline worker");
        let handle = tokio::spawn(run_worker(pipeline, Arc::clone(&mailbox), signals, reports));

        if let Some(previous) = self.workers.insert(environment, Worker { mailbox, handle }) {
            previous.handle.abort();
        }
    }

    /// Routes an event.
    pub async fn dispatch(&self, event: SourceEvent) -> Dispatch {
        let Some(environment) = self.router.route(&event.branch) else {
            debug!(branch = %event.branch, "No environment for branch");
            return Dispatch::Ignored;
        };
        let Some(worker) = self.workers.get(environment) else {
            warn!(environment, "Branch routes to an environment with no worker");
            return Dispatch::Ignored;
        };

        let superseded = worker.mailbox.slot.lock().await.replace(event);
        worker.mailbox.notify.notify_one();

        let environment = environment.to_string();
        match superseded {
            Some(superseded) => {
                info!(%environment, %superseded, "Event superseded");
                Dispatch::Coalesced {
                    environment,
                    superseded,
                }
            }
            None => Dispatch::Queued { environment },
        }
    }

    /// Token cancelled on shutdown; cycles in flight observe it between steps.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Stops every worker after its current cycle halts.
    ///
    /// Pending events are dropped.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    /// Lets every worker finish its current and pending cycles, then stops.
    pub async fn drain(self) {
        self.closing.cancel();
        self.join().await;
    }

    async fn join(self) {
        for (environment, worker) in self.workers {
            if let Err(err) = worker.handle.await {
                warn!(%environment, "Pipeline worker ended abnormally: {err}");
            }
        }
    }
}

struct WorkerSignals {
    shutdown: CancellationToken,
    closing: CancellationToken,
}

async fn run_worker(
    pipeline: EnvironmentPipeline,
    mailbox: Arc<Mailbox>,
    signals: WorkerSignals,
    reports: mpsc::UnboundedSender<CycleReport>,
) {
    let WorkerSignals { shutdown, closing } = signals;
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            () = mailbox.notify.notified() => {}
            () = closing.cancelled() => {}
        }

        loop {
            let Some(event) = mailbox.slot.lock().await.take() else {
                break;
            };
            let report = pipeline.run(event, &shutdown).await;
            if reports.send(report).is_err() {
                debug!(environment = pipeline.environment(), "Report receiver dropped");
            }
            if shutdown.is_cancelled() {
                break;
            }
        }

        if closing.is_cancelled() || shutdown.is_cancelled() {
            break;
        }
    }
    debug!(environment = pipeline.environment(), "Pipeline worker stopped");
}
