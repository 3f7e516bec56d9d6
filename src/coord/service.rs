//! Async boundary around the lifecycle controller
//!
//! The controller is owned by a single tokio task. Callers talk to it through
//! a cloneable [`ServiceHandle`] that sends commands over an mpsc channel and
//! waits for the oneshot reply, so ticks are applied one at a time in the
//! order they arrive.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::core::errors::{Result, SeqHookError};
use crate::entity::SequenceId;

use super::controller::LifecycleController;
use super::snapshot::Snapshot;
use super::stats::ControllerStats;
use super::types::{RootSpec, SequenceOutput, TickReport};

/// Commands accepted by the service task
pub enum ServiceCommand {
    Tick {
        outputs: Vec<SequenceOutput>,
        reply: oneshot::Sender<TickReport>,
    },
    RegisterRoot {
        spec: RootSpec,
        reply: oneshot::Sender<Result<SequenceId>>,
    },
    Cancel {
        seq_id: SequenceId,
        reply: oneshot::Sender<Result<TickReport>>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Stats {
        reply: oneshot::Sender<ControllerStats>,
    },
    Checkpoint {
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Shutdown,
}

/// Spawns the controller task
pub struct LifecycleService;

impl LifecycleService {
    /// Move `controller` into a tokio task. The join handle yields the
    /// controller back once every handle is dropped or `shutdown` is called.
    pub fn spawn(controller: LifecycleController, capacity: usize) -> (ServiceHandle, JoinHandle<LifecycleController>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(run(controller, rx));
        (ServiceHandle { tx }, task)
    }
}

async fn run(mut controller: LifecycleController, mut rx: mpsc::Receiver<ServiceCommand>) -> LifecycleController {
    info!("Lifecycle service started");
    while let Some(cmd) = rx.recv().await {
        match cmd {
            ServiceCommand::Tick { outputs, reply } => {
                let report = controller.tick(&outputs);
                let _ = reply.send(report);
            }
            ServiceCommand::RegisterRoot { spec, reply } => {
                let _ = reply.send(controller.register_root(spec));
            }
            ServiceCommand::Cancel { seq_id, reply } => {
                let _ = reply.send(controller.cancel(seq_id));
            }
            ServiceCommand::Snapshot { reply } => {
                let _ = reply.send(controller.snapshot());
            }
            ServiceCommand::Stats { reply } => {
                let _ = reply.send(controller.stats());
            }
            ServiceCommand::Checkpoint { reply } => {
                let _ = reply.send(controller.state().to_bytes());
            }
            ServiceCommand::Shutdown => {
                debug!("Lifecycle service received shutdown");
                break;
            }
        }
    }
    info!("Lifecycle service stopped");
    controller
}

/// Cloneable client of the service task
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<ServiceCommand>,
}

impl ServiceHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> ServiceCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SeqHookError::channel("lifecycle", "service task has stopped"))?;
        rx.await
            .map_err(|_| SeqHookError::channel("lifecycle", "service dropped the reply"))
    }

    pub async fn tick(&self, outputs: Vec<SequenceOutput>) -> Result<TickReport> {
        self.request(|reply| ServiceCommand::Tick { outputs, reply }).await
    }

    pub async fn register_root(&self, spec: RootSpec) -> Result<SequenceId> {
        self.request(|reply| ServiceCommand::RegisterRoot { spec, reply }).await?
    }

    pub async fn cancel(&self, seq_id: SequenceId) -> Result<TickReport> {
        self.request(|reply| ServiceCommand::Cancel { seq_id, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(|reply| ServiceCommand::Snapshot { reply }).await
    }

    pub async fn stats(&self) -> Result<ControllerStats> {
        self.request(|reply| ServiceCommand::Stats { reply }).await
    }

    /// Bincode checkpoint of the controller state
    pub async fn checkpoint(&self) -> Result<Vec<u8>> {
        self.request(|reply| ServiceCommand::Checkpoint { reply }).await?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(ServiceCommand::Shutdown)
            .await
            .map_err(|_| SeqHookError::channel("lifecycle", "service task has stopped"))
    }
}
