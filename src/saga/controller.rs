use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::config::SagaConfig;
use crate::error::{Result, SagaError};
use crate::log::SagaLog;
use crate::saga::message::SagaMessage;
use crate::saga::state::SagaState;

/// Request for the saga's update loop
#[derive(Debug)]
struct SagaUpdate {
    message: SagaMessage,
    response_tx: oneshot::Sender<Result<()>>,
}

/// Handle to a running saga.
///
/// Every update is validated against the current state, durably logged and
/// only then published, one at a time and in the order callers were
/// admitted. Handles are cheap to clone; all clones feed the same loop.
#[derive(Debug, Clone)]
pub struct Saga {
    id: String,
    state: Arc<RwLock<SagaState>>,
    update_tx: mpsc::Sender<SagaUpdate>,
}

impl Saga {
    /// Logs `StartSaga` and starts the saga's update loop.
    ///
    /// Nothing is returned if the log rejects the start; the caller owns the
    /// retry decision (see [`fatal_err`](crate::error::fatal_err)).
    pub async fn new(
        saga_id: impl Into<String>,
        job: Option<Vec<u8>>,
        log: Arc<dyn SagaLog>,
        config: &SagaConfig,
    ) -> Result<Saga> {
        let state = SagaState::new(saga_id, job)?;
        log.start_saga(state.saga_id(), state.job()).await?;
        tracing::info!(saga_id = %state.saga_id(), "Started saga");
        Ok(Self::spawn(state, log, config))
    }

    /// Wraps an already reconstructed state without logging anything.
    ///
    /// A completed saga gets no update loop; every update on it fails.
    /// Must be called from within a tokio runtime.
    pub fn rehydrate(state: SagaState, log: Arc<dyn SagaLog>, config: &SagaConfig) -> Saga {
        tracing::debug!(
            saga_id = %state.saga_id(),
            completed = state.is_saga_completed(),
            "Rehydrating saga"
        );
        Self::spawn(state, log, config)
    }

    fn spawn(state: SagaState, log: Arc<dyn SagaLog>, config: &SagaConfig) -> Saga {
        let (update_tx, update_rx) = mpsc::channel(config.update_queue_capacity.max(1));
        let id = state.saga_id().to_string();
        let completed = state.is_saga_completed();
        let state = Arc::new(RwLock::new(state));

        if !completed {
            let actor = SagaActor {
                state: Arc::clone(&state),
                log,
            };
            tokio::spawn(actor.run(update_rx));
        }

        Saga {
            id,
            state,
            update_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the current state.
    pub async fn state(&self) -> SagaState {
        self.state.read().await.clone()
    }

    pub async fn end_saga(&self) -> Result<()> {
        self.update(SagaMessage::end_saga(&self.id)).await
    }

    /// Aborting twice is a no-op.
    pub async fn abort_saga(&self) -> Result<()> {
        self.update(SagaMessage::abort_saga(&self.id)).await
    }

    pub async fn start_task(&self, task_id: &str, data: Option<Vec<u8>>) -> Result<()> {
        self.update(SagaMessage::start_task(&self.id, task_id, data))
            .await
    }

    pub async fn end_task(&self, task_id: &str, results: Option<Vec<u8>>) -> Result<()> {
        self.update(SagaMessage::end_task(&self.id, task_id, results))
            .await
    }

    pub async fn start_compensating_task(
        &self,
        task_id: &str,
        data: Option<Vec<u8>>,
    ) -> Result<()> {
        self.update(SagaMessage::start_comp_task(&self.id, task_id, data))
            .await
    }

    pub async fn end_compensating_task(
        &self,
        task_id: &str,
        results: Option<Vec<u8>>,
    ) -> Result<()> {
        self.update(SagaMessage::end_comp_task(&self.id, task_id, results))
            .await
    }

    async fn update(&self, message: SagaMessage) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        let msg_type = message.msg_type;

        if self
            .update_tx
            .send(SagaUpdate {
                message,
                response_tx,
            })
            .await
            .is_err()
        {
            return Err(self.completed_err(msg_type));
        }

        // the loop drops queued updates when it exits after EndSaga
        response_rx
            .await
            .unwrap_or_else(|_| Err(self.completed_err(msg_type)))
    }

    fn completed_err(&self, msg_type: impl std::fmt::Display) -> SagaError {
        SagaError::InvalidSagaState(format!(
            "saga {} already completed, cannot apply {}",
            self.id, msg_type
        ))
    }
}

/// Single writer of a saga's published state.
struct SagaActor {
    state: Arc<RwLock<SagaState>>,
    log: Arc<dyn SagaLog>,
}

impl SagaActor {
    async fn run(self, mut update_rx: mpsc::Receiver<SagaUpdate>) {
        while let Some(update) = update_rx.recv().await {
            let result = self.handle(&update.message).await;
            let completed = result.is_ok() && self.state.read().await.is_saga_completed();
            let _ = update.response_tx.send(result);

            if completed {
                tracing::info!(
                    saga_id = %update.message.saga_id,
                    "Saga completed, stopping update loop"
                );
                break;
            }
        }
    }

    async fn handle(&self, message: &SagaMessage) -> Result<()> {
        // only this task writes, so the snapshot cannot go stale
        let mut next = self.state.read().await.clone();
        next.validate(message)?;
        next.apply(message);

        if let Err(e) = self.log.log_message(message).await {
            tracing::warn!(
                saga_id = %message.saga_id,
                msg_type = %message.msg_type,
                task_id = message.task_id.as_deref().unwrap_or(""),
                error = %e,
                fatal = e.is_fatal(),
                "Failed to log saga message"
            );
            return Err(e);
        }

        *self.state.write().await = next;
        tracing::debug!(
            saga_id = %message.saga_id,
            msg_type = %message.msg_type,
            task_id = message.task_id.as_deref().unwrap_or(""),
            "Applied saga message"
        );
        Ok(())
    }
}
