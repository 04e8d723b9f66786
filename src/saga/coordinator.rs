use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::SagaConfig;
use crate::error::{Result, SagaError};
use crate::log::SagaLog;
use crate::saga::controller::Saga;
use crate::saga::message::SagaMessage;
use crate::saga::state::SagaState;

/// How the caller intends to finish a recovered saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryType {
    /// Keep running forward tasks that have not completed.
    ForwardRecovery,
    /// Compensate every started task that has not been compensated.
    RollbackRecovery,
}

impl std::fmt::Display for RecoveryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryType::ForwardRecovery => write!(f, "forward"),
            RecoveryType::RollbackRecovery => write!(f, "rollback"),
        }
    }
}

/// Creates sagas and rebuilds them from their logged history.
#[derive(Clone)]
pub struct SagaCoordinator {
    log: Arc<dyn SagaLog>,
    config: SagaConfig,
}

impl std::fmt::Debug for SagaCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SagaCoordinator {
    pub fn new(log: Arc<dyn SagaLog>) -> Self {
        Self::with_config(log, SagaConfig::default())
    }

    pub fn with_config(log: Arc<dyn SagaLog>, config: SagaConfig) -> Self {
        Self { log, config }
    }

    pub fn log(&self) -> &Arc<dyn SagaLog> {
        &self.log
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    /// Starts a brand-new saga, logging `StartSaga` before returning.
    pub async fn make_saga(&self, saga_id: &str, job: Option<Vec<u8>>) -> Result<Saga> {
        Saga::new(saga_id, job, Arc::clone(&self.log), &self.config).await
    }

    /// Rebuilds a saga from its history and returns a live controller for it.
    ///
    /// With [`RecoveryType::RollbackRecovery`] a saga that is still running
    /// and not yet aborted is aborted first, so the caller can go straight to
    /// compensating tasks.
    pub async fn recover_saga_state(
        &self,
        saga_id: &str,
        recovery: RecoveryType,
    ) -> Result<Saga> {
        let messages = self.log.get_messages(saga_id).await?;
        let state = recover_state(saga_id, &messages)?;

        tracing::info!(
            saga_id,
            recovery = %recovery,
            messages = messages.len(),
            aborted = state.is_saga_aborted(),
            completed = state.is_saga_completed(),
            "Recovered saga state"
        );

        let needs_abort = recovery == RecoveryType::RollbackRecovery
            && !state.is_saga_aborted()
            && !state.is_saga_completed();

        let saga = Saga::rehydrate(state, Arc::clone(&self.log), &self.config);
        if needs_abort {
            saga.abort_saga().await?;
            tracing::info!(saga_id, "Aborted saga for rollback recovery");
        }
        Ok(saga)
    }

    /// Ids of sagas left unfinished by a previous run.
    pub async fn startup(&self) -> Result<Vec<String>> {
        let active = self.log.get_active_sagas().await?;
        tracing::info!(count = active.len(), "Found unfinished sagas");
        Ok(active)
    }
}

/// Replays a logged history into a state without spawning anything.
///
/// Any history that the state machine would not have produced is reported
/// as [`SagaError::CorruptedSagaLog`].
pub fn recover_state(saga_id: &str, messages: &[SagaMessage]) -> Result<SagaState> {
    if messages.is_empty() {
        return Err(SagaError::CorruptedSagaLog(format!(
            "saga {} has no logged messages",
            saga_id
        )));
    }

    if let Some(stray) = messages.iter().find(|m| m.saga_id != saga_id) {
        return Err(SagaError::CorruptedSagaLog(format!(
            "history of saga {} contains a message for saga {}",
            saga_id, stray.saga_id
        )));
    }

    SagaState::replay(messages).map_err(|e| {
        SagaError::CorruptedSagaLog(format!("cannot replay saga {}: {}", saga_id, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemorySagaLog;
    use crate::saga::state::TaskStatus;

    #[test]
    fn recover_state_rejects_empty_history() {
        let err = recover_state("job1", &[]).unwrap_err();
        assert!(matches!(err, SagaError::CorruptedSagaLog(_)));
    }

    #[test]
    fn recover_state_rejects_missing_start() {
        let history = vec![SagaMessage::start_task("job1", "t1", None)];
        let err = recover_state("job1", &history).unwrap_err();
        assert!(matches!(err, SagaError::CorruptedSagaLog(_)));
    }

    #[test]
    fn recover_state_rejects_foreign_messages() {
        let history = vec![
            SagaMessage::start_saga("job1", None),
            SagaMessage::start_task("job2", "t1", None),
        ];
        let err = recover_state("job1", &history).unwrap_err();
        assert!(matches!(err, SagaError::CorruptedSagaLog(_)));
    }

    #[test]
    fn recover_state_rejects_illegal_transitions() {
        let history = vec![
            SagaMessage::start_saga("job1", None),
            SagaMessage::end_task("job1", "t1", None),
        ];
        let err = recover_state("job1", &history).unwrap_err();
        assert!(matches!(err, SagaError::CorruptedSagaLog(_)));

        let history = vec![
            SagaMessage::start_saga("job1", None),
            SagaMessage::start_saga("job1", None),
        ];
        let err = recover_state("job1", &history).unwrap_err();
        assert!(matches!(err, SagaError::CorruptedSagaLog(_)));
    }

    #[tokio::test]
    async fn forward_recovery_logs_nothing() {
        let log = Arc::new(InMemorySagaLog::new());
        let coordinator = SagaCoordinator::new(log.clone());

        let saga = coordinator.make_saga("job1", None).await.unwrap();
        saga.start_task("t1", None).await.unwrap();
        drop(saga);

        let recovered = coordinator
            .recover_saga_state("job1", RecoveryType::ForwardRecovery)
            .await
            .unwrap();
        assert_eq!(recovered.state().await.task_status("t1"), TaskStatus::TaskStarted);
        assert_eq!(log.get_messages("job1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rollback_recovery_aborts_running_saga() {
        let log = Arc::new(InMemorySagaLog::new());
        let coordinator = SagaCoordinator::new(log.clone());

        let saga = coordinator.make_saga("job1", None).await.unwrap();
        saga.start_task("t1", None).await.unwrap();
        drop(saga);

        let recovered = coordinator
            .recover_saga_state("job1", RecoveryType::RollbackRecovery)
            .await
            .unwrap();
        let state = recovered.state().await;
        assert!(state.is_saga_aborted());
        assert_eq!(state.uncompensated_tasks(), vec!["t1"]);

        recovered.start_compensating_task("t1", None).await.unwrap();
        recovered.end_compensating_task("t1", None).await.unwrap();
        recovered.end_saga().await.unwrap();
        assert!(coordinator.startup().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recovering_unknown_saga_is_corruption() {
        let coordinator = SagaCoordinator::new(Arc::new(InMemorySagaLog::new()));
        let err = coordinator
            .recover_saga_state("missing", RecoveryType::ForwardRecovery)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::CorruptedSagaLog(_)));
    }
}
