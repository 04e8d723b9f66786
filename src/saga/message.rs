use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};

/// The closed set of message kinds that can appear in a saga log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaMessageType {
    StartSaga,
    StartTask,
    EndTask,
    StartCompensatingTask,
    EndCompensatingTask,
    AbortSaga,
    EndSaga,
}

impl SagaMessageType {
    /// Task-level messages must name a task; saga-level ones must not.
    pub fn is_task_message(&self) -> bool {
        matches!(
            self,
            SagaMessageType::StartTask
                | SagaMessageType::EndTask
                | SagaMessageType::StartCompensatingTask
                | SagaMessageType::EndCompensatingTask
        )
    }
}

impl std::fmt::Display for SagaMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SagaMessageType::StartSaga => write!(f, "StartSaga"),
            SagaMessageType::StartTask => write!(f, "StartTask"),
            SagaMessageType::EndTask => write!(f, "EndTask"),
            SagaMessageType::StartCompensatingTask => write!(f, "StartCompTask"),
            SagaMessageType::EndCompensatingTask => write!(f, "EndCompTask"),
            SagaMessageType::AbortSaga => write!(f, "AbortSaga"),
            SagaMessageType::EndSaga => write!(f, "EndSaga"),
        }
    }
}

/// A single immutable entry in a saga's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaMessage {
    pub saga_id: String,
    pub msg_type: SagaMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

impl SagaMessage {
    pub fn start_saga(saga_id: impl Into<String>, job: Option<Vec<u8>>) -> Self {
        Self::saga_level(saga_id, SagaMessageType::StartSaga, job)
    }

    pub fn end_saga(saga_id: impl Into<String>) -> Self {
        Self::saga_level(saga_id, SagaMessageType::EndSaga, None)
    }

    pub fn abort_saga(saga_id: impl Into<String>) -> Self {
        Self::saga_level(saga_id, SagaMessageType::AbortSaga, None)
    }

    pub fn start_task(
        saga_id: impl Into<String>,
        task_id: impl Into<String>,
        data: Option<Vec<u8>>,
    ) -> Self {
        Self::task_level(saga_id, SagaMessageType::StartTask, task_id, data)
    }

    pub fn end_task(
        saga_id: impl Into<String>,
        task_id: impl Into<String>,
        results: Option<Vec<u8>>,
    ) -> Self {
        Self::task_level(saga_id, SagaMessageType::EndTask, task_id, results)
    }

    pub fn start_comp_task(
        saga_id: impl Into<String>,
        task_id: impl Into<String>,
        data: Option<Vec<u8>>,
    ) -> Self {
        Self::task_level(saga_id, SagaMessageType::StartCompensatingTask, task_id, data)
    }

    pub fn end_comp_task(
        saga_id: impl Into<String>,
        task_id: impl Into<String>,
        results: Option<Vec<u8>>,
    ) -> Self {
        Self::task_level(saga_id, SagaMessageType::EndCompensatingTask, task_id, results)
    }

    fn saga_level(
        saga_id: impl Into<String>,
        msg_type: SagaMessageType,
        data: Option<Vec<u8>>,
    ) -> Self {
        Self {
            saga_id: saga_id.into(),
            msg_type,
            task_id: None,
            data,
        }
    }

    fn task_level(
        saga_id: impl Into<String>,
        msg_type: SagaMessageType,
        task_id: impl Into<String>,
        data: Option<Vec<u8>>,
    ) -> Self {
        Self {
            saga_id: saga_id.into(),
            msg_type,
            task_id: Some(task_id.into()),
            data,
        }
    }

    /// Checks the static shape of the message, independent of any saga state.
    pub fn validate_shape(&self) -> Result<()> {
        validate_saga_id(&self.saga_id)?;

        match (&self.task_id, self.msg_type.is_task_message()) {
            (Some(task_id), true) => validate_task_id(task_id),
            (None, true) => Err(SagaError::InvalidSagaMessage(format!(
                "{} message for saga {} is missing a task id",
                self.msg_type, self.saga_id
            ))),
            (Some(task_id), false) => Err(SagaError::InvalidSagaMessage(format!(
                "{} message for saga {} must not carry a task id (got {})",
                self.msg_type, self.saga_id, task_id
            ))),
            (None, false) => Ok(()),
        }
    }

    /// The task id of a task-level message. Callers must have validated the shape.
    pub(crate) fn task_id_or_err(&self) -> Result<&str> {
        self.task_id.as_deref().ok_or_else(|| {
            SagaError::InvalidSagaMessage(format!(
                "{} message for saga {} is missing a task id",
                self.msg_type, self.saga_id
            ))
        })
    }
}

pub(crate) fn validate_saga_id(saga_id: &str) -> Result<()> {
    if saga_id.is_empty() {
        return Err(SagaError::InvalidSagaMessage(
            "saga id must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_task_id(task_id: &str) -> Result<()> {
    if task_id.is_empty() {
        return Err(SagaError::InvalidSagaMessage(
            "task id must not be empty".to_string(),
        ));
    }
    Ok(())
}
