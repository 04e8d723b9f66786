//! Durable, append-only storage for saga messages.
//!
//! The engine only talks to storage through the [`SagaLog`] trait, so any
//! backend that can append records per saga and read them back in order can
//! be plugged in via [`SagaCoordinator::new`](crate::saga::SagaCoordinator::new).
//!
//! # Backends
//!
//! - [`InMemorySagaLog`]: process-local reference implementation, used by tests
//!   and single-process demos.
//! - [`FileSagaLog`]: one append-only JSON-lines file per saga, synced on
//!   every append.
//!
//! # Append rules
//!
//! Every backend enforces the same storage-level rules:
//! 1. `StartSaga` is only recorded through [`SagaLog::start_saga`]. Repeating it
//!    with the same payload while the saga holds nothing else is a no-op.
//! 2. Other messages are only accepted for a started saga that has not
//!    recorded `EndSaga`.
//! 3. Records carry a per-saga sequence number so history replays in the
//!    order it was written.

pub mod file;
pub mod memory;

pub use file::FileSagaLog;
pub use memory::InMemorySagaLog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::saga::message::{SagaMessage, SagaMessageType};

/// Storage backend for saga histories.
#[async_trait]
pub trait SagaLog: Send + Sync {
    /// Durably records the `StartSaga` message of a new saga.
    async fn start_saga(&self, saga_id: &str, job: Option<&[u8]>) -> Result<()>;

    /// Durably appends a message to a started, not yet ended saga.
    async fn log_message(&self, msg: &SagaMessage) -> Result<()>;

    /// Full ordered history of a saga. Unknown sagas have an empty history.
    async fn get_messages(&self, saga_id: &str) -> Result<Vec<SagaMessage>>;

    /// Ids of sagas that have not recorded `EndSaga`, sorted.
    async fn get_active_sagas(&self) -> Result<Vec<String>>;
}

/// A stored message together with its position in the saga's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub seq: u64,
    pub logged_at: DateTime<Utc>,
    pub message: SagaMessage,
}

impl LogRecord {
    pub fn new(seq: u64, message: SagaMessage) -> Self {
        Self {
            seq,
            logged_at: Utc::now(),
            message,
        }
    }
}

/// What a backend should do with a `start_saga` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartDisposition {
    Write,
    AlreadyStarted,
}

/// Decides how to handle `start_saga` given the first record (if any) and the
/// total number of records already stored for the saga.
pub(crate) fn start_disposition(
    saga_id: &str,
    job: Option<&[u8]>,
    first: Option<&SagaMessage>,
    len: usize,
) -> Result<StartDisposition> {
    let Some(first) = first else {
        return Ok(StartDisposition::Write);
    };

    if len == 1 && first.msg_type == SagaMessageType::StartSaga && first.data.as_deref() == job {
        return Ok(StartDisposition::AlreadyStarted);
    }

    Err(SagaError::InvalidRequest(format!(
        "saga {} already started",
        saga_id
    )))
}

/// Checks that `msg` may be appended to a history whose last message is `last`.
pub(crate) fn check_append(msg: &SagaMessage, last: Option<&SagaMessage>) -> Result<()> {
    msg.validate_shape()
        .map_err(|e| SagaError::InvalidRequest(e.to_string()))?;

    if msg.msg_type == SagaMessageType::StartSaga {
        return Err(SagaError::InvalidRequest(format!(
            "StartSaga for saga {} must be recorded with start_saga",
            msg.saga_id
        )));
    }

    match last {
        None => Err(SagaError::InvalidSagaState(format!(
            "cannot log {} for saga {}: saga never started",
            msg.msg_type, msg.saga_id
        ))),
        Some(last) if last.msg_type == SagaMessageType::EndSaga => {
            Err(SagaError::InvalidSagaState(format!(
                "cannot log {} for saga {}: saga already ended",
                msg.msg_type, msg.saga_id
            )))
        }
        Some(_) => Ok(()),
    }
}
