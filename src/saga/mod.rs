//! The saga state machine and the controllers that drive it.
//!
//! A saga moves through `StartSaga`, any number of task messages, optionally
//! `AbortSaga` followed by compensation, and finally `EndSaga`. [`SagaState`]
//! decides which message may come next; [`Saga`] serializes updates for one
//! saga and only publishes a change once it is durable in the [`SagaLog`];
//! [`SagaCoordinator`] creates sagas and rebuilds them after a restart.
//!
//! [`SagaLog`]: crate::log::SagaLog

pub mod controller;
pub mod coordinator;
pub mod message;
pub mod state;

pub use controller::Saga;
pub use coordinator::{recover_state, RecoveryType, SagaCoordinator};
pub use message::{SagaMessage, SagaMessageType};
pub use state::{SagaState, TaskRecord, TaskStatus};
