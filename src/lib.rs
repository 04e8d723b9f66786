pub mod config;
pub mod error;
pub mod log;
pub mod saga;

pub use config::{SagaConfig, SagaLogConfig};
pub use error::{fatal_err, Result, SagaError};
pub use log::{FileSagaLog, InMemorySagaLog, LogRecord, SagaLog};
pub use saga::{
    recover_state, RecoveryType, Saga, SagaCoordinator, SagaMessage, SagaMessageType, SagaState,
    TaskStatus,
};
