//! Test harness for saga integration tests.
//!
//! Provides an instrumented saga log that counts calls and can inject
//! transient append failures, plus helpers for building coordinators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use saga_lite::config::SagaConfig;
use saga_lite::error::{Result, SagaError};
use saga_lite::log::{InMemorySagaLog, SagaLog};
use saga_lite::saga::{SagaCoordinator, SagaMessage, SagaMessageType};

/// In-memory saga log that records how often it is called and can be told
/// to fail upcoming appends.
#[derive(Default)]
pub struct TestSagaLog {
    inner: InMemorySagaLog,
    start_calls: AtomicUsize,
    append_calls: AtomicUsize,
    failing_appends: AtomicUsize,
    append_delay_ms: AtomicUsize,
}

#[allow(dead_code)]
impl TestSagaLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` appends fail with a retryable error and store nothing.
    pub fn fail_next_appends(&self, n: usize) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// Delay every append, widening the window for concurrent callers.
    pub fn set_append_delay(&self, delay: Duration) {
        self.append_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.start_calls() + self.append_calls()
    }

    pub fn inner(&self) -> &InMemorySagaLog {
        &self.inner
    }
}

#[async_trait]
impl SagaLog for TestSagaLog {
    async fn start_saga(&self, saga_id: &str, job: Option<&[u8]>) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.start_saga(saga_id, job).await
    }

    async fn log_message(&self, msg: &SagaMessage) -> Result<()> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.append_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        let injected = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SagaError::InternalLog(format!(
                "injected failure appending {} to saga {}",
                msg.msg_type, msg.saga_id
            )));
        }

        self.inner.log_message(msg).await
    }

    async fn get_messages(&self, saga_id: &str) -> Result<Vec<SagaMessage>> {
        self.inner.get_messages(saga_id).await
    }

    async fn get_active_sagas(&self) -> Result<Vec<String>> {
        self.inner.get_active_sagas().await
    }
}

/// Coordinator over a fresh instrumented log
#[allow(dead_code)]
pub fn test_coordinator() -> (SagaCoordinator, Arc<TestSagaLog>) {
    test_coordinator_with_config(SagaConfig::default())
}

#[allow(dead_code)]
pub fn test_coordinator_with_config(config: SagaConfig) -> (SagaCoordinator, Arc<TestSagaLog>) {
    let log = TestSagaLog::new();
    let coordinator = SagaCoordinator::with_config(log.clone(), config);
    (coordinator, log)
}

/// Message types of a history, in order
#[allow(dead_code)]
pub fn msg_types(messages: &[SagaMessage]) -> Vec<SagaMessageType> {
    messages.iter().map(|m| m.msg_type).collect()
}
