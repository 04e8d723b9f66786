use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::log::{check_append, start_disposition, LogRecord, SagaLog, StartDisposition};
use crate::saga::message::{SagaMessage, SagaMessageType};

/// Process-local saga log. Nothing survives a restart; meant for tests and
/// single-process runs.
#[derive(Debug, Default)]
pub struct InMemorySagaLog {
    sagas: RwLock<HashMap<String, Vec<LogRecord>>>,
}

impl InMemorySagaLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored records of a saga, including sequence numbers.
    pub async fn records(&self, saga_id: &str) -> Vec<LogRecord> {
        self.sagas
            .read()
            .await
            .get(saga_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SagaLog for InMemorySagaLog {
    async fn start_saga(&self, saga_id: &str, job: Option<&[u8]>) -> Result<()> {
        let msg = SagaMessage::start_saga(saga_id, job.map(<[u8]>::to_vec));
        msg.validate_shape()?;

        let mut sagas = self.sagas.write().await;
        let records = sagas.entry(saga_id.to_string()).or_default();

        match start_disposition(
            saga_id,
            job,
            records.first().map(|r| &r.message),
            records.len(),
        )? {
            StartDisposition::AlreadyStarted => {
                tracing::debug!(saga_id, "StartSaga already recorded, ignoring repeat");
            }
            StartDisposition::Write => {
                records.push(LogRecord::new(0, msg));
                tracing::debug!(saga_id, "Recorded StartSaga");
            }
        }
        Ok(())
    }

    async fn log_message(&self, msg: &SagaMessage) -> Result<()> {
        let mut sagas = self.sagas.write().await;
        let records = sagas.get_mut(&msg.saga_id);
        let last = records.as_ref().and_then(|r| r.last()).map(|r| &r.message);
        check_append(msg, last)?;

        // check_append rejects unknown sagas, so records is present here
        if let Some(records) = records {
            let seq = records.len() as u64;
            records.push(LogRecord::new(seq, msg.clone()));
            tracing::trace!(
                saga_id = %msg.saga_id,
                seq,
                msg_type = %msg.msg_type,
                "Appended saga message"
            );
        }
        Ok(())
    }

    async fn get_messages(&self, saga_id: &str) -> Result<Vec<SagaMessage>> {
        Ok(self
            .sagas
            .read()
            .await
            .get(saga_id)
            .map(|records| records.iter().map(|r| r.message.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_active_sagas(&self) -> Result<Vec<String>> {
        let sagas = self.sagas.read().await;
        let mut active: Vec<String> = sagas
            .iter()
            .filter(|(_, records)| {
                !records.is_empty()
                    && records.last().map(|r| r.message.msg_type) != Some(SagaMessageType::EndSaga)
            })
            .map(|(id, _)| id.clone())
            .collect();
        active.sort();
        Ok(active)
    }
}
