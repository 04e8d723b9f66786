use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Result, SagaError};
use crate::log::{check_append, start_disposition, LogRecord, SagaLog, StartDisposition};
use crate::saga::message::{SagaMessage, SagaMessageType};

const LOG_EXTENSION: &str = "jsonl";

type Slot = Arc<Mutex<Option<Cursor>>>;

/// Tail of one saga's file, cached so appends don't re-read the history.
#[derive(Debug, Clone)]
struct Cursor {
    next_seq: u64,
    /// Bytes covered by acknowledged records; anything past this is a torn write.
    durable_len: u64,
    first: Option<SagaMessage>,
    last: Option<SagaMessage>,
}

impl Cursor {
    fn from_log(log: &LogFile) -> Self {
        Self {
            next_seq: log.records.len() as u64,
            durable_len: log.durable_len,
            first: log.records.first().map(|r| r.message.clone()),
            last: log.records.last().map(|r| r.message.clone()),
        }
    }

    fn push(&mut self, message: &SagaMessage, line_len: usize) {
        if self.first.is_none() {
            self.first = Some(message.clone());
        }
        self.last = Some(message.clone());
        self.next_seq += 1;
        self.durable_len += line_len as u64;
    }

    /// Nothing more can be appended: the saga never started or has ended.
    fn is_retired(&self) -> bool {
        self.next_seq == 0
            || self.last.as_ref().map(|m| m.msg_type) == Some(SagaMessageType::EndSaga)
    }
}

/// Acknowledged contents of one saga file.
#[derive(Debug, Default)]
struct LogFile {
    records: Vec<LogRecord>,
    durable_len: u64,
}

/// Saga log backed by one append-only JSON-lines file per saga.
///
/// Each line is a [`LogRecord`]. Appends are written, flushed and synced
/// before the call returns; a failed append is cut back off the file. A final
/// line without its newline was never acknowledged, so readers skip it and
/// the next append overwrites it.
///
/// Appends to the same saga are serialized; different sagas never wait on
/// each other. Cached cursors are only kept for sagas that can still grow.
#[derive(Debug)]
pub struct FileSagaLog {
    dir: PathBuf,
    cursors: Mutex<HashMap<String, Slot>>,
}

impl FileSagaLog {
    /// Opens (creating if needed) a log rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        tracing::info!(dir = %dir.display(), "Opened file saga log");
        Ok(Self {
            dir,
            cursors: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stored records of a saga, including sequence numbers and timestamps.
    pub async fn records(&self, saga_id: &str) -> Result<Vec<LogRecord>> {
        let path = self.path_for(saga_id)?;
        Ok(read_log(saga_id, &path).await?.records)
    }

    fn path_for(&self, saga_id: &str) -> Result<PathBuf> {
        let usable = !saga_id.is_empty()
            && !saga_id.starts_with('.')
            && !saga_id.contains(&['/', '\\', '\0'][..]);
        if !usable {
            return Err(SagaError::InvalidRequest(format!(
                "saga id {:?} cannot be stored by the file log",
                saga_id
            )));
        }
        Ok(self.dir.join(format!("{}.{}", saga_id, LOG_EXTENSION)))
    }

    async fn cursor_slot(&self, saga_id: &str) -> Slot {
        self.cursors
            .lock()
            .await
            .entry(saga_id.to_string())
            .or_default()
            .clone()
    }

    async fn existing_slot(&self, saga_id: &str) -> Option<Slot> {
        self.cursors.lock().await.get(saga_id).cloned()
    }

    /// Forgets a saga's cursor unless another caller is still using it.
    async fn release_slot(&self, saga_id: &str, slot: &Slot) {
        let mut cursors = self.cursors.lock().await;
        let ours = cursors.get(saga_id).is_some_and(|s| Arc::ptr_eq(s, slot));
        // one reference in the map, one held by the caller
        if ours && Arc::strong_count(slot) == 2 {
            cursors.remove(saga_id);
        }
    }

    async fn start_locked(
        saga_id: &str,
        job: Option<&[u8]>,
        path: &Path,
        slot: &mut Option<Cursor>,
        msg: SagaMessage,
    ) -> Result<()> {
        let cursor = Self::load_cursor(saga_id, path, slot).await?;
        let disposition =
            start_disposition(saga_id, job, cursor.first.as_ref(), cursor.next_seq as usize)?;
        match disposition {
            StartDisposition::AlreadyStarted => {
                tracing::debug!(saga_id, "StartSaga already recorded, ignoring repeat");
            }
            StartDisposition::Write => {
                Self::append(path, slot, cursor, msg).await?;
                tracing::debug!(saga_id, path = %path.display(), "Recorded StartSaga");
            }
        }
        Ok(())
    }

    async fn append_locked(msg: &SagaMessage, path: &Path, slot: &mut Option<Cursor>) -> Result<()> {
        let cursor = Self::load_cursor(&msg.saga_id, path, slot).await?;
        check_append(msg, cursor.last.as_ref())?;

        let seq = cursor.next_seq;
        Self::append(path, slot, cursor, msg.clone()).await?;
        tracing::trace!(
            saga_id = %msg.saga_id,
            seq,
            msg_type = %msg.msg_type,
            "Appended saga message"
        );
        Ok(())
    }

    async fn load_cursor(saga_id: &str, path: &Path, slot: &mut Option<Cursor>) -> Result<Cursor> {
        if let Some(cursor) = slot.as_ref() {
            return Ok(cursor.clone());
        }
        let log = read_log(saga_id, path).await?;
        let cursor = Cursor::from_log(&log);
        *slot = Some(cursor.clone());
        Ok(cursor)
    }

    /// Appends one record. On failure the cached cursor is dropped so the
    /// next call re-reads the file.
    async fn append(
        path: &Path,
        slot: &mut Option<Cursor>,
        mut cursor: Cursor,
        message: SagaMessage,
    ) -> Result<()> {
        let record = LogRecord::new(cursor.next_seq, message);
        let mut line = serde_json::to_vec(&record).map_err(|e| {
            SagaError::InvalidRequest(format!("cannot encode saga message: {}", e))
        })?;
        line.push(b'\n');

        match write_record(path, cursor.durable_len, &line).await {
            Ok(()) => {
                cursor.push(&record.message, line.len());
                *slot = Some(cursor);
                Ok(())
            }
            Err(e) => {
                *slot = None;
                tracing::warn!(
                    path = %path.display(),
                    seq = record.seq,
                    error = %e,
                    "Failed to append saga record"
                );
                Err(e)
            }
        }
    }
}

/// Writes `line` right after the first `durable_len` bytes of the file.
///
/// A torn tail left by an earlier crash is cut off first. If the write does
/// not complete, the file is cut back to `durable_len` so a retry cannot
/// leave the record in the log twice.
async fn write_record(path: &Path, durable_len: u64, line: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    let on_disk = file.metadata().await?.len();
    if on_disk < durable_len {
        return Err(SagaError::InternalLog(format!(
            "{} shrank to {} bytes, expected at least {}",
            path.display(),
            on_disk,
            durable_len
        )));
    }
    if on_disk > durable_len {
        tracing::warn!(
            path = %path.display(),
            discarded_bytes = on_disk - durable_len,
            "Discarding unacknowledged tail of saga log"
        );
        file.set_len(durable_len).await?;
    }

    let written = write_synced(&mut file, line).await;
    if written.is_err() {
        let rolled_back = match file.set_len(durable_len).await {
            Ok(()) => file.sync_data().await,
            Err(e) => Err(e),
        };
        if let Err(e) = rolled_back {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Could not cut back failed append"
            );
        }
    }
    written
}

async fn write_synced(file: &mut fs::File, line: &[u8]) -> Result<()> {
    file.write_all(line).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

async fn read_log(saga_id: &str, path: &Path) -> Result<LogFile> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogFile::default()),
        Err(e) => return Err(e.into()),
    };

    // every acknowledged record ends with a newline
    let durable_len = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i + 1);
    if durable_len < bytes.len() {
        tracing::warn!(
            path = %path.display(),
            torn_bytes = bytes.len() - durable_len,
            "Ignoring partial record at end of saga log"
        );
    }

    let mut records = Vec::new();
    for (line_no, line) in bytes[..durable_len].split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let record: LogRecord = serde_json::from_slice(line).map_err(|e| {
            SagaError::CorruptedSagaLog(format!(
                "{}:{}: undecodable record: {}",
                path.display(),
                line_no + 1,
                e
            ))
        })?;

        let expected = records.len() as u64;
        if record.seq != expected {
            return Err(SagaError::CorruptedSagaLog(format!(
                "{}:{}: expected sequence {}, found {}",
                path.display(),
                line_no + 1,
                expected,
                record.seq
            )));
        }
        if record.message.saga_id != saga_id {
            return Err(SagaError::CorruptedSagaLog(format!(
                "{}:{}: record belongs to saga {}",
                path.display(),
                line_no + 1,
                record.message.saga_id
            )));
        }
        records.push(record);
    }

    Ok(LogFile {
        records,
        durable_len: durable_len as u64,
    })
}

#[async_trait]
impl SagaLog for FileSagaLog {
    async fn start_saga(&self, saga_id: &str, job: Option<&[u8]>) -> Result<()> {
        let msg = SagaMessage::start_saga(saga_id, job.map(<[u8]>::to_vec));
        msg.validate_shape()?;
        let path = self.path_for(saga_id)?;

        let slot = self.cursor_slot(saga_id).await;
        let (result, retired) = {
            let mut cursor = slot.lock().await;
            let result = Self::start_locked(saga_id, job, &path, &mut cursor, msg).await;
            (result, cursor.as_ref().map_or(true, Cursor::is_retired))
        };
        if retired {
            self.release_slot(saga_id, &slot).await;
        }
        result
    }

    async fn log_message(&self, msg: &SagaMessage) -> Result<()> {
        let path = self.path_for(&msg.saga_id)?;

        let slot = self.cursor_slot(&msg.saga_id).await;
        let (result, retired) = {
            let mut cursor = slot.lock().await;
            let result = Self::append_locked(msg, &path, &mut cursor).await;
            (result, cursor.as_ref().map_or(true, Cursor::is_retired))
        };
        if retired {
            self.release_slot(&msg.saga_id, &slot).await;
        }
        result
    }

    async fn get_messages(&self, saga_id: &str) -> Result<Vec<SagaMessage>> {
        let path = self.path_for(saga_id)?;
        // wait out an in-flight append, but don't start tracking the saga
        let slot = self.existing_slot(saga_id).await;
        let _guard = match &slot {
            Some(slot) => Some(slot.lock().await),
            None => None,
        };
        let log = read_log(saga_id, &path).await?;
        Ok(log.records.into_iter().map(|r| r.message).collect())
    }

    async fn get_active_sagas(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut active = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(saga_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let is_active = match self.get_messages(saga_id).await {
                Ok(messages) => messages
                    .last()
                    .is_some_and(|m| m.msg_type != SagaMessageType::EndSaga),
                // listed so recovery reports it; other sagas are unaffected
                Err(SagaError::CorruptedSagaLog(reason)) => {
                    tracing::warn!(saga_id, reason = %reason, "Listing corrupted saga as active");
                    true
                }
                Err(e) => return Err(e),
            };
            if is_active {
                active.push(saga_id.to_string());
            }
        }

        active.sort();
        Ok(active)
    }
}
