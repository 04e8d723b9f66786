use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::saga::message::{validate_saga_id, SagaMessage, SagaMessageType};

/// Lifecycle of a single task within a saga.
///
/// Variants are ordered by progress; a task's status never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    NotStarted,
    TaskStarted,
    TaskCompleted,
    CompTaskStarted,
    CompTaskCompleted,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::NotStarted => write!(f, "not_started"),
            TaskStatus::TaskStarted => write!(f, "started"),
            TaskStatus::TaskCompleted => write!(f, "completed"),
            TaskStatus::CompTaskStarted => write!(f, "compensating"),
            TaskStatus::CompTaskCompleted => write!(f, "compensated"),
        }
    }
}

/// Everything recorded about one task: its status and the last data seen
/// for each kind of task message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    /// Set once `EndTask` is logged, kept through compensation.
    pub ended: bool,
    pub start_data: Option<Vec<u8>>,
    pub end_data: Option<Vec<u8>>,
    pub start_comp_data: Option<Vec<u8>>,
    pub end_comp_data: Option<Vec<u8>>,
}

impl TaskRecord {
    fn new() -> Self {
        Self {
            status: TaskStatus::NotStarted,
            ended: false,
            start_data: None,
            end_data: None,
            start_comp_data: None,
            end_comp_data: None,
        }
    }

    fn advance(&mut self, status: TaskStatus) {
        self.status = self.status.max(status);
    }
}

/// In-memory projection of a saga's log.
///
/// A `SagaState` is always the result of applying a legal sequence of
/// [`SagaMessage`]s, starting with `StartSaga`. It is a plain value: cloning
/// produces a fully independent snapshot.
///
/// # Invariants
///
/// - The saga starts with `StartSaga`, which is never accepted again.
/// - Once `EndSaga` is applied nothing else is accepted.
/// - `aborted` flips from false to true at most once.
/// - A task's status only ever advances (see [`TaskStatus`]); re-logging a
///   task message only overwrites its recorded data.
/// - Compensating messages require an aborted saga and a started task.
/// - `EndSaga` requires every known task to be completed (not aborted) or
///   compensated (aborted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaState {
    saga_id: String,
    job: Option<Vec<u8>>,
    tasks: BTreeMap<String, TaskRecord>,
    aborted: bool,
    completed: bool,
}

impl SagaState {
    /// State of a saga right after its `StartSaga` message.
    pub fn new(saga_id: impl Into<String>, job: Option<Vec<u8>>) -> Result<Self> {
        let saga_id = saga_id.into();
        validate_saga_id(&saga_id)?;
        Ok(Self {
            saga_id,
            job,
            tasks: BTreeMap::new(),
            aborted: false,
            completed: false,
        })
    }

    /// Builds the initial state from the first message of a saga.
    pub fn from_start_message(msg: &SagaMessage) -> Result<Self> {
        msg.validate_shape()?;
        if msg.msg_type != SagaMessageType::StartSaga {
            return Err(SagaError::InvalidSagaState(format!(
                "first message of saga {} must be StartSaga, got {}",
                msg.saga_id, msg.msg_type
            )));
        }
        Self::new(msg.saga_id.clone(), msg.data.clone())
    }

    /// Replays a full message history into a fresh state, checking every
    /// transition along the way.
    pub fn replay<'a, I>(messages: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a SagaMessage>,
    {
        let mut iter = messages.into_iter();
        let first = iter.next().ok_or_else(|| {
            SagaError::InvalidSagaState("cannot replay an empty message history".to_string())
        })?;

        let mut state = Self::from_start_message(first)?;
        for msg in iter {
            state.validate(msg)?;
            state.apply(msg);
        }
        Ok(state)
    }

    /// Checks whether `msg` is a legal next message. Never mutates.
    pub fn validate(&self, msg: &SagaMessage) -> Result<()> {
        msg.validate_shape()?;

        if msg.saga_id != self.saga_id {
            return Err(SagaError::InvalidSagaMessage(format!(
                "message for saga {} applied to saga {}",
                msg.saga_id, self.saga_id
            )));
        }

        if self.completed {
            return Err(SagaError::InvalidSagaState(format!(
                "saga {} already completed, cannot apply {}",
                self.saga_id, msg.msg_type
            )));
        }

        match msg.msg_type {
            SagaMessageType::StartSaga => Err(SagaError::InvalidSagaState(format!(
                "saga {} already started",
                self.saga_id
            ))),
            SagaMessageType::AbortSaga => Ok(()),
            SagaMessageType::EndSaga => self.validate_end_saga(),
            SagaMessageType::StartTask => {
                let task_id = msg.task_id_or_err()?;
                self.ensure_not_aborted(msg.msg_type, task_id)
            }
            SagaMessageType::EndTask => {
                let task_id = msg.task_id_or_err()?;
                self.ensure_not_aborted(msg.msg_type, task_id)?;
                if !self.is_task_started(task_id) {
                    return Err(SagaError::InvalidSagaState(format!(
                        "cannot EndTask {} before StartTask",
                        task_id
                    )));
                }
                Ok(())
            }
            SagaMessageType::StartCompensatingTask => {
                let task_id = msg.task_id_or_err()?;
                self.ensure_aborted(msg.msg_type, task_id)?;
                if !self.is_task_started(task_id) {
                    return Err(SagaError::InvalidSagaState(format!(
                        "cannot StartCompTask {} for a task that was never started",
                        task_id
                    )));
                }
                Ok(())
            }
            SagaMessageType::EndCompensatingTask => {
                let task_id = msg.task_id_or_err()?;
                self.ensure_aborted(msg.msg_type, task_id)?;
                if !self.is_comp_task_started(task_id) {
                    return Err(SagaError::InvalidSagaState(format!(
                        "cannot EndCompTask {} before StartCompTask",
                        task_id
                    )));
                }
                Ok(())
            }
        }
    }

    /// Applies an already validated message.
    pub fn apply(&mut self, msg: &SagaMessage) {
        match msg.msg_type {
            SagaMessageType::StartSaga => {}
            SagaMessageType::AbortSaga => self.aborted = true,
            SagaMessageType::EndSaga => self.completed = true,
            SagaMessageType::StartTask
            | SagaMessageType::EndTask
            | SagaMessageType::StartCompensatingTask
            | SagaMessageType::EndCompensatingTask => {
                let Some(task_id) = msg.task_id.as_ref() else {
                    return;
                };
                let record = self
                    .tasks
                    .entry(task_id.clone())
                    .or_insert_with(TaskRecord::new);
                let (status, slot) = match msg.msg_type {
                    SagaMessageType::StartTask => (TaskStatus::TaskStarted, &mut record.start_data),
                    SagaMessageType::EndTask => (TaskStatus::TaskCompleted, &mut record.end_data),
                    SagaMessageType::StartCompensatingTask => {
                        (TaskStatus::CompTaskStarted, &mut record.start_comp_data)
                    }
                    _ => (TaskStatus::CompTaskCompleted, &mut record.end_comp_data),
                };
                // last write wins; a message without data keeps what we had
                if msg.data.is_some() {
                    *slot = msg.data.clone();
                }
                if msg.msg_type == SagaMessageType::EndTask {
                    record.ended = true;
                }
                record.advance(status);
            }
        }
    }

    fn ensure_not_aborted(&self, msg_type: SagaMessageType, task_id: &str) -> Result<()> {
        if self.aborted {
            return Err(SagaError::InvalidSagaState(format!(
                "cannot {} {} after saga {} was aborted",
                msg_type, task_id, self.saga_id
            )));
        }
        Ok(())
    }

    fn ensure_aborted(&self, msg_type: SagaMessageType, task_id: &str) -> Result<()> {
        if !self.aborted {
            return Err(SagaError::InvalidSagaState(format!(
                "cannot {} {} while saga {} is not aborted",
                msg_type, task_id, self.saga_id
            )));
        }
        Ok(())
    }

    fn validate_end_saga(&self) -> Result<()> {
        let required = if self.aborted {
            TaskStatus::CompTaskCompleted
        } else {
            TaskStatus::TaskCompleted
        };

        let pending: Vec<&str> = self
            .tasks
            .iter()
            .filter(|(_, record)| record.status != required)
            .map(|(id, _)| id.as_str())
            .collect();

        if pending.is_empty() {
            Ok(())
        } else {
            Err(SagaError::InvalidSagaState(format!(
                "cannot EndSaga {}: tasks not {}: {}",
                self.saga_id,
                required,
                pending.join(", ")
            )))
        }
    }

    pub fn saga_id(&self) -> &str {
        &self.saga_id
    }

    /// The job payload recorded with `StartSaga`.
    pub fn job(&self) -> Option<&[u8]> {
        self.job.as_deref()
    }

    /// Ids of every task that has been logged, in sorted order.
    pub fn task_ids(&self) -> Vec<&str> {
        self.tasks.keys().map(String::as_str).collect()
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskRecord> {
        self.tasks.get(task_id)
    }

    pub fn task_status(&self, task_id: &str) -> TaskStatus {
        self.tasks
            .get(task_id)
            .map(|r| r.status)
            .unwrap_or(TaskStatus::NotStarted)
    }

    pub fn is_task_started(&self, task_id: &str) -> bool {
        self.task_status(task_id) >= TaskStatus::TaskStarted
    }

    /// True once `EndTask` has been logged for the task.
    pub fn is_task_completed(&self, task_id: &str) -> bool {
        self.tasks.get(task_id).map(|r| r.ended).unwrap_or(false)
    }

    pub fn is_comp_task_started(&self, task_id: &str) -> bool {
        self.task_status(task_id) >= TaskStatus::CompTaskStarted
    }

    pub fn is_comp_task_completed(&self, task_id: &str) -> bool {
        self.task_status(task_id) == TaskStatus::CompTaskCompleted
    }

    pub fn start_task_data(&self, task_id: &str) -> Option<&[u8]> {
        self.tasks.get(task_id).and_then(|r| r.start_data.as_deref())
    }

    pub fn end_task_data(&self, task_id: &str) -> Option<&[u8]> {
        self.tasks.get(task_id).and_then(|r| r.end_data.as_deref())
    }

    /// Result data of the task, as reported to status clients.
    pub fn task_data(&self, task_id: &str) -> Option<&[u8]> {
        self.end_task_data(task_id)
    }

    pub fn start_comp_task_data(&self, task_id: &str) -> Option<&[u8]> {
        self.tasks
            .get(task_id)
            .and_then(|r| r.start_comp_data.as_deref())
    }

    pub fn end_comp_task_data(&self, task_id: &str) -> Option<&[u8]> {
        self.tasks
            .get(task_id)
            .and_then(|r| r.end_comp_data.as_deref())
    }

    pub fn is_saga_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_saga_completed(&self) -> bool {
        self.completed
    }

    /// Tasks a forward recovery still has to finish.
    pub fn incomplete_tasks(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|(_, r)| r.status == TaskStatus::TaskStarted)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Tasks a rollback recovery still has to compensate.
    pub fn uncompensated_tasks(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|(_, r)| r.status != TaskStatus::CompTaskCompleted)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match (self.completed, self.aborted) {
            (true, true) => "rolled back",
            (true, false) => "completed",
            (false, true) => "aborted",
            (false, false) => "running",
        };
        write!(f, "saga {} ({}", self.saga_id, phase)?;
        if !self.tasks.is_empty() {
            write!(f, "; ")?;
            let mut first = true;
            for (id, record) in &self.tasks {
                if !first {
                    write!(f, ", ")?;
                }
                write!(f, "{}={}", id, record.status)?;
                first = false;
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(id: &str) -> SagaState {
        SagaState::new(id, Some(b"job".to_vec())).unwrap()
    }

    fn log(state: &mut SagaState, msg: SagaMessage) -> Result<()> {
        state.validate(&msg)?;
        state.apply(&msg);
        Ok(())
    }

    #[test]
    fn test_new_state() {
        let state = started("job1");
        assert_eq!(state.saga_id(), "job1");
        assert_eq!(state.job(), Some(&b"job"[..]));
        assert!(!state.is_saga_aborted());
        assert!(!state.is_saga_completed());
        assert!(state.task_ids().is_empty());
    }

    #[test]
    fn test_first_message_must_be_start_saga() {
        let err = SagaState::from_start_message(&SagaMessage::start_task("job1", "t1", None))
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidSagaState(_)));

        let state = SagaState::from_start_message(&SagaMessage::start_saga("job1", None)).unwrap();
        assert_eq!(state.saga_id(), "job1");
    }

    #[test]
    fn test_second_start_saga_rejected() {
        let state = started("job1");
        let err = state
            .validate(&SagaMessage::start_saga("job1", None))
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidSagaState(_)));
    }

    #[test]
    fn test_validate_does_not_mutate() {
        let state = started("job1");
        let before = state.clone();
        state
            .validate(&SagaMessage::start_task("job1", "t1", None))
            .unwrap();
        assert_eq!(state, before);
    }

    #[test]
    fn test_forward_task_lifecycle() {
        let mut state = started("job1");
        log(&mut state, SagaMessage::start_task("job1", "t1", Some(b"in".to_vec()))).unwrap();
        assert_eq!(state.task_status("t1"), TaskStatus::TaskStarted);
        assert!(state.is_task_started("t1"));
        assert!(!state.is_task_completed("t1"));

        log(&mut state, SagaMessage::end_task("job1", "t1", Some(b"out".to_vec()))).unwrap();
        assert_eq!(state.task_status("t1"), TaskStatus::TaskCompleted);
        assert!(state.is_task_completed("t1"));
        assert_eq!(state.start_task_data("t1"), Some(&b"in"[..]));
        assert_eq!(state.task_data("t1"), Some(&b"out"[..]));
    }

    #[test]
    fn test_end_task_requires_start() {
        let state = started("job1");
        let err = state
            .validate(&SagaMessage::end_task("job1", "t1", None))
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidSagaState(_)));
    }

    #[test]
    fn test_relogging_overwrites_data_only() {
        let mut state = started("job1");
        log(&mut state, SagaMessage::start_task("job1", "t1", None)).unwrap();
        log(&mut state, SagaMessage::end_task("job1", "t1", Some(b"a".to_vec()))).unwrap();
        log(&mut state, SagaMessage::end_task("job1", "t1", Some(b"b".to_vec()))).unwrap();
        assert_eq!(state.task_data("t1"), Some(&b"b"[..]));

        // a late StartTask does not move the task back to started
        log(&mut state, SagaMessage::start_task("job1", "t1", Some(b"again".to_vec()))).unwrap();
        assert_eq!(state.task_status("t1"), TaskStatus::TaskCompleted);
        assert_eq!(state.start_task_data("t1"), Some(&b"again"[..]));
    }

    #[test]
    fn test_message_without_data_keeps_previous_data() {
        let mut state = started("job1");
        log(&mut state, SagaMessage::start_task("job1", "t1", Some(b"x".to_vec()))).unwrap();
        log(&mut state, SagaMessage::start_task("job1", "t1", None)).unwrap();
        assert_eq!(state.start_task_data("t1"), Some(&b"x"[..]));
    }

    #[test]
    fn test_end_saga_requires_all_tasks_completed() {
        let mut state = started("job1");
        log(&mut state, SagaMessage::start_task("job1", "t1", None)).unwrap();
        log(&mut state, SagaMessage::start_task("job1", "t2", None)).unwrap();
        log(&mut state, SagaMessage::end_task("job1", "t1", None)).unwrap();

        let err = state.validate(&SagaMessage::end_saga("job1")).unwrap_err();
        assert!(matches!(err, SagaError::InvalidSagaState(ref m) if m.contains("t2")));

        log(&mut state, SagaMessage::end_task("job1", "t2", None)).unwrap();
        log(&mut state, SagaMessage::end_saga("job1")).unwrap();
        assert!(state.is_saga_completed());
    }

    #[test]
    fn test_nothing_accepted_after_end_saga() {
        let mut state = started("job1");
        log(&mut state, SagaMessage::end_saga("job1")).unwrap();

        for msg in [
            SagaMessage::end_saga("job1"),
            SagaMessage::abort_saga("job1"),
            SagaMessage::start_task("job1", "t1", None),
        ] {
            assert!(matches!(
                state.validate(&msg),
                Err(SagaError::InvalidSagaState(_))
            ));
        }
    }

    #[test]
    fn test_abort_blocks_forward_progress() {
        let mut state = started("job1");
        log(&mut state, SagaMessage::start_task("job1", "t1", None)).unwrap();
        log(&mut state, SagaMessage::abort_saga("job1")).unwrap();
        assert!(state.is_saga_aborted());

        assert!(state
            .validate(&SagaMessage::start_task("job1", "t2", None))
            .is_err());
        assert!(state
            .validate(&SagaMessage::end_task("job1", "t1", None))
            .is_err());

        // repeated abort is accepted and changes nothing
        log(&mut state, SagaMessage::abort_saga("job1")).unwrap();
        assert!(state.is_saga_aborted());
    }

    #[test]
    fn test_compensation_rules() {
        let mut state = started("job1");
        log(&mut state, SagaMessage::start_task("job1", "t1", None)).unwrap();

        // not aborted yet
        assert!(state
            .validate(&SagaMessage::start_comp_task("job1", "t1", None))
            .is_err());

        log(&mut state, SagaMessage::abort_saga("job1")).unwrap();

        // never started, nothing to compensate
        assert!(state
            .validate(&SagaMessage::start_comp_task("job1", "t2", None))
            .is_err());
        // end before start
        assert!(state
            .validate(&SagaMessage::end_comp_task("job1", "t1", None))
            .is_err());

        log(&mut state, SagaMessage::start_comp_task("job1", "t1", Some(b"undo".to_vec()))).unwrap();
        assert!(state.is_comp_task_started("t1"));
        assert!(state.validate(&SagaMessage::end_saga("job1")).is_err());

        log(&mut state, SagaMessage::end_comp_task("job1", "t1", Some(b"undone".to_vec()))).unwrap();
        assert!(state.is_comp_task_completed("t1"));
        assert_eq!(state.start_comp_task_data("t1"), Some(&b"undo"[..]));
        assert_eq!(state.end_comp_task_data("t1"), Some(&b"undone"[..]));

        log(&mut state, SagaMessage::end_saga("job1")).unwrap();
        assert!(state.is_saga_completed());
    }

    #[test]
    fn test_message_for_other_saga_rejected() {
        let state = started("job1");
        let err = state
            .validate(&SagaMessage::start_task("job2", "t1", None))
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidSagaMessage(_)));
    }

    #[test]
    fn test_replay_is_deterministic() {
        let history = vec![
            SagaMessage::start_saga("job1", Some(b"job".to_vec())),
            SagaMessage::start_task("job1", "t1", Some(b"a".to_vec())),
            SagaMessage::start_task("job1", "t2", None),
            SagaMessage::end_task("job1", "t1", Some(b"r1".to_vec())),
            SagaMessage::abort_saga("job1"),
            SagaMessage::start_comp_task("job1", "t2", None),
        ];

        let first = SagaState::replay(&history).unwrap();
        let second = SagaState::replay(&history).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.task_status("t1"), TaskStatus::TaskCompleted);
        assert_eq!(first.task_status("t2"), TaskStatus::CompTaskStarted);
        assert_eq!(first.uncompensated_tasks(), vec!["t1", "t2"]);
    }

    #[test]
    fn test_replay_rejects_empty_history() {
        let history: Vec<SagaMessage> = Vec::new();
        assert!(SagaState::replay(&history).is_err());
    }

    #[test]
    fn test_recovery_worklists() {
        let mut state = started("job1");
        log(&mut state, SagaMessage::start_task("job1", "t1", None)).unwrap();
        log(&mut state, SagaMessage::start_task("job1", "t2", None)).unwrap();
        log(&mut state, SagaMessage::end_task("job1", "t2", None)).unwrap();
        assert_eq!(state.incomplete_tasks(), vec!["t1"]);
        assert_eq!(state.uncompensated_tasks(), vec!["t1", "t2"]);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut state = started("job1");
        let snapshot = state.clone();
        log(&mut state, SagaMessage::start_task("job1", "t1", None)).unwrap();
        assert!(snapshot.task_ids().is_empty());
        assert_eq!(state.task_ids(), vec!["t1"]);
    }

    #[test]
    fn test_display() {
        let mut state = started("job1");
        log(&mut state, SagaMessage::start_task("job1", "t1", None)).unwrap();
        assert_eq!(state.to_string(), "saga job1 (running; t1=started)");
    }
}
