//! The Job record and the transitions allowed to change it.
//!
//! Fields are private: the only way to mutate a [`Job`] after creation is
//! [`Job::apply`], which enforces the lifecycle
//! `pending -> processing -> (processing)* -> completed | failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Result, VarnikaError};
use crate::types::{JobId, JobStatus, Stage, StageSet};

/// Error detail recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&VarnikaError> for JobError {
    fn from(err: &VarnikaError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// A state change requested for a job.
#[derive(Debug, Clone)]
pub enum Transition {
    /// `pending -> processing`.
    Start { message: String },
    /// `processing -> processing` with a new stage and/or progress.
    Advance {
        stage: Stage,
        progress: u8,
        message: String,
    },
    /// `processing -> completed`.
    Complete { result: serde_json::Value },
    /// `pending | processing -> failed`, keeping whatever output exists.
    Fail {
        error: JobError,
        partial: Option<serde_json::Value>,
    },
}

impl Transition {
    fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Advance { .. } => "advance",
            Self::Complete { .. } => "complete",
            Self::Fail { .. } => "fail",
        }
    }
}

/// One tracked pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    stages: StageSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    topic: Option<String>,
    status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stage: Option<Stage>,
    progress: u8,
    #[serde(default)]
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<JobError>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Job {
    /// Allocate a new `pending` job.
    pub fn new(stages: StageSet, topic: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            stages,
            topic,
            status: JobStatus::Pending,
            stage: None,
            progress: 0,
            message: "Queued".into(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn stages(&self) -> &StageSet {
        &self.stages
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn stage(&self) -> Option<Stage> {
        self.stage
    }

    /// Label of the current step: the running stage, or the status.
    pub fn stage_label(&self) -> &'static str {
        match (self.status, self.stage) {
            (JobStatus::Processing, Some(stage)) => stage.label(),
            (status, _) => status.as_str(),
        }
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a transition, or reject it without touching the record.
    pub fn apply(&mut self, transition: Transition) -> Result<()> {
        let name = transition.name();
        match (self.status, transition) {
            (JobStatus::Pending, Transition::Start { message }) => {
                self.status = JobStatus::Processing;
                self.message = message;
            }
            (
                JobStatus::Processing,
                Transition::Advance {
                    stage,
                    progress,
                    message,
                },
            ) => {
                if !self.stages.contains(stage) {
                    return Err(VarnikaError::validation(format!(
                        "job {} did not request stage {stage}",
                        self.id
                    )));
                }
                if self.stage.is_some_and(|current| stage < current) {
                    return Err(VarnikaError::validation(format!(
                        "job {} cannot return to stage {stage}",
                        self.id
                    )));
                }
                if progress < self.progress || progress > 100 {
                    return Err(VarnikaError::validation(format!(
                        "job {} progress must stay within {}..=100, got {progress}",
                        self.id, self.progress
                    )));
                }
                self.stage = Some(stage);
                self.progress = progress;
                self.message = message;
            }
            (JobStatus::Processing, Transition::Complete { result }) => {
                self.status = JobStatus::Completed;
                self.progress = 100;
                self.message = "Completed".into();
                self.result = Some(result);
            }
            (JobStatus::Pending | JobStatus::Processing, Transition::Fail { error, partial }) => {
                self.status = JobStatus::Failed;
                self.message = error.message.clone();
                self.error = Some(error);
                if partial.is_some() {
                    self.result = partial;
                }
            }
            (status, _) => {
                return Err(VarnikaError::validation(format!(
                    "job {} cannot {name} while {status}",
                    self.id
                )));
            }
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}
