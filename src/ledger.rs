//! In-memory table of download jobs shared by every request.
//!
//! Each write replaces the whole record stored under a job id, so a poll
//! never observes a mix of two updates.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Downloading,
    Completed,
    Error,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Job {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn starting() -> Self {
        Self {
            status: JobStatus::Starting,
            percent: Some("0%".to_string()),
            speed: None,
            eta: None,
            filename: None,
            error: None,
        }
    }

    pub fn downloading(
        percent: String,
        speed: String,
        eta: String,
        filename: Option<String>,
    ) -> Self {
        Self {
            status: JobStatus::Downloading,
            percent: Some(percent),
            speed: Some(speed),
            eta: Some(eta),
            filename,
            error: None,
        }
    }

    /// One stream finished; merging or transcoding may still follow.
    pub fn stream_finished(filename: Option<String>) -> Self {
        Self {
            status: JobStatus::Downloading,
            percent: Some("100%".to_string()),
            speed: None,
            eta: None,
            filename,
            error: None,
        }
    }

    pub fn completed(filename: String) -> Self {
        Self {
            status: JobStatus::Completed,
            percent: Some("100%".to_string()),
            speed: None,
            eta: None,
            filename: Some(filename),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Error,
            percent: None,
            speed: None,
            eta: None,
            filename: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Clone, Default)]
pub struct JobLedger {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
}

impl JobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the entry for a new job, resetting any previous record.
    pub fn start(&self, id: &str) {
        self.overwrite(id, Job::starting());
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().get(id).cloned()
    }

    pub fn overwrite(&self, id: &str, job: Job) {
        self.jobs.write().insert(id.to_owned(), job);
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }
}
