use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use strum::{Display, EnumString};

use crate::models::analysis::AnalysisResult;

/// Message shown when the backend marks a job failed without saying why.
pub const DEFAULT_FAILURE_MESSAGE: &str = "Analysis failed. Please try again.";

/// Server-assigned job identifier. Opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Status of an analysis job as reported by the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Position in the forward-only order `pending < processing < {completed, failed}`.
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

/// Point-in-time copy of a job's server state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    #[serde(default)]
    pub job_id: Option<JobId>,
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<AnalysisResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Non-terminal phases, for progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum JobPhase {
    Queued,
    Analyzing,
}

impl JobPhase {
    pub fn rank(self) -> u8 {
        match self {
            JobPhase::Queued => JobStatus::Pending.rank(),
            JobPhase::Analyzing => JobStatus::Processing.rank(),
        }
    }
}

/// A snapshot checked against the result/error invariant.
#[derive(Debug, Clone, PartialEq)]
pub enum JobProgress {
    InFlight(JobPhase),
    Completed(AnalysisResult),
    Failed(String),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SnapshotError {
    #[error("job reported completed without a result")]
    MissingResult,
}

impl JobSnapshot {
    /// Local snapshot recorded right after submission, before the first poll.
    pub fn submitted(job_id: JobId) -> Self {
        let now = Utc::now();
        Self {
            job_id: Some(job_id),
            status: JobStatus::Pending,
            result: None,
            error: None,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    /// Interpret the snapshot. Only the field matching the status is read.
    pub fn progress(&self) -> Result<JobProgress, SnapshotError> {
        match self.status {
            JobStatus::Pending => Ok(JobProgress::InFlight(JobPhase::Queued)),
            JobStatus::Processing => Ok(JobProgress::InFlight(JobPhase::Analyzing)),
            JobStatus::Completed => self
                .result
                .clone()
                .map(JobProgress::Completed)
                .ok_or(SnapshotError::MissingResult),
            JobStatus::Failed => Ok(JobProgress::Failed(
                self.error
                    .as_deref()
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .unwrap_or(DEFAULT_FAILURE_MESSAGE)
                    .to_string(),
            )),
        }
    }
}

/// Body of `GET /upload/jobs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobList {
    #[serde(default)]
    pub jobs: Vec<JobSnapshot>,
}

/// Body of `POST /upload/`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Accepts RFC 3339 as well as the backend's naive UTC timestamps.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }

    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Some(naive.and_utc()))
        .map_err(serde::de::Error::custom)
}
