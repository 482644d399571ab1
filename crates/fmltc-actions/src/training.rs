// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Training job service.
//!
//! Training and evaluation run as opaque jobs in an external service. The
//! monitor only needs to submit, poll and cancel them; [`MlEngineClient`]
//! speaks the ML Engine `projects.jobs` REST API and
//! [`InMemoryTrainingService`] stands in for it in tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Errors from the training service.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    /// The request could not be sent or the response not read.
    #[error("training service request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with an error status.
    #[error("training service returned {status}: {body}")]
    Status {
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// No job with this id.
    #[error("training job '{0}' not found")]
    NotFound(String),
}

/// State of a training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Not reported.
    StateUnspecified,
    /// Waiting for resources.
    Queued,
    /// Resources are being provisioned.
    Preparing,
    /// Running.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancellation in progress.
    Cancelling,
    /// Cancelled.
    Cancelled,
}

impl JobState {
    /// The job will not change state anymore.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Stored form, e.g. `RUNNING`.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::StateUnspecified => "STATE_UNSPECIFIED",
            JobState::Queued => "QUEUED",
            JobState::Preparing => "PREPARING",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Cancelling => "CANCELLING",
            JobState::Cancelled => "CANCELLED",
        }
    }

    /// Parse the stored form. Unknown strings are `StateUnspecified`.
    pub fn parse(s: &str) -> Self {
        match s {
            "QUEUED" => JobState::Queued,
            "PREPARING" => JobState::Preparing,
            "RUNNING" => JobState::Running,
            "SUCCEEDED" => JobState::Succeeded,
            "FAILED" => JobState::Failed,
            "CANCELLING" => JobState::Cancelling,
            "CANCELLED" => JobState::Cancelled,
            _ => JobState::StateUnspecified,
        }
    }
}

/// A job to submit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJobSpec {
    /// Job id, unique within the project.
    pub job_id: String,
    /// Job inputs.
    pub training_input: TrainingInput,
}

/// Inputs of a training or evaluation job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingInput {
    /// Python module run by the job.
    pub python_module: String,
    /// Command line arguments.
    pub args: Vec<String>,
    /// Where the job writes checkpoints and event files.
    pub job_dir: String,
    /// Upper bound of the job's run time.
    pub scheduling: Scheduling,
}

/// Job scheduling options.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scheduling {
    /// e.g. `"3600s"`.
    pub max_running_time: String,
}

/// A job as reported by the service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJob {
    /// Job id.
    pub job_id: String,
    /// Current state.
    pub state: JobState,
    /// Failure reason.
    #[serde(default)]
    pub error_message: Option<String>,
    /// When the job started running.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// When the job ended.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

/// Submits, polls and cancels training jobs.
#[async_trait]
pub trait TrainingJobService: Send + Sync {
    /// Submit a new job.
    async fn submit_job(&self, spec: &TrainingJobSpec) -> Result<TrainingJob, TrainingError>;

    /// Current state of a job.
    async fn get_job(&self, job_id: &str) -> Result<TrainingJob, TrainingError>;

    /// Request cancellation.
    async fn cancel_job(&self, job_id: &str) -> Result<(), TrainingError>;
}

/// REST client for the ML Engine jobs API.
#[derive(Debug, Clone)]
pub struct MlEngineClient {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    token: Option<String>,
}

impl MlEngineClient {
    /// Client for `project_id` at `base_url` (e.g. `https://ml.googleapis.com/v1`).
    pub fn new(
        base_url: impl Into<String>,
        project_id: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            token,
        }
    }

    fn jobs_url(&self) -> String {
        format!("{}/projects/{}/jobs", self.base_url, self.project_id)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response, job_id: &str) -> Result<reqwest::Response, TrainingError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TrainingError::NotFound(job_id.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        Err(TrainingError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl TrainingJobService for MlEngineClient {
    #[instrument(skip(self, spec), fields(job_id = %spec.job_id))]
    async fn submit_job(&self, spec: &TrainingJobSpec) -> Result<TrainingJob, TrainingError> {
        let response = self
            .authorized(self.http.post(self.jobs_url()).json(spec))
            .send()
            .await?;
        let job = Self::check(response, &spec.job_id)
            .await?
            .json::<TrainingJob>()
            .await?;
        debug!(state = job.state.as_str(), "Training job submitted");
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn get_job(&self, job_id: &str) -> Result<TrainingJob, TrainingError> {
        let url = format!("{}/{}", self.jobs_url(), job_id);
        let response = self.authorized(self.http.get(url)).send().await?;
        Ok(Self::check(response, job_id).await?.json().await?)
    }

    #[instrument(skip(self))]
    async fn cancel_job(&self, job_id: &str) -> Result<(), TrainingError> {
        let url = format!("{}/{}:cancel", self.jobs_url(), job_id);
        let response = self
            .authorized(self.http.post(url).json(&serde_json::json!({})))
            .send()
            .await?;
        Self::check(response, job_id).await?;
        Ok(())
    }
}

/// Training service kept in memory. Jobs only change state when told to.
#[derive(Debug, Default)]
pub struct InMemoryTrainingService {
    jobs: Mutex<HashMap<String, TrainingJob>>,
    submitted: Mutex<Vec<TrainingJobSpec>>,
    failing_polls: Mutex<u32>,
}

impl InMemoryTrainingService {
    /// Empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a job to `state`, stamping start and end times as the real
    /// service would.
    pub fn set_state(&self, job_id: &str, state: JobState, at: DateTime<Utc>) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(job_id) {
            job.state = state;
            if state == JobState::Running && job.start_time.is_none() {
                job.start_time = Some(at);
            }
            if state.is_terminal() && job.end_time.is_none() {
                job.end_time = Some(at);
            }
            if state == JobState::Failed {
                job.error_message = Some("job failed".to_string());
            }
        }
    }

    /// Current state of a job, if it exists.
    pub fn state(&self, job_id: &str) -> Option<JobState> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_id).map(|job| job.state)
    }

    /// Jobs submitted so far.
    pub fn submitted(&self) -> Vec<TrainingJobSpec> {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Fail the next `count` polls with a transient error.
    pub fn fail_next_polls(&self, count: u32) {
        *self.failing_polls.lock().unwrap_or_else(|e| e.into_inner()) = count;
    }
}

#[async_trait]
impl TrainingJobService for InMemoryTrainingService {
    async fn submit_job(&self, spec: &TrainingJobSpec) -> Result<TrainingJob, TrainingError> {
        let job = TrainingJob {
            job_id: spec.job_id.clone(),
            state: JobState::Queued,
            error_message: None,
            start_time: None,
            end_time: None,
        };
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(spec.job_id.clone(), job.clone());
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> Result<TrainingJob, TrainingError> {
        {
            let mut failing = self.failing_polls.lock().unwrap_or_else(|e| e.into_inner());
            if *failing > 0 {
                *failing -= 1;
                return Err(TrainingError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
        }
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_id)
            .cloned()
            .ok_or_else(|| TrainingError::NotFound(job_id.to_string()))
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), TrainingError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| TrainingError::NotFound(job_id.to_string()))?;
        if !job.state.is_terminal() {
            job.state = JobState::Cancelled;
            job.end_time = job.end_time.or(job.start_time);
        }
        Ok(())
    }
}
