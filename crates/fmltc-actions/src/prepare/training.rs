// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Starting, cancelling and deleting training runs.
//!
//! Starting a run reserves `max_running_minutes` from the team budget up
//! front. The training monitor charges what the training job actually used
//! and refunds the rest.

use fmltc_core::persistence::{Model, NewModel};
use tracing::{info, warn};
use uuid::Uuid;

use crate::action::{ActionKind, create_action_parameters};
use crate::blob_names::model_job_dir;
use crate::error::{ActionError, Result};
use crate::handlers::training_monitor::{EVAL_JOB, TRAIN_JOB, minutes_to_charge};
use crate::services::ActionServices;
use crate::training::{JobState, Scheduling, TrainingInput, TrainingJobSpec};
use crate::trigger::{TriggerOutcome, trigger_via_queue};

/// Python module the training service runs for both jobs.
pub const TRAINER_MODULE: &str = "trainer.model_main";

/// What to train.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRequest {
    /// Free-text description.
    pub description: String,
    /// Completed datasets to train on.
    pub dataset_ids: Vec<String>,
    /// Pretrained checkpoint to start from.
    pub starting_model: String,
    /// Training steps.
    pub num_training_steps: i64,
    /// Upper bound of the training job's run time, reserved up front.
    pub max_running_minutes: i64,
}

/// Submit the training (and, when the datasets have evaluation shards,
/// evaluation) job for `request` and start monitoring it.
pub async fn start_training(
    services: &ActionServices,
    team_id: &str,
    request: &TrainingRequest,
) -> Result<Model> {
    if request.description.trim().is_empty() {
        return Err(ActionError::validation("description", "must not be empty"));
    }
    if request.starting_model.trim().is_empty() {
        return Err(ActionError::validation("starting_model", "must not be empty"));
    }
    if request.num_training_steps <= 0 {
        return Err(ActionError::validation("num_training_steps", "must be positive"));
    }
    if request.max_running_minutes <= 0 {
        return Err(ActionError::validation("max_running_minutes", "must be positive"));
    }
    if request.dataset_ids.is_empty() {
        return Err(ActionError::validation("dataset_ids", "select at least one dataset"));
    }

    let mut record_blobs = Vec::new();
    let mut has_eval = false;
    for dataset_id in &request.dataset_ids {
        let dataset = services.store.get_dataset(team_id, dataset_id).await?;
        if dataset.delete_in_progress || !dataset.dataset_completed {
            return Err(ActionError::validation(
                "dataset_ids",
                format!("dataset {dataset_id} is not completed"),
            ));
        }
        has_eval |= dataset.eval_record_count > 0;
        record_blobs.extend(
            services
                .store
                .list_dataset_records(dataset_id)
                .await?
                .into_iter()
                .map(|r| (r.is_eval, r.tf_record_blob_name)),
        );
    }

    let reserved = request.max_running_minutes;
    if !services
        .store
        .reserve_training_minutes(team_id, reserved)
        .await?
    {
        return Err(ActionError::validation(
            "max_running_minutes",
            "not enough remaining training minutes",
        ));
    }

    let model_id = Uuid::new_v4().to_string();
    let job_suffix = model_id.replace('-', "_");
    let train_dir = model_job_dir(team_id, &model_id, TRAIN_JOB);
    let eval_dir = model_job_dir(team_id, &model_id, EVAL_JOB);
    let train_files: Vec<&str> = record_blobs
        .iter()
        .filter(|(is_eval, _)| !is_eval)
        .map(|(_, name)| name.as_str())
        .collect();
    let eval_files: Vec<&str> = record_blobs
        .iter()
        .filter(|(is_eval, _)| *is_eval)
        .map(|(_, name)| name.as_str())
        .collect();
    let scheduling = Scheduling {
        max_running_time: format!("{}s", reserved * 60),
    };

    let train_spec = TrainingJobSpec {
        job_id: format!("train_{job_suffix}"),
        training_input: TrainingInput {
            python_module: TRAINER_MODULE.to_string(),
            args: vec![
                format!("--model_dir={train_dir}"),
                format!("--starting_model={}", request.starting_model),
                format!("--num_train_steps={}", request.num_training_steps),
                format!("--train_records={}", train_files.join(",")),
            ],
            job_dir: train_dir.clone(),
            scheduling: scheduling.clone(),
        },
    };
    let train_job = match services.training.submit_job(&train_spec).await {
        Ok(job) => job,
        Err(e) => {
            services
                .store
                .adjust_training_minutes(team_id, reserved)
                .await?;
            return Err(e.into());
        }
    };

    let mut eval_job = None;
    if has_eval {
        let eval_spec = TrainingJobSpec {
            job_id: format!("eval_{job_suffix}"),
            training_input: TrainingInput {
                python_module: TRAINER_MODULE.to_string(),
                args: vec![
                    format!("--model_dir={eval_dir}"),
                    format!("--checkpoint_dir={train_dir}"),
                    format!("--eval_records={}", eval_files.join(",")),
                ],
                job_dir: eval_dir.clone(),
                scheduling,
            },
        };
        match services.training.submit_job(&eval_spec).await {
            Ok(job) => eval_job = Some(job),
            Err(e) => {
                if let Err(cancel) = services.training.cancel_job(&train_job.job_id).await {
                    warn!(job_id = %train_job.job_id, error = %cancel, "Cancelling the orphaned training job failed");
                }
                services
                    .store
                    .adjust_training_minutes(team_id, reserved)
                    .await?;
                return Err(e.into());
            }
        }
    }

    let now = services.clock.now();
    let model = services
        .store
        .create_model(
            &NewModel {
                model_id: model_id.clone(),
                team_id: team_id.to_string(),
                description: request.description.clone(),
                dataset_ids: request.dataset_ids.clone(),
                starting_model: request.starting_model.clone(),
                num_training_steps: request.num_training_steps,
                max_running_minutes: request.max_running_minutes,
                reserved_training_minutes: reserved,
                train_job_name: train_job.job_id.clone(),
                eval_job_name: eval_job.as_ref().map(|j| j.job_id.clone()),
                train_job_state: train_job.state.as_str().to_string(),
                eval_job_state: eval_job.as_ref().map(|j| j.state.as_str().to_string()),
            },
            now,
        )
        .await?;
    services.store.mark_monitor_triggered(&model_id, now).await?;
    let params = create_action_parameters(
        team_id,
        ActionKind::MonitorTraining {
            model_id: model_id.clone(),
        },
    );
    trigger_via_queue(services, &params).await?;
    info!(
        team_id,
        model_id = %model_id,
        train_job = %train_job.job_id,
        eval_job = ?eval_job.as_ref().map(|j| &j.job_id),
        reserved,
        "Training started"
    );
    Ok(model)
}

/// Ask the training monitor to cancel the model's jobs.
pub async fn cancel_training(services: &ActionServices, team_id: &str, model_id: &str) -> Result<()> {
    services.store.request_model_cancel(team_id, model_id).await?;
    info!(team_id, model_id, "Training cancel requested");
    Ok(())
}

/// Soft-delete a model, cancel its running jobs, settle its training
/// minutes and trigger removal of its data.
pub async fn delete_model(
    services: &ActionServices,
    team_id: &str,
    model_id: &str,
) -> Result<TriggerOutcome> {
    let model = services.store.mark_model_deleting(team_id, model_id).await?;

    let mut jobs = vec![(
        model.train_job_name.as_str(),
        JobState::parse(&model.train_job_state),
    )];
    if let (Some(name), Some(state)) = (&model.eval_job_name, &model.eval_job_state) {
        jobs.push((name.as_str(), JobState::parse(state)));
    }
    for (job_id, state) in jobs {
        if state.is_terminal() {
            continue;
        }
        if let Err(e) = services.training.cancel_job(job_id).await {
            warn!(job_id, error = %e, "Cancelling a job of a deleted model failed");
        }
    }

    // The monitor stops on deletion, so it will not charge this model.
    if model.training_minutes_charged.is_none() {
        let charged = minutes_to_charge(
            model.reserved_training_minutes,
            model.train_job_start_time,
            model.train_job_end_time.unwrap_or_else(|| services.clock.now()),
        );
        services
            .store
            .charge_training_minutes(model_id, charged, model.reserved_training_minutes - charged)
            .await?;
    }

    let params = create_action_parameters(
        team_id,
        ActionKind::DeleteModel {
            model_id: model_id.to_string(),
        },
    );
    Ok(trigger_via_queue(services, &params).await?)
}
