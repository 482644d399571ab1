// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Training monitor.
//!
//! Follows a model's training and evaluation jobs: mirrors their state,
//! copies summaries out of the event files they write, charges the team for
//! the minutes the training job ran and stops once both jobs are over and a
//! final pass found nothing new.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fmltc_core::persistence::{Model, ModelJobUpdate, ModelSummaryItem, SummaryValueType};
use fmltc_media::event_file::{SummaryEntry, SummaryValue, parse_event_file};
use tracing::{debug, info, warn};

use crate::blob_names::{file_name, model_job_dir, summary_image_blob};
use crate::error::Result;
use crate::resumption::{Checkpoint, Invocation};
use crate::services::ActionServices;
use crate::training::{JobState, TrainingJob};

/// Pause between monitoring passes.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Job directory name of the training job.
pub const TRAIN_JOB: &str = "train";
/// Job directory name of the evaluation job.
pub const EVAL_JOB: &str = "eval";

/// Monitor `model_id` until both of its jobs are over.
pub async fn monitor_training(inv: &mut Invocation<'_>, model_id: &str) -> Result<Checkpoint> {
    let services = inv.services();
    let team_id = inv.team_id().to_string();

    loop {
        let pass_start = services.clock.now();
        let model = match services.store.get_model(&team_id, model_id).await {
            Ok(model) => model,
            Err(e) if e.is_not_found() => return Ok(Checkpoint::Continue),
            Err(e) => return Err(e.into()),
        };
        if model.delete_in_progress || model.monitor_training_finished {
            debug!(model_id, "Nothing left to monitor");
            return Ok(Checkpoint::Continue);
        }

        let mut train_state = JobState::parse(&model.train_job_state);
        let mut eval_state = model.eval_job_state.as_deref().map(JobState::parse);
        if model.cancel_requested {
            cancel_job(services, &model.train_job_name, train_state).await;
            if let (Some(job), Some(state)) = (&model.eval_job_name, eval_state) {
                cancel_job(services, job, state).await;
            }
        }

        let train_job = poll_job(services, &model.train_job_name).await;
        let eval_job = match &model.eval_job_name {
            Some(name) => poll_job(services, name).await,
            None => None,
        };
        if let Some(job) = &train_job {
            train_state = job.state;
        }
        if let Some(job) = &eval_job {
            eval_state = Some(job.state);
        }
        services
            .store
            .update_model_jobs(
                model_id,
                &ModelJobUpdate {
                    train_job_state: train_state.as_str().to_string(),
                    eval_job_state: eval_state.map(|s| s.as_str().to_string()),
                    train_error_message: train_job.as_ref().and_then(|j| j.error_message.clone()),
                    eval_error_message: eval_job.as_ref().and_then(|j| j.error_message.clone()),
                    train_job_start_time: train_job.as_ref().and_then(|j| j.start_time),
                    train_job_end_time: train_job.as_ref().and_then(|j| j.end_time),
                },
            )
            .await?;

        if train_state.is_terminal() && model.training_minutes_charged.is_none() {
            charge(services, &model, train_job.as_ref()).await?;
        }

        let scan = scan_event_files(services, &team_id, &model).await?;
        let active_ms = (services.clock.now() - pass_start).num_milliseconds();
        services
            .store
            .update_monitor_progress(model_id, scan.max_step, &scan.changed_files, active_ms)
            .await?;
        debug!(
            model_id,
            train_state = train_state.as_str(),
            eval_state = eval_state.map(JobState::as_str),
            max_step = scan.max_step,
            changed_files = scan.changed_files.len(),
            "Monitoring pass done"
        );

        let eval_terminal = eval_state.is_none_or(JobState::is_terminal);
        if train_state.is_terminal() && !scan.new_progress {
            if eval_state == Some(JobState::Running)
                && let Some(job) = &model.eval_job_name
            {
                info!(model_id, job_id = %job, "Training is over, stopping evaluation");
                cancel_job(services, job, JobState::Running).await;
            }
            if eval_terminal {
                services.store.mark_monitor_finished(model_id).await?;
                info!(
                    model_id,
                    train_state = train_state.as_str(),
                    trained_steps = scan.max_step.max(model.trained_steps),
                    "Training monitor finished"
                );
                return Ok(Checkpoint::Continue);
            }
        }

        if inv.sleep_or_retrigger(POLL_INTERVAL).await?.is_suspend() {
            return Ok(Checkpoint::Suspend);
        }
    }
}

async fn poll_job(services: &ActionServices, job_id: &str) -> Option<TrainingJob> {
    match services.training.get_job(job_id).await {
        Ok(job) => Some(job),
        Err(e) => {
            warn!(job_id, error = %e, "Polling the training service failed, keeping the last state");
            None
        }
    }
}

async fn cancel_job(services: &ActionServices, job_id: &str, state: JobState) {
    if state.is_terminal() || state == JobState::Cancelling {
        return;
    }
    if let Err(e) = services.training.cancel_job(job_id).await {
        warn!(job_id, error = %e, "Cancelling a job failed");
    }
}

/// Minutes to charge for a training job that ran from `start` to `end`:
/// whole minutes rounded up, never more than the reservation.
pub fn minutes_to_charge(
    reserved: i64,
    start: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
) -> i64 {
    let Some(start) = start else {
        return 0;
    };
    let seconds = (end - start).num_seconds().max(0);
    let minutes = (seconds + 59) / 60;
    minutes.clamp(0, reserved.max(0))
}

async fn charge(services: &ActionServices, model: &Model, job: Option<&TrainingJob>) -> Result<()> {
    let start = job
        .and_then(|j| j.start_time)
        .or(model.train_job_start_time);
    let end = job
        .and_then(|j| j.end_time)
        .or(model.train_job_end_time)
        .unwrap_or_else(|| services.clock.now());
    let reserved = model.reserved_training_minutes;
    let charged = minutes_to_charge(reserved, start, end);
    let refund = reserved - charged;
    if services
        .store
        .charge_training_minutes(&model.model_id, charged, refund)
        .await?
    {
        info!(
            model_id = %model.model_id,
            team_id = %model.team_id,
            charged,
            refund,
            "Training minutes charged"
        );
    }
    Ok(())
}

struct EventScan {
    max_step: i64,
    changed_files: BTreeMap<String, DateTime<Utc>>,
    new_progress: bool,
}

async fn scan_event_files(services: &ActionServices, team_id: &str, model: &Model) -> Result<EventScan> {
    let mut scan = EventScan {
        max_step: 0,
        changed_files: BTreeMap::new(),
        new_progress: false,
    };
    let mut job_types = vec![TRAIN_JOB];
    if model.eval_job_name.is_some() {
        job_types.push(EVAL_JOB);
    }

    for job_type in job_types {
        let dir = model_job_dir(team_id, &model.model_id, job_type);
        for name in services.blobs.list(&dir).await? {
            if !file_name(&name).contains("tfevents") {
                continue;
            }
            let Some(updated) = services.blobs.updated(&name).await? else {
                continue;
            };
            if model.dict_event_file_path_to_updated.get(&name) == Some(&updated) {
                continue;
            }
            let bytes = match services.blobs.download(&name).await {
                Ok(bytes) => bytes,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            scan.changed_files.insert(name.clone(), updated);
            scan.new_progress = true;

            let entries = match parse_event_file(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(blob = %name, error = %e, "Unreadable event file");
                    continue;
                }
            };
            debug!(blob = %name, entries = entries.len(), "Event file parsed");
            for entry in entries {
                if job_type == TRAIN_JOB {
                    scan.max_step = scan.max_step.max(entry.step);
                }
                store_summary(services, team_id, model, job_type, entry).await?;
            }
        }
    }
    Ok(scan)
}

async fn store_summary(
    services: &ActionServices,
    team_id: &str,
    model: &Model,
    job_type: &str,
    entry: SummaryEntry,
) -> Result<()> {
    let mut item = ModelSummaryItem {
        model_id: model.model_id.clone(),
        job_type: job_type.to_string(),
        step: entry.step,
        tag: entry.tag,
        value_type: SummaryValueType::Scalar.as_str().to_string(),
        value: None,
        image_blob_name: None,
        image_width: None,
        image_height: None,
        update_time: services.clock.now(),
    };
    match entry.value {
        SummaryValue::Scalar(value) => item.value = Some(value),
        SummaryValue::Image {
            width,
            height,
            encoded,
        } => {
            let blob_name =
                summary_image_blob(team_id, &model.model_id, job_type, entry.step, &item.tag);
            services
                .blobs
                .upload(&blob_name, &encoded, "image/png")
                .await?;
            item.value_type = SummaryValueType::Image.as_str().to_string();
            item.image_blob_name = Some(blob_name);
            item.image_width = Some(width as i64);
            item.image_height = Some(height as i64);
        }
    }
    services.store.upsert_summary_item(&item).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 10, minute, second).unwrap()
    }

    #[test]
    fn charges_started_minutes() {
        assert_eq!(minutes_to_charge(60, Some(at(0, 0)), at(12, 0)), 12);
        assert_eq!(minutes_to_charge(60, Some(at(0, 0)), at(12, 1)), 13);
        assert_eq!(minutes_to_charge(60, Some(at(0, 0)), at(0, 0)), 0);
    }

    #[test]
    fn never_charges_more_than_reserved() {
        assert_eq!(minutes_to_charge(10, Some(at(0, 0)), at(45, 0)), 10);
    }

    #[test]
    fn jobs_that_never_ran_are_free() {
        assert_eq!(minutes_to_charge(60, None, at(30, 0)), 0);
    }
}
