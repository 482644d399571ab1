// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for fmltc-actions integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use fmltc_actions::prepare::{
    get_or_create_team, prepare_dataset, prepare_video_upload, start_frame_extraction,
    store_frame_bboxes,
};
use fmltc_actions::resumption::FixedMemoryProbe;
use fmltc_actions::training::InMemoryTrainingService;
use fmltc_actions::{ActionDispatcher, ActionServices, ActionSettings, DispatchOutcome};
use fmltc_core::blob::{BlobStore, FsBlobStore};
use fmltc_core::clock::ManualClock;
use fmltc_core::config_store::{ConfigStore, MemoryConfigStore};
use fmltc_core::persistence::{Persistence, SqlitePersistence};
use fmltc_core::queue::{ActionQueue, BlobActionQueue};
use fmltc_media::video::InMemoryOpener;

/// Safety net against handlers that never stop retriggering.
const MAX_ROUNDS: usize = 500;

/// Everything an action needs, backed by a temp directory and fakes.
pub struct TestContext {
    pub services: ActionServices,
    pub store: Arc<SqlitePersistence>,
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<BlobActionQueue>,
    pub config_store: Arc<MemoryConfigStore>,
    pub clock: Arc<ManualClock>,
    pub training: Arc<InMemoryTrainingService>,
    pub memory: Arc<FixedMemoryProbe>,
    pub team_id: String,
    pub temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Context whose videos decode to six 64x48 frames at 30 fps.
    pub async fn new() -> Self {
        Self::with_opener(InMemoryOpener::solid(6, 64, 48, 30.0)).await
    }

    pub async fn with_opener(opener: InMemoryOpener) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let database_url = format!("sqlite:{}", temp_dir.path().join("db/fmltc.db").display());
        let store = Arc::new(
            SqlitePersistence::connect(&database_url)
                .await
                .expect("connect"),
        );
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(
            temp_dir.path().join("blobs"),
            "http://test/blobs",
            "test-key",
        ));
        let queue = Arc::new(BlobActionQueue::new(blobs.clone()));
        let config_store = Arc::new(MemoryConfigStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
        ));
        let training = Arc::new(InMemoryTrainingService::new());
        let memory = Arc::new(FixedMemoryProbe::new(0));

        let services = ActionServices {
            store: store.clone(),
            blobs: blobs.clone(),
            queue: queue.clone(),
            config_store: config_store.clone(),
            clock: clock.clone(),
            training: training.clone(),
            video_opener: Arc::new(opener),
            memory: memory.clone(),
            settings: ActionSettings::default(),
        };
        let team = get_or_create_team(&services, "FTC/Team 11115")
            .await
            .expect("team");

        Self {
            services,
            store,
            blobs,
            queue,
            config_store,
            clock,
            training,
            memory,
            team_id: team.team_id,
            temp_dir,
        }
    }

    pub fn dispatcher(&self) -> ActionDispatcher {
        ActionDispatcher::new(self.services.clone())
    }

    /// Dispatcher whose invocations hand over after every unit of work: a
    /// budget inside the retrigger headroom is always nearly spent.
    pub fn forced_retrigger_dispatcher(&self) -> ActionDispatcher {
        let mut services = self.services.clone();
        services.settings.time_budget = Duration::from_secs(60);
        ActionDispatcher::new(services)
    }

    pub async fn set_limit(&self, key: &str, value: &str) {
        self.config_store.set(key, value).await.expect("set limit");
    }

    /// Dispatch every item currently in the queue, once.
    pub async fn run_pending_once(&self, dispatcher: &ActionDispatcher) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();
        for item in self.queue.pending().await.expect("pending") {
            outcomes.push(dispatcher.dispatch(&item).await);
        }
        outcomes
    }

    /// Dispatch until the queue stays empty.
    pub async fn run_until_idle(&self, dispatcher: &ActionDispatcher) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..MAX_ROUNDS {
            let round = self.run_pending_once(dispatcher).await;
            if round.is_empty() {
                return outcomes;
            }
            outcomes.extend(round);
        }
        panic!("queue did not drain after {MAX_ROUNDS} rounds");
    }

    pub async fn drain(&self) -> Vec<DispatchOutcome> {
        self.run_until_idle(&self.dispatcher()).await
    }

    /// Create a video and upload its (ignored) bytes.
    pub async fn uploaded_video(&self) -> String {
        let upload = prepare_video_upload(
            &self.services,
            &self.team_id,
            "qualification match 12",
            "match12.mp4",
            1024,
            "video/mp4",
        )
        .await
        .expect("prepare upload");
        self.blobs
            .upload(&upload.video.blob_name, b"not really mp4", "video/mp4")
            .await
            .expect("upload video");
        upload.video.video_id
    }

    /// An uploaded video whose frames are extracted.
    pub async fn extracted_video(&self) -> String {
        let video_id = self.uploaded_video().await;
        start_frame_extraction(&self.services, &self.team_id, &video_id)
            .await
            .expect("start extraction");
        self.drain().await;
        video_id
    }

    /// Give every frame of `video_id` one box, alternating between two
    /// labels. Every third frame is left unlabeled.
    pub async fn label_frames(&self, video_id: &str) {
        let video = self
            .store
            .get_video(&self.team_id, video_id)
            .await
            .expect("video");
        for frame_number in 0..video.extracted_frame_count {
            let text = match frame_number % 3 {
                0 => "4,4,20,20,cone\n",
                1 => "10,8,30,28,ball\n",
                _ => "",
            };
            store_frame_bboxes(&self.services, &self.team_id, video_id, frame_number, text)
                .await
                .expect("store boxes");
        }
    }

    /// A labeled video turned into a completed dataset.
    pub async fn completed_dataset(&self) -> String {
        let video_id = self.extracted_video().await;
        self.label_frames(&video_id).await;
        let (dataset, _) = prepare_dataset(
            &self.services,
            &self.team_id,
            "cones and balls",
            &[video_id],
            20.0,
        )
        .await
        .expect("prepare dataset");
        self.drain().await;
        dataset.dataset_id
    }

    pub async fn remaining_minutes(&self) -> i64 {
        self.store
            .get_team(&self.team_id)
            .await
            .expect("team")
            .remaining_training_minutes
    }
}
