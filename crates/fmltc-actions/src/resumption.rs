// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resumption controller.
//!
//! One [`Invocation`] is one time- and memory-boxed run of an action.
//! Handlers call [`Invocation::retrigger_if_necessary`] after every unit of
//! work. When the deadline is within [`RETRIGGER_HEADROOM`] or the process
//! uses more memory than allowed, the invocation records its stop time,
//! enqueues its own payload as the successor and answers
//! [`Checkpoint::Suspend`]; the handler then returns and the successor picks
//! up from the state the handler persisted.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fmltc_core::CoreError;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info};

use crate::action::ActionParameters;
use crate::services::ActionServices;
use crate::trigger::trigger_via_queue;

/// Time left before the deadline at which an invocation hands over.
pub const RETRIGGER_HEADROOM: Duration = Duration::from_secs(70);

/// Result of a checkpoint.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// Keep going.
    Continue,
    /// A successor was scheduled; return now.
    Suspend,
}

impl Checkpoint {
    /// True for [`Checkpoint::Suspend`].
    pub fn is_suspend(self) -> bool {
        self == Checkpoint::Suspend
    }
}

/// Reports the memory in use by this process.
pub trait MemoryProbe: Send + Sync {
    /// Resident bytes, `None` when unknown.
    fn active_memory_bytes(&self) -> Option<u64>;
}

/// [`MemoryProbe`] backed by `sysinfo`.
pub struct SysinfoMemoryProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl SysinfoMemoryProbe {
    /// Probe the current process.
    pub fn new() -> Self {
        Self {
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoMemoryProbe {
    fn active_memory_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory())
    }
}

/// [`MemoryProbe`] reporting a fixed value.
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    bytes: std::sync::atomic::AtomicU64,
}

impl FixedMemoryProbe {
    /// Report `bytes`.
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Change the reported value.
    pub fn set(&self, bytes: u64) {
        self.bytes
            .store(bytes, std::sync::atomic::Ordering::Relaxed);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn active_memory_bytes(&self) -> Option<u64> {
        Some(self.bytes.load(std::sync::atomic::Ordering::Relaxed))
    }
}

/// One run of an action.
pub struct Invocation<'a> {
    services: &'a ActionServices,
    params: ActionParameters,
    deadline: DateTime<Utc>,
}

impl<'a> Invocation<'a> {
    /// Start an invocation of `params`. The deadline is always now plus the
    /// configured budget; a `time_limit` already on `params` is replaced.
    pub fn new(services: &'a ActionServices, mut params: ActionParameters) -> Self {
        let deadline = services.clock.now()
            + TimeDelta::from_std(services.settings.time_budget).unwrap_or(TimeDelta::zero());
        params.time_limit = Some(deadline);
        Self {
            services,
            params,
            deadline,
        }
    }

    /// Collaborators.
    pub fn services(&self) -> &'a ActionServices {
        self.services
    }

    /// The payload being executed.
    pub fn params(&self) -> &ActionParameters {
        &self.params
    }

    /// Owner of the action.
    pub fn team_id(&self) -> &str {
        &self.params.team_id
    }

    /// Whether this invocation already scheduled its successor.
    pub fn retriggered(&self) -> bool {
        self.params.retriggered
    }

    /// Deadline of this invocation.
    pub fn time_limit(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Time left until the deadline; negative once it passed.
    pub fn remaining(&self) -> TimeDelta {
        self.deadline - self.services.clock.now()
    }

    /// Whether the next checkpoint would hand over to a successor.
    pub fn needs_retrigger(&self) -> bool {
        let headroom = TimeDelta::from_std(RETRIGGER_HEADROOM).unwrap_or(TimeDelta::zero());
        if self.remaining() <= headroom {
            return true;
        }
        match self.services.memory.active_memory_bytes() {
            Some(used) => used >= self.services.settings.active_memory_limit_bytes,
            None => false,
        }
    }

    /// Schedule the successor (once) and answer [`Checkpoint::Suspend`].
    pub async fn retrigger_now(&mut self) -> Result<Checkpoint, CoreError> {
        if self.params.retriggered {
            return Ok(Checkpoint::Suspend);
        }
        let now = self.services.clock.now();
        if let Some(action_id) = &self.params.action_id {
            self.services.store.record_action_stop(action_id, now).await?;
        }
        let outcome = trigger_via_queue(self.services, &self.params).await?;
        self.params.retriggered = true;
        info!(
            action_id = %outcome.action_id(),
            action_name = self.params.action_name(),
            remaining_secs = self.remaining().num_seconds(),
            "Action retriggered"
        );
        Ok(Checkpoint::Suspend)
    }

    /// Hand over to a successor when time or memory runs short.
    pub async fn retrigger_if_necessary(&mut self) -> Result<Checkpoint, CoreError> {
        if self.params.retriggered || self.needs_retrigger() {
            return self.retrigger_now().await;
        }
        Ok(Checkpoint::Continue)
    }

    /// Sleep for `duration` unless that would run into the headroom, in
    /// which case hand over instead.
    pub async fn sleep_or_retrigger(&mut self, duration: Duration) -> Result<Checkpoint, CoreError> {
        let needed = TimeDelta::from_std(RETRIGGER_HEADROOM + duration).unwrap_or(TimeDelta::MAX);
        if self.params.retriggered || self.remaining() <= needed {
            return self.retrigger_now().await;
        }
        debug!(sleep_ms = duration.as_millis() as u64, "Polling sleep");
        self.services.clock.sleep(duration).await;
        self.retrigger_if_necessary().await
    }
}
