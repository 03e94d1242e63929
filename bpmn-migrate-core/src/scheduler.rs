//! Timer scheduler collaborator.
//!
//! Only registration lifecycle is modelled here; firing belongs to the
//! scheduler itself.

use crate::types::*;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler unavailable: {0}")]
    Unavailable(String),

    #[error("Scheduler rejected timer for {activity_id}: {reason}")]
    Rejected {
        activity_id: ActivityId,
        reason: String,
    },
}

#[async_trait]
pub trait TimerScheduler: Send + Sync {
    async fn schedule_timer(
        &self,
        execution_id: ExecutionId,
        activity_id: &str,
        schedule: &TimerSchedule,
    ) -> Result<TimerJobId, SchedulerError>;

    /// Cancelling an unknown timer succeeds.
    async fn cancel_timer(&self, timer_job_id: TimerJobId) -> Result<(), SchedulerError>;

    /// Re-register a cancelled job under its original id.
    async fn restore_timer(&self, job: &TimerJob) -> Result<(), SchedulerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredTimer {
    pub execution_id: ExecutionId,
    pub activity_id: ActivityId,
    pub schedule: TimerSchedule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCall {
    Schedule(TimerJobId),
    Cancel(TimerJobId),
    Restore(TimerJobId),
}

#[derive(Debug)]
struct SchedulerState {
    timers: BTreeMap<TimerJobId, RegisteredTimer>,
    available: bool,
    /// Calls still allowed to succeed before the injected failure.
    remaining: Option<usize>,
    /// The injected failure hits one call only.
    transient: bool,
    calls: Vec<SchedulerCall>,
}

/// In-process scheduler with availability toggling and failure injection.
#[derive(Debug)]
pub struct MemoryScheduler {
    state: Mutex<SchedulerState>,
}

impl Default for MemoryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                timers: BTreeMap::new(),
                available: true,
                remaining: None,
                transient: false,
                calls: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SchedulerState>, SchedulerError> {
        self.state
            .lock()
            .map_err(|e| SchedulerError::Unavailable(format!("Lock: {}", e)))
    }

    pub fn set_available(&self, available: bool) {
        if let Ok(mut state) = self.lock() {
            state.available = available;
        }
    }

    /// Let the next `calls` calls succeed, then fail every call after them.
    pub fn fail_after(&self, calls: usize) {
        self.inject(calls, false);
    }

    /// Let the next `calls` calls succeed, fail the one after them, then
    /// recover.
    pub fn fail_once_after(&self, calls: usize) {
        self.inject(calls, true);
    }

    /// Drop any injected failure.
    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.lock() {
            state.remaining = None;
        }
    }

    fn inject(&self, calls: usize, transient: bool) {
        if let Ok(mut state) = self.lock() {
            state.remaining = Some(calls);
            state.transient = transient;
        }
    }

    pub fn is_registered(&self, timer_job_id: TimerJobId) -> bool {
        self.lock()
            .map(|s| s.timers.contains_key(&timer_job_id))
            .unwrap_or(false)
    }

    pub fn registered(&self) -> BTreeMap<TimerJobId, RegisteredTimer> {
        self.lock().map(|s| s.timers.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<SchedulerCall> {
        self.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    fn admit(state: &mut SchedulerState) -> Result<(), SchedulerError> {
        if !state.available {
            return Err(SchedulerError::Unavailable("scheduler offline".into()));
        }
        match state.remaining {
            Some(0) => {
                if state.transient {
                    state.remaining = None;
                }
                Err(SchedulerError::Unavailable("injected failure".into()))
            }
            Some(n) => {
                state.remaining = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TimerScheduler for MemoryScheduler {
    async fn schedule_timer(
        &self,
        execution_id: ExecutionId,
        activity_id: &str,
        schedule: &TimerSchedule,
    ) -> Result<TimerJobId, SchedulerError> {
        let mut state = self.lock()?;
        Self::admit(&mut state)?;
        let id = Uuid::now_v7();
        state.timers.insert(
            id,
            RegisteredTimer {
                execution_id,
                activity_id: activity_id.to_string(),
                schedule: schedule.clone(),
            },
        );
        state.calls.push(SchedulerCall::Schedule(id));
        Ok(id)
    }

    async fn cancel_timer(&self, timer_job_id: TimerJobId) -> Result<(), SchedulerError> {
        let mut state = self.lock()?;
        Self::admit(&mut state)?;
        state.timers.remove(&timer_job_id);
        state.calls.push(SchedulerCall::Cancel(timer_job_id));
        Ok(())
    }

    async fn restore_timer(&self, job: &TimerJob) -> Result<(), SchedulerError> {
        let mut state = self.lock()?;
        Self::admit(&mut state)?;
        state.timers.insert(
            job.id,
            RegisteredTimer {
                execution_id: job.execution_id,
                activity_id: job.activity_id.clone(),
                schedule: job.schedule.clone(),
            },
        );
        state.calls.push(SchedulerCall::Restore(job.id));
        Ok(())
    }
}
