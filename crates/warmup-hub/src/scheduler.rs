use crate::operation::{Milestone, WarmupFailure, WarmupOperation};
use futures_util::StreamExt;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use warmup_core::{
    InitialStatus, LifecycleState, ResourceId, ResourceSnapshot, StatusUpdate, Target,
};

/// One in-flight warmup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupTask {
    pub resource: ResourceId,
    pub run_id: u64,
    pub started_at: Instant,
    pub state: LifecycleState,
    pub progress: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A new run was spawned from Idle or Error.
    Started,
    /// An Active resource was reset to Initiating and rerun.
    Rearmed,
    /// A run was already in flight; nothing was spawned.
    Attached,
}

/// A status change stamped with its position in the scheduler's publish order.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub seq: u64,
    pub update: StatusUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("unknown resource: {0}")]
    UnknownResource(ResourceId),
}

impl SchedulerError {
    pub fn reason(&self) -> &'static str {
        match self {
            SchedulerError::UnknownResource(_) => "unknown_resource",
        }
    }
}

struct Slot {
    state: LifecycleState,
    task: Option<WarmupTask>,
    latest: StatusUpdate,
}

pub struct WarmupScheduler {
    resources: Vec<ResourceId>,
    operation: Arc<dyn WarmupOperation>,
    max_duration: Duration,
    slots: Mutex<HashMap<ResourceId, Slot>>,
    updates: mpsc::UnboundedSender<Published>,
    run_counter: AtomicU64,
    /// Only advanced while `slots` is locked.
    publish_seq: AtomicU64,
}

impl WarmupScheduler {
    /// Builds a scheduler over a fixed resource catalog. Every status change
    /// is recorded as the resource's latest state and published, in order, on
    /// the returned receiver.
    pub fn new(
        resources: Vec<ResourceId>,
        operation: Arc<dyn WarmupOperation>,
        max_duration: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Published>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let slots = resources
            .iter()
            .map(|resource| {
                (
                    resource.clone(),
                    Slot {
                        state: LifecycleState::Idle,
                        task: None,
                        latest: StatusUpdate::idle(resource.clone()),
                    },
                )
            })
            .collect();
        let scheduler = Arc::new(Self {
            resources,
            operation,
            max_duration,
            slots: Mutex::new(slots),
            updates: tx,
            run_counter: AtomicU64::new(0),
            publish_seq: AtomicU64::new(0),
        });
        (scheduler, rx)
    }

    pub fn resources(&self) -> &[ResourceId] {
        &self.resources
    }

    /// Admits a warmup for one resource or all of them. The returned
    /// admissions confirm that a run exists for every targeted resource.
    pub async fn request_warmup(
        self: &Arc<Self>,
        target: &Target,
    ) -> Result<Vec<(ResourceId, Admission)>, SchedulerError> {
        let targets = match target {
            Target::All => self.resources.clone(),
            Target::Resource(resource) => {
                if !self.resources.contains(resource) {
                    return Err(SchedulerError::UnknownResource(resource.clone()));
                }
                vec![resource.clone()]
            }
        };

        let mut admissions = Vec::with_capacity(targets.len());
        let mut spawned = Vec::new();
        {
            let mut slots = self.slots.lock().await;
            for resource in targets {
                let Some(slot) = slots.get_mut(&resource) else {
                    continue;
                };
                if slot.task.is_some() {
                    debug!(event = "warmup_attached", resource = %resource);
                    admissions.push((resource, Admission::Attached));
                    continue;
                }
                let admission = if slot.state == LifecycleState::Active {
                    Admission::Rearmed
                } else {
                    Admission::Started
                };
                let run_id = self.run_counter.fetch_add(1, Ordering::SeqCst) + 1;
                slot.state = LifecycleState::Initiating;
                slot.task = Some(WarmupTask {
                    resource: resource.clone(),
                    run_id,
                    started_at: Instant::now(),
                    state: LifecycleState::Initiating,
                    progress: LifecycleState::Initiating.progress(),
                });
                self.publish(
                    slot,
                    StatusUpdate::transition(
                        resource.clone(),
                        LifecycleState::Initiating,
                        LifecycleState::Initiating.progress(),
                        Duration::ZERO,
                    ),
                );
                info!(event = "warmup_started", resource = %resource, run_id, admission = ?admission);
                spawned.push((resource.clone(), run_id));
                admissions.push((resource, admission));
            }
        }

        for (resource, run_id) in spawned {
            self.spawn_run(resource, run_id);
        }
        Ok(admissions)
    }

    /// Latest recorded status of every resource, with the sequence number of
    /// the newest update it reflects. Recording happens before fan-out, so
    /// this can be ahead of what connections have been sent.
    pub async fn snapshot(&self) -> (InitialStatus, u64) {
        let slots = self.slots.lock().await;
        let models = self
            .resources
            .iter()
            .filter_map(|resource| {
                slots
                    .get(resource)
                    .map(|slot| (resource.clone(), ResourceSnapshot::from(&slot.latest)))
            })
            .collect();
        (InitialStatus { models }, self.publish_seq.load(Ordering::SeqCst))
    }

    pub async fn task(&self, resource: &ResourceId) -> Option<WarmupTask> {
        self.slots
            .lock()
            .await
            .get(resource)
            .and_then(|slot| slot.task.clone())
    }

    pub async fn state_of(&self, resource: &ResourceId) -> Option<LifecycleState> {
        self.slots.lock().await.get(resource).map(|slot| slot.state)
    }

    pub async fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| slot.task.is_some())
            .count()
    }

    fn spawn_run(self: &Arc<Self>, resource: ResourceId, run_id: u64) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            // The operation runs in its own task so a panic surfaces as a JoinError.
            let mut handle = tokio::spawn(Arc::clone(&scheduler).drive(resource.clone(), run_id));
            let failure = match tokio::time::timeout(scheduler.max_duration, &mut handle).await {
                Ok(Ok(Ok(()))) => return,
                Ok(Ok(Err(failure))) => failure.0,
                Ok(Err(err)) if err.is_panic() => "warmup operation panicked".to_string(),
                Ok(Err(_)) => "warmup operation cancelled".to_string(),
                Err(_) => {
                    handle.abort();
                    format!(
                        "warmup exceeded maximum duration of {}s",
                        scheduler.max_duration.as_secs_f64()
                    )
                }
            };
            scheduler.fail(&resource, run_id, failure).await;
        });
    }

    async fn drive(self: Arc<Self>, resource: ResourceId, run_id: u64) -> Result<(), WarmupFailure> {
        let mut milestones = self.operation.perform(&resource);
        while let Some(step) = milestones.next().await {
            let milestone = step?;
            self.advance(&resource, run_id, milestone.state()).await;
            if milestone == Milestone::Completed {
                return Ok(());
            }
        }
        Err(WarmupFailure(
            "warmup ended before reaching active".to_string(),
        ))
    }

    async fn advance(&self, resource: &ResourceId, run_id: u64, state: LifecycleState) {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(resource) else {
            return;
        };
        let Some(task) = slot.task.as_mut().filter(|task| task.run_id == run_id) else {
            return;
        };
        if !task.state.advances_to(state) {
            debug!(event = "milestone_ignored", resource = %resource, from = %task.state, to = %state);
            return;
        }
        let progress = task.progress.max(state.progress());
        task.state = state;
        task.progress = progress;
        let elapsed = task.started_at.elapsed();
        slot.state = state;
        self.publish(
            slot,
            StatusUpdate::transition(resource.clone(), state, progress, elapsed),
        );
        if state.is_terminal() {
            slot.task = None;
            info!(
                event = "warmup_active",
                resource = %resource,
                run_id,
                elapsed_ms = elapsed.as_millis() as u64
            );
        } else {
            debug!(event = "warmup_stage", resource = %resource, state = %state, progress);
        }
    }

    async fn fail(&self, resource: &ResourceId, run_id: u64, error: String) {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(resource) else {
            return;
        };
        if slot.task.as_ref().map(|task| task.run_id) != Some(run_id) {
            return;
        }
        let Some(task) = slot.task.take() else {
            return;
        };
        slot.state = LifecycleState::Error;
        warn!(event = "warmup_failed", resource = %resource, run_id, error = %error);
        self.publish(
            slot,
            StatusUpdate::failed(
                resource.clone(),
                task.progress,
                task.started_at.elapsed(),
                error,
            ),
        );
    }

    fn publish(&self, slot: &mut Slot, update: StatusUpdate) {
        slot.latest = update.clone();
        let seq = self.publish_seq.fetch_add(1, Ordering::SeqCst) + 1;
        if self.updates.send(Published { seq, update }).is_err() {
            debug!(event = "status_channel_closed");
        }
    }
}
