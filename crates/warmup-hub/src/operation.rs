//! Seam to the model-loading subsystem.
//!
//! A warmup is an opaque async operation that reports milestones as a stream
//! and ends with `Completed` on success. An error item, or the stream ending
//! before `Completed`, is a failure. The scheduler maps milestones 1:1 onto
//! lifecycle states.

use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use warmup_core::{LifecycleState, ResourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    ModelFound,
    WeightsReady,
    SelfTestPassed,
    Completed,
}

impl Milestone {
    pub fn state(self) -> LifecycleState {
        match self {
            Milestone::ModelFound => LifecycleState::Loading,
            Milestone::WeightsReady => LifecycleState::WarmingUp,
            Milestone::SelfTestPassed => LifecycleState::Testing,
            Milestone::Completed => LifecycleState::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct WarmupFailure(pub String);

pub type MilestoneStream = BoxStream<'static, Result<Milestone, WarmupFailure>>;

pub trait WarmupOperation: Send + Sync + 'static {
    fn perform(&self, resource: &ResourceId) -> MilestoneStream;
}

/// Stand-in loader used by the hub binary: walks every milestone with a fixed
/// delay between them, failing after `WeightsReady` for configured resources.
#[derive(Debug, Clone)]
pub struct TimedWarmup {
    stage_delay: Duration,
    failing: HashSet<ResourceId>,
}

impl TimedWarmup {
    pub fn new(stage_delay: Duration) -> Self {
        Self {
            stage_delay,
            failing: HashSet::new(),
        }
    }

    pub fn failing<I>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = ResourceId>,
    {
        self.failing.extend(resources);
        self
    }
}

impl WarmupOperation for TimedWarmup {
    fn perform(&self, resource: &ResourceId) -> MilestoneStream {
        let steps: Vec<Result<Milestone, WarmupFailure>> = if self.failing.contains(resource) {
            vec![
                Ok(Milestone::ModelFound),
                Ok(Milestone::WeightsReady),
                Err(WarmupFailure(format!("self-test failed for {resource}"))),
            ]
        } else {
            vec![
                Ok(Milestone::ModelFound),
                Ok(Milestone::WeightsReady),
                Ok(Milestone::SelfTestPassed),
                Ok(Milestone::Completed),
            ]
        };
        let delay = self.stage_delay;
        stream::iter(steps)
            .then(move |step| async move {
                tokio::time::sleep(delay).await;
                step
            })
            .boxed()
    }
}
