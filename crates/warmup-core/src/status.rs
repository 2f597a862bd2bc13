use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub const ALL_TARGET: &str = "all";

/// Opaque name of a warmable unit (one model, typically).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Command target: one resource or the `"all"` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Target {
    All,
    Resource(ResourceId),
}

impl Target {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed == ALL_TARGET {
            Target::All
        } else {
            Target::Resource(ResourceId::new(trimmed))
        }
    }

    pub fn matches(&self, resource: &ResourceId) -> bool {
        match self {
            Target::All => true,
            Target::Resource(id) => id == resource,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Target::All => ALL_TARGET,
            Target::Resource(id) => id.as_str(),
        }
    }
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        Target::parse(&value)
    }
}

impl From<Target> for String {
    fn from(value: Target) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readiness of a resource.
///
/// `Idle` through `Active` are ordered by progress. `Error` is reachable from
/// any in-flight state and, like `Active`, stays put until a new warmup re-arms
/// the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Initiating,
    Loading,
    WarmingUp,
    Testing,
    Active,
    Error,
}

impl LifecycleState {
    pub const PIPELINE: [LifecycleState; 5] = [
        LifecycleState::Initiating,
        LifecycleState::Loading,
        LifecycleState::WarmingUp,
        LifecycleState::Testing,
        LifecycleState::Active,
    ];

    /// Representative percent shown for each stage. `Error` has no percent of
    /// its own; failed updates carry the last reached value instead.
    pub fn progress(self) -> u8 {
        match self {
            LifecycleState::Idle | LifecycleState::Initiating => 0,
            LifecycleState::Loading => 25,
            LifecycleState::WarmingUp => 60,
            LifecycleState::Testing => 85,
            LifecycleState::Active => 100,
            LifecycleState::Error => 0,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Active | LifecycleState::Error)
    }

    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            LifecycleState::Initiating
                | LifecycleState::Loading
                | LifecycleState::WarmingUp
                | LifecycleState::Testing
        )
    }

    fn rank(self) -> Option<u8> {
        match self {
            LifecycleState::Idle => Some(0),
            LifecycleState::Initiating => Some(1),
            LifecycleState::Loading => Some(2),
            LifecycleState::WarmingUp => Some(3),
            LifecycleState::Testing => Some(4),
            LifecycleState::Active => Some(5),
            LifecycleState::Error => None,
        }
    }

    /// True when moving from `self` to `next` is forward progress along the
    /// pipeline. Moving to `Error` counts as forward from any in-flight state.
    pub fn advances_to(self, next: LifecycleState) -> bool {
        if next == LifecycleState::Error {
            return self.is_in_flight();
        }
        match (self.rank(), next.rank()) {
            (Some(current), Some(next)) => next > current,
            _ => false,
        }
    }

    pub fn stage(self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Initiating => "initiating warmup",
            LifecycleState::Loading => "loading model",
            LifecycleState::WarmingUp => "warming up",
            LifecycleState::Testing => "running self-test",
            LifecycleState::Active => "ready",
            LifecycleState::Error => "failed",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Initiating => "initiating",
            LifecycleState::Loading => "loading",
            LifecycleState::WarmingUp => "warming_up",
            LifecycleState::Testing => "testing",
            LifecycleState::Active => "active",
            LifecycleState::Error => "error",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageDetails {
    pub stage: String,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One broadcast progress event. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdate {
    #[serde(rename = "model")]
    pub resource: ResourceId,
    #[serde(rename = "status")]
    pub state: LifecycleState,
    pub details: StageDetails,
    #[serde(
        rename = "processingTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub processing_time: Option<f64>,
}

impl StatusUpdate {
    pub fn idle(resource: ResourceId) -> Self {
        Self {
            resource,
            state: LifecycleState::Idle,
            details: StageDetails {
                stage: LifecycleState::Idle.stage().to_string(),
                progress: 0,
                error: None,
            },
            processing_time: None,
        }
    }

    pub fn transition(
        resource: ResourceId,
        state: LifecycleState,
        progress: u8,
        elapsed: Duration,
    ) -> Self {
        Self {
            resource,
            state,
            details: StageDetails {
                stage: state.stage().to_string(),
                progress: progress.min(100),
                error: None,
            },
            processing_time: Some(elapsed.as_secs_f64()),
        }
    }

    pub fn failed(
        resource: ResourceId,
        progress: u8,
        elapsed: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            resource,
            state: LifecycleState::Error,
            details: StageDetails {
                stage: LifecycleState::Error.stage().to_string(),
                progress: progress.min(100),
                error: Some(error.into()),
            },
            processing_time: Some(elapsed.as_secs_f64()),
        }
    }

    pub fn progress(&self) -> u8 {
        self.details.progress
    }

    pub fn error(&self) -> Option<&str> {
        self.details.error.as_deref()
    }
}

/// Per-resource entry of an `initial_status` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub status: LifecycleState,
    #[serde(flatten)]
    pub details: StageDetails,
}

impl From<&StatusUpdate> for ResourceSnapshot {
    fn from(update: &StatusUpdate) -> Self {
        Self {
            status: update.state,
            details: update.details.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitialStatus {
    #[serde(default)]
    pub models: BTreeMap<ResourceId, ResourceSnapshot>,
}

impl InitialStatus {
    pub fn get(&self, resource: &ResourceId) -> Option<&ResourceSnapshot> {
        self.models.get(resource)
    }
}
