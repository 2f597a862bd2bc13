//! Line-oriented rendering for `warmup-ctl`.

use crate::{dispatcher::UiEvent, transport::Tier};
use std::collections::{BTreeMap, BTreeSet};
use warmup_core::{Command, LifecycleState, ResourceId, Target};

fn tier_tag(tier: Option<Tier>) -> &'static str {
    tier.map(Tier::label).unwrap_or("offline")
}

fn describe(command: &Command) -> String {
    format!("{} {}", command.kind, command.target)
}

pub fn render(event: &UiEvent) -> Vec<String> {
    match event {
        UiEvent::Status { tier, update } => {
            let mut line = format!(
                "[{}] {} {} {}% {}",
                tier,
                update.resource,
                update.state,
                update.progress(),
                update.details.stage
            );
            if let Some(seconds) = update.processing_time {
                line.push_str(&format!(" ({seconds:.1}s)"));
            }
            if let Some(error) = update.error() {
                line.push_str(&format!(" error: {error}"));
            }
            vec![line]
        }
        UiEvent::Snapshot { tier, snapshot } => {
            if snapshot.models.is_empty() {
                return vec![format!("[{tier}] no resources")];
            }
            snapshot
                .models
                .iter()
                .map(|(resource, entry)| {
                    let mut line = format!(
                        "[{tier}] {resource} {} {}% {}",
                        entry.status, entry.details.progress, entry.details.stage
                    );
                    if let Some(error) = &entry.details.error {
                        line.push_str(&format!(" error: {error}"));
                    }
                    line
                })
                .collect()
        }
        UiEvent::TierChanged { from, to } => {
            vec![format!(
                "[{}] transport changed from {}",
                tier_tag(*to),
                tier_tag(*from)
            )]
        }
        UiEvent::Acknowledged { command, tier } => {
            vec![format!("[{tier}] {} acknowledged", describe(command))]
        }
        UiEvent::Rejected { command, reason } => {
            vec![format!("{} rejected: {reason}", describe(command))]
        }
        UiEvent::NotAcknowledged(command) => {
            vec![format!("{} not acknowledged", describe(command))]
        }
        UiEvent::Unsent { command, error } => {
            vec![format!("{} not sent: {error}", describe(command))]
        }
    }
}

/// Tracks a followed warmup until every targeted resource has reported a
/// fresh terminal state.
#[derive(Debug)]
pub struct FollowState {
    client_id: String,
    target: Target,
    acknowledged: bool,
    latest: BTreeMap<ResourceId, LifecycleState>,
    fresh: BTreeSet<ResourceId>,
}

impl FollowState {
    pub fn new(client_id: String, target: Target) -> Self {
        Self {
            client_id,
            target,
            acknowledged: false,
            latest: BTreeMap::new(),
            fresh: BTreeSet::new(),
        }
    }

    pub fn observe(&mut self, event: &UiEvent) {
        match event {
            UiEvent::Acknowledged { command, .. } if command.client_id == self.client_id => {
                self.acknowledged = true;
            }
            UiEvent::Status { update, .. } if self.target.matches(&update.resource) => {
                self.latest.insert(update.resource.clone(), update.state);
                self.fresh.insert(update.resource.clone());
            }
            // Snapshots queued before the ack may predate the run.
            UiEvent::Snapshot { snapshot, .. } => {
                for (resource, entry) in &snapshot.models {
                    if !self.target.matches(resource) {
                        continue;
                    }
                    self.latest.insert(resource.clone(), entry.status);
                    if self.acknowledged {
                        self.fresh.insert(resource.clone());
                    }
                }
            }
            _ => {}
        }
    }

    pub fn is_done(&self) -> bool {
        self.acknowledged
            && !self.latest.is_empty()
            && self
                .latest
                .iter()
                .all(|(resource, state)| state.is_terminal() && self.fresh.contains(resource))
    }

    pub fn failed(&self) -> Vec<&ResourceId> {
        self.latest
            .iter()
            .filter(|(_, state)| **state == LifecycleState::Error)
            .map(|(resource, _)| resource)
            .collect()
    }
}
