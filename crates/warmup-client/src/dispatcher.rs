use crate::{
    error::TransportError,
    fallback::{FallbackEvent, FallbackTransport},
    transport::{Tier, TransportEvent},
};
use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};
use tracing::{debug, warn};
use warmup_core::{
    Command, CommandAck, CommandKind, InitialStatus, Pong, StatusUpdate, Target,
};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// What the UI gets to see.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Status {
        tier: Tier,
        update: StatusUpdate,
    },
    Snapshot {
        tier: Tier,
        snapshot: InitialStatus,
    },
    TierChanged {
        from: Option<Tier>,
        to: Option<Tier>,
    },
    Acknowledged {
        command: Command,
        tier: Tier,
    },
    Rejected {
        command: Command,
        reason: String,
    },
    NotAcknowledged(Command),
    Unsent {
        command: Command,
        error: String,
    },
}

struct Pending {
    command: Command,
    /// Only replies from this tier resolve the command.
    tier: Tier,
    issued: Instant,
}

/// Turns intents into commands and matches replies back to them. A reply
/// counts only when it comes from the tier the command went out on, so a
/// draining simulator never answers for a real service. Commands are never
/// retried; an unanswered one is reported once and forgotten.
pub struct CommandDispatcher {
    transport: FallbackTransport,
    ack_timeout: Duration,
    pending: HashMap<String, Pending>,
    ready: VecDeque<UiEvent>,
}

impl CommandDispatcher {
    pub fn new(transport: FallbackTransport, ack_timeout: Duration) -> Self {
        Self {
            transport,
            ack_timeout,
            pending: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    pub async fn start(&mut self) -> Result<Tier, TransportError> {
        self.transport.start().await
    }

    pub fn active_tier(&self) -> Option<Tier> {
        self.transport.active_tier()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Sends a fresh command and returns its client id. The outcome arrives
    /// later through [`CommandDispatcher::next_event`].
    pub async fn issue(&mut self, kind: CommandKind, target: Target) -> String {
        let command = Command::new(kind, target);
        let client_id = command.client_id.clone();
        match self.transport.send(command.clone()).await {
            Ok(tier) => {
                debug!(event = "command_pending", client_id = %client_id, tier = %tier);
                self.pending.insert(
                    client_id.clone(),
                    Pending {
                        command,
                        tier,
                        issued: Instant::now(),
                    },
                );
            }
            Err(err) => {
                warn!(event = "command_unsent", client_id = %client_id, error = %err);
                self.ready.push_back(UiEvent::Unsent {
                    command,
                    error: err.to_string(),
                });
            }
        }
        client_id
    }

    pub async fn next_event(&mut self) -> UiEvent {
        loop {
            self.expire(Instant::now());
            if let Some(event) = self.ready.pop_front() {
                return event;
            }
            let event = self.transport.next_event().await;
            self.handle(event);
        }
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Drops pending commands older than the ack timeout, reporting each.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired: Vec<(Instant, String)> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.issued) >= self.ack_timeout)
            .map(|(client_id, pending)| (pending.issued, client_id.clone()))
            .collect();
        expired.sort();
        for (_, client_id) in &expired {
            if let Some(pending) = self.pending.remove(client_id) {
                warn!(
                    event = "command_not_acknowledged",
                    client_id = %client_id,
                    kind = %pending.command.kind
                );
                self.ready
                    .push_back(UiEvent::NotAcknowledged(pending.command));
            }
        }
        expired.len()
    }

    fn handle(&mut self, event: FallbackEvent) {
        match event {
            FallbackEvent::Tick => {}
            FallbackEvent::TierChanged { from, to } => {
                self.ready.push_back(UiEvent::TierChanged { from, to });
            }
            FallbackEvent::Transport { tier, event } => match event {
                TransportEvent::Ack(ack) => self.resolve_ack(tier, ack),
                TransportEvent::Status(update) => {
                    self.resolve_warmups(tier, &update);
                    self.ready.push_back(UiEvent::Status { tier, update });
                }
                TransportEvent::Snapshot(snapshot) => {
                    self.ready.push_back(UiEvent::Snapshot { tier, snapshot });
                }
                TransportEvent::Pong(pong) => self.resolve_pong(tier, pong),
                TransportEvent::Closed(_) => {}
            },
        }
    }

    /// Removes the pending entry for `client_id` if it was sent on `tier`.
    fn take_pending(&mut self, client_id: &str, tier: Tier) -> Option<Pending> {
        match self.pending.get(client_id) {
            Some(pending) if pending.tier == tier => self.pending.remove(client_id),
            Some(pending) => {
                debug!(
                    event = "reply_from_other_tier",
                    client_id = %client_id,
                    sent_on = %pending.tier,
                    tier = %tier
                );
                None
            }
            None => None,
        }
    }

    fn resolve_ack(&mut self, tier: Tier, ack: CommandAck) {
        let Some(pending) = self.take_pending(&ack.client_id, tier) else {
            debug!(event = "unmatched_ack", client_id = %ack.client_id);
            return;
        };
        if ack.accepted {
            self.ready.push_back(UiEvent::Acknowledged {
                command: pending.command,
                tier,
            });
        } else {
            self.ready.push_back(UiEvent::Rejected {
                command: pending.command,
                reason: ack.reason.unwrap_or_else(|| "rejected".to_string()),
            });
        }
    }

    /// A status update for a targeted resource proves the warmup landed.
    fn resolve_warmups(&mut self, tier: Tier, update: &StatusUpdate) {
        let mut matched: Vec<(Instant, String)> = self
            .pending
            .iter()
            .filter(|(_, pending)| {
                pending.tier == tier
                    && pending.command.kind == CommandKind::Warmup
                    && pending.command.target.matches(&update.resource)
            })
            .map(|(client_id, pending)| (pending.issued, client_id.clone()))
            .collect();
        matched.sort();
        for (_, client_id) in matched {
            if let Some(pending) = self.pending.remove(&client_id) {
                self.ready.push_back(UiEvent::Acknowledged {
                    command: pending.command,
                    tier,
                });
            }
        }
    }

    fn resolve_pong(&mut self, tier: Tier, pong: Pong) {
        let Some(client_id) = pong.client_id else {
            return;
        };
        let is_ping = self
            .pending
            .get(&client_id)
            .is_some_and(|pending| pending.command.kind == CommandKind::Ping);
        if !is_ping {
            return;
        }
        if let Some(pending) = self.take_pending(&client_id, tier) {
            self.ready.push_back(UiEvent::Acknowledged {
                command: pending.command,
                tier,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::{
        tests::{quiet_settings, FakeControl},
        FallbackSettings,
    };
    use warmup_core::{now_ms, LifecycleState, ResourceId};

    fn dispatcher(control: &FakeControl, ack_timeout: Duration) -> CommandDispatcher {
        let transport = FallbackTransport::new(
            vec![control.tier(Tier::RequestResponse)],
            FallbackSettings {
                housekeeping_interval: Duration::from_millis(10),
                ..quiet_settings()
            },
        );
        CommandDispatcher::new(transport, ack_timeout)
    }

    async fn wait_for<F>(dispatcher: &mut CommandDispatcher, mut wanted: F) -> UiEvent
    where
        F: FnMut(&UiEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let event = dispatcher.next_event().await;
                if wanted(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("ui event timeout")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ack_resolves_pending_command() {
        let control = FakeControl::new(true, true);
        let mut dispatcher = dispatcher(&control, DEFAULT_ACK_TIMEOUT);
        dispatcher.start().await.expect("start");
        assert_eq!(
            dispatcher.next_event().await,
            UiEvent::TierChanged {
                from: None,
                to: Some(Tier::RequestResponse)
            }
        );

        let client_id = dispatcher.issue(CommandKind::QueryStatus, Target::All).await;
        assert_eq!(dispatcher.pending_count(), 1);
        let UiEvent::Acknowledged { command, tier } = dispatcher.next_event().await else {
            panic!("expected acknowledgement")
        };
        assert_eq!(command.client_id, client_id);
        assert_eq!(tier, Tier::RequestResponse);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_update_for_target_resolves_warmup() {
        let control = FakeControl::new(true, true);
        control.set_auto_ack(false);
        let mut dispatcher = dispatcher(&control, DEFAULT_ACK_TIMEOUT);
        dispatcher.start().await.expect("start");

        let client_id = dispatcher
            .issue(
                CommandKind::Warmup,
                Target::Resource(ResourceId::from("stylevae")),
            )
            .await;
        let unrelated = StatusUpdate::idle(ResourceId::from("transitionnet"));
        let related = StatusUpdate::transition(
            ResourceId::from("stylevae"),
            LifecycleState::Initiating,
            0,
            Duration::ZERO,
        );
        control.emit(TransportEvent::Status(unrelated.clone()));
        control.emit(TransportEvent::Status(related.clone()));

        let UiEvent::Status { update, .. } =
            wait_for(&mut dispatcher, |event| matches!(event, UiEvent::Status { .. })).await
        else {
            unreachable!()
        };
        assert_eq!(update, unrelated);
        assert_eq!(dispatcher.pending_count(), 1);

        let UiEvent::Acknowledged { command, .. } = dispatcher.next_event().await else {
            panic!("expected acknowledgement before the status")
        };
        assert_eq!(command.client_id, client_id);
        assert_eq!(
            dispatcher.next_event().await,
            UiEvent::Status {
                tier: Tier::RequestResponse,
                update: related
            }
        );
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn draining_simulator_never_resolves_real_command() {
        let push = FakeControl::new(false, true);
        let sim = FakeControl::new(true, true);
        let transport = FallbackTransport::new(
            vec![push.tier(Tier::Push), sim.tier(Tier::Simulated)],
            FallbackSettings {
                reconnect_interval: Duration::from_millis(30),
                housekeeping_interval: Duration::from_millis(10),
                ..quiet_settings()
            },
        );
        let mut dispatcher = CommandDispatcher::new(transport, DEFAULT_ACK_TIMEOUT);
        assert_eq!(dispatcher.start().await.expect("start"), Tier::Simulated);
        sim.set_in_flight(1);
        push.set_auto_ack(false);
        push.set_connect_ok(true);
        wait_for(&mut dispatcher, |event| {
            matches!(
                event,
                UiEvent::TierChanged {
                    to: Some(Tier::Push),
                    ..
                }
            )
        })
        .await;

        let client_id = dispatcher
            .issue(
                CommandKind::Warmup,
                Target::Resource(ResourceId::from("stylevae")),
            )
            .await;
        let simulated = StatusUpdate::transition(
            ResourceId::from("stylevae"),
            LifecycleState::Loading,
            25,
            Duration::from_millis(5),
        );
        assert!(sim.emit(TransportEvent::Status(simulated.clone())));
        assert!(sim.emit(TransportEvent::Ack(CommandAck::accepted(client_id.clone()))));
        let event = wait_for(&mut dispatcher, |event| {
            matches!(event, UiEvent::Status { .. } | UiEvent::Acknowledged { .. })
        })
        .await;
        assert_eq!(
            event,
            UiEvent::Status {
                tier: Tier::Simulated,
                update: simulated
            }
        );
        assert_eq!(dispatcher.pending_count(), 1);

        let real = StatusUpdate::transition(
            ResourceId::from("stylevae"),
            LifecycleState::Initiating,
            0,
            Duration::ZERO,
        );
        assert!(push.emit(TransportEvent::Status(real)));
        let event = wait_for(&mut dispatcher, |event| {
            matches!(event, UiEvent::Acknowledged { .. })
        })
        .await;
        assert!(matches!(
            event,
            UiEvent::Acknowledged { command, tier: Tier::Push } if command.client_id == client_id
        ));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejection_is_reported_with_reason() {
        let control = FakeControl::new(true, true);
        control.set_auto_ack(false);
        let mut dispatcher = dispatcher(&control, DEFAULT_ACK_TIMEOUT);
        dispatcher.start().await.expect("start");

        let client_id = dispatcher
            .issue(
                CommandKind::Warmup,
                Target::Resource(ResourceId::from("ghost")),
            )
            .await;
        control.emit(TransportEvent::Ack(CommandAck::rejected(
            client_id.clone(),
            "unknown_resource",
        )));
        let event = wait_for(&mut dispatcher, |event| {
            matches!(event, UiEvent::Rejected { .. })
        })
        .await;
        let UiEvent::Rejected { command, reason } = event else {
            unreachable!()
        };
        assert_eq!(command.client_id, client_id);
        assert_eq!(reason, "unknown_resource");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn matching_pong_resolves_ping() {
        let control = FakeControl::new(true, true);
        control.set_auto_ack(false);
        let mut dispatcher = dispatcher(&control, DEFAULT_ACK_TIMEOUT);
        dispatcher.start().await.expect("start");

        let client_id = dispatcher.issue(CommandKind::Ping, Target::All).await;
        control.emit(TransportEvent::Pong(Pong {
            timestamp: now_ms(),
            client_id: Some(client_id.clone()),
        }));
        let event = wait_for(&mut dispatcher, |event| {
            matches!(event, UiEvent::Acknowledged { .. })
        })
        .await;
        let UiEvent::Acknowledged { command, .. } = event else {
            unreachable!()
        };
        assert_eq!(command.client_id, client_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unanswered_command_expires_once() {
        let control = FakeControl::new(true, true);
        control.set_auto_ack(false);
        let mut dispatcher = dispatcher(&control, Duration::from_millis(50));
        dispatcher.start().await.expect("start");

        let client_id = dispatcher.issue(CommandKind::QueryStatus, Target::All).await;
        let event = wait_for(&mut dispatcher, |event| {
            matches!(event, UiEvent::NotAcknowledged(_))
        })
        .await;
        assert!(matches!(event, UiEvent::NotAcknowledged(command) if command.client_id == client_id));
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(control.sent_kinds(), vec![CommandKind::QueryStatus]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn command_without_any_tier_is_unsent() {
        let control = FakeControl::new(false, true);
        let mut dispatcher = dispatcher(&control, DEFAULT_ACK_TIMEOUT);
        assert!(dispatcher.start().await.is_err());

        dispatcher.issue(CommandKind::Ping, Target::All).await;
        assert!(matches!(
            dispatcher.next_event().await,
            UiEvent::Unsent { .. }
        ));
        assert_eq!(dispatcher.pending_count(), 0);
    }
}
