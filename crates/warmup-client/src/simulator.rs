use crate::{
    error::TransportError,
    transport::{EventSink, Tier, Transport, TransportEvent},
};
use futures_util::{future::BoxFuture, FutureExt};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use warmup_core::{
    now_ms, Command, CommandAck, CommandKind, InitialStatus, LifecycleState, Pong, ResourceId,
    ResourceSnapshot, StatusUpdate, Target,
};

#[derive(Default)]
struct SimState {
    statuses: BTreeMap<ResourceId, StatusUpdate>,
    runs: HashMap<ResourceId, JoinHandle<()>>,
    sink: Option<EventSink>,
}

impl SimState {
    fn emit(&self, event: TransportEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    fn snapshot(&self) -> InitialStatus {
        InitialStatus {
            models: self
                .statuses
                .iter()
                .map(|(resource, update)| (resource.clone(), ResourceSnapshot::from(update)))
                .collect(),
        }
    }
}

/// Last-resort local tier. Walks the same lifecycle as the hub on a timer so
/// the UI keeps working with no service at all. Never fails.
pub struct SimulatedTransport {
    resources: Vec<ResourceId>,
    step: Duration,
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimulatedTransport {
    pub fn new(resources: Vec<ResourceId>, step: Duration) -> Self {
        let statuses = resources
            .iter()
            .map(|resource| (resource.clone(), StatusUpdate::idle(resource.clone())))
            .collect();
        Self {
            resources,
            step,
            state: Arc::new(Mutex::new(SimState {
                statuses,
                ..SimState::default()
            })),
        }
    }

    fn start_run(&self, state: &mut SimState, resource: ResourceId) {
        let started = Instant::now();
        let initiating = StatusUpdate::transition(
            resource.clone(),
            LifecycleState::Initiating,
            LifecycleState::Initiating.progress(),
            Duration::ZERO,
        );
        state.statuses.insert(resource.clone(), initiating.clone());
        state.emit(TransportEvent::Status(initiating));

        let shared = self.state.clone();
        let step = self.step;
        let run_resource = resource.clone();
        let handle = tokio::spawn(async move {
            for next in &LifecycleState::PIPELINE[1..] {
                tokio::time::sleep(step).await;
                let mut state = lock(&shared);
                let update = StatusUpdate::transition(
                    run_resource.clone(),
                    *next,
                    next.progress(),
                    started.elapsed(),
                );
                state.statuses.insert(run_resource.clone(), update.clone());
                if next.is_terminal() {
                    state.runs.remove(&run_resource);
                }
                state.emit(TransportEvent::Status(update));
            }
            debug!(event = "simulated_run_done", resource = %run_resource);
        });
        state.runs.insert(resource, handle);
    }

    fn handle(&self, command: Command) {
        let mut state = lock(&self.state);
        match command.kind {
            CommandKind::Warmup => {
                let targets = match &command.target {
                    Target::All => self.resources.clone(),
                    Target::Resource(resource) if self.resources.contains(resource) => {
                        vec![resource.clone()]
                    }
                    Target::Resource(_) => {
                        state.emit(TransportEvent::Ack(CommandAck::rejected(
                            command.client_id,
                            "unknown_resource",
                        )));
                        return;
                    }
                };
                for resource in targets {
                    if !state.runs.contains_key(&resource) {
                        self.start_run(&mut state, resource);
                    }
                }
            }
            CommandKind::Ping => {
                state.emit(TransportEvent::Pong(Pong {
                    timestamp: now_ms(),
                    client_id: Some(command.client_id.clone()),
                }));
            }
            CommandKind::QueryStatus => {
                let snapshot = state.snapshot();
                state.emit(TransportEvent::Snapshot(snapshot));
            }
        }
        state.emit(TransportEvent::Ack(CommandAck::accepted(command.client_id)));
    }
}

impl Transport for SimulatedTransport {
    fn tier(&self) -> Tier {
        Tier::Simulated
    }

    fn connect(&mut self, sink: EventSink) -> BoxFuture<'_, Result<(), TransportError>> {
        let mut state = lock(&self.state);
        state.sink = Some(sink);
        let snapshot = state.snapshot();
        state.emit(TransportEvent::Snapshot(snapshot));
        info!(event = "simulator_connected", resources = self.resources.len());
        futures_util::future::ready(Ok(())).boxed()
    }

    fn send(&mut self, command: Command) -> BoxFuture<'_, Result<(), TransportError>> {
        self.handle(command);
        futures_util::future::ready(Ok(())).boxed()
    }

    fn is_healthy(&self) -> bool {
        true
    }

    /// Stops any running walk; interrupted resources fall back to idle.
    fn close(&mut self) {
        let mut state = lock(&self.state);
        state.sink = None;
        let interrupted: Vec<ResourceId> = state.runs.keys().cloned().collect();
        for resource in interrupted {
            if let Some(run) = state.runs.remove(&resource) {
                run.abort();
            }
            state
                .statuses
                .insert(resource.clone(), StatusUpdate::idle(resource));
        }
    }

    fn in_flight(&self) -> usize {
        lock(&self.state).runs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TierEvent;
    use tokio::sync::mpsc;

    async fn next(rx: &mut mpsc::UnboundedReceiver<TierEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event timeout")
            .expect("channel open")
            .event
    }

    fn simulator() -> SimulatedTransport {
        SimulatedTransport::new(
            vec![ResourceId::from("stylevae"), ResourceId::from("transitionnet")],
            Duration::from_millis(5),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn warmup_walks_pipeline_to_active() {
        let mut sim = simulator();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sim.connect(EventSink::new(2, 1, tx)).await.expect("connect");
        assert!(matches!(next(&mut rx).await, TransportEvent::Snapshot(_)));

        let command = Command::new(
            CommandKind::Warmup,
            Target::Resource(ResourceId::from("stylevae")),
        );
        sim.send(command.clone()).await.expect("send");
        assert_eq!(sim.in_flight(), 1);

        let mut states = Vec::new();
        let mut acked = false;
        while states.last() != Some(&LifecycleState::Active) {
            match next(&mut rx).await {
                TransportEvent::Status(update) => states.push(update.state),
                TransportEvent::Ack(ack) => {
                    assert_eq!(ack.client_id, command.client_id);
                    acked = true;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(acked);
        assert_eq!(states, LifecycleState::PIPELINE.to_vec());
        assert_eq!(sim.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_resource_is_rejected() {
        let mut sim = simulator();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sim.connect(EventSink::new(2, 1, tx)).await.expect("connect");
        next(&mut rx).await;

        sim.send(Command::new(
            CommandKind::Warmup,
            Target::Resource(ResourceId::from("ghost")),
        ))
        .await
        .expect("send");
        let TransportEvent::Ack(ack) = next(&mut rx).await else {
            panic!("expected ack")
        };
        assert!(!ack.accepted);
        assert_eq!(ack.reason.as_deref(), Some("unknown_resource"));
        assert_eq!(sim.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_interrupts_runs() {
        let mut sim = SimulatedTransport::new(
            vec![ResourceId::from("stylevae")],
            Duration::from_secs(5),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        sim.connect(EventSink::new(2, 1, tx)).await.expect("connect");
        sim.send(Command::new(CommandKind::Warmup, Target::All))
            .await
            .expect("send");
        assert_eq!(sim.in_flight(), 1);
        sim.close();
        assert_eq!(sim.in_flight(), 0);
        assert!(sim.is_healthy());
    }
}
