//! Ranked transport tiers behind one API.
//!
//! The fallback is a state machine over the index of the active tier. It
//! walks down on connect failure, send failure, a closed connection or a
//! silent tier, and periodically retries the tiers above the active one.
//! Each tier connection gets a fresh generation; events stamped with an older
//! generation are dropped.

use crate::{
    error::TransportError,
    health::HealthMonitor,
    transport::{EventSink, Tier, TierEvent, Transport, TransportEvent},
};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};
use tokio::{
    sync::mpsc,
    time::{interval_at, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use warmup_core::{Command, CommandKind, Target};

#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub reconnect_interval: Duration,
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
    pub housekeeping_interval: Duration,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            ping_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(15),
            housekeeping_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FallbackEvent {
    /// An event from a current tier connection, tagged with its tier.
    Transport { tier: Tier, event: TransportEvent },
    TierChanged {
        from: Option<Tier>,
        to: Option<Tier>,
    },
    /// Housekeeping ran; lets the owner do its own periodic work.
    Tick,
}

struct Slot {
    transport: Box<dyn Transport>,
    generation: u64,
    live: bool,
}

pub struct FallbackTransport {
    slots: Vec<Slot>,
    active: Option<usize>,
    draining: Option<usize>,
    pending_resync: bool,
    events_tx: mpsc::UnboundedSender<TierEvent>,
    events_rx: mpsc::UnboundedReceiver<TierEvent>,
    queued: VecDeque<FallbackEvent>,
    health: HealthMonitor,
    reconnect: Interval,
    housekeeping: Interval,
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl FallbackTransport {
    /// Tiers are ranked by [`Tier`] order regardless of the order given.
    pub fn new(mut tiers: Vec<Box<dyn Transport>>, settings: FallbackSettings) -> Self {
        tiers.sort_by_key(|transport| transport.tier());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            slots: tiers
                .into_iter()
                .map(|transport| Slot {
                    transport,
                    generation: 0,
                    live: false,
                })
                .collect(),
            active: None,
            draining: None,
            pending_resync: false,
            events_tx,
            events_rx,
            queued: VecDeque::new(),
            health: HealthMonitor::new(
                settings.ping_interval,
                settings.liveness_timeout,
                Instant::now(),
            ),
            reconnect: ticker(settings.reconnect_interval),
            housekeeping: ticker(settings.housekeeping_interval),
        }
    }

    pub fn active_tier(&self) -> Option<Tier> {
        self.active.map(|index| self.slots[index].transport.tier())
    }

    pub fn tiers(&self) -> Vec<Tier> {
        self.slots.iter().map(|slot| slot.transport.tier()).collect()
    }

    /// Connects the best reachable tier.
    pub async fn start(&mut self) -> Result<Tier, TransportError> {
        let next = self.activate_from(0).await;
        self.set_active(next);
        self.active_tier().ok_or(TransportError::NoTier)
    }

    /// Sends on the active tier. A failure demotes and retries once on the
    /// next tier before the error is surfaced.
    pub async fn send(&mut self, command: Command) -> Result<Tier, TransportError> {
        if self.active.is_none() {
            let next = self.activate_from(0).await;
            self.set_active(next);
        }
        let mut retried = false;
        loop {
            let Some(index) = self.active else {
                return Err(TransportError::NoTier);
            };
            let tier = self.slots[index].transport.tier();
            match self.slots[index].transport.send(command.clone()).await {
                Ok(()) => {
                    debug!(event = "command_sent", tier = %tier, kind = %command.kind, client_id = %command.client_id);
                    return Ok(tier);
                }
                Err(err) => {
                    warn!(event = "send_failed", tier = %tier, error = %err);
                    self.demote("send_failed").await;
                    if retried {
                        return Err(err);
                    }
                    retried = true;
                }
            }
        }
    }

    /// Waits for the next event worth reporting. Returns `Tick` after each
    /// housekeeping pass. Dropping the future mid-promotion abandons that
    /// connect attempt; the next reconnect tick retries it.
    pub async fn next_event(&mut self) -> FallbackEvent {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return event;
            }
            tokio::select! {
                biased;
                received = self.events_rx.recv() => {
                    if let Some(received) = received {
                        if let Some(event) = self.accept(received).await {
                            return event;
                        }
                    }
                }
                _ = self.reconnect.tick() => {
                    if self.active != Some(0) {
                        self.try_promote().await;
                    }
                }
                _ = self.housekeeping.tick() => {
                    self.housekeep().await;
                    return FallbackEvent::Tick;
                }
            }
        }
    }

    pub fn close(&mut self) {
        for index in 0..self.slots.len() {
            self.close_slot(index);
        }
        self.set_active(None);
    }

    async fn accept(&mut self, received: TierEvent) -> Option<FallbackEvent> {
        let TierEvent {
            slot,
            generation,
            event,
        } = received;
        let current = self.slots.get(slot)?;
        let tier = current.transport.tier();
        if current.generation != generation {
            debug!(event = "stale_event_dropped", tier = %tier, generation);
            return None;
        }
        if let TransportEvent::Closed(reason) = &event {
            if self.active == Some(slot) {
                self.demote(reason).await;
            } else {
                debug!(event = "inactive_tier_closed", tier = %tier, reason = %reason);
            }
            return None;
        }
        if self.active == Some(slot) {
            self.health.observe(Instant::now());
        }
        Some(FallbackEvent::Transport { tier, event })
    }

    async fn connect_slot(&mut self, index: usize) -> bool {
        if self.draining == Some(index) && self.slots[index].live {
            self.draining = None;
            self.pending_resync = false;
            return true;
        }
        let generation = {
            let slot = &mut self.slots[index];
            slot.generation += 1;
            slot.generation
        };
        let sink = EventSink::new(index, generation, self.events_tx.clone());
        let slot = &mut self.slots[index];
        let tier = slot.transport.tier();
        match slot.transport.connect(sink).await {
            Ok(()) => {
                slot.live = true;
                true
            }
            Err(err) => {
                debug!(event = "tier_connect_failed", tier = %tier, error = %err);
                slot.transport.close();
                slot.live = false;
                false
            }
        }
    }

    async fn activate_from(&mut self, start: usize) -> Option<usize> {
        for index in start..self.slots.len() {
            if self.connect_slot(index).await {
                return Some(index);
            }
        }
        None
    }

    fn close_slot(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.transport.close();
        slot.live = false;
        slot.generation += 1;
        if self.draining == Some(index) {
            self.draining = None;
            self.pending_resync = false;
        }
    }

    fn set_active(&mut self, next: Option<usize>) {
        let previous = self.active;
        if previous == next {
            return;
        }
        self.active = next;
        self.health.reset(Instant::now());
        let from = previous.map(|index| self.slots[index].transport.tier());
        let to = next.map(|index| self.slots[index].transport.tier());
        info!(event = "tier_changed", from = ?from, to = ?to);
        self.queued.push_back(FallbackEvent::TierChanged { from, to });
    }

    async fn demote(&mut self, reason: &str) {
        let Some(current) = self.active else {
            return;
        };
        warn!(
            event = "tier_demoted",
            tier = %self.slots[current].transport.tier(),
            reason = %reason
        );
        self.close_slot(current);
        let next = self.activate_from(current + 1).await;
        self.set_active(next);
    }

    async fn try_promote(&mut self) {
        let limit = self.active.unwrap_or(self.slots.len());
        for index in 0..limit {
            if self.connect_slot(index).await {
                if let Some(previous) = self.active {
                    self.retire(previous);
                }
                self.set_active(Some(index));
                return;
            }
        }
    }

    /// Leaves a tier that still has runs of its own open until they finish;
    /// a fresh snapshot is requested from the new tier afterwards.
    fn retire(&mut self, index: usize) {
        let in_flight = self.slots[index].transport.in_flight();
        if in_flight > 0 {
            info!(
                event = "tier_draining",
                tier = %self.slots[index].transport.tier(),
                in_flight
            );
            self.draining = Some(index);
            self.pending_resync = true;
        } else {
            self.close_slot(index);
        }
    }

    async fn housekeep(&mut self) {
        if let Some(index) = self.draining {
            if self.slots[index].transport.in_flight() == 0 {
                let resync = self.pending_resync;
                // Keep the generation so events already queued still arrive.
                self.slots[index].transport.close();
                self.slots[index].live = false;
                self.draining = None;
                self.pending_resync = false;
                if resync {
                    self.resync().await;
                }
            }
        }

        let Some(index) = self.active else {
            return;
        };
        let now = Instant::now();
        let transport = &self.slots[index].transport;
        if transport.tier() == Tier::Simulated {
            return;
        }
        if !transport.is_healthy() {
            self.demote("unhealthy").await;
            return;
        }
        if self.health.is_stale(now) {
            warn!(
                event = "liveness_timeout",
                tier = %transport.tier(),
                silent_ms = self.health.silence(now).as_millis() as u64
            );
            self.demote("liveness_timeout").await;
            return;
        }
        if self.health.ping_due(now) {
            self.health.mark_ping(now);
            let ping = Command::new(CommandKind::Ping, Target::All);
            if let Err(err) = self.slots[index].transport.send(ping).await {
                warn!(event = "ping_failed", error = %err);
                self.demote("ping_failed").await;
            }
        }
    }

    async fn resync(&mut self) {
        info!(event = "resync_requested");
        if let Err(err) = self.send(Command::new(CommandKind::QueryStatus, Target::All)).await {
            warn!(event = "resync_failed", error = %err);
        }
    }
}
