//! Capability shared by every transport tier.
//!
//! A tier pushes whatever it receives into an [`EventSink`] handed to it on
//! `connect`. The sink is stamped with the tier slot and a connection
//! generation so the fallback can discard events from a connection it has
//! already replaced.

use crate::error::TransportError;
use futures_util::future::BoxFuture;
use std::fmt;
use tokio::sync::mpsc;
use warmup_core::{
    Command, CommandAck, InitialStatus, Pong, ServerEnvelope, ServerMessage, StatusUpdate,
};

/// Transport ranking, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Push,
    RequestResponse,
    Simulated,
}

impl Tier {
    pub fn label(self) -> &'static str {
        match self {
            Tier::Push => "push-active",
            Tier::RequestResponse => "request/response-only",
            Tier::Simulated => "simulated",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(StatusUpdate),
    Snapshot(InitialStatus),
    Ack(CommandAck),
    Pong(Pong),
    /// The tier connection is gone; carries a short reason.
    Closed(String),
}

impl From<ServerEnvelope> for TransportEvent {
    fn from(envelope: ServerEnvelope) -> Self {
        match envelope.msg {
            ServerMessage::StatusUpdate(update) => TransportEvent::Status(update),
            ServerMessage::InitialStatus(snapshot) => TransportEvent::Snapshot(snapshot),
            ServerMessage::CommandAck(ack) => TransportEvent::Ack(ack),
            ServerMessage::Pong(pong) => TransportEvent::Pong(pong),
        }
    }
}

#[derive(Debug)]
pub struct TierEvent {
    pub slot: usize,
    pub generation: u64,
    pub event: TransportEvent,
}

#[derive(Debug, Clone)]
pub struct EventSink {
    slot: usize,
    generation: u64,
    tx: mpsc::UnboundedSender<TierEvent>,
}

impl EventSink {
    pub fn new(slot: usize, generation: u64, tx: mpsc::UnboundedSender<TierEvent>) -> Self {
        Self {
            slot,
            generation,
            tx,
        }
    }

    /// Returns false once the fallback is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TierEvent {
                slot: self.slot,
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub trait Transport: Send {
    fn tier(&self) -> Tier;

    /// Opens the tier and starts delivering events into `sink`.
    fn connect(&mut self, sink: EventSink) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Hands a command to the tier. Replies arrive as events.
    fn send(&mut self, command: Command) -> BoxFuture<'_, Result<(), TransportError>>;

    fn is_healthy(&self) -> bool;

    fn close(&mut self);

    /// Work the tier itself is still producing events for.
    fn in_flight(&self) -> usize {
        0
    }
}
