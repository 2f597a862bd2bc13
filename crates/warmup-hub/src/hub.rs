use crate::scheduler::{Admission, Published, WarmupScheduler};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use warmup_core::{Command, CommandAck, CommandKind, InitialStatus, ServerEnvelope};

/// Item on a connection's outbound queue, drained by its socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Envelope(ServerEnvelope),
    Ping,
    Close(String),
}

pub struct Connection {
    conn_id: String,
    remote: Option<SocketAddr>,
    sender: mpsc::Sender<Outbound>,
    last_seen: AsyncMutex<Instant>,
    /// Sequence of the newest update this connection already holds, either
    /// as a status frame or through a snapshot.
    covered: AsyncMutex<u64>,
}

impl Connection {
    pub fn new(conn_id: String, remote: Option<SocketAddr>, sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            conn_id,
            remote,
            sender,
            last_seen: AsyncMutex::new(Instant::now()),
            covered: AsyncMutex::new(0),
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub async fn touch(&self) {
        let mut last = self.last_seen.lock().await;
        *last = Instant::now();
    }

    pub async fn last_seen(&self) -> Instant {
        let last = self.last_seen.lock().await;
        *last
    }

    fn enqueue(&self, envelope: ServerEnvelope) -> Result<(), &'static str> {
        match self.sender.try_send(Outbound::Envelope(envelope)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err("closed"),
            Err(mpsc::error::TrySendError::Full(_)) => Err("slow_consumer"),
        }
    }

    fn close(&self, reason: &str) {
        let _ = self.sender.try_send(Outbound::Close(reason.to_string()));
    }
}

#[derive(Clone, Debug)]
pub struct HubSettings {
    pub ping_interval: Duration,
    pub max_missed_pings: u32,
}

/// Reply to one command: an optional direct response followed by the ack.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub reply: Option<ServerEnvelope>,
    pub ack: CommandAck,
}

impl CommandReply {
    pub fn into_messages(self) -> Vec<ServerEnvelope> {
        let mut messages = Vec::with_capacity(2);
        if let Some(reply) = self.reply {
            messages.push(reply);
        }
        messages.push(ServerEnvelope::ack(self.ack));
        messages
    }
}

pub struct BroadcastHub {
    settings: HubSettings,
    conn_counter: AtomicU64,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    scheduler: Arc<WarmupScheduler>,
}

impl BroadcastHub {
    pub fn new(scheduler: Arc<WarmupScheduler>, settings: HubSettings) -> Self {
        Self {
            settings,
            conn_counter: AtomicU64::new(0),
            connections: RwLock::new(HashMap::new()),
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &Arc<WarmupScheduler> {
        &self.scheduler
    }

    pub fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn snapshot(&self) -> InitialStatus {
        self.scheduler.snapshot().await.0
    }

    /// Queues a fresh snapshot on `connection`. Updates it already covers are
    /// skipped by later broadcasts, and nothing newer can be queued ahead of
    /// it while `covered` is held.
    async fn send_snapshot(&self, connection: &Connection) -> Result<(), &'static str> {
        let mut covered = connection.covered.lock().await;
        let (snapshot, seq) = self.scheduler.snapshot().await;
        connection.enqueue(ServerEnvelope::snapshot(snapshot))?;
        *covered = (*covered).max(seq);
        Ok(())
    }

    /// Registers a connection and queues its `initial_status`. Holding the
    /// registry write lock keeps broadcasts out until both are done, so the
    /// client sees every update newer than its snapshot and none older.
    pub async fn on_connect(&self, connection: Arc<Connection>) -> bool {
        let mut connections = self.connections.write().await;
        if let Err(reason) = self.send_snapshot(&connection).await {
            warn!(event = "snapshot_error", conn_id = %connection.conn_id, reason);
            return false;
        }
        connections.insert(connection.conn_id.clone(), connection.clone());
        info!(
            event = "client_connected",
            conn_id = %connection.conn_id,
            remote = ?connection.remote,
            total = connections.len()
        );
        true
    }

    pub async fn on_disconnect(&self, conn_id: &str, reason: &str) -> bool {
        let removed = self.connections.write().await.remove(conn_id);
        match removed {
            Some(connection) => {
                connection.close(reason);
                info!(event = "client_disconnected", conn_id = conn_id, reason = reason);
                true
            }
            None => false,
        }
    }

    pub async fn on_message(&self, connection: &Connection, raw: &str) {
        let command = match Command::parse(raw) {
            Ok(value) => value,
            Err(rejected) => {
                warn!(
                    event = "command_rejected",
                    conn_id = %connection.conn_id,
                    reason = rejected.reason
                );
                self.send_to(connection, ServerEnvelope::ack(rejected.into_ack()))
                    .await;
                return;
            }
        };
        debug!(
            event = "command_received",
            conn_id = %connection.conn_id,
            kind = %command.kind,
            target = %command.target,
            client_id = %command.client_id
        );
        if command.kind == CommandKind::QueryStatus {
            if let Err(reason) = self.send_snapshot(connection).await {
                warn!(event = "send_error", conn_id = %connection.conn_id, reason);
                self.on_disconnect(&connection.conn_id, reason).await;
                return;
            }
            self.send_to(
                connection,
                ServerEnvelope::ack(CommandAck::accepted(command.client_id)),
            )
            .await;
            return;
        }
        for message in self.execute(command).await.into_messages() {
            if !self.send_to(connection, message).await {
                return;
            }
        }
    }

    /// Runs a validated command. Shared by the WebSocket and HTTP surfaces.
    pub async fn execute(&self, command: Command) -> CommandReply {
        match command.kind {
            CommandKind::Ping => CommandReply {
                reply: Some(ServerEnvelope::pong(Some(command.client_id.clone()))),
                ack: CommandAck::accepted(command.client_id),
            },
            CommandKind::QueryStatus => CommandReply {
                reply: Some(ServerEnvelope::snapshot(self.snapshot().await)),
                ack: CommandAck::accepted(command.client_id),
            },
            CommandKind::Warmup => match self.scheduler.request_warmup(&command.target).await {
                Ok(admissions) => {
                    let attached = admissions
                        .iter()
                        .filter(|(_, admission)| *admission == Admission::Attached)
                        .count();
                    info!(
                        event = "warmup_accepted",
                        target = %command.target,
                        client_id = %command.client_id,
                        spawned = admissions.len() - attached,
                        attached
                    );
                    CommandReply {
                        reply: None,
                        ack: CommandAck::accepted(command.client_id),
                    }
                }
                Err(err) => {
                    warn!(event = "warmup_rejected", target = %command.target, error = %err);
                    CommandReply {
                        reply: None,
                        ack: CommandAck::rejected(command.client_id, err.reason()),
                    }
                }
            },
        }
    }

    /// Pushes a published update to every connection that does not already
    /// cover it. A full or closed queue drops only that connection.
    pub async fn broadcast(&self, published: Published) {
        let Published { seq, update } = published;
        let connections = self.connections.read().await;
        let envelope = ServerEnvelope::status(update);
        let mut failed = Vec::new();
        for (conn_id, connection) in connections.iter() {
            let mut covered = connection.covered.lock().await;
            if seq <= *covered {
                continue;
            }
            match connection.enqueue(envelope.clone()) {
                Ok(()) => *covered = seq,
                Err(reason) => {
                    warn!(event = "send_error", conn_id = %conn_id, reason);
                    failed.push((conn_id.clone(), reason));
                }
            }
        }
        drop(connections);

        for (conn_id, reason) in failed {
            self.on_disconnect(&conn_id, reason).await;
        }
    }

    async fn send_to(&self, connection: &Connection, envelope: ServerEnvelope) -> bool {
        match connection.enqueue(envelope) {
            Ok(()) => true,
            Err(reason) => {
                warn!(event = "send_error", conn_id = %connection.conn_id, reason);
                self.on_disconnect(&connection.conn_id, reason).await;
                false
            }
        }
    }

    /// Drains scheduler updates into broadcasts. One consumer keeps
    /// per-resource ordering intact.
    pub fn spawn_fanout(
        self: Arc<Self>,
        mut updates: mpsc::UnboundedReceiver<Published>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(published) = updates.recv().await {
                self.broadcast(published).await;
            }
            debug!(event = "fanout_stopped");
        })
    }

    pub fn start_liveness_reaper(self: Arc<Self>) {
        if self.settings.ping_interval.is_zero() || self.settings.max_missed_pings == 0 {
            return;
        }
        let interval = self.settings.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.reap_stale_once().await;
            }
        });
    }

    async fn reap_stale_once(&self) -> usize {
        let interval = self.settings.ping_interval;
        let connections = self
            .connections
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        let mut reaped = 0;
        for connection in connections {
            let silent = Instant::now().duration_since(connection.last_seen().await);
            let missed = (silent.as_millis() / interval.as_millis().max(1)) as u32;
            if missed >= self.settings.max_missed_pings {
                warn!(event = "stale_close", conn_id = %connection.conn_id, missed);
                if self.on_disconnect(&connection.conn_id, "stale").await {
                    reaped += 1;
                }
            }
        }
        reaped
    }

    pub fn start_ping(self: Arc<Self>, connection: Arc<Connection>) {
        if self.settings.ping_interval.is_zero() {
            return;
        }
        let interval = self.settings.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if connection.sender.send(Outbound::Ping).await.is_err() {
                    debug!(event = "ping_stopped", conn_id = %connection.conn_id);
                    self.on_disconnect(&connection.conn_id, "ping_failed").await;
                    return;
                }
            }
        });
    }
}
