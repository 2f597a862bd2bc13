use crate::{
    error::TransportError,
    transport::{EventSink, Tier, Transport, TransportEvent},
};
use futures_util::{future::BoxFuture, FutureExt};
use reqwest::{Client, StatusCode};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use warmup_core::{Command, CommandAck, CommandKind, InitialStatus, ServerEnvelope, ServerMessage};

/// Request/response tier against the hub's HTTP endpoints. Progress is seen
/// by polling `/api/status` while the tier is connected.
pub struct HttpTransport {
    base: Url,
    client: Client,
    poll_interval: Duration,
    sink: Option<EventSink>,
    healthy: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
    /// Counts admitted warmups. A poll begun under an older count is dropped,
    /// so no pre-warmup snapshot is delivered after the ack.
    admitted: Arc<Mutex<u64>>,
}

impl HttpTransport {
    pub fn new(
        base: Url,
        request_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            base,
            client,
            poll_interval,
            sink: None,
            healthy: Arc::new(AtomicBool::new(false)),
            poller: None,
            admitted: Arc::new(Mutex::new(0)),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path)
            .map_err(|err| TransportError::Http(format!("bad endpoint {path}: {err}")))
    }

    async fn open(&mut self, sink: EventSink) -> Result<(), TransportError> {
        self.close();
        let ping = self.endpoint("/api/ping")?;
        let status_url = self.endpoint("/api/status")?;
        fetch_envelope(self.client.get(ping)).await?;
        let snapshot = fetch_status(&self.client, status_url.clone()).await?;
        sink.emit(TransportEvent::Snapshot(snapshot));

        let healthy = Arc::new(AtomicBool::new(true));
        if !self.poll_interval.is_zero() {
            let client = self.client.clone();
            let poll_sink = sink.clone();
            let poll_healthy = healthy.clone();
            let admitted = self.admitted.clone();
            let period = self.poll_interval;
            self.poller = Some(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    let epoch = *lock(&admitted);
                    match fetch_status(&client, status_url.clone()).await {
                        Ok(snapshot) => {
                            let current = lock(&admitted);
                            if *current != epoch {
                                debug!(event = "http_poll_superseded");
                                continue;
                            }
                            if !poll_sink.emit(TransportEvent::Snapshot(snapshot)) {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(event = "http_poll_error", error = %err);
                            poll_healthy.store(false, Ordering::SeqCst);
                            poll_sink.emit(TransportEvent::Closed(err.to_string()));
                            return;
                        }
                    }
                }
            }));
        }

        info!(event = "http_connected", base = %self.base);
        self.healthy = healthy;
        self.sink = Some(sink);
        Ok(())
    }

    async fn deliver(&self, command: Command) -> Result<(), TransportError> {
        let Some(sink) = self.sink.clone() else {
            return Err(TransportError::Closed);
        };
        match command.kind {
            CommandKind::Warmup => {
                let request = self
                    .client
                    .post(self.endpoint("/api/warmup")?)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(command.encode()?);
                match fetch_envelope(request).await?.msg {
                    ServerMessage::CommandAck(ack) => {
                        let mut admitted = lock(&self.admitted);
                        if ack.accepted {
                            *admitted += 1;
                        }
                        sink.emit(TransportEvent::Ack(ack));
                    }
                    other => {
                        return Err(TransportError::Http(format!("unexpected reply {other:?}")))
                    }
                }
            }
            CommandKind::Ping => {
                let request = self
                    .client
                    .get(self.endpoint("/api/ping")?)
                    .query(&[("clientId", command.client_id.as_str())]);
                match fetch_envelope(request).await?.msg {
                    ServerMessage::Pong(pong) => {
                        sink.emit(TransportEvent::Pong(pong));
                    }
                    other => {
                        return Err(TransportError::Http(format!("unexpected reply {other:?}")))
                    }
                }
                sink.emit(TransportEvent::Ack(CommandAck::accepted(command.client_id)));
            }
            CommandKind::QueryStatus => {
                let snapshot = fetch_status(&self.client, self.endpoint("/api/status")?).await?;
                sink.emit(TransportEvent::Snapshot(snapshot));
                sink.emit(TransportEvent::Ack(CommandAck::accepted(command.client_id)));
            }
        }
        debug!(event = "http_command_sent", kind = %command.kind);
        Ok(())
    }
}

fn lock(admitted: &Mutex<u64>) -> MutexGuard<'_, u64> {
    admitted.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sends `request` and decodes a server envelope. A 400 still carries a
/// rejection ack, so it is decoded like a success.
async fn fetch_envelope(request: reqwest::RequestBuilder) -> Result<ServerEnvelope, TransportError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() && status != StatusCode::BAD_REQUEST {
        return Err(TransportError::Http(format!("status {status}")));
    }
    let body = response.text().await?;
    Ok(ServerEnvelope::decode(&body)?)
}

async fn fetch_status(client: &Client, url: Url) -> Result<InitialStatus, TransportError> {
    match fetch_envelope(client.get(url)).await?.msg {
        ServerMessage::InitialStatus(snapshot) => Ok(snapshot),
        other => Err(TransportError::Http(format!("unexpected reply {other:?}"))),
    }
}

impl Transport for HttpTransport {
    fn tier(&self) -> Tier {
        Tier::RequestResponse
    }

    fn connect(&mut self, sink: EventSink) -> BoxFuture<'_, Result<(), TransportError>> {
        self.open(sink).boxed()
    }

    fn send(&mut self, command: Command) -> BoxFuture<'_, Result<(), TransportError>> {
        self.deliver(command).boxed()
    }

    fn is_healthy(&self) -> bool {
        self.sink.is_some() && self.healthy.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.sink = None;
        self.healthy.store(false, Ordering::SeqCst);
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
