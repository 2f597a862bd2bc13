use crate::{
    error::TransportError,
    transport::{EventSink, Tier, Transport, TransportEvent},
};
use futures_util::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;
use warmup_core::{Command, ServerEnvelope};

/// WebSocket tier: commands go up as text frames, the hub pushes every
/// status change down the same socket.
pub struct PushTransport {
    url: Url,
    connect_timeout: Duration,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    healthy: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl PushTransport {
    pub fn new(url: Url, connect_timeout: Duration) -> Self {
        Self {
            url,
            connect_timeout,
            outbound: None,
            healthy: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    async fn open(&mut self, sink: EventSink) -> Result<(), TransportError> {
        self.close();
        let connect = connect_async(self.url.as_str());
        let (ws, _) = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => return Err(TransportError::Connect(err.to_string())),
            Err(_) => return Err(TransportError::Timeout(self.connect_timeout)),
        };
        let (mut ws_sender, mut ws_receiver) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let healthy = Arc::new(AtomicBool::new(true));

        let write_healthy = healthy.clone();
        let write_sink = sink.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(err) = ws_sender.send(msg).await {
                    warn!(event = "push_write_error", error = %err);
                    write_healthy.store(false, Ordering::SeqCst);
                    write_sink.emit(TransportEvent::Closed("write failed".to_string()));
                    return;
                }
            }
            let _ = ws_sender.close().await;
        });

        let read_healthy = healthy.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match ws_receiver.next().await {
                    Some(Ok(Message::Text(text))) => match ServerEnvelope::decode(&text) {
                        Ok(envelope) => {
                            if !sink.emit(TransportEvent::from(envelope)) {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(event = "push_decode_error", error = %err);
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "closed by hub".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break err.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            debug!(event = "push_reader_stopped", reason = %reason);
            read_healthy.store(false, Ordering::SeqCst);
            sink.emit(TransportEvent::Closed(reason));
        });

        info!(event = "push_connected", url = %self.url);
        self.outbound = Some(tx);
        self.healthy = healthy;
        self.reader = Some(reader);
        Ok(())
    }
}

impl Transport for PushTransport {
    fn tier(&self) -> Tier {
        Tier::Push
    }

    fn connect(&mut self, sink: EventSink) -> BoxFuture<'_, Result<(), TransportError>> {
        self.open(sink).boxed()
    }

    fn send(&mut self, command: Command) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            if !self.is_healthy() {
                return Err(TransportError::Closed);
            }
            let text = command.encode()?;
            let Some(outbound) = &self.outbound else {
                return Err(TransportError::Closed);
            };
            outbound
                .send(Message::Text(text))
                .map_err(|_| TransportError::Closed)
        }
        .boxed()
    }

    fn is_healthy(&self) -> bool {
        self.outbound.is_some() && self.healthy.load(Ordering::SeqCst)
    }

    /// Dropping the outbound queue lets the writer send a close frame.
    fn close(&mut self) {
        self.outbound = None;
        self.healthy.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for PushTransport {
    fn drop(&mut self) {
        self.close();
    }
}
