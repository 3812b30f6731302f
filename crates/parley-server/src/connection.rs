//! One chat socket: a reader loop taking client frames, a writer loop draining
//! an ordered event queue, and at most one generation task in between.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use parley_core::ids::{ConnectionId, UserId};
use parley_core::security::ApiKey;
use parley_core::stream::StreamEvent;
use parley_llm::{CompletionBridge, GenerationOutcome};

use crate::protocol::{self, ClientFrame, ProtocolError};

/// Frames arriving from the client.
pub type Inbound = Pin<Box<dyn Stream<Item = String> + Send>>;
/// Frames going to the client.
pub type Outbound = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

#[derive(Debug, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Capacity of the outbound event queue. A full queue blocks the producer.
    pub queue_capacity: usize,
    /// How long `stop()` waits for queued events to reach the client.
    pub drain_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<Outbound>>,
    generation: Option<JoinHandle<()>>,
    events: Option<mpsc::Sender<StreamEvent>>,
}

pub struct ConnectionSession {
    id: ConnectionId,
    bridge: Arc<CompletionBridge>,
    config: ConnectionConfig,
    /// The account's key, used when a chat frame carries none.
    default_key: Option<ApiKey>,
    running: AtomicBool,
    /// Fires when the connection wants to shut down.
    close_requested: CancellationToken,
    /// Tells the writer to give up on whatever is still queued.
    writer_stop: CancellationToken,
    tasks: Mutex<Tasks>,
    span: Span,
}

impl ConnectionSession {
    pub fn new(
        bridge: Arc<CompletionBridge>,
        config: ConnectionConfig,
        user_id: Option<&UserId>,
        default_key: Option<ApiKey>,
    ) -> Arc<Self> {
        let id = ConnectionId::new();
        let span = info_span!(
            "connection",
            connection_id = %id,
            user_id = user_id.map(|u| u.as_str()).unwrap_or(""),
        );
        Arc::new(Self {
            id,
            bridge,
            config,
            default_key,
            running: AtomicBool::new(true),
            close_requested: CancellationToken::new(),
            writer_stop: CancellationToken::new(),
            tasks: Mutex::new(Tasks::default()),
            span,
        })
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Launch the reader and writer loops over a transport.
    pub fn start(self: &Arc<Self>, inbound: Inbound, outbound: Outbound) {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);

        let writer = tokio::spawn(
            write_loop(rx, outbound, self.writer_stop.clone(), self.close_requested.clone())
                .instrument(self.span.clone()),
        );
        let reader = tokio::spawn(Arc::clone(self).read_loop(inbound).instrument(self.span.clone()));

        let mut tasks = self.tasks.lock();
        tasks.events = Some(tx);
        tasks.writer = Some(writer);
        tasks.reader = Some(reader);
        drop(tasks);

        self.span.in_scope(|| info!("chat connection opened"));
    }

    /// Resolves once the connection has asked to shut down.
    pub async fn closed(&self) {
        self.close_requested.cancelled().await
    }

    fn request_close(&self, reason: &'static str) {
        if !self.close_requested.is_cancelled() {
            debug!(reason, "connection close requested");
            self.close_requested.cancel();
        }
    }

    async fn read_loop(self: Arc<Self>, mut inbound: Inbound) {
        while let Some(frame) = inbound.next().await {
            if !self.is_running() {
                return;
            }
            match protocol::parse_frame(&frame) {
                Ok(ClientFrame::Cancel) => {
                    self.abort_generation().await;
                    self.request_close("cancel");
                    return;
                }
                Ok(ClientFrame::Chat(request)) => match request.into_stream_request() {
                    Ok(request) => self.handle_chat(request).await,
                    Err(e) => return self.protocol_failure(e).await,
                },
                Err(e) => return self.protocol_failure(e).await,
            }
        }
        self.request_close("transport closed");
    }

    /// Replace any in-flight generation with a new one.
    pub async fn handle_chat(self: &Arc<Self>, mut request: parley_llm::StreamRequest) {
        self.abort_generation().await;

        if request.api_key.is_none() {
            request.api_key = self.default_key.clone();
        }

        let Some(events) = self.tasks.lock().events.clone() else {
            return;
        };
        let session = Arc::clone(self);
        let generation = tokio::spawn(
            async move {
                match session.bridge.run(session.id.clone(), request, &events).await {
                    GenerationOutcome::Finished { .. } | GenerationOutcome::Abandoned => {}
                    GenerationOutcome::Failed(_) => session.request_close("upstream failure"),
                }
            }
            .instrument(self.span.clone()),
        );

        let mut tasks = self.tasks.lock();
        if self.is_running() {
            tasks.generation = Some(generation);
        } else {
            generation.abort();
        }
    }

    async fn protocol_failure(&self, error: ProtocolError) {
        warn!(error = %error, "rejecting chat frame");
        self.abort_generation().await;
        let events = self.tasks.lock().events.clone();
        if let Some(events) = events {
            let _ = events.send(StreamEvent::failure(self.id.clone(), error.to_string())).await;
        }
        self.request_close("protocol error");
    }

    async fn abort_generation(&self) {
        let generation = self.tasks.lock().generation.take();
        if let Some(handle) = generation {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Tear the connection down. Safe to call more than once.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.request_close("stop");

        self.abort_generation().await;

        let reader = self.tasks.lock().reader.take();
        if let Some(handle) = reader {
            handle.abort();
            let _ = handle.await;
        }

        // Dropping the last sender lets the writer finish once the queue is empty.
        let (events, writer) = {
            let mut tasks = self.tasks.lock();
            (tasks.events.take(), tasks.writer.take())
        };
        drop(events);

        let Some(mut writer) = writer else {
            return;
        };
        let drained = tokio::time::timeout(self.config.drain_timeout, &mut writer).await;
        let outbound = match drained {
            Ok(joined) => joined,
            Err(_) => {
                warn!(timeout = ?self.config.drain_timeout, "gave up draining event queue");
                self.writer_stop.cancel();
                writer.await
            }
        };

        match outbound {
            Ok(mut outbound) => {
                if let Err(e) = outbound.close().await {
                    debug!(error = %e, "transport close failed");
                }
            }
            Err(e) => warn!(error = %e, "writer task ended abnormally"),
        }
        self.span.in_scope(|| info!("chat connection closed"));
    }
}

async fn write_loop(
    mut events: mpsc::Receiver<StreamEvent>,
    mut outbound: Outbound,
    stop: CancellationToken,
    close_requested: CancellationToken,
) -> Outbound {
    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let frame = match serde_json::to_string(&event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode stream event");
                continue;
            }
        };
        let sent = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            sent = outbound.send(frame) => sent,
        };
        if let Err(e) = sent {
            debug!(error = %e, "client went away");
            close_requested.cancel();
            break;
        }
    }
    outbound
}
