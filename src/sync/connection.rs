//! WebSocket driver for [`ClientSync`].
//!
//! One task owns the state machine. It selects over the socket and a command
//! channel, flushes the state machine's outbox after every step, and forwards
//! its events to the application. When the connection drops it waits
//! `reconnect_delay` and dials again, keeping pending edits. While connected
//! it pings every `keepalive` so a quiet client is not taken for a dead one.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ot::{ClientId, DocumentId, Operation, Selection};
use crate::sync::client::{ClientEvent, ClientSync};
use crate::sync::protocol::ServerMessage;

/// Settings of a client connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:3000`.
    pub url: String,
    pub document_id: DocumentId,
    pub display_label: String,
    pub reconnect_delay: Duration,
    /// Ping period; keep it below the server's idle timeout.
    pub keepalive: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, document_id: impl Into<DocumentId>) -> Self {
        ClientConfig {
            url: url.into(),
            document_id: document_id.into(),
            display_label: "anonymous".to_string(),
            reconnect_delay: Duration::from_secs(1),
            keepalive: Duration::from_secs(30),
        }
    }

    pub fn with_display_label(mut self, label: impl Into<String>) -> Self {
        self.display_label = label.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_keepalive(mut self, period: Duration) -> Self {
        self.keepalive = period;
        self
    }

    /// The document's WebSocket endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}/ws/{}", self.url.trim_end_matches('/'), self.document_id)
    }
}

enum Command {
    Edit(Operation),
    Select(Option<Selection>),
    Snapshot(oneshot::Sender<(Value, u64)>),
    Shutdown,
}

/// Handle to a running client connection.
pub struct ClientHandle {
    client_id: ClientId,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Starts a connection task for a fresh client.
    pub fn spawn(config: ClientConfig) -> Self {
        Self::spawn_with_id(config, ClientId::new())
    }

    pub fn spawn_with_id(config: ClientConfig, client_id: ClientId) -> Self {
        let sync = ClientSync::new(
            client_id,
            config.document_id.clone(),
            config.display_label.clone(),
        );
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(config, sync, command_rx, event_tx));
        ClientHandle {
            client_id,
            commands,
            events,
            task,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn edit(&self, operation: Operation) -> Result<()> {
        self.send(Command::Edit(operation))
    }

    pub fn select(&self, selection: Option<Selection>) -> Result<()> {
        self.send(Command::Select(selection))
    }

    /// Current local value and version.
    pub async fn snapshot(&self) -> Result<(Value, u64)> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await
            .map_err(|_| Error::Transport("connection task stopped".to_string()))
    }

    /// Waits for the next event. `None` once the task has stopped.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Stops the task and waits for it.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(err) = self.task.await {
            warn!(error = %err, "client task failed");
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Transport("connection task stopped".to_string()))
    }
}

/// What ended a session loop.
enum Exit {
    Reconnect,
    Shutdown,
}

async fn run(
    config: ClientConfig,
    mut sync: ClientSync,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let endpoint = config.endpoint();
    loop {
        sync.connecting();
        forward_events(&mut sync, &events);

        match connect_async(endpoint.as_str()).await {
            Ok((stream, _)) => {
                info!(client = %sync.client_id(), %endpoint, "connected");
                sync.connected();
                match session(&mut sync, stream, config.keepalive, &mut commands, &events).await {
                    Exit::Shutdown => return,
                    Exit::Reconnect => {}
                }
            }
            Err(err) => warn!(%endpoint, error = %err, "connection failed"),
        }

        sync.disconnected();
        sync.drain_messages();
        forward_events(&mut sync, &events);

        // Keep taking edits while offline.
        let retry = tokio::time::sleep(config.reconnect_delay);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                _ = &mut retry => break,
                command = commands.recv() => {
                    if !handle_command(&mut sync, command) {
                        return;
                    }
                    forward_events(&mut sync, &events);
                }
            }
        }
    }
}

async fn session(
    sync: &mut ClientSync,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    keepalive: Duration,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::UnboundedSender<ClientEvent>,
) -> Exit {
    let (mut sink, mut stream) = stream.split();
    // interval panics on a zero period
    let keepalive = keepalive.max(Duration::from_millis(1));
    let mut ping = interval_at(Instant::now() + keepalive, keepalive);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        while let Some(message) = sync.poll_message() {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode message");
                    continue;
                }
            };
            if let Err(err) = sink.send(Message::Text(text)).await {
                warn!(error = %err, "send failed");
                return Exit::Reconnect;
            }
        }
        forward_events(sync, events);

        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let result = ServerMessage::from_json(&text)
                        .and_then(|message| sync.handle_message(message));
                    if let Err(err) = result {
                        warn!(client = %sync.client_id(), error = %err, "protocol error");
                        if err.is_protocol_error() {
                            return Exit::Reconnect;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(client = %sync.client_id(), "connection closed");
                    return Exit::Reconnect;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "websocket error");
                    return Exit::Reconnect;
                }
            },
            command = commands.recv() => {
                if !handle_command(sync, command) {
                    let _ = sink.close().await;
                    return Exit::Shutdown;
                }
            }
            _ = ping.tick() => {
                if let Err(err) = sink.send(Message::Ping(Vec::new())).await {
                    warn!(error = %err, "keepalive failed");
                    return Exit::Reconnect;
                }
            }
        }
    }
}

/// Returns `false` when the task should stop.
fn handle_command(sync: &mut ClientSync, command: Option<Command>) -> bool {
    match command {
        Some(Command::Edit(operation)) => {
            if let Err(err) = sync.local_edit(operation) {
                warn!(client = %sync.client_id(), error = %err, "local edit refused");
            }
            true
        }
        Some(Command::Select(selection)) => {
            sync.set_selection(selection);
            true
        }
        Some(Command::Snapshot(reply)) => {
            let _ = reply.send(sync.snapshot());
            true
        }
        Some(Command::Shutdown) | None => {
            debug!(client = %sync.client_id(), "shutting down");
            false
        }
    }
}

fn forward_events(sync: &mut ClientSync, events: &mpsc::UnboundedSender<ClientEvent>) {
    while let Some(event) = sync.poll_event() {
        // Nobody listening is fine.
        let _ = events.send(event);
    }
}
