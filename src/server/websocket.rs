//! WebSocket session management for collaborative document editing.
//!
//! This module handles one WebSocket connection: it parses client messages,
//! hands them to the [`ServerAuthority`], and writes whatever the authority
//! queued for this client back to the socket.

use axum::extract::ws::{Message, WebSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::ot::{ClientId, DocumentId};
use crate::server::config::ServerConfig;
use crate::sync::{
    ClientMessage, ClientRecord, JoinOutcome, ServerAuthority, ServerMessage, Submission,
};

/// WebSocket session for one client of one document.
///
/// The authority owns the only sender of the outbound queue. The session keeps
/// a weak handle, so the queue closing means the authority let go of this
/// connection: it fell too far behind, or the client joined again elsewhere.
pub struct WebSocketSession {
    socket: WebSocket,
    authority: Arc<ServerAuthority>,
    document_id: DocumentId,
    idle_timeout: Duration,
    outbound_capacity: usize,
    client_id: Option<ClientId>,
    outbound_rx: Option<mpsc::Receiver<ServerMessage>>,
    registered: Option<mpsc::WeakSender<ServerMessage>>,
}

impl WebSocketSession {
    pub fn new(
        socket: WebSocket,
        authority: Arc<ServerAuthority>,
        document_id: DocumentId,
        idle_timeout: Duration,
        outbound_capacity: usize,
    ) -> Self {
        Self {
            socket,
            authority,
            document_id,
            idle_timeout,
            outbound_capacity,
            client_id: None,
            outbound_rx: None,
            registered: None,
        }
    }

    /// Handle the WebSocket connection lifecycle
    pub async fn handle(mut self) {
        info!(document = %self.document_id, "websocket session established");
        let mut deadline = Instant::now() + self.idle_timeout;

        loop {
            tokio::select! {
                msg = self.socket.recv() => {
                    deadline = Instant::now() + self.idle_timeout;
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.handle_text_message(&text) {
                                if e.is_protocol_error() {
                                    error!(document = %self.document_id, error = %e, "closing connection");
                                    self.fail(e).await;
                                    break;
                                }
                                warn!(document = %self.document_id, error = %e, "message not handled");
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!(document = %self.document_id, "websocket closed by client");
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if self.socket.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(_)) => {
                            // Ignore other message types (binary, pong)
                        }
                        Some(Err(e)) => {
                            warn!(document = %self.document_id, error = %e, "websocket error");
                            break;
                        }
                    }
                }
                message = next_outbound(&mut self.outbound_rx) => {
                    match message {
                        Some(message) => {
                            if let Err(e) = self.send_message(&message).await {
                                warn!(document = %self.document_id, error = %e, "send failed");
                                break;
                            }
                        }
                        None if self.registered.is_some() => {
                            info!(document = %self.document_id, "connection released by the server");
                            self.registered = None;
                            let reason = Error::Transport(
                                "connection fell behind or was replaced; rejoin to continue".to_string(),
                            );
                            self.fail(reason).await;
                            break;
                        }
                        // an unregistered join only queues resync_required
                        None => self.outbound_rx = None,
                    }
                }
                _ = sleep_until(deadline) => {
                    info!(document = %self.document_id, "closing idle connection");
                    break;
                }
            }
        }

        let connection = self.registered.as_ref().and_then(mpsc::WeakSender::upgrade);
        if let (Some(client_id), Some(connection)) = (self.client_id, connection) {
            self.authority.leave(&self.document_id, &client_id, &connection);
        }
        info!(document = %self.document_id, "websocket session ended");
    }

    /// Handle incoming text messages
    fn handle_text_message(&mut self, text: &str) -> Result<()> {
        debug!(document = %self.document_id, %text, "received");
        match ClientMessage::from_json(text)? {
            ClientMessage::Join {
                document_id,
                client_id,
                display_label,
                color,
                last_known_version,
            } => {
                if document_id != self.document_id {
                    return Err(Error::Malformed(format!(
                        "joined '{document_id}' on the endpoint of '{}'",
                        self.document_id
                    )));
                }
                if self.client_id.is_some_and(|id| id != client_id) {
                    return Err(Error::Malformed("client id changed mid-session".to_string()));
                }
                self.client_id = Some(client_id);
                let record = ClientRecord::new(client_id, display_label, color);
                let (tx, rx) = mpsc::channel(self.outbound_capacity);
                let weak = tx.downgrade();
                let outcome = self
                    .authority
                    .join(&self.document_id, record, last_known_version, tx)?;
                self.outbound_rx = Some(rx);
                self.registered = match outcome {
                    JoinOutcome::ResyncRequired { .. } => None,
                    _ => Some(weak),
                };
                Ok(())
            }
            ClientMessage::Operation {
                operation,
                base_version,
                seq,
            } => {
                let client_id = self.joined()?;
                let submission =
                    self.authority
                        .submit(&self.document_id, client_id, operation, base_version, seq)?;
                if let Submission::Rejected { reason } = submission {
                    debug!(document = %self.document_id, client = %client_id, %reason, "rejected");
                }
                Ok(())
            }
            ClientMessage::Selection { selection } => {
                let client_id = self.joined()?;
                self.authority
                    .update_selection(&self.document_id, &client_id, selection)
            }
        }
    }

    fn joined(&self) -> Result<ClientId> {
        self.client_id
            .ok_or_else(|| Error::Malformed("message before join".to_string()))
    }

    /// Tells the client why it is being dropped, then closes.
    async fn fail(&mut self, error: Error) {
        let message = ServerMessage::Error {
            message: error.to_string(),
        };
        if let Err(e) = self.send_message(&message).await {
            debug!(error = %e, "could not deliver error frame");
        }
        let _ = self.socket.send(Message::Close(None)).await;
    }

    /// Send a message to the client
    async fn send_message(&mut self, message: &ServerMessage) -> Result<()> {
        let json = message.to_json()?;
        self.socket
            .send(Message::Text(json))
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

/// Waits on the outbound queue, or forever when there is none yet.
async fn next_outbound(
    outbound: &mut Option<mpsc::Receiver<ServerMessage>>,
) -> Option<ServerMessage> {
    match outbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Create and handle a new WebSocket session
pub async fn handle_websocket_connection(
    socket: WebSocket,
    authority: Arc<ServerAuthority>,
    document_id: DocumentId,
    config: Arc<ServerConfig>,
) {
    WebSocketSession::new(
        socket,
        authority,
        document_id,
        config.idle_timeout,
        config.outbound_capacity,
    )
    .handle()
    .await;
}
