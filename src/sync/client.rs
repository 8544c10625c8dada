//! Client side of the synchronization protocol.
//!
//! This module contains ClientSync, a sans-IO state machine. It never touches
//! a socket: the driver feeds it connection events and server messages, then
//! drains the outbound [`ClientMessage`]s and the [`ClientEvent`]s it queued.
//! See [`crate::sync::connection`] for the WebSocket driver.
//!
//! # Pending edits
//!
//! Local edits are applied optimistically and queued. At most one of them is
//! in flight at a time; when it is transmitted, every queued edit behind the
//! previous in-flight one is collapsed into a single operation. Each
//! transmitted operation carries a sequence number the server uses to drop
//! duplicates after a reconnect.

use serde_json::Value;
use std::collections::VecDeque;
use std::mem;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ot::{
    ClientId, DocumentId, DocumentReplica, Operation, Selection, Side, apply, compose, invert,
    transform,
};
use crate::sync::presence::{ClientRecord, PresenceManager};
use crate::sync::protocol::{ClientMessage, PresenceMap, ServerMessage};

/// Connection lifecycle of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected, catching up with the server.
    Syncing,
    /// Caught up; everything pending before the reconnect is acknowledged.
    Live,
}

/// Things the application may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    /// The replica was brought up to date by a snapshot or a replay.
    Synced { version: u64, snapshot: bool },
    /// A remote edit was applied, already transformed past local edits.
    RemoteOperation {
        client_id: ClientId,
        operation: Operation,
        version: u64,
    },
    Acknowledged { seq: u64, version: u64 },
    /// The in-flight edit was refused by the server and undone locally.
    EditRejected { reason: String },
    StaleEditsDropped { count: usize },
    ResyncRequested { current_version: u64 },
    PresenceChanged {
        client_id: ClientId,
        selection: Option<Selection>,
    },
    ClientJoined(ClientRecord),
    ClientLeft(ClientId),
    ServerError(String),
}

#[derive(Debug, Clone)]
struct PendingOperation {
    operation: Operation,
    /// Set once the operation has been transmitted.
    seq: Option<u64>,
}

/// The client synchronization state machine for one document.
#[derive(Debug)]
pub struct ClientSync {
    client_id: ClientId,
    document_id: DocumentId,
    display_label: String,
    color: Option<String>,
    state: ConnectionState,
    replica: DocumentReplica,
    /// Server value at `replica.version()`, without pending edits.
    confirmed: Value,
    /// A version has been seen, so a reconnect can ask for a replay.
    has_version: bool,
    handshake_done: bool,
    in_flight: bool,
    pending: VecDeque<PendingOperation>,
    next_seq: u64,
    /// Sequence number whose acknowledgment makes the client live again.
    live_after: Option<u64>,
    selection: Option<Selection>,
    presence: PresenceManager,
    outbox: VecDeque<ClientMessage>,
    events: VecDeque<ClientEvent>,
}

impl ClientSync {
    pub fn new(
        client_id: ClientId,
        document_id: DocumentId,
        display_label: impl Into<String>,
    ) -> Self {
        let replica = DocumentReplica::new();
        ClientSync {
            client_id,
            document_id,
            display_label: display_label.into(),
            color: None,
            state: ConnectionState::Disconnected,
            confirmed: replica.value().clone(),
            replica,
            has_version: false,
            handshake_done: false,
            in_flight: false,
            pending: VecDeque::new(),
            next_seq: 1,
            live_after: None,
            selection: None,
            presence: PresenceManager::new(),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The local value, including pending edits.
    pub fn value(&self) -> &Value {
        self.replica.value()
    }

    /// The last server version this client has processed.
    pub fn version(&self) -> u64 {
        self.replica.version()
    }

    pub fn snapshot(&self) -> (Value, u64) {
        self.replica.snapshot()
    }

    /// Edits not yet acknowledged, the in-flight one included.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Mirror of the other participants. Read-only.
    pub fn presence(&self) -> &PresenceManager {
        &self.presence
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn poll_message(&mut self) -> Option<ClientMessage> {
        self.outbox.pop_front()
    }

    pub fn drain_messages(&mut self) -> Vec<ClientMessage> {
        self.outbox.drain(..).collect()
    }

    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }

    /// A transport connection attempt has started.
    pub fn connecting(&mut self) {
        self.reset_connection();
        self.set_state(ConnectionState::Connecting);
    }

    /// The transport is up: announce ourselves.
    pub fn connected(&mut self) {
        self.reset_connection();
        self.set_state(ConnectionState::Syncing);
        self.send_join();
    }

    /// The transport went away. Pending edits are kept for the next session.
    pub fn disconnected(&mut self) {
        self.reset_connection();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Applies a local edit optimistically and queues it for the server.
    ///
    /// # Errors
    ///
    /// * `InvalidPath` / `TypeMismatch` - the edit does not fit the local value;
    ///   nothing is queued
    pub fn local_edit(&mut self, operation: Operation) -> Result<()> {
        if operation.is_noop() {
            return Ok(());
        }
        self.replica.apply_local(&operation)?;
        self.pending.push_back(PendingOperation {
            operation,
            seq: None,
        });
        self.flush();
        Ok(())
    }

    /// Sets this client's selection and shares it when connected.
    pub fn set_selection(&mut self, selection: Option<Selection>) {
        self.selection = selection.clone();
        if self.can_send() {
            self.outbox.push_back(ClientMessage::Selection { selection });
        }
    }

    /// Processes one message from the server.
    ///
    /// # Errors
    ///
    /// * `VersionGap` - a broadcast skipped or repeated a version
    /// * `Malformed` - a message does not fit the current state
    ///
    /// Both are protocol errors; the driver should drop the connection.
    pub fn handle_message(&mut self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::SyncComplete {
                value,
                version,
                presence,
                clients,
                acknowledged_seq,
            } => self.on_snapshot(value, version, presence, clients, acknowledged_seq),
            ServerMessage::ReplayComplete {
                version,
                presence,
                clients,
                acknowledged_seq,
            } => self.on_replay_complete(version, presence, clients, acknowledged_seq),
            ServerMessage::ResyncRequired { current_version } => {
                debug!(client = %self.client_id, current_version, "resync required");
                self.has_version = false;
                self.handshake_done = false;
                self.in_flight = false;
                self.set_state(ConnectionState::Syncing);
                self.events
                    .push_back(ClientEvent::ResyncRequested { current_version });
                self.send_join();
                Ok(())
            }
            ServerMessage::Operation {
                operation,
                client_id,
                new_version,
            } => {
                if client_id == self.client_id {
                    self.on_acknowledged(&operation, new_version)
                } else {
                    self.on_remote(client_id, operation, new_version)
                }
            }
            ServerMessage::Selection {
                client_id,
                selection,
                client_record,
            } => {
                if client_id != self.client_id {
                    self.presence.join(client_record);
                    self.events.push_back(ClientEvent::PresenceChanged {
                        client_id,
                        selection,
                    });
                }
                Ok(())
            }
            ServerMessage::ClientJoined {
                client_id,
                client_record,
            } => {
                if let Some(record) = client_record {
                    self.presence.join(record.clone());
                    self.events.push_back(ClientEvent::ClientJoined(record));
                } else {
                    debug!(client = %client_id, "client joined without a record");
                }
                Ok(())
            }
            ServerMessage::ClientLeft { client_id, .. } => {
                self.presence.leave(&client_id);
                self.events.push_back(ClientEvent::ClientLeft(client_id));
                Ok(())
            }
            ServerMessage::Rejected { reason, .. } => self.on_rejected(reason),
            ServerMessage::Error { message } => {
                warn!(client = %self.client_id, %message, "server error");
                self.events.push_back(ClientEvent::ServerError(message));
                Ok(())
            }
        }
    }

    fn on_snapshot(
        &mut self,
        value: Value,
        version: u64,
        presence: PresenceMap,
        clients: Vec<ClientRecord>,
        acknowledged_seq: Option<u64>,
    ) -> Result<()> {
        self.replica.reset(value.clone(), version);
        self.confirmed = value;
        if let Some(acknowledged) = acknowledged_seq {
            self.pending
                .retain(|p| p.seq.is_none_or(|seq| seq > acknowledged));
        }

        // Replay what is left on the snapshot as-is; whatever no longer fits
        // is dropped.
        let mut dropped = 0;
        for entry in mem::take(&mut self.pending) {
            match self.replica.apply_local(&entry.operation) {
                Ok(()) => self.pending.push_back(entry),
                Err(err) => {
                    debug!(client = %self.client_id, error = %err, "dropping stale edit");
                    dropped += 1;
                }
            }
        }

        self.presence.replace_all(clients, &presence);
        self.has_version = true;
        self.events.push_back(ClientEvent::Synced {
            version,
            snapshot: true,
        });
        if dropped > 0 {
            warn!(client = %self.client_id, dropped, "pending edits no longer apply");
            self.events
                .push_back(ClientEvent::StaleEditsDropped { count: dropped });
        }
        self.finish_handshake();
        Ok(())
    }

    fn on_replay_complete(
        &mut self,
        version: u64,
        presence: PresenceMap,
        clients: Vec<ClientRecord>,
        acknowledged_seq: Option<u64>,
    ) -> Result<()> {
        if version != self.replica.version() {
            return Err(Error::VersionGap {
                current: self.replica.version(),
                received: version,
            });
        }
        // An edit the server has seen but the replay did not acknowledge was
        // rejected while we were away.
        let head_seq = self.pending.front().and_then(|p| p.seq);
        if let (Some(seq), Some(acknowledged)) = (head_seq, acknowledged_seq) {
            if seq <= acknowledged {
                self.roll_back_head()?;
                self.events.push_back(ClientEvent::EditRejected {
                    reason: "rejected while disconnected".to_string(),
                });
            }
        }

        self.presence.replace_all(clients, &presence);
        self.has_version = true;
        self.events.push_back(ClientEvent::Synced {
            version,
            snapshot: false,
        });
        self.finish_handshake();
        Ok(())
    }

    fn on_acknowledged(&mut self, operation: &Operation, new_version: u64) -> Result<()> {
        let Some(seq) = self.pending.front().and_then(|p| p.seq) else {
            return Err(Error::Malformed(
                "acknowledgment without an operation in flight".to_string(),
            ));
        };
        let confirmed = apply(&self.confirmed, operation)?;
        self.replica.advance(new_version)?;
        self.confirmed = confirmed;
        self.pending.pop_front();
        self.in_flight = false;

        self.events.push_back(ClientEvent::Acknowledged {
            seq,
            version: new_version,
        });
        self.check_live(seq);
        self.flush();
        Ok(())
    }

    fn on_remote(
        &mut self,
        client_id: ClientId,
        operation: Operation,
        new_version: u64,
    ) -> Result<()> {
        let side = Side::for_clients(&self.client_id, &client_id);
        let mut incoming = operation.clone();
        let mut rebased = Vec::with_capacity(self.pending.len());
        for entry in &self.pending {
            let (ours, theirs) = transform(&entry.operation, &incoming, side);
            rebased.push(ours);
            incoming = theirs;
        }

        let confirmed = apply(&self.confirmed, &operation)?;
        self.replica.apply_accepted(&incoming, new_version)?;
        self.confirmed = confirmed;
        for (entry, operation) in self.pending.iter_mut().zip(rebased) {
            entry.operation = operation;
        }

        self.events.push_back(ClientEvent::RemoteOperation {
            client_id,
            operation: incoming,
            version: new_version,
        });
        Ok(())
    }

    fn on_rejected(&mut self, reason: String) -> Result<()> {
        let Some(seq) = self.pending.front().and_then(|p| p.seq) else {
            return Err(Error::Malformed(
                "rejection without an operation in flight".to_string(),
            ));
        };
        warn!(client = %self.client_id, seq, %reason, "edit rejected");
        self.roll_back_head()?;
        self.in_flight = false;
        self.events.push_back(ClientEvent::EditRejected { reason });
        self.check_live(seq);
        self.flush();
        Ok(())
    }

    /// Undoes the head of the queue locally.
    ///
    /// The inverse is built against the confirmed value, then carried past the
    /// remaining pending edits, which are rebased onto a history without it.
    fn roll_back_head(&mut self) -> Result<()> {
        let Some(head) = self.pending.front() else {
            return Ok(());
        };
        let mut inverse = invert(&head.operation, &self.confirmed)?;
        let mut rebased = Vec::with_capacity(self.pending.len() - 1);
        for entry in self.pending.iter().skip(1) {
            let (inv, ours) = transform(&inverse, &entry.operation, Side::Right);
            rebased.push(ours);
            inverse = inv;
        }

        self.replica.apply_local(&inverse)?;
        self.pending.pop_front();
        for (entry, operation) in self.pending.iter_mut().zip(rebased) {
            entry.operation = operation;
        }
        Ok(())
    }

    fn finish_handshake(&mut self) {
        self.handshake_done = true;
        self.live_after = match self.pending.front() {
            None => None,
            Some(head) => match (self.pending.len(), head.seq) {
                (1, Some(seq)) => Some(seq),
                _ => Some(self.next_seq),
            },
        };
        if self.live_after.is_none() {
            self.set_state(ConnectionState::Live);
        }
        if self.selection.is_some() {
            self.outbox.push_back(ClientMessage::Selection {
                selection: self.selection.clone(),
            });
        }
        self.flush();
    }

    fn check_live(&mut self, seq: u64) {
        if self.state != ConnectionState::Syncing || !self.handshake_done {
            return;
        }
        if self.pending.is_empty() || self.live_after.is_some_and(|barrier| seq >= barrier) {
            self.live_after = None;
            self.set_state(ConnectionState::Live);
        }
    }

    fn can_send(&self) -> bool {
        self.handshake_done
            && matches!(self.state, ConnectionState::Syncing | ConnectionState::Live)
    }

    /// Transmits the head of the queue if nothing is in flight.
    fn flush(&mut self) {
        if !self.can_send() || self.in_flight || self.pending.is_empty() {
            return;
        }
        if self.pending.front().is_some_and(|p| p.seq.is_none()) {
            let operation = self
                .pending
                .drain(..)
                .fold(Operation::noop(), |acc, p| compose(&acc, &p.operation));
            self.pending.push_back(PendingOperation {
                operation,
                seq: Some(self.next_seq),
            });
            self.next_seq += 1;
        }
        let Some(head) = self.pending.front() else {
            return;
        };
        let Some(seq) = head.seq else {
            return;
        };
        self.outbox.push_back(ClientMessage::Operation {
            operation: head.operation.clone(),
            base_version: self.replica.version(),
            seq,
        });
        self.in_flight = true;
    }

    fn send_join(&mut self) {
        self.outbox.push_back(ClientMessage::Join {
            document_id: self.document_id.clone(),
            client_id: self.client_id,
            display_label: self.display_label.clone(),
            color: self.color.clone(),
            last_known_version: self.has_version.then(|| self.replica.version()),
        });
    }

    fn reset_connection(&mut self) {
        self.handshake_done = false;
        self.in_flight = false;
        self.live_after = None;
        self.outbox.clear();
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(client = %self.client_id, from = ?self.state, to = ?state, "state change");
            self.state = state;
            self.events.push_back(ClientEvent::StateChanged(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path;
    use serde_json::json;

    fn live_client(value: Value, version: u64) -> ClientSync {
        let mut client = ClientSync::new(ClientId::new(), "doc".into(), "me");
        client.connecting();
        client.connected();
        client
            .handle_message(ServerMessage::SyncComplete {
                value,
                version,
                presence: PresenceMap::new(),
                clients: Vec::new(),
                acknowledged_seq: None,
            })
            .unwrap();
        client.drain_messages();
        client.drain_events();
        client
    }

    #[test]
    fn test_join_carries_version_after_first_sync() {
        let mut client = ClientSync::new(ClientId::new(), "doc".into(), "me");
        client.connected();
        assert!(matches!(
            client.poll_message(),
            Some(ClientMessage::Join { last_known_version: None, .. })
        ));

        let mut client = live_client(json!({}), 7);
        client.disconnected();
        client.connected();
        assert!(matches!(
            client.poll_message(),
            Some(ClientMessage::Join { last_known_version: Some(7), .. })
        ));
    }

    #[test]
    fn test_one_operation_in_flight() {
        let mut client = live_client(json!({"t": ""}), 3);
        client.local_edit(Operation::insert_text(path!["t", 0], "a")).unwrap();
        client.local_edit(Operation::insert_text(path!["t", 1], "b")).unwrap();
        client.local_edit(Operation::insert_text(path!["t", 2], "c")).unwrap();

        let sent = client.drain_messages();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], ClientMessage::Operation { base_version: 3, seq: 1, .. }));
        assert_eq!(client.pending_len(), 3);

        // acknowledging the first collapses the rest into one
        client
            .handle_message(ServerMessage::Operation {
                operation: Operation::insert_text(path!["t", 0], "a"),
                client_id: client.client_id(),
                new_version: 4,
            })
            .unwrap();
        let sent = client.drain_messages();
        assert_eq!(
            sent,
            vec![ClientMessage::Operation {
                operation: Operation::insert_text(path!["t", 1], "bc"),
                base_version: 4,
                seq: 2,
            }]
        );
        assert_eq!(client.pending_len(), 1);
        assert_eq!(client.value(), &json!({"t": "abc"}));
    }

    #[test]
    fn test_remote_operation_rebases_pending() {
        let mut client = live_client(json!({"t": "ac"}), 0);
        client.local_edit(Operation::insert_text(path!["t", 1], "b")).unwrap();

        client
            .handle_message(ServerMessage::Operation {
                operation: Operation::insert_text(path!["t", 0], ">"),
                client_id: ClientId::new(),
                new_version: 1,
            })
            .unwrap();
        assert_eq!(client.value(), &json!({"t": ">abc"}));
        assert_eq!(client.version(), 1);
        assert!(matches!(
            client.drain_events().last(),
            Some(ClientEvent::RemoteOperation { version: 1, .. })
        ));
    }

    #[test]
    fn test_version_gap_is_an_error() {
        let mut client = live_client(json!({"t": ""}), 2);
        let err = client
            .handle_message(ServerMessage::Operation {
                operation: Operation::insert_text(path!["t", 0], "x"),
                client_id: ClientId::new(),
                new_version: 4,
            })
            .unwrap_err();
        assert!(err.is_protocol_error());
        assert_eq!(client.value(), &json!({"t": ""}));
    }

    #[test]
    fn test_rejection_rolls_back_in_flight_edit() {
        let mut client = live_client(json!({"list": ["a"]}), 0);
        client.local_edit(Operation::insert(path!["list", 0], json!("x"))).unwrap();
        client.local_edit(Operation::insert(path!["list", 2], json!("y"))).unwrap();
        assert_eq!(client.value(), &json!({"list": ["x", "a", "y"]}));

        client
            .handle_message(ServerMessage::Rejected {
                reason: "nope".into(),
                current_version: 0,
            })
            .unwrap();

        assert_eq!(client.value(), &json!({"list": ["a", "y"]}));
        assert_eq!(client.pending_len(), 1);
        let sent = client.drain_messages();
        assert!(matches!(
            &sent[..],
            [_, ClientMessage::Operation { seq: 2, .. }]
        ));
        if let ClientMessage::Operation { operation, .. } = &sent[1] {
            assert_eq!(operation, &Operation::insert(path!["list", 1], json!("y")));
        }
        assert!(client
            .drain_events()
            .contains(&ClientEvent::EditRejected { reason: "nope".into() }));
    }

    #[test]
    fn test_stale_edits_dropped_on_snapshot() {
        let mut client = live_client(json!({"n": [1, 2]}), 0);
        client.disconnected();
        client.local_edit(Operation::delete(path!["n", 1], json!(2))).unwrap();
        client.local_edit(Operation::insert(path!["n", 0], json!(0))).unwrap();

        client.connected();
        client
            .handle_message(ServerMessage::SyncComplete {
                value: json!({"n": [1]}),
                version: 5,
                presence: PresenceMap::new(),
                clients: Vec::new(),
                acknowledged_seq: None,
            })
            .unwrap();

        assert_eq!(client.value(), &json!({"n": [0, 1]}));
        assert!(client
            .drain_events()
            .contains(&ClientEvent::StaleEditsDropped { count: 1 }));
        assert_eq!(client.state(), ConnectionState::Syncing);
    }

    #[test]
    fn test_edits_while_disconnected_wait() {
        let mut client = live_client(json!({"t": ""}), 0);
        client.disconnected();
        client.local_edit(Operation::insert_text(path!["t", 0], "x")).unwrap();
        assert!(client.drain_messages().is_empty());
        assert_eq!(client.value(), &json!({"t": "x"}));
    }

    #[test]
    fn test_remote_selection_is_mirrored() {
        let mut client = live_client(json!({}), 0);
        let other = ClientRecord::new(ClientId::new(), "other", None);
        let id = other.client_id;
        client
            .handle_message(ServerMessage::ClientJoined {
                client_id: id,
                client_record: Some(other.clone()),
            })
            .unwrap();

        let mut record = other;
        record.selection = Some(Selection::caret(path!["k"]));
        client
            .handle_message(ServerMessage::Selection {
                client_id: id,
                selection: record.selection.clone(),
                client_record: record,
            })
            .unwrap();
        assert_eq!(
            client.presence().get(&id).unwrap().selection,
            Some(Selection::caret(path!["k"]))
        );

        client
            .handle_message(ServerMessage::ClientLeft {
                client_id: id,
                client_record: None,
            })
            .unwrap();
        assert!(!client.presence().contains(&id));
    }
}
