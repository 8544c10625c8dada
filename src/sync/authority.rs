//! The server authority: the single writer of every document.
//!
//! This module contains the ServerAuthority, which owns one DocumentSession per
//! document, assigns versions to incoming operations, transforms late
//! submissions against what was accepted since their base version, and fans
//! accepted operations out to every connected client.

use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ot::{
    ClientId, DocumentId, DocumentReplica, Operation, Selection, Side, transform_against,
};
use crate::sync::presence::{ClientRecord, PresenceManager};
use crate::sync::protocol::ServerMessage;

/// Sending half of a connection's outbound queue.
///
/// The queue is bounded: a connection whose queue is full when a message is
/// sent is treated as stalled and dropped from the session, as is one whose
/// receiver is gone.
pub type Outbound = mpsc::Sender<ServerMessage>;

/// Number of accepted operations a session keeps by default.
pub const DEFAULT_RETENTION: usize = 1024;

/// Messages a connection may have queued before it counts as stalled.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 4096;

/// What became of a submitted operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Accepted and broadcast as `version`.
    Accepted { version: u64 },
    /// The sequence number was already accepted; nothing happened.
    Duplicate,
    /// The operation did not apply; the author was told.
    Rejected { reason: String },
    /// The base version is outside the retention window; the author was told.
    ResyncRequired { current_version: u64 },
}

/// How a join was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Snapshot { version: u64 },
    Replayed { from: u64, to: u64 },
    ResyncRequired { current_version: u64 },
}

#[derive(Debug, Clone)]
struct AcceptedOperation {
    version: u64,
    client_id: ClientId,
    operation: Operation,
}

/// Everything the server knows about one document.
///
/// A session is only ever touched under its mutex, so every operation on a
/// document runs in one sequential critical section.
#[derive(Debug)]
pub struct DocumentSession {
    id: DocumentId,
    replica: DocumentReplica,
    history: VecDeque<AcceptedOperation>,
    retention: usize,
    presence: PresenceManager,
    last_seq: HashMap<ClientId, u64>,
    outbound: HashMap<ClientId, Outbound>,
}

impl DocumentSession {
    pub fn new(id: DocumentId, value: Value, retention: usize) -> Self {
        DocumentSession {
            id,
            replica: DocumentReplica::with_value(value, 0),
            history: VecDeque::new(),
            retention,
            presence: PresenceManager::new(),
            last_seq: HashMap::new(),
            outbound: HashMap::new(),
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.replica.version()
    }

    pub fn value(&self) -> &Value {
        self.replica.value()
    }

    pub fn presence(&self) -> &PresenceManager {
        &self.presence
    }

    pub fn connected(&self) -> usize {
        self.outbound.len()
    }

    /// Oldest base version that can still be transformed forward.
    fn oldest_base(&self) -> u64 {
        self.version() - self.history.len() as u64
    }

    fn join(
        &mut self,
        record: ClientRecord,
        last_known_version: Option<u64>,
        outbound: Outbound,
    ) -> Result<JoinOutcome> {
        let version = self.version();
        let client_id = record.client_id;

        let outcome = match last_known_version {
            Some(known) if known > version => {
                return Err(Error::VersionAhead {
                    base: known,
                    current: version,
                });
            }
            Some(known)
                if known < self.oldest_base()
                    || missed(version, known) >= outbound.capacity() =>
            {
                send(&outbound, ServerMessage::ResyncRequired {
                    current_version: version,
                });
                return Ok(JoinOutcome::ResyncRequired {
                    current_version: version,
                });
            }
            Some(known) => JoinOutcome::Replayed {
                from: known,
                to: version,
            },
            None => JoinOutcome::Snapshot { version },
        };

        let mut record = record;
        record.last_known_version = Some(version);
        record.touch();
        self.presence.join(record.clone());
        let acknowledged_seq = self.last_seq.get(&client_id).copied();

        match outcome {
            JoinOutcome::Replayed { from, .. } => {
                for entry in self.history.iter().filter(|e| e.version > from) {
                    send(&outbound, ServerMessage::Operation {
                        operation: entry.operation.clone(),
                        client_id: entry.client_id,
                        new_version: entry.version,
                    });
                }
                send(&outbound, ServerMessage::ReplayComplete {
                    version,
                    presence: self.presence.selections(),
                    clients: self.presence.clients(),
                    acknowledged_seq,
                });
            }
            _ => {
                send(&outbound, ServerMessage::SyncComplete {
                    value: self.value().clone(),
                    version,
                    presence: self.presence.selections(),
                    clients: self.presence.clients(),
                    acknowledged_seq,
                });
            }
        }

        self.outbound.insert(client_id, outbound);
        self.broadcast_except(Some(&client_id), ServerMessage::ClientJoined {
            client_id,
            client_record: Some(record),
        });
        Ok(outcome)
    }

    fn submit(
        &mut self,
        client_id: ClientId,
        operation: Operation,
        base_version: u64,
        seq: u64,
    ) -> Result<Submission> {
        let version = self.version();
        if base_version > version {
            return Err(Error::VersionAhead {
                base: base_version,
                current: version,
            });
        }
        if self.last_seq.get(&client_id).is_some_and(|&last| seq <= last) {
            debug!(document = %self.id, client = %client_id, seq, "duplicate submission ignored");
            return Ok(Submission::Duplicate);
        }
        if base_version < self.oldest_base() {
            self.send_to(&client_id, ServerMessage::ResyncRequired {
                current_version: version,
            });
            return Ok(Submission::ResyncRequired {
                current_version: version,
            });
        }

        let mut operation = operation;
        for entry in self.history.iter().filter(|e| e.version > base_version) {
            let side = Side::for_clients(&client_id, &entry.client_id);
            operation = transform_against(&operation, &entry.operation, side);
        }

        // The seq is spent whether or not the operation applies.
        self.last_seq.insert(client_id, seq);

        let new_version = version + 1;
        if let Err(err) = self.replica.apply_accepted(&operation, new_version) {
            if !err.is_rejection() {
                return Err(err);
            }
            warn!(document = %self.id, client = %client_id, error = %err, "operation rejected");
            let reason = err.to_string();
            self.send_to(&client_id, ServerMessage::Rejected {
                reason: reason.clone(),
                current_version: version,
            });
            return Ok(Submission::Rejected { reason });
        }

        self.history.push_back(AcceptedOperation {
            version: new_version,
            client_id,
            operation: operation.clone(),
        });
        while self.history.len() > self.retention {
            self.history.pop_front();
        }
        self.presence.set_version(&client_id, new_version);

        self.broadcast(ServerMessage::Operation {
            operation,
            client_id,
            new_version,
        });
        Ok(Submission::Accepted {
            version: new_version,
        })
    }

    /// Removes `client_id` if `connection` is still the one it is registered
    /// with. A connection the client has since replaced leaves nothing behind.
    fn leave(&mut self, client_id: &ClientId, connection: &Outbound) -> Option<ClientRecord> {
        let current = self.outbound.get(client_id)?;
        if !current.same_channel(connection) {
            debug!(document = %self.id, client = %client_id, "superseded connection closed");
            return None;
        }
        self.disconnect(client_id)
    }

    fn disconnect(&mut self, client_id: &ClientId) -> Option<ClientRecord> {
        self.outbound.remove(client_id);
        let record = self.presence.leave(client_id)?;
        self.broadcast_except(Some(client_id), ServerMessage::ClientLeft {
            client_id: *client_id,
            client_record: Some(record.clone()),
        });
        Some(record)
    }

    fn update_selection(&mut self, client_id: &ClientId, selection: Option<Selection>) -> bool {
        let Some(record) = self.presence.update_selection(client_id, selection.clone()) else {
            return false;
        };
        let message = ServerMessage::Selection {
            client_id: *client_id,
            selection,
            client_record: record.clone(),
        };
        self.broadcast_except(Some(client_id), message);
        true
    }

    fn send_to(&mut self, client_id: &ClientId, message: ServerMessage) {
        let delivered = match self.outbound.get(client_id) {
            Some(outbound) => send(outbound, message),
            None => return,
        };
        if !delivered {
            self.evict(client_id);
        }
    }

    fn broadcast(&mut self, message: ServerMessage) {
        self.broadcast_except(None, message);
    }

    fn broadcast_except(&mut self, skip: Option<&ClientId>, message: ServerMessage) {
        let stalled: Vec<ClientId> = self
            .outbound
            .iter()
            .filter(|(client_id, _)| Some(*client_id) != skip)
            .filter(|(_, outbound)| !send(outbound, message.clone()))
            .map(|(client_id, _)| *client_id)
            .collect();
        for client_id in stalled {
            self.evict(&client_id);
        }
    }

    /// Drops a connection that cannot take more messages. Its socket task sees
    /// the queue close and hangs up; the client resyncs on reconnect.
    fn evict(&mut self, client_id: &ClientId) {
        warn!(document = %self.id, client = %client_id, "dropping stalled connection");
        self.disconnect(client_id);
    }
}

/// Queues without waiting. `false` when the queue is full or closed.
fn send(outbound: &Outbound, message: ServerMessage) -> bool {
    match outbound.try_send(message) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => false,
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("dropping message for a closed connection");
            false
        }
    }
}

/// Number of messages a replay from `known` to `version` queues.
fn missed(version: u64, known: u64) -> usize {
    usize::try_from(version - known)
        .unwrap_or(usize::MAX)
        .saturating_add(1)
}

/// Counters reported by [`ServerAuthority::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    pub documents: usize,
    pub connected_clients: usize,
    pub accepted_operations: u64,
}

/// Registry of document sessions.
///
/// Sessions live in a concurrent ordered map; each is guarded by its own
/// mutex, so documents never contend with each other.
pub struct ServerAuthority {
    sessions: SkipMap<DocumentId, Arc<Mutex<DocumentSession>>>,
    retention: usize,
    create_missing: bool,
    accepted: AtomicU64,
}

impl ServerAuthority {
    /// Creates an authority.
    ///
    /// # Arguments
    ///
    /// * `retention` - Accepted operations kept per document for transforming
    ///   late submissions and replaying to reconnecting clients
    pub fn new(retention: usize) -> Self {
        ServerAuthority {
            sessions: SkipMap::new(),
            retention,
            create_missing: false,
            accepted: AtomicU64::new(0),
        }
    }

    /// Joining an unknown document creates it empty instead of failing.
    pub fn with_create_missing(mut self, create_missing: bool) -> Self {
        self.create_missing = create_missing;
        self
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Seeds a document with its initial value at version 0.
    ///
    /// # Errors
    ///
    /// * `DocumentExists` - a session for `id` already exists
    pub fn create_document(&self, id: DocumentId, value: Value) -> Result<()> {
        let session = Arc::new(Mutex::new(DocumentSession::new(
            id.clone(),
            value,
            self.retention,
        )));
        let entry = self.sessions.get_or_insert(id.clone(), session.clone());
        if !Arc::ptr_eq(entry.value(), &session) {
            return Err(Error::DocumentExists(id));
        }
        info!(document = %id, "document created");
        Ok(())
    }

    fn session(&self, id: &DocumentId) -> Result<Arc<Mutex<DocumentSession>>> {
        match self.sessions.get(id) {
            Some(entry) => Ok(entry.value().clone()),
            None => Err(Error::UnknownDocument(id.clone())),
        }
    }

    fn session_for_join(&self, id: &DocumentId) -> Result<Arc<Mutex<DocumentSession>>> {
        if self.create_missing && !self.sessions.contains_key(id) {
            let session = DocumentSession::new(
                id.clone(),
                Value::Object(Default::default()),
                self.retention,
            );
            let entry = self
                .sessions
                .get_or_insert(id.clone(), Arc::new(Mutex::new(session)));
            return Ok(entry.value().clone());
        }
        self.session(id)
    }

    /// Registers a client with a document and sends it the state it needs.
    ///
    /// Without `last_known_version` the client gets a `sync_complete` snapshot.
    /// With a version inside the retention window it gets the missed
    /// operations followed by `replay_complete`; otherwise `resync_required`.
    /// Everyone else is told about the newcomer.
    pub fn join(
        &self,
        document: &DocumentId,
        record: ClientRecord,
        last_known_version: Option<u64>,
        outbound: Outbound,
    ) -> Result<JoinOutcome> {
        let session = self.session_for_join(document)?;
        let mut session = session.lock();
        let client_id = record.client_id;
        let outcome = session.join(record, last_known_version, outbound)?;
        info!(document = %document, client = %client_id, ?outcome, "client joined");
        Ok(outcome)
    }

    /// Accepts an operation generated against `base_version`.
    ///
    /// # Errors
    ///
    /// * `UnknownDocument` - no such session
    /// * `VersionAhead` - `base_version` is newer than the document
    ///
    /// Rejections and resync requests are not errors: they are answered to the
    /// author directly and reported through [`Submission`].
    pub fn submit(
        &self,
        document: &DocumentId,
        client_id: ClientId,
        operation: Operation,
        base_version: u64,
        seq: u64,
    ) -> Result<Submission> {
        let session = self.session(document)?;
        let submission = session
            .lock()
            .submit(client_id, operation, base_version, seq)?;
        if let Submission::Accepted { version } = submission {
            self.accepted.fetch_add(1, Ordering::Relaxed);
            debug!(document = %document, client = %client_id, version, "operation accepted");
        }
        Ok(submission)
    }

    /// Removes a client when `connection` is the one it joined with last.
    /// Its accepted operations stay in the document.
    pub fn leave(
        &self,
        document: &DocumentId,
        client_id: &ClientId,
        connection: &Outbound,
    ) -> Option<ClientRecord> {
        let session = self.session(document).ok()?;
        let record = session.lock().leave(client_id, connection);
        if record.is_some() {
            info!(document = %document, client = %client_id, "client left");
        }
        record
    }

    /// Stores a client's selection and relays it to everyone else.
    pub fn update_selection(
        &self,
        document: &DocumentId,
        client_id: &ClientId,
        selection: Option<Selection>,
    ) -> Result<()> {
        let session = self.session(document)?;
        if !session.lock().update_selection(client_id, selection) {
            warn!(document = %document, client = %client_id, "selection from a client that has not joined");
        }
        Ok(())
    }

    /// Current value and version of a document.
    pub fn snapshot(&self, document: &DocumentId) -> Result<(Value, u64)> {
        let session = self.session(document)?;
        let session = session.lock();
        Ok((session.value().clone(), session.version()))
    }

    pub fn documents(&self) -> Vec<DocumentId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stats(&self) -> ServerStats {
        let connected_clients = self
            .sessions
            .iter()
            .map(|e| e.value().lock().connected())
            .sum();
        ServerStats {
            documents: self.sessions.len(),
            connected_clients,
            accepted_operations: self.accepted.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerAuthority {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}
