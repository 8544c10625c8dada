//! Wire messages exchanged over a document connection.
//!
//! Every message is one JSON text frame tagged by its `"type"` field, e.g.
//!
//! ```json
//! {"type":"operation","operation":[{"kind":"insert_text","path":["title",0],"text":"a"}],"base_version":4,"seq":7}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::ot::{ClientId, DocumentId, Operation, Selection};
use crate::sync::presence::ClientRecord;

/// Selections of every client that currently has one.
pub type PresenceMap = BTreeMap<ClientId, Selection>;

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens (or re-opens) a session. With `last_known_version` the server
    /// replays what was missed instead of sending a snapshot.
    Join {
        document_id: DocumentId,
        client_id: ClientId,
        display_label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_known_version: Option<u64>,
    },
    Operation {
        operation: Operation,
        base_version: u64,
        seq: u64,
    },
    Selection {
        selection: Option<Selection>,
    },
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full snapshot, the answer to a join without a usable version.
    SyncComplete {
        value: Value,
        version: u64,
        presence: PresenceMap,
        clients: Vec<ClientRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        acknowledged_seq: Option<u64>,
    },
    /// Ends an incremental replay; the missed operations precede it.
    ReplayComplete {
        version: u64,
        presence: PresenceMap,
        clients: Vec<ClientRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        acknowledged_seq: Option<u64>,
    },
    ResyncRequired {
        current_version: u64,
    },
    /// An accepted operation, sent to every client including its author.
    Operation {
        operation: Operation,
        client_id: ClientId,
        new_version: u64,
    },
    Selection {
        client_id: ClientId,
        selection: Option<Selection>,
        client_record: ClientRecord,
    },
    ClientJoined {
        client_id: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_record: Option<ClientRecord>,
    },
    ClientLeft {
        client_id: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_record: Option<ClientRecord>,
    },
    /// The author's in-flight operation did not apply and was discarded.
    Rejected {
        reason: String,
        current_version: u64,
    },
    /// Sent right before the server closes the connection.
    Error {
        message: String,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
