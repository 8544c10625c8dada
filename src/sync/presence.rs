//! Presence: who is connected to a document and where their selection is.
//!
//! Records live in an arena (a slot vector plus an id index and a free list)
//! so a session can keep stable slots while clients come and go. Selections
//! are relayed most-recent-wins and never take part in transformation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ot::{ClientId, Selection};
use crate::sync::protocol::PresenceMap;

/// A participant of a document session as seen by everyone else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub client_id: ClientId,
    pub display_label: String,
    pub color: String,
    #[serde(default)]
    pub last_known_version: Option<u64>,
    #[serde(default)]
    pub selection: Option<Selection>,
    pub last_seen: DateTime<Utc>,
}

impl ClientRecord {
    /// Creates a record, deriving the color from the client id when none is given.
    pub fn new(client_id: ClientId, display_label: impl Into<String>, color: Option<String>) -> Self {
        ClientRecord {
            client_id,
            display_label: display_label.into(),
            color: color.unwrap_or_else(|| client_id.color()),
            last_known_version: None,
            selection: None,
            last_seen: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// Arena of [`ClientRecord`]s keyed by client id.
#[derive(Debug, Default)]
pub struct PresenceManager {
    slots: Vec<Option<ClientRecord>>,
    index: HashMap<ClientId, usize>,
    free: Vec<usize>,
}

impl PresenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record, replacing any earlier record of the same client.
    /// Returns the replaced record.
    pub fn join(&mut self, record: ClientRecord) -> Option<ClientRecord> {
        if let Some(&slot) = self.index.get(&record.client_id) {
            return self.slots[slot].replace(record);
        }
        let id = record.client_id;
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(record);
                slot
            }
            None => {
                self.slots.push(Some(record));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);
        None
    }

    pub fn leave(&mut self, client_id: &ClientId) -> Option<ClientRecord> {
        let slot = self.index.remove(client_id)?;
        self.free.push(slot);
        self.slots[slot].take()
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&ClientRecord> {
        self.index
            .get(client_id)
            .and_then(|&slot| self.slots[slot].as_ref())
    }

    pub fn get_mut(&mut self, client_id: &ClientId) -> Option<&mut ClientRecord> {
        let slot = *self.index.get(client_id)?;
        self.slots[slot].as_mut()
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.index.contains_key(client_id)
    }

    /// Stores the latest selection of a client. The newest update always wins.
    pub fn update_selection(
        &mut self,
        client_id: &ClientId,
        selection: Option<Selection>,
    ) -> Option<&ClientRecord> {
        let record = self.get_mut(client_id)?;
        record.selection = selection;
        record.touch();
        Some(&*record)
    }

    /// Records that a client has seen `version`.
    pub fn set_version(&mut self, client_id: &ClientId, version: u64) {
        if let Some(record) = self.get_mut(client_id) {
            record.last_known_version = Some(version);
            record.touch();
        }
    }

    /// All records, ordered by client id.
    pub fn clients(&self) -> Vec<ClientRecord> {
        let mut clients: Vec<ClientRecord> = self.slots.iter().flatten().cloned().collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }

    pub fn client_ids(&self) -> impl Iterator<Item = &ClientId> {
        self.index.keys()
    }

    /// The `client id -> selection` map handed to late joiners.
    pub fn selections(&self) -> PresenceMap {
        self.slots
            .iter()
            .flatten()
            .filter_map(|r| r.selection.clone().map(|s| (r.client_id, s)))
            .collect()
    }

    /// Replaces the whole arena with `clients`, then applies `selections`.
    pub fn replace_all(&mut self, clients: Vec<ClientRecord>, selections: &PresenceMap) {
        self.clear();
        for record in clients {
            self.join(record);
        }
        for (client_id, selection) in selections {
            if let Some(record) = self.get_mut(client_id) {
                record.selection = Some(selection.clone());
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.free.clear();
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
