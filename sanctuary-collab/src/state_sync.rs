//! Minimal-diff workspace state synchronization.
//!
//! The synchronizer keeps the last state it believes the session has seen.
//! `sync()` sends only the keys whose values changed and folds them into that
//! snapshot optimistically: there is no acknowledgement, so a dropped frame
//! is only repaired by an explicit [`StateSynchronizer::resync`].
//!
//! Keys absent from a candidate are never deleted from the snapshot and are
//! never sent. Values compare by deep equality.

use serde_json::{Map, Value};

use crate::connection::TransportHandle;
use crate::protocol::{ClientEvent, StatePatch};

/// Last-known workspace state, key to arbitrary value.
pub type StateSnapshot = Map<String, Value>;

/// Entries of `candidate` that are new or differ from `last`.
pub fn diff(last: &StateSnapshot, candidate: &StateSnapshot) -> StatePatch {
    candidate
        .iter()
        .filter(|(key, value)| last.get(key.as_str()) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Result of a sync request.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// No key changed; nothing sent
    Unchanged,
    /// This diff was sent and folded into the snapshot
    Emitted(StatePatch),
    /// Not connected; nothing sent, snapshot untouched
    Offline,
}

impl SyncOutcome {
    pub fn is_emitted(&self) -> bool {
        matches!(self, SyncOutcome::Emitted(_))
    }
}

pub struct StateSynchronizer {
    transport: TransportHandle,
    last: StateSnapshot,
}

impl StateSynchronizer {
    pub fn new(transport: TransportHandle) -> Self {
        Self { transport, last: StateSnapshot::new() }
    }

    /// Send the keys of `candidate` that differ from the last-known state.
    pub fn sync(&mut self, candidate: &StateSnapshot) -> SyncOutcome {
        let changed = diff(&self.last, candidate);
        if changed.is_empty() {
            return SyncOutcome::Unchanged;
        }
        if !self.transport.emit(ClientEvent::StateSync(changed.clone())) {
            log::debug!("State diff of {} key(s) not sent while offline", changed.len());
            return SyncOutcome::Offline;
        }
        self.merge(&changed);
        SyncOutcome::Emitted(changed)
    }

    /// Fold a peer's diff into the snapshot. The last applied value per key wins.
    pub fn apply_remote(&mut self, patch: &StatePatch) {
        self.merge(patch);
    }

    /// Re-send the whole snapshot, e.g. after reconnecting.
    pub fn resync(&mut self) -> SyncOutcome {
        if self.last.is_empty() {
            return SyncOutcome::Unchanged;
        }
        if !self.transport.emit(ClientEvent::StateSync(self.last.clone())) {
            return SyncOutcome::Offline;
        }
        SyncOutcome::Emitted(self.last.clone())
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        &self.last
    }

    fn merge(&mut self, patch: &StatePatch) {
        for (key, value) in patch {
            self.last.insert(key.clone(), value.clone());
        }
    }
}
