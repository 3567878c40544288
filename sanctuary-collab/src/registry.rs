//! Roster of session participants.
//!
//! The local user is held separately from remote collaborators and is never
//! part of the remote roster. Records are replaced whole on every change, so a
//! consumer holding an earlier clone never observes a half-applied update.

use std::collections::HashMap;

use crate::protocol::{Collaborator, CollaboratorPatch};

/// What a `collaborator_joined` did to the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// New remote collaborator
    Inserted,
    /// Existing remote record replaced
    Replaced,
    /// The join named the local user; only the local record was refreshed
    Local,
}

/// Keyed store of collaborators for one session.
#[derive(Debug, Clone)]
pub struct CollaboratorRegistry {
    local: Collaborator,
    remote: HashMap<String, Collaborator>,
}

impl CollaboratorRegistry {
    pub fn new(local: Collaborator) -> Self {
        Self { local, remote: HashMap::new() }
    }

    /// Insert or replace a remote collaborator.
    pub fn join(&mut self, collaborator: Collaborator) -> JoinOutcome {
        if collaborator.id == self.local.id {
            self.local.name = collaborator.name;
            if collaborator.avatar.is_some() {
                self.local.avatar = collaborator.avatar;
            }
            return JoinOutcome::Local;
        }
        match self.remote.insert(collaborator.id.clone(), collaborator) {
            Some(_) => JoinOutcome::Replaced,
            None => JoinOutcome::Inserted,
        }
    }

    /// Remove a remote collaborator. Unknown ids and the local id are no-ops.
    pub fn leave(&mut self, id: &str) -> Option<Collaborator> {
        self.remote.remove(id)
    }

    /// Apply a partial update to a known collaborator.
    ///
    /// Returns the new record, or `None` if `id` is unknown. Updates never
    /// create records.
    pub fn merge_update(&mut self, id: &str, patch: &CollaboratorPatch) -> Option<Collaborator> {
        if id == self.local.id {
            return Some(self.update_local(patch));
        }
        let slot = self.remote.get_mut(id)?;
        *slot = patch.apply(slot);
        Some(slot.clone())
    }

    /// Apply a partial update to the local user's record.
    pub fn update_local(&mut self, patch: &CollaboratorPatch) -> Collaborator {
        self.local = patch.apply(&self.local);
        self.local.clone()
    }

    pub fn local(&self) -> &Collaborator {
        &self.local
    }

    pub fn get(&self, id: &str) -> Option<&Collaborator> {
        if id == self.local.id {
            Some(&self.local)
        } else {
            self.remote.get(id)
        }
    }

    /// Whether `id` is a known remote collaborator.
    pub fn contains(&self, id: &str) -> bool {
        self.remote.contains_key(id)
    }

    /// Remote roster size.
    pub fn len(&self) -> usize {
        self.remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remote.is_empty()
    }

    /// Remote collaborators, ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = &Collaborator> {
        let mut all: Vec<&Collaborator> = self.remote.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all.into_iter()
    }

    /// Owned snapshot of [`Self::iter`].
    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.iter().cloned().collect()
    }

    /// Drop every remote collaborator. The local record is kept.
    pub fn clear(&mut self) {
        self.remote.clear();
    }
}
