/// Presence tracker: online / last-seen / offline per conversation counterpart
use crate::model::{Presence, UserId};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// What a roster pass changed and which users need a last-seen query
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RosterOutcome {
    pub changed: Vec<(UserId, Presence)>,
    pub needs_last_seen: Vec<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineOutcome {
    /// State written, already non-online, or a query is already pending
    Applied,
    /// User was online: fetch a last-seen timestamp instead
    NeedsLastSeen,
}

#[derive(Default)]
pub struct PresenceTracker {
    states: HashMap<UserId, Presence>,
    /// Known counterparts: username -> id
    known: HashMap<String, UserId>,
    /// Left the roster while online; a last-seen query is outstanding
    awaiting: HashSet<UserId>,
    roster: BTreeSet<String>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a counterpart so roster names can be mapped to it
    pub fn learn(&mut self, user_id: UserId, username: &str) {
        if !username.is_empty() {
            self.known.insert(username.to_string(), user_id);
        }
    }

    /// Id of a known counterpart by username
    pub fn known_id(&self, username: &str) -> Option<UserId> {
        self.known.get(username).copied()
    }

    /// Reconcile a roster snapshot against every known counterpart
    pub fn apply_roster(&mut self, online: &[String]) -> RosterOutcome {
        self.roster = online.iter().cloned().collect();
        let mut outcome = RosterOutcome::default();

        for (username, user_id) in &self.known {
            let user_id = *user_id;
            let current = self.states.get(&user_id).copied();

            if self.roster.contains(username) {
                self.awaiting.remove(&user_id);
                if current != Some(Presence::Online) {
                    self.states.insert(user_id, Presence::Online);
                    outcome.changed.push((user_id, Presence::Online));
                }
                continue;
            }

            match current {
                Some(Presence::Online) if !self.awaiting.contains(&user_id) => {
                    // online -> absent is the edge worth a fresh timestamp
                    self.awaiting.insert(user_id);
                    outcome.needs_last_seen.push(user_id);
                }
                Some(Presence::Online) | None => {
                    self.awaiting.remove(&user_id);
                    self.states.insert(user_id, Presence::Offline);
                    outcome.changed.push((user_id, Presence::Offline));
                }
                Some(Presence::LastSeen(_)) | Some(Presence::Offline) => {}
            }
        }

        outcome.changed.sort_by_key(|(id, _)| *id);
        outcome.needs_last_seen.sort_unstable();
        debug!(
            "Roster of {}: {} changed, {} need last-seen",
            self.roster.len(),
            outcome.changed.len(),
            outcome.needs_last_seen.len()
        );
        outcome
    }

    /// Directed online signal; returns true if the state changed
    pub fn set_online(&mut self, user_id: UserId) -> bool {
        self.awaiting.remove(&user_id);
        self.states.insert(user_id, Presence::Online) != Some(Presence::Online)
    }

    /// Directed offline signal. An online user is not overwritten; the
    /// caller should query the last-seen time instead, once per edge.
    pub fn set_offline(&mut self, user_id: UserId) -> OfflineOutcome {
        match self.states.get(&user_id) {
            Some(Presence::Online) if self.awaiting.insert(user_id) => {
                OfflineOutcome::NeedsLastSeen
            }
            Some(Presence::Online) | Some(Presence::LastSeen(_)) => OfflineOutcome::Applied,
            _ => {
                self.states.insert(user_id, Presence::Offline);
                OfflineOutcome::Applied
            }
        }
    }

    /// Fold in a last-seen query result; returns what changed
    pub fn apply_last_seen(
        &mut self,
        statuses: HashMap<UserId, Presence>,
    ) -> Vec<(UserId, Presence)> {
        let mut changed = Vec::new();
        for (user_id, presence) in statuses {
            self.awaiting.remove(&user_id);
            if self.states.insert(user_id, presence) != Some(presence) {
                changed.push((user_id, presence));
            }
        }
        changed.sort_by_key(|(id, _)| *id);
        changed
    }

    pub fn status(&self, user_id: UserId) -> Presence {
        self.states.get(&user_id).copied().unwrap_or(Presence::Offline)
    }

    /// Usernames in the last roster snapshot
    pub fn online(&self) -> Vec<String> {
        self.roster.iter().cloned().collect()
    }
}
