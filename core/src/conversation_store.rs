/// Conversation store: per-conversation message lists, the summary list and
/// history cursors. The only writer is its own methods.
use crate::model::{
    ConversationKey, ConversationKind, ConversationSummary, Message, MessageId, MessageStatus,
    PaginationCursor, Participant, UserId,
};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Result of [`ConversationStore::ingest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New id placed in its conversation
    Added(ConversationKey),
    /// Id already known, nothing changed
    Duplicate,
    /// Id already stored; its parties were filled in
    Upgraded(ConversationKey),
    /// A party is unresolved, held back until it can be keyed
    Parked,
}

pub struct ConversationStore {
    me: UserId,
    messages: HashMap<ConversationKey, Vec<Message>>,
    /// message id -> conversation holding it
    locations: HashMap<MessageId, ConversationKey>,
    parked: HashMap<MessageId, Message>,
    summaries: HashMap<ConversationKey, ConversationSummary>,
    cursors: HashMap<ConversationKey, PaginationCursor>,
    /// Latest history fetch per conversation; replies to older ones are stale
    load_tickets: HashMap<ConversationKey, u64>,
}

impl ConversationStore {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            messages: HashMap::new(),
            locations: HashMap::new(),
            parked: HashMap::new(),
            summaries: HashMap::new(),
            cursors: HashMap::new(),
            load_tickets: HashMap::new(),
        }
    }

    pub fn me(&self) -> UserId {
        self.me
    }

    /// Add a live or fetched message, deduplicated by id
    pub fn ingest(&mut self, message: Message) -> IngestOutcome {
        match message.conversation_key() {
            Some(key) => self.ingest_into(key, message),
            None => {
                if self.locations.contains_key(&message.id) {
                    return IngestOutcome::Duplicate;
                }
                debug!("Parking message {} with unresolved party", message.id);
                self.parked.entry(message.id).or_insert(message);
                IngestOutcome::Parked
            }
        }
    }

    /// Place a message under an explicit key
    pub fn ingest_into(&mut self, key: ConversationKey, message: Message) -> IngestOutcome {
        self.parked.remove(&message.id);

        if let Some(existing_key) = self.locations.get(&message.id).copied() {
            return self.upgrade_parties(existing_key, &message);
        }

        let id = message.id;
        let list = self.messages.entry(key).or_default();
        let at = list.partition_point(|m| m.sort_key() <= message.sort_key());
        list.insert(at, message);
        self.locations.insert(id, key);
        IngestOutcome::Added(key)
    }

    fn upgrade_parties(&mut self, key: ConversationKey, incoming: &Message) -> IngestOutcome {
        let Some(stored) = self
            .messages
            .get_mut(&key)
            .and_then(|list| list.iter_mut().find(|m| m.id == incoming.id))
        else {
            return IngestOutcome::Duplicate;
        };

        let mut changed = fill_participant(&mut stored.sender, &incoming.sender);
        if let (Some(stored_rx), Some(incoming_rx)) =
            (stored.receiver.as_mut(), incoming.receiver.as_ref())
        {
            changed |= fill_participant(stored_rx, incoming_rx);
        }

        if changed {
            debug!("Filled in parties of message {}", incoming.id);
            IngestOutcome::Upgraded(key)
        } else {
            IngestOutcome::Duplicate
        }
    }

    /// Merge a history page. Page 0 replaces the list, later pages (newest
    /// first from the server) are prepended after dropping known ids.
    /// Returns how many messages were added.
    pub fn ingest_page(
        &mut self,
        key: ConversationKey,
        messages: Vec<Message>,
        page: u32,
        has_more: bool,
    ) -> usize {
        if page == 0 {
            if let Some(old) = self.messages.remove(&key) {
                for message in old {
                    self.locations.remove(&message.id);
                }
            }
        }

        let mut fresh = Vec::with_capacity(messages.len());
        for message in messages.into_iter().rev() {
            if message.conversation_key().is_some_and(|k| k != key) {
                warn!("Message {} does not belong to {}, skipping", message.id, key);
                continue;
            }
            let known = self.locations.contains_key(&message.id)
                || fresh.iter().any(|m: &Message| m.id == message.id);
            if known {
                continue;
            }
            self.parked.remove(&message.id);
            fresh.push(message);
        }

        let added = fresh.len();
        for message in &fresh {
            self.locations.insert(message.id, key);
        }

        let list = self.messages.entry(key).or_default();
        let existing = std::mem::take(list);
        *list = fresh;
        list.extend(existing);
        // Pages may straddle live messages; the list stays ordered regardless
        list.sort_by_key(Message::sort_key);

        self.cursors.insert(
            key,
            PaginationCursor {
                page,
                has_more,
                loading: false,
            },
        );
        debug!("Page {} of {}: {} new messages", page, key, added);
        added
    }

    /// Update or create the summary for the message's conversation
    pub fn summarize(&mut self, message: &Message) -> Option<ConversationSummary> {
        let key = message.conversation_key()?;
        let me = self.me;

        let summary = self.summaries.entry(key).or_insert_with(|| ConversationSummary {
            id: key.summary_id(me),
            kind: key.kind(),
            display_name: String::new(),
            avatar_url: None,
            last_message: None,
            last_message_timestamp: None,
            last_message_sender_id: None,
            last_message_status: None,
            unread_count: 0,
        });

        let newer = summary
            .last_message_timestamp
            .map(|ts| message.timestamp >= ts)
            .unwrap_or(true);
        if newer {
            summary.last_message = Some(message.content.clone());
            summary.last_message_timestamp = Some(message.timestamp);
            summary.last_message_sender_id = message.sender.id;
            summary.last_message_status = Some(message.status);
        }

        if message.sender.id != Some(me) {
            summary.unread_count += 1;
        }

        if key.kind() == ConversationKind::Private {
            let other = if message.sender.id == Some(me) {
                message.receiver.as_ref()
            } else {
                Some(&message.sender)
            };
            if let Some(other) = other {
                if let Some(name) = other.username.as_ref().filter(|n| !n.is_empty()) {
                    summary.display_name = name.clone();
                }
                if other.profile_picture_url.is_some() {
                    summary.avatar_url = other.profile_picture_url.clone();
                }
            }
        }

        let updated = summary.clone();
        self.drop_self_conversation(key);
        Some(updated)
    }

    /// Zero the unread count; returns true if it was non-zero
    pub fn mark_read(&mut self, key: ConversationKey) -> bool {
        self.set_unread_count(key, 0)
    }

    /// Apply a delivery/read transition by message id. Status never moves
    /// backwards. Returns the conversation when something changed.
    pub fn apply_status(
        &mut self,
        message_id: MessageId,
        status: MessageStatus,
    ) -> Option<ConversationKey> {
        if let Some(parked) = self.parked.get_mut(&message_id) {
            if status.rank() > parked.status.rank() {
                parked.status = status;
            }
            return None;
        }

        let key = *self.locations.get(&message_id)?;
        let stored = self
            .messages
            .get_mut(&key)?
            .iter_mut()
            .find(|m| m.id == message_id)?;

        if status.rank() <= stored.status.rank() {
            if status != stored.status {
                debug!(
                    "Ignoring {} for message {} already {}",
                    status, message_id, stored.status
                );
            }
            return None;
        }
        stored.status = status;

        let is_last = self.messages.get(&key).and_then(|l| l.last()).map(|m| m.id) == Some(message_id);
        if is_last {
            if let Some(summary) = self.summaries.get_mut(&key) {
                summary.last_message_status = Some(status);
            }
        }
        Some(key)
    }

    /// Merge a full conversation list fetched from the server
    pub fn merge_summaries(&mut self, server: Vec<ConversationSummary>) {
        for mut incoming in server {
            let key = incoming.key(self.me);
            if let Some(local) = self.summaries.get(&key) {
                if incoming.avatar_url.is_none() && key.kind() == ConversationKind::Group {
                    incoming.avatar_url = local.avatar_url.clone();
                }
                if incoming.display_name.is_empty() {
                    incoming.display_name = local.display_name.clone();
                }
            }
            self.summaries.insert(key, incoming);
        }

        let has_real_private = self.summaries.keys().any(|k| {
            k.kind() == ConversationKind::Private && k.counterpart(self.me) != Some(self.me)
        });
        if has_real_private {
            self.summaries.remove(&ConversationKey::private(self.me, self.me));
        }
    }

    fn drop_self_conversation(&mut self, written: ConversationKey) {
        if written.kind() == ConversationKind::Private
            && written.counterpart(self.me) != Some(self.me)
            && self
                .summaries
                .remove(&ConversationKey::private(self.me, self.me))
                .is_some()
        {
            debug!("Dropped self conversation summary");
        }
    }

    /// Username -> id for every counterpart we know
    pub fn directory(&self) -> HashMap<String, UserId> {
        let mut directory = HashMap::new();
        for (key, summary) in &self.summaries {
            if let Some(id) = key.counterpart(self.me) {
                if !summary.display_name.is_empty() {
                    directory.insert(summary.display_name.clone(), id);
                }
            }
        }
        for list in self.messages.values() {
            for message in list {
                for party in std::iter::once(&message.sender).chain(message.receiver.as_ref()) {
                    if let (Some(id), Some(name)) = (party.id, party.username.as_ref()) {
                        directory.entry(name.clone()).or_insert(id);
                    }
                }
            }
        }
        directory
    }

    /// Resolve parked and stored participants known only by name. Returns
    /// the parked messages that could now be placed.
    pub fn reconcile_identities(
        &mut self,
        directory: &HashMap<String, UserId>,
    ) -> Vec<(ConversationKey, Message)> {
        for list in self.messages.values_mut() {
            for message in list.iter_mut() {
                resolve_from(&mut message.sender, directory);
                if let Some(receiver) = message.receiver.as_mut() {
                    resolve_from(receiver, directory);
                }
            }
        }

        let parked_ids: Vec<MessageId> = self.parked.keys().copied().collect();
        let mut placed = Vec::new();
        for id in parked_ids {
            let Some(mut message) = self.parked.remove(&id) else {
                continue;
            };
            resolve_from(&mut message.sender, directory);
            if let Some(receiver) = message.receiver.as_mut() {
                resolve_from(receiver, directory);
            }
            match message.conversation_key() {
                Some(key) => {
                    if let IngestOutcome::Added(key) = self.ingest_into(key, message.clone()) {
                        placed.push((key, message));
                    }
                }
                None => {
                    self.parked.insert(id, message);
                }
            }
        }
        if !placed.is_empty() {
            debug!("Placed {} parked messages", placed.len());
        }
        placed
    }

    pub fn set_conversation_image(
        &mut self,
        key: ConversationKey,
        url: Option<String>,
    ) -> Option<ConversationSummary> {
        let summary = self.summaries.get_mut(&key)?;
        summary.avatar_url = url;
        Some(summary.clone())
    }

    pub fn set_display_name(
        &mut self,
        key: ConversationKey,
        name: String,
    ) -> Option<ConversationSummary> {
        let summary = self.summaries.get_mut(&key)?;
        summary.display_name = name;
        Some(summary.clone())
    }

    /// Override the unread count of a listed conversation; true if it changed
    pub fn set_unread_count(&mut self, key: ConversationKey, count: u64) -> bool {
        match self.summaries.get_mut(&key) {
            Some(summary) if summary.unread_count != count => {
                summary.unread_count = count;
                true
            }
            _ => false,
        }
    }

    /// Mark a page fetch as in flight and return its ticket. Page 0 always
    /// goes out and supersedes anything pending; an older page is refused
    /// while another fetch is in flight.
    pub fn begin_page_load(&mut self, key: ConversationKey, page: u32) -> Option<u64> {
        let cursor = self.cursors.entry(key).or_default();
        if page > 0 && cursor.loading {
            return None;
        }
        cursor.loading = true;
        let ticket = self.load_tickets.entry(key).or_insert(0);
        *ticket += 1;
        Some(*ticket)
    }

    /// True if `ticket` belongs to the latest fetch for `key`
    pub fn is_current_load(&self, key: ConversationKey, ticket: u64) -> bool {
        self.load_tickets.get(&key) == Some(&ticket)
    }

    /// A page fetch failed: the list is left intact. A stale failure does
    /// not touch the fetch that superseded it.
    pub fn fail_page_load(&mut self, key: ConversationKey, ticket: u64) {
        if !self.is_current_load(key, ticket) {
            return;
        }
        if let Some(cursor) = self.cursors.get_mut(&key) {
            cursor.loading = false;
        }
    }

    /// Next page to request, if there is one and nothing is in flight
    pub fn next_page(&self, key: ConversationKey) -> Option<u32> {
        let cursor = self.cursor(key);
        (cursor.has_more && !cursor.loading).then(|| cursor.page + 1)
    }

    pub fn cursor(&self, key: ConversationKey) -> PaginationCursor {
        self.cursors.get(&key).copied().unwrap_or_default()
    }

    pub fn messages(&self, key: ConversationKey) -> &[Message] {
        self.messages.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        let key = self.locations.get(&id)?;
        self.messages.get(key)?.iter().find(|m| m.id == id)
    }

    /// Summary list, most recent conversation first
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        let mut list: Vec<ConversationSummary> = self.summaries.values().cloned().collect();
        list.sort_by(|a, b| {
            b.last_message_timestamp
                .cmp(&a.last_message_timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    pub fn summary(&self, key: ConversationKey) -> Option<&ConversationSummary> {
        self.summaries.get(&key)
    }

    /// Delivered messages addressed to us that have not been read yet
    pub fn unread_for_me(&self, key: ConversationKey) -> Vec<MessageId> {
        self.messages(key)
            .iter()
            .filter(|m| {
                m.status == MessageStatus::Delivered
                    && m.receiver.as_ref().and_then(|r| r.id) == Some(self.me)
            })
            .map(|m| m.id)
            .collect()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }
}

/// Copy missing fields from `incoming`; true if anything changed
fn fill_participant(stored: &mut Participant, incoming: &Participant) -> bool {
    let mut changed = false;
    if stored.id.is_none() && incoming.id.is_some() {
        stored.id = incoming.id;
        changed = true;
    }
    if stored.username.is_none() && incoming.username.is_some() {
        stored.username = incoming.username.clone();
        changed = true;
    }
    if stored.profile_picture_url.is_none() && incoming.profile_picture_url.is_some() {
        stored.profile_picture_url = incoming.profile_picture_url.clone();
        changed = true;
    }
    changed
}

fn resolve_from(party: &mut Participant, directory: &HashMap<String, UserId>) {
    if party.id.is_some() {
        return;
    }
    if let Some(id) = party.username.as_ref().and_then(|name| directory.get(name)) {
        party.id = Some(*id);
    }
}
