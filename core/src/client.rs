/// Sync client: owns the session, routes push events through the normalizer
/// into the stores and exposes actions and read-only selectors
use crate::block_list::BlockList;
use crate::config::Config;
use crate::conversation_store::{ConversationStore, IngestOutcome};
use crate::credential_store::CredentialStore;
use crate::error::{Result, SyncError};
use crate::model::{
    ActiveChat, ConversationKey, ConversationKind, ConversationSummary, GroupId, Message,
    MessageId, MessageStatus, PaginationCursor, Presence, TypingEntry, UserId, UserRef,
};
use crate::normalizer::{
    normalize, normalize_message, InboundEvent, NormalizeContext, PresenceEdge, RawEvent,
};
use crate::presence_tracker::{OfflineOutcome, PresenceTracker, RosterOutcome};
use crate::rest_client::{ChatApi, HttpChatApi, MessageInfo, OutgoingMessage};
use crate::transport::{ConnectionManager, ConnectionState, Delivery, SubscriptionRegistry, Topic};
use crate::typing_tracker::{TypingSignal, TypingTracker};
use crate::utils::{ChatEvent, EventEmitter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const TYPING_DESTINATION: &str = "/app/chat.typing";
const SEND_DESTINATION: &str = "/app/chat.sendMessage";

/// Everything rebuilt from REST and push on each sign-in
struct SyncState {
    me: UserRef,
    active: Option<ActiveChat>,
    conversations: ConversationStore,
    presence: PresenceTracker,
    blocks: BlockList,
}

impl SyncState {
    fn new(me: UserRef) -> Self {
        Self {
            conversations: ConversationStore::new(me.id),
            me,
            active: None,
            presence: PresenceTracker::new(),
            blocks: BlockList::new(),
        }
    }

    fn is_blocked(&self, message: &Message) -> bool {
        if message.is_group() {
            return false;
        }
        match (message.sender_id(), message.sender.username.as_deref()) {
            (Some(id), _) => self.blocks.is_blocked(id),
            (None, Some(name)) => self.blocks.is_blocked_name(name),
            (None, None) => false,
        }
    }

    /// Remember the private counterpart of a message for roster mapping
    fn learn_counterpart(&mut self, message: &Message) {
        if message.is_group() {
            return;
        }
        let me = self.me.id;
        for party in std::iter::once(&message.sender).chain(message.receiver.as_ref()) {
            if let (Some(id), Some(name)) = (party.id, party.username.as_deref()) {
                if id != me {
                    self.presence.learn(id, name);
                }
            }
        }
    }
}

/// Chat sync client
pub struct ChatClient {
    config: Config,
    api: Arc<dyn ChatApi>,
    credentials: Option<CredentialStore>,
    connection: ConnectionManager,
    typing: TypingTracker,
    typing_outbound: Arc<Mutex<Option<mpsc::UnboundedReceiver<TypingSignal>>>>,
    events: EventEmitter,
    token: Arc<RwLock<Option<String>>>,
    state: Arc<RwLock<Option<SyncState>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ChatClient {
    pub fn new(config: Config, api: Arc<dyn ChatApi>, credentials: Option<CredentialStore>) -> Self {
        let events = EventEmitter::default();
        let (typing_tx, typing_rx) = mpsc::unbounded_channel();
        let typing = TypingTracker::new(
            config.typing_debounce,
            config.typing_safety_timeout,
            typing_tx,
            events.clone(),
        );
        let connection = ConnectionManager::new(config.clone(), SubscriptionRegistry::new());
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            api,
            credentials,
            connection,
            typing,
            typing_outbound: Arc::new(Mutex::new(Some(typing_rx))),
            events,
            token: Arc::new(RwLock::new(None)),
            state: Arc::new(RwLock::new(None)),
            tasks: Arc::new(Mutex::new(Vec::new())),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Client over the HTTP service with a durable token store in `data_dir`
    pub fn from_config(config: Config) -> Result<Self> {
        let api = HttpChatApi::new(&config)?;
        let credentials = CredentialStore::new(&config.data_dir)?;
        Ok(Self::new(config, Arc::new(api), Some(credentials)))
    }

    /// Authenticate: reuse a stored token if the server still accepts it,
    /// otherwise log in with the configured password
    pub async fn sign_in(&self) -> Result<UserRef> {
        let username = self.config.username.clone();

        let stored = match &self.credentials {
            Some(store) => store.load(&username).unwrap_or_else(|e| {
                warn!("Could not read stored credentials: {}", e);
                None
            }),
            None => None,
        };

        if let Some(creds) = stored {
            self.api.set_token(Some(creds.token.clone()));
            match self.api.profile().await {
                Ok(me) => {
                    info!("Resumed session for {} (token from {})", me.username, creds.saved_at);
                    self.begin_session(creds.token, me.clone()).await;
                    return Ok(me);
                }
                Err(e) if e.is_auth_failure() => {
                    warn!("Stored token rejected, signing in again");
                    self.forget_credentials();
                    self.api.set_token(None);
                }
                Err(e) => return Err(e),
            }
        }

        let password = self.config.password.as_deref().ok_or_else(|| {
            SyncError::Unauthorized("no stored session and no password given".to_string())
        })?;
        let auth = self.api.login(&username, password).await?;
        self.api.set_token(Some(auth.token.clone()));

        let me = match self.api.profile().await {
            Ok(me) => me,
            Err(e) => {
                self.api.set_token(None);
                return Err(e);
            }
        };

        if let Some(store) = &self.credentials {
            if let Err(e) = store.save(&me.username, &auth.token) {
                warn!("Could not persist token: {}", e);
            }
        }
        info!("Signed in as {} ({})", me.username, me.id);
        self.begin_session(auth.token, me.clone()).await;
        Ok(me)
    }

    async fn begin_session(&self, token: String, me: UserRef) {
        *self.token.write().await = Some(token);
        *self.state.write().await = Some(SyncState::new(me));
    }

    /// Load the initial state, open the push session and start the
    /// background tasks
    pub async fn start(&self) -> Result<()> {
        let token = self
            .token
            .read()
            .await
            .clone()
            .ok_or_else(|| SyncError::Unauthorized("not signed in".to_string()))?;
        let me = self
            .me()
            .await
            .ok_or_else(|| SyncError::Unauthorized("not signed in".to_string()))?;

        self.shutdown.send_replace(false);

        if let Err(e) = self.refresh_conversations().await {
            if e.is_auth_failure() {
                return Err(e);
            }
            warn!("Initial conversation load failed: {}", e);
        }
        if let Err(e) = self.refresh_blocks().await {
            warn!("Block list load failed: {}", e);
        }
        if let Err(e) = self.refresh_online_users().await {
            warn!("Online user load failed: {}", e);
        }

        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let session = self
            .connection
            .connect(&token, &me.username, deliveries_tx)
            .await;

        let mut tasks = self.tasks.lock().await;
        tasks.push({
            let client = self.clone();
            tokio::spawn(async move { client.run_dispatcher(deliveries_rx).await })
        });
        tasks.push({
            let client = self.clone();
            tokio::spawn(async move { client.run_typing_outbound().await })
        });
        tasks.push({
            let client = self.clone();
            tokio::spawn(async move { client.run_conversation_poll().await })
        });
        tasks.push({
            let client = self.clone();
            let states = session.watch_state();
            tokio::spawn(async move { client.run_connection_watch(states).await })
        });

        info!("Sync started for {}", me.username);
        Ok(())
    }

    /// Stop background work and close the session; state is kept
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.typing.clear().await;
        self.connection.disconnect().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if timeout(Duration::from_secs(2), task).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }
        info!("Sync stopped");
    }

    /// Shut down and forget the session, including the stored token
    pub async fn logout(&self) {
        self.shutdown().await;
        self.forget_credentials();
        self.api.set_token(None);
        *self.token.write().await = None;
        *self.state.write().await = None;
        info!("Logged out");
    }

    fn forget_credentials(&self) {
        if let Some(store) = &self.credentials {
            if let Err(e) = store.clear() {
                warn!("Could not clear stored token: {}", e);
            }
        }
    }

    /// The server rejected our token mid-session
    async fn expire_session(&self) {
        error!("Session rejected by server, signing out");
        self.shutdown.send_replace(true);
        self.forget_credentials();
        self.api.set_token(None);
        *self.token.write().await = None;
        *self.state.write().await = None;
        self.typing.clear().await;
        self.connection.disconnect().await;
        self.events.emit(ChatEvent::SessionExpired);
    }

    /// Route auth failures of any REST call to the session teardown
    async fn checked<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_auth_failure() {
                self.expire_session().await;
            }
        }
        result
    }

    // ---- inbound ----

    /// Decode, normalize and apply one push frame. Never fails: problems
    /// are logged and the frame is dropped.
    pub async fn handle_delivery(&self, delivery: Delivery) {
        let raw = match RawEvent::decode(delivery.topic, &delivery.body) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Undecodable payload on {}: {}", delivery.topic, e);
                return;
            }
        };

        let event = {
            let guard = self.state.read().await;
            let Some(state) = guard.as_ref() else {
                debug!("Dropping event on {}: no session", delivery.topic);
                return;
            };
            let directory = state.conversations.directory();
            let ctx = NormalizeContext {
                me: &state.me,
                active: state.active.as_ref(),
                directory: &directory,
            };
            match normalize(raw, &ctx) {
                Ok(Some(event)) => event,
                Ok(None) => return,
                Err(e) => {
                    warn!("Dropping event on {}: {}", delivery.topic, e);
                    return;
                }
            }
        };

        self.handle_event(event).await;
    }

    /// Apply a canonical event to the stores
    pub async fn handle_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::Message(message) => {
                self.fold_message(message).await;
            }
            InboundEvent::Status { message_id, status } => {
                self.apply_status(message_id, status).await;
            }
            InboundEvent::Typing {
                key,
                user_id,
                display_name,
                typing,
            } => {
                if let Some(user_id) = user_id {
                    let blocked = self
                        .state
                        .read()
                        .await
                        .as_ref()
                        .map(|s| s.blocks.is_blocked(user_id))
                        .unwrap_or(true);
                    if blocked {
                        return;
                    }
                }
                self.typing.remote_typing(key, &display_name, typing).await;
            }
            InboundEvent::Roster { online, edge } => {
                self.apply_presence(&online, edge.as_ref()).await;
            }
        }
    }

    /// Single path for every message, pushed or returned by a send
    async fn fold_message(&self, message: Message) -> IngestOutcome {
        let mut mark_active = None;
        let mut group_to_describe = None;

        let outcome = {
            let mut guard = self.state.write().await;
            let Some(state) = guard.as_mut() else {
                return IngestOutcome::Duplicate;
            };
            if state.is_blocked(&message) {
                debug!("Dropping message {} from blocked user", message.id);
                return IngestOutcome::Duplicate;
            }

            let outcome = state.conversations.ingest(message.clone());
            match outcome {
                IngestOutcome::Added(key) => {
                    state.learn_counterpart(&message);
                    let summary = state.conversations.summarize(&message);
                    self.events.emit(ChatEvent::MessageAdded {
                        key,
                        message: message.clone(),
                    });

                    let is_active = state.active.as_ref().map(|a| a.key) == Some(key);
                    if is_active && message.sender_id() != Some(state.me.id) {
                        mark_active = Some(key);
                    } else if let Some(summary) = summary {
                        if summary.kind == ConversationKind::Group && summary.display_name.is_empty()
                        {
                            group_to_describe = message.group_id;
                        }
                        self.events.emit(ChatEvent::ConversationUpdated { summary });
                    }
                }
                IngestOutcome::Upgraded(key) => {
                    state.learn_counterpart(&message);
                    if let Some(stored) = state.conversations.message(message.id) {
                        self.events.emit(ChatEvent::MessageUpdated {
                            key,
                            message: stored.clone(),
                        });
                    }
                }
                IngestOutcome::Parked => {
                    debug!(
                        "Message {} parked until the next conversation refresh",
                        message.id
                    );
                }
                IngestOutcome::Duplicate => {}
            }
            outcome
        };

        if let Some(key) = mark_active {
            if let Err(e) = self.mark_read(key).await {
                warn!("Mark-read for {} failed: {}", key, e);
            }
        }
        if let Some(group_id) = group_to_describe {
            let client = self.clone();
            tokio::spawn(async move {
                if let Err(e) = client.describe_group(group_id).await {
                    debug!("Group {} details unavailable: {}", group_id, e);
                }
            });
        }
        outcome
    }

    async fn apply_status(&self, message_id: MessageId, status: MessageStatus) {
        let mut guard = self.state.write().await;
        let Some(state) = guard.as_mut() else {
            return;
        };
        if state.conversations.apply_status(message_id, status).is_some() {
            self.events
                .emit(ChatEvent::MessageStatusChanged { message_id, status });
        }
    }

    /// Reconcile a roster snapshot, then the directed edge it came with.
    /// Users who went offline while online get a last-seen query.
    async fn apply_presence(&self, names: &[String], edge: Option<&PresenceEdge>) {
        let outcome = {
            let mut guard = self.state.write().await;
            let Some(state) = guard.as_mut() else {
                return;
            };
            let mut outcome = state.presence.apply_roster(names);
            let edge_user =
                edge.and_then(|e| Some((state.presence.known_id(&e.username)?, e.online)));
            match edge_user {
                Some((user_id, true)) => {
                    if state.presence.set_online(user_id) {
                        outcome.changed.push((user_id, Presence::Online));
                    }
                }
                Some((user_id, false)) => {
                    if state.presence.set_offline(user_id) == OfflineOutcome::NeedsLastSeen {
                        outcome.needs_last_seen.push(user_id);
                    }
                }
                None => {}
            }
            outcome
        };
        let RosterOutcome {
            changed,
            needs_last_seen,
        } = outcome;
        for (user_id, presence) in changed {
            self.events
                .emit(ChatEvent::PresenceChanged { user_id, presence });
        }
        if !needs_last_seen.is_empty() {
            let client = self.clone();
            tokio::spawn(async move {
                if let Err(e) = client.fetch_last_seen(&needs_last_seen).await {
                    warn!("Last-seen fetch failed: {}", e);
                }
            });
        }
    }

    // ---- actions ----

    /// Send a message to a conversation. A failed send is not applied.
    pub async fn send_message(&self, key: ConversationKey, content: &str) -> Result<Message> {
        let (me, outgoing) = self.outgoing(key, content).await?;

        self.typing.local_stop_typing(key).await;
        let raw = self.checked(self.api.send_message(&outgoing).await).await?;

        let message = {
            let guard = self.state.read().await;
            let state = guard
                .as_ref()
                .ok_or_else(|| SyncError::Unauthorized("session ended".to_string()))?;
            let directory = state.conversations.directory();
            let ctx = NormalizeContext {
                me: &state.me,
                active: state.active.as_ref(),
                directory: &directory,
            };
            let mut message = normalize_message(raw, key.group_id(), &ctx)?;
            // The reply may name only ids; we know who it went to
            if let (ConversationKey::Private { .. }, None) = (key, message.conversation_key()) {
                if let Some(other) = key.counterpart(me.id) {
                    message.receiver.get_or_insert_with(Default::default).id = Some(other);
                    message.sender.id.get_or_insert(me.id);
                }
            }
            message
        };

        self.fold_message(message.clone()).await;
        Ok(message)
    }

    /// Body for a send to `key`; refuses empty content and blocked users
    async fn outgoing(
        &self,
        key: ConversationKey,
        content: &str,
    ) -> Result<(UserRef, OutgoingMessage)> {
        if content.trim().is_empty() {
            return Err(SyncError::Protocol("refusing to send an empty message".to_string()));
        }
        let me = self
            .me()
            .await
            .ok_or_else(|| SyncError::Unauthorized("not signed in".to_string()))?;

        let outgoing = match key {
            ConversationKey::Group(group_id) => OutgoingMessage::group(group_id, content),
            ConversationKey::Private { .. } => {
                let other = key.counterpart(me.id).unwrap_or(me.id);
                if self.is_blocked(other).await {
                    return Err(SyncError::Protocol(format!("user {} is blocked", other)));
                }
                OutgoingMessage::private(other, content)
            }
        };
        Ok((me, outgoing))
    }

    /// Send over the push session instead of REST. Nothing is applied
    /// locally; the broker's echo comes back through the normal push path.
    /// Returns false when there is no live session.
    pub async fn send_via_push(&self, key: ConversationKey, content: &str) -> Result<bool> {
        let (_, outgoing) = self.outgoing(key, content).await?;
        let body = serde_json::to_string(&outgoing)?;
        self.typing.local_stop_typing(key).await;
        Ok(self.connection.publish(SEND_DESTINATION, body).await)
    }

    /// Open a private chat
    pub async fn open_private(&self, user: UserRef) -> Result<()> {
        let me = self
            .me()
            .await
            .ok_or_else(|| SyncError::Unauthorized("not signed in".to_string()))?;
        self.select_conversation(ActiveChat::private(me.id, user)).await
    }

    pub async fn open_group(&self, group_id: GroupId) -> Result<()> {
        self.select_conversation(ActiveChat::group(group_id)).await
    }

    /// Switch the open conversation: move the group topics, load page 0,
    /// mark it read and refresh the counterpart's presence
    pub async fn select_conversation(&self, chat: ActiveChat) -> Result<()> {
        let key = chat.key;
        let previous = {
            let mut guard = self.state.write().await;
            let state = guard
                .as_mut()
                .ok_or_else(|| SyncError::Unauthorized("not signed in".to_string()))?;
            if let Some(counterpart) = &chat.counterpart {
                state.presence.learn(counterpart.id, &counterpart.username);
            }
            state.active.replace(chat.clone())
        };

        let previous_group = previous.as_ref().and_then(ActiveChat::group_id);
        if previous_group != chat.group_id() {
            if let Some(old) = previous_group {
                for topic in Topic::group_pair(old) {
                    self.connection.unsubscribe(topic).await;
                }
            }
            if let Some(new) = chat.group_id() {
                for topic in Topic::group_pair(new) {
                    self.connection.subscribe(topic).await;
                }
            }
        }
        if let Some(previous) = previous.filter(|p| p.key != key) {
            self.typing.local_stop_typing(previous.key).await;
        }
        info!("Opened {}", key);

        self.load_history(key, 0).await?;
        self.mark_read(key).await?;

        if let Some(counterpart) = &chat.counterpart {
            if let Err(e) = self.fetch_last_seen(&[counterpart.id]).await {
                warn!("Last-seen for {} failed: {}", counterpart.username, e);
            }
        }
        if let Some(group_id) = chat.group_id() {
            let described = self
                .summary(key)
                .await
                .map(|s| !s.display_name.is_empty())
                .unwrap_or(false);
            if !described {
                if let Err(e) = self.describe_group(group_id).await {
                    debug!("Group {} details unavailable: {}", group_id, e);
                }
            }
        }
        Ok(())
    }

    /// Fetch one history page. Page 0 always goes out and supersedes a
    /// pending older page, whose late reply is then dropped. An older page
    /// is skipped while another fetch is in flight. A failure leaves the
    /// list as it was.
    pub async fn load_history(&self, key: ConversationKey, page: u32) -> Result<usize> {
        let (me, ticket) = {
            let mut guard = self.state.write().await;
            let state = guard
                .as_mut()
                .ok_or_else(|| SyncError::Unauthorized("not signed in".to_string()))?;
            let Some(ticket) = state.conversations.begin_page_load(key, page) else {
                debug!("Page load for {} already in flight", key);
                return Ok(0);
            };
            (state.me.id, ticket)
        };

        let size = self.config.page_size;
        let fetched = match key {
            ConversationKey::Group(group_id) => self.api.group_history(group_id, page, size).await,
            ConversationKey::Private { .. } => {
                let other = key.counterpart(me).unwrap_or(me);
                self.api.private_history(me, other, page, size).await
            }
        };

        let history = match fetched {
            Ok(history) => history,
            Err(e) => {
                if let Some(state) = self.state.write().await.as_mut() {
                    state.conversations.fail_page_load(key, ticket);
                }
                warn!("History page {} of {} failed: {}", page, key, e);
                return self.checked(Err(e)).await;
            }
        };

        let has_more = !history.last;
        let mut guard = self.state.write().await;
        let Some(state) = guard.as_mut() else {
            return Ok(0);
        };
        if !state.conversations.is_current_load(key, ticket) {
            debug!("Dropping superseded page {} of {}", page, key);
            return Ok(0);
        }
        let directory = state.conversations.directory();
        let ctx = NormalizeContext {
            me: &state.me,
            active: state.active.as_ref(),
            directory: &directory,
        };
        let mut messages = Vec::with_capacity(history.content.len());
        for raw in history.content {
            match normalize_message(raw, key.group_id(), &ctx) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Skipping history entry for {}: {}", key, e),
            }
        }
        for message in &messages {
            state.learn_counterpart(message);
        }
        let added = state.conversations.ingest_page(key, messages, page, has_more);
        self.events.emit(ChatEvent::HistoryLoaded {
            key,
            page,
            has_more,
        });
        Ok(added)
    }

    /// Fetch the next older page, if any
    pub async fn load_more_history(&self, key: ConversationKey) -> Result<usize> {
        let next = self
            .state
            .read()
            .await
            .as_ref()
            .and_then(|s| s.conversations.next_page(key));
        match next {
            Some(page) => self.load_history(key, page).await,
            None => Ok(0),
        }
    }

    /// Zero the unread count and, for private chats, report every delivered
    /// message addressed to us as read. Returns how many were reported.
    pub async fn mark_read(&self, key: ConversationKey) -> Result<usize> {
        let pending = {
            let mut guard = self.state.write().await;
            let Some(state) = guard.as_mut() else {
                return Ok(0);
            };
            if state.conversations.mark_read(key) {
                if let Some(summary) = state.conversations.summary(key) {
                    self.events.emit(ChatEvent::ConversationUpdated {
                        summary: summary.clone(),
                    });
                }
            }
            match key.kind() {
                ConversationKind::Private => state.conversations.unread_for_me(key),
                ConversationKind::Group => Vec::new(),
            }
        };

        let mut reported = 0;
        for message_id in pending {
            let result = self.api.mark_read(message_id).await;
            self.checked(result).await?;
            self.apply_status(message_id, MessageStatus::Read).await;
            reported += 1;
        }
        Ok(reported)
    }

    /// Mark the open conversation read
    pub async fn mark_active_read(&self) -> Result<usize> {
        match self.active().await {
            Some(chat) => self.mark_read(chat.key).await,
            None => Ok(0),
        }
    }

    /// Announce a keystroke in a conversation
    pub async fn start_typing(&self, key: ConversationKey) {
        self.typing.local_start_typing(key).await;
    }

    pub async fn stop_typing(&self, key: ConversationKey) {
        self.typing.local_stop_typing(key).await;
    }

    pub async fn block_user(&self, user: UserRef) -> Result<()> {
        let result = self.api.block(user.id).await;
        self.checked(result).await?;
        if let Some(state) = self.state.write().await.as_mut() {
            state.blocks.block(user.clone());
        }
        info!("Blocked {}", user.username);
        Ok(())
    }

    pub async fn unblock_user(&self, user_id: UserId) -> Result<()> {
        let result = self.api.unblock(user_id).await;
        self.checked(result).await?;
        if let Some(state) = self.state.write().await.as_mut() {
            state.blocks.unblock(user_id);
        }
        info!("Unblocked {}", user_id);
        Ok(())
    }

    pub async fn refresh_blocks(&self) -> Result<()> {
        let result = self.api.blocked_users().await;
        let blocked = self.checked(result).await?;
        if let Some(state) = self.state.write().await.as_mut() {
            state.blocks.replace(blocked);
        }
        Ok(())
    }

    /// Full conversation-list refresh; also places messages that were
    /// parked for an unresolved party
    pub async fn refresh_conversations(&self) -> Result<()> {
        let result = self.api.conversations().await;
        let server = self.checked(result).await?;

        let mut guard = self.state.write().await;
        let Some(state) = guard.as_mut() else {
            return Ok(());
        };
        let me = state.me.id;
        for summary in &server {
            if let Some(id) = summary.key(me).counterpart(me) {
                state.presence.learn(id, &summary.display_name);
            }
        }
        state.conversations.merge_summaries(server);

        let directory = state.conversations.directory();
        for (key, message) in state.conversations.reconcile_identities(&directory) {
            self.events.emit(ChatEvent::MessageAdded { key, message });
        }
        self.events.emit(ChatEvent::ConversationsRefreshed);
        debug!(
            "Conversations refreshed ({} parked)",
            state.conversations.parked_count()
        );
        Ok(())
    }

    pub async fn refresh_online_users(&self) -> Result<()> {
        let result = self.api.online_users().await;
        let online = self.checked(result).await?;
        self.apply_presence(&online, None).await;
        Ok(())
    }

    /// Query last-seen / online state for some users
    pub async fn fetch_last_seen(&self, user_ids: &[UserId]) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let result = self.api.last_seen(user_ids).await;
        let statuses = self.checked(result).await?;
        let parsed: HashMap<UserId, Presence> = statuses
            .into_iter()
            .map(|(id, raw)| (id, Presence::from_status(&raw)))
            .collect();

        let changed = match self.state.write().await.as_mut() {
            Some(state) => state.presence.apply_last_seen(parsed),
            None => return Ok(()),
        };
        for (user_id, presence) in changed {
            self.events
                .emit(ChatEvent::PresenceChanged { user_id, presence });
        }
        Ok(())
    }

    /// Fill in a group's name and image, which push events do not carry
    pub async fn describe_group(&self, group_id: GroupId) -> Result<()> {
        let result = self.api.group(group_id).await;
        let group = self.checked(result).await?;
        let key = ConversationKey::Group(group_id);

        let mut guard = self.state.write().await;
        let Some(state) = guard.as_mut() else {
            return Ok(());
        };
        if !group.name.is_empty() {
            state.conversations.set_display_name(key, group.name);
        }
        if let Some(summary) = state.conversations.set_conversation_image(key, group.image_url) {
            self.events.emit(ChatEvent::ConversationUpdated { summary });
        }
        Ok(())
    }

    pub async fn message_info(&self, message_id: MessageId) -> Result<MessageInfo> {
        let result = self.api.message_info(message_id).await;
        self.checked(result).await
    }

    // ---- selectors ----

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub async fn me(&self) -> Option<UserRef> {
        self.state.read().await.as_ref().map(|s| s.me.clone())
    }

    pub async fn active(&self) -> Option<ActiveChat> {
        self.state.read().await.as_ref().and_then(|s| s.active.clone())
    }

    pub async fn messages(&self, key: ConversationKey) -> Vec<Message> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.conversations.messages(key).to_vec())
            .unwrap_or_default()
    }

    /// Conversation list, most recent first
    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.conversations.summaries())
            .unwrap_or_default()
    }

    pub async fn summary(&self, key: ConversationKey) -> Option<ConversationSummary> {
        self.state
            .read()
            .await
            .as_ref()
            .and_then(|s| s.conversations.summary(key).cloned())
    }

    pub async fn cursor(&self, key: ConversationKey) -> PaginationCursor {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.conversations.cursor(key))
            .unwrap_or_default()
    }

    pub async fn presence(&self, user_id: UserId) -> Presence {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.presence.status(user_id))
            .unwrap_or(Presence::Offline)
    }

    pub async fn online_users(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.presence.online())
            .unwrap_or_default()
    }

    pub async fn typing(&self, key: ConversationKey) -> Option<TypingEntry> {
        self.typing.entry(key).await
    }

    pub async fn blocked(&self) -> Vec<UserRef> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.blocks.users())
            .unwrap_or_default()
    }

    pub async fn is_blocked(&self, user_id: UserId) -> bool {
        self.state
            .read()
            .await
            .as_ref()
            .map(|s| s.blocks.is_blocked(user_id))
            .unwrap_or(false)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    /// Ad-hoc topics replayed on every connect
    pub async fn desired_topics(&self) -> Vec<Topic> {
        self.connection.registry().desired().await
    }

    // ---- background tasks ----

    async fn run_dispatcher(&self, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => self.handle_delivery(delivery).await,
                    None => break,
                },
            }
        }
        debug!("Dispatcher stopped");
    }

    async fn run_typing_outbound(&self) {
        let Some(mut signals) = self.typing_outbound.lock().await.take() else {
            warn!("Typing outbound already running");
            return;
        };
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => self.publish_typing(signal).await,
                    None => break,
                },
            }
        }
        *self.typing_outbound.lock().await = Some(signals);
        debug!("Typing outbound stopped");
    }

    async fn publish_typing(&self, signal: TypingSignal) {
        let payload = {
            let guard = self.state.read().await;
            let Some(state) = guard.as_ref() else {
                return;
            };
            match signal.key {
                ConversationKey::Group(group_id) => serde_json::json!({
                    "sender": state.me.username,
                    "groupId": group_id,
                    "typing": signal.typing,
                }),
                ConversationKey::Private { .. } => {
                    let from_active = state
                        .active
                        .as_ref()
                        .filter(|a| a.key == signal.key)
                        .and_then(|a| a.counterpart.as_ref())
                        .map(|c| c.username.clone());
                    let receiver = from_active.or_else(|| {
                        state
                            .conversations
                            .summary(signal.key)
                            .map(|s| s.display_name.clone())
                            .filter(|name| !name.is_empty())
                    });
                    let Some(receiver) = receiver else {
                        debug!("No username for {}, typing not sent", signal.key);
                        return;
                    };
                    serde_json::json!({
                        "sender": state.me.username,
                        "receiver": receiver,
                        "typing": signal.typing,
                    })
                }
            }
        };
        if !self
            .connection
            .publish(TYPING_DESTINATION, payload.to_string())
            .await
        {
            debug!("Typing signal for {} dropped: not connected", signal.key);
        }
    }

    async fn run_conversation_poll(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.config.conversation_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_conversations().await {
                        if e.is_auth_failure() {
                            break;
                        }
                        warn!("Conversation poll failed: {}", e);
                    }
                }
            }
        }
        debug!("Conversation poll stopped");
    }

    async fn run_connection_watch(&self, mut states: watch::Receiver<ConnectionState>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut was_connected = false;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    self.events.emit(ChatEvent::ConnectionChanged { state });
                    if state == ConnectionState::Connected {
                        if was_connected {
                            // Pushes sent while we were away are only in REST
                            info!("Reconnected, catching up");
                            if let Err(e) = self.refresh_conversations().await {
                                warn!("Catch-up refresh failed: {}", e);
                            }
                            if let Err(e) = self.refresh_online_users().await {
                                warn!("Catch-up roster failed: {}", e);
                            }
                        }
                        was_connected = true;
                    }
                }
            }
        }
        debug!("Connection watch stopped");
    }
}

impl Clone for ChatClient {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            api: self.api.clone(),
            credentials: self.credentials.clone(),
            connection: self.connection.clone(),
            typing: self.typing.clone(),
            typing_outbound: self.typing_outbound.clone(),
            events: self.events.clone(),
            token: self.token.clone(),
            state: self.state.clone(),
            tasks: self.tasks.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}
