/// Event emitter for the rendering layer and monitoring
use crate::model::{
    ConversationKey, ConversationSummary, Message, MessageId, MessageStatus, Presence,
    TypingEntry, UserId,
};
use crate::transport::ConnectionState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// State changes observers can react to without polling the stores
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A message was added to a conversation (push or history)
    MessageAdded { key: ConversationKey, message: Message },
    /// A parked message got its parties resolved and was placed
    MessageUpdated { key: ConversationKey, message: Message },
    /// Delivery status of a message advanced
    MessageStatusChanged {
        message_id: MessageId,
        status: MessageStatus,
    },
    /// A conversation summary changed
    ConversationUpdated { summary: ConversationSummary },
    /// The conversation list was reloaded from the server
    ConversationsRefreshed,
    /// A history page was merged
    HistoryLoaded {
        key: ConversationKey,
        page: u32,
        has_more: bool,
    },
    PresenceChanged { user_id: UserId, presence: Presence },
    /// `entry` is `None` once nobody is typing
    TypingChanged {
        key: ConversationKey,
        entry: Option<TypingEntry>,
    },
    ConnectionChanged { state: ConnectionState },
    /// The server rejected our token; the user must sign in again
    SessionExpired,
}

#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<ChatEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Fire and forget; having no listener is fine
    pub fn emit(&self, event: ChatEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
