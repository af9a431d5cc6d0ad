/// Event normalizer: the only place that looks at raw push / REST payload
/// shapes. Everything downstream consumes [`Message`] and [`InboundEvent`].
use crate::error::{Result, SyncError};
use crate::model::{
    parse_timestamp, ActiveChat, ConversationKey, GroupId, Message, MessageId, MessageStatus,
    Participant, UserId, UserRef,
};
use crate::transport::Topic;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// A party as the server may send it: bare id, bare username, or a
/// (possibly partial) user object
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RawParty {
    Id(UserId),
    Name(String),
    User(RawUser),
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUser {
    #[serde(default)]
    pub id: Option<UserId>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub profile_picture_url: Option<String>,
}

/// Message payload from the private queue, a group topic or a REST reply
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub sender: Option<RawParty>,
    #[serde(default)]
    pub receiver: Option<RawParty>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReadReceipt {
    pub message_id: MessageId,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub receiver: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTyping {
    pub sender: String,
    #[serde(default)]
    pub receiver: Option<String>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub typing: bool,
}

/// Presence broadcast: `content` is a comma separated roster
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawBroadcast {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sender: Option<String>,
}

/// Every inbound payload shape, tagged by where it came from
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    PrivateMessage(RawMessage),
    GroupMessage { topic_group: GroupId, message: RawMessage },
    ReadReceipt(RawReadReceipt),
    Typing(RawTyping),
    Broadcast(RawBroadcast),
}

impl RawEvent {
    /// Decode a push body according to the topic it arrived on
    pub fn decode(topic: Topic, body: &str) -> Result<Self> {
        Ok(match topic {
            Topic::PrivateMessages => RawEvent::PrivateMessage(serde_json::from_str(body)?),
            Topic::Group(group_id) => RawEvent::GroupMessage {
                topic_group: group_id,
                message: serde_json::from_str(body)?,
            },
            Topic::ReadReceipts => RawEvent::ReadReceipt(serde_json::from_str(body)?),
            Topic::PrivateTyping | Topic::GroupTyping(_) => {
                RawEvent::Typing(serde_json::from_str(body)?)
            }
            Topic::Presence => RawEvent::Broadcast(serde_json::from_str(body)?),
        })
    }
}

/// Canonical inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(Message),
    Status {
        message_id: MessageId,
        status: MessageStatus,
    },
    Typing {
        key: ConversationKey,
        /// Resolved id of the typist when known (private chats)
        user_id: Option<UserId>,
        display_name: String,
        typing: bool,
    },
    /// Full roster snapshot, plus the user the broadcast was about
    Roster {
        online: Vec<String>,
        edge: Option<PresenceEdge>,
    },
}

/// Directed transition named by a JOIN / LEAVE broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEdge {
    pub username: String,
    pub online: bool,
}

/// What the normalizer knows about the world
pub struct NormalizeContext<'a> {
    pub me: &'a UserRef,
    pub active: Option<&'a ActiveChat>,
    /// Username -> id for known conversation counterparts
    pub directory: &'a HashMap<String, UserId>,
}

impl<'a> NormalizeContext<'a> {
    /// Map a bare username to a participant: ourselves, the open chat's
    /// counterpart, then any known counterpart; otherwise left unresolved
    pub fn resolve_username(&self, username: &str) -> Participant {
        if username == self.me.username {
            return Participant::from(self.me);
        }
        if let Some(counterpart) = self.active.and_then(|a| a.counterpart.as_ref()) {
            if counterpart.username == username {
                return Participant::from(counterpart);
            }
        }
        match self.directory.get(username) {
            Some(id) => Participant::resolved(*id, Some(username.to_string())),
            None => Participant::unresolved(username),
        }
    }

    fn resolve_id(&self, id: UserId) -> Participant {
        if id == self.me.id {
            return Participant::from(self.me);
        }
        if let Some(counterpart) = self.active.and_then(|a| a.counterpart.as_ref()) {
            if counterpart.id == id {
                return Participant::from(counterpart);
            }
        }
        Participant::resolved(id, None)
    }

    fn resolve(&self, party: &RawParty) -> Participant {
        match party {
            RawParty::Id(id) => self.resolve_id(*id),
            RawParty::Name(name) => self.resolve_username(name),
            RawParty::User(user) => match (user.id, user.username.as_deref()) {
                (Some(id), username) => {
                    let mut p = self.resolve_id(id);
                    if let Some(name) = username {
                        p.username = Some(name.to_string());
                    }
                    if user.profile_picture_url.is_some() {
                        p.profile_picture_url = user.profile_picture_url.clone();
                    }
                    p
                }
                (None, Some(name)) => {
                    let mut p = self.resolve_username(name);
                    if user.profile_picture_url.is_some() {
                        p.profile_picture_url = user.profile_picture_url.clone();
                    }
                    p
                }
                (None, None) => Participant {
                    id: None,
                    username: None,
                    profile_picture_url: user.profile_picture_url.clone(),
                },
            },
        }
    }
}

/// Turn a raw event into its canonical form. `Ok(None)` means the event is
/// deliberately ignored (self echo, other group, unknown typist, ...).
pub fn normalize(raw: RawEvent, ctx: &NormalizeContext<'_>) -> Result<Option<InboundEvent>> {
    match raw {
        RawEvent::PrivateMessage(message) => {
            normalize_message(message, None, ctx).map(|m| Some(InboundEvent::Message(m)))
        }
        RawEvent::GroupMessage {
            topic_group,
            message,
        } => normalize_message(message, Some(topic_group), ctx)
            .map(|m| Some(InboundEvent::Message(m))),
        RawEvent::ReadReceipt(receipt) => Ok(Some(InboundEvent::Status {
            message_id: receipt.message_id,
            status: MessageStatus::Read,
        })),
        RawEvent::Typing(typing) => Ok(normalize_typing(typing, ctx)),
        RawEvent::Broadcast(broadcast) => Ok(normalize_broadcast(broadcast)),
    }
}

/// Normalize a message payload. `topic_group` is the group topic the
/// payload arrived on, if any.
pub fn normalize_message(
    raw: RawMessage,
    topic_group: Option<GroupId>,
    ctx: &NormalizeContext<'_>,
) -> Result<Message> {
    let id = raw
        .id
        .ok_or_else(|| SyncError::Protocol("message without id cannot be deduplicated".to_string()))?;

    let group_id = raw.group_id.or(topic_group);

    let sender = match raw.sender.as_ref() {
        Some(party) => ctx.resolve(party),
        None if group_id.is_some() => Participant::default(),
        None => {
            return Err(SyncError::Protocol(format!(
                "private message {} has no sender",
                id
            )));
        }
    };

    let receiver = if group_id.is_some() {
        None
    } else {
        // Our private queue only carries messages we sent or received
        match raw.receiver.as_ref() {
            Some(party) => Some(ctx.resolve(party)),
            None if sender.id == Some(ctx.me.id) => ctx
                .active
                .and_then(|a| a.counterpart.as_ref())
                .map(Participant::from),
            None => Some(Participant::from(ctx.me)),
        }
    };

    let timestamp = match raw.timestamp.as_ref().and_then(parse_timestamp) {
        Some(ts) => ts,
        None => {
            debug!("Message {} has no usable timestamp, using receipt time", id);
            Utc::now()
        }
    };

    let status = raw
        .status
        .as_deref()
        .and_then(MessageStatus::parse)
        .unwrap_or(MessageStatus::Sent);

    Ok(Message {
        id,
        sender,
        receiver,
        group_id,
        content: raw.content,
        timestamp,
        status,
    })
}

fn normalize_typing(raw: RawTyping, ctx: &NormalizeContext<'_>) -> Option<InboundEvent> {
    if raw.sender == ctx.me.username {
        return None;
    }

    if let Some(group_id) = raw.group_id {
        let open_group = ctx.active.and_then(|a| a.group_id());
        if open_group != Some(group_id) {
            debug!("Ignoring typing for group {} (not open)", group_id);
            return None;
        }
        return Some(InboundEvent::Typing {
            key: ConversationKey::Group(group_id),
            user_id: None,
            display_name: raw.sender,
            typing: raw.typing,
        });
    }

    let typist = ctx.resolve_username(&raw.sender);
    match typist.id {
        Some(user_id) => Some(InboundEvent::Typing {
            key: ConversationKey::private(ctx.me.id, user_id),
            user_id: Some(user_id),
            display_name: raw.sender,
            typing: raw.typing,
        }),
        None => {
            debug!("Ignoring typing from unknown user {}", raw.sender);
            None
        }
    }
}

fn normalize_broadcast(raw: RawBroadcast) -> Option<InboundEvent> {
    match raw.kind.as_str() {
        kind @ ("JOIN" | "LEAVE") => {
            let edge = raw
                .sender
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| PresenceEdge {
                    username: name.to_string(),
                    online: kind == "JOIN",
                });
            let online = raw
                .content
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
            Some(InboundEvent::Roster { online, edge })
        }
        _ => None,
    }
}
