/// Canonical data model shared by the stores, trackers and the rendering layer
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type MessageId = i64;
pub type UserId = i64;
pub type GroupId = i64;

/// Delivery state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    /// Position in the SENT < DELIVERED < READ progression
    pub fn rank(self) -> u8 {
        match self {
            MessageStatus::Sent => 0,
            MessageStatus::Delivered => 1,
            MessageStatus::Read => 2,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SENT" => Some(MessageStatus::Sent),
            "DELIVERED" => Some(MessageStatus::Delivered),
            "READ" => Some(MessageStatus::Read),
            _ => None,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageStatus::Sent => "SENT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Read => "READ",
        };
        f.write_str(s)
    }
}

/// A fully known user (the local user, a profile, a contact)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub profile_picture_url: Option<String>,
}

impl UserRef {
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            profile_picture_url: None,
        }
    }
}

/// One side of a message. `id` is `None` when the push payload only named
/// the user and the name could not be mapped to an id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: Option<UserId>,
    pub username: Option<String>,
    pub profile_picture_url: Option<String>,
}

impl Participant {
    pub fn resolved(id: UserId, username: Option<String>) -> Self {
        Self {
            id: Some(id),
            username,
            profile_picture_url: None,
        }
    }

    pub fn unresolved(username: impl Into<String>) -> Self {
        Self {
            id: None,
            username: Some(username.into()),
            profile_picture_url: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.id.is_some()
    }
}

impl From<&UserRef> for Participant {
    fn from(user: &UserRef) -> Self {
        Self {
            id: Some(user.id),
            username: Some(user.username.clone()),
            profile_picture_url: user.profile_picture_url.clone(),
        }
    }
}

/// Canonical message. Exactly one of `receiver` / `group_id` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender: Participant,
    pub receiver: Option<Participant>,
    pub group_id: Option<GroupId>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

impl Message {
    /// Direction-independent key, or `None` for a private message with an
    /// unresolved party.
    pub fn conversation_key(&self) -> Option<ConversationKey> {
        if let Some(group_id) = self.group_id {
            return Some(ConversationKey::Group(group_id));
        }
        let sender = self.sender.id?;
        let receiver = self.receiver.as_ref()?.id?;
        Some(ConversationKey::private(sender, receiver))
    }

    /// Ordering key inside a conversation: timestamp, then id
    pub fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.timestamp, self.id)
    }

    pub fn sender_id(&self) -> Option<UserId> {
        self.sender.id
    }

    pub fn is_group(&self) -> bool {
        self.group_id.is_some()
    }

    /// True when some party is still only known by name
    pub fn has_unresolved_party(&self) -> bool {
        !self.sender.is_resolved()
            || self
                .receiver
                .as_ref()
                .map(|r| !r.is_resolved())
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConversationKind {
    Private,
    Group,
}

/// Normalized conversation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConversationKey {
    Group(GroupId),
    Private { low: UserId, high: UserId },
}

impl ConversationKey {
    pub fn group(group_id: GroupId) -> Self {
        ConversationKey::Group(group_id)
    }

    /// Same key for (a, b) and (b, a)
    pub fn private(a: UserId, b: UserId) -> Self {
        ConversationKey::Private {
            low: a.min(b),
            high: a.max(b),
        }
    }

    pub fn kind(&self) -> ConversationKind {
        match self {
            ConversationKey::Group(_) => ConversationKind::Group,
            ConversationKey::Private { .. } => ConversationKind::Private,
        }
    }

    pub fn group_id(&self) -> Option<GroupId> {
        match *self {
            ConversationKey::Group(id) => Some(id),
            ConversationKey::Private { .. } => None,
        }
    }

    /// The other party of a private conversation as seen from `me`
    pub fn counterpart(&self, me: UserId) -> Option<UserId> {
        match *self {
            ConversationKey::Group(_) => None,
            ConversationKey::Private { low, high } => Some(if low == me { high } else { low }),
        }
    }

    /// Id under which the server lists this conversation for `me`
    /// (group id, or the counterpart's user id)
    pub fn summary_id(&self, me: UserId) -> i64 {
        match *self {
            ConversationKey::Group(id) => id,
            ConversationKey::Private { .. } => self.counterpart(me).unwrap_or(me),
        }
    }

    /// Inverse of [`summary_id`](Self::summary_id)
    pub fn from_summary(kind: ConversationKind, id: i64, me: UserId) -> Self {
        match kind {
            ConversationKind::Group => ConversationKey::Group(id),
            ConversationKind::Private => ConversationKey::private(me, id),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Group(id) => write!(f, "group_{}", id),
            ConversationKey::Private { low, high } => write!(f, "private_{}_{}", low, high),
        }
    }
}

/// One row of the conversation list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Group id, or the counterpart's user id for private chats
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(rename = "name", default)]
    pub display_name: String,
    #[serde(rename = "profilePictureUrl", default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default, with = "lenient_timestamp")]
    pub last_message_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message_sender_id: Option<UserId>,
    #[serde(default)]
    pub last_message_status: Option<MessageStatus>,
    #[serde(default)]
    pub unread_count: u64,
}

impl ConversationSummary {
    pub fn key(&self, me: UserId) -> ConversationKey {
        ConversationKey::from_summary(self.kind, self.id, me)
    }
}

/// Backward history cursor for one conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationCursor {
    pub page: u32,
    pub has_more: bool,
    pub loading: bool,
}

impl Default for PaginationCursor {
    fn default() -> Self {
        Self {
            page: 0,
            has_more: true,
            loading: false,
        }
    }
}

/// Presence of one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "since", rename_all = "snake_case")]
pub enum Presence {
    Online,
    LastSeen(DateTime<Utc>),
    Offline,
}

impl Presence {
    pub fn is_online(&self) -> bool {
        matches!(self, Presence::Online)
    }

    /// Parse the status service value: the literal "online" or a timestamp
    pub fn from_status(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("online") {
            return Presence::Online;
        }
        match parse_timestamp_str(raw) {
            Some(ts) => Presence::LastSeen(ts),
            None => Presence::Offline,
        }
    }
}

/// Active typing indicator; absence means nobody is typing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEntry {
    pub display_name: String,
    pub typing: bool,
}

/// The conversation currently open in the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveChat {
    pub key: ConversationKey,
    /// Counterpart of a private chat
    pub counterpart: Option<UserRef>,
}

impl ActiveChat {
    pub fn private(me: UserId, counterpart: UserRef) -> Self {
        Self {
            key: ConversationKey::private(me, counterpart.id),
            counterpart: Some(counterpart),
        }
    }

    pub fn group(group_id: GroupId) -> Self {
        Self {
            key: ConversationKey::Group(group_id),
            counterpart: None,
        }
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.key.group_id()
    }
}

/// Parse a server timestamp: RFC3339, zone-less ISO local date-time (taken
/// as UTC), epoch millis (number or string), or a `[y, m, d, h, min, s, nanos]` array.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        Value::Array(parts) => {
            let nums: Vec<i64> = parts.iter().filter_map(Value::as_i64).collect();
            if nums.len() < 3 || nums.len() != parts.len() {
                return None;
            }
            let at = |i: usize| nums.get(i).copied().unwrap_or(0);
            let part = |i: usize| u32::try_from(at(i)).ok();
            let date = NaiveDate::from_ymd_opt(i32::try_from(at(0)).ok()?, part(1)?, part(2)?)?;
            let naive = date.and_hms_nano_opt(part(3)?, part(4)?, part(5)?, part(6)?)?;
            Some(naive.and_utc())
        }
        _ => None,
    }
}

pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(millis) = raw.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp_millis(millis);
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Serde adapter for optional timestamps in any of the server's formats
pub mod lenient_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(value.as_ref().and_then(super::parse_timestamp))
    }

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.map(|ts| ts.to_rfc3339()).serialize(serializer)
    }
}
