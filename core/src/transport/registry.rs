/// Desired subscriptions, kept independent of connection state so every
/// (re)connect can replay them
use crate::model::GroupId;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A push destination the client can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// `/user/{u}/queue/reply`
    PrivateMessages,
    /// `/user/{u}/queue/read`
    ReadReceipts,
    /// `/user/{u}/queue/typing`
    PrivateTyping,
    /// `/topic/public` (JOIN/LEAVE roster broadcast)
    Presence,
    /// `/topic/{groupId}`
    Group(GroupId),
    /// `/topic/{groupId}/typing`
    GroupTyping(GroupId),
}

/// Subscriptions every session holds from the moment it connects
pub const SESSION_TOPICS: [Topic; 4] = [
    Topic::PrivateMessages,
    Topic::ReadReceipts,
    Topic::PrivateTyping,
    Topic::Presence,
];

impl Topic {
    /// Broker destination for this topic as seen by `username`
    pub fn destination(&self, username: &str) -> String {
        match self {
            Topic::PrivateMessages => format!("/user/{}/queue/reply", username),
            Topic::ReadReceipts => format!("/user/{}/queue/read", username),
            Topic::PrivateTyping => format!("/user/{}/queue/typing", username),
            Topic::Presence => "/topic/public".to_string(),
            Topic::Group(id) => format!("/topic/{}", id),
            Topic::GroupTyping(id) => format!("/topic/{}/typing", id),
        }
    }

    /// Reverse of [`destination`](Self::destination). Brokers may rewrite
    /// user destinations, so the `/user/..` prefix is matched loosely.
    pub fn from_destination(destination: &str) -> Option<Topic> {
        if destination == "/topic/public" {
            return Some(Topic::Presence);
        }
        if let Some(rest) = destination.strip_prefix("/topic/") {
            return match rest.split_once('/') {
                Some((id, "typing")) => id.parse().ok().map(Topic::GroupTyping),
                Some(_) => None,
                None => rest.parse().ok().map(Topic::Group),
            };
        }
        if destination.ends_with("/queue/reply") {
            Some(Topic::PrivateMessages)
        } else if destination.ends_with("/queue/read") {
            Some(Topic::ReadReceipts)
        } else if destination.ends_with("/queue/typing") {
            Some(Topic::PrivateTyping)
        } else {
            None
        }
    }

    /// The pair of topics that follow the open group conversation
    pub fn group_pair(group_id: GroupId) -> [Topic; 2] {
        [Topic::Group(group_id), Topic::GroupTyping(group_id)]
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::PrivateMessages => write!(f, "private-messages"),
            Topic::ReadReceipts => write!(f, "read-receipts"),
            Topic::PrivateTyping => write!(f, "private-typing"),
            Topic::Presence => write!(f, "presence"),
            Topic::Group(id) => write!(f, "group-{}", id),
            Topic::GroupTyping(id) => write!(f, "group-{}-typing", id),
        }
    }
}

/// Ad-hoc subscriptions the client wants, replayed on every connect
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    desired: Arc<RwLock<BTreeSet<Topic>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a topic; returns false if it was already desired
    pub async fn register_desired(&self, topic: Topic) -> bool {
        self.desired.write().await.insert(topic)
    }

    pub async fn remove_desired(&self, topic: Topic) -> bool {
        self.desired.write().await.remove(&topic)
    }

    pub async fn is_desired(&self, topic: Topic) -> bool {
        self.desired.read().await.contains(&topic)
    }

    /// Snapshot in a stable order
    pub async fn desired(&self) -> Vec<Topic> {
        self.desired.read().await.iter().copied().collect()
    }

    pub async fn clear(&self) {
        self.desired.write().await.clear();
    }
}
