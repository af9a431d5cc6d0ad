/// Users the local user has blocked
use crate::model::{UserId, UserRef};
use std::collections::BTreeMap;

#[derive(Default)]
pub struct BlockList {
    blocked: BTreeMap<UserId, UserRef>,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list with a fresh server snapshot
    pub fn replace(&mut self, users: Vec<UserRef>) {
        self.blocked = users.into_iter().map(|u| (u.id, u)).collect();
    }

    pub fn block(&mut self, user: UserRef) -> bool {
        self.blocked.insert(user.id, user).is_none()
    }

    pub fn unblock(&mut self, user_id: UserId) -> bool {
        self.blocked.remove(&user_id).is_some()
    }

    pub fn is_blocked(&self, user_id: UserId) -> bool {
        self.blocked.contains_key(&user_id)
    }

    pub fn is_blocked_name(&self, username: &str) -> bool {
        self.blocked.values().any(|u| u.username == username)
    }

    pub fn users(&self) -> Vec<UserRef> {
        self.blocked.values().cloned().collect()
    }
}
