/// Client scenarios against a scripted in-memory REST service
use async_trait::async_trait;
use chatsync_core::credential_store::CredentialStore;
use chatsync_core::model::{
    ConversationKey, ConversationKind, ConversationSummary, GroupId, MessageId, MessageStatus,
    Presence, UserId, UserRef,
};
use chatsync_core::normalizer::{RawMessage, RawParty, RawUser};
use chatsync_core::rest_client::{AuthToken, GroupInfo, HistoryPage, MessageInfo, OutgoingMessage};
use chatsync_core::transport::{Command, ConnectionState, Delivery, StompFrame, Topic};
use chatsync_core::{ChatApi, ChatClient, ChatEvent, Config, Result, SyncError};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, WebSocketStream};

const ME: UserId = 3;
const BOB: UserId = 7;
const CAROL: UserId = 9;

const WAIT: Duration = Duration::from_secs(5);

struct FakeApi {
    token: Mutex<Option<String>>,
    accepted_tokens: Vec<String>,
    reject_everything: AtomicBool,
    conversations: Mutex<Vec<ConversationSummary>>,
    pages: Mutex<HashMap<String, HistoryPage>>,
    /// Artificial latency per page name
    delays: Mutex<HashMap<String, Duration>>,
    online: Mutex<Vec<String>>,
    last_seen: Mutex<HashMap<UserId, String>>,
    blocked: Mutex<Vec<UserRef>>,
    calls: Mutex<Vec<String>>,
    next_id: AtomicI64,
}

impl FakeApi {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            token: Mutex::new(None),
            accepted_tokens: vec!["fresh".to_string(), "stored-good".to_string()],
            reject_everything: AtomicBool::new(false),
            conversations: Mutex::new(Vec::new()),
            pages: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            online: Mutex::new(Vec::new()),
            last_seen: Mutex::new(HashMap::new()),
            blocked: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1000),
        })
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    fn authorize(&self) -> Result<()> {
        let token = self.token.lock().unwrap().clone();
        let ok = !self.reject_everything.load(Ordering::SeqCst)
            && token.map(|t| self.accepted_tokens.contains(&t)).unwrap_or(false);
        if ok {
            Ok(())
        } else {
            Err(SyncError::Unauthorized("token rejected".to_string()))
        }
    }

    fn set_page(&self, name: &str, content: Vec<RawMessage>, last: bool) {
        self.pages
            .lock()
            .unwrap()
            .insert(name.to_string(), HistoryPage { content, last });
    }

    async fn page(&self, name: String) -> HistoryPage {
        let delay = self.delays.lock().unwrap().get(&name).copied();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        self.pages
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or(HistoryPage {
                content: Vec::new(),
                last: true,
            })
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    fn set_token(&self, token: Option<String>) {
        *self.token.lock().unwrap() = token;
    }

    async fn login(&self, username: &str, password: &str) -> Result<AuthToken> {
        self.record(format!("login:{}", username));
        if password == "pw" {
            Ok(AuthToken {
                token: "fresh".to_string(),
            })
        } else {
            Err(SyncError::Unauthorized("bad password".to_string()))
        }
    }

    async fn profile(&self) -> Result<UserRef> {
        self.authorize()?;
        Ok(UserRef::new(ME, "alice"))
    }

    async fn conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.record("conversations");
        self.authorize()?;
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn private_history(
        &self,
        _me: UserId,
        other: UserId,
        page: u32,
        _size: u32,
    ) -> Result<HistoryPage> {
        self.authorize()?;
        self.record(format!("history:p{}:{}", other, page));
        Ok(self.page(format!("p{}-{}", other, page)).await)
    }

    async fn group_history(&self, group_id: GroupId, page: u32, _size: u32) -> Result<HistoryPage> {
        self.authorize()?;
        self.record(format!("history:g{}:{}", group_id, page));
        Ok(self.page(format!("g{}-{}", group_id, page)).await)
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<RawMessage> {
        self.authorize()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let sender = Some(RawParty::User(RawUser {
            id: Some(ME),
            username: Some("alice".to_string()),
            profile_picture_url: None,
        }));
        let reply = match message {
            OutgoingMessage::Private { receiver, content } => RawMessage {
                id: Some(id),
                sender,
                receiver: Some(RawParty::Id(receiver.id)),
                content: content.clone(),
                timestamp: Some(serde_json::json!("2024-03-01T11:00:00")),
                status: Some("SENT".to_string()),
                ..Default::default()
            },
            OutgoingMessage::Group { group_id, content } => RawMessage {
                id: Some(id),
                sender,
                group_id: Some(*group_id),
                content: content.clone(),
                timestamp: Some(serde_json::json!("2024-03-01T11:00:00")),
                ..Default::default()
            },
        };
        Ok(reply)
    }

    async fn mark_read(&self, message_id: MessageId) -> Result<()> {
        self.authorize()?;
        self.record(format!("read:{}", message_id));
        Ok(())
    }

    async fn message_info(&self, _message_id: MessageId) -> Result<MessageInfo> {
        self.authorize()?;
        Ok(MessageInfo {
            read_by: vec![UserRef::new(BOB, "bob")],
            delivered_to: Vec::new(),
        })
    }

    async fn online_users(&self) -> Result<Vec<String>> {
        self.record("online_users");
        self.authorize()?;
        Ok(self.online.lock().unwrap().clone())
    }

    async fn last_seen(&self, user_ids: &[UserId]) -> Result<HashMap<UserId, String>> {
        self.authorize()?;
        self.record(format!("last_seen:{:?}", user_ids));
        let known = self.last_seen.lock().unwrap();
        Ok(user_ids
            .iter()
            .map(|id| (*id, known.get(id).cloned().unwrap_or_else(|| "online".to_string())))
            .collect())
    }

    async fn group(&self, group_id: GroupId) -> Result<GroupInfo> {
        self.authorize()?;
        Ok(GroupInfo {
            id: group_id,
            name: format!("group-{}", group_id),
            description: None,
            image_url: Some("g.png".to_string()),
            users: Vec::new(),
        })
    }

    async fn blocked_users(&self) -> Result<Vec<UserRef>> {
        self.authorize()?;
        Ok(self.blocked.lock().unwrap().clone())
    }

    async fn block(&self, user_id: UserId) -> Result<()> {
        self.authorize()?;
        self.record(format!("block:{}", user_id));
        Ok(())
    }

    async fn unblock(&self, user_id: UserId) -> Result<()> {
        self.authorize()?;
        self.record(format!("unblock:{}", user_id));
        Ok(())
    }
}

fn config(password: Option<&str>) -> Config {
    Config {
        username: "alice".to_string(),
        password: password.map(str::to_string),
        ..Config::default()
    }
}

/// Push endpoint that never parses, so sessions fail fast and retry on timers
fn offline_config() -> Config {
    Config {
        ws_url: "not a websocket url".to_string(),
        ..config(Some("pw"))
    }
}

async fn signed_in(api: &Arc<FakeApi>) -> ChatClient {
    let client = ChatClient::new(config(Some("pw")), api.clone(), None);
    client.sign_in().await.unwrap();
    client
}

fn private_summary(id: UserId, name: &str) -> ConversationSummary {
    ConversationSummary {
        id,
        kind: ConversationKind::Private,
        display_name: name.to_string(),
        avatar_url: None,
        last_message: None,
        last_message_timestamp: None,
        last_message_sender_id: None,
        last_message_status: None,
        unread_count: 0,
    }
}

fn push(topic: Topic, body: serde_json::Value) -> Delivery {
    Delivery {
        topic,
        body: body.to_string(),
    }
}

fn private_push(id: MessageId, from: (UserId, &str), to: (UserId, &str), ts: &str) -> Delivery {
    push(
        Topic::PrivateMessages,
        serde_json::json!({
            "id": id,
            "sender": {"id": from.0, "username": from.1},
            "receiver": {"id": to.0, "username": to.1},
            "content": format!("m{}", id),
            "timestamp": ts,
            "status": "DELIVERED"
        }),
    )
}

fn raw_private(id: MessageId, from: UserId, to: UserId, ts: &str, status: &str) -> RawMessage {
    RawMessage {
        id: Some(id),
        sender: Some(RawParty::Id(from)),
        receiver: Some(RawParty::Id(to)),
        content: format!("h{}", id),
        timestamp: Some(serde_json::json!(ts)),
        status: Some(status.to_string()),
        ..Default::default()
    }
}

fn ids(messages: &[chatsync_core::model::Message]) -> Vec<MessageId> {
    messages.iter().map(|m| m.id).collect()
}

/// Accept one push session and answer its CONNECT
async fn serve_session(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = timeout(WAIT, listener.accept())
        .await
        .expect("client never connected")
        .unwrap();
    let mut ws = accept_async(stream).await.unwrap();
    loop {
        match timeout(WAIT, ws.next()).await.expect("client went quiet") {
            Some(Ok(WsMessage::Text(text))) => {
                let frames = StompFrame::decode_all(&text).unwrap();
                if frames.iter().any(|f| f.command == Command::Connect) {
                    break;
                }
            }
            Some(Ok(_)) => continue,
            other => panic!("socket ended early: {:?}", other),
        }
    }
    let connected = StompFrame::new(Command::Connected)
        .with_header("version", "1.2")
        .with_header("heart-beat", "0,0");
    ws.send(WsMessage::Text(connected.encode())).await.unwrap();
    ws
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_sign_in_reuses_stored_token() {
    let dir = TempDir::new().unwrap();
    let store = CredentialStore::new(dir.path()).unwrap();
    store.save("alice", "stored-good").unwrap();

    let api = FakeApi::new();
    let client = ChatClient::new(config(None), api.clone(), Some(store.clone()));
    let me = client.sign_in().await.unwrap();
    assert_eq!(me.id, ME);
    assert!(api.calls().iter().all(|c| !c.starts_with("login")));
}

#[tokio::test]
async fn test_rejected_stored_token_falls_back_to_password() {
    let dir = TempDir::new().unwrap();
    let store = CredentialStore::new(dir.path()).unwrap();
    store.save("alice", "stale").unwrap();

    let api = FakeApi::new();
    let client = ChatClient::new(config(Some("pw")), api.clone(), Some(store.clone()));
    client.sign_in().await.unwrap();
    assert!(api.calls().contains(&"login:alice".to_string()));
    assert_eq!(store.load("alice").unwrap().unwrap().token, "fresh");
}

#[tokio::test]
async fn test_sign_in_without_token_or_password_fails() {
    let api = FakeApi::new();
    let client = ChatClient::new(config(None), api, None);
    assert!(matches!(
        client.sign_in().await,
        Err(SyncError::Unauthorized(_))
    ));
    assert!(client.me().await.is_none());
}

#[tokio::test]
async fn test_pushes_are_deduplicated_and_ordered() {
    let api = FakeApi::new();
    let client = signed_in(&api).await;
    let key = ConversationKey::private(ME, BOB);

    let ts = "2024-03-01T10:00:00";
    client
        .handle_delivery(private_push(2, (BOB, "bob"), (ME, "alice"), ts))
        .await;
    client
        .handle_delivery(private_push(1, (ME, "alice"), (BOB, "bob"), ts))
        .await;
    client
        .handle_delivery(private_push(2, (BOB, "bob"), (ME, "alice"), ts))
        .await;

    assert_eq!(ids(&client.messages(key).await), vec![1, 2]);
    let summary = client.summary(key).await.unwrap();
    assert_eq!(summary.unread_count, 1);
    assert_eq!(summary.display_name, "bob");
}

#[tokio::test]
async fn test_malformed_pushes_are_dropped_quietly() {
    let api = FakeApi::new();
    let client = signed_in(&api).await;
    client
        .handle_delivery(Delivery {
            topic: Topic::PrivateMessages,
            body: "{not json".to_string(),
        })
        .await;
    client
        .handle_delivery(push(Topic::PrivateMessages, serde_json::json!({"content": "no id"})))
        .await;
    assert!(client.conversations().await.is_empty());
}

#[tokio::test]
async fn test_open_private_loads_history_and_marks_delivered_read() {
    let api = FakeApi::new();
    api.set_page(
        "p7-0",
        vec![
            raw_private(12, BOB, ME, "2024-03-01T10:02:00", "DELIVERED"),
            raw_private(11, ME, BOB, "2024-03-01T10:01:00", "DELIVERED"),
            raw_private(10, BOB, ME, "2024-03-01T10:00:00", "READ"),
        ],
        false,
    );
    api.set_page(
        "p7-1",
        vec![raw_private(9, BOB, ME, "2024-03-01T09:00:00", "READ")],
        true,
    );
    let client = signed_in(&api).await;
    let key = ConversationKey::private(ME, BOB);

    client.open_private(UserRef::new(BOB, "bob")).await.unwrap();
    let messages = client.messages(key).await;
    assert_eq!(ids(&messages), vec![10, 11, 12]);
    assert_eq!(messages[2].status, MessageStatus::Read);
    assert_eq!(messages[1].status, MessageStatus::Delivered);
    assert!(api.calls().contains(&"read:12".to_string()));
    assert!(!api.calls().contains(&"read:11".to_string()));
    assert!(api.calls().contains(&"last_seen:[7]".to_string()));
    assert_eq!(client.presence(BOB).await, Presence::Online);

    assert_eq!(client.load_more_history(key).await.unwrap(), 1);
    assert_eq!(ids(&client.messages(key).await), vec![9, 10, 11, 12]);
    assert!(!client.cursor(key).await.has_more);
    assert_eq!(client.load_more_history(key).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reopening_a_chat_reloads_while_older_page_is_pending() {
    let api = FakeApi::new();
    api.set_page(
        "p7-0",
        vec![
            raw_private(12, BOB, ME, "2024-03-01T10:02:00", "READ"),
            raw_private(10, BOB, ME, "2024-03-01T10:00:00", "READ"),
        ],
        false,
    );
    api.set_page(
        "p7-1",
        vec![raw_private(9, BOB, ME, "2024-03-01T09:00:00", "READ")],
        true,
    );
    api.delays
        .lock()
        .unwrap()
        .insert("p7-1".to_string(), Duration::from_millis(200));
    let client = signed_in(&api).await;
    let key = ConversationKey::private(ME, BOB);
    client.open_private(UserRef::new(BOB, "bob")).await.unwrap();

    let older = {
        let client = client.clone();
        tokio::spawn(async move { client.load_more_history(key).await })
    };
    while api.count("history:p7:1") == 0 {
        tokio::task::yield_now().await;
    }

    client.open_group(4).await.unwrap();
    api.set_page(
        "p7-0",
        vec![
            raw_private(13, BOB, ME, "2024-03-01T10:03:00", "READ"),
            raw_private(12, BOB, ME, "2024-03-01T10:02:00", "READ"),
            raw_private(10, BOB, ME, "2024-03-01T10:00:00", "READ"),
        ],
        false,
    );
    client.open_private(UserRef::new(BOB, "bob")).await.unwrap();
    assert_eq!(api.count("history:p7:0"), 2);
    assert_eq!(ids(&client.messages(key).await), vec![10, 12, 13]);

    // the older page lands after the reload and is dropped
    assert_eq!(older.await.unwrap().unwrap(), 0);
    assert_eq!(ids(&client.messages(key).await), vec![10, 12, 13]);
    let cursor = client.cursor(key).await;
    assert!(cursor.has_more);
    assert!(!cursor.loading);

    assert_eq!(client.load_more_history(key).await.unwrap(), 1);
    assert_eq!(ids(&client.messages(key).await), vec![9, 10, 12, 13]);
}

#[tokio::test]
async fn test_group_switch_moves_topics() {
    let api = FakeApi::new();
    let client = signed_in(&api).await;

    client.open_group(4).await.unwrap();
    assert_eq!(
        client.desired_topics().await,
        vec![Topic::Group(4), Topic::GroupTyping(4)]
    );

    client.open_group(5).await.unwrap();
    assert_eq!(
        client.desired_topics().await,
        vec![Topic::Group(5), Topic::GroupTyping(5)]
    );

    client.open_private(UserRef::new(BOB, "bob")).await.unwrap();
    assert!(client.desired_topics().await.is_empty());
}

#[tokio::test]
async fn test_unknown_sender_is_reconciled_by_refresh() {
    let api = FakeApi::new();
    let client = signed_in(&api).await;
    let key = ConversationKey::private(ME, CAROL);

    let bare = push(
        Topic::PrivateMessages,
        serde_json::json!({
            "id": 8,
            "sender": "carol",
            "receiver": "alice",
            "content": "hello",
            "timestamp": "2024-03-01T10:00:00"
        }),
    );
    client.handle_delivery(bare.clone()).await;
    assert!(client.messages(key).await.is_empty());

    api.conversations
        .lock()
        .unwrap()
        .push(private_summary(CAROL, "carol"));
    client.refresh_conversations().await.unwrap();
    assert_eq!(ids(&client.messages(key).await), vec![8]);

    client.handle_delivery(bare).await;
    client
        .handle_delivery(private_push(8, (CAROL, "carol"), (ME, "alice"), "2024-03-01T10:00:00"))
        .await;
    assert_eq!(ids(&client.messages(key).await), vec![8]);
}

#[tokio::test]
async fn test_read_receipts_never_regress() {
    let api = FakeApi::new();
    let client = signed_in(&api).await;
    let key = ConversationKey::private(ME, BOB);
    client
        .handle_delivery(private_push(42, (ME, "alice"), (BOB, "bob"), "2024-03-01T10:00:00"))
        .await;

    client
        .handle_delivery(push(Topic::ReadReceipts, serde_json::json!({"messageId": 42})))
        .await;
    assert_eq!(client.messages(key).await[0].status, MessageStatus::Read);

    client
        .handle_delivery(private_push(42, (ME, "alice"), (BOB, "bob"), "2024-03-01T10:00:00"))
        .await;
    assert_eq!(client.messages(key).await[0].status, MessageStatus::Read);
}

#[tokio::test]
async fn test_roster_edges_trigger_last_seen() {
    let api = FakeApi::new();
    api.conversations
        .lock()
        .unwrap()
        .push(private_summary(BOB, "bob"));
    api.last_seen
        .lock()
        .unwrap()
        .insert(BOB, "2024-03-01T08:00:00".to_string());
    let client = signed_in(&api).await;
    client.refresh_conversations().await.unwrap();

    let join = push(
        Topic::Presence,
        serde_json::json!({"type": "JOIN", "content": "alice,bob", "sender": "bob"}),
    );
    client.handle_delivery(join).await;
    assert_eq!(client.presence(BOB).await, Presence::Online);

    let leave = push(
        Topic::Presence,
        serde_json::json!({"type": "LEAVE", "content": "alice", "sender": "bob"}),
    );
    client.handle_delivery(leave).await;

    let mut settled = false;
    for _ in 0..50 {
        if matches!(client.presence(BOB).await, Presence::LastSeen(_)) {
            settled = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(settled, "last-seen was never applied");
    assert_eq!(api.count("last_seen:[7]"), 1);
}

#[tokio::test]
async fn test_leave_before_roster_update_queries_last_seen() {
    let api = FakeApi::new();
    api.conversations
        .lock()
        .unwrap()
        .push(private_summary(BOB, "bob"));
    api.last_seen
        .lock()
        .unwrap()
        .insert(BOB, "2024-03-01T08:00:00".to_string());
    let client = signed_in(&api).await;
    client.refresh_conversations().await.unwrap();

    let join = push(
        Topic::Presence,
        serde_json::json!({"type": "JOIN", "content": "alice", "sender": "bob"}),
    );
    client.handle_delivery(join).await;
    assert_eq!(client.presence(BOB).await, Presence::Online);

    // the roster still lists bob; the LEAVE itself is the edge
    let leave = push(
        Topic::Presence,
        serde_json::json!({"type": "LEAVE", "content": "alice,bob", "sender": "bob"}),
    );
    client.handle_delivery(leave).await;

    let mut settled = false;
    for _ in 0..50 {
        if matches!(client.presence(BOB).await, Presence::LastSeen(_)) {
            settled = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(settled, "last-seen was never applied");
    assert_eq!(api.count("last_seen:[7]"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_typing_only_for_open_group_and_expires() {
    let api = FakeApi::new();
    let client = signed_in(&api).await;
    client.open_group(4).await.unwrap();

    let typing = |group: GroupId, sender: &str| {
        push(
            Topic::GroupTyping(group),
            serde_json::json!({"sender": sender, "groupId": group, "typing": true}),
        )
    };
    client.handle_delivery(typing(5, "bob")).await;
    client.handle_delivery(typing(4, "alice")).await;
    assert!(client.typing(ConversationKey::Group(5)).await.is_none());
    assert!(client.typing(ConversationKey::Group(4)).await.is_none());

    client.handle_delivery(typing(4, "bob")).await;
    let entry = client.typing(ConversationKey::Group(4)).await.unwrap();
    assert_eq!(entry.display_name, "bob");

    sleep(Duration::from_secs(5)).await;
    assert!(client.typing(ConversationKey::Group(4)).await.is_none());
}

#[tokio::test]
async fn test_send_message_folds_server_reply() {
    let api = FakeApi::new();
    let client = signed_in(&api).await;
    client.open_private(UserRef::new(BOB, "bob")).await.unwrap();
    let key = ConversationKey::private(ME, BOB);

    assert!(client.send_message(key, "   ").await.is_err());

    let sent = client.send_message(key, "hi bob").await.unwrap();
    assert_eq!(sent.conversation_key(), Some(key));
    let messages = client.messages(key).await;
    assert_eq!(ids(&messages), vec![sent.id]);

    let summary = client.summary(key).await.unwrap();
    assert_eq!(summary.last_message.as_deref(), Some("hi bob"));
    assert_eq!(summary.unread_count, 0);

    let info = client.message_info(sent.id).await.unwrap();
    assert_eq!(info.read_by.len(), 1);
}

#[tokio::test]
async fn test_blocked_users_are_filtered() {
    let api = FakeApi::new();
    let client = signed_in(&api).await;
    let key = ConversationKey::private(ME, BOB);

    client.block_user(UserRef::new(BOB, "bob")).await.unwrap();
    assert!(client.is_blocked(BOB).await);
    client
        .handle_delivery(private_push(50, (BOB, "bob"), (ME, "alice"), "2024-03-01T10:00:00"))
        .await;
    assert!(client.messages(key).await.is_empty());
    assert!(client.send_message(key, "hello?").await.is_err());

    client.unblock_user(BOB).await.unwrap();
    client
        .handle_delivery(private_push(51, (BOB, "bob"), (ME, "alice"), "2024-03-01T10:00:00"))
        .await;
    assert_eq!(ids(&client.messages(key).await), vec![51]);
    assert!(api.calls().contains(&"block:7".to_string()));
    assert!(api.calls().contains(&"unblock:7".to_string()));
}

#[tokio::test]
async fn test_auth_rejection_ends_the_session() {
    let dir = TempDir::new().unwrap();
    let store = CredentialStore::new(dir.path()).unwrap();
    let api = FakeApi::new();
    let client = ChatClient::new(config(Some("pw")), api.clone(), Some(store.clone()));
    client.sign_in().await.unwrap();
    assert!(store.load("alice").unwrap().is_some());

    let mut events = client.subscribe();
    api.reject_everything.store(true, Ordering::SeqCst);
    assert!(matches!(
        client.refresh_conversations().await,
        Err(SyncError::Unauthorized(_))
    ));

    assert!(client.me().await.is_none());
    assert!(store.load("alice").unwrap().is_none());
    let mut expired = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ChatEvent::SessionExpired) {
            expired = true;
        }
    }
    assert!(expired);
}

#[tokio::test]
async fn test_push_send_needs_a_live_session() {
    let api = FakeApi::new();
    let client = signed_in(&api).await;
    let key = ConversationKey::private(ME, BOB);

    assert!(!client.send_via_push(key, "over the socket").await.unwrap());
    assert!(client.send_via_push(key, "").await.is_err());
    assert!(client.messages(key).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_logout_stops_conversation_polling() {
    let api = FakeApi::new();
    let client = ChatClient::new(offline_config(), api.clone(), None);
    client.sign_in().await.unwrap();
    client.start().await.unwrap();
    assert_eq!(api.count("conversations"), 1);

    sleep(Duration::from_secs(20)).await;
    assert!(api.count("conversations") >= 3);

    client.logout().await;
    let polled = api.count("conversations");
    sleep(Duration::from_secs(60)).await;
    assert_eq!(api.count("conversations"), polled);
    assert!(client.me().await.is_none());
    assert_eq!(client.connection_state().await, ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_typing_timers() {
    let api = FakeApi::new();
    let client = ChatClient::new(offline_config(), api.clone(), None);
    client.sign_in().await.unwrap();
    client.start().await.unwrap();
    client.open_group(4).await.unwrap();

    client
        .handle_delivery(push(
            Topic::GroupTyping(4),
            serde_json::json!({"sender": "bob", "groupId": 4, "typing": true}),
        ))
        .await;
    assert!(client.typing(ConversationKey::Group(4)).await.is_some());
    client.start_typing(ConversationKey::Group(4)).await;

    let mut events = client.subscribe();
    client.shutdown().await;
    assert!(client.typing(ConversationKey::Group(4)).await.is_none());

    sleep(Duration::from_secs(10)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, ChatEvent::TypingChanged { .. }),
            "typing timer fired after shutdown"
        );
    }
}

#[tokio::test]
async fn test_reconnect_refreshes_conversations_and_roster() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = Config {
        ws_url: format!("ws://127.0.0.1:{}/ws", port),
        reconnect_delay: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(2),
        conversation_poll_interval: Duration::from_secs(3600),
        ..config(Some("pw"))
    };
    let api = FakeApi::new();
    let client = ChatClient::new(config, api.clone(), None);
    client.sign_in().await.unwrap();
    client.start().await.unwrap();

    let first = serve_session(&listener).await;
    let mut connected = false;
    for _ in 0..250 {
        if client.connection_state().await == ConnectionState::Connected {
            connected = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(connected, "first session never came up");
    assert_eq!(api.count("conversations"), 1);
    assert_eq!(api.count("online_users"), 1);

    // a chat started while the socket was down is only visible over REST
    api.conversations
        .lock()
        .unwrap()
        .push(private_summary(BOB, "bob"));
    drop(first);
    let _second = serve_session(&listener).await;

    assert!(
        eventually(|| api.count("conversations") == 2 && api.count("online_users") == 2).await,
        "no catch-up after reconnect"
    );
    let mut listed = false;
    for _ in 0..250 {
        if client.summary(ConversationKey::private(ME, BOB)).await.is_some() {
            listed = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(listed);

    client.shutdown().await;
}
