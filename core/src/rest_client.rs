/// REST service seam: the `ChatApi` trait and its reqwest implementation
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::model::{ConversationSummary, GroupId, MessageId, UserId, UserRef};
use crate::normalizer::RawMessage;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
}

/// One page of history, newest first; `last` marks the oldest page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub content: Vec<RawMessage>,
    #[serde(default = "default_last")]
    pub last: bool,
}

fn default_last() -> bool {
    true
}

/// Body of `POST /chat/messages`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutgoingMessage {
    Private {
        receiver: ReceiverRef,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    Group { group_id: GroupId, content: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverRef {
    pub id: UserId,
}

impl OutgoingMessage {
    pub fn private(receiver: UserId, content: impl Into<String>) -> Self {
        OutgoingMessage::Private {
            receiver: ReceiverRef { id: receiver },
            content: content.into(),
        }
    }

    pub fn group(group_id: GroupId, content: impl Into<String>) -> Self {
        OutgoingMessage::Group {
            group_id,
            content: content.into(),
        }
    }
}

/// Delivery / read details of one message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInfo {
    #[serde(default)]
    pub read_by: Vec<UserRef>,
    #[serde(default)]
    pub delivered_to: Vec<UserRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub id: GroupId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub users: Vec<UserRef>,
}

#[derive(Deserialize)]
struct StatusReply {
    #[serde(default)]
    status: HashMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockEntry {
    blocked_user: UserRef,
}

#[derive(Deserialize)]
struct BlockPage {
    #[serde(default)]
    content: Vec<BlockEntry>,
}

/// Everything the client asks of the REST service
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Bearer token for subsequent calls; `None` signs out
    fn set_token(&self, token: Option<String>);

    async fn login(&self, username: &str, password: &str) -> Result<AuthToken>;

    async fn profile(&self) -> Result<UserRef>;

    async fn conversations(&self) -> Result<Vec<ConversationSummary>>;

    async fn private_history(
        &self,
        me: UserId,
        other: UserId,
        page: u32,
        size: u32,
    ) -> Result<HistoryPage>;

    async fn group_history(&self, group_id: GroupId, page: u32, size: u32) -> Result<HistoryPage>;

    async fn send_message(&self, message: &OutgoingMessage) -> Result<RawMessage>;

    async fn mark_read(&self, message_id: MessageId) -> Result<()>;

    async fn message_info(&self, message_id: MessageId) -> Result<MessageInfo>;

    /// Usernames currently connected
    async fn online_users(&self) -> Result<Vec<String>>;

    /// `"online"` or a last-seen timestamp per user
    async fn last_seen(&self, user_ids: &[UserId]) -> Result<HashMap<UserId, String>>;

    async fn group(&self, group_id: GroupId) -> Result<GroupInfo>;

    async fn blocked_users(&self) -> Result<Vec<UserRef>>;

    async fn block(&self, user_id: UserId) -> Result<()>;

    async fn unblock(&self, user_id: UserId) -> Result<()>;
}

/// `ChatApi` over HTTP + JSON
pub struct HttpChatApi {
    client: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpChatApi {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Http(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.api_base_url.clone(),
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn token(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<Response> {
        let response = self.authed(builder).send().await?;
        check_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!("GET {}", path);
        let response = self.execute(self.client.get(self.url(path))).await?;
        Ok(response.json::<T>().await?)
    }
}

/// Map non-success statuses onto the error taxonomy
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    warn!("{} {} failed: {}", status.as_u16(), url, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::Unauthorized(format!(
            "{} rejected with {}",
            url, status
        ))),
        _ => Err(SyncError::Api {
            status: status.as_u16(),
            message: if body.is_empty() { url } else { body },
        }),
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    fn set_token(&self, token: Option<String>) {
        match self.token.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    async fn login(&self, username: &str, password: &str) -> Result<AuthToken> {
        let body = serde_json::json!({ "username": username, "password": password });
        let response = self
            .client
            .post(self.url("/auth/login"))
            .json(&body)
            .send()
            .await?;
        Ok(check_status(response).await?.json::<AuthToken>().await?)
    }

    async fn profile(&self) -> Result<UserRef> {
        self.get_json("/auth/profile").await
    }

    async fn conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.get_json("/chat/conversations").await
    }

    async fn private_history(
        &self,
        me: UserId,
        other: UserId,
        page: u32,
        size: u32,
    ) -> Result<HistoryPage> {
        self.get_json(&format!(
            "/chat/messages/{}/{}?page={}&size={}",
            me, other, page, size
        ))
        .await
    }

    async fn group_history(&self, group_id: GroupId, page: u32, size: u32) -> Result<HistoryPage> {
        self.get_json(&format!(
            "/chat/messages/{}?page={}&size={}",
            group_id, page, size
        ))
        .await
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<RawMessage> {
        let response = self
            .execute(self.client.post(self.url("/chat/messages")).json(message))
            .await?;
        Ok(response.json::<RawMessage>().await?)
    }

    async fn mark_read(&self, message_id: MessageId) -> Result<()> {
        self.execute(
            self.client
                .post(self.url(&format!("/chat/messages/{}/read", message_id))),
        )
        .await?;
        Ok(())
    }

    async fn message_info(&self, message_id: MessageId) -> Result<MessageInfo> {
        self.get_json(&format!("/chat/messages/{}/info", message_id))
            .await
    }

    async fn online_users(&self) -> Result<Vec<String>> {
        self.get_json("/chat/users/online").await
    }

    async fn last_seen(&self, user_ids: &[UserId]) -> Result<HashMap<UserId, String>> {
        let body = serde_json::json!({ "userIds": user_ids });
        let response = self
            .execute(self.client.post(self.url("/users/status")).json(&body))
            .await?;
        let reply = response.json::<StatusReply>().await?;
        Ok(reply
            .status
            .into_iter()
            .filter_map(|(id, value)| id.parse::<UserId>().ok().map(|id| (id, value)))
            .collect())
    }

    async fn group(&self, group_id: GroupId) -> Result<GroupInfo> {
        self.get_json(&format!("/groups/{}", group_id)).await
    }

    async fn blocked_users(&self) -> Result<Vec<UserRef>> {
        let page: BlockPage = self.get_json("/blocks?page=0&size=100").await?;
        Ok(page.content.into_iter().map(|b| b.blocked_user).collect())
    }

    async fn block(&self, user_id: UserId) -> Result<()> {
        self.execute(self.client.post(self.url(&format!("/blocks/{}", user_id))))
            .await?;
        Ok(())
    }

    async fn unblock(&self, user_id: UserId) -> Result<()> {
        self.execute(
            self.client
                .delete(self.url(&format!("/blocks/{}", user_id))),
        )
        .await?;
        Ok(())
    }
}
