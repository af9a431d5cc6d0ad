/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://localhost:8080/api";
const DEFAULT_WS_URL: &str = "ws://localhost:8084/ws";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Username to sign in as
    pub username: String,

    /// Password, only needed when no stored token exists
    pub password: Option<String>,

    /// Base URL of the REST service (no trailing slash)
    pub api_base_url: String,

    /// STOMP-over-websocket endpoint
    pub ws_url: String,

    /// Directory for the durable token store
    pub data_dir: PathBuf,

    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,

    /// Interval at which we send heartbeats
    pub heartbeat_outgoing: Duration,

    /// Interval at which the server promises heartbeats
    pub heartbeat_incoming: Duration,

    /// Timeout for websocket handshake + CONNECTED
    pub connect_timeout: Duration,

    /// Quiet period after the last keystroke before "typing=false" goes out
    pub typing_debounce: Duration,

    /// How long a remote typing indicator survives without a stop event
    pub typing_safety_timeout: Duration,

    /// Conversation list refresh interval
    pub conversation_poll_interval: Duration,

    /// History page size
    pub page_size: u32,

    /// Per-request REST timeout
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: None,
            api_base_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            data_dir: PathBuf::from(".chatsync"),
            reconnect_delay: Duration::from_secs(5),
            heartbeat_outgoing: Duration::from_secs(4),
            heartbeat_incoming: Duration::from_secs(4),
            connect_timeout: Duration::from_secs(10),
            typing_debounce: Duration::from_secs(3),
            typing_safety_timeout: Duration::from_secs(4),
            conversation_poll_interval: Duration::from_secs(8),
            page_size: 50,
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 || args[1].starts_with("--") {
            return Err(SyncError::Config(format!(
                "Usage: {} <username> [--password <pw>] [--api-url <url>] [--ws-url <url>] [--data-dir <path>]",
                args.first().map(String::as_str).unwrap_or("chatsync")
            )));
        }

        let username = args[1].trim().to_string();
        if username.is_empty() {
            return Err(SyncError::Config("Username must not be empty".to_string()));
        }

        let mut password = None;
        let mut api_base_url: Option<String> = None;
        let mut ws_url: Option<String> = None;
        let mut data_dir: Option<PathBuf> = None;

        let mut i = 2;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = args.get(i + 1).ok_or_else(|| {
                SyncError::Config(format!("{} requires an argument", flag))
            });
            match flag {
                "--password" => password = Some(value?.clone()),
                "--api-url" => api_base_url = Some(parse_url(value?, &["http://", "https://"])?),
                "--ws-url" => ws_url = Some(parse_url(value?, &["ws://", "wss://"])?),
                "--data-dir" => data_dir = Some(PathBuf::from(value?)),
                other => {
                    return Err(SyncError::Config(format!("Unknown argument: {}", other)));
                }
            }
            i += 2;
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("CHATSYNC_API_URL") {
            api_base_url = Some(parse_url(&url, &["http://", "https://"])?);
        }
        if let Ok(url) = std::env::var("CHATSYNC_WS_URL") {
            ws_url = Some(parse_url(&url, &["ws://", "wss://"])?);
        }

        let defaults = Self::default();
        Ok(Self {
            username,
            password,
            api_base_url: api_base_url.unwrap_or(defaults.api_base_url.clone()),
            ws_url: ws_url.unwrap_or(defaults.ws_url.clone()),
            data_dir: data_dir.unwrap_or(defaults.data_dir.clone()),
            ..defaults
        })
    }
}

fn parse_url(raw: &str, schemes: &[&str]) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if schemes.iter().any(|s| trimmed.starts_with(s)) && trimmed.len() > 8 {
        Ok(trimmed.to_string())
    } else {
        Err(SyncError::Config(format!(
            "Invalid URL '{}': expected one of {:?}",
            raw, schemes
        )))
    }
}
