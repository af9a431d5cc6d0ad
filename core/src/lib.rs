/// ChatSync - realtime sync core for a chat client
///
/// Keeps a local picture of conversations, presence and typing state in
/// step with a chat service: REST for history and actions, STOMP over
/// websocket for live pushes, with reconnect and subscription replay.

pub mod block_list;
pub mod client;
pub mod config;
pub mod conversation_store;
pub mod credential_store;
pub mod error;
pub mod model;
pub mod normalizer;
pub mod presence_tracker;
pub mod rest_client;
pub mod transport;
pub mod typing_tracker;
pub mod utils;

pub use client::ChatClient;
pub use config::Config;
pub use error::{Result, SyncError};
pub use rest_client::{ChatApi, HttpChatApi};
pub use utils::{ChatEvent, EventEmitter};
