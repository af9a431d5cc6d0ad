/// Connection manager: one STOMP-over-websocket session per signed-in user,
/// with heartbeats, a fixed-delay reconnect loop and subscription replay
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::transport::registry::{SubscriptionRegistry, Topic, SESSION_TOPICS};
use crate::transport::stomp::{Command, StompFrame, HEARTBEAT};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Destination used to announce ourselves on the presence topic
const ADD_USER_DESTINATION: &str = "/app/chat.addUser";

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Waiting for the next reconnect attempt
    Disconnected,
    /// Websocket / CONNECTED handshake in progress
    Connecting,
    /// CONNECTED received, subscriptions in place
    Connected,
    /// Session torn down by `disconnect`
    Closed,
}

/// A push frame routed to the topic it arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: Topic,
    pub body: String,
}

#[derive(Debug)]
enum SessionCommand {
    Subscribe(Topic),
    Unsubscribe(Topic),
    Publish { destination: String, body: String },
}

/// Handle to the live session
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<ConnectionState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the session reaches `target`, up to `limit`
    pub async fn wait_for(&self, target: ConnectionState, limit: Duration) -> bool {
        let mut rx = self.state.clone();
        timeout(limit, async move {
            loop {
                if *rx.borrow_and_update() == target {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return *rx.borrow() == target;
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    /// Signal shutdown without waiting for the session task
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Owns the single transport session
#[derive(Clone)]
pub struct ConnectionManager {
    config: Config,
    registry: SubscriptionRegistry,
    session: Arc<RwLock<Option<(SessionHandle, JoinHandle<()>)>>>,
}

impl ConnectionManager {
    pub fn new(config: Config, registry: SubscriptionRegistry) -> Self {
        Self {
            config,
            registry,
            session: Arc::new(RwLock::new(None)),
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Start the session. While one is running this returns its handle.
    pub async fn connect(
        &self,
        token: &str,
        username: &str,
        deliveries: mpsc::UnboundedSender<Delivery>,
    ) -> SessionHandle {
        let mut slot = self.session.write().await;
        if let Some((handle, task)) = slot.as_ref() {
            if !task.is_finished() {
                debug!("Session {} already running, reusing it", handle.id);
                return handle.clone();
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = SessionHandle {
            id: Uuid::new_v4(),
            commands: command_tx,
            state: state_rx,
            shutdown: Arc::new(shutdown_tx),
        };

        let session = SessionLoop {
            id: handle.id,
            config: self.config.clone(),
            registry: self.registry.clone(),
            token: token.to_string(),
            username: username.to_string(),
            deliveries,
            commands: command_rx,
            state: state_tx,
            shutdown: shutdown_rx,
        };

        info!("Starting session {} for {}", handle.id, username);
        let task = tokio::spawn(session.run());
        *slot = Some((handle.clone(), task));
        handle
    }

    /// Cancel all subscriptions, forget the replay list and release the session
    pub async fn disconnect(&self) {
        self.registry.clear().await;
        let session = self.session.write().await.take();
        if let Some((handle, task)) = session {
            handle.close();
            match timeout(Duration::from_secs(2), task).await {
                Ok(_) => info!("Session {} closed", handle.id),
                Err(_) => warn!("Session {} did not stop in time", handle.id),
            }
        }
    }

    /// Current session handle, if any
    pub async fn session(&self) -> Option<SessionHandle> {
        self.session.read().await.as_ref().map(|(h, _)| h.clone())
    }

    pub async fn state(&self) -> ConnectionState {
        match self.session().await {
            Some(handle) => handle.state(),
            None => ConnectionState::Closed,
        }
    }

    /// Desire a topic; applied now if connected, otherwise on the next connect
    pub async fn subscribe(&self, topic: Topic) {
        self.registry.register_desired(topic).await;
        if let Some(handle) = self.session().await {
            let _ = handle.commands.send(SessionCommand::Subscribe(topic));
        }
    }

    pub async fn unsubscribe(&self, topic: Topic) {
        self.registry.remove_desired(topic).await;
        if let Some(handle) = self.session().await {
            let _ = handle.commands.send(SessionCommand::Unsubscribe(topic));
        }
    }

    /// Send a JSON body to an application destination. Returns false when
    /// not connected; nothing is queued.
    pub async fn publish(&self, destination: &str, body: String) -> bool {
        match self.session().await {
            Some(handle) if handle.is_connected() => handle
                .commands
                .send(SessionCommand::Publish {
                    destination: destination.to_string(),
                    body,
                })
                .is_ok(),
            _ => false,
        }
    }
}

enum Exit {
    Shutdown,
    Dropped,
}

struct SessionLoop {
    id: Uuid,
    config: Config,
    registry: SubscriptionRegistry,
    token: String,
    username: String,
    deliveries: mpsc::UnboundedSender<Delivery>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
}

impl SessionLoop {
    async fn run(mut self) {
        let mut attempt: u64 = 0;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            attempt += 1;
            self.state.send_replace(ConnectionState::Connecting);

            match self.run_once().await {
                Ok(Exit::Shutdown) => break,
                Ok(Exit::Dropped) => {
                    warn!(
                        "Session {} lost, reconnecting in {:?}",
                        self.id, self.config.reconnect_delay
                    );
                }
                Err(e) => {
                    error!("Session {} attempt {} failed: {}", self.id, attempt, e);
                }
            }

            self.state.send_replace(ConnectionState::Disconnected);
            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = sleep(self.config.reconnect_delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }
        self.state.send_replace(ConnectionState::Closed);
        debug!("Session {} loop finished", self.id);
    }

    /// One websocket connection from handshake to close
    async fn run_once(&mut self) -> Result<Exit> {
        let (ws, _) = timeout(
            self.config.connect_timeout,
            connect_async(self.config.ws_url.as_str()),
        )
        .await
        .map_err(|_| SyncError::Timeout(format!("connect to {}", self.config.ws_url)))??;
        let (mut sink, mut stream) = ws.split();

        let connect = StompFrame::connect(
            host_of(&self.config.ws_url),
            &self.token,
            self.config.heartbeat_outgoing.as_millis() as u64,
            self.config.heartbeat_incoming.as_millis() as u64,
        );
        sink.send(WsMessage::Text(connect.encode())).await?;

        let connected = timeout(self.config.connect_timeout, async {
            while let Some(msg) = stream.next().await {
                let text = match msg? {
                    WsMessage::Text(text) => text,
                    WsMessage::Close(_) => break,
                    _ => continue,
                };
                for frame in StompFrame::decode_all(&text)? {
                    match frame.command {
                        Command::Connected => return Ok(frame),
                        Command::Error => {
                            return Err(SyncError::Protocol(format!(
                                "Broker refused CONNECT: {}",
                                frame.header("message").unwrap_or(&frame.body)
                            )));
                        }
                        other => debug!("Ignoring {} before CONNECTED", other),
                    }
                }
            }
            Err(SyncError::Connection("Closed before CONNECTED".to_string()))
        })
        .await
        .map_err(|_| SyncError::Timeout("waiting for CONNECTED".to_string()))??;

        let (send_every, expect_every) = negotiate_heartbeat(
            self.config.heartbeat_outgoing,
            self.config.heartbeat_incoming,
            connected.heartbeat(),
        );

        // Anything queued while we were down is covered by the replay below
        while let Ok(stale) = self.commands.try_recv() {
            if let SessionCommand::Publish { destination, .. } = stale {
                debug!("Dropping stale publish to {}", destination);
            }
        }

        let mut active: HashMap<Topic, String> = HashMap::new();
        let mut next_sub: u64 = 0;
        let mut replay: Vec<Topic> = SESSION_TOPICS.to_vec();
        replay.extend(self.registry.desired().await);
        for topic in replay {
            if active.contains_key(&topic) {
                continue;
            }
            let sub_id = format!("sub-{}", next_sub);
            next_sub += 1;
            let frame = StompFrame::subscribe(&sub_id, &topic.destination(&self.username));
            sink.send(WsMessage::Text(frame.encode())).await?;
            active.insert(topic, sub_id);
        }

        let join = serde_json::json!({ "sender": self.username, "type": "JOIN", "content": "" });
        let announce = StompFrame::send(ADD_USER_DESTINATION, join.to_string());
        sink.send(WsMessage::Text(announce.encode())).await?;

        self.state.send_replace(ConnectionState::Connected);
        info!(
            "Session {} connected ({} subscriptions)",
            self.id,
            active.len()
        );

        let mut beat = interval(send_every.unwrap_or(Duration::from_secs(3600)));
        beat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watchdog = interval(expect_every.unwrap_or(Duration::from_secs(3600)));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    for sub_id in active.values() {
                        let _ = sink.send(WsMessage::Text(StompFrame::unsubscribe(sub_id).encode())).await;
                    }
                    let receipt = format!("bye-{}", self.id);
                    let _ = sink.send(WsMessage::Text(StompFrame::disconnect(&receipt).encode())).await;
                    let _ = sink.close().await;
                    return Ok(Exit::Shutdown);
                }
                msg = stream.next() => {
                    last_inbound = Instant::now();
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            if !self.route_frames(&text, &active) {
                                return Ok(Exit::Dropped);
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            debug!("Websocket closed by server: {:?}", frame);
                            return Ok(Exit::Dropped);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(Exit::Dropped),
                    }
                }
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        return Ok(Exit::Shutdown);
                    };
                    match cmd {
                        SessionCommand::Subscribe(topic) => {
                            if !active.contains_key(&topic) {
                                let sub_id = format!("sub-{}", next_sub);
                                next_sub += 1;
                                let frame = StompFrame::subscribe(&sub_id, &topic.destination(&self.username));
                                sink.send(WsMessage::Text(frame.encode())).await?;
                                debug!("Subscribed {} as {}", topic, sub_id);
                                active.insert(topic, sub_id);
                            }
                        }
                        SessionCommand::Unsubscribe(topic) => {
                            if let Some(sub_id) = active.remove(&topic) {
                                sink.send(WsMessage::Text(StompFrame::unsubscribe(&sub_id).encode())).await?;
                                debug!("Unsubscribed {}", topic);
                            }
                        }
                        SessionCommand::Publish { destination, body } => {
                            let frame = StompFrame::send(&destination, body);
                            sink.send(WsMessage::Text(frame.encode())).await?;
                        }
                    }
                }
                _ = beat.tick(), if send_every.is_some() => {
                    sink.send(WsMessage::Text(HEARTBEAT.to_string())).await?;
                }
                _ = watchdog.tick(), if expect_every.is_some() => {
                    let limit = expect_every.unwrap_or_default() * 2;
                    if last_inbound.elapsed() > limit {
                        warn!("Session {}: no traffic for {:?}, declaring it dead", self.id, limit);
                        return Ok(Exit::Dropped);
                    }
                }
            }
        }
    }

    /// Forward MESSAGE frames; returns false if the broker sent ERROR
    fn route_frames(&self, text: &str, active: &HashMap<Topic, String>) -> bool {
        let frames = match StompFrame::decode_all(text) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                return true;
            }
        };
        for frame in frames {
            match frame.command {
                Command::Message => {
                    let by_subscription = frame.header("subscription").and_then(|sub| {
                        active
                            .iter()
                            .find(|(_, id)| id.as_str() == sub)
                            .map(|(topic, _)| *topic)
                    });
                    let topic = by_subscription
                        .or_else(|| frame.header("destination").and_then(Topic::from_destination));
                    match topic {
                        Some(topic) => {
                            let delivery = Delivery {
                                topic,
                                body: frame.body,
                            };
                            if self.deliveries.send(delivery).is_err() {
                                debug!("Delivery receiver gone, dropping frame");
                            }
                        }
                        None => debug!(
                            "MESSAGE for unknown destination {:?}",
                            frame.header("destination")
                        ),
                    }
                }
                Command::Error => {
                    error!(
                        "Broker error: {}",
                        frame.header("message").unwrap_or(&frame.body)
                    );
                    return false;
                }
                Command::Receipt => debug!("Receipt {:?}", frame.header("receipt-id")),
                other => debug!("Ignoring {} frame", other),
            }
        }
        true
    }
}

/// Effective (send, expect) heartbeat periods; `None` disables that side
fn negotiate_heartbeat(
    ours_out: Duration,
    ours_in: Duration,
    theirs: Option<(u64, u64)>,
) -> (Option<Duration>, Option<Duration>) {
    let (sx, sy) = theirs.unwrap_or((0, 0));
    let pick = |mine: Duration, theirs: u64| {
        let mine = mine.as_millis() as u64;
        if mine == 0 || theirs == 0 {
            None
        } else {
            Some(Duration::from_millis(mine.max(theirs)))
        }
    };
    (pick(ours_out, sy), pick(ours_in, sx))
}

fn host_of(url: &str) -> &str {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    authority.split(':').next().unwrap_or(authority)
}
