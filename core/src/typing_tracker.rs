/// Typing indicators: outbound debounce for our own keystrokes and a safety
/// expiry for remote indicators whose stop event never arrives
use crate::model::{ConversationKey, TypingEntry};
use crate::utils::{ChatEvent, Debouncer, EventEmitter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Outbound typing notification for the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingSignal {
    pub key: ConversationKey,
    pub typing: bool,
}

#[derive(Default)]
struct TypingState {
    entries: HashMap<ConversationKey, TypingEntry>,
    /// Bumped on every remote signal so a stale expiry never clears a newer entry
    generations: HashMap<ConversationKey, u64>,
    remote_timers: HashMap<ConversationKey, Debouncer>,
    local_timers: HashMap<ConversationKey, Debouncer>,
}

#[derive(Clone)]
pub struct TypingTracker {
    state: Arc<RwLock<TypingState>>,
    outbound: mpsc::UnboundedSender<TypingSignal>,
    events: EventEmitter,
    local_debounce: Duration,
    safety_timeout: Duration,
}

impl TypingTracker {
    pub fn new(
        local_debounce: Duration,
        safety_timeout: Duration,
        outbound: mpsc::UnboundedSender<TypingSignal>,
        events: EventEmitter,
    ) -> Self {
        Self {
            state: Arc::new(RwLock::new(TypingState::default())),
            outbound,
            events,
            local_debounce,
            safety_timeout,
        }
    }

    /// A keystroke: announce typing now, announce the stop after a pause
    pub async fn local_start_typing(&self, key: ConversationKey) {
        let _ = self.outbound.send(TypingSignal { key, typing: true });

        let outbound = self.outbound.clone();
        let mut state = self.state.write().await;
        let timer = state
            .local_timers
            .entry(key)
            .or_insert_with(|| Debouncer::new(self.local_debounce));
        timer.arm(async move {
            let _ = outbound.send(TypingSignal { key, typing: false });
        });
    }

    /// Stop right away (message sent, conversation left)
    pub async fn local_stop_typing(&self, key: ConversationKey) {
        let mut state = self.state.write().await;
        let was_typing = state
            .local_timers
            .remove(&key)
            .map(|mut timer| timer.cancel())
            .unwrap_or(false);
        if was_typing {
            let _ = self.outbound.send(TypingSignal { key, typing: false });
        }
    }

    /// Apply a remote typing event
    pub async fn remote_typing(&self, key: ConversationKey, display_name: &str, typing: bool) {
        let mut state = self.state.write().await;
        let generation = {
            let counter = state.generations.entry(key).or_insert(0);
            *counter += 1;
            *counter
        };

        if !typing {
            if let Some(mut timer) = state.remote_timers.remove(&key) {
                timer.cancel();
            }
            if state.entries.remove(&key).is_some() {
                self.events.emit(ChatEvent::TypingChanged { key, entry: None });
            }
            return;
        }

        let entry = TypingEntry {
            display_name: display_name.to_string(),
            typing: true,
        };
        let changed = state.entries.insert(key, entry.clone()).as_ref() != Some(&entry);
        if changed {
            self.events.emit(ChatEvent::TypingChanged {
                key,
                entry: Some(entry),
            });
        }

        let shared = self.state.clone();
        let events = self.events.clone();
        let timer = state
            .remote_timers
            .entry(key)
            .or_insert_with(|| Debouncer::new(self.safety_timeout));
        timer.arm(async move {
            let mut state = shared.write().await;
            if state.generations.get(&key) != Some(&generation) {
                return;
            }
            if state.entries.remove(&key).is_some() {
                debug!("Typing indicator for {} expired", key);
                events.emit(ChatEvent::TypingChanged { key, entry: None });
            }
        });
    }

    pub async fn entry(&self, key: ConversationKey) -> Option<TypingEntry> {
        self.state.read().await.entries.get(&key).cloned()
    }

    /// Drop every indicator and cancel every timer
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.generations.clear();
        state.remote_timers.clear();
        state.local_timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn tracker() -> (TypingTracker, mpsc::UnboundedReceiver<TypingSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = TypingTracker::new(
            Duration::from_secs(3),
            Duration::from_secs(4),
            tx,
            EventEmitter::default(),
        );
        (tracker, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_entry_expires_without_stop() {
        let (tracker, _rx) = tracker();
        let key = ConversationKey::private(3, 7);
        tracker.remote_typing(key, "bob", true).await;
        assert!(tracker.entry(key).await.is_some());

        sleep(Duration::from_secs(3)).await;
        assert!(tracker.entry(key).await.is_some());

        sleep(Duration::from_millis(1500)).await;
        assert!(tracker.entry(key).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_refresh_extends_and_stop_clears() {
        let (tracker, _rx) = tracker();
        let key = ConversationKey::Group(4);
        let mut events = tracker.events.subscribe();

        tracker.remote_typing(key, "bob", true).await;
        sleep(Duration::from_secs(3)).await;
        tracker.remote_typing(key, "bob", true).await;
        sleep(Duration::from_secs(3)).await;
        assert!(tracker.entry(key).await.is_some());

        tracker.remote_typing(key, "bob", false).await;
        assert!(tracker.entry(key).await.is_none());

        assert!(matches!(
            events.recv().await.unwrap(),
            ChatEvent::TypingChanged { entry: Some(_), .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ChatEvent::TypingChanged { entry: None, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_keystrokes_debounce_stop() {
        let (tracker, mut rx) = tracker();
        let key = ConversationKey::private(3, 7);

        for _ in 0..3 {
            tracker.local_start_typing(key).await;
            sleep(Duration::from_secs(1)).await;
        }
        for _ in 0..3 {
            assert_eq!(rx.try_recv().unwrap(), TypingSignal { key, typing: true });
        }
        assert!(rx.try_recv().is_err());

        sleep(Duration::from_secs(3)).await;
        assert_eq!(rx.try_recv().unwrap(), TypingSignal { key, typing: false });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_stop_is_immediate_and_single() {
        let (tracker, mut rx) = tracker();
        let key = ConversationKey::private(3, 7);
        tracker.local_start_typing(key).await;
        tracker.local_stop_typing(key).await;
        tracker.local_stop_typing(key).await;

        assert!(rx.try_recv().unwrap().typing);
        assert!(!rx.try_recv().unwrap().typing);
        sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }
}
