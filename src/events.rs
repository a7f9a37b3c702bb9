//! Progress event hub.
//!
//! Keeps the most recent [`ProcessEvent`] per token and fans every new event
//! out to the subscribers of that token. Each subscriber owns an unbounded
//! queue, so [`EventHub::send`] never waits on a consumer and one stalled
//! reader can not hold up the pipeline or other readers.
//!
//! ```text
//!   pipeline ──send──▶ EventHub ──▶ [queue] ──▶ SSE stream
//!                        │     └──▶ [queue] ──▶ CLI reporter
//!                        └── last event (polling, late subscribers)
//! ```
//!
//! The hub has its own mutex, independent of the key registry's.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// One progress notification for an ingestion session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessEvent {
    pub token: String,
    pub step: String,
    pub done: bool,
    pub error: bool,
}

impl ProcessEvent {
    pub fn step(token: &str, step: &str) -> Self {
        Self {
            token: token.to_string(),
            step: step.to_string(),
            done: false,
            error: false,
        }
    }

    pub fn finished(token: &str, step: &str, error: bool) -> Self {
        Self {
            token: token.to_string(),
            step: step.to_string(),
            done: true,
            error,
        }
    }
}

/// Identifies one subscription, for [`EventHub::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving half of a subscription.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: UnboundedReceiver<ProcessEvent>,
}

#[derive(Default)]
struct Channel {
    last: Option<ProcessEvent>,
    subscribers: Vec<(SubscriptionId, UnboundedSender<ProcessEvent>)>,
}

#[derive(Default)]
struct HubState {
    channels: HashMap<String, Channel>,
    next_id: u64,
}

#[derive(Default)]
pub struct EventHub {
    state: Mutex<HubState>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start tracking a token. Events for tokens that were never opened, or
    /// that were closed, are dropped.
    pub fn open(&self, token: &str) {
        self.lock()
            .channels
            .entry(token.to_string())
            .or_default();
    }

    /// Record `event` as the token's last event and deliver it to every
    /// current subscriber. Subscribers whose receiver is gone are pruned.
    pub fn send(&self, event: ProcessEvent) {
        let mut state = self.lock();
        let Some(channel) = state.channels.get_mut(&event.token) else {
            return;
        };
        channel
            .subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        channel.last = Some(event);
    }

    /// Last event seen for a token.
    pub fn last_event(&self, token: &str) -> Option<ProcessEvent> {
        self.lock()
            .channels
            .get(token)
            .and_then(|c| c.last.clone())
    }

    /// Returns the last event and, unless that event is already terminal, a
    /// new subscription. Unknown tokens yield `(None, None)`.
    pub fn subscribe(&self, token: &str) -> (Option<ProcessEvent>, Option<Subscription>) {
        let mut state = self.lock();
        let id = SubscriptionId(state.next_id);
        let Some(channel) = state.channels.get_mut(token) else {
            return (None, None);
        };
        let last = channel.last.clone();
        if last.as_ref().is_some_and(|e| e.done) {
            return (last, None);
        }
        let (tx, rx) = unbounded_channel();
        channel.subscribers.push((id, tx));
        state.next_id += 1;
        (last, Some(Subscription { id, events: rx }))
    }

    /// Remove one subscription. Its receiver sees the end of the stream.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.lock();
        for channel in state.channels.values_mut() {
            channel.subscribers.retain(|(sid, _)| *sid != id);
        }
    }

    /// Remove every subscription of a token.
    pub fn unsubscribe_all(&self, token: &str) {
        if let Some(channel) = self.lock().channels.get_mut(token) {
            channel.subscribers.clear();
        }
    }

    /// Forget a token. Remaining subscribers get `final_event` (when the
    /// session never produced a terminal event of its own) and then their
    /// queues close.
    pub fn close(&self, token: &str, final_event: ProcessEvent) {
        let Some(channel) = self.lock().channels.remove(token) else {
            return;
        };
        let already_done = channel.last.as_ref().is_some_and(|e| e.done);
        if !already_done {
            for (_, tx) in &channel.subscribers {
                let _ = tx.send(final_event.clone());
            }
        }
    }

    pub fn subscriber_count(&self, token: &str) -> usize {
        self.lock()
            .channels
            .get(token)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }
}
