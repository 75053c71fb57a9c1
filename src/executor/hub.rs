use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::models::Event;

/// Fan-out of container events to independent subscribers.
///
/// Each subscriber owns a bounded queue. Publishing never waits: a subscriber
/// that cannot keep up is disconnected, so every stream a subscriber sees is
/// an unbroken prefix of what was published after it subscribed.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Mutex<HubState>>,
}

struct HubState {
    buffer_size: usize,
    next_id: u64,
    closed: bool,
    subscribers: Vec<(u64, mpsc::Sender<Event>)>,
}

impl EventHub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubState {
                buffer_size: buffer_size.max(1),
                next_id: 0,
                closed: false,
                subscribers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> EventSubscription {
        let mut state = self.lock();
        let (tx, rx) = mpsc::channel(state.buffer_size);
        let id = state.next_id;
        state.next_id += 1;

        // A closed hub hands out streams that are already finished
        if !state.closed {
            state.subscribers.push((id, tx));
        }

        EventSubscription {
            id,
            receiver: rx,
            hub: self.clone(),
        }
    }

    pub fn publish(&self, event: Event) {
        let mut state = self.lock();
        if state.closed {
            return;
        }

        state.subscribers.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = id, "Event subscriber fell behind, disconnecting");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Ends every open subscription. Later subscriptions end immediately.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        let dropped = state.subscribers.len();
        state.subscribers.clear();
        debug!("Closed event hub with {} subscribers", dropped);
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().subscribers.retain(|(sid, _)| *sid != id);
    }
}

pub struct EventSubscription {
    id: u64,
    receiver: mpsc::Receiver<Event>,
    hub: EventHub,
}

impl EventSubscription {
    /// Next event, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub fn close(&mut self) {
        self.hub.unsubscribe(self.id);
        self.receiver.close();
    }
}

impl Stream for EventSubscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}
