//! Process-wide map of live sessions keyed by access code.
//!
//! Entries are only ever inserted through the vacant-entry path, so two
//! primaries racing for one code cannot both win. Removal is conditional on
//! the registration generation, which makes teardown safe to repeat.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use spyglass_core::{AccessCode, ComponentPresence, Reason, Side};
use tokio_util::sync::CancellationToken;

use crate::metrics;
use crate::session::{PrimaryWriter, TargetSession, WatcherSession};

/// A refused target registration. The writer comes back so the caller can
/// still deliver the rejection.
pub struct Rejected {
    pub reason: Reason,
    pub writer: PrimaryWriter,
}

#[derive(Default)]
pub struct Registry {
    targets: DashMap<AccessCode, Arc<TargetSession>>,
    watchers: DashMap<AccessCode, Arc<WatcherSession>>,
    generation: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register_target(
        &self,
        code: AccessCode,
        identity: Bytes,
        writer: PrimaryWriter,
        shutdown: &CancellationToken,
    ) -> Result<Arc<TargetSession>, Rejected> {
        match self.targets.entry(code) {
            Entry::Occupied(_) => Err(Rejected {
                reason: Reason::AlreadyConnected,
                writer,
            }),
            Entry::Vacant(slot) => {
                let session = Arc::new(TargetSession::new(
                    slot.key().clone(),
                    self.next_generation(),
                    identity,
                    writer,
                    shutdown,
                ));
                slot.insert(session.clone());
                metrics::LIVE_SESSIONS
                    .with_label_values(&[Side::Target.as_str()])
                    .inc();
                Ok(session)
            }
        }
    }

    pub fn register_watcher(
        &self,
        code: AccessCode,
        shutdown: &CancellationToken,
    ) -> Result<Arc<WatcherSession>, Reason> {
        match self.watchers.entry(code) {
            Entry::Occupied(_) => Err(Reason::AlreadyConnected),
            Entry::Vacant(slot) => {
                let session = Arc::new(WatcherSession::new(
                    slot.key().clone(),
                    self.next_generation(),
                    shutdown,
                ));
                slot.insert(session.clone());
                metrics::LIVE_SESSIONS
                    .with_label_values(&[Side::Watcher.as_str()])
                    .inc();
                Ok(session)
            }
        }
    }

    /// The target registered under `code`, if its primary is still up.
    pub fn live_target(&self, code: &AccessCode) -> Option<Arc<TargetSession>> {
        self.targets
            .get(code)
            .map(|entry| entry.value().clone())
            .filter(|session| session.primary_alive())
    }

    pub fn live_watcher(&self, code: &AccessCode) -> Option<Arc<WatcherSession>> {
        self.watchers
            .get(code)
            .map(|entry| entry.value().clone())
            .filter(|session| session.primary_alive())
    }

    /// Removes exactly the given registration. Returns false if it was
    /// already gone or the code has since been re-registered.
    pub fn remove_target(&self, session: &TargetSession) -> bool {
        let removed = self
            .targets
            .remove_if(session.code(), |_, current| {
                current.generation() == session.generation()
            })
            .is_some();
        if removed {
            metrics::LIVE_SESSIONS
                .with_label_values(&[Side::Target.as_str()])
                .dec();
        }
        removed
    }

    pub fn remove_watcher(&self, session: &WatcherSession) -> bool {
        let removed = self
            .watchers
            .remove_if(session.code(), |_, current| {
                current.generation() == session.generation()
            })
            .is_some();
        if removed {
            metrics::LIVE_SESSIONS
                .with_label_values(&[Side::Watcher.as_str()])
                .dec();
        }
        removed
    }

    /// Codes of targets whose primary is live, sorted.
    pub fn target_codes(&self) -> Vec<AccessCode> {
        let mut codes: Vec<AccessCode> = self
            .targets
            .iter()
            .filter(|entry| entry.value().primary_alive())
            .map(|entry| entry.key().clone())
            .collect();
        codes.sort();
        codes
    }

    pub fn presence(&self, code: &AccessCode) -> ComponentPresence {
        self.targets
            .get(code)
            .map(|entry| entry.value().presence())
            .unwrap_or_default()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}
