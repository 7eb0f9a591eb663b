//! Wire primitives shared by the Spyglass rendezvous server and its peers.
//!
//! Both the server and the peer-side helpers consume this crate so the
//! framing rules, code tables and record layouts have a single source of
//! truth. Nothing in here performs I/O policy; it only knows how bytes look.

pub mod codes;
pub mod frame;
pub mod records;
pub mod reply;

pub use codes::{Action, CodeError, Component, ControlDevice, DeviceEvent, MouseButton, Reason, Role, Side};
pub use frame::{FrameCodec, FrameError, FrameReader, FrameWriter, FramedChannel};
pub use records::{ComponentPresence, ControlEvent, KeyBatch, KeyEvent, RecordError, TargetList};
pub use reply::{Reply, ReplyError};

/// Access code shared between a target and the watchers allowed to reach it.
///
/// Codes are chosen by the connecting peer and are only ever compared, never
/// interpreted, so a thin wrapper over `String` is enough.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccessCode(String);

impl AccessCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a code from a received frame. Empty payloads and invalid UTF-8
    /// are rejected.
    pub fn from_frame(payload: &[u8]) -> Option<Self> {
        if payload.is_empty() {
            return None;
        }
        std::str::from_utf8(payload)
            .ok()
            .map(|code| AccessCode(code.to_owned()))
    }
}

impl From<&str> for AccessCode {
    fn from(value: &str) -> Self {
        AccessCode(value.to_owned())
    }
}

impl From<String> for AccessCode {
    fn from(value: String) -> Self {
        AccessCode(value)
    }
}

impl AsRef<[u8]> for AccessCode {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for AccessCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
