//! Single-byte code tables carried on the wire.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown {kind} code 0x{value:02x}")]
pub struct CodeError {
    pub kind: &'static str,
    pub value: u8,
}

/// Which side of a pairing a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Target,
    Watcher,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Target => "target",
            Side::Watcher => "watcher",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attachable sub-connection of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    ScreenReader,
    Controller,
    Keylogger,
}

impl Component {
    pub const ALL: [Component; 3] = [
        Component::ScreenReader,
        Component::Controller,
        Component::Keylogger,
    ];

    /// Stable slot index used by per-session slot arrays.
    pub fn index(self) -> usize {
        match self {
            Component::ScreenReader => 0,
            Component::Controller => 1,
            Component::Keylogger => 2,
        }
    }

    pub fn start_action(self) -> Action {
        match self {
            Component::ScreenReader => Action::StartScreenReader,
            Component::Controller => Action::StartController,
            Component::Keylogger => Action::StartKeylogger,
        }
    }

    pub fn stop_action(self) -> Action {
        match self {
            Component::ScreenReader => Action::StopScreenReader,
            Component::Controller => Action::StopController,
            Component::Keylogger => Action::StopKeylogger,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Component::ScreenReader => "screen_reader",
            Component::Controller => "controller",
            Component::Keylogger => "keylogger",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role tag sent by a peer as the first frame of every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Role {
    Target = 0x00,
    TargetScreenReader = 0x01,
    TargetController = 0x02,
    TargetKeylogger = 0x03,
    Watcher = 0x10,
    WatcherScreenReader = 0x11,
    WatcherController = 0x12,
    WatcherKeylogger = 0x13,
}

impl Role {
    pub fn side(self) -> Side {
        match self {
            Role::Target
            | Role::TargetScreenReader
            | Role::TargetController
            | Role::TargetKeylogger => Side::Target,
            Role::Watcher
            | Role::WatcherScreenReader
            | Role::WatcherController
            | Role::WatcherKeylogger => Side::Watcher,
        }
    }

    /// `None` for the two primary roles.
    pub fn component(self) -> Option<Component> {
        match self {
            Role::Target | Role::Watcher => None,
            Role::TargetScreenReader | Role::WatcherScreenReader => Some(Component::ScreenReader),
            Role::TargetController | Role::WatcherController => Some(Component::Controller),
            Role::TargetKeylogger | Role::WatcherKeylogger => Some(Component::Keylogger),
        }
    }

    pub fn component_of(side: Side, component: Component) -> Role {
        match (side, component) {
            (Side::Target, Component::ScreenReader) => Role::TargetScreenReader,
            (Side::Target, Component::Controller) => Role::TargetController,
            (Side::Target, Component::Keylogger) => Role::TargetKeylogger,
            (Side::Watcher, Component::ScreenReader) => Role::WatcherScreenReader,
            (Side::Watcher, Component::Controller) => Role::WatcherController,
            (Side::Watcher, Component::Keylogger) => Role::WatcherKeylogger,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Target => "target",
            Role::TargetScreenReader => "target_screen_reader",
            Role::TargetController => "target_controller",
            Role::TargetKeylogger => "target_keylogger",
            Role::Watcher => "watcher",
            Role::WatcherScreenReader => "watcher_screen_reader",
            Role::WatcherController => "watcher_controller",
            Role::WatcherKeylogger => "watcher_keylogger",
        }
    }
}

impl TryFrom<u8> for Role {
    type Error = CodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Role::Target,
            0x01 => Role::TargetScreenReader,
            0x02 => Role::TargetController,
            0x03 => Role::TargetKeylogger,
            0x10 => Role::Watcher,
            0x11 => Role::WatcherScreenReader,
            0x12 => Role::WatcherController,
            0x13 => Role::WatcherKeylogger,
            _ => return Err(CodeError { kind: "role", value }),
        })
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reason {
    AlreadyConnected = 0x00,
    MainNotConnected = 0x01,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::AlreadyConnected => "already_connected",
            Reason::MainNotConnected => "main_not_connected",
        }
    }
}

impl TryFrom<u8> for Reason {
    type Error = CodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Reason::AlreadyConnected),
            0x01 => Ok(Reason::MainNotConnected),
            _ => Err(CodeError {
                kind: "reason",
                value,
            }),
        }
    }
}

/// Requests and commands exchanged over primary connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    Disconnect = 0x00,
    SendTargetList = 0x01,
    Wait = 0x02,
    RestartTarget = 0x03,
    StopWatching = 0x04,
    SendConnectedComponents = 0x05,
    StartAllComponents = 0x10,
    StartScreenReader = 0x11,
    StartController = 0x12,
    StartKeylogger = 0x13,
    StopAllComponents = 0x20,
    StopScreenReader = 0x21,
    StopController = 0x22,
    StopKeylogger = 0x23,
}

impl Action {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Actions travel as single-byte frames.
    pub fn from_frame(payload: &[u8]) -> Result<Self, CodeError> {
        match payload {
            [byte] => Action::try_from(*byte),
            // 0xff is never a valid action, so it stands in for "wrong width"
            _ => Err(CodeError {
                kind: "action",
                value: payload.first().copied().unwrap_or(0xff),
            }),
        }
    }
}

impl TryFrom<u8> for Action {
    type Error = CodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Action::Disconnect,
            0x01 => Action::SendTargetList,
            0x02 => Action::Wait,
            0x03 => Action::RestartTarget,
            0x04 => Action::StopWatching,
            0x05 => Action::SendConnectedComponents,
            0x10 => Action::StartAllComponents,
            0x11 => Action::StartScreenReader,
            0x12 => Action::StartController,
            0x13 => Action::StartKeylogger,
            0x20 => Action::StopAllComponents,
            0x21 => Action::StopScreenReader,
            0x22 => Action::StopController,
            0x23 => Action::StopKeylogger,
            _ => return Err(CodeError { kind: "action", value }),
        })
    }
}

/// Input device a control event is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlDevice {
    Mouse = 0x00,
    Keyboard = 0x01,
}

impl TryFrom<u8> for ControlDevice {
    type Error = CodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ControlDevice::Mouse),
            0x01 => Ok(ControlDevice::Keyboard),
            _ => Err(CodeError {
                kind: "control device",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceEvent {
    MouseUp = 0x00,
    MouseDown = 0x01,
    MouseMove = 0x02,
    KeyUp = 0x10,
    KeyDown = 0x11,
}

impl DeviceEvent {
    pub fn is_mouse(self) -> bool {
        matches!(
            self,
            DeviceEvent::MouseUp | DeviceEvent::MouseDown | DeviceEvent::MouseMove
        )
    }

    pub fn is_key(self) -> bool {
        matches!(self, DeviceEvent::KeyUp | DeviceEvent::KeyDown)
    }
}

impl TryFrom<u8> for DeviceEvent {
    type Error = CodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => DeviceEvent::MouseUp,
            0x01 => DeviceEvent::MouseDown,
            0x02 => DeviceEvent::MouseMove,
            0x10 => DeviceEvent::KeyUp,
            0x11 => DeviceEvent::KeyDown,
            _ => {
                return Err(CodeError {
                    kind: "device event",
                    value,
                })
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MouseButton {
    Left = 0,
    Right = 1,
    Middle = 2,
    ScrollUp = 3,
    ScrollDown = 4,
    ScrollLeft = 5,
    ScrollRight = 6,
}

impl TryFrom<u8> for MouseButton {
    type Error = CodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MouseButton::Left,
            1 => MouseButton::Right,
            2 => MouseButton::Middle,
            3 => MouseButton::ScrollUp,
            4 => MouseButton::ScrollDown,
            5 => MouseButton::ScrollLeft,
            6 => MouseButton::ScrollRight,
            _ => {
                return Err(CodeError {
                    kind: "mouse button",
                    value,
                })
            }
        })
    }
}
