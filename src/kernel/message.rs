//! Messages exchanged between services.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Handle;

/// Largest payload a single message may carry (24-bit size field).
pub const MESSAGE_SIZE_MAX: usize = 0x00ff_ffff;

/// Small integer tag describing how a payload should be interpreted.
///
/// Tags fit in 8 bits; the harbor wire format carries them in the high byte
/// of the destination handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(pub u8);

impl MessageType {
    pub const TEXT: MessageType = MessageType(0);
    /// Replies and timer firings.
    pub const RESPONSE: MessageType = MessageType(1);
    pub const MULTICAST: MessageType = MessageType(2);
    pub const CLIENT: MessageType = MessageType(3);
    /// Kernel notifications (exit watcher).
    pub const SYSTEM: MessageType = MessageType(4);
    pub const HARBOR: MessageType = MessageType(5);
    /// Reserved for the socket I/O driver.
    pub const SOCKET: MessageType = MessageType(6);
    /// Sent back to a requester whose message could not be delivered.
    pub const ERROR: MessageType = MessageType(7);
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MessageType::TEXT => write!(f, "text"),
            MessageType::RESPONSE => write!(f, "response"),
            MessageType::MULTICAST => write!(f, "multicast"),
            MessageType::CLIENT => write!(f, "client"),
            MessageType::SYSTEM => write!(f, "system"),
            MessageType::HARBOR => write!(f, "harbor"),
            MessageType::SOCKET => write!(f, "socket"),
            MessageType::ERROR => write!(f, "error"),
            MessageType(other) => write!(f, "type({})", other),
        }
    }
}

/// Flags accepted by [`crate::kernel::Kernel::send`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags {
    /// Transfer the payload buffer as-is instead of copying it first.
    pub dont_copy: bool,
    /// Replace the supplied session with a freshly allocated one.
    pub alloc_session: bool,
}

impl SendFlags {
    pub const NONE: SendFlags = SendFlags {
        dont_copy: false,
        alloc_session: false,
    };
    pub const DONT_COPY: SendFlags = SendFlags {
        dont_copy: true,
        alloc_session: false,
    };
}

/// One queued message.
///
/// Exactly one of these happens to every message that enters a mailbox:
/// the callback consumes it, the callback retains its payload, the service
/// forwards it, or the kernel drops it.
#[derive(Debug)]
pub struct Message {
    pub source: Handle,
    pub session: i32,
    pub kind: MessageType,
    payload: Bytes,
    retained: bool,
}

impl Message {
    pub fn new(source: Handle, session: i32, kind: MessageType, payload: Bytes) -> Self {
        Self {
            source,
            session,
            kind,
            payload,
            retained: false,
        }
    }

    /// Zero-payload message, used for timer firings and error replies.
    pub fn empty(source: Handle, session: i32, kind: MessageType) -> Self {
        Self::new(source, session, kind, Bytes::new())
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Take ownership of the payload; the kernel will not free it after the
    /// callback returns.
    pub fn retain(&mut self) -> Bytes {
        self.retained = true;
        std::mem::take(&mut self.payload)
    }

    pub fn is_retained(&self) -> bool {
        self.retained
    }

    pub(crate) fn into_payload(self) -> Bytes {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retain_takes_payload() {
        let mut msg = Message::new(
            Handle::new(0, 1),
            5,
            MessageType::TEXT,
            Bytes::from_static(b"hello"),
        );
        assert_eq!(msg.size(), 5);
        let kept = msg.retain();
        assert_eq!(&kept[..], b"hello");
        assert!(msg.is_retained());
        assert_eq!(msg.size(), 0);
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(MessageType::RESPONSE.to_string(), "response");
        assert_eq!(MessageType(42).to_string(), "type(42)");
    }
}
