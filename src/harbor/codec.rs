//! Frame codec for the harbor wire protocol.
//!
//! Every frame is a 2-byte big-endian length followed by that many bytes.
//! Peer links carry message frames:
//! ```text
//! ┌──────────┬──────────┬────────────────────┬──────────┬───────────┐
//! │ len (2B) │ src (4B) │ type(1B) dst (3B)  │ sess(4B) │  payload  │
//! │ u16 BE   │ u32 BE   │ u32 BE             │ i32 BE   │           │
//! └──────────┴──────────┴────────────────────┴──────────┴───────────┘
//! ```
//! The destination's node byte is implied by the link, so its high byte
//! carries the message type instead. Length covers header and payload, NOT
//! the 2-byte prefix.
//!
//! Coordinator links (and the first frame of every peer link) carry
//! control frames: one tag byte followed by tag-specific fields.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::kernel::MessageType;
use crate::types::{Error, Handle, Result, HANDLE_MASK, MAX_HARBOR_FRAME};

/// Header bytes preceding the payload of a message frame.
pub const HEADER_LEN: usize = 12;

const TAG_HELLO: u8 = b'H';
const TAG_WHO_HAS: u8 = b'W';
const TAG_CONNECT: u8 = b'C';
const TAG_NODE_DOWN: u8 = b'D';
const TAG_NAME: u8 = b'N';

/// A message in transit between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub source: Handle,
    pub destination: Handle,
    pub session: i32,
    pub kind: MessageType,
    pub payload: Bytes,
}

impl RemoteMessage {
    /// Encode as a complete frame, length prefix included.
    pub fn encode(&self, max_frame_bytes: usize) -> Result<Bytes> {
        let body_len = HEADER_LEN + self.payload.len();
        let limit = max_frame_bytes.min(MAX_HARBOR_FRAME);
        if body_len > limit {
            return Err(Error::delivery(format!(
                "message to {} is {} bytes, frame limit is {}",
                self.destination, body_len, limit
            )));
        }
        let mut buf = BytesMut::with_capacity(2 + body_len);
        buf.put_u16(body_len as u16);
        buf.put_u32(self.source.raw());
        buf.put_u32((u32::from(self.kind.0) << 24) | self.destination.local_id());
        buf.put_i32(self.session);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode a frame body (prefix already stripped) received by `local_node`.
    pub fn decode(mut body: Bytes, local_node: u8) -> Result<Self> {
        if body.len() < HEADER_LEN {
            return Err(Error::protocol(format!(
                "message frame too short: {} bytes",
                body.len()
            )));
        }
        let source = Handle::from_raw(body.get_u32());
        let packed = body.get_u32();
        let session = body.get_i32();
        Ok(Self {
            source,
            destination: Handle::new(local_node, packed & HANDLE_MASK),
            session,
            kind: MessageType((packed >> 24) as u8),
            payload: body,
        })
    }
}

/// Coordinator and link-setup frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// First frame on any link: who is speaking, and where its peers
    /// should connect (empty on peer links).
    Hello { node: u8, addr: String },
    /// Ask the coordinator for a node's address.
    WhoHas { node: u8 },
    /// A node's address.
    Connect { node: u8, addr: String },
    /// A node is not (or no longer) reachable.
    NodeDown { node: u8 },
    /// Handle 0 asks to resolve `name`; any other handle publishes it.
    Name { handle: Handle, name: String },
}

impl ControlFrame {
    /// Encode as a complete frame, length prefix included.
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        match self {
            ControlFrame::Hello { node, addr } => {
                body.put_u8(TAG_HELLO);
                body.put_u8(*node);
                body.put_slice(addr.as_bytes());
            }
            ControlFrame::WhoHas { node } => {
                body.put_u8(TAG_WHO_HAS);
                body.put_u8(*node);
            }
            ControlFrame::Connect { node, addr } => {
                body.put_u8(TAG_CONNECT);
                body.put_u8(*node);
                body.put_slice(addr.as_bytes());
            }
            ControlFrame::NodeDown { node } => {
                body.put_u8(TAG_NODE_DOWN);
                body.put_u8(*node);
            }
            ControlFrame::Name { handle, name } => {
                body.put_u8(TAG_NAME);
                body.put_u32(handle.raw());
                body.put_slice(name.as_bytes());
            }
        }
        if body.len() > MAX_HARBOR_FRAME {
            return Err(Error::protocol(format!(
                "control frame too large: {} bytes",
                body.len()
            )));
        }
        let mut frame = BytesMut::with_capacity(2 + body.len());
        frame.put_u16(body.len() as u16);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        if body.is_empty() {
            return Err(Error::protocol("empty control frame"));
        }
        let tag = body.get_u8();
        let need = |body: &Bytes, n: usize| {
            if body.len() < n {
                Err(Error::protocol(format!(
                    "control frame '{}' truncated",
                    tag as char
                )))
            } else {
                Ok(())
            }
        };
        let text = |body: Bytes| {
            String::from_utf8(body.to_vec())
                .map_err(|_| Error::protocol("control frame text is not utf-8"))
        };
        match tag {
            TAG_HELLO => {
                need(&body, 1)?;
                let node = body.get_u8();
                Ok(ControlFrame::Hello {
                    node,
                    addr: text(body)?,
                })
            }
            TAG_WHO_HAS => {
                need(&body, 1)?;
                Ok(ControlFrame::WhoHas {
                    node: body.get_u8(),
                })
            }
            TAG_CONNECT => {
                need(&body, 1)?;
                let node = body.get_u8();
                Ok(ControlFrame::Connect {
                    node,
                    addr: text(body)?,
                })
            }
            TAG_NODE_DOWN => {
                need(&body, 1)?;
                Ok(ControlFrame::NodeDown {
                    node: body.get_u8(),
                })
            }
            TAG_NAME => {
                need(&body, 4)?;
                let handle = Handle::from_raw(body.get_u32());
                Ok(ControlFrame::Name {
                    handle,
                    name: text(body)?,
                })
            }
            other => Err(Error::protocol(format!(
                "unknown control frame tag: {:#04x}",
                other
            ))),
        }
    }
}

/// Read one frame body from the stream. Returns `None` on clean EOF.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> std::io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u16::from_be_bytes(len_buf) as usize;
    if frame_len > max_frame_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", frame_len),
        ));
    }

    let mut body = vec![0u8; frame_len];
    reader.read_exact(&mut body).await?;
    Ok(Some(Bytes::from(body)))
}

/// Write one pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
