//! Service addresses.
//!
//! A [`Handle`] packs a 24-bit local slot id with the 8-bit id of the cluster
//! node that owns the service:
//! ```text
//! ┌──────────┬──────────────────────────┐
//! │ node (8) │      local id (24)       │
//! └──────────┴──────────────────────────┘
//! ```
//! Local id 0 is reserved, so `Handle(0)` means "no address".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Mask selecting the local slot id.
pub const HANDLE_MASK: u32 = 0x00ff_ffff;
/// Shift of the node id inside a handle.
pub const HANDLE_REMOTE_SHIFT: u32 = 24;

/// Globally unique address of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u32);

impl Handle {
    /// The null address.
    pub const NONE: Handle = Handle(0);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn new(node: u8, local_id: u32) -> Self {
        Self(((node as u32) << HANDLE_REMOTE_SHIFT) | (local_id & HANDLE_MASK))
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Owning cluster node id.
    pub const fn node(self) -> u8 {
        (self.0 >> HANDLE_REMOTE_SHIFT) as u8
    }

    /// Local slot id (low 24 bits).
    pub const fn local_id(self) -> u32 {
        self.0 & HANDLE_MASK
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Same slot re-addressed to another node id.
    pub const fn with_node(self, node: u8) -> Self {
        Self::new(node, self.local_id())
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{:08x}", self.0)
    }
}

impl FromStr for Handle {
    type Err = crate::types::Error;

    /// Parses the `:hex` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix(':')
            .ok_or_else(|| crate::types::Error::validation(format!("invalid handle: {}", s)))?;
        u32::from_str_radix(hex, 16)
            .map(Handle)
            .map_err(|_| crate::types::Error::validation(format!("invalid handle: {}", s)))
    }
}
