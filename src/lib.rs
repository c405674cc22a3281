//! # Skiff Core - Actor-Style Service Kernel
//!
//! Many small single-threaded services, each with private state and a
//! message callback, exchange asynchronous messages and are scheduled
//! across a fixed pool of worker threads:
//! - Handle registry with recycled-slot protection and local name aliases
//! - Per-service mailboxes drained through a global ready queue
//! - Hierarchical timer wheel delivering timeouts as messages
//! - Harbor routing for handles that live on other cluster nodes
//! - Liveness monitor flagging services stuck in one callback
//!
//! ## Architecture
//!
//! ```text
//!   send ──► Mailbox ──► Global ready queue ──► worker pool ──► Service
//!              ▲                                                  │
//!   timer ─────┤                                                  │
//!   harbor ────┘◄──────────────── remote nodes ◄──────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod harbor;
pub mod kernel;
pub mod types;

// Internal utilities
pub mod observability;

pub use kernel::{Context, Kernel, KernelHandle, Message, MessageType, SendFlags, Service};
pub use types::{Config, Error, Handle, Result};
