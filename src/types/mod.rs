//! Core types for the Skiff kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **Handle**: Packed service address (node id + local slot id)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for kernel, timer, monitor, and harbor

mod config;
mod errors;
mod handle;

pub use config::{
    Config, HarborConfig, KernelConfig, MonitorConfig, ObservabilityConfig, TimerConfig,
    MAX_HARBOR_FRAME,
};
pub use errors::{Error, Result};
pub use handle::{Handle, HANDLE_MASK, HANDLE_REMOTE_SHIFT};
