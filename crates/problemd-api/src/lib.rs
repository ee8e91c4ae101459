//! Protocol types for problemd IPC
//!
//! This crate defines the stable API between problemd and clients:
//! - Commands (requests from clients)
//! - Responses
//! - Events (service -> clients)
//! - Element values, flags and status codes shared with the store
//! - Versioning

mod commands;
mod events;
mod types;

pub use commands::*;
pub use events::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
