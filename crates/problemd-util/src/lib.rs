//! Shared utilities for problemd
//!
//! This crate provides:
//! - Object path and client identifier types
//! - Time utilities (epoch seconds, problem directory timestamps)
//! - The shared error taxonomy
//! - The per-user new-problem throttle
//! - Default paths for socket, data, dump location and rule files

mod error;
mod ids;
mod paths;
mod throttle;
mod time;

pub use error::*;
pub use ids::*;
pub use paths::*;
pub use throttle::*;
pub use time::*;
