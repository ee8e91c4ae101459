//! Linux collaborators for problemd
//!
//! Provides:
//! - New-problem notification over the crash daemon's socket
//! - New-problem notification by running the `post-create` event in-process
//! - Authorization through an external checker command

mod authority;
mod notifier;

pub use authority::*;
pub use notifier::*;
