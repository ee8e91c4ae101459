//! Service core for problemd
//!
//! This crate provides:
//! - Problem entries with access control over their elements
//! - Creation of new problem directories from client data
//! - Sessions with authorization and delegation tokens
//! - Cancellable tasks, including the NewProblem task
//! - The service registry tying entries, sessions and tasks together

mod entry;
mod events;
mod new_problem;
mod problem;
mod service;
mod session;
mod task;

pub use entry::*;
pub use events::*;
pub use new_problem::*;
pub use problem::*;
pub use service::*;
pub use session::*;
pub use task::*;
