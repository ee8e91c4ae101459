//! Collaborator interfaces for problemd
//!
//! This crate defines the seams between the service core and the outside
//! world: post-processing of new problems and the authorization policy.
//! It contains no platform code itself.

mod mock;
mod traits;

pub use mock::*;
pub use traits::*;
