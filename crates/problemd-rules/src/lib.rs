//! Event rule engine for problemd
//!
//! This crate provides:
//! - Rule file parsing with continuation lines and recursive `include`
//! - Lazy condition matching against a problem directory
//! - Handler processes run through `/bin/sh` with merged output
//! - Listing the events applicable to a problem

mod matcher;
mod rules;
mod run;

pub use matcher::*;
pub use rules::*;
pub use run::*;

use thiserror::Error;

/// Rule engine errors
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::Error> for RuleError {
    fn from(e: nix::Error) -> Self {
        RuleError::Io(std::io::Error::from(e))
    }
}

pub type RuleResult<T> = Result<T, RuleError>;
