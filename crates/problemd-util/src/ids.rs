//! Strongly-typed identifiers for problemd

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Root of every object path exported by the service
pub const OBJECT_ROOT: &str = "/org/freedesktop/Problems2";

/// Path returned for work that is not exported as an object
pub const NULL_OBJECT_PATH: &str = "/";

/// Address of an object exported by the service (entry, session or task)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The path that stands for "no object"
    pub fn null() -> Self {
        Self(NULL_OBJECT_PATH.to_string())
    }

    /// Entry path derived from the problem directory name
    pub fn for_entry(dir_name: &str) -> Self {
        Self(format!("{}/Entry/{}", OBJECT_ROOT, digest(dir_name)))
    }

    /// Session path derived from the caller's connection address
    pub fn for_session(caller: &ClientId) -> Self {
        Self(format!("{}/Session/{}", OBJECT_ROOT, digest(&caller.to_string())))
    }

    /// Task path nested below its owning session
    pub fn for_task(session: &ObjectPath, index: u32) -> Self {
        Self(format!("{}/Task/{}", session.0, index))
    }

    pub fn is_null(&self) -> bool {
        self.0 == NULL_OBJECT_PATH
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn digest(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ObjectPath {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ObjectPath {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a connected IPC client
///
/// This is the caller identity a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse the textual form produced by `Display`
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
