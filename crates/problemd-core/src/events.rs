//! Events emitted by the service core

use problemd_api::EventPayload;
use problemd_util::ClientId;

/// An event addressed to one connected client
///
/// The core decides who may see an event; the IPC layer only delivers it.
#[derive(Debug, Clone)]
pub struct CoreEvent {
    pub client_id: ClientId,
    pub payload: EventPayload,
}

impl CoreEvent {
    pub fn new(client_id: ClientId, payload: EventPayload) -> Self {
        Self { client_id, payload }
    }
}
