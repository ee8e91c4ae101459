//! IPC client implementation

use problemd_api::{Command, Event, Request, Response, ResponsePayload, ResponseResult};
use problemd_util::ClientId;
use serde::Deserialize;
use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::path::Path;
use tokio::net::UnixStream;
use tracing::warn;

use crate::{DEFAULT_MAX_MESSAGE_SIZE, IpcError, IpcResult, MessageReader, MessageWriter, split};

/// A line from the server: a response or an event
#[derive(Deserialize)]
#[serde(untagged)]
enum Incoming {
    Response(Response),
    Event(Event),
}

/// IPC Client for connecting to problemd
///
/// Events that arrive while waiting for a response are kept and returned
/// by [`IpcClient::next_event`].
pub struct IpcClient {
    reader: MessageReader,
    writer: MessageWriter,
    next_request_id: u64,
    events: VecDeque<Event>,
}

impl IpcClient {
    /// Connect to problemd
    pub async fn connect(socket_path: impl AsRef<Path>) -> IpcResult<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (reader, writer) = split(stream, DEFAULT_MAX_MESSAGE_SIZE);

        Ok(Self {
            reader,
            writer,
            next_request_id: 1,
            events: VecDeque::new(),
        })
    }

    /// Send a command and wait for response
    pub async fn send(&mut self, command: Command) -> IpcResult<Response> {
        let (response, _) = self.send_with_fds(command, Vec::new()).await?;
        Ok(response)
    }

    /// Send a command with descriptors and wait for the response and its descriptors
    pub async fn send_with_fds(
        &mut self,
        command: Command,
        fds: Vec<OwnedFd>,
    ) -> IpcResult<(Response, Vec<OwnedFd>)> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let request = Request::new(request_id, command).with_fds(fds.len() as u32);
        let json = serde_json::to_string(&request)?;
        self.writer.send_line(&json, &fds).await?;
        drop(fds);

        loop {
            match self.read_incoming().await? {
                Incoming::Response(response) => {
                    let fds = self.reader.take_fds(response.fd_count)?;
                    if response.request_id == request_id {
                        return Ok((response, fds));
                    }
                    warn!(
                        expected = request_id,
                        received = response.request_id,
                        "Discarding unexpected response"
                    );
                }
                Incoming::Event(event) => self.events.push_back(event),
            }
        }
    }

    /// Subscribe to events, returning the id the server knows us by
    pub async fn subscribe(&mut self) -> IpcResult<ClientId> {
        let response = self.send(Command::SubscribeEvents).await?;

        match response.result {
            ResponseResult::Ok(ResponsePayload::Subscribed { client_id }) => Ok(client_id),
            ResponseResult::Ok(other) => Err(IpcError::InvalidMessage(format!(
                "Unexpected response to subscribe: {:?}",
                other
            ))),
            ResponseResult::Err(e) => Err(IpcError::ServerError(e.message)),
        }
    }

    /// Wait for the next event
    pub async fn next_event(&mut self) -> IpcResult<Event> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }

        loop {
            match self.read_incoming().await? {
                Incoming::Event(event) => return Ok(event),
                Incoming::Response(response) => {
                    let _ = self.reader.take_fds(response.fd_count);
                    warn!(request_id = response.request_id, "Discarding response without request");
                }
            }
        }
    }

    async fn read_incoming(&mut self) -> IpcResult<Incoming> {
        let line = self
            .reader
            .next_line()
            .await?
            .ok_or(IpcError::ConnectionClosed)?;
        Ok(serde_json::from_str(line.trim())?)
    }
}
