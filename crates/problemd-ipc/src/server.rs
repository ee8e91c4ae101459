//! IPC server implementation

use problemd_api::{ClientInfo, Command, ErrorCode, ErrorInfo, Event, Request, Response};
use problemd_util::ClientId;
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, error, info, warn};

use crate::{IpcError, IpcResult, MAX_FDS_PER_MESSAGE, MessageReader, peer_credentials, split};

/// Longest accepted message line
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// Message from client to server
pub enum ServerMessage {
    Request {
        client_id: ClientId,
        request: Request,
        /// Descriptors sent along, indexed by `ElementValue::Handle`
        fds: Vec<OwnedFd>,
    },
    ClientConnected {
        client_id: ClientId,
        info: ClientInfo,
    },
    ClientDisconnected {
        client_id: ClientId,
    },
}

struct Outgoing {
    line: String,
    fds: Vec<OwnedFd>,
}

/// IPC Server
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    clients: Arc<RwLock<HashMap<ClientId, ClientHandle>>>,
    message_tx: mpsc::UnboundedSender<ServerMessage>,
    message_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>>,
    max_message_size: usize,
    max_fds: usize,
}

struct ClientHandle {
    info: ClientInfo,
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    subscribed: bool,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
            clients: Arc::new(RwLock::new(HashMap::new())),
            message_tx,
            message_rx: Arc::new(Mutex::new(Some(message_rx))),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_fds: MAX_FDS_PER_MESSAGE,
        }
    }

    /// Limit the size of a message line and the descriptors sent with it
    pub fn with_limits(mut self, max_message_size: usize, max_fds: usize) -> Self {
        self.max_message_size = max_message_size;
        self.max_fds = max_fds.min(MAX_FDS_PER_MESSAGE);
        self
    }

    /// Start listening
    pub async fn start(&mut self) -> IpcResult<()> {
        // Remove existing socket if present
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        // Readable/writable by owner and group
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660))?;

        info!(path = %self.socket_path.display(), "IPC server listening");

        self.listener = Some(listener);

        Ok(())
    }

    /// Get receiver for server messages
    pub async fn take_message_receiver(&self) -> Option<mpsc::UnboundedReceiver<ServerMessage>> {
        self.message_rx.lock().await.take()
    }

    /// Accept connections in a loop
    pub async fn run(&self) -> IpcResult<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| IpcError::ServerError("Server not started".into()))?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    // Callers are identified by their credentials only
                    let Some(cred) = peer_credentials(&stream) else {
                        warn!("Rejecting client without credentials");
                        continue;
                    };

                    let client_id = ClientId::new();
                    let info = ClientInfo {
                        client_id: client_id.clone(),
                        uid: cred.uid,
                        pid: Some(cred.pid),
                    };

                    info!(client_id = %client_id, uid = cred.uid, pid = cred.pid, "Client connected");

                    self.handle_client(stream, client_id, info).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_client(&self, stream: UnixStream, client_id: ClientId, info: ClientInfo) {
        let (reader, writer) = split(stream, self.max_message_size);
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing>();

        self.clients.write().await.insert(
            client_id.clone(),
            ClientHandle {
                info: info.clone(),
                outgoing_tx: outgoing_tx.clone(),
                subscribed: false,
            },
        );

        let _ = self.message_tx.send(ServerMessage::ClientConnected {
            client_id: client_id.clone(),
            info,
        });

        tokio::spawn(read_requests(
            reader,
            client_id.clone(),
            self.clients.clone(),
            self.message_tx.clone(),
            outgoing_tx,
            self.max_fds,
        ));

        // The writer ends once the client is unregistered and the reader is gone
        tokio::spawn(async move {
            while let Some(outgoing) = outgoing_rx.recv().await {
                if let Err(e) = writer.send_line(&outgoing.line, &outgoing.fds).await {
                    debug!(client_id = %client_id, error = %e, "Write error");
                    break;
                }
            }
        });
    }

    /// Send a response and its descriptors to a specific client
    pub async fn send_response(
        &self,
        client_id: &ClientId,
        mut response: Response,
        fds: Vec<OwnedFd>,
    ) -> IpcResult<()> {
        response.fd_count = fds.len() as u32;
        let line = serde_json::to_string(&response)?;

        let clients = self.clients.read().await;
        if let Some(handle) = clients.get(client_id) {
            handle
                .outgoing_tx
                .send(Outgoing { line, fds })
                .map_err(|_| IpcError::ConnectionClosed)?;
        }

        Ok(())
    }

    /// Send an event to a client that subscribed to events
    ///
    /// Returns whether the event was queued.
    pub async fn send_event(&self, client_id: &ClientId, event: &Event) -> IpcResult<bool> {
        let clients = self.clients.read().await;
        let Some(handle) = clients.get(client_id).filter(|h| h.subscribed) else {
            return Ok(false);
        };

        let line = serde_json::to_string(event)?;
        handle
            .outgoing_tx
            .send(Outgoing {
                line,
                fds: Vec::new(),
            })
            .map_err(|_| IpcError::ConnectionClosed)?;
        Ok(true)
    }

    /// Get client info
    pub async fn get_client_info(&self, client_id: &ClientId) -> Option<ClientInfo> {
        let clients = self.clients.read().await;
        clients.get(client_id).map(|h| h.info.clone())
    }

    /// Get connected client count
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn read_requests(
    mut reader: MessageReader,
    client_id: ClientId,
    clients: Arc<RwLock<HashMap<ClientId, ClientHandle>>>,
    message_tx: mpsc::UnboundedSender<ServerMessage>,
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    max_fds: usize,
) {
    let reject = |request_id: u64, message: String| {
        let response = Response::error(request_id, ErrorInfo::new(ErrorCode::InvalidRequest, message));
        if let Ok(line) = serde_json::to_string(&response) {
            let _ = outgoing_tx.send(Outgoing {
                line,
                fds: Vec::new(),
            });
        }
    };

    loop {
        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(client_id = %client_id, "Client disconnected (EOF)");
                break;
            }
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Dropping client");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<Request>(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Invalid request");
                // Descriptors of a message nobody understood
                reader.discard_fds();
                continue;
            }
        };

        if request.fd_count as usize > max_fds {
            reader.discard_fds();
            reject(
                request.request_id,
                format!("Too many file descriptors, the limit is {}", max_fds),
            );
            continue;
        }

        let fds = match reader.take_fds(request.fd_count) {
            Ok(fds) => fds,
            Err(e) => {
                reject(request.request_id, e.to_string());
                continue;
            }
        };
        let surplus = reader.discard_fds();
        if surplus > 0 {
            warn!(
                client_id = %client_id,
                declared = request.fd_count,
                surplus,
                "Closed undeclared file descriptors"
            );
        }

        match request.command {
            Command::SubscribeEvents | Command::UnsubscribeEvents => {
                let subscribe = matches!(request.command, Command::SubscribeEvents);
                if let Some(handle) = clients.write().await.get_mut(&client_id) {
                    handle.subscribed = subscribe;
                }
            }
            _ => {}
        }

        let _ = message_tx.send(ServerMessage::Request {
            client_id: client_id.clone(),
            request,
            fds,
        });
    }

    clients.write().await.remove(&client_id);
    let _ = message_tx.send(ServerMessage::ClientDisconnected { client_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IpcClient;
    use problemd_api::{ElementValue, EventPayload, ProblemInfo, ResponsePayload, ResponseResult};
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};
    use tempfile::tempdir;

    async fn started(socket_path: &Path) -> (Arc<IpcServer>, mpsc::UnboundedReceiver<ServerMessage>) {
        let mut server = IpcServer::new(socket_path);
        server.start().await.unwrap();
        let server = Arc::new(server);
        let messages = server.take_message_receiver().await.unwrap();
        let accept = server.clone();
        tokio::spawn(async move { accept.run().await });
        (server, messages)
    }

    #[tokio::test]
    async fn test_server_start() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut server = IpcServer::new(&socket_path);
        server.start().await.unwrap();

        assert!(socket_path.exists());
        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);
    }

    #[tokio::test]
    async fn requests_with_descriptors() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let (server, mut messages) = started(&socket_path).await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"backtrace").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let data = ProblemInfo::from([("backtrace".to_string(), ElementValue::Handle(0))]);
        let call = tokio::spawn(async move {
            let result = client
                .send_with_fds(Command::NewProblem { data, flags: 0 }, vec![OwnedFd::from(file)])
                .await;
            (client, result)
        });

        let Some(ServerMessage::ClientConnected { client_id, info }) = messages.recv().await else {
            panic!("expected a connection");
        };
        assert_eq!(info.uid, nix::unistd::getuid().as_raw());
        assert_eq!(info.pid, Some(std::process::id() as i32));

        let Some(ServerMessage::Request { request, fds, .. }) = messages.recv().await else {
            panic!("expected a request");
        };
        assert_eq!(request.fd_count, 1);
        let mut content = String::new();
        File::from(fds.into_iter().next().unwrap()).read_to_string(&mut content).unwrap();
        assert_eq!(content, "backtrace");

        server
            .send_response(&client_id, Response::success(request.request_id, ResponsePayload::Pong), Vec::new())
            .await
            .unwrap();

        let (client, result) = call.await.unwrap();
        let (response, fds) = result.unwrap();
        assert!(matches!(response.result, ResponseResult::Ok(ResponsePayload::Pong)));
        assert!(fds.is_empty());

        drop(client);
        assert!(matches!(
            messages.recv().await,
            Some(ServerMessage::ClientDisconnected { .. })
        ));
        assert_eq!(server.client_count().await, 0);
    }

    #[tokio::test]
    async fn undeclared_descriptors_are_closed() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let (_server, mut messages) = started(&socket_path).await;

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (_reader, writer) = split(stream, 1024);
        let Some(ServerMessage::ClientConnected { .. }) = messages.recv().await else {
            panic!("expected a connection");
        };

        let (kept, sent) = std::os::unix::net::UnixStream::pair().unwrap();
        let extra: Vec<OwnedFd> = (0..3)
            .map(|_| OwnedFd::from(sent.try_clone().unwrap()))
            .collect();
        drop(sent);
        let line = serde_json::to_string(&Request::new(1, Command::Ping)).unwrap();
        writer.send_line(&line, &extra).await.unwrap();
        drop(extra);

        let Some(ServerMessage::Request { request, fds, .. }) = messages.recv().await else {
            panic!("expected a request");
        };
        assert_eq!(request.fd_count, 0);
        assert!(fds.is_empty());

        kept.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!((&kept).read(&mut buf).unwrap(), 0);

        let line = serde_json::to_string(&Request::new(2, Command::Ping)).unwrap();
        writer.send_line(&line, &[]).await.unwrap();
        let Some(ServerMessage::Request { request, .. }) = messages.recv().await else {
            panic!("expected a request");
        };
        assert_eq!(request.request_id, 2);
    }

    #[tokio::test]
    async fn events_need_subscription() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let (server, mut messages) = started(&socket_path).await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let Some(ServerMessage::ClientConnected { client_id, .. }) = messages.recv().await else {
            panic!("expected a connection");
        };

        let event = Event::new(EventPayload::Shutdown);
        assert!(!server.send_event(&client_id, &event).await.unwrap());

        let subscribe = tokio::spawn(async move {
            let result = client.send(Command::SubscribeEvents).await;
            (client, result)
        });
        let Some(ServerMessage::Request { request, .. }) = messages.recv().await else {
            panic!("expected a request");
        };
        assert!(server.send_event(&client_id, &event).await.unwrap());
        server
            .send_response(
                &client_id,
                Response::success(
                    request.request_id,
                    ResponsePayload::Subscribed {
                        client_id: client_id.clone(),
                    },
                ),
                Vec::new(),
            )
            .await
            .unwrap();

        let (mut client, result) = subscribe.await.unwrap();
        result.unwrap();
        // The event sent before the response was kept for later
        let event = client.next_event().await.unwrap();
        assert!(matches!(event.payload, EventPayload::Shutdown));
    }

    #[tokio::test]
    async fn missing_descriptors_are_rejected() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let (_server, mut messages) = started(&socket_path).await;

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (mut reader, writer) = split(stream, 4096);
        let request = Request::new(7, Command::Ping).with_fds(2);
        writer
            .send_line(&serde_json::to_string(&request).unwrap(), &[])
            .await
            .unwrap();

        let line = reader.next_line().await.unwrap().unwrap();
        let response: Response = serde_json::from_str(&line).unwrap();
        assert_eq!(response.request_id, 7);
        assert!(matches!(
            response.result,
            ResponseResult::Err(ErrorInfo { code: ErrorCode::InvalidRequest, .. })
        ));

        assert!(matches!(messages.recv().await, Some(ServerMessage::ClientConnected { .. })));
        assert!(messages.try_recv().is_err());
    }
}
