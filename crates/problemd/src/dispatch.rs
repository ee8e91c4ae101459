//! Command dispatch between the IPC server and the problem service

use problemd_api::{
    ClientInfo, Command, ErrorInfo, Event, GetProblemsFlags, NewProblemFlags,
    ReadElementsFlags, Response, ResponsePayload, SaveElementsFlags,
};
use problemd_core::{CoreEvent, Service};
use problemd_ipc::{IpcServer, ServerMessage};
use problemd_util::Result;
use std::future::Future;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Routes client requests to the service and service events to clients
#[derive(Clone)]
pub struct Dispatcher {
    service: Service,
    ipc: Arc<IpcServer>,
}

impl Dispatcher {
    pub fn new(service: Service, ipc: Arc<IpcServer>) -> Self {
        Self { service, ipc }
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Serve until `shutdown` resolves or the IPC server goes away
    ///
    /// Clients get a `Shutdown` event before this returns.
    pub async fn run(
        &self,
        mut messages: mpsc::UnboundedReceiver<ServerMessage>,
        mut events: mpsc::UnboundedReceiver<CoreEvent>,
        shutdown: impl Future<Output = ()>,
    ) {
        tokio::pin!(shutdown);

        info!("Service running");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                message = messages.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        warn!("IPC server stopped");
                        break;
                    }
                },

                Some(event) = events.recv() => self.deliver(event).await,
            }
        }

        self.service.shutdown();
        while let Ok(event) = events.try_recv() {
            self.deliver(event).await;
        }
    }

    /// Handle one message from the IPC server
    ///
    /// Requests are served on their own tasks so slow filesystem work does
    /// not hold up other clients.
    pub async fn handle_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Request {
                client_id,
                request,
                fds,
            } => {
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    let Some(caller) = dispatcher.ipc.get_client_info(&client_id).await else {
                        debug!(client_id = %client_id, "Request from a client that is gone");
                        return;
                    };

                    let (response, fds) = dispatcher
                        .handle_command(&caller, request.request_id, request.command, fds)
                        .await;

                    if let Err(e) = dispatcher.ipc.send_response(&client_id, response, fds).await {
                        debug!(client_id = %client_id, error = %e, "Failed to send response");
                    }
                });
            }

            ServerMessage::ClientConnected { client_id, info } => {
                debug!(client_id = %client_id, uid = info.uid, pid = ?info.pid, "Registering client");
                self.service.client_connected(&info);
            }

            ServerMessage::ClientDisconnected { client_id } => {
                debug!(client_id = %client_id, "Client disconnected");
                let service = self.service.clone();
                tokio::spawn(async move { service.client_disconnected(&client_id).await });
            }
        }
    }

    /// Send a service event to its client, if subscribed
    pub async fn deliver(&self, event: CoreEvent) {
        let CoreEvent { client_id, payload } = event;
        match self.ipc.send_event(&client_id, &Event::new(payload)).await {
            Ok(true) => {}
            Ok(false) => debug!(client_id = %client_id, "Client not subscribed, event dropped"),
            Err(e) => debug!(client_id = %client_id, error = %e, "Failed to deliver event"),
        }
    }

    /// Run one command on behalf of `caller`
    pub async fn handle_command(
        &self,
        caller: &ClientInfo,
        request_id: u64,
        command: Command,
        fds: Vec<OwnedFd>,
    ) -> (Response, Vec<OwnedFd>) {
        match self.execute(caller, command, fds).await {
            Ok((payload, fds)) => (Response::success(request_id, payload), fds),
            Err(e) => {
                debug!(request_id, uid = caller.uid, error = %e, "Request failed");
                (Response::error(request_id, ErrorInfo::from(&e)), Vec::new())
            }
        }
    }

    async fn execute(
        &self,
        caller: &ClientInfo,
        command: Command,
        fds: Vec<OwnedFd>,
    ) -> Result<(ResponsePayload, Vec<OwnedFd>)> {
        let service = &self.service;
        let payload = match command {
            Command::NewProblem { data, flags } => {
                let path = service.new_problem(
                    caller,
                    data,
                    fds,
                    NewProblemFlags::from_bits_truncate(flags),
                )?;
                ResponsePayload::NewProblem { path }
            }

            Command::GetSession => ResponsePayload::Session {
                path: service.get_session(caller)?,
            },

            Command::GetProblems { flags, .. } => ResponsePayload::Problems {
                entries: service
                    .get_problems(caller, GetProblemsFlags::from_bits_truncate(flags))
                    .await?,
            },

            Command::GetProblemData { entry } => ResponsePayload::ProblemData {
                elements: service.get_problem_data(caller, &entry).await?,
            },

            Command::DeleteProblems { entries } => {
                service.delete_problems(caller, &entries).await?;
                ResponsePayload::ProblemsDeleted
            }

            Command::ReadElements {
                entry,
                names,
                flags,
            } => {
                let (elements, fds) = service
                    .read_elements(caller, &entry, names, ReadElementsFlags::from_bits_truncate(flags))
                    .await?;
                return Ok((ResponsePayload::Elements { elements }, fds));
            }

            Command::SaveElements {
                entry,
                elements,
                flags,
            } => {
                service
                    .save_elements(
                        caller,
                        &entry,
                        elements,
                        fds,
                        SaveElementsFlags::from_bits_truncate(flags),
                    )
                    .await?;
                ResponsePayload::ElementsSaved
            }

            Command::DeleteElements { entry, names } => {
                service.delete_elements(caller, &entry, names).await?;
                ResponsePayload::ElementsDeleted
            }

            Command::GetEntryProperties { entry } => {
                ResponsePayload::EntryProperties(service.entry_properties(caller, &entry).await?)
            }

            Command::Authorize { session, details } => ResponsePayload::Authorization {
                result: service.authorize(caller, &session, &details)?,
            },

            Command::GenerateToken { session, duration } => ResponsePayload::Token {
                token: service.generate_token(caller, &session, duration)?,
            },

            Command::RevokeToken { session, token } => {
                service.revoke_token(caller, &session, &token)?;
                ResponsePayload::TokenRevoked
            }

            Command::RevokeAuthorization { session } => {
                service.revoke_authorization(caller, &session)?;
                ResponsePayload::AuthorizationRevoked
            }

            Command::GetSessionInfo { session } => {
                ResponsePayload::SessionInfo(service.session_info(caller, &session)?)
            }

            Command::StartTask { task, .. } => {
                service.start_task(caller, &task)?;
                ResponsePayload::TaskStarted
            }

            Command::CancelTask { task } => {
                service.cancel_task(caller, &task).await?;
                ResponsePayload::TaskCancelled
            }

            Command::FinishTask { task } => {
                let (results, code) = service.finish_task(caller, &task)?;
                ResponsePayload::TaskFinished { results, code }
            }

            Command::GetTaskInfo { task } => ResponsePayload::TaskInfo(service.task_info(caller, &task)?),

            Command::SubscribeEvents => ResponsePayload::Subscribed {
                client_id: caller.client_id.clone(),
            },

            Command::UnsubscribeEvents => ResponsePayload::Unsubscribed,

            Command::Ping => ResponsePayload::Pong,
        };
        Ok((payload, Vec::new()))
    }
}
