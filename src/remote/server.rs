use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tonic::{Request as GrpcRequest, Response, Status, Streaming};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::commands::{Command, CommandError, CommandOpts, Help, Kind, Registry};
use crate::config::{AuthStrategy, ChannelStrategy, DEFAULT_COMMAND_TIMEOUT};
use crate::jobs::{Cancellations, Job, Jobs, JobStatus};
use crate::store::{Bucket, Store};

use super::api;
use super::api::command_pipeline_server::{CommandPipeline, CommandPipelineServer};
use super::api::log_writer_server::{LogWriter, LogWriterServer};
use super::api::registration_server::{Registration, RegistrationServer};

/// Bound of each agent's request queue; overflow fails the request.
const REQUEST_QUEUE: usize = 16;

struct FinishPayload {
    content: String,
    error: String,
}

type RequestSink = mpsc::Sender<std::result::Result<api::CommandRequest, Status>>;

struct ServerState {
    jobs: Jobs,
    registry: Arc<Registry>,
    store: Store,
    cancels: Cancellations,
    /// Private tokens handed out by `Register`, waiting for the pipeline.
    pending: StdMutex<HashMap<String, String>>,
    /// Commands each connected agent contributed, for retraction.
    agents: StdMutex<HashMap<String, Vec<String>>>,
    waiters: StdMutex<HashMap<u64, oneshot::Sender<FinishPayload>>>,
}

impl ServerState {
    fn retract(&self, agent_id: &str) {
        let names = self
            .agents
            .lock()
            .expect("agents lock poisoned")
            .remove(agent_id);
        if let Some(names) = names {
            info!("agent {} disconnected, retracting {} commands", agent_id, names.len());
            self.registry.unregister(Kind::Remote, &names);
        }
    }

    fn take_waiter(&self, job_id: u64) -> Option<oneshot::Sender<FinishPayload>> {
        self.waiters
            .lock()
            .expect("waiters lock poisoned")
            .remove(&job_id)
    }
}

/// The server side of the agent plane: registration, per-agent request
/// streams, and the log and finish callbacks.
#[derive(Clone)]
pub struct RemoteServer {
    state: Arc<ServerState>,
}

impl RemoteServer {
    pub fn new(
        jobs: Jobs,
        registry: Arc<Registry>,
        store: Store,
        cancels: Cancellations,
    ) -> RemoteServer {
        RemoteServer {
            state: Arc::new(ServerState {
                jobs,
                registry,
                store,
                cancels,
                pending: StdMutex::new(HashMap::new()),
                agents: StdMutex::new(HashMap::new()),
                waiters: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Mints a pre-shared token agents can register with and persists it in
    /// the tokens bucket.
    pub async fn create_agent_token(store: &Store) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        store
            .put(Bucket::Tokens, token.as_bytes(), b"agent")
            .await
            .context("could not persist the agent token")?;
        Ok(token)
    }

    /// Serves the three gRPC services until the token is cancelled.
    pub async fn serve(
        &self,
        addr: SocketAddr,
        tls: Option<(&Path, &Path)>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut builder = Server::builder();
        if let Some((cert, key)) = tls {
            let cert = std::fs::read(cert)
                .with_context(|| format!("could not read TLS certificate {}", cert.display()))?;
            let key = std::fs::read(key)
                .with_context(|| format!("could not read TLS key {}", key.display()))?;
            builder = builder
                .tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
                .context("invalid TLS configuration")?;
        }

        info!("agent plane listening on {}", addr);
        builder
            .add_service(RegistrationServer::new(self.clone()))
            .add_service(CommandPipelineServer::new(self.clone()))
            .add_service(LogWriterServer::new(self.clone()))
            .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
            .await
            .context("agent plane server failed")?;
        Ok(())
    }
}

#[tonic::async_trait]
impl Registration for RemoteServer {
    async fn register(
        &self,
        request: GrpcRequest<api::AgentRegistration>,
    ) -> std::result::Result<Response<api::AgentPrivateToken>, Status> {
        let registration = request.into_inner();

        let known = self
            .state
            .store
            .get(Bucket::Tokens, registration.token.as_bytes())
            .await
            .map_err(|err| Status::internal(err.to_string()))?;
        if known.is_none() {
            warn!("agent registration with unknown token from {}", registration.hostname);
            return Err(Status::unauthenticated("unknown agent token"));
        }

        let agent_id = Uuid::new_v4().to_string();
        let private_token = Uuid::new_v4().to_string();
        self.state
            .pending
            .lock()
            .expect("pending lock poisoned")
            .insert(private_token.clone(), agent_id.clone());

        info!("agent {} registered from host {}", agent_id, registration.hostname);
        Ok(Response::new(api::AgentPrivateToken {
            token: private_token,
        }))
    }
}

#[tonic::async_trait]
impl CommandPipeline for RemoteServer {
    type RegisterAgentStream = ReceiverStream<std::result::Result<api::CommandRequest, Status>>;

    async fn register_agent(
        &self,
        request: GrpcRequest<api::AgentConfiguration>,
    ) -> std::result::Result<Response<Self::RegisterAgentStream>, Status> {
        let configuration = request.into_inner();

        let agent_id = self
            .state
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&configuration.token)
            .ok_or_else(|| Status::unauthenticated("unknown private token"))?;

        let (sink, stream) = mpsc::channel(REQUEST_QUEUE);

        let mut entries: Vec<(String, Arc<dyn Command>)> = Vec::new();
        let mut names = Vec::new();
        for (name, remote) in configuration.commands {
            let command: Arc<dyn Command> = Arc::new(RemoteCommand {
                name: name.clone(),
                opts: remote_opts(&remote),
                sink: sink.clone(),
                state: self.state.clone(),
            });
            names.push(name.clone());
            entries.push((name, command));
        }

        self.state
            .registry
            .register(Kind::Remote, entries)
            .map_err(|err| Status::already_exists(err.to_string()))?;
        self.state
            .agents
            .lock()
            .expect("agents lock poisoned")
            .insert(agent_id.clone(), names.clone());

        info!(
            "agent {} connected with commands [{}], labels {:?}",
            agent_id,
            names.join(", "),
            configuration.labels
        );

        // Any exit path that drops the stream retracts this agent's
        // commands from the catalog.
        let state = self.state.clone();
        let watchdog_sink = sink.clone();
        tokio::spawn(async move {
            watchdog_sink.closed().await;
            state.retract(&agent_id);
        });

        Ok(Response::new(ReceiverStream::new(stream)))
    }

    async fn finish(
        &self,
        request: GrpcRequest<api::CommandFinish>,
    ) -> std::result::Result<Response<api::Empty>, Status> {
        let finish = request.into_inner();
        debug!("agent {} finished job {}", finish.agent_id, finish.job_id);

        let status = if finish.error.is_empty() {
            JobStatus::Successful
        } else {
            JobStatus::Failed
        };

        if !finish.error.is_empty() {
            if let Err(err) = self.state.jobs.set_error(finish.job_id, &finish.error).await {
                debug!("could not record error for job {}: {}", finish.job_id, err);
            }
        }
        if let Err(err) = self.state.jobs.finish(finish.job_id, status).await {
            // The local deadline may have killed the job already.
            debug!("could not finish job {}: {}", finish.job_id, err);
        }

        if let Some(waiter) = self.state.take_waiter(finish.job_id) {
            let _ = waiter.send(FinishPayload {
                content: finish.content,
                error: finish.error,
            });
        }
        Ok(Response::new(api::Empty {}))
    }
}

#[tonic::async_trait]
impl LogWriter for RemoteServer {
    async fn append(
        &self,
        request: GrpcRequest<Streaming<api::LogEntry>>,
    ) -> std::result::Result<Response<api::Empty>, Status> {
        let mut entries = request.into_inner();
        while let Some(entry) = entries.message().await? {
            if let Err(err) = self.state.jobs.append_log(entry.job_id, &entry.line).await {
                warn!("could not append to job {} logs: {}", entry.job_id, err);
            }
        }
        Ok(Response::new(api::Empty {}))
    }

    async fn set_error(
        &self,
        request: GrpcRequest<api::ErrorLogEntry>,
    ) -> std::result::Result<Response<api::Empty>, Status> {
        let entry = request.into_inner();
        if let Err(err) = self.state.jobs.set_error(entry.job_id, &entry.error).await {
            warn!("could not set error on job {}: {}", entry.job_id, err);
        }
        Ok(Response::new(api::Empty {}))
    }
}

fn remote_opts(remote: &api::RemoteCommand) -> CommandOpts {
    let timeout = if remote.timeout <= 0 {
        DEFAULT_COMMAND_TIMEOUT
    } else {
        Duration::from_nanos(remote.timeout as u64)
    };
    CommandOpts {
        auth_strategy: AuthStrategy::parse(&remote.auth_strategy),
        allowed_groups: remote.allowed_groups.clone(),
        channel_strategy: ChannelStrategy::parse(&remote.channel_strategy),
        allowed_channels: remote.allowed_channels.clone(),
        timeout,
        handshake: remote.has_handshake,
        record: true,
        help: remote
            .help
            .as_ref()
            .map(|help| Help {
                summary: help.summary.clone(),
                args: help.args.clone(),
            })
            .unwrap_or_default(),
        ..Default::default()
    }
}

/// A catalog entry owned by a connected agent. Execution pushes the request
/// into the agent's bounded queue and waits for its finish callback.
struct RemoteCommand {
    name: String,
    opts: CommandOpts,
    sink: RequestSink,
    state: Arc<ServerState>,
}

impl RemoteCommand {
    async fn fail_job(&self, job: &Job, error: &str, status: JobStatus) {
        if let Err(err) = self.state.jobs.set_error(job.id, error).await {
            debug!("could not set error on job {}: {}", job.id, err);
        }
        if let Err(err) = self.state.jobs.finish(job.id, status).await {
            debug!("could not finish job {}: {}", job.id, err);
        }
    }
}

#[async_trait]
impl Command for RemoteCommand {
    fn opts(&self) -> &CommandOpts {
        &self.opts
    }

    async fn execute(&self, job: &Job) -> std::result::Result<String, CommandError> {
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.state
            .waiters
            .lock()
            .expect("waiters lock poisoned")
            .insert(job.id, waiter_tx);

        let request = api::CommandRequest {
            command: self.name.clone(),
            args: job.request.args.clone(),
            username: job.request.username.clone(),
            user_id: job.request.user_id.clone(),
            user_link: job.request.user_link.clone(),
            channel: job.request.channel.clone(),
            channel_id: job.request.channel_id.clone(),
            channel_link: job.request.channel_link.clone(),
            is_im: job.request.is_im,
            job_id: job.id,
        };

        // Never block the dispatcher on a slow agent: a full queue fails
        // the request immediately.
        if self.sink.try_send(Ok(request)).is_err() {
            self.state.take_waiter(job.id);
            let message = "agent is not available".to_string();
            self.fail_job(job, &message, JobStatus::Failed).await;
            return Err(CommandError::Execution {
                message,
                output: String::new(),
            });
        }

        let cancel = self.state.cancels.register(job.id);
        let outcome = tokio::select! {
            finish = waiter_rx => match finish {
                Ok(payload) => {
                    if payload.error.is_empty() {
                        Ok(payload.content)
                    } else {
                        Err(CommandError::Execution {
                            message: payload.error,
                            output: payload.content,
                        })
                    }
                }
                Err(_) => {
                    error!("finish waiter for job {} vanished", job.id);
                    self.fail_job(job, "agent connection lost", JobStatus::Unknown).await;
                    Err(CommandError::Execution {
                        message: "agent connection lost".to_string(),
                        output: String::new(),
                    })
                }
            },
            _ = tokio::time::sleep(self.opts.timeout) => {
                self.state.take_waiter(job.id);
                self.fail_job(job, "command timed out", JobStatus::Killed).await;
                Err(CommandError::Timeout { output: String::new() })
            }
            _ = cancel.cancelled() => {
                self.state.take_waiter(job.id);
                self.fail_job(job, "command was killed", JobStatus::Killed).await;
                Err(CommandError::Killed { output: String::new() })
            }
        };
        self.state.cancels.remove(job.id);
        outcome
    }
}
