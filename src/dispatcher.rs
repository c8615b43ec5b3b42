use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::auth::Authorizer;
use crate::chat::{ChatAdapter, ChatMessage};
use crate::commands::{CommandError, Registry, Resolved};
use crate::formatter::{FormatterHandle, Payload, Reply, ReplyKind};
use crate::jobs::{Cancellations, Job, Jobs, JobStatus, Request};
use crate::parser;

/// Capacity of the inbound message channel; overflow drops messages.
pub const MESSAGE_BUFFER: usize = 64;

/// Everything one worker needs to take a message through the pipeline.
#[derive(Clone)]
pub struct PipelineContext {
    pub registry: Arc<Registry>,
    pub auth: Arc<Authorizer>,
    pub jobs: Jobs,
    pub formatter: Arc<FormatterHandle>,
    pub adapter: Arc<dyn ChatAdapter>,
    pub cancels: Cancellations,
}

/// The worker pool that consumes chat messages and executes commands.
///
/// Command failures and panics never take a worker down; every accepted
/// command produces exactly one terminal reply.
pub struct Dispatcher {
    sender: mpsc::Sender<ChatMessage>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    cancels: Cancellations,
}

impl Dispatcher {
    /// Spawns `pool` workers consuming from a bounded message channel.
    pub fn start(ctx: PipelineContext, pool: usize) -> Dispatcher {
        let (sender, receiver) = mpsc::channel(MESSAGE_BUFFER);
        let receiver = Arc::new(Mutex::new(receiver));
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let cancels = ctx.cancels.clone();

        info!("starting dispatcher with {} workers", pool);
        for _ in 0..pool {
            let receiver = receiver.clone();
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                loop {
                    let message = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        message = async { receiver.lock().await.recv().await } => message,
                    };
                    match message {
                        Some(message) => process(&ctx, message).await,
                        None => break,
                    }
                }
            });
        }

        Dispatcher {
            sender,
            tracker,
            shutdown,
            cancels,
        }
    }

    /// The inbound end chat adapters push matched messages into.
    pub fn sender(&self) -> mpsc::Sender<ChatMessage> {
        self.sender.clone()
    }

    /// Stops accepting work, waits up to `grace` for in-flight jobs, then
    /// cancels whatever is still running.
    pub async fn shutdown(self, grace: Duration) {
        info!("dispatcher shutting down, waiting up to {:?} for in-flight jobs", grace);
        drop(self.sender);
        self.shutdown.cancel();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!("grace period expired, cancelling remaining jobs");
            self.cancels.cancel_all();
            self.tracker.wait().await;
        }
    }
}

async fn process(ctx: &PipelineContext, message: ChatMessage) {
    let tokens = match parser::parse(&message.text) {
        Ok(tokens) => tokens,
        Err(err) => {
            debug!("could not parse message '{}': {}", message.text, err);
            let request = build_request(ctx, &message, message.text.clone(), Vec::new());
            post(ctx, unknown_command_reply(ctx, &request)).await;
            return;
        }
    };

    let Some((name, args)) = tokens.split_first() else {
        return;
    };

    let request = build_request(ctx, &message, name.clone(), args.to_vec());
    let Some(resolved) = ctx.registry.find(&request).await else {
        debug!("unknown command {} from {}", request.command, request.username);
        post(ctx, unknown_command_reply(ctx, &request)).await;
        return;
    };

    // Aliases may rename the command and bake in extra arguments; the
    // request the job records is the resolved one.
    let request = resolve_request(request, &resolved);
    let opts = resolved.command.opts();

    if let Err(err) = ctx.auth.check(&request, opts.policy()) {
        debug!(
            "user {} is not authorized to run {}: {}",
            request.username, request.command, err
        );
        let payload = Payload::from([("error".to_string(), json!(err.to_string()))]);
        post(
            ctx,
            render(ctx, ReplyKind::Unauthorized, &request, payload),
        )
        .await;
        return;
    }

    if opts.handshake {
        post(ctx, render(ctx, ReplyKind::Handshake, &request, Payload::new())).await;
    }

    let job = if opts.record {
        match ctx.jobs.create(request.clone()).await {
            Ok(job) => job,
            Err(err) => {
                error!("could not create job for {}: {}", request.command, err);
                let payload = Payload::from([
                    ("error".to_string(), json!("could not allocate a job")),
                    ("output".to_string(), json!("")),
                ]);
                post(ctx, render(ctx, ReplyKind::Failure, &request, payload)).await;
                return;
            }
        }
    } else {
        ctx.jobs.null_job(request.clone())
    };

    let outcome = execute_isolated(ctx, resolved, job).await;
    let (kind, payload) = match outcome {
        Ok(output) => (
            ReplyKind::Success,
            Payload::from([("output".to_string(), json!(output))]),
        ),
        Err(err) => (
            ReplyKind::Failure,
            Payload::from([
                ("error".to_string(), json!(err.to_string())),
                ("output".to_string(), json!(err.output())),
            ]),
        ),
    };
    post(ctx, render(ctx, kind, &request, payload)).await;
}

/// Runs the command in its own task so a panicking executor is contained
/// and reported as a failed job.
async fn execute_isolated(
    ctx: &PipelineContext,
    resolved: Resolved,
    job: Job,
) -> Result<String, CommandError> {
    let record = resolved.command.opts().record && job.id != 0;
    let id = job.id;
    let handle = tokio::spawn(async move { resolved.command.execute(&job).await });

    match handle.await {
        Ok(result) => result,
        Err(join_err) => {
            error!("command execution panicked on job {}: {}", id, join_err);
            if record {
                if let Err(err) = ctx.jobs.set_error(id, "command panicked").await {
                    error!("could not set error on job {}: {}", id, err);
                }
                if let Err(err) = ctx.jobs.finish(id, JobStatus::Failed).await {
                    error!("could not finish job {}: {}", id, err);
                }
            }
            Err(CommandError::Execution {
                message: "command panicked".to_string(),
                output: String::new(),
            })
        }
    }
}

fn build_request(
    ctx: &PipelineContext,
    message: &ChatMessage,
    command: String,
    args: Vec<String>,
) -> Request {
    Request {
        command,
        args,
        username: message.username.clone(),
        user_id: message.user_id.clone(),
        user_link: ctx.adapter.get_user_link(&message.user_id),
        channel: message.channel.clone(),
        channel_id: message.channel_id.clone(),
        channel_link: ctx.adapter.get_channel_link(&message.channel_id),
        is_im: message.is_im,
    }
}

fn resolve_request(request: Request, resolved: &Resolved) -> Request {
    if resolved.name == request.command && resolved.extra_args.is_empty() {
        return request;
    }
    let mut args = resolved.extra_args.clone();
    args.extend(request.args);
    Request {
        command: resolved.name.clone(),
        args,
        ..request
    }
}

fn unknown_command_reply(ctx: &PipelineContext, request: &Request) -> Option<Reply> {
    render(ctx, ReplyKind::UnknownCommand, request, Payload::new())
}

/// Renders a reply; template failures are logged and swallowed so the
/// dispatcher never crashes over formatting.
fn render(
    ctx: &PipelineContext,
    kind: ReplyKind,
    request: &Request,
    payload: Payload,
) -> Option<Reply> {
    let formatter = ctx.formatter.current();
    let overrides = ctx.registry.templates(&request.command);
    match formatter.reply(kind, request, &overrides, payload) {
        Ok(reply) => Some(reply),
        Err(err) => {
            error!("could not render {} reply: {}", request.command, err);
            None
        }
    }
}

/// Posts a reply in order; adapter failures are logged, never fatal.
async fn post(ctx: &PipelineContext, reply: Option<Reply>) {
    let Some(reply) = reply else { return };
    if let Err(err) = ctx.adapter.reply(&reply).await {
        error!("could not post reply on {}: {}", reply.channel_id, err);
    }
}
