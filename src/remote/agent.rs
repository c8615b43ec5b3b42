use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, error, info, warn};

use crate::commands::shell::{self, Verdict};
use crate::config::CommandConfig;

use super::api;
use super::api::command_pipeline_client::CommandPipelineClient;
use super::api::log_writer_client::LogWriterClient;
use super::api::registration_client::RegistrationClient;

const DEFAULT_GRPC_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Transport security towards the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    #[default]
    Plain,
    Tls,
}

/// Options the agent connects with.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub server_url: String,
    pub token: String,
    pub labels: HashMap<String, String>,
    pub security_mode: SecurityMode,
    pub grpc_timeout: Option<Duration>,
}

impl AgentOptions {
    fn grpc_timeout(&self) -> Duration {
        self.grpc_timeout.unwrap_or(DEFAULT_GRPC_TIMEOUT)
    }
}

/// Runs the agent loop: connect, register the catalog, execute pushed
/// requests locally and stream the results back. Reconnects with
/// exponential backoff and jitter, re-registering the full catalog.
pub async fn run(
    options: AgentOptions,
    commands: HashMap<String, CommandConfig>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut backoff = Duration::from_secs(1);

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        match connect_and_serve(&options, &commands, &shutdown).await {
            Ok(()) => return Ok(()),
            Err(err) => warn!("agent connection lost: {:#}", err),
        }

        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        let delay = backoff + jitter;
        info!("reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => return Ok(()),
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn connect_and_serve(
    options: &AgentOptions,
    commands: &HashMap<String, CommandConfig>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let channel = connect(options).await?;

    let mut registration = RegistrationClient::new(channel.clone());
    let private_token = registration
        .register(api::AgentRegistration {
            token: options.token.clone(),
            hostname: hostname(),
        })
        .await
        .context("registration was rejected")?
        .into_inner()
        .token;

    let mut pipeline = CommandPipelineClient::new(channel.clone());
    let configuration = api::AgentConfiguration {
        token: private_token,
        commands: commands
            .iter()
            .map(|(name, config)| (name.clone(), remote_command(config)))
            .collect(),
        labels: options.labels.clone(),
        agent_id: String::new(),
    };

    let mut requests = pipeline
        .register_agent(configuration)
        .await
        .context("could not open the command pipeline")?
        .into_inner();

    info!(
        "agent connected to {}, serving {} commands",
        options.server_url,
        commands.len()
    );

    // In-flight executions are flushed before dropping the connection.
    let tracker = TaskTracker::new();
    let outcome = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            message = requests.message() => match message {
                Ok(Some(request)) => {
                    let Some(config) = commands.get(&request.command).cloned() else {
                        warn!("server pushed unknown command {}", request.command);
                        continue;
                    };
                    let channel = channel.clone();
                    tracker.spawn(async move {
                        handle_request(channel, config, request).await;
                    });
                }
                Ok(None) => break Err(anyhow::anyhow!("server closed the pipeline stream")),
                Err(status) => break Err(anyhow::anyhow!("pipeline stream failed: {}", status)),
            },
        }
    };

    tracker.close();
    tracker.wait().await;
    outcome
}

async fn connect(options: &AgentOptions) -> Result<Channel> {
    // Only the connection itself is bounded; the pipeline stream stays
    // open for as long as both sides are alive.
    let mut endpoint = Endpoint::from_shared(options.server_url.clone())
        .with_context(|| format!("invalid server url {}", options.server_url))?
        .connect_timeout(options.grpc_timeout());

    if options.security_mode == SecurityMode::Tls {
        endpoint = endpoint
            .tls_config(ClientTlsConfig::new())
            .context("invalid TLS configuration")?;
    }

    endpoint
        .connect()
        .await
        .with_context(|| format!("could not connect to {}", options.server_url))
}

/// Runs one pushed request through the local shell executor, streaming
/// every line back and closing with the finish callback.
async fn handle_request(channel: Channel, config: CommandConfig, request: api::CommandRequest) {
    let job_id = request.job_id;
    debug!("running remote job {} ({})", job_id, request.command);

    let mut argv = config.arguments.clone();
    argv.extend(request.args.iter().cloned());

    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    let (entry_tx, entry_rx) = mpsc::channel::<api::LogEntry>(64);

    let mut log_writer = LogWriterClient::new(channel.clone());
    let writer = tokio::spawn(async move {
        if let Err(status) = log_writer.append(ReceiverStream::new(entry_rx)).await {
            warn!("could not stream logs for job {}: {}", job_id, status);
        }
    });
    let forwarder = tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if entry_tx
                .send(api::LogEntry { job_id, line })
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let result = shell::run(
        &config.command,
        &argv,
        config.timeout(),
        CancellationToken::new(),
        Some(line_tx),
    )
    .await;

    let _ = forwarder.await;
    let _ = writer.await;

    let error = match &result.verdict {
        Verdict::Success => String::new(),
        Verdict::Failed(message) => message.clone(),
        Verdict::TimedOut => "command timed out".to_string(),
        Verdict::Cancelled => "command was killed".to_string(),
    };

    let mut pipeline = CommandPipelineClient::new(channel);
    if let Err(status) = pipeline
        .finish(api::CommandFinish {
            job_id,
            content: result.output,
            error,
            agent_id: String::new(),
        })
        .await
    {
        error!("could not report job {} as finished: {}", job_id, status);
    }
}

fn remote_command(config: &CommandConfig) -> api::RemoteCommand {
    api::RemoteCommand {
        timeout: config.timeout().as_nanos() as i64,
        auth_strategy: config.auth_strategy.as_str().to_string(),
        allowed_groups: config.allowed_groups.clone(),
        channel_strategy: config.channel_strategy.as_str().to_string(),
        allowed_channels: config.allowed_channels.clone(),
        help: Some(api::Help {
            summary: config.help.summary.clone(),
            args: config.help.args.clone(),
        }),
        has_handshake: !config.no_handshake,
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}
