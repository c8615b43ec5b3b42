use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::Authorizer;
use crate::chat::slack::{ConnectionOpts, SlackAdapter};
use crate::chat::ChatAdapter;
use crate::commands::{builtins, Aliases, Kind, Registry};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, PipelineContext};
use crate::formatter::{Formatter, FormatterHandle};
use crate::jobs::{Cancellations, Jobs};
use crate::logging;
use crate::remote::agent::{self, AgentOptions, SecurityMode};
use crate::remote::server::RemoteServer;
use crate::store::Store;

/// Grace period for in-flight jobs on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG_ERROR: i32 = 1;
pub const EXIT_STARTUP_FAILURE: i32 = 2;
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Parser)]
#[command(name = "meeseeks-box", disable_version_flag = true)]
#[command(about = "A chatops bot that turns chat messages into commands")]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Lower the log level to debug
    #[arg(long)]
    pub debug: bool,

    /// Only answer known users over IM
    #[arg(long)]
    pub stealth: bool,

    /// Print the version and exit
    #[arg(long)]
    pub version: bool,

    /// Run as a remote agent instead of a server
    #[arg(long)]
    pub agent: bool,

    /// Server to connect to when running as an agent
    #[arg(long, default_value = "http://localhost:9696")]
    pub server_url: String,

    /// Pre-shared token used to register as an agent
    #[arg(long)]
    pub token: Option<String>,

    /// Agent labels, as key=value pairs separated by commas
    #[arg(long)]
    pub labels: Option<String>,

    /// TLS certificate for the agent plane listener
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// TLS key for the agent plane listener
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Transport security towards the server: plain or tls
    #[arg(long, default_value = "plain")]
    pub security_mode: String,

    /// Listen address for the agent plane
    #[arg(long, default_value = "0.0.0.0:9696")]
    pub grpc_address: String,

    /// Port of the Slack events receiver
    #[arg(long, default_value_t = 3001)]
    pub events_port: u16,

    /// Mint a pre-shared agent token, print it and exit
    #[arg(long)]
    pub create_agent_token: bool,
}

/// The assembled server-side services.
pub struct App {
    pub store: Store,
    pub jobs: Jobs,
    pub cancels: Cancellations,
    pub aliases: Aliases,
    pub auth: Arc<Authorizer>,
    pub registry: Arc<Registry>,
    pub formatter: Arc<FormatterHandle>,
}

impl App {
    /// Builds every service from the configuration over an opened store.
    /// Fails when the configured commands collide with the built-ins or a
    /// template does not parse.
    pub fn build(config: &Config, store: Store) -> Result<App> {
        let jobs = Jobs::new(store.clone());
        let cancels = Cancellations::new();
        let aliases = Aliases::new(store.clone());
        let auth = Arc::new(Authorizer::new(&config.groups));

        let registry = Arc::new(Registry::new(aliases.clone()));
        let weak = Arc::downgrade(&registry);
        let context = builtins::BuiltinContext {
            jobs: jobs.clone(),
            auth: auth.clone(),
            cancels: cancels.clone(),
            aliases: aliases.clone(),
            catalog: Arc::new(move || {
                weak.upgrade()
                    .map(|registry| registry.help_entries())
                    .unwrap_or_default()
            }),
        };
        registry
            .register(Kind::Builtin, builtins::all(context))
            .map_err(|err| anyhow!("could not register built-in commands: {}", err))?;
        registry
            .reload(&config.commands, &jobs, &cancels)
            .map_err(|err| anyhow!("invalid command configuration: {}", err))?;

        let formatter =
            Formatter::new(&config.format).context("invalid reply templates")?;

        Ok(App {
            store,
            jobs,
            cancels,
            aliases,
            auth,
            registry,
            formatter: Arc::new(FormatterHandle::new(formatter)),
        })
    }

    /// Applies a new configuration atomically: a failing piece leaves the
    /// currently active one in place.
    pub fn reload(&self, config: &Config) {
        match self.registry.reload(&config.commands, &self.jobs, &self.cancels) {
            Ok(()) => info!("command catalog reloaded"),
            Err(err) => {
                error!("configuration reload kept the previous catalog: {}", err);
                return;
            }
        }
        self.auth.reload(&config.groups);
        match Formatter::new(&config.format) {
            Ok(formatter) => self.formatter.swap(formatter),
            Err(err) => error!("configuration reload kept the previous templates: {}", err),
        }
        info!("configuration reloaded");
    }
}

/// Entry point behind `main`; returns the process exit code.
pub async fn run_main() -> i32 {
    let args = Args::parse();

    if args.version {
        println!("meeseeks-box {}", env!("CARGO_PKG_VERSION"));
        return EXIT_OK;
    }

    logging::setup(args.debug);

    let Some(config_path) = args.config.clone() else {
        error!("a configuration file is required, pass it with --config");
        return EXIT_CONFIG_ERROR;
    };
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("{:#}", err);
            return EXIT_CONFIG_ERROR;
        }
    };

    if args.create_agent_token {
        return match create_agent_token(&config).await {
            Ok(token) => {
                println!("{}", token);
                EXIT_OK
            }
            Err(err) => {
                error!("{:#}", err);
                return EXIT_STARTUP_FAILURE;
            }
        };
    }

    if args.agent {
        run_agent(args, config).await
    } else {
        run_server(args, config, config_path).await
    }
}

async fn create_agent_token(config: &Config) -> Result<String> {
    let store = Store::open(&config.db)
        .await
        .context("could not open the database")?;
    RemoteServer::create_agent_token(&store).await
}

async fn run_agent(args: Args, config: Config) -> i32 {
    let token = match args.token {
        Some(token) => token,
        None => {
            error!("an agent needs a pre-shared token, pass it with --token");
            return EXIT_CONFIG_ERROR;
        }
    };
    let security_mode = match args.security_mode.as_str() {
        "plain" => SecurityMode::Plain,
        "tls" => SecurityMode::Tls,
        other => {
            error!("unknown security mode {}, use plain or tls", other);
            return EXIT_CONFIG_ERROR;
        }
    };

    let options = AgentOptions {
        server_url: args.server_url,
        token,
        labels: parse_labels(args.labels.as_deref()),
        security_mode,
        grpc_timeout: None,
    };

    let shutdown = CancellationToken::new();
    let mut agent = tokio::spawn(agent::run(options, config.commands, shutdown.clone()));

    let mut interrupted = false;
    let outcome = tokio::select! {
        result = &mut agent => result,
        interrupt = wait_for_shutdown_signal() => {
            interrupted = interrupt;
            shutdown.cancel();
            agent.await
        }
    };

    match outcome {
        Ok(Ok(())) => {
            if interrupted {
                EXIT_INTERRUPTED
            } else {
                EXIT_OK
            }
        }
        Ok(Err(err)) => {
            error!("{:#}", err);
            EXIT_STARTUP_FAILURE
        }
        Err(err) => {
            error!("agent task failed: {}", err);
            EXIT_STARTUP_FAILURE
        }
    }
}

async fn run_server(args: Args, config: Config, config_path: PathBuf) -> i32 {
    let store = match Store::open(&config.db).await {
        Ok(store) => store,
        Err(err) => {
            error!("could not open the database: {}", err);
            return EXIT_STARTUP_FAILURE;
        }
    };

    let app = match App::build(&config, store) {
        Ok(app) => app,
        Err(err) => {
            error!("{:#}", err);
            return EXIT_CONFIG_ERROR;
        }
    };

    let grpc_address = match args.grpc_address.parse() {
        Ok(address) => address,
        Err(err) => {
            error!("invalid agent plane address {}: {}", args.grpc_address, err);
            return EXIT_CONFIG_ERROR;
        }
    };

    let slack_token = std::env::var("SLACK_TOKEN").unwrap_or_default();
    let adapter = match SlackAdapter::connect(
        ConnectionOpts {
            token: slack_token,
            stealth: args.stealth,
            events_port: args.events_port,
        },
        app.auth.clone(),
    )
    .await
    {
        Ok(adapter) => Arc::new(adapter),
        Err(err) => {
            error!("{:#}", err);
            return EXIT_STARTUP_FAILURE;
        }
    };

    // Agent plane
    let shutdown = CancellationToken::new();
    let remote = RemoteServer::new(
        app.jobs.clone(),
        app.registry.clone(),
        app.store.clone(),
        app.cancels.clone(),
    );
    {
        let remote = remote.clone();
        let shutdown = shutdown.clone();
        let tls = args.tls_cert.clone().zip(args.tls_key.clone());
        tokio::spawn(async move {
            let tls = tls.as_ref().map(|(cert, key)| (cert.as_path(), key.as_path()));
            if let Err(err) = remote.serve(grpc_address, tls, shutdown).await {
                error!("{:#}", err);
            }
        });
    }

    // Message pipeline
    let dispatcher = Dispatcher::start(
        PipelineContext {
            registry: app.registry.clone(),
            auth: app.auth.clone(),
            jobs: app.jobs.clone(),
            formatter: app.formatter.clone(),
            adapter: Arc::new(adapter.clone()),
            cancels: app.cancels.clone(),
        },
        config.pool_size(),
    );

    let listener = {
        let adapter = adapter.clone();
        let sender = dispatcher.sender();
        tokio::spawn(async move {
            if let Err(err) = adapter.listen(sender).await {
                error!("chat listener stopped: {:#}", err);
            }
        })
    };

    info!("meeseeks-box {} is up", env!("CARGO_PKG_VERSION"));

    // SIGHUP reloads, SIGINT/SIGTERM shut down gracefully.
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(err) => {
            error!("could not install the SIGHUP handler: {}", err);
            return EXIT_STARTUP_FAILURE;
        }
    };

    let interrupted = loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration");
                match Config::load(&config_path) {
                    Ok(config) => app.reload(&config),
                    Err(err) => error!("configuration reload skipped: {:#}", err),
                }
            }
            interrupted = wait_for_shutdown_signal() => break interrupted,
        }
    };

    info!("shutting down");
    listener.abort();
    dispatcher.shutdown(SHUTDOWN_GRACE).await;
    shutdown.cancel();

    if interrupted {
        EXIT_INTERRUPTED
    } else {
        EXIT_OK
    }
}

/// Waits for SIGINT or SIGTERM; returns whether it was an interrupt.
async fn wait_for_shutdown_signal() -> bool {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            warn!("could not install the SIGTERM handler: {}", err);
            let _ = tokio::signal::ctrl_c().await;
            return true;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = terminate.recv() => false,
    }
}

fn parse_labels(raw: Option<&str>) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    let Some(raw) = raw else {
        return labels;
    };
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => {
                labels.insert(key.to_string(), value.to_string());
            }
            None => warn!("ignoring malformed label {}", pair),
        }
    }
    labels
}
