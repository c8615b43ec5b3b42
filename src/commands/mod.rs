pub mod builtins;
pub mod shell;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::auth::Policy;
use crate::config::{AuthStrategy, ChannelStrategy, CommandConfig, DEFAULT_COMMAND_TIMEOUT};
use crate::jobs::{Cancellations, Job, Jobs, JobsError, Request};
use crate::store::{Bucket, Store, StoreError};

/// Errors produced while executing a command. Failures carry whatever
/// output the command managed to produce so replies can include it.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{message}")]
    Execution { message: String, output: String },
    #[error("command timed out")]
    Timeout { output: String },
    #[error("command was killed")]
    Killed { output: String },
    #[error("{0}")]
    Invalid(String),
    #[error("no job found with id {0}")]
    JobNotFound(u64),
    #[error("{0}")]
    Jobs(#[from] JobsError),
}

impl CommandError {
    /// The partial output collected before the failure, when any.
    pub fn output(&self) -> &str {
        match self {
            CommandError::Execution { output, .. }
            | CommandError::Timeout { output }
            | CommandError::Killed { output } => output,
            _ => "",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Help {
    pub summary: String,
    pub args: Vec<String>,
}

impl Help {
    pub fn new(summary: &str) -> Help {
        Help {
            summary: summary.to_string(),
            args: Vec::new(),
        }
    }

    pub fn with_args(summary: &str, args: &[&str]) -> Help {
        Help {
            summary: summary.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Static configuration every command variant carries.
#[derive(Debug, Clone)]
pub struct CommandOpts {
    pub cmd: String,
    pub args: Vec<String>,
    pub auth_strategy: AuthStrategy,
    pub allowed_groups: Vec<String>,
    pub channel_strategy: ChannelStrategy,
    pub allowed_channels: Vec<String>,
    pub timeout: Duration,
    pub handshake: bool,
    pub record: bool,
    pub templates: HashMap<String, String>,
    pub help: Help,
}

impl Default for CommandOpts {
    fn default() -> CommandOpts {
        CommandOpts {
            cmd: String::new(),
            args: Vec::new(),
            auth_strategy: AuthStrategy::None,
            allowed_groups: Vec::new(),
            channel_strategy: ChannelStrategy::Any,
            allowed_channels: Vec::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            handshake: false,
            record: false,
            templates: HashMap::new(),
            help: Help::default(),
        }
    }
}

impl CommandOpts {
    pub fn from_config(config: &CommandConfig) -> CommandOpts {
        CommandOpts {
            cmd: config.command.clone(),
            args: config.arguments.clone(),
            auth_strategy: config.auth_strategy,
            allowed_groups: config.allowed_groups.clone(),
            channel_strategy: config.channel_strategy,
            allowed_channels: config.allowed_channels.clone(),
            timeout: config.timeout(),
            handshake: !config.no_handshake,
            record: true,
            templates: config.templates.clone(),
            help: Help {
                summary: config.help.summary.clone(),
                args: config.help.args.clone(),
            },
        }
    }

    pub fn policy(&self) -> Policy<'_> {
        Policy {
            auth_strategy: self.auth_strategy,
            allowed_groups: &self.allowed_groups,
            channel_strategy: self.channel_strategy,
            allowed_channels: &self.allowed_channels,
        }
    }
}

/// The single contract all command variants implement. The dispatcher never
/// needs to know which variant it is running.
#[async_trait]
pub trait Command: Send + Sync {
    fn opts(&self) -> &CommandOpts;

    /// Runs the command for an accepted job and returns its combined
    /// output.
    async fn execute(&self, job: &Job) -> Result<String, CommandError>;
}

/// Where a catalog entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Builtin,
    Shell,
    Remote,
}

#[derive(Clone)]
struct CatalogEntry {
    kind: Kind,
    command: Arc<dyn Command>,
}

type Catalog = HashMap<String, CatalogEntry>;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("command {0} is already registered")]
    Duplicate(String),
    #[error("command {0} would shadow a built-in command")]
    ShadowsBuiltin(String),
}

/// A command resolved for a request. When the name went through an alias,
/// `extra_args` carries the arguments baked into the alias target.
#[derive(Clone)]
pub struct Resolved {
    pub name: String,
    pub command: Arc<dyn Command>,
    pub extra_args: Vec<String>,
}

/// The process-wide command catalog.
///
/// The catalog itself is an immutable snapshot behind a read/write lock;
/// every mutation builds a complete replacement, verifies it, and swaps it
/// in. A failed mutation leaves the previous catalog untouched.
pub struct Registry {
    catalog: RwLock<Arc<Catalog>>,
    aliases: Aliases,
}

impl Registry {
    pub fn new(aliases: Aliases) -> Registry {
        Registry {
            catalog: RwLock::new(Arc::new(Catalog::new())),
            aliases,
        }
    }

    fn snapshot(&self) -> Arc<Catalog> {
        self.catalog.read().expect("catalog lock poisoned").clone()
    }

    /// Builds a complete replacement catalog under the write lock and swaps
    /// it in; a failing build leaves the active catalog untouched.
    fn mutate<F>(&self, build: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut Catalog) -> Result<(), RegistryError>,
    {
        let mut guard = self.catalog.write().expect("catalog lock poisoned");
        let mut next = (**guard).clone();
        build(&mut next)?;
        *guard = Arc::new(next);
        Ok(())
    }

    /// Adds commands of one kind. Fails without side effects when any name
    /// is already taken.
    pub fn register(
        &self,
        kind: Kind,
        entries: Vec<(String, Arc<dyn Command>)>,
    ) -> Result<(), RegistryError> {
        self.mutate(|next| {
            for (name, command) in entries {
                match next.get(&name) {
                    Some(existing) if existing.kind == Kind::Builtin => {
                        return Err(RegistryError::ShadowsBuiltin(name));
                    }
                    Some(_) => return Err(RegistryError::Duplicate(name)),
                    None => {
                        next.insert(name, CatalogEntry { kind, command });
                    }
                }
            }
            Ok(())
        })
    }

    /// Removes commands, touching only entries of the given kind.
    pub fn unregister(&self, kind: Kind, names: &[String]) {
        let _ = self.mutate(|next| {
            for name in names {
                if next.get(name).map(|entry| entry.kind) == Some(kind) {
                    next.remove(name);
                }
            }
            Ok(())
        });
    }

    /// Drops everything but the built-in commands.
    pub fn reset(&self) {
        let _ = self.mutate(|next| {
            next.retain(|_, entry| entry.kind == Kind::Builtin);
            Ok(())
        });
    }

    /// Replaces the configured shell commands with the given configuration,
    /// keeping built-ins and currently connected remote commands. The whole
    /// prospective catalog is verified before the swap; on error the active
    /// catalog is left as it was.
    pub fn reload(
        &self,
        commands: &HashMap<String, CommandConfig>,
        jobs: &Jobs,
        cancels: &Cancellations,
    ) -> Result<(), RegistryError> {
        self.mutate(|next| {
            next.retain(|_, entry| entry.kind != Kind::Shell);

            for (name, config) in commands {
                match next.get(name) {
                    Some(entry) if entry.kind == Kind::Builtin => {
                        return Err(RegistryError::ShadowsBuiltin(name.clone()));
                    }
                    Some(_) => return Err(RegistryError::Duplicate(name.clone())),
                    None => {
                        let command = shell::ShellCommand::new(
                            CommandOpts::from_config(config),
                            jobs.clone(),
                            cancels.clone(),
                        );
                        next.insert(
                            name.clone(),
                            CatalogEntry {
                                kind: Kind::Shell,
                                command: Arc::new(command),
                            },
                        );
                    }
                }
            }

            info!("command catalog loaded with {} commands", next.len());
            Ok(())
        })
    }

    fn lookup(&self, name: &str) -> Option<Resolved> {
        self.snapshot().get(name).map(|entry| Resolved {
            name: name.to_string(),
            command: entry.command.clone(),
            extra_args: Vec::new(),
        })
    }

    fn is_builtin(&self, name: &str) -> bool {
        self.snapshot().get(name).map(|entry| entry.kind) == Some(Kind::Builtin)
    }

    /// Resolves the request's command name, trying the user's aliases first.
    /// Built-in names are never resolved through aliases.
    pub async fn find(&self, request: &Request) -> Option<Resolved> {
        if !self.is_builtin(&request.command) {
            if let Ok(Some(target)) = self.aliases.get(&request.user_id, &request.command).await {
                let mut tokens = target.split_whitespace();
                if let Some(name) = tokens.next() {
                    if let Some(mut resolved) = self.lookup(name) {
                        resolved.extra_args = tokens.map(str::to_string).collect();
                        return Some(resolved);
                    }
                }
            }
        }
        self.lookup(&request.command)
    }

    /// Every command in the catalog, sorted by name.
    pub fn all(&self) -> Vec<(String, Arc<dyn Command>)> {
        let mut entries: Vec<(String, Arc<dyn Command>)> = self
            .snapshot()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.command.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// The template overrides a command carries, empty for unknown names.
    pub fn templates(&self, name: &str) -> HashMap<String, String> {
        self.snapshot()
            .get(name)
            .map(|entry| entry.command.opts().templates.clone())
            .unwrap_or_default()
    }

    /// Name and help of every command, for the `help` built-in.
    pub fn help_entries(&self) -> Vec<(String, Help)> {
        self.all()
            .into_iter()
            .map(|(name, command)| (name, command.opts().help.clone()))
            .collect()
    }

    pub fn aliases(&self) -> &Aliases {
        &self.aliases
    }
}

/// Per-user command aliases, a simple KV on the store.
#[derive(Clone)]
pub struct Aliases {
    store: Store,
}

impl Aliases {
    pub fn new(store: Store) -> Aliases {
        Aliases { store }
    }

    fn key(user_id: &str, alias: &str) -> Vec<u8> {
        format!("{}/{}", user_id, alias).into_bytes()
    }

    pub async fn set(&self, user_id: &str, alias: &str, target: &str) -> Result<(), StoreError> {
        self.store
            .put(Bucket::Aliases, &Self::key(user_id, alias), target.as_bytes())
            .await
    }

    pub async fn get(&self, user_id: &str, alias: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(Bucket::Aliases, &Self::key(user_id, alias))
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).to_string()))
    }

    pub async fn remove(&self, user_id: &str, alias: &str) -> Result<(), StoreError> {
        self.store
            .delete(Bucket::Aliases, &Self::key(user_id, alias))
            .await
    }

    /// All aliases of one user as `(alias, target)` pairs, sorted.
    pub async fn list(&self, user_id: &str) -> Result<Vec<(String, String)>, StoreError> {
        let prefix = format!("{}/", user_id).into_bytes();
        let rows = self.store.scan_prefix(Bucket::Aliases, &prefix).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, value)| {
                let key = String::from_utf8_lossy(&key).to_string();
                let alias = key.strip_prefix(&format!("{}/", user_id))?.to_string();
                Some((alias, String::from_utf8_lossy(&value).to_string()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeCommand {
        opts: CommandOpts,
    }

    #[async_trait]
    impl Command for FakeCommand {
        fn opts(&self) -> &CommandOpts {
            &self.opts
        }

        async fn execute(&self, _job: &Job) -> Result<String, CommandError> {
            Ok("ok".to_string())
        }
    }

    fn fake(summary: &str) -> Arc<dyn Command> {
        Arc::new(FakeCommand {
            opts: CommandOpts {
                help: Help::new(summary),
                ..Default::default()
            },
        })
    }

    fn request(command: &str, user_id: &str) -> Request {
        Request {
            command: command.to_string(),
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }

    async fn registry() -> (tempfile::TempDir, Registry, Jobs, Cancellations) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_dir(dir.path()).await.unwrap();
        let jobs = Jobs::new(store.clone());
        let registry = Registry::new(Aliases::new(store));
        (dir, registry, jobs, Cancellations::new())
    }

    fn shell_config(command: &str, timeout: u64) -> CommandConfig {
        CommandConfig {
            command: command.to_string(),
            timeout,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn register_rejects_duplicates_without_side_effects() {
        let (_dir, registry, ..) = registry().await;
        registry
            .register(Kind::Shell, vec![("echo".to_string(), fake("first"))])
            .unwrap();

        let err = registry
            .register(
                Kind::Remote,
                vec![
                    ("other".to_string(), fake("fine")),
                    ("echo".to_string(), fake("dup")),
                ],
            )
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("echo".to_string()));

        // The failed call must not have registered the valid entry either.
        assert!(registry.find(&request("other", "U1")).await.is_none());
    }

    #[tokio::test]
    async fn builtins_cannot_be_shadowed() {
        let (_dir, registry, ..) = registry().await;
        registry
            .register(Kind::Builtin, vec![("help".to_string(), fake("help"))])
            .unwrap();

        let err = registry
            .register(Kind::Shell, vec![("help".to_string(), fake("evil"))])
            .unwrap_err();
        assert_eq!(err, RegistryError::ShadowsBuiltin("help".to_string()));
    }

    #[tokio::test]
    async fn reload_replaces_shell_commands_atomically() {
        let (_dir, registry, jobs, cancels) = registry().await;

        let config_a = HashMap::from([
            ("echo".to_string(), shell_config("echo", 10)),
            ("echo-2".to_string(), shell_config("echo", 10)),
        ]);
        registry.reload(&config_a, &jobs, &cancels).unwrap();
        assert!(registry.find(&request("echo-2", "U1")).await.is_some());

        let config_b = HashMap::from([("echo".to_string(), shell_config("echo", 3))]);
        registry.reload(&config_b, &jobs, &cancels).unwrap();

        assert!(registry.find(&request("echo-2", "U1")).await.is_none());
        let echo = registry.find(&request("echo", "U1")).await.unwrap();
        assert_eq!(echo.command.opts().timeout, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn failed_reload_leaves_previous_catalog_active() {
        let (_dir, registry, jobs, cancels) = registry().await;
        registry
            .register(Kind::Builtin, vec![("version".to_string(), fake("v"))])
            .unwrap();

        let good = HashMap::from([("echo".to_string(), shell_config("echo", 10))]);
        registry.reload(&good, &jobs, &cancels).unwrap();

        let bad = HashMap::from([("version".to_string(), shell_config("echo", 10))]);
        let err = registry.reload(&bad, &jobs, &cancels).unwrap_err();
        assert_eq!(err, RegistryError::ShadowsBuiltin("version".to_string()));

        // find behaves exactly as before the failed call
        let echo = registry.find(&request("echo", "U1")).await.unwrap();
        assert_eq!(echo.command.opts().timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn unregister_only_touches_the_matching_kind() {
        let (_dir, registry, ..) = registry().await;
        registry
            .register(Kind::Shell, vec![("echo".to_string(), fake("shell"))])
            .unwrap();

        registry.unregister(Kind::Remote, &["echo".to_string()]);
        assert!(registry.find(&request("echo", "U1")).await.is_some());

        registry.unregister(Kind::Shell, &["echo".to_string()]);
        assert!(registry.find(&request("echo", "U1")).await.is_none());
    }

    #[tokio::test]
    async fn find_resolves_aliases_per_user() {
        let (_dir, registry, ..) = registry().await;
        registry
            .register(Kind::Shell, vec![("deploy".to_string(), fake("deploy"))])
            .unwrap();

        registry
            .aliases()
            .set("U1", "ship", "deploy production --fast")
            .await
            .unwrap();

        let resolved = registry.find(&request("ship", "U1")).await.unwrap();
        assert_eq!(resolved.name, "deploy");
        assert_eq!(
            resolved.extra_args,
            vec!["production".to_string(), "--fast".to_string()]
        );

        // another user does not share the alias
        assert!(registry.find(&request("ship", "U2")).await.is_none());
    }

    #[tokio::test]
    async fn aliases_never_shadow_builtins() {
        let (_dir, registry, ..) = registry().await;
        registry
            .register(Kind::Builtin, vec![("help".to_string(), fake("help"))])
            .unwrap();
        registry
            .register(Kind::Shell, vec![("deploy".to_string(), fake("deploy"))])
            .unwrap();
        registry.aliases().set("U1", "help", "deploy").await.unwrap();

        let resolved = registry.find(&request("help", "U1")).await.unwrap();
        assert_eq!(resolved.name, "help");
        assert!(resolved.extra_args.is_empty());
    }

    #[tokio::test]
    async fn alias_listing_is_scoped_and_sorted() {
        let (_dir, registry, ..) = registry().await;
        let aliases = registry.aliases();
        aliases.set("U1", "b", "two").await.unwrap();
        aliases.set("U1", "a", "one").await.unwrap();
        aliases.set("U2", "c", "three").await.unwrap();

        let listed = aliases.list("U1").await.unwrap();
        assert_eq!(
            listed,
            vec![
                ("a".to_string(), "one".to_string()),
                ("b".to_string(), "two".to_string())
            ]
        );

        aliases.remove("U1", "a").await.unwrap();
        assert_eq!(aliases.list("U1").await.unwrap().len(), 1);
    }
}
