use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::Authorizer;
use crate::config::AuthStrategy;
use crate::formatter::template::humanize_time;
use crate::jobs::{Cancellations, Job, JobFilter, Jobs, JobsError};

use super::{Aliases, Command, CommandError, CommandOpts, Help};

const DEFAULT_JOBS_LIMIT: usize = 5;
const DEFAULT_TAIL_LINES: usize = 5;

/// Everything the built-in commands need to do their work. The catalog is
/// reached through a lookup closure so the registry and the help command do
/// not own each other.
#[derive(Clone)]
pub struct BuiltinContext {
    pub jobs: Jobs,
    pub auth: Arc<Authorizer>,
    pub cancels: Cancellations,
    pub aliases: Aliases,
    pub catalog: Arc<dyn Fn() -> Vec<(String, Help)> + Send + Sync>,
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Help,
    Version,
    Groups,
    Jobs,
    Audit,
    Last,
    AuditJob,
    Logs,
    Tail,
    Cancel,
    Kill,
    Alias,
}

struct Builtin {
    opts: CommandOpts,
    action: Action,
    ctx: BuiltinContext,
}

#[async_trait]
impl Command for Builtin {
    fn opts(&self) -> &CommandOpts {
        &self.opts
    }

    async fn execute(&self, job: &Job) -> Result<String, CommandError> {
        match self.action {
            Action::Help => self.help(),
            Action::Version => Ok(format!("meeseeks-box version {}", env!("CARGO_PKG_VERSION"))),
            Action::Groups => self.groups(),
            Action::Jobs => self.jobs(job, Some(&job.request.username)).await,
            Action::Audit => self.jobs(job, None).await,
            Action::Last => self.last(job).await,
            Action::AuditJob => self.job_detail(job, false).await,
            Action::Logs => self.job_detail(job, true).await,
            Action::Tail => self.tail(job).await,
            Action::Cancel => self.cancel(job, true).await,
            Action::Kill => self.cancel(job, false).await,
            Action::Alias => self.alias(job).await,
        }
    }
}

impl Builtin {
    fn help(&self) -> Result<String, CommandError> {
        let mut out = String::new();
        for (name, help) in (self.ctx.catalog)() {
            if help.summary.is_empty() {
                let _ = writeln!(out, "- {}", name);
            } else {
                let _ = writeln!(out, "- {}: {}", name, help.summary);
            }
        }
        Ok(out)
    }

    fn groups(&self) -> Result<String, CommandError> {
        let mut out = String::new();
        for (group, members) in self.ctx.auth.list() {
            let _ = writeln!(out, "- {}: {}", group, members.join(", "));
        }
        Ok(out)
    }

    async fn jobs(&self, job: &Job, username: Option<&str>) -> Result<String, CommandError> {
        let limit = match job.request.args.first() {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| CommandError::Invalid(format!("invalid limit {}", raw)))?,
            None => DEFAULT_JOBS_LIMIT,
        };

        let jobs = self
            .ctx
            .jobs
            .filter(JobFilter {
                limit,
                username: username.map(str::to_string),
                ..Default::default()
            })
            .await?;

        if jobs.is_empty() {
            return Ok("No jobs found\n".to_string());
        }

        let mut out = String::new();
        for job in jobs {
            let _ = writeln!(out, "{}", job_line(&job));
        }
        Ok(out)
    }

    async fn last(&self, job: &Job) -> Result<String, CommandError> {
        let jobs = self
            .ctx
            .jobs
            .filter(JobFilter {
                limit: 1,
                username: Some(job.request.username.clone()),
                ..Default::default()
            })
            .await?;

        let last = jobs
            .first()
            .ok_or_else(|| CommandError::Invalid("no jobs executed yet".to_string()))?;
        let log = self.ctx.jobs.get_log(last.id).await?;

        let mut out = format!("{}\n", job_line(last));
        out.push_str(&log.output());
        if let Some(error) = log.error {
            let _ = writeln!(out, "error: {}", error);
        }
        Ok(out)
    }

    /// Shows one job by id; `own_only` restricts it to the calling user.
    async fn job_detail(&self, job: &Job, own_only: bool) -> Result<String, CommandError> {
        let id = job_id_arg(job)?;
        let target = self.get_visible(id, own_only, &job.request.username).await?;
        let log = self.ctx.jobs.get_log(target.id).await?;

        let mut out = format!("{}\n", job_line(&target));
        out.push_str(&log.output());
        if let Some(error) = log.error {
            let _ = writeln!(out, "error: {}", error);
        }
        Ok(out)
    }

    async fn tail(&self, job: &Job) -> Result<String, CommandError> {
        let target = match job.request.args.first() {
            Some(raw) => {
                let id = raw
                    .parse::<u64>()
                    .map_err(|_| CommandError::Invalid(format!("invalid job id {}", raw)))?;
                self.get_visible(id, true, &job.request.username).await?
            }
            None => {
                let jobs = self
                    .ctx
                    .jobs
                    .filter(JobFilter {
                        limit: 1,
                        username: Some(job.request.username.clone()),
                        ..Default::default()
                    })
                    .await?;
                jobs.into_iter()
                    .next()
                    .ok_or_else(|| CommandError::Invalid("no jobs executed yet".to_string()))?
            }
        };

        let log = self.ctx.jobs.get_log(target.id).await?;
        let start = log.lines.len().saturating_sub(DEFAULT_TAIL_LINES);
        let mut out = String::new();
        for line in &log.lines[start..] {
            let _ = writeln!(out, "{}", line);
        }
        Ok(out)
    }

    async fn cancel(&self, job: &Job, own_only: bool) -> Result<String, CommandError> {
        let id = job_id_arg(job)?;
        self.get_visible(id, own_only, &job.request.username).await?;

        if !self.ctx.cancels.cancel(id) {
            return Err(CommandError::Invalid(format!("job {} is not running", id)));
        }
        Ok(format!("cancelling job {}\n", id))
    }

    async fn alias(&self, job: &Job) -> Result<String, CommandError> {
        let args = &job.request.args;
        let user_id = &job.request.user_id;

        match args.first().map(String::as_str) {
            None | Some("list") => {
                let aliases = self
                    .ctx
                    .aliases
                    .list(user_id)
                    .await
                    .map_err(JobsError::Persistence)?;
                if aliases.is_empty() {
                    return Ok("No aliases yet\n".to_string());
                }
                let mut out = String::new();
                for (alias, target) in aliases {
                    let _ = writeln!(out, "- {}: {}", alias, target);
                }
                Ok(out)
            }
            Some("add") => {
                let alias = args
                    .get(1)
                    .ok_or_else(|| CommandError::Invalid("usage: alias add <alias> <command...>".to_string()))?;
                let target = args[2..].join(" ");
                if target.is_empty() {
                    return Err(CommandError::Invalid(
                        "usage: alias add <alias> <command...>".to_string(),
                    ));
                }
                self.ctx
                    .aliases
                    .set(user_id, alias, &target)
                    .await
                    .map_err(JobsError::Persistence)?;
                Ok(format!("added alias {} for {}\n", alias, target))
            }
            Some("rm") => {
                let alias = args
                    .get(1)
                    .ok_or_else(|| CommandError::Invalid("usage: alias rm <alias>".to_string()))?;
                self.ctx
                    .aliases
                    .remove(user_id, alias)
                    .await
                    .map_err(JobsError::Persistence)?;
                Ok(format!("removed alias {}\n", alias))
            }
            Some(other) => Err(CommandError::Invalid(format!(
                "unknown alias subcommand {}",
                other
            ))),
        }
    }

    /// Loads a job, hiding other users' jobs when `own_only` is set.
    async fn get_visible(
        &self,
        id: u64,
        own_only: bool,
        username: &str,
    ) -> Result<Job, CommandError> {
        let target = match self.ctx.jobs.get(id).await {
            Ok(job) => job,
            Err(JobsError::NotFound(_)) => return Err(CommandError::JobNotFound(id)),
            Err(err) => return Err(err.into()),
        };
        if own_only && target.request.username != username {
            return Err(CommandError::JobNotFound(id));
        }
        Ok(target)
    }
}

fn job_id_arg(job: &Job) -> Result<u64, CommandError> {
    let raw = job
        .request
        .args
        .first()
        .ok_or_else(|| CommandError::Invalid("no job id given".to_string()))?;
    raw.parse::<u64>()
        .map_err(|_| CommandError::Invalid(format!("invalid job id {}", raw)))
}

fn job_line(job: &Job) -> String {
    format!(
        "*{}* - {} - *{}* by *{}* in *{}* - *{}*",
        job.id,
        humanize_time(job.start_time),
        job.request.command,
        job.request.username,
        if job.request.channel.is_empty() {
            "IM"
        } else {
            job.request.channel.as_str()
        },
        job.status
    )
}

fn opts(auth: AuthStrategy, help: Help) -> CommandOpts {
    CommandOpts {
        auth_strategy: auth,
        help,
        record: false,
        handshake: false,
        ..Default::default()
    }
}

/// Builds the full set of built-in commands.
pub fn all(ctx: BuiltinContext) -> Vec<(String, Arc<dyn Command>)> {
    let builtin = |name: &str, action: Action, auth: AuthStrategy, help: Help| {
        let command: Arc<dyn Command> = Arc::new(Builtin {
            opts: opts(auth, help),
            action,
            ctx: ctx.clone(),
        });
        (name.to_string(), command)
    };

    vec![
        builtin(
            "help",
            Action::Help,
            AuthStrategy::Any,
            Help::new("prints all the known commands and their help"),
        ),
        builtin(
            "version",
            Action::Version,
            AuthStrategy::Any,
            Help::new("prints the running version"),
        ),
        builtin(
            "groups",
            Action::Groups,
            AuthStrategy::None,
            Help::new("prints the configured groups"),
        ),
        builtin(
            "jobs",
            Action::Jobs,
            AuthStrategy::Any,
            Help::with_args(
                "shows the last jobs executed by the calling user",
                &["limit: how many jobs to show, 5 by default"],
            ),
        ),
        builtin(
            "audit",
            Action::Audit,
            AuthStrategy::None,
            Help::with_args(
                "shows the last jobs executed by all the users",
                &["limit: how many jobs to show, 5 by default"],
            ),
        ),
        builtin(
            "last",
            Action::Last,
            AuthStrategy::Any,
            Help::new("shows the output of the last job executed by the calling user"),
        ),
        builtin(
            "auditjob",
            Action::AuditJob,
            AuthStrategy::None,
            Help::with_args("shows one job by id from any user", &["jobID: the job to show"]),
        ),
        builtin(
            "logs",
            Action::Logs,
            AuthStrategy::Any,
            Help::with_args("shows the logs of one of the calling user's jobs", &[
                "jobID: the job to show",
            ]),
        ),
        builtin(
            "tail",
            Action::Tail,
            AuthStrategy::Any,
            Help::with_args(
                "shows the last log lines of the calling user's latest job",
                &["jobID: optional job to tail instead of the latest"],
            ),
        ),
        builtin(
            "cancel",
            Action::Cancel,
            AuthStrategy::Any,
            Help::with_args("cancels a running job owned by the calling user", &[
                "jobID: the job to cancel",
            ]),
        ),
        builtin(
            "kill",
            Action::Kill,
            AuthStrategy::None,
            Help::with_args("cancels a running job from any user", &["jobID: the job to kill"]),
        ),
        builtin(
            "alias",
            Action::Alias,
            AuthStrategy::Any,
            Help::with_args("manages the calling user's command aliases", &[
                "add <alias> <command...>",
                "rm <alias>",
                "list",
            ]),
        ),
    ]
}
