use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as Process;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::jobs::{Cancellations, Job, Jobs, JobStatus};

use super::{Command, CommandError, CommandOpts};

use async_trait::async_trait;

/// How a subprocess run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Success,
    Failed(String),
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct ShellResult {
    pub output: String,
    pub verdict: Verdict,
}

/// Spawns a subprocess and scans its merged stdout and stderr line by line.
///
/// Every scanned line is pushed into `lines` (when given) as it arrives and
/// buffered into the combined output. The run is bounded by `timeout` and by
/// the cancellation token; both kill the process group with SIGKILL.
pub async fn run(
    binary: &str,
    args: &[String],
    timeout: Duration,
    cancel: CancellationToken,
    lines: Option<mpsc::Sender<String>>,
) -> ShellResult {
    let mut child = match Process::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            return ShellResult {
                output: String::new(),
                verdict: Verdict::Failed(format!("could not launch {}: {}", binary, err)),
            };
        }
    };

    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(scan_lines(stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(scan_lines(stderr, line_tx.clone()));
    }
    drop(line_tx);

    let mut output = String::new();
    let mut consume = |line: String, output: &mut String| {
        output.push_str(&line);
        output.push('\n');
        line
    };

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    enum Ending {
        Exited(std::io::Result<std::process::ExitStatus>),
        TimedOut,
        Cancelled,
    }

    let mut lines_done = false;
    let ending = loop {
        tokio::select! {
            maybe = line_rx.recv(), if !lines_done => {
                match maybe {
                    Some(line) => {
                        let line = consume(line, &mut output);
                        if let Some(sink) = &lines {
                            let _ = sink.send(line).await;
                        }
                    }
                    None => lines_done = true,
                }
            }
            status = child.wait() => break Ending::Exited(status),
            _ = &mut deadline => break Ending::TimedOut,
            _ = cancel.cancelled() => break Ending::Cancelled,
        }
    };

    let verdict = match ending {
        Ending::Exited(Ok(status)) if status.success() => Verdict::Success,
        Ending::Exited(Ok(status)) => Verdict::Failed(status.to_string()),
        Ending::Exited(Err(err)) => Verdict::Failed(format!("wait failed: {}", err)),
        Ending::TimedOut => {
            debug!("killing {} after {:?} timeout", binary, timeout);
            if let Err(err) = child.start_kill() {
                warn!("could not kill timed out process {}: {}", binary, err);
            }
            let _ = child.wait().await;
            Verdict::TimedOut
        }
        Ending::Cancelled => {
            debug!("killing {} on cancellation", binary);
            if let Err(err) = child.start_kill() {
                warn!("could not kill cancelled process {}: {}", binary, err);
            }
            let _ = child.wait().await;
            Verdict::Cancelled
        }
    };

    // Drain whatever the readers still hold; they stop at EOF.
    while let Some(line) = line_rx.recv().await {
        let line = consume(line, &mut output);
        if let Some(sink) = &lines {
            let _ = sink.send(line).await;
        }
    }

    ShellResult { output, verdict }
}

async fn scan_lines<R: AsyncRead + Unpin>(reader: R, sink: mpsc::Sender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if sink.send(line).await.is_err() {
            break;
        }
    }
}

/// A command executed locally as a subprocess.
pub struct ShellCommand {
    opts: CommandOpts,
    jobs: Jobs,
    cancels: Cancellations,
}

impl ShellCommand {
    pub fn new(opts: CommandOpts, jobs: Jobs, cancels: Cancellations) -> ShellCommand {
        ShellCommand {
            opts,
            jobs,
            cancels,
        }
    }
}

#[async_trait]
impl Command for ShellCommand {
    fn opts(&self) -> &CommandOpts {
        &self.opts
    }

    async fn execute(&self, job: &Job) -> Result<String, CommandError> {
        let record = self.opts.record && job.id != 0;
        let cancel = if job.id != 0 {
            self.cancels.register(job.id)
        } else {
            CancellationToken::new()
        };

        let mut argv = self.opts.args.clone();
        argv.extend(job.request.args.iter().cloned());

        // One reader feeds both the reply buffer and the persistent log;
        // appends never block the subprocess.
        let (sink, streamed) = if record {
            let (tx, mut rx) = mpsc::channel::<String>(64);
            let jobs = self.jobs.clone();
            let id = job.id;
            let streamed = tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    if let Err(err) = jobs.append_log(id, &line).await {
                        error!("could not append to job {} logs: {}", id, err);
                    }
                }
            });
            (Some(tx), Some(streamed))
        } else {
            (None, None)
        };

        let result = run(&self.opts.cmd, &argv, self.opts.timeout, cancel, sink).await;

        if let Some(streamed) = streamed {
            // All log lines are persisted before the job can finish and the
            // reply goes out.
            let _ = streamed.await;
        }
        self.cancels.remove(job.id);

        let (error_text, status) = match &result.verdict {
            Verdict::Success => (String::new(), JobStatus::Successful),
            Verdict::Failed(message) => (message.clone(), JobStatus::Failed),
            Verdict::TimedOut => ("command timed out".to_string(), JobStatus::Killed),
            Verdict::Cancelled => ("command was killed".to_string(), JobStatus::Killed),
        };

        if record {
            if let Err(err) = self.jobs.set_error(job.id, &error_text).await {
                error!("could not set error on job {}: {}", job.id, err);
            }
            if let Err(err) = self.jobs.finish(job.id, status).await {
                error!("could not finish job {}: {}", job.id, err);
            }
        }

        match result.verdict {
            Verdict::Success => Ok(result.output),
            Verdict::Failed(message) => Err(CommandError::Execution {
                message,
                output: result.output,
            }),
            Verdict::TimedOut => Err(CommandError::Timeout {
                output: result.output,
            }),
            Verdict::Cancelled => Err(CommandError::Killed {
                output: result.output,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use crate::jobs::Request;
    use crate::store::Store;

    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|a| a.to_string()).collect()
    }

    #[tokio::test]
    async fn run_collects_combined_output() {
        let result = run(
            "sh",
            &args(&["-c", "echo out; echo err >&2"]),
            Duration::from_secs(5),
            CancellationToken::new(),
            None,
        )
        .await;

        assert_eq!(result.verdict, Verdict::Success);
        assert!(result.output.contains("out\n"));
        assert!(result.output.contains("err\n"));
    }

    #[tokio::test]
    async fn run_reports_non_zero_exits() {
        let result = run(
            "sh",
            &args(&["-c", "echo oops; exit 3"]),
            Duration::from_secs(5),
            CancellationToken::new(),
            None,
        )
        .await;

        match result.verdict {
            Verdict::Failed(message) => assert!(message.contains("3"), "got: {}", message),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(result.output, "oops\n");
    }

    #[tokio::test]
    async fn run_kills_on_timeout() {
        let started = Instant::now();
        let result = run(
            "sleep",
            &args(&["10"]),
            Duration::from_secs(1),
            CancellationToken::new(),
            None,
        )
        .await;

        assert_eq!(result.verdict, Verdict::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn run_kills_on_cancellation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = run(
            "sleep",
            &args(&["10"]),
            Duration::from_secs(30),
            cancel,
            None,
        )
        .await;

        assert_eq!(result.verdict, Verdict::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn run_reports_spawn_failures() {
        let result = run(
            "surely-not-a-binary-on-this-box",
            &[],
            Duration::from_secs(1),
            CancellationToken::new(),
            None,
        )
        .await;

        match result.verdict {
            Verdict::Failed(message) => assert!(message.contains("could not launch")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    async fn harness() -> (tempfile::TempDir, Jobs, Cancellations) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_dir(dir.path()).await.unwrap();
        (dir, Jobs::new(store), Cancellations::new())
    }

    fn command(jobs: &Jobs, cancels: &Cancellations, cmd: &str, static_args: &[&str], timeout: u64) -> ShellCommand {
        ShellCommand::new(
            CommandOpts {
                cmd: cmd.to_string(),
                args: args(static_args),
                timeout: Duration::from_secs(timeout),
                record: true,
                ..Default::default()
            },
            jobs.clone(),
            cancels.clone(),
        )
    }

    #[tokio::test]
    async fn execute_streams_lines_and_finishes_successful() {
        let (_dir, jobs, cancels) = harness().await;
        let echo = command(&jobs, &cancels, "echo", &["hi"], 5);

        let job = jobs
            .create(Request {
                command: "echo".to_string(),
                args: vec!["world".to_string()],
                username: "pablo".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let output = echo.execute(&job).await.unwrap();
        assert_eq!(output, "hi world\n");

        let stored = jobs.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Successful);

        let log = jobs.get_log(job.id).await.unwrap();
        assert_eq!(log.lines, vec!["hi world"]);
        assert_eq!(log.error, None);
    }

    #[tokio::test]
    async fn execute_marks_failures_with_output() {
        let (_dir, jobs, cancels) = harness().await;
        let boom = command(&jobs, &cancels, "sh", &["-c", "echo bad; exit 1"], 5);

        let job = jobs.create(Request::default()).await.unwrap();
        let err = boom.execute(&job).await.unwrap_err();
        assert_eq!(err.output(), "bad\n");

        let stored = jobs.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(jobs.get_log(job.id).await.unwrap().error.is_some());
    }

    #[tokio::test]
    async fn execute_kills_on_timeout_within_the_deadline() {
        let (_dir, jobs, cancels) = harness().await;
        let sleepy = command(&jobs, &cancels, "sleep", &["10"], 1);

        let job = jobs.create(Request::default()).await.unwrap();
        let started = Instant::now();
        let err = sleepy.execute(&job).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
        assert!(started.elapsed() <= Duration::from_secs(2));

        let stored = jobs.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Killed);
        let end = stored.end_time.expect("killed job has an end time");
        assert!((end - stored.start_time).num_seconds() <= 2);
    }

    #[tokio::test]
    async fn execute_can_be_cancelled_through_the_registry() {
        let (_dir, jobs, cancels) = harness().await;
        let sleepy = command(&jobs, &cancels, "sleep", &["10"], 30);

        let job = jobs.create(Request::default()).await.unwrap();
        let id = job.id;
        let canceller = cancels.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel(id);
        });

        let err = sleepy.execute(&job).await.unwrap_err();
        assert!(matches!(err, CommandError::Killed { .. }));
        assert_eq!(jobs.get(id).await.unwrap().status, JobStatus::Killed);
    }
}
