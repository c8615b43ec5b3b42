use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::store::{id_key, Bucket};

use super::{Jobs, JobsError, JobStatus, Result, TailEvent};

const TAIL_BUFFER: usize = 256;

/// The recorded output of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobLog {
    pub lines: Vec<String>,
    pub error: Option<String>,
    pub status: JobStatus,
}

impl JobLog {
    pub fn output(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

impl Jobs {
    /// Appends one output line to the job's log. Fails once the job has
    /// reached a terminal status.
    pub async fn append_log(&self, id: u64, line: &str) -> Result<()> {
        let _guard = self.state.lock().await;
        let job = self.get(id).await?;
        if job.status.is_terminal() {
            return Err(JobsError::AlreadyFinished(id));
        }

        let line = line.strip_suffix('\n').unwrap_or(line);
        let mut chunk = line.as_bytes().to_vec();
        chunk.push(b'\n');
        self.store.append(Bucket::Logs, &id_key(id), &chunk).await?;

        let tails = self.tails.lock().expect("tails lock poisoned");
        if let Some(sender) = tails.get(&id) {
            let _ = sender.send(TailEvent::Line(line.to_string()));
        }
        Ok(())
    }

    /// Records the job's error text; last write wins until the job becomes
    /// terminal.
    pub async fn set_error(&self, id: u64, error: &str) -> Result<()> {
        let _guard = self.state.lock().await;
        let job = self.get(id).await?;
        if job.status.is_terminal() {
            return Err(JobsError::AlreadyFinished(id));
        }
        self.store
            .put(Bucket::LogErrors, &id_key(id), error.as_bytes())
            .await?;
        Ok(())
    }

    /// Returns the recorded lines, error and current status of a job.
    pub async fn get_log(&self, id: u64) -> Result<JobLog> {
        let job = self.get(id).await?;

        let lines = match self.store.get(Bucket::Logs, &id_key(id)).await? {
            Some(raw) => String::from_utf8_lossy(&raw)
                .split_terminator('\n')
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };

        let error = self
            .store
            .get(Bucket::LogErrors, &id_key(id))
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).to_string())
            .filter(|text| !text.is_empty());

        Ok(JobLog {
            lines,
            error,
            status: job.status,
        })
    }

    /// Streams the job's log lines as they are appended.
    ///
    /// Already recorded lines are replayed first; the stream completes when
    /// the job reaches a terminal status.
    pub async fn tail(&self, id: u64) -> Result<ReceiverStream<String>> {
        let (tx, rx) = mpsc::channel(TAIL_BUFFER);

        // Snapshot and subscription happen under the state lock so no line
        // appended afterwards can be missed or duplicated.
        let guard = self.state.lock().await;
        let log = self.get_log(id).await?;

        let mut events = if log.status.is_terminal() {
            None
        } else {
            let mut tails = self.tails.lock().expect("tails lock poisoned");
            let sender = tails
                .entry(id)
                .or_insert_with(|| broadcast::channel(TAIL_BUFFER).0);
            Some(sender.subscribe())
        };
        drop(guard);

        tokio::spawn(async move {
            for line in log.lines {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            let Some(events) = events.as_mut() else {
                return;
            };
            loop {
                match events.recv().await {
                    Ok(TailEvent::Line(line)) => {
                        if tx.send(line).await.is_err() {
                            return;
                        }
                    }
                    Ok(TailEvent::Done) | Err(broadcast::error::RecvError::Closed) => return,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("tail of job {} lagged, skipped {} lines", id, missed);
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}
