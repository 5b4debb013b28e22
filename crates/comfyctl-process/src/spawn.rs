use std::collections::VecDeque;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// How many trailing output lines to keep for diagnostics.
pub(crate) const LOG_TAIL_LINES: usize = 20;

/// A bounded ring buffer over a child's interleaved stdout/stderr lines.
///
/// Reader tasks feed lines through a channel; the ring itself only ever holds
/// the most recent [`LOG_TAIL_LINES`] entries and exposes a snapshot for error
/// messages.
#[derive(Debug, Clone, Default)]
pub struct LogRing {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl LogRing {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == LOG_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The retained tail, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }
}

/// A spawned child with attached log readers.
#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
    label: String,
    log: LogRing,
    pump: Option<JoinHandle<()>>,
    readers: Vec<JoinHandle<()>>,
}

impl ChildHandle {
    pub(crate) fn new(mut child: Child, label: String) -> Self {
        let log = LogRing::default();

        let (tx, mut rx) = mpsc::channel::<String>(256);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, tx.clone(), label.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, tx, label.clone()));
        }

        // Single consumer keeps the ring ordering consistent across streams.
        let pump = tokio::spawn({
            let log = log.clone();
            async move {
                while let Some(line) = rx.recv().await {
                    log.push(line);
                }
            }
        });

        Self {
            child,
            label,
            log,
            pump: Some(pump),
            readers,
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// The retained output tail, oldest first.
    pub fn log_snapshot(&self) -> Vec<String> {
        self.log.snapshot()
    }

    /// A handle on the ring buffer that stays valid after the child is reaped.
    pub fn log_ring(&self) -> LogRing {
        self.log.clone()
    }

    /// Check whether the child has exited, without blocking.
    pub fn try_status(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Wait for the child to exit on its own, then join the readers.
    pub async fn wait(mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.join_readers().await;
        Ok(status)
    }

    /// Stop the child: polite signal, then a hard kill once `grace` expires.
    ///
    /// Always reaps the child and joins the reader tasks, so no zombies
    /// survive this call.
    pub async fn terminate(mut self, grace: Duration) -> Option<ExitStatus> {
        let status = match self.child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                self.signal_term();
                match tokio::time::timeout(grace, self.child.wait()).await {
                    Ok(status) => status.ok(),
                    Err(_) => {
                        warn!(
                            "{} did not exit within {}s; killing",
                            self.label,
                            grace.as_secs()
                        );
                        if let Err(err) = self.child.start_kill() {
                            warn!("failed to kill {}: {err}", self.label);
                        }
                        self.child.wait().await.ok()
                    }
                }
            }
        };
        self.join_readers().await;
        debug!("{} stopped", self.label);
        status
    }

    #[cfg(unix)]
    fn signal_term(&self) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        if let Some(id) = self.child.id() {
            #[allow(clippy::cast_possible_wrap)]
            if let Err(err) = kill(Pid::from_raw(id as i32), Signal::SIGTERM) {
                warn!("failed to signal {}: {err}", self.label);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_term(&mut self) {
        // No polite signal on this platform; the grace period still applies
        // before the hard kill.
        let _ = self.child.start_kill();
    }

    async fn join_readers(&mut self) {
        for reader in self.readers.drain(..) {
            let _ = reader.await;
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
    }
}

fn spawn_reader(
    stream: impl AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<String>,
    label: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            trace!("[{label}] {line}");
            // If the consumer is gone the tail no longer matters; keep
            // draining so the child never blocks on a full pipe.
            let _ = tx.send(line).await;
        }
    })
}
