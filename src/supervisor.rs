use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SingboxLogMode;
use crate::error::{CoreError, Result};

/// Bounded FIFO of forwarded log lines, drop-oldest on overflow. Mutex-
/// guarded; snapshots are returned by value, never shared references.
#[derive(Clone)]
pub struct LogRing {
    inner: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(4096)))), capacity }
    }

    async fn push(&self, line: String) {
        const MAX_LINE_BYTES: usize = 1024 * 1024;
        let line = if line.len() > MAX_LINE_BYTES { line[..MAX_LINE_BYTES].to_string() } else { line };
        let mut guard = self.inner.lock().await;
        guard.push_back(line);
        if guard.len() > self.capacity {
            guard.pop_front();
        }
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.inner.lock().await.iter().cloned().collect()
    }

    pub async fn tail(&self, n: usize) -> String {
        let guard = self.inner.lock().await;
        let start = guard.len().saturating_sub(n);
        guard.iter().skip(start).cloned().collect::<Vec<_>>().join("\n")
    }

    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }
}

/// Supervises at most one live sing-box child process: spawn, forward
/// stdout/stderr into a `LogRing`, stop (interrupt then kill), reap.
pub struct EngineSupervisor {
    child: Mutex<Option<Child>>,
    logs: LogRing,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    log_mode: SingboxLogMode,
}

const STDERR_TAIL_LINES: usize = 40;

impl EngineSupervisor {
    pub fn new(log_capacity: usize, log_mode: SingboxLogMode) -> Self {
        Self {
            child: Mutex::new(None),
            logs: LogRing::new(log_capacity),
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
            log_mode,
        }
    }

    pub fn logs(&self) -> &LogRing {
        &self.logs
    }

    /// Spawns `binary_path run -c config_path`, attaching log-forwarding
    /// tasks for stdout and stderr.
    pub async fn start(&self, binary_path: &Path, config_path: &Path) -> Result<()> {
        let mut command = Command::new(binary_path);
        command.arg("run").arg("-c").arg(config_path);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        // Attach the child to a job object / process group that the OS
        // tears down with the parent, so a killed-without-cleanup parent
        // cannot leave a stray engine running.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::EngineStartFailure(e.to_string()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        if let Some(stdout) = stdout {
            spawn_log_forwarder(stdout, self.logs.clone(), None, self.log_mode);
        }
        if let Some(stderr) = stderr {
            spawn_log_forwarder(stderr, self.logs.clone(), Some(self.stderr_tail.clone()), self.log_mode);
        }

        *self.child.lock().await = Some(child);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// True once a spawned child has exited. A supervisor with no child at
    /// all (never started, or already reaped by `stop`) has nothing to have
    /// exited, so this is not simply `!is_running()`.
    pub async fn has_exited(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().await.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Sends an interrupt, escalates to kill after the grace period,
    /// always reaps.
    pub async fn stop(&self, grace: Duration) {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else { return };

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGINT);
                }
            }
        }

        let waited = tokio::time::timeout(grace, child.wait()).await;
        match waited {
            Ok(Ok(_)) => debug!("engine exited cleanly"),
            _ => {
                warn!("engine did not exit within grace period, killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }
}


fn spawn_log_forwarder(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    logs: LogRing,
    stderr_tail: Option<Arc<Mutex<VecDeque<String>>>>,
    mode: SingboxLogMode,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    match mode {
                        SingboxLogMode::Stdout => info!(target: "sing-box", "{line}"),
                        SingboxLogMode::None => {}
                        SingboxLogMode::Memory => logs.push(line.clone()).await,
                    }
                    if let Some(tail) = &stderr_tail {
                        let mut guard = tail.lock().await;
                        guard.push_back(line);
                        if guard.len() > STDERR_TAIL_LINES {
                            guard.pop_front();
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "log forwarder read error");
                    break;
                }
            }
        }
    });
}
