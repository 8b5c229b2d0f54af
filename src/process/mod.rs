//! Child-process supervisor
//!
//! Runs one helper binary with a fixed argv, inheriting the agent's
//! stdout/stderr. Structured data never travels over the child's streams;
//! it arrives on the paired socket. The supervisor only tracks liveness:
//! an unexpected exit is reported through `on_exit` so the owner can decide
//! whether to restart. Nothing restarts automatically.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{AppError, Result};

/// Callback fired when the child exits without `stop` having been called.
pub type OnExit = Arc<dyn Fn(ExitStatus) + Send + Sync>;

/// Supervises a single external binary.
pub struct Supervisor {
    program: String,
    args: Vec<String>,
    running: AtomicBool,
    stopping: AtomicBool,
    pid: AtomicI32,
    waiter: Mutex<Option<JoinHandle<()>>>,
    on_exit: std::sync::RwLock<Option<OnExit>>,
}

impl Supervisor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            pid: AtomicI32::new(0),
            waiter: Mutex::new(None),
            on_exit: std::sync::RwLock::new(None),
        }
    }

    /// Register the unexpected-exit callback. Must be set before `start`.
    pub fn set_on_exit(&self, on_exit: OnExit) {
        *self.on_exit.write().unwrap() = Some(on_exit);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the child. A second start while the child is alive fails.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AppError::AlreadyOpen("child process"));
        }
        self.stopping.store(false, Ordering::SeqCst);

        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let pid = child.id().unwrap_or(0) as i32;
        self.pid.store(pid, Ordering::SeqCst);
        info!("started {} (pid {})", self.program, pid);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let status = child.wait().await;
            this.running.store(false, Ordering::SeqCst);
            this.pid.store(0, Ordering::SeqCst);

            match status {
                Ok(status) => {
                    if this.stopping.load(Ordering::SeqCst) {
                        info!("{} exited after stop: {}", this.program, status);
                    } else {
                        warn!("{} exited unexpectedly: {}", this.program, status);
                        let on_exit = this.on_exit.read().unwrap().clone();
                        if let Some(on_exit) = on_exit {
                            on_exit(status);
                        }
                    }
                }
                Err(e) => warn!("{} wait failed: {}", this.program, e),
            }
        });
        *self.waiter.lock().await = Some(handle);

        Ok(())
    }

    /// Interrupt the child and wait for it to exit.
    ///
    /// SIGINT goes out first; if the signal itself fails the process is
    /// already gone (or unkillable) and a SIGKILL is attempted before the
    /// wait. Stop while nothing runs is an error the caller may ignore.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AppError::NotOpen("child process"));
        }
        self.stopping.store(true, Ordering::SeqCst);

        let pid = self.pid.load(Ordering::SeqCst);
        if pid > 0 {
            if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGINT) {
                warn!("failed to interrupt {} (pid {}): {}", self.program, pid, e);
                let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }

        if let Some(handle) = self.waiter.lock().await.take() {
            let _ = handle.await;
        }

        Ok(())
    }
}
