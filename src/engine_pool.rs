//! Recycling manager for the shared browser engine process
//!
//! Every job runs against one long-lived engine process. The pool counts how
//! many more jobs the process may serve and, once the budget is spent, the next
//! caller restarts it. Restarts are serialized; ordinary jobs are not.

use crate::{EngineConfig, PoolError};
use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// A running engine process owned by the pool.
#[async_trait]
pub trait EngineProcess: Send + Sync {
    /// Kills the process and waits for it to exit.
    async fn terminate(&mut self) -> std::io::Result<()>;

    fn id(&self) -> Option<u32> {
        None
    }
}

/// Starts fresh engine processes.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn EngineProcess>, PoolError>;
}

#[async_trait]
impl EngineProcess for Child {
    async fn terminate(&mut self) -> std::io::Result<()> {
        self.kill().await
    }

    fn id(&self) -> Option<u32> {
        Child::id(self)
    }
}

/// Launches the engine binary with a fixed set of arguments.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    path: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    /// Resolves `program` against `PATH` up front so a missing engine fails at
    /// startup rather than on the first restart.
    pub fn new(program: &str, args: Vec<String>) -> Result<Self, PoolError> {
        let path = which::which(program).map_err(|e| {
            PoolError::Launch(format!("unable to look up the path of '{program}': {e}"))
        })?;
        Ok(Self { path, args })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, PoolError> {
        Self::new(&config.chrome_path, config.chrome_flags.clone())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl EngineLauncher for CommandLauncher {
    async fn launch(&self) -> Result<Box<dyn EngineProcess>, PoolError> {
        let child = Command::new(&self.path)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::Launch(e.to_string()))?;

        Ok(Box::new(child))
    }
}

/// Observable state of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Running,
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub state: PoolState,
    pub remaining_uses: i64,
    pub initial_uses: i64,
    pub restarts: u64,
    pub process_id: Option<u32>,
}

/// Owns the single engine process and hands out executions against it.
///
/// The raw process handle never leaves the pool; callers only get
/// [`EnginePool::execute`].
pub struct EnginePool {
    launcher: Box<dyn EngineLauncher>,
    initial_uses: i64,
    start_delay: Duration,
    remaining: RwLock<i64>,
    // Doubles as the restart lock.
    process: Mutex<Option<Box<dyn EngineProcess>>>,
    restarts: AtomicU64,
}

impl EnginePool {
    /// Validates the use budget and performs the first start.
    pub async fn new(
        launcher: Box<dyn EngineLauncher>,
        initial_uses: i64,
        start_delay: Duration,
    ) -> Result<Self, PoolError> {
        if initial_uses <= 0 {
            return Err(PoolError::InvalidUseCount(initial_uses));
        }

        let pool = Self {
            launcher,
            initial_uses,
            start_delay,
            remaining: RwLock::new(0),
            process: Mutex::new(None),
            restarts: AtomicU64::new(0),
        };

        {
            let mut process = pool.process.lock().await;
            pool.restart_locked(&mut process)
                .await
                .map_err(|e| PoolError::Launch(format!("unable to run the first start: {e}")))?;
        }
        info!(
            "Engine pool started, recycling every {} uses",
            pool.initial_uses
        );

        Ok(pool)
    }

    pub async fn from_config(config: &EngineConfig) -> Result<Self, PoolError> {
        let launcher = CommandLauncher::from_config(config)?;
        info!("Using engine binary {}", launcher.path().display());
        Self::new(
            Box::new(launcher),
            config.uses_per_instance,
            config.start_delay,
        )
        .await
    }

    /// Runs `task` against the engine, restarting it first if its budget is spent.
    ///
    /// The task itself runs outside every lock. Its use is counted once it
    /// finishes, whether it succeeded, failed or was cancelled.
    pub async fn execute<F, Fut, T>(&self, task: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.remaining_uses() <= 0 {
            let mut process = self.process.lock().await;

            // Another caller may have restarted while we waited for the lock.
            if self.remaining_uses() <= 0 {
                debug!("Engine use budget exhausted, restarting");
                if let Err(e) = self.restart_locked(&mut process).await {
                    error!("Engine restart failed: {}", e);
                    return Err(PoolError::RestartFailed(e.to_string()));
                }
            }
        }

        let _use = UseGuard {
            remaining: &self.remaining,
        };
        Ok(task().await)
    }

    /// Forces a restart regardless of the remaining budget.
    pub async fn restart(&self) -> Result<(), PoolError> {
        let mut process = self.process.lock().await;
        self.restart_locked(&mut process).await
    }

    async fn restart_locked(
        &self,
        process: &mut Option<Box<dyn EngineProcess>>,
    ) -> Result<(), PoolError> {
        if let Some(old) = process.as_mut() {
            old.terminate()
                .await
                .map_err(|e| PoolError::Terminate(e.to_string()))?;
            *process = None;
        }

        let fresh = self.launcher.launch().await?;
        let pid = fresh.id();
        *process = Some(fresh);

        sleep(self.start_delay).await;

        *self.remaining.write().unwrap_or_else(PoisonError::into_inner) = self.initial_uses;
        let count = self.restarts.fetch_add(1, Ordering::Relaxed);
        if count > 0 {
            metrics::counter!("screenshot_engine_restarts_total").increment(1);
        }
        info!("Engine process started (pid {:?})", pid);
        Ok(())
    }

    pub fn remaining_uses(&self) -> i64 {
        *self.remaining.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Restarts since the first start.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed).saturating_sub(1)
    }

    pub async fn get_stats(&self) -> PoolStats {
        let process_id = self.process.lock().await.as_ref().and_then(|p| p.id());
        let remaining_uses = self.remaining_uses();

        PoolStats {
            state: if remaining_uses > 0 {
                PoolState::Running
            } else {
                PoolState::Exhausted
            },
            remaining_uses,
            initial_uses: self.initial_uses,
            restarts: self.restarts(),
            process_id,
        }
    }

    /// Kills the engine process. Jobs executed afterwards restart it.
    pub async fn shutdown(&self) {
        info!("Shutting down engine pool...");
        let mut process = self.process.lock().await;
        if let Some(mut old) = process.take() {
            if let Err(e) = old.terminate().await {
                error!("Failed to kill the engine process: {}", e);
            }
        }
        *self.remaining.write().unwrap_or_else(PoisonError::into_inner) = 0;
        info!("Engine pool shutdown complete");
    }
}

struct UseGuard<'a> {
    remaining: &'a RwLock<i64>,
}

impl Drop for UseGuard<'_> {
    fn drop(&mut self) {
        *self.remaining.write().unwrap_or_else(PoisonError::into_inner) -= 1;
    }
}
