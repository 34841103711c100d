// ABOUTME: RuntimeSupervisor trait shared by every worker-hosting strategy.
// ABOUTME: Default methods implement readiness polling, the one-shot replay, teardown, and log streaming.

use std::sync::Arc;
use std::time::Duration;

use pipewise_control::{probe_ready, ControlChannel};
use pipewise_core::WorkerArgs;

use crate::error::RuntimeError;
use crate::worker::WorkerProcess;

/// Timing for readiness polling.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Sleep between two readiness probes.
    pub poll_interval: Duration,
    /// Timeout of one status request.
    pub control_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            control_timeout: Duration::from_secs(5),
        }
    }
}

impl SupervisorSettings {
    pub fn from_args(args: &WorkerArgs) -> Self {
        Self {
            control_timeout: args.timeout_ctrl(),
            ..Self::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }
}

/// Why a worker is being spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    Normal,
    /// Diagnostic re-run after the worker died before becoming ready.
    Replay,
}

/// Stops a worker from a thread other than the one owning its supervisor.
pub trait Stopper: Send + Sync {
    /// Stop the worker. Succeeds if it is already gone.
    fn stop(&self) -> Result<(), RuntimeError>;
}

/// Lifecycle driver for one worker.
///
/// Implementations provide spawning, liveness, stopping, and output access;
/// polling, replay, and teardown are shared. Every method blocks the calling
/// thread, so supervisors belong on a dedicated thread or in
/// `tokio::task::spawn_blocking`.
pub trait RuntimeSupervisor {
    fn worker(&self) -> &WorkerProcess;
    fn worker_mut(&mut self) -> &mut WorkerProcess;
    fn settings(&self) -> &SupervisorSettings;
    fn control(&self) -> &dyn ControlChannel;

    /// Start one worker instance.
    fn spawn(&mut self, mode: SpawnMode) -> Result<(), RuntimeError>;

    /// Query the hosting layer for whether the worker still exists.
    fn is_alive(&mut self) -> Result<bool, RuntimeError>;

    /// Stop the worker. Must succeed when it is already gone.
    fn stop_worker(&mut self) -> Result<(), RuntimeError>;

    /// Feed worker output lines to `sink` until the output ends.
    fn stream_output(&mut self, sink: &mut dyn FnMut(&str)) -> Result<(), RuntimeError>;

    fn stopper(&self) -> Arc<dyn Stopper>;

    /// Probe the control endpoint once and record the result.
    fn is_ready(&mut self) -> bool {
        let ready = probe_ready(
            self.control(),
            self.worker().control_address(),
            self.settings().control_timeout,
        );
        self.worker_mut().set_ready(ready);
        self.worker().is_ready()
    }

    /// Spawn the worker and block until it is ready.
    ///
    /// If the worker dies first, it is spawned once more in replay mode so its
    /// output reaches the logs, then `StartupFailed` is returned.
    fn boot(&mut self) -> Result<(), RuntimeError> {
        self.spawn(SpawnMode::Normal)?;

        loop {
            let alive = self.is_alive()?;
            self.worker_mut().set_alive(alive);
            if !alive {
                break;
            }
            if self.is_ready() {
                tracing::info!(
                    worker = %self.worker().name(),
                    address = %self.worker().control_address(),
                    "Worker is ready"
                );
                return Ok(());
            }
            std::thread::sleep(self.settings().poll_interval);
        }

        let name = self.worker().name().to_string();
        tracing::error!(worker = %name, "Worker exited before becoming ready, replaying to capture its output");
        if let Err(e) = self.replay() {
            tracing::warn!(worker = %name, error = %e, "Replay failed");
        }
        Err(RuntimeError::StartupFailed { name })
    }

    /// Spawn in replay mode and stream the output synchronously.
    ///
    /// Only called for a worker already known to die early, so this returns.
    fn replay(&mut self) -> Result<(), RuntimeError> {
        self.spawn(SpawnMode::Replay)?;
        self.run_forever()
    }

    /// Stream worker output into the logs until the worker exits or is stopped.
    fn run_forever(&mut self) -> Result<(), RuntimeError> {
        let name = self.worker().name().to_string();
        self.stream_output(&mut |line| pipewise_log::worker_line(&name, line))?;
        tracing::info!(worker = %name, "Worker output ended");
        Ok(())
    }

    /// Stop the worker and mark it dead. Safe to call more than once.
    fn teardown(&mut self) -> Result<(), RuntimeError> {
        self.stop_worker()?;
        self.worker_mut().set_alive(false);
        tracing::info!(worker = %self.worker().name(), "Worker torn down");
        Ok(())
    }
}
