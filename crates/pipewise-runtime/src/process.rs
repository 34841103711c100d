// ABOUTME: Worker supervisor that runs the worker as a local child process.
// ABOUTME: Forwards stdout/stderr lines through a channel and kills the child on teardown or drop.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pipewise_control::ControlChannel;
use pipewise_core::{forwarded_args, WorkerArgs};
use tokio::sync::mpsc;

use crate::error::RuntimeError;
use crate::supervisor::{RuntimeSupervisor, SpawnMode, Stopper, SupervisorSettings};
use crate::worker::WorkerProcess;

type SharedChild = Arc<Mutex<Option<Child>>>;

/// Supervisor for a worker launched from `entrypoint` as a child process.
///
/// The entrypoint is split on whitespace; the forwarded worker arguments are
/// appended after it.
pub struct ProcessRuntime {
    args: WorkerArgs,
    settings: SupervisorSettings,
    worker: WorkerProcess,
    control: Arc<dyn ControlChannel>,
    child: SharedChild,
    output: Option<mpsc::UnboundedReceiver<String>>,
}

impl ProcessRuntime {
    pub fn new(args: WorkerArgs, control: Arc<dyn ControlChannel>) -> Self {
        let worker = WorkerProcess::new(args.display_name(), args.control_address());
        Self {
            settings: SupervisorSettings::from_args(&args),
            args,
            worker,
            control,
            child: Arc::new(Mutex::new(None)),
            output: None,
        }
    }

    /// Build, spawn, and wait for readiness in one step.
    pub fn launch(args: WorkerArgs, control: Arc<dyn ControlChannel>) -> Result<Self, RuntimeError> {
        Self::new(args, control).start()
    }

    pub fn with_settings(mut self, settings: SupervisorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn start(mut self) -> Result<Self, RuntimeError> {
        self.boot()?;
        Ok(self)
    }

    pub fn args(&self) -> &WorkerArgs {
        &self.args
    }

    /// Program and arguments for one launch.
    pub fn command_line(&self) -> Result<Vec<String>, RuntimeError> {
        let mut parts: Vec<String> = self
            .args
            .entrypoint
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if parts.is_empty() {
            return Err(RuntimeError::MissingEntrypoint(self.worker.name().to_string()));
        }
        parts.extend(forwarded_args(&self.args));
        Ok(parts)
    }
}

fn lock(child: &SharedChild) -> MutexGuard<'_, Option<Child>> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

fn kill_child(child: &SharedChild) -> Result<(), RuntimeError> {
    let mut guard = lock(child);
    if let Some(child) = guard.as_mut() {
        if child.try_wait()?.is_none() {
            child.kill()?;
            child.wait()?;
        }
    }
    Ok(())
}

fn forward_lines<R: Read + Send + 'static>(reader: R, tx: mpsc::UnboundedSender<String>) {
    std::thread::spawn(move || {
        for line in BufReader::new(reader).lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

impl RuntimeSupervisor for ProcessRuntime {
    fn worker(&self) -> &WorkerProcess {
        &self.worker
    }

    fn worker_mut(&mut self) -> &mut WorkerProcess {
        &mut self.worker
    }

    fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    fn control(&self) -> &dyn ControlChannel {
        self.control.as_ref()
    }

    fn spawn(&mut self, mode: SpawnMode) -> Result<(), RuntimeError> {
        let command_line = self.command_line()?;
        kill_child(&self.child)?;

        let mut child = Command::new(&command_line[0])
            .args(&command_line[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx);
        }

        tracing::info!(
            worker = %self.worker.name(),
            pid = child.id(),
            replay = mode == SpawnMode::Replay,
            "Spawned worker process"
        );

        *lock(&self.child) = Some(child);
        self.output = Some(rx);
        self.worker.set_alive(true);
        Ok(())
    }

    fn is_alive(&mut self) -> Result<bool, RuntimeError> {
        let mut guard = lock(&self.child);
        let Some(child) = guard.as_mut() else {
            return Ok(false);
        };
        match child.try_wait()? {
            Some(status) => {
                tracing::debug!(worker = %self.worker.name(), %status, "Worker process exited");
                Ok(false)
            }
            None => Ok(true),
        }
    }

    fn stop_worker(&mut self) -> Result<(), RuntimeError> {
        kill_child(&self.child)
    }

    fn stream_output(&mut self, sink: &mut dyn FnMut(&str)) -> Result<(), RuntimeError> {
        if let Some(mut rx) = self.output.take() {
            while let Some(line) = rx.blocking_recv() {
                sink(&line);
            }
        }
        Ok(())
    }

    fn stopper(&self) -> Arc<dyn Stopper> {
        Arc::new(ProcessStopper {
            child: Arc::clone(&self.child),
        })
    }
}

impl Drop for ProcessRuntime {
    fn drop(&mut self) {
        if let Err(e) = kill_child(&self.child) {
            tracing::warn!(worker = %self.worker.name(), error = %e, "Failed to kill worker process on drop");
        }
    }
}

struct ProcessStopper {
    child: SharedChild,
}

impl Stopper for ProcessStopper {
    fn stop(&self) -> Result<(), RuntimeError> {
        kill_child(&self.child)
    }
}
