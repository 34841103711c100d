// ABOUTME: pipewise CLI entry point.
// ABOUTME: Dispatches to init, run, status, and dispatch subcommands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::BoxStream;
use futures::StreamExt;
use pipewise_control::{ControlChannel, ControlCommand, SocketControlChannel};
use pipewise_core::{Config, ControlAddress, GatewayConfig, RuntimeKind, WorkerArgs};
use pipewise_gateway::{DispatchSettings, PrefetchDispatcher};
use pipewise_runtime::{
    ContainerRuntime, DockerApi, ProcessRuntime, RuntimeError, RuntimeSupervisor,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_stream::wrappers::LinesStream;

type Supervisor = Box<dyn RuntimeSupervisor + Send>;

#[derive(Parser)]
#[command(name = "pipewise")]
#[command(about = "Supervise pipeline workers and dispatch requests to them")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, env = "PIPEWISE_CONFIG")]
    config: Option<PathBuf>,

    /// Log to ~/.config/pipewise/pipewise/pipewise.log instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Start a worker, wait until it is ready, and stream its output
    Run {
        /// Worker name
        #[arg(short, long)]
        name: Option<String>,

        /// Image reference, e.g. docker://encoder:latest
        #[arg(long)]
        uses: Option<String>,

        /// Program to run (process runtime) or entrypoint override (container runtime)
        #[arg(long)]
        entrypoint: Option<String>,

        /// Runtime: "process" or "container"
        #[arg(long, value_parser = parse_runtime)]
        runtime: Option<RuntimeKind>,

        /// Control port of the worker
        #[arg(long)]
        port_ctrl: Option<u16>,

        /// Mount spec source[:target], repeatable
        #[arg(long = "volume", short = 'v')]
        volumes: Vec<String>,

        /// Pull the image even if it exists locally
        #[arg(long)]
        pull_latest: bool,
    },

    /// Probe a worker's control endpoint once
    Status {
        /// Control address, e.g. tcp://127.0.0.1:55555 (defaults to the configured worker)
        #[arg(long)]
        address: Option<String>,

        /// Probe timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Send JSON-line requests to a worker pool and print responses as they complete
    Dispatch {
        /// Worker pool address host:port
        #[arg(long, env = "PIPEWISE_GATEWAY_ADDRESS")]
        address: Option<String>,

        /// File with one JSON request per line (defaults to stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Requests in flight before the first response
        #[arg(long)]
        prefetch: Option<usize>,

        /// Requests sent per response received
        #[arg(long)]
        prefetch_on_recv: Option<usize>,
    },
}

/// Worker settings given on the command line, layered over the config file.
#[derive(Debug, Default)]
struct RunOverrides {
    name: Option<String>,
    uses: Option<String>,
    entrypoint: Option<String>,
    runtime: Option<RuntimeKind>,
    port_ctrl: Option<u16>,
    volumes: Vec<String>,
    pull_latest: bool,
}

impl RunOverrides {
    fn apply(self, args: &mut WorkerArgs) {
        if self.name.is_some() {
            args.name = self.name;
        }
        if self.uses.is_some() {
            args.uses = self.uses;
        }
        if self.entrypoint.is_some() {
            args.entrypoint = self.entrypoint;
        }
        if let Some(runtime) = self.runtime {
            args.runtime_cls = runtime;
        }
        if let Some(port) = self.port_ctrl {
            args.port_ctrl = port;
        }
        if !self.volumes.is_empty() {
            args.volumes = self.volumes;
        }
        args.pull_latest |= self.pull_latest;
    }
}

fn parse_runtime(value: &str) -> Result<RuntimeKind, String> {
    match value.to_ascii_lowercase().as_str() {
        "process" => Ok(RuntimeKind::Process),
        "container" | "docker" => Ok(RuntimeKind::Container),
        other => Err(format!("unknown runtime '{other}', expected process or container")),
    }
}

/// Target prefix shared by every workspace crate and by worker output.
const LOG_SCOPE: &str = "pipewise";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    if cli.log_file {
        pipewise_log::init_file("pipewise");
    } else if matches!(cli.command, Commands::Run { .. }) {
        // Supervising pulls in engine clients; keep their chatter at WARN.
        pipewise_log::init_for(LOG_SCOPE);
    } else {
        pipewise_log::init();
    }

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };

    match cli.command {
        Commands::Init { force } => run_init(&config_path, force),
        Commands::Run {
            name,
            uses,
            entrypoint,
            runtime,
            port_ctrl,
            volumes,
            pull_latest,
        } => {
            let overrides = RunOverrides {
                name,
                uses,
                entrypoint,
                runtime,
                port_ctrl,
                volumes,
                pull_latest,
            };
            run_worker(&config_path, overrides).await
        }
        Commands::Status {
            address,
            timeout_ms,
        } => run_status(&config_path, address, timeout_ms).await,
        Commands::Dispatch {
            address,
            input,
            prefetch,
            prefetch_on_recv,
        } => {
            let mut gateway = Config::load_or_default(&config_path)?.gateway;
            if let Some(address) = address {
                gateway.address = address;
            }
            if let Some(prefetch) = prefetch {
                gateway.prefetch = prefetch;
            }
            if let Some(prefetch_on_recv) = prefetch_on_recv {
                gateway.prefetch_on_recv = prefetch_on_recv;
            }
            run_dispatch(gateway, input).await
        }
    }
}

fn run_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

/// Boot the configured worker on a blocking thread, then stream its output
/// until it exits or Ctrl-C arrives.
async fn run_worker(config_path: &Path, overrides: RunOverrides) -> Result<()> {
    let mut args = Config::load_or_default(config_path)?.worker;
    overrides.apply(&mut args);

    let name = args.display_name();
    tracing::info!(worker = %name, runtime = ?args.runtime_cls, "Starting worker");

    let supervisor = tokio::task::spawn_blocking(move || boot_supervisor(args))
        .await
        .context("Supervisor thread panicked")??;
    let stopper = supervisor.stopper();

    let mut output = tokio::task::spawn_blocking(move || {
        let mut supervisor = supervisor;
        let result = supervisor.run_forever();
        (supervisor, result)
    });

    let (mut supervisor, result) = tokio::select! {
        joined = &mut output => joined.context("Output thread panicked")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(worker = %name, "Interrupted, stopping worker");
            tokio::task::spawn_blocking(move || stopper.stop())
                .await
                .context("Stop thread panicked")??;
            output.await.context("Output thread panicked")?
        }
    };
    if let Err(e) = result {
        tracing::warn!(worker = %name, error = %e, "Output streaming ended with an error");
    }

    tokio::task::spawn_blocking(move || supervisor.teardown())
        .await
        .context("Teardown thread panicked")??;
    Ok(())
}

fn boot_supervisor(args: WorkerArgs) -> Result<Supervisor, RuntimeError> {
    let control: Arc<dyn ControlChannel> = Arc::new(SocketControlChannel::new());
    let supervisor: Supervisor = match args.runtime_cls {
        RuntimeKind::Process => Box::new(ProcessRuntime::launch(args, control)?),
        RuntimeKind::Container => Box::new(ContainerRuntime::launch(
            args,
            Arc::new(DockerApi::new()),
            control,
        )?),
    };
    Ok(supervisor)
}

async fn run_status(
    config_path: &Path,
    address: Option<String>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let worker = Config::load_or_default(config_path)?.worker;
    let address: ControlAddress = match address {
        Some(address) => address
            .parse()
            .with_context(|| format!("Invalid control address '{address}'"))?,
        None => worker.control_address(),
    };
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| worker.timeout_ctrl());

    let reply = SocketControlChannel::new()
        .request_async(&address, ControlCommand::Status, timeout)
        .await
        .with_context(|| format!("No status reply from {address}"))?;

    if reply.is_ready {
        println!("{address}: ready");
        Ok(())
    } else {
        let detail = reply.detail.unwrap_or_default();
        bail!("{address}: not ready {detail}")
    }
}

async fn run_dispatch(gateway: GatewayConfig, input: Option<PathBuf>) -> Result<()> {
    let source = match &input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            request_source(file)
        }
        None => request_source(tokio::io::stdin()),
    };

    let (sender, receiver) = pipewise_gateway::tcp::connect(gateway.address.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", gateway.address))?;
    let dispatcher = PrefetchDispatcher::new(
        sender,
        receiver,
        DispatchSettings {
            prefetch: gateway.prefetch,
            prefetch_on_recv: gateway.prefetch_on_recv,
        },
    );

    let mut responses = dispatcher.dispatch(source);
    let mut received = 0usize;
    while let Some(envelope) = responses.next().await {
        println!("{}", serde_json::to_string(&envelope)?);
        received += 1;
    }

    dispatcher.close().await;
    tracing::info!(received, address = %gateway.address, "Dispatch finished");
    Ok(())
}

/// JSON request bodies, one per non-empty line. Undecodable lines are skipped.
fn request_source<R>(reader: R) -> BoxStream<'static, Value>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    LinesStream::new(BufReader::new(reader).lines())
        .filter_map(|line| futures::future::ready(parse_request(line)))
        .boxed()
}

fn parse_request(line: std::io::Result<String>) -> Option<Value> {
    let line = match line {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read request line");
            return None;
        }
    };
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(&line) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping malformed request line");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_runtime() {
        assert_eq!(parse_runtime("process").unwrap(), RuntimeKind::Process);
        assert_eq!(parse_runtime("Container").unwrap(), RuntimeKind::Container);
        assert!(parse_runtime("vm").is_err());
    }

    #[test]
    fn test_run_flags_override_config() {
        let cli = Cli::try_parse_from([
            "pipewise",
            "run",
            "--name",
            "encoder",
            "--runtime",
            "container",
            "--uses",
            "docker://encoder:1.0",
            "-v",
            "/data",
            "--pull-latest",
        ])
        .unwrap();

        let Commands::Run {
            name,
            uses,
            entrypoint,
            runtime,
            port_ctrl,
            volumes,
            pull_latest,
        } = cli.command
        else {
            panic!("expected run");
        };

        let mut args = WorkerArgs {
            port_ctrl: 7000,
            ..WorkerArgs::default()
        };
        RunOverrides {
            name,
            uses,
            entrypoint,
            runtime,
            port_ctrl,
            volumes,
            pull_latest,
        }
        .apply(&mut args);

        assert_eq!(args.name.as_deref(), Some("encoder"));
        assert_eq!(args.runtime_cls, RuntimeKind::Container);
        assert_eq!(args.uses.as_deref(), Some("docker://encoder:1.0"));
        assert_eq!(args.volumes, vec!["/data"]);
        assert_eq!(args.port_ctrl, 7000);
        assert!(args.pull_latest);
    }

    #[test]
    fn test_parse_request_skips_blank_and_malformed_lines() {
        assert_eq!(parse_request(Ok(r#"{"text":"hi"}"#.to_string())), Some(json!({"text": "hi"})));
        assert_eq!(parse_request(Ok("   ".to_string())), None);
        assert_eq!(parse_request(Ok("{oops".to_string())), None);
    }

    #[tokio::test]
    async fn test_request_source_reads_json_lines() {
        let input: &'static [u8] = b"{\"n\":1}\n\nnot json\n{\"n\":2}\n";
        let requests: Vec<Value> = request_source(input).collect().await;
        assert_eq!(requests, vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipewise.toml");
        run_init(&path, false).unwrap();
        assert!(run_init(&path, false).is_err());
        run_init(&path, true).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }
}
