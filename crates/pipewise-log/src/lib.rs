// ABOUTME: Shared logging setup for pipewise binaries and supervised worker output
// ABOUTME: init() logs to stderr, init_file() writes to the config dir, init_for() scopes to a crate

use tracing_subscriber::EnvFilter;

/// Target used when re-emitting lines captured from a supervised worker.
pub const WORKER_OUTPUT_TARGET: &str = "pipewise::worker";

/// Standard logging to stderr. Default: INFO level, RUST_LOG override.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}

/// File-based logging for long-running supervisors. Default: WARN level, RUST_LOG override.
/// Logs to ~/.config/pipewise/{app_name}/{app_name}.log
/// If setup fails, prints a warning to stderr and continues without logging.
pub fn init_file(app_name: &str) {
    if let Err(e) = init_file_inner(app_name) {
        eprintln!("Warning: failed to set up file logging: {e}");
    }
}

fn init_file_inner(app_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = dirs::config_dir().ok_or("could not determine config directory")?;
    let log_dir = config_dir.join("pipewise").join(app_name);
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(format!("{app_name}.log")))?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .with_ansi(false)
        .init();

    Ok(())
}

/// Crate-filtered logging to stderr. Default: INFO for named crate and worker output,
/// WARN for everything else.
pub fn init_for(crate_name: &str) {
    let filter = EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into())
        .add_directive(directive_for(crate_name))
        .add_directive(directive_for(WORKER_OUTPUT_TARGET));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn directive_for(target: &str) -> tracing_subscriber::filter::Directive {
    format!("{target}=info")
        .parse()
        .unwrap_or_else(|_| tracing::Level::INFO.into())
}

/// Re-emit one line of worker output as a log event.
pub fn worker_line(worker: &str, line: &str) {
    tracing::info!(target: WORKER_OUTPUT_TARGET, worker = %worker, "{}", line.trim_end());
}
