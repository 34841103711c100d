// ABOUTME: Bridge from blocking supervisor code into async client libraries.
// ABOUTME: Drives one future to completion on a private current-thread runtime.

use std::future::Future;
use std::io;

/// Run `future` to completion on a fresh current-thread runtime.
///
/// Supervisors poll and stream on dedicated threads, so they call into async
/// clients through this instead of sharing the caller's runtime. Must not be
/// called from inside an async task; use `tokio::task::spawn_blocking` there.
pub fn run_blocking<F>(future: F) -> io::Result<F::Output>
where
    F: Future,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(future))
}
