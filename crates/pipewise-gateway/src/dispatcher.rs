// ABOUTME: Prefetching request dispatcher with a bounded sliding window of in-flight requests.
// ABOUTME: A background receive loop resolves pending slots by request id; responses stream out in completion order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, BoxStream, FuturesUnordered};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::transport::{Envelope, TransportReceiver, TransportSender};

/// Window sizes for one dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Requests sent before the first response is awaited.
    pub prefetch: usize,
    /// Requests pulled from the source for every response consumed.
    pub prefetch_on_recv: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            prefetch: 50,
            prefetch_on_recv: 1,
        }
    }
}

type Outstanding = Arc<Mutex<HashMap<String, oneshot::Sender<Envelope>>>>;
type Slot = oneshot::Receiver<Envelope>;

/// Sends requests over a transport and matches responses to them by request id.
pub struct PrefetchDispatcher {
    sender: Arc<dyn TransportSender>,
    outstanding: Outstanding,
    running: Arc<AtomicBool>,
    receive_task: JoinHandle<()>,
    settings: DispatchSettings,
}

impl PrefetchDispatcher {
    /// Start the receive loop. Must be called inside a tokio runtime.
    pub fn new(
        sender: impl TransportSender + 'static,
        receiver: impl TransportReceiver + 'static,
        settings: DispatchSettings,
    ) -> Self {
        let outstanding: Outstanding = Arc::default();
        let running = Arc::new(AtomicBool::new(true));
        let receive_task = tokio::spawn(receive_loop(
            Box::new(receiver),
            Arc::clone(&outstanding),
            Arc::clone(&running),
        ));

        Self {
            sender: Arc::new(sender),
            outstanding,
            running,
            receive_task,
            settings,
        }
    }

    pub fn settings(&self) -> DispatchSettings {
        self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.receive_task.is_finished()
    }

    /// Number of requests sent and not yet answered.
    pub async fn outstanding(&self) -> usize {
        self.outstanding.lock().await.len()
    }

    /// Stop matching responses. Pending requests are abandoned, which ends
    /// any dispatch stream once its resolved responses are drained.
    pub async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.receive_task.abort();
        let abandoned = {
            let mut outstanding = self.outstanding.lock().await;
            let count = outstanding.len();
            outstanding.clear();
            count
        };
        if abandoned > 0 {
            tracing::warn!(abandoned, "Dispatcher closed with requests in flight");
        }
    }

    /// Stream request bodies from `source` to the workers and yield responses
    /// as they complete.
    ///
    /// At most `prefetch` requests are in flight after the initial fill. Each
    /// consumed response pulls up to `prefetch_on_recv` more into the next
    /// window, which takes over once the current one is drained. An empty
    /// source yields nothing. Once the dispatcher is closed or the transport
    /// ends, no further requests are sent and the stream ends after yielding
    /// what was already resolved.
    pub fn dispatch<S>(&self, source: S) -> BoxStream<'static, Envelope>
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        let state = WindowState {
            sender: Arc::clone(&self.sender),
            outstanding: Arc::clone(&self.outstanding),
            running: Arc::clone(&self.running),
            source: source.boxed(),
            settings: self.settings,
            window: FuturesUnordered::new(),
            next_window: FuturesUnordered::new(),
            started: false,
            exhausted: false,
            refill_due: false,
            sent: 0,
            received: 0,
        };
        stream::unfold(state, |mut state| async move {
            let envelope = state.next_response().await?;
            Some((envelope, state))
        })
        .boxed()
    }
}

impl Drop for PrefetchDispatcher {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.receive_task.abort();
    }
}

async fn receive_loop(
    mut receiver: Box<dyn TransportReceiver>,
    outstanding: Outstanding,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        let envelope = match receiver.recv().await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                tracing::info!("Transport closed, receive loop ending");
                break;
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "Transport failed, receive loop ending");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding undecodable response");
                continue;
            }
        };

        let slot = outstanding.lock().await.remove(&envelope.request_id);
        match slot {
            Some(slot) => {
                // The dispatch stream may have been dropped; nothing to resolve then.
                let _ = slot.send(envelope);
            }
            None => tracing::warn!(
                request_id = %envelope.request_id,
                "Discarding unexpected response"
            ),
        }
    }

    // Cleared before the map so no submit can slip a slot in after the clear.
    running.store(false, Ordering::SeqCst);
    let mut outstanding = outstanding.lock().await;
    if !outstanding.is_empty() {
        tracing::warn!(abandoned = outstanding.len(), "Abandoning requests without responses");
        outstanding.clear();
    }
}

struct WindowState {
    sender: Arc<dyn TransportSender>,
    outstanding: Outstanding,
    running: Arc<AtomicBool>,
    source: BoxStream<'static, Value>,
    settings: DispatchSettings,
    window: FuturesUnordered<Slot>,
    next_window: FuturesUnordered<Slot>,
    started: bool,
    exhausted: bool,
    /// A response was handed out; refill before waiting on the next one.
    refill_due: bool,
    sent: usize,
    received: usize,
}

impl WindowState {
    async fn next_response(&mut self) -> Option<Envelope> {
        if !self.started {
            self.started = true;
            if self.settings.prefetch == 0 {
                tracing::warn!("Prefetch window is zero, nothing dispatched");
                return None;
            }
            let mut initial = FuturesUnordered::new();
            self.fill(self.settings.prefetch, &mut initial).await;
            if initial.is_empty() {
                if self.running.load(Ordering::SeqCst) {
                    tracing::warn!("Received an empty request stream, nothing to dispatch");
                }
                return None;
            }
            self.window = initial;
        }

        loop {
            if self.refill_due {
                self.refill_due = false;
                self.refill().await;
            }

            if self.window.is_empty() {
                if self.next_window.is_empty() {
                    tracing::debug!(sent = self.sent, received = self.received, "Dispatch finished");
                    return None;
                }
                self.window = std::mem::take(&mut self.next_window);
                tracing::debug!(
                    sent = self.sent,
                    received = self.received,
                    pending = self.window.len(),
                    "Switching to refill window"
                );
            }

            match self.window.next().await {
                Some(Ok(envelope)) => {
                    self.received += 1;
                    self.refill_due = true;
                    return Some(envelope);
                }
                Some(Err(_)) => {
                    tracing::debug!("Pending request abandoned without a response");
                    self.refill_due = true;
                }
                None => {}
            }
        }
    }

    async fn refill(&mut self) {
        if self.exhausted {
            return;
        }
        let mut refilled = std::mem::take(&mut self.next_window);
        self.fill(self.settings.prefetch_on_recv, &mut refilled).await;
        self.next_window = refilled;
    }

    /// Pull up to `count` requests and submit them, pushing their slots into `into`.
    /// Stops for good once the dispatcher is no longer running.
    async fn fill(&mut self, count: usize, into: &mut FuturesUnordered<Slot>) {
        for _ in 0..count {
            if !self.running.load(Ordering::SeqCst) {
                self.exhausted = true;
                break;
            }
            let Some(body) = self.source.next().await else {
                self.exhausted = true;
                break;
            };
            match submit(&self.sender, &self.outstanding, &self.running, body).await {
                Some(slot) => {
                    self.sent += 1;
                    into.push(slot);
                }
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }
    }
}

/// Register a pending slot and send without waiting for the send to complete.
/// A failed send drops the slot so the window does not wait on it. Returns
/// `None` once the dispatcher has stopped, without sending anything.
async fn submit(
    sender: &Arc<dyn TransportSender>,
    outstanding: &Outstanding,
    running: &AtomicBool,
    body: Value,
) -> Option<Slot> {
    let envelope = Envelope::new(body);
    let request_id = envelope.request_id.clone();
    let (tx, rx) = oneshot::channel();
    {
        // Checked under the lock: shutdown flips the flag before clearing the map.
        let mut pending = outstanding.lock().await;
        if !running.load(Ordering::SeqCst) {
            tracing::debug!("Dispatcher stopped, not sending further requests");
            return None;
        }
        pending.insert(request_id.clone(), tx);
    }

    let sender = Arc::clone(sender);
    let outstanding = Arc::clone(outstanding);
    tokio::spawn(async move {
        if let Err(e) = sender.send(envelope).await {
            tracing::warn!(request_id = %request_id, error = %e, "Failed to send request");
            outstanding.lock().await.remove(&request_id);
        }
    });
    Some(rx)
}
