// ABOUTME: Dispatcher tests over an in-memory transport the test answers by hand.
// ABOUTME: Covers completion order, window sizes, send failures, and shutdown while requests remain.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use pipewise_gateway::{
    DispatchSettings, Envelope, PrefetchDispatcher, TransportError, TransportReceiver,
    TransportSender,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Clone)]
struct ChannelSender {
    sent: mpsc::UnboundedSender<Envelope>,
    /// Bodies the wire refuses to carry.
    rejects: Option<Value>,
}

#[async_trait]
impl TransportSender for ChannelSender {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.rejects.as_ref() == Some(&envelope.body) {
            return Err(TransportError::Closed);
        }
        self.sent.send(envelope).map_err(|_| TransportError::Closed)
    }
}

struct ChannelReceiver {
    incoming: mpsc::UnboundedReceiver<Envelope>,
}

#[async_trait]
impl TransportReceiver for ChannelReceiver {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        Ok(self.incoming.recv().await)
    }
}

struct Harness {
    dispatcher: PrefetchDispatcher,
    /// Requests the dispatcher put on the wire.
    sent: mpsc::UnboundedReceiver<Envelope>,
    /// Responses delivered to the dispatcher.
    replies: mpsc::UnboundedSender<Envelope>,
}

impl Harness {
    fn new(prefetch: usize, prefetch_on_recv: usize) -> Self {
        Self::rejecting(prefetch, prefetch_on_recv, None)
    }

    fn rejecting(prefetch: usize, prefetch_on_recv: usize, rejects: Option<Value>) -> Self {
        let (sent_tx, sent) = mpsc::unbounded_channel();
        let (replies, incoming) = mpsc::unbounded_channel();
        let dispatcher = PrefetchDispatcher::new(
            ChannelSender {
                sent: sent_tx,
                rejects,
            },
            ChannelReceiver { incoming },
            DispatchSettings {
                prefetch,
                prefetch_on_recv,
            },
        );
        Self {
            dispatcher,
            sent,
            replies,
        }
    }

    fn answer(&self, request: &Envelope) {
        self.replies
            .send(Envelope::reply(request.request_id.clone(), request.body.clone()))
            .unwrap();
    }

    async fn next_sent(&mut self) -> Envelope {
        next(&mut self.sent).await
    }

    async fn nothing_sent(&mut self) -> bool {
        timeout(Duration::from_millis(50), self.sent.recv())
            .await
            .is_err()
    }
}

fn requests(bodies: &[&str]) -> BoxStream<'static, Value> {
    let bodies: Vec<Value> = bodies.iter().map(|b| json!(b)).collect();
    stream::iter(bodies).boxed()
}

/// Drain a dispatch stream on its own task.
fn collect(mut responses: BoxStream<'static, Envelope>) -> mpsc::UnboundedReceiver<Envelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(envelope) = responses.next().await {
            if tx.send(envelope).is_err() {
                break;
            }
        }
    });
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("channel closed")
}

async fn finished(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> bool {
    matches!(timeout(Duration::from_secs(2), rx.recv()).await, Ok(None))
}

#[tokio::test]
async fn test_responses_yield_in_completion_order() {
    let mut h = Harness::new(3, 1);
    let mut out = collect(h.dispatcher.dispatch(requests(&["A", "B", "C"])));

    let a = h.next_sent().await;
    let b = h.next_sent().await;
    let c = h.next_sent().await;
    assert_eq!(a.body, json!("A"));

    h.answer(&c);
    assert_eq!(next(&mut out).await.body, json!("C"));
    h.answer(&a);
    assert_eq!(next(&mut out).await.body, json!("A"));
    h.answer(&b);
    assert_eq!(next(&mut out).await.body, json!("B"));

    assert!(finished(&mut out).await);
    assert_eq!(h.dispatcher.outstanding().await, 0);
}

#[tokio::test]
async fn test_in_flight_requests_stay_within_prefetch() {
    let mut h = Harness::new(2, 1);
    let mut out = collect(h.dispatcher.dispatch(requests(&["1", "2", "3", "4", "5"])));

    let first = h.next_sent().await;
    let second = h.next_sent().await;
    assert!(h.nothing_sent().await);
    assert_eq!(h.dispatcher.outstanding().await, 2);

    let mut pending = VecDeque::from([first, second]);
    let mut answered = 0;
    while let Some(request) = pending.pop_front() {
        h.answer(&request);
        assert_eq!(next(&mut out).await.request_id, request.request_id);
        answered += 1;
        if answered <= 3 {
            pending.push_back(h.next_sent().await);
        }
        assert!(h.dispatcher.outstanding().await <= 2);
    }

    assert_eq!(answered, 5);
    assert!(h.nothing_sent().await);
    assert!(finished(&mut out).await);
}

#[tokio::test]
async fn test_short_source_drains_without_refill() {
    let mut h = Harness::new(5, 1);
    let mut out = collect(h.dispatcher.dispatch(requests(&["A", "B"])));

    let a = h.next_sent().await;
    let b = h.next_sent().await;
    assert!(h.nothing_sent().await);

    h.answer(&b);
    h.answer(&a);
    assert_eq!(next(&mut out).await.body, json!("B"));
    assert_eq!(next(&mut out).await.body, json!("A"));
    assert!(finished(&mut out).await);
}

#[tokio::test]
async fn test_empty_source_yields_nothing() {
    let mut h = Harness::new(4, 1);
    let mut out = collect(h.dispatcher.dispatch(requests(&[])));

    assert!(finished(&mut out).await);
    assert!(h.nothing_sent().await);
}

#[tokio::test]
async fn test_unknown_and_duplicate_responses_are_discarded() {
    let mut h = Harness::new(1, 1);
    let mut out = collect(h.dispatcher.dispatch(requests(&["only"])));

    let request = h.next_sent().await;
    h.replies
        .send(Envelope::reply("not-a-request", json!("stray")))
        .unwrap();
    h.answer(&request);
    h.answer(&request);

    let response = next(&mut out).await;
    assert_eq!(response.request_id, request.request_id);
    assert_eq!(response.body, json!("only"));
    assert!(finished(&mut out).await);
    assert!(h.dispatcher.is_running());
}

#[tokio::test]
async fn test_close_abandons_pending_requests() {
    let mut h = Harness::new(2, 1);
    let mut out = collect(h.dispatcher.dispatch(requests(&["A", "B"])));

    h.next_sent().await;
    h.next_sent().await;
    h.dispatcher.close().await;

    assert!(finished(&mut out).await);
    assert!(!h.dispatcher.is_running());
    assert_eq!(h.dispatcher.outstanding().await, 0);
}

#[tokio::test]
async fn test_close_stops_sending_remaining_requests() {
    let mut h = Harness::new(2, 1);
    let mut out = collect(h.dispatcher.dispatch(requests(&["A", "B", "C", "D", "E"])));

    h.next_sent().await;
    h.next_sent().await;
    h.dispatcher.close().await;

    assert!(finished(&mut out).await);
    assert!(h.nothing_sent().await);
    assert_eq!(h.dispatcher.outstanding().await, 0);
}

#[tokio::test]
async fn test_transport_end_finishes_stream_after_resolved_responses() {
    let Harness {
        dispatcher,
        mut sent,
        replies,
    } = Harness::new(2, 1);
    let mut out = collect(dispatcher.dispatch(requests(&["A", "B", "C", "D", "E"])));

    let a = next(&mut sent).await;
    next(&mut sent).await;
    replies
        .send(Envelope::reply(a.request_id.clone(), a.body.clone()))
        .unwrap();
    assert_eq!(next(&mut out).await.body, json!("A"));
    assert_eq!(next(&mut sent).await.body, json!("C"));

    drop(replies);

    assert!(finished(&mut out).await);
    assert!(timeout(Duration::from_millis(50), sent.recv()).await.is_err());
    assert!(!dispatcher.is_running());
    assert_eq!(dispatcher.outstanding().await, 0);
}

#[tokio::test]
async fn test_each_response_refills_prefetch_on_recv_requests() {
    let mut h = Harness::new(1, 2);
    let mut out = collect(h.dispatcher.dispatch(requests(&["A", "B", "C", "D", "E"])));

    let a = h.next_sent().await;
    assert!(h.nothing_sent().await);

    h.answer(&a);
    assert_eq!(next(&mut out).await.body, json!("A"));
    let b = h.next_sent().await;
    let c = h.next_sent().await;
    assert_eq!((b.body.clone(), c.body.clone()), (json!("B"), json!("C")));
    assert!(h.nothing_sent().await);

    h.answer(&c);
    assert_eq!(next(&mut out).await.body, json!("C"));
    let d = h.next_sent().await;
    let e = h.next_sent().await;
    assert!(h.nothing_sent().await);

    h.answer(&b);
    h.answer(&d);
    h.answer(&e);
    let mut rest = vec![
        next(&mut out).await.body,
        next(&mut out).await.body,
        next(&mut out).await.body,
    ];
    rest.sort_by_key(|body| body.to_string());
    assert_eq!(rest, vec![json!("B"), json!("D"), json!("E")]);
    assert!(finished(&mut out).await);
}

#[tokio::test]
async fn test_failed_send_does_not_stall_the_window() {
    let mut h = Harness::rejecting(2, 1, Some(json!("broken")));
    let mut out = collect(h.dispatcher.dispatch(requests(&["A", "broken", "B"])));

    let a = h.next_sent().await;
    let b = h.next_sent().await;
    assert_eq!(a.body, json!("A"));
    assert_eq!(b.body, json!("B"));

    h.answer(&a);
    h.answer(&b);
    assert_eq!(next(&mut out).await.body, json!("A"));
    assert_eq!(next(&mut out).await.body, json!("B"));
    assert!(finished(&mut out).await);
    assert_eq!(h.dispatcher.outstanding().await, 0);
}

#[tokio::test]
async fn test_zero_prefetch_sends_nothing() {
    let mut h = Harness::new(0, 1);
    let mut out = collect(h.dispatcher.dispatch(requests(&["A", "B"])));

    assert!(finished(&mut out).await);
    assert!(h.nothing_sent().await);
}
