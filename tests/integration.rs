//! Integration tests for hcs10-client.
//!
//! These drive full clients over the in-memory transport: requester and
//! responder talk only through topic messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hcs10_client::handler::BoxFuture;
use hcs10_client::transport::{DeliveryStream, MemoryTransport, Transport};
use hcs10_client::{
    handler_fn, Client, Envelope, ErrorInfo, HandlerRef, Hcs10Error, RequestOutcome,
    ResponseStatus, TransactionId, WireFormat,
};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Notify};

fn params(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Answers `echo`, `add` and anything else (with a FAILURE).
fn responder(client: &Client) -> HandlerRef {
    let client = client.clone();
    handler_fn(move |envelope| {
        let client = client.clone();
        async move {
            let Some((request, true)) = envelope.as_request() else {
                return Ok(());
            };
            let topic = envelope.topic_id.as_str();
            match request.action.as_str() {
                "echo" => {
                    let echo = json!({ "echo": request.parameters });
                    client
                        .send_response(topic, &envelope.id, ResponseStatus::Success, Some(echo), None)
                        .await?
                }
                "add" => {
                    let arg = |name: &str| {
                        request
                            .parameters
                            .as_ref()
                            .and_then(|p| p.get(name))
                            .and_then(Value::as_i64)
                            .unwrap_or(0)
                    };
                    let sum = json!({ "sum": arg("a") + arg("b") });
                    client
                        .send_response(topic, &envelope.id, ResponseStatus::Success, Some(sum), None)
                        .await?
                }
                other => {
                    let error = ErrorInfo::new("UNKNOWN_ACTION", format!("Unknown action: {other}"));
                    client
                        .send_response(topic, &envelope.id, ResponseStatus::Failure, None, Some(error))
                        .await?
                }
            };
            Ok::<(), Hcs10Error>(())
        }
    })
}

fn collector() -> (HandlerRef, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |envelope| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(envelope);
            Ok(())
        }
    });
    (handler, rx)
}

async fn started(transport: &MemoryTransport, sender: &str, topic: &str) -> Client {
    Client::builder(transport.clone())
        .sender(sender)
        .subscribe(topic)
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_echo_resolves_well_before_deadline() {
    let transport = MemoryTransport::new();
    let topic = transport.create_topic(Some("echo"));
    let client = started(&transport, "0.0.42", &topic).await;
    client.add_handler(&topic, responder(&client));

    let started_at = Instant::now();
    let outcome = client
        .send_request_with_timeout(
            &topic,
            "echo",
            params(json!({"msg": "hi"})),
            true,
            Duration::from_millis(1000),
        )
        .await
        .unwrap();
    let elapsed = started_at.elapsed();

    let response = outcome.response().expect("awaited a response").clone();
    let payload = response.as_response().unwrap();
    assert_eq!(payload.status, ResponseStatus::Success);
    assert_eq!(payload.result, Some(json!({"echo": {"msg": "hi"}})));
    assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_separate_requester_and_responder() {
    let transport = MemoryTransport::new();
    let topic = transport.create_topic(None);
    let requester = started(&transport, "0.0.100", &topic).await;
    let server = started(&transport, "0.0.200", &topic).await;
    server.add_handler(&topic, responder(&server));

    let outcome = requester
        .send_request(&topic, "add", params(json!({"a": 5, "b": 7})), true)
        .await
        .unwrap();
    let response = outcome.into_envelope();
    assert_eq!(response.sender, "0.0.200");
    assert_eq!(response.as_response().unwrap().result, Some(json!({"sum": 12})));

    let outcome = requester
        .send_request(&topic, "unknown", params(json!({"foo": "bar"})), true)
        .await
        .unwrap();
    let failure = outcome.response().unwrap().as_response().unwrap().clone();
    assert_eq!(failure.status, ResponseStatus::Failure);
    assert_eq!(failure.error.unwrap().code, "UNKNOWN_ACTION");
}

#[tokio::test]
async fn test_timeout_then_late_response_dropped() {
    let transport = MemoryTransport::new();
    let topic = transport.create_topic(None);
    let client = started(&transport, "0.0.42", &topic).await;
    let (seen, mut seen_rx) = collector();
    client.add_handler(&topic, seen);

    let started_at = Instant::now();
    let err = client
        .send_request_with_timeout(&topic, "silence", None, true, Duration::from_millis(200))
        .await
        .unwrap_err();
    let elapsed = started_at.elapsed();

    let (id, timeout_ms) = match err {
        Hcs10Error::RequestTimeout { id, timeout_ms } => (id, timeout_ms),
        other => panic!("expected timeout, got {other}"),
    };
    assert_eq!(timeout_ms, 200);
    assert!(elapsed >= Duration::from_millis(200), "took {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "took {elapsed:?}");
    assert_eq!(client.pending_requests(), 0);

    // The late response is still a message on the topic, just unmatched.
    client
        .send_response(&topic, &id, ResponseStatus::Success, None, None)
        .await
        .unwrap();
    loop {
        let envelope = seen_rx.recv().await.unwrap();
        if envelope.correlation_id() == Some(id.as_str()) {
            break;
        }
    }
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_duplicate_response_matched_once() {
    let transport = MemoryTransport::new();
    let topic = transport.create_topic(None);
    let client = started(&transport, "0.0.42", &topic).await;

    let replier = client.clone();
    client.add_handler(
        &topic,
        handler_fn(move |envelope| {
            let replier = replier.clone();
            async move {
                if envelope.is_request() {
                    for n in [1, 2] {
                        replier
                            .send_response(
                                &envelope.topic_id,
                                &envelope.id,
                                ResponseStatus::Success,
                                Some(json!(n)),
                                None,
                            )
                            .await?;
                    }
                }
                Ok::<(), Hcs10Error>(())
            }
        }),
    );
    let (seen, mut seen_rx) = collector();
    client.add_handler(&topic, seen);

    let outcome = client.send_request(&topic, "twice", None, true).await.unwrap();
    let response = outcome.response().unwrap();
    assert_eq!(response.as_response().unwrap().result, Some(json!(1)));

    // Both responses reach the handlers; only the first was matched.
    let mut responses = 0;
    while responses < 2 {
        if seen_rx.recv().await.unwrap().is_response() {
            responses += 1;
        }
    }
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_complete_out_of_order() {
    let transport = MemoryTransport::new();
    let topic = transport.create_topic(None);
    let client = started(&transport, "0.0.42", &topic).await;

    // Replies from spawned tasks so the slow one does not hold the worker.
    let replier = client.clone();
    client.add_handler(
        &topic,
        handler_fn(move |envelope| {
            let replier = replier.clone();
            async move {
                let Some((request, true)) = envelope.as_request() else {
                    return Ok(());
                };
                let delay = if request.action == "slow" { 150 } else { 10 };
                let action = request.action.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    let _ = replier
                        .send_response(
                            &envelope.topic_id,
                            &envelope.id,
                            ResponseStatus::Success,
                            Some(json!(action)),
                            None,
                        )
                        .await;
                });
                Ok(())
            }
        }),
    );

    let order = Arc::new(Mutex::new(Vec::new()));
    let run = |action: &'static str| {
        let client = client.clone();
        let topic = topic.clone();
        let order = order.clone();
        async move {
            let outcome = client.send_request(&topic, action, None, true).await.unwrap();
            order.lock().unwrap().push(action);
            outcome
        }
    };

    let (slow, fast) = tokio::join!(run("slow"), run("fast"));

    assert_eq!(slow.response().unwrap().as_response().unwrap().result, Some(json!("slow")));
    assert_eq!(fast.response().unwrap().as_response().unwrap().result, Some(json!("fast")));
    assert_eq!(*order.lock().unwrap(), vec!["fast", "slow"]);
}

#[tokio::test]
async fn test_handler_fan_out_order() {
    let transport = MemoryTransport::new();
    let topic = transport.create_topic(None);
    let client = started(&transport, "0.0.42", &topic).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let (done, mut done_rx) = collector();
    for name in ["h1", "h2"] {
        let log = log.clone();
        client.add_handler(
            &topic,
            handler_fn(move |envelope| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push((name, envelope.id));
                    Ok(())
                }
            }),
        );
    }
    client.add_handler(&topic, done);

    let mut ids = Vec::new();
    for i in 0..3 {
        let tx = client.send_notification(&topic, "tick", json!(i)).await;
        assert!(tx.is_ok());
    }
    for _ in 0..3 {
        ids.push(done_rx.recv().await.unwrap().id);
    }

    let expected: Vec<(&str, String)> = ids
        .iter()
        .flat_map(|id| [("h1", id.clone()), ("h2", id.clone())])
        .collect();
    assert_eq!(*log.lock().unwrap(), expected);
}

#[tokio::test]
async fn test_failing_handler_is_isolated() {
    let transport = MemoryTransport::new();
    let topic = transport.create_topic(None);
    let client = started(&transport, "0.0.42", &topic).await;

    client.add_handler(
        &topic,
        handler_fn(|_| async { Err(Hcs10Error::handler("always fails")) }),
    );
    client.add_handler(&topic, responder(&client));

    let outcome = client
        .send_request_with_timeout(&topic, "echo", None, true, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(outcome.response().unwrap().as_response().unwrap().is_success());
}

#[tokio::test]
async fn test_remove_handler() {
    let transport = MemoryTransport::new();
    let topic = transport.create_topic(None);
    let client = started(&transport, "0.0.42", &topic).await;

    let (never_added, _rx) = collector();
    assert!(!client.remove_handler(&topic, &never_added));

    let (seen, mut seen_rx) = collector();
    client.add_handler(&topic, seen.clone());
    assert!(client.remove_handler(&topic, &seen));
    assert!(!client.remove_handler(&topic, &seen));

    let (marker, mut marker_rx) = collector();
    client.add_handler(&topic, marker);
    client
        .send_notification(&topic, "after-remove", Value::Null)
        .await
        .unwrap();
    marker_rx.recv().await.unwrap();
    assert!(seen_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_malformed_messages_do_not_break_subscription() {
    let transport = MemoryTransport::new();
    let topic = transport.create_topic(None);
    let client = started(&transport, "0.0.42", &topic).await;
    client.add_handler(&topic, responder(&client));

    let garbage: [&[u8]; 3] = [
        b"not json",
        br#"{"type":"REQUEST"}"#,
        br#"{"id":"x","timestamp":"t","topicId":"t","sender":"s","type":"PING","payload":{}}"#,
    ];
    for garbage in garbage {
        transport
            .submit(&topic, Bytes::copy_from_slice(garbage))
            .await
            .unwrap();
    }

    let outcome = client
        .send_request_with_timeout(&topic, "echo", None, true, Duration::from_secs(2))
        .await;
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn test_msgpack_wire_format_end_to_end() {
    let transport = MemoryTransport::new();
    let topic = transport.create_topic(None);
    let client = Client::builder(transport.clone())
        .sender("0.0.42")
        .wire_format(WireFormat::MsgPack)
        .subscribe(&topic)
        .start()
        .await
        .unwrap();
    client.add_handler(&topic, responder(&client));

    let outcome = client
        .send_request(&topic, "add", params(json!({"a": 2, "b": 40})), true)
        .await
        .unwrap();
    assert_eq!(
        outcome.response().unwrap().as_response().unwrap().result,
        Some(json!({"sum": 42}))
    );

    let first = &transport.messages(&topic)[0];
    assert!(serde_json::from_slice::<Value>(&first.contents).is_err());
    assert!(Envelope::decode(&first.contents, WireFormat::MsgPack).is_ok());
}

#[tokio::test]
async fn test_close_fails_in_flight_requests() {
    let transport = MemoryTransport::new();
    let topic = transport.create_topic(None);
    let client = started(&transport, "0.0.42", &topic).await;

    let requester = client.clone();
    let topic_for_task = topic.clone();
    let in_flight = tokio::spawn(async move {
        requester
            .send_request(&topic_for_task, "never-answered", None, true)
            .await
    });

    while client.pending_requests() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    client.close();

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(Hcs10Error::ClientClosed)));
    assert_eq!(client.pending_requests(), 0);
    assert!(transport.is_closed());
}

#[tokio::test]
async fn test_subscribe_from_replays_history() {
    let transport = MemoryTransport::new();
    let topic = transport.create_topic(None);
    let publisher = Client::builder(transport.clone())
        .sender("0.0.1")
        .start()
        .await
        .unwrap();
    publisher
        .send_notification(&topic, "before", json!({"n": 1}))
        .await
        .unwrap();

    let (seen, mut seen_rx) = collector();
    let late = Client::builder(transport.clone())
        .handler(&topic, seen)
        .subscribe_from(&topic, chrono::DateTime::<chrono::Utc>::MIN_UTC)
        .start()
        .await
        .unwrap();
    assert!(late.subscription_for(&topic).is_some());

    let replayed = seen_rx.recv().await.unwrap();
    assert_eq!(replayed.as_notification().unwrap().event, "before");
    assert_eq!(replayed.sender, "0.0.1");
}

/// Sets its flag when dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Memory transport that reports when it is dropped.
struct TrackedTransport {
    inner: MemoryTransport,
    _flag: DropFlag,
}

impl Transport for TrackedTransport {
    fn submit<'a>(
        &'a self,
        topic_id: &'a str,
        message: Bytes,
    ) -> BoxFuture<'a, hcs10_client::Result<TransactionId>> {
        self.inner.submit(topic_id, message)
    }

    fn subscribe<'a>(
        &'a self,
        topic_id: &'a str,
        start_time: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, hcs10_client::Result<DeliveryStream>> {
        self.inner.subscribe(topic_id, start_time)
    }

    fn close(&self) {
        self.inner.close();
    }
}

/// Memory transport whose `subscribe` waits to be released.
struct GatedTransport {
    inner: MemoryTransport,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Transport for GatedTransport {
    fn submit<'a>(
        &'a self,
        topic_id: &'a str,
        message: Bytes,
    ) -> BoxFuture<'a, hcs10_client::Result<TransactionId>> {
        self.inner.submit(topic_id, message)
    }

    fn subscribe<'a>(
        &'a self,
        topic_id: &'a str,
        start_time: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, hcs10_client::Result<DeliveryStream>> {
        Box::pin(async move {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.subscribe(topic_id, start_time).await
        })
    }
}

#[tokio::test]
async fn test_close_releases_handlers_holding_the_client() {
    let memory = MemoryTransport::new();
    let topic = memory.create_topic(None);
    let transport_dropped = Arc::new(AtomicBool::new(false));
    let handler_dropped = Arc::new(AtomicBool::new(false));

    let client = Client::builder(TrackedTransport {
        inner: memory.clone(),
        _flag: DropFlag(transport_dropped.clone()),
    })
    .subscribe(&topic)
    .start()
    .await
    .unwrap();

    let held = client.clone();
    let guard = DropFlag(handler_dropped.clone());
    client.add_handler(
        &topic,
        handler_fn(move |_| {
            let _client = held.clone();
            let _guard = &guard;
            async { Ok(()) }
        }),
    );
    client
        .send_notification(&topic, "tick", Value::Null)
        .await
        .unwrap();

    client.close();
    drop(client);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(handler_dropped.load(Ordering::SeqCst), "handler kept alive after close");
    assert!(transport_dropped.load(Ordering::SeqCst), "client kept alive after close");
}

#[tokio::test]
async fn test_subscription_finishing_after_close_is_dropped() {
    let memory = MemoryTransport::new();
    let topic = memory.create_topic(None);
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let client = Client::builder(GatedTransport {
        inner: memory.clone(),
        entered: entered.clone(),
        release: release.clone(),
    })
    .start()
    .await
    .unwrap();

    let subscriber = client.clone();
    let topic_for_task = topic.clone();
    let subscribing =
        tokio::spawn(async move { subscriber.subscribe_topic(&topic_for_task, None).await });

    entered.notified().await;
    client.close();
    release.notify_one();

    let result = subscribing.await.unwrap();
    assert!(matches!(result, Err(Hcs10Error::ClientClosed)));
    assert!(client.subscription_for(&topic).is_none());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(memory.subscriber_count(&topic), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_requests_racing_close_never_hang() {
    for _ in 0..50 {
        let transport = MemoryTransport::new();
        let topic = transport.create_topic(None);
        let client = started(&transport, "0.0.42", &topic).await;

        let requester = client.clone();
        let topic_for_task = topic.clone();
        let request = tokio::spawn(async move {
            requester
                .send_request_with_timeout(&topic_for_task, "never", None, true, Duration::MAX)
                .await
        });
        client.close();

        let result = tokio::time::timeout(Duration::from_secs(2), request)
            .await
            .expect("request still waiting after close")
            .unwrap();
        assert!(matches!(
            result,
            Err(Hcs10Error::ClientClosed) | Err(Hcs10Error::Transport { .. })
        ));
        assert_eq!(client.pending_requests(), 0);
    }
}
