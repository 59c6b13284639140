//! Request/response over a single topic.
//!
//! One client plays both sides: a handler answers `echo` and `add` requests,
//! and the same client sends requests and awaits the answers.
//!
//! ```text
//! RUST_LOG=hcs10_client=debug cargo run --example request_response
//! ```

use std::time::Duration;

use hcs10_client::transport::MemoryTransport;
use hcs10_client::{handler_fn, Client, ErrorInfo, Hcs10Error, RequestOutcome, ResponseStatus};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let transport = MemoryTransport::new();
    let topic = transport.create_topic(Some("HCS-10 Request-Response Example Topic"));

    let client = Client::builder(transport)
        .sender("0.0.1234")
        .request_timeout(Duration::from_secs(5))
        .subscribe(&topic)
        .start()
        .await?;

    // Server side: answer requests that ask for a response.
    let server = client.clone();
    client.add_handler(
        &topic,
        handler_fn(move |envelope| {
            let server = server.clone();
            async move {
                let Some((request, true)) = envelope.as_request() else {
                    return Ok(());
                };
                tracing::info!(request_id = %envelope.id, action = %request.action, "Server processing request");

                let (status, result, error) = match request.action.as_str() {
                    "echo" => (ResponseStatus::Success, Some(json!({ "echo": request.parameters })), None),
                    "add" => {
                        let number = |name: &str| {
                            request
                                .parameters
                                .as_ref()
                                .and_then(|p| p.get(name))
                                .and_then(Value::as_f64)
                                .unwrap_or(0.0)
                        };
                        let sum = number("a") + number("b");
                        (ResponseStatus::Success, Some(json!({ "sum": sum })), None)
                    }
                    other => (
                        ResponseStatus::Failure,
                        None,
                        Some(ErrorInfo::new("UNKNOWN_ACTION", format!("Unknown action: {other}"))),
                    ),
                };

                server
                    .send_response(&envelope.topic_id, &envelope.id, status, result, error)
                    .await
                    .map(|_| ())
            }
        }),
    );

    let requests = [
        ("echo", json!({ "message": "Hello, HCS-10!" })),
        ("add", json!({ "a": 5, "b": 7 })),
        ("unknown", json!({ "foo": "bar" })),
    ];
    for (action, parameters) in requests {
        let parameters = parameters.as_object().cloned();
        match client.send_request(&topic, action, parameters, true).await {
            Ok(RequestOutcome::Response(response)) => {
                tracing::info!(action, payload = ?response.as_response(), "Received response");
            }
            Ok(RequestOutcome::Sent(_)) => unreachable!("response was required"),
            Err(Hcs10Error::RequestTimeout { id, timeout_ms }) => {
                tracing::warn!(action, request_id = %id, timeout_ms, "No response");
            }
            Err(e) => return Err(e.into()),
        }
    }

    client.send_notification(&topic, "done", json!({ "requests": 3 })).await?;
    client.close();
    Ok(())
}
