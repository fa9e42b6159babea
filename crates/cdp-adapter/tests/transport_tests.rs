//! Drives `SocketTransport` against a scripted peer on an in-memory channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cdp_adapter::transport::ClosedCallback;
use cdp_adapter::{
    memory_channel, AdapterErrorKind, CdpTransport, MemoryChannel, MessageChannel,
    SocketTransport, TransportConfig,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn config(timeout_ms: Option<u64>) -> TransportConfig {
    TransportConfig {
        websocket_url: None,
        default_timeout_ms: timeout_ms,
    }
}

/// Echoes every command back as `{ "echo": <method> }` except `Fail.*`, which
/// answers with a protocol error, and `Hang.*`, which never answers.
fn spawn_runtime(mut peer: MemoryChannel) -> tokio::task::JoinHandle<Vec<Value>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(Ok(text)) = peer.recv_text().await {
            let req: Value = serde_json::from_str(&text).unwrap();
            let method = req["method"].as_str().unwrap_or_default().to_string();
            seen.push(req.clone());
            let reply = if method.starts_with("Fail.") {
                json!({ "id": req["id"], "error": { "code": -32601, "message": format!("'{method}' wasn't found") } })
            } else if method.starts_with("Hang.") {
                continue;
            } else {
                json!({ "id": req["id"], "result": { "echo": method } })
            };
            if peer.send_text(reply.to_string()).await.is_err() {
                break;
            }
        }
        seen
    })
}

#[tokio::test]
async fn sends_envelopes_with_increasing_ids() {
    let (local, peer) = memory_channel();
    let runtime = spawn_runtime(peer);
    let transport = SocketTransport::new(local, &config(None), None);

    for method in ["Runtime.enable", "Debugger.enable", "Profiler.start"] {
        let value = transport.send_command(method, json!({})).await.unwrap();
        assert_eq!(value, json!({ "echo": method }));
    }
    transport.close();

    let seen = runtime.await.unwrap();
    let ids: Vec<u64> = seen.iter().map(|req| req["id"].as_u64().unwrap()).collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(seen[0]["params"], json!({}));
}

#[tokio::test]
async fn protocol_errors_do_not_poison_the_connection() {
    let (local, peer) = memory_channel();
    let _runtime = spawn_runtime(peer);
    let transport = SocketTransport::new(local, &config(None), None);

    let err = transport
        .send_command("Fail.unknownMethod", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind, AdapterErrorKind::Protocol);
    assert_eq!(err.protocol_code(), Some(-32601));

    let ok = transport.send_command("Runtime.enable", json!({})).await;
    assert!(ok.is_ok());
}

#[tokio::test]
async fn default_timeout_applies_to_unanswered_commands() {
    let (local, peer) = memory_channel();
    let _runtime = spawn_runtime(peer);
    let transport = SocketTransport::new(local, &config(Some(25)), None);

    let err = transport
        .send_command("Hang.forever", json!({}))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    let explicit = transport
        .send_with_timeout("Runtime.enable", json!({}), Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(explicit, json!({ "echo": "Runtime.enable" }));
}

#[tokio::test]
async fn explicit_close_runs_callback_once() {
    let (local, peer) = memory_channel();
    let _runtime = spawn_runtime(peer);
    let count = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let callback: ClosedCallback = {
        let count = count.clone();
        Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        })
    };
    let transport = SocketTransport::new(local, &config(None), Some(callback));

    transport.close();
    transport.close();
    rx.await.unwrap();

    assert!(transport.is_closed());
    assert!(transport.next_event().await.is_none());
    let err = transport.send_command("Runtime.enable", json!({})).await.unwrap_err();
    assert!(err.is_closed());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}
