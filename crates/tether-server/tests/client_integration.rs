//! End-to-end tests with the transport client over both channel kinds.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use common::{TestServer, client_handler};
use serde_json::json;
use tether_protocol::headers;
use tether_rpc::{Router, RpcError};
use tether_server::ServerConfig;
use tether_session::SessionConfig;
use tether_transport::{ChannelError, DuplexChannel, HttpChannel, HttpChannelConfig};

#[tokio::test]
async fn test_http_client_round_trip() -> Result<()> {
    let server = TestServer::start().await?;
    let (client, channel) = server.http_client(Router::new()).await?;

    let info = client.server_info().expect("handshake result");
    assert_eq!(info.server_info.name, "tether");
    assert!(channel.session_id().is_some());

    let result = client.request("echo", Some(json!({"a": 1}))).await?;
    assert_eq!(result, json!({"a": 1}));

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_http_write_to_unknown_session_fails() -> Result<()> {
    let server = TestServer::start().await?;
    let channel = HttpChannel::connect(
        HttpChannelConfig::new(server.endpoint()).with_session("bogus-session", None),
    )?;

    let outcome = channel
        .write(br#"{"jsonrpc":"2.0","id":5,"method":"echo"}"#)
        .await;
    match outcome {
        Err(e @ ChannelError::Write { status: 404, .. }) => assert!(e.is_session_lost()),
        other => anyhow::bail!("expected a 404 write error, got {other:?}"),
    }

    // Notifications go through the same check.
    let outcome = channel
        .write(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
        .await;
    assert!(matches!(outcome, Err(ChannelError::Write { status: 404, .. })));
    Ok(())
}

#[tokio::test]
async fn test_http_request_write_returns_while_handler_runs() -> Result<()> {
    let server = TestServer::start().await?;
    let (client, _channel) = server.http_client(Router::new()).await?;

    // The request POST is answered on an event stream, so the write
    // completes before the handler does.
    let call = tokio::time::timeout(
        Duration::from_secs(2),
        client.start("wait_for_cancel", None),
    )
    .await??;
    server.signals.wait_started().await?;

    client.cancel(call.id(), None).await?;
    server.signals.wait_cancelled().await?;
    Ok(())
}

#[tokio::test]
async fn test_http_progress_is_monotonic() -> Result<()> {
    let server = TestServer::start().await?;
    let (client, _channel) = server.http_client(Router::new()).await?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let result = client
        .request_with_progress("count", None, {
            let seen = Arc::clone(&seen);
            move |update| seen.lock().unwrap().push(update.progress)
        })
        .await?;

    assert_eq!(result, json!({"rejected": 1}));
    assert_eq!(*seen.lock().unwrap(), vec![10.0, 25.0, 40.0]);
    Ok(())
}

#[tokio::test]
async fn test_http_server_initiated_request() -> Result<()> {
    let server = TestServer::start().await?;
    let (client, _channel) = server.http_client(client_handler()).await?;

    let result = client.request("ask_client", Some(json!("hello"))).await?;
    assert_eq!(result, json!({"echoed": "hello"}));
    Ok(())
}

#[tokio::test]
async fn test_http_cancellation_reaches_handler() -> Result<()> {
    let server = TestServer::start().await?;
    let (client, _channel) = server.http_client(Router::new()).await?;

    let call = client.start("wait_for_cancel", None).await?;
    server.signals.wait_started().await?;

    client.cancel(call.id(), Some("user abort")).await?;
    server.signals.wait_cancelled().await?;

    assert!(matches!(call.response().await, Err(RpcError::ChannelClosed)));

    // The session is still usable.
    assert_eq!(client.request("echo", Some(json!(7))).await?, json!(7));
    Ok(())
}

#[tokio::test]
async fn test_http_session_deletion_fails_outstanding_calls() -> Result<()> {
    let server = TestServer::start().await?;
    let (client, channel) = server.http_client(Router::new()).await?;
    let session_id = channel.session_id().expect("session id");

    let call = client.start("wait_for_cancel", None).await?;
    server.signals.wait_started().await?;

    let resp = server
        .client
        .delete(server.endpoint())
        .header(headers::SESSION_ID, session_id)
        .send()
        .await?;
    assert_eq!(resp.status(), 200);

    let outcome = tokio::time::timeout(Duration::from_secs(5), call.response()).await?;
    assert!(matches!(outcome, Err(RpcError::ChannelClosed)));
    server.signals.wait_cancelled().await?;
    Ok(())
}

#[tokio::test]
async fn test_http_stream_resumes_after_drop() -> Result<()> {
    let server = TestServer::start().await?;
    let (client, channel) = server.http_client(client_handler()).await?;

    // Emit events so the channel tracks a last event id.
    client.request("emit", Some(json!({"count": 2}))).await?;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while channel.last_event_id() != Some(2) {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "events not received");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Re-arming the stream replaces the previous GET on the server.
    channel.reconnect().await?;
    let result = client.request("ask_client", Some(json!(1))).await?;
    assert_eq!(result, json!({"echoed": 1}));
    Ok(())
}

#[tokio::test]
async fn test_http_close_releases_session() -> Result<()> {
    let server = TestServer::start().await?;
    let (client, channel) = server.http_client(Router::new()).await?;
    let session_id = channel.session_id().expect("session id");

    client.close().await?;
    assert!(matches!(
        client.request("echo", None).await,
        Err(RpcError::ChannelClosed)
    ));

    let resp = server.open_stream(Some(&session_id), None).await?;
    assert_eq!(resp.status(), 404);
    Ok(())
}

#[tokio::test]
async fn test_http_idle_expiry_closes_client() -> Result<()> {
    let config = ServerConfig::new().with_session(
        SessionConfig::default()
            .with_idle_timeout(Duration::from_millis(200))
            .with_reap_interval(Duration::from_millis(50)),
    );
    let server = TestServer::start_with(config, |s| s).await?;
    let (client, _channel) = server.http_client(Router::new()).await?;

    let call = client.start("wait_for_cancel", None).await?;
    let outcome = tokio::time::timeout(Duration::from_secs(5), call.response()).await?;
    assert!(matches!(outcome, Err(RpcError::ChannelClosed)));
    server.signals.wait_cancelled().await?;
    Ok(())
}

#[tokio::test]
async fn test_ws_client_round_trip() -> Result<()> {
    let server = TestServer::start().await?;
    let client = server.ws_client(client_handler()).await?;

    assert_eq!(client.request("echo", Some(json!("x"))).await?, json!("x"));

    let result = client.request("ask_client", Some(json!([1]))).await?;
    assert_eq!(result, json!({"echoed": [1]}));

    let seen = Arc::new(Mutex::new(Vec::new()));
    client
        .request_with_progress("count", None, {
            let seen = Arc::clone(&seen);
            move |update| seen.lock().unwrap().push(update.progress)
        })
        .await?;
    assert_eq!(*seen.lock().unwrap(), vec![10.0, 25.0, 40.0]);

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_ws_cancellation() -> Result<()> {
    let server = TestServer::start().await?;
    let client = server.ws_client(Router::new()).await?;

    let call = client.start("wait_for_cancel", None).await?;
    server.signals.wait_started().await?;
    client.cancel(call.id(), None).await?;
    server.signals.wait_cancelled().await?;

    assert!(matches!(call.response().await, Err(RpcError::ChannelClosed)));
    Ok(())
}

#[tokio::test]
async fn test_ws_request_before_initialize_is_refused() -> Result<()> {
    let server = TestServer::start().await?;
    let channel = Arc::new(
        tether_transport::WsChannel::connect(tether_transport::WsChannelConfig::new(
            server.endpoint(),
        ))
        .await?,
    );

    channel
        .write(br#"{"jsonrpc":"2.0","id":9,"method":"echo"}"#)
        .await?;
    let mut buf = [0u8; 512];
    let n = channel.read(&mut buf).await?;
    let reply: serde_json::Value = serde_json::from_slice(buf[..n].trim_ascii_end())?;
    assert_eq!(reply["id"], 9);
    assert_eq!(
        reply["error"]["code"],
        tether_protocol::JsonRpcError::INVALID_REQUEST
    );

    channel.close().await?;
    Ok(())
}
