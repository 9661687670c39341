//! Failure injection tests for the split proxy.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::StatusCode;
use futures_util::StreamExt;
use serde_json::Value;

use split_rpc_proxy::http::RpcEnvelope;
use split_rpc_proxy::proxy::{DispatchEngine, RequestContext, StreamingRelay};

mod common;
use common::{eventually, proxy_config, rpc_body, start_proxy, start_upstream, unreachable_url, Script};

#[tokio::test]
async fn test_stream_endpoint_down_returns_502() {
    let down = unreachable_url().await;
    let compare = start_upstream(Script::json(r#"{"result":"0x1"}"#)).await;
    let proxy = start_proxy(proxy_config(&down, &compare.url)).await;

    let res = reqwest::Client::new()
        .post(&proxy.url)
        .body(rpc_body("eth_chainId", 9))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], 9);
    assert_eq!(body["error"]["code"], -32603);
    assert_eq!(body["error"]["message"], "Internal error: unable to connect to upstream");
    assert_eq!(body["error"]["data"]["streamEndpoint"], down.as_str());
    assert_eq!(body["error"]["data"]["compareEndpoint"], compare.url.as_str());
    assert!(body["error"]["data"]["error"].as_str().unwrap().contains(down.trim_end_matches('/')));
    proxy.shutdown.trigger("test");
}

#[tokio::test]
async fn test_compare_endpoint_down_is_invisible_to_client() {
    let stream = start_upstream(Script::json(r#"{"jsonrpc":"2.0","result":"0x2a","id":1}"#)).await;
    let down = unreachable_url().await;
    let proxy = start_proxy(proxy_config(&stream.url, &down)).await;

    let res = reqwest::Client::new()
        .post(&proxy.url)
        .body(rpc_body("eth_blockNumber", 1))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), r#"{"jsonrpc":"2.0","result":"0x2a","id":1}"#);
    proxy.shutdown.trigger("test");
}

#[tokio::test]
async fn test_slow_stream_endpoint_times_out_with_504() {
    let stream = start_upstream(Script::json("{}").with_head_delay(Duration::from_secs(2))).await;
    let compare = start_upstream(Script::json("{}")).await;
    let mut config = proxy_config(&stream.url, &compare.url);
    config.timeouts.request_ms = 200;
    let proxy = start_proxy(config).await;

    let res = reqwest::Client::new()
        .post(&proxy.url)
        .body(rpc_body("debug_traceTransaction", 3))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32000);
    assert_eq!(body["error"]["message"], "Request timeout");
    assert_eq!(body["id"], 3);
    proxy.shutdown.trigger("test");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_is_504_under_concurrency() {
    let stream = start_upstream(Script::json("{}").with_head_delay(Duration::from_secs(5))).await;
    let compare = start_upstream(Script::json("{}")).await;
    let mut config = proxy_config(&stream.url, &compare.url);
    config.timeouts.request_ms = 100;
    let proxy = start_proxy(config).await;
    let client = reqwest::Client::new();

    let mut tasks = Vec::new();
    for id in 0..40u64 {
        let client = client.clone();
        let url = proxy.url.clone();
        tasks.push(tokio::spawn(async move {
            let res = client.post(&url).body(rpc_body("eth_call", id)).send().await.unwrap();
            let status = res.status();
            let body: Value = res.json().await.unwrap();
            (status, body)
        }));
    }

    for task in tasks {
        let (status, body) = task.await.unwrap();
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["error"]["code"], -32000);
    }
    proxy.shutdown.trigger("test");
}

#[tokio::test]
async fn test_client_disconnect_mid_stream_drains_upstream() {
    let chunk = Bytes::from(vec![b'x'; 1024]);
    let stream = start_upstream(Script::chunked(vec![chunk; 8], Duration::from_millis(30))).await;
    let compare = start_upstream(Script::json("{}")).await;
    let config = proxy_config(&stream.url, &compare.url);
    let engine = DispatchEngine::from_config(&config).unwrap();

    let body = Bytes::from(rpc_body("eth_getLogs", 1));
    let ctx = RequestContext::new(
        "disconnect-test",
        RpcEnvelope::parse(&body).unwrap(),
        body,
        Duration::from_secs(5),
    );
    let (mut inbound, pending) = engine.open_inbound(&ctx);
    let endpoint = engine.stream_endpoint();
    let client = engine.pool().get_client(endpoint.url());

    let relay = tokio::spawn(async move {
        let result = StreamingRelay::new(None)
            .relay(&ctx, &endpoint, &client, &mut inbound)
            .await;
        (result, ctx)
    });

    let response = pending.into_response(Value::Null).await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut received = response.into_body().into_data_stream();
    let first = received.next().await.unwrap().unwrap();
    assert!(!first.is_empty());
    drop(received);

    let (result, ctx) = relay.await.unwrap();
    let summary = result.expect("relay finishes after the client leaves");
    assert_eq!(summary.raw_len, 8 * 1024);
    assert_eq!(summary.status, StatusCode::OK);
    assert!(ctx.client().is_closed());
    assert_eq!(stream.completed(), 1);
}

#[tokio::test]
async fn test_slow_client_does_not_inflate_stream_latency() {
    let stream = start_upstream(Script::json(r#"{"result":"0x1"}"#)).await;
    let compare = start_upstream(Script::json("{}")).await;
    let config = proxy_config(&stream.url, &compare.url);
    let engine = DispatchEngine::from_config(&config).unwrap();

    let body = Bytes::from(rpc_body("eth_chainId", 1));
    let ctx = RequestContext::new("slow-reader", RpcEnvelope::parse(&body).unwrap(), body, Duration::from_secs(5));
    let (mut inbound, pending) = engine.open_inbound(&ctx);
    let endpoint = engine.stream_endpoint();
    let client = engine.pool().get_client(endpoint.url());

    let relay = tokio::spawn(async move {
        StreamingRelay::new(None)
            .relay(&ctx, &endpoint, &client, &mut inbound)
            .await
    });

    let response = pending.into_response(Value::Null).await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    let received = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&received[..], br#"{"result":"0x1"}"#);

    let summary = relay.await.unwrap().unwrap();
    assert!(summary.latency < Duration::from_millis(400), "latency {:?}", summary.latency);
    assert!(summary.client_drain >= Duration::from_millis(400), "drain {:?}", summary.client_drain);
}

#[tokio::test]
async fn test_compare_leg_runs_after_client_disconnect() {
    let stream = start_upstream(Script::chunked(vec![Bytes::from_static(b"{}"); 4], Duration::from_millis(50))).await;
    let compare = start_upstream(Script::json("{}").with_head_delay(Duration::from_millis(300))).await;
    let proxy = start_proxy(proxy_config(&stream.url, &compare.url)).await;

    let request = reqwest::Client::new()
        .post(&proxy.url)
        .body(rpc_body("eth_getBlockByNumber", 1))
        .timeout(Duration::from_millis(60))
        .send();
    // Give up on the response long before either leg is done.
    let _ = request.await;

    assert!(eventually(|| stream.completed() == 1).await);
    assert!(eventually(|| compare.completed() == 1).await);
    proxy.shutdown.trigger("test");
}

#[tokio::test]
async fn test_retired_idle_connection_is_replaced() {
    let stream = start_upstream(Script::json(r#"{"result":"0x1"}"#)).await;
    let compare = start_upstream(Script::json(r#"{"result":"0x1"}"#)).await;
    let config = proxy_config(&stream.url, &compare.url);
    let engine = Arc::new(DispatchEngine::from_config(&config).unwrap());
    let pooled = engine.pool().get_client(engine.stream_endpoint().url());

    let send = |id: u64| {
        let engine = engine.clone();
        async move {
            let body = Bytes::from(rpc_body("eth_chainId", id));
            let ctx = Arc::new(RequestContext::new(
                format!("retire-{}", id),
                RpcEnvelope::parse(&body).unwrap(),
                body,
                Duration::from_secs(5),
            ));
            let (inbound, pending) = engine.open_inbound(&ctx);
            let task = {
                let engine = engine.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move { engine.handle(ctx, inbound).await })
            };
            let response = pending.into_response(Value::Null).await;
            let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
            task.await.unwrap();
            body
        }
    };

    assert_eq!(&send(1).await[..], br#"{"result":"0x1"}"#);
    assert!(eventually(|| pooled.connections().counts().idle == 1).await);

    assert_eq!(pooled.connections().retire_idle(|_| true), 1);
    assert!(eventually(|| pooled.connections().counts().total == 0).await);

    assert_eq!(&send(2).await[..], br#"{"result":"0x1"}"#);
    assert_eq!(stream.hits(), 2);
}
