//! Pool maintenance against real upstream connections.

use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use futures_util::future::BoxFuture;
use tokio::time::Instant;
use url::Url;

use split_rpc_proxy::upstream::{
    send, Endpoint, EndpointName, EndpointPool, ForwardHeaders, LegMode, PoolSettings, PooledClient,
    RefreshOutcome, Resolve, UpstreamResponse,
};
use split_rpc_proxy::ProxyConfig;

mod common;
use common::{eventually, rpc_body, start_upstream, Script};

/// Answers resolutions in order; fails once the script runs out.
struct ScriptedResolver {
    answers: Mutex<VecDeque<Vec<IpAddr>>>,
}

impl ScriptedResolver {
    fn new(answers: Vec<Vec<IpAddr>>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
        })
    }
}

impl Resolve for ScriptedResolver {
    fn resolve(&self, _host: &str, _port: u16) -> BoxFuture<'static, io::Result<BTreeSet<IpAddr>>> {
        let answer = self.answers.lock().unwrap().pop_front();
        Box::pin(async move {
            answer
                .map(|addrs| addrs.into_iter().collect())
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "script exhausted"))
        })
    }
}

fn loopback(last: u8) -> IpAddr {
    IpAddr::from([127, 0, 0, last])
}

fn chunks() -> Vec<Bytes> {
    (0..4).map(|i| Bytes::from(format!("chunk-{};", i))).collect()
}

const FULL_BODY: &[u8] = b"chunk-0;chunk-1;chunk-2;chunk-3;";

async fn post(client: &PooledClient, endpoint: &Endpoint, id: u64) -> UpstreamResponse {
    let headers = ForwardHeaders {
        request_id: "pool-test",
        accept_encoding: None,
    };
    send(
        client,
        endpoint,
        Bytes::from(rpc_body("eth_chainId", id)),
        LegMode::Streaming,
        headers,
        Instant::now() + Duration::from_secs(5),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_evict_idle_respects_ceiling() {
    let upstream = start_upstream(Script::chunked(chunks(), Duration::from_millis(50))).await;
    let endpoint = Endpoint::new(EndpointName::Primary, Url::parse(&upstream.url).unwrap());

    // Default ceiling: a fresh idle connection stays.
    let mut settings = PoolSettings::from(&ProxyConfig::default());
    let pool = EndpointPool::new(settings.clone());
    let client = pool.get_client(endpoint.url());
    post(&client, &endpoint, 1).await.body.collect().await.unwrap();
    assert!(eventually(|| client.connections().counts().idle == 1).await);
    assert_eq!(pool.evict_idle(), 0);
    assert_eq!(client.connections().counts().total, 1);

    // Tiny ceiling: busy connections are left alone, idle ones are closed.
    settings.idle_ceiling = Duration::from_millis(50);
    let pool = EndpointPool::new(settings);
    let client = pool.get_client(endpoint.url());
    let busy = post(&client, &endpoint, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.evict_idle(), 0);

    assert_eq!(&busy.body.collect().await.unwrap()[..], FULL_BODY);
    assert!(eventually(|| client.connections().counts().idle == 1).await);
    assert_eq!(pool.evict_idle(), 1);
    assert!(eventually(|| client.connections().counts().total == 0).await);
}

#[tokio::test]
async fn test_address_change_retires_only_idle_connections() {
    let upstream = start_upstream(Script::chunked(chunks(), Duration::from_millis(100))).await;
    let endpoint = Endpoint::new(EndpointName::Primary, Url::parse(&upstream.url).unwrap());
    let resolver = ScriptedResolver::new(vec![vec![loopback(1)], vec![loopback(2)]]);
    let pool = EndpointPool::with_resolver(PoolSettings::from(&ProxyConfig::default()), resolver);

    let old = pool.get_client(endpoint.url());
    assert_eq!(pool.refresh_if_stale(endpoint.url()).await, RefreshOutcome::Recorded);

    // Two connections: one finishes and goes idle, one stays in flight.
    let (finished, in_flight) = tokio::join!(post(&old, &endpoint, 1), post(&old, &endpoint, 2));
    assert_eq!(&finished.body.collect().await.unwrap()[..], FULL_BODY);
    assert!(eventually(|| {
        let counts = old.connections().counts();
        counts.total == 2 && counts.idle == 1
    })
    .await);

    assert_eq!(
        pool.refresh_if_stale(endpoint.url()).await,
        RefreshOutcome::Replaced { retired: 1 }
    );
    let new = pool.get_client(endpoint.url());
    assert!(!Arc::ptr_eq(&old, &new));
    assert!(eventually(|| old.connections().counts().total == 1).await);

    // The request that started on the old client is unaffected.
    assert_eq!(&in_flight.body.collect().await.unwrap()[..], FULL_BODY);
    assert_eq!(upstream.completed(), 2);

    // Later requests go through the replacement.
    assert_eq!(&post(&new, &endpoint, 3).await.body.collect().await.unwrap()[..], FULL_BODY);
    assert_eq!(new.connections().counts().total, 1);
}
