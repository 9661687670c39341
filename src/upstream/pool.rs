//! Pooled HTTP clients per upstream endpoint, with DNS freshness.
//!
//! # Responsibilities
//! - Hand out one keep-alive client per endpoint URL
//! - Periodically re-resolve upstream hostnames
//! - Replace a client when its host's addresses change, closing only idle
//!   connections that point at addresses no longer in the answer
//! - Close idle connections older than the idle ceiling
//!
//! # Design Decisions
//! - Clients are handed out as `Arc<PooledClient>`; a request that already
//!   holds the old client keeps using it until it finishes
//! - A failed or timed-out resolution leaves the cached client in place
//! - The refresher is its own task, so a slow resolver never delays dispatch

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use axum::body::Body;
use dashmap::DashMap;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};
use url::Url;

use crate::config::ProxyConfig;
use crate::observability::metrics;
use crate::upstream::connection::{ConnectionCounts, ConnectionRegistry, TrackedConnector};
use crate::upstream::resolver::{Resolve, SystemResolver};

pub type HttpClient = Client<TrackedConnector, Body>;

/// Pool tuning derived from configuration.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_idle_per_host: usize,
    pub idle_ceiling: Duration,
    pub refresh_interval: Duration,
    /// Upper bound on a single resolution.
    pub resolve_timeout: Duration,
}

impl From<&ProxyConfig> for PoolSettings {
    fn from(config: &ProxyConfig) -> Self {
        let refresh_interval = Duration::from_millis(config.pool.dns_refresh_interval_ms);
        Self {
            connect_timeout: Duration::from_millis(config.timeouts.connect_ms),
            idle_timeout: Duration::from_secs(config.pool.idle_timeout_secs),
            max_idle_per_host: config.pool.max_idle_per_host,
            idle_ceiling: Duration::from_secs(config.pool.idle_ceiling_secs),
            refresh_interval,
            resolve_timeout: refresh_interval.max(Duration::from_secs(1)),
        }
    }
}

/// One generation of the HTTP client for an endpoint URL.
#[derive(Debug)]
pub struct PooledClient {
    generation: u64,
    url: Url,
    client: HttpClient,
    connections: ConnectionRegistry,
    resolved: ArcSwapOption<BTreeSet<IpAddr>>,
    created_at: Instant,
}

impl PooledClient {
    pub fn http(&self) -> &HttpClient {
        &self.client
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Addresses the host resolved to when last checked, if ever.
    pub fn resolved(&self) -> Option<Arc<BTreeSet<IpAddr>>> {
        self.resolved.load_full()
    }
}

/// Result of one freshness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// No cached client, or the address set did not change.
    Unchanged,
    /// First successful resolution; the address was recorded.
    Recorded,
    /// Address changed; a new client replaced the old one.
    Replaced { retired: usize },
    /// Resolution failed or timed out; the cached client was kept.
    Failed,
}

/// Snapshot of one pooled client for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub url: String,
    pub generation: u64,
    pub resolved: Vec<IpAddr>,
    pub connections: usize,
    pub idle_connections: usize,
    pub age_secs: u64,
}

pub struct EndpointPool {
    clients: DashMap<String, Arc<PooledClient>>,
    resolver: Arc<dyn Resolve>,
    settings: PoolSettings,
    generations: AtomicU64,
}

impl EndpointPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self::with_resolver(settings, Arc::new(SystemResolver))
    }

    pub fn with_resolver(settings: PoolSettings, resolver: Arc<dyn Resolve>) -> Self {
        Self {
            clients: DashMap::new(),
            resolver,
            settings,
            generations: AtomicU64::new(0),
        }
    }

    /// Cached client for `url`, created on first use.
    pub fn get_client(&self, url: &Url) -> Arc<PooledClient> {
        if let Some(existing) = self.clients.get(url.as_str()) {
            return existing.clone();
        }
        self.clients
            .entry(url.as_str().to_string())
            .or_insert_with(|| Arc::new(self.build(url.clone(), None)))
            .clone()
    }

    /// Re-resolve the host behind `url` and replace its client if the
    /// address set changed.
    pub async fn refresh_if_stale(&self, url: &Url) -> RefreshOutcome {
        let Some(current) = self.clients.get(url.as_str()).map(|entry| entry.clone()) else {
            return RefreshOutcome::Unchanged;
        };
        let Some((host, port)) = host_and_port(url) else {
            return RefreshOutcome::Unchanged;
        };

        let resolved = match time::timeout(self.settings.resolve_timeout, self.resolver.resolve(&host, port)).await {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(e)) => {
                tracing::warn!(endpoint = %url, error = %e, "DNS resolution failed, keeping cached client");
                metrics::record_dns_refresh("failed");
                return RefreshOutcome::Failed;
            }
            Err(_) => {
                tracing::warn!(
                    endpoint = %url,
                    timeout_ms = self.settings.resolve_timeout.as_millis() as u64,
                    "DNS resolution timed out, keeping cached client"
                );
                metrics::record_dns_refresh("timeout");
                return RefreshOutcome::Failed;
            }
        };

        let previous = current.resolved();
        match previous {
            Some(previous) if *previous == resolved => RefreshOutcome::Unchanged,
            None => {
                tracing::debug!(endpoint = %url, addresses = ?resolved, "Recorded upstream address");
                current.resolved.store(Some(Arc::new(resolved)));
                metrics::record_dns_refresh("recorded");
                RefreshOutcome::Recorded
            }
            Some(previous) => {
                let stale: BTreeSet<IpAddr> = previous.difference(&resolved).copied().collect();
                let replacement = Arc::new(self.build(url.clone(), Some(resolved.clone())));
                self.clients.insert(url.as_str().to_string(), replacement.clone());

                let retired = current
                    .connections()
                    .retire_idle(|conn| stale.contains(&conn.peer().ip()));

                tracing::info!(
                    endpoint = %url,
                    previous = ?previous,
                    current = ?resolved,
                    generation = replacement.generation(),
                    retired,
                    "Upstream address changed, replaced pooled client"
                );
                metrics::record_dns_refresh("replaced");
                metrics::record_connections_retired("dns_change", retired);
                RefreshOutcome::Replaced { retired }
            }
        }
    }

    /// Close idle connections older than the idle ceiling across all clients.
    pub fn evict_idle(&self) -> usize {
        let ceiling = self.settings.idle_ceiling;
        let retired: usize = self
            .clients
            .iter()
            .map(|entry| entry.value().connections().retire_idle(|conn| conn.age() >= ceiling))
            .sum();
        if retired > 0 {
            tracing::debug!(retired, "Closed idle connections past the idle ceiling");
            metrics::record_connections_retired("idle_ceiling", retired);
        }
        retired
    }

    /// One refresher tick: re-resolve every cached endpoint, then sweep idle
    /// connections.
    pub async fn refresh_all(&self) {
        let urls: Vec<Url> = self
            .clients
            .iter()
            .map(|entry| entry.value().url().clone())
            .collect();
        tracing::debug!(endpoints = urls.len(), "Refreshing DNS cache");
        for url in &urls {
            self.refresh_if_stale(url).await;
        }
        self.evict_idle();
    }

    /// Run the refresher until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(self.settings.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.settings.refresh_interval.as_millis() as u64,
            "Starting upstream DNS refresher"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("DNS refresher shutting down");
                    break;
                }
            }
        }
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        let mut statuses: Vec<PoolStatus> = self
            .clients
            .iter()
            .map(|entry| {
                let client = entry.value();
                let ConnectionCounts { total, idle } = client.connections().counts();
                PoolStatus {
                    url: client.url().to_string(),
                    generation: client.generation(),
                    resolved: client
                        .resolved()
                        .map(|addrs| addrs.iter().copied().collect())
                        .unwrap_or_default(),
                    connections: total,
                    idle_connections: idle,
                    age_secs: client.created_at.elapsed().as_secs(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.url.cmp(&b.url));
        statuses
    }

    fn build(&self, url: Url, resolved: Option<BTreeSet<IpAddr>>) -> PooledClient {
        let connections = ConnectionRegistry::default();
        let connector = TrackedConnector::new(self.settings.connect_timeout, connections.clone());
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(self.settings.idle_timeout)
            .pool_max_idle_per_host(self.settings.max_idle_per_host)
            .build(connector);

        PooledClient {
            generation: self.generations.fetch_add(1, Ordering::Relaxed) + 1,
            url,
            client,
            connections,
            resolved: ArcSwapOption::from(resolved.map(Arc::new)),
            created_at: Instant::now(),
        }
    }
}

fn host_and_port(url: &Url) -> Option<(String, u16)> {
    let host = url.host_str()?.trim_start_matches('[').trim_end_matches(']');
    Some((host.to_string(), url.port_or_known_default()?))
}
