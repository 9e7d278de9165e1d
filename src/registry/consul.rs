//! 健康检查代理（Consul）数据中心
//!
//! 注册时向代理推送带 TTL 健康检查的服务定义，
//! 保活器按固定间隔为每个被跟踪的实例上报一次 check pass；
//! 上报失败的实例会被移出跟踪集合（不重试、不重新注册），
//! 等待代理按 TTL 将其判定为不健康。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::cache::{CacheLoader, RefreshAheadCache};
use super::{BackendParts, DiscovererProvider, Discoverer, Registrar, check_registrable};
use crate::config::{ConsulConfig, DataCenterKind};
use crate::error::Result;
use crate::service::Service;
use crate::strategy::RoundRobinStrategy;

/// 发现缓存的刷新窗口，对齐健康检查的感知速度
const DISCOVERY_REFRESH_WINDOW: Duration = Duration::from_secs(5);

/// 发现缓存容量
const DISCOVERY_CACHE_SIZE: usize = 100;

/// 单次心跳上报的超时
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// 心跳上报的并发上限
const HEARTBEAT_CONCURRENCY: usize = 10;

pub(crate) async fn build(
    config: &ConsulConfig,
    shutdown: CancellationToken,
) -> Result<BackendParts> {
    let http = HttpClient::new();
    let agent_url = config.agent_url();

    let keeper = Arc::new(ConsulServiceKeeper::new(http.clone(), agent_url.clone()));
    keeper.clone().spawn(config.check_interval(), shutdown.clone());

    let discoverer: Arc<dyn Discoverer> = Arc::new(ConsulServiceDiscoverer::new(
        http.clone(),
        agent_url.clone(),
        shutdown,
    ));
    let registrar = Arc::new(ConsulServiceRegistrar {
        http,
        agent_url,
        check_ttl_ms: config.check_ttl_ms,
        keeper,
    });
    let provider = Arc::new(DiscovererProvider::new(
        DataCenterKind::Consul,
        discoverer.clone(),
        Box::new(RoundRobinStrategy::new()),
    ));
    Ok(BackendParts {
        discoverer,
        registrar,
        provider,
    })
}

// -------- Discoverer --------

struct ConsulServiceDiscoverer {
    cache: RefreshAheadCache<String, Vec<Service>>,
}

impl ConsulServiceDiscoverer {
    fn new(http: HttpClient, agent_url: String, shutdown: CancellationToken) -> Self {
        let loader = Arc::new(HealthServiceLoader { http, agent_url });
        Self {
            cache: RefreshAheadCache::new(
                loader,
                DISCOVERY_REFRESH_WINDOW,
                DISCOVERY_CACHE_SIZE,
                shutdown,
            ),
        }
    }
}

#[async_trait]
impl Discoverer for ConsulServiceDiscoverer {
    async fn find_all_by_name(&self, name: &str) -> Vec<Service> {
        self.cache.get(&name.to_string()).await.unwrap_or_default()
    }
}

/// 从代理的健康服务列表加载实例
struct HealthServiceLoader {
    http: HttpClient,
    agent_url: String,
}

#[async_trait]
impl CacheLoader<String, Vec<Service>> for HealthServiceLoader {
    async fn load(
        &self,
        name: &String,
    ) -> std::result::Result<Vec<Service>, Box<dyn std::error::Error + Send + Sync>> {
        let url = format!("{}/v1/health/service/{}", self.agent_url, name);
        let resp = self
            .http
            .get(&url)
            .query(&[("passing", "true")])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(format!("consul health query failed with status {}", resp.status()).into());
        }

        let entries: Vec<serde_json::Value> = resp.json().await?;
        let mut services = Vec::new();
        for entry in entries {
            let Some(svc) = entry.get("Service") else {
                warn!(service = %name, "skipping malformed consul health entry");
                continue;
            };
            let id = svc.get("ID").and_then(|v| v.as_str()).unwrap_or_default();
            let address = svc.get("Address").and_then(|v| v.as_str()).unwrap_or_default();
            let port = svc.get("Port").and_then(|v| v.as_u64()).unwrap_or_default();
            let Ok(port) = u16::try_from(port) else {
                warn!(service = %name, port, "skipping consul entry with invalid port");
                continue;
            };
            if address.is_empty() {
                warn!(service = %name, "skipping consul entry without address");
                continue;
            }
            services.push(Service::from_parts(name.clone(), name.clone(), id, address, port));
        }
        Ok(services)
    }
}

// -------- Keeper --------

/// 实例保活器
///
/// 固定间隔遍历被跟踪的实例 id，并发上报 check pass。
pub(crate) struct ConsulServiceKeeper {
    http: HttpClient,
    agent_url: String,
    tracked: Arc<tokio::sync::RwLock<HashSet<String>>>,
}

impl ConsulServiceKeeper {
    fn new(http: HttpClient, agent_url: String) -> Self {
        Self {
            http,
            agent_url,
            tracked: Arc::new(tokio::sync::RwLock::new(HashSet::new())),
        }
    }

    pub(crate) async fn track(&self, service_id: impl Into<String>) {
        self.tracked.write().await.insert(service_id.into());
    }

    pub(crate) async fn untrack(&self, service_id: &str) -> bool {
        self.tracked.write().await.remove(service_id)
    }

    pub(crate) async fn is_tracked(&self, service_id: &str) -> bool {
        self.tracked.read().await.contains(service_id)
    }

    fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.check_pass_all().await,
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    async fn check_pass_all(&self) {
        let ids: Vec<String> = self.tracked.read().await.iter().cloned().collect();
        futures::stream::iter(ids)
            .for_each_concurrent(HEARTBEAT_CONCURRENCY, |id| async move {
                if let Err(e) = self.check_pass(&id).await {
                    error!(
                        service_id = %id,
                        error = %e,
                        "consul check pass failed, removing it from the check list"
                    );
                    self.untrack(&id).await;
                }
            })
            .await;
    }

    async fn check_pass(&self, service_id: &str) -> std::result::Result<(), String> {
        let url = format!("{}/v1/agent/check/pass/service:{}", self.agent_url, service_id);
        let send = self.http.put(&url).send();
        match tokio::time::timeout(HEARTBEAT_TIMEOUT, send).await {
            Ok(Ok(resp)) if resp.status().is_success() => {
                debug!(service_id = %service_id, "consul check pass succeed");
                Ok(())
            }
            Ok(Ok(resp)) => Err(format!("ttl update failed with status {}", resp.status())),
            Ok(Err(e)) => Err(format!("ttl update request failed: {}", e)),
            Err(_) => Err(format!("ttl update timeout ({:?})", HEARTBEAT_TIMEOUT)),
        }
    }
}

// -------- Registrar --------

struct ConsulServiceRegistrar {
    http: HttpClient,
    agent_url: String,
    check_ttl_ms: u64,
    keeper: Arc<ConsulServiceKeeper>,
}

#[async_trait]
impl Registrar for ConsulServiceRegistrar {
    async fn register(&self, service: &Service) -> bool {
        if !check_registrable(service, DataCenterKind::Consul) {
            return false;
        }

        let deregister_after_ms = self.check_ttl_ms * 2;
        let payload = serde_json::json!({
            "ID": service.id(),
            "Name": service.identifier(),
            "Tags": [service.name()],
            "Address": service.host(),
            "Port": service.port(),
            "Check": {
                "CheckID": format!("service:{}", service.id()),
                "TTL": format!("{}ms", self.check_ttl_ms),
                "DeregisterCriticalServiceAfter": format!("{}ms", deregister_after_ms),
            },
        });

        let url = format!("{}/v1/agent/service/register", self.agent_url);
        match self.http.put(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(
                    service = %service.identifier(),
                    id = %service.id(),
                    "register service to consul successfully"
                );
                self.keeper.track(service.id()).await;
                true
            }
            Ok(resp) => {
                error!(
                    service = %service.identifier(),
                    id = %service.id(),
                    status = %resp.status(),
                    "unable to register service to consul"
                );
                false
            }
            Err(e) => {
                error!(
                    service = %service.identifier(),
                    id = %service.id(),
                    error = %e,
                    "unable to register service to consul"
                );
                false
            }
        }
    }

    async fn unregister(&self, service: &Service) -> bool {
        if service.id().trim().is_empty() {
            error!(
                service = %service.identifier(),
                "cannot unregister a service with an empty id"
            );
            return false;
        }

        let url = format!("{}/v1/agent/service/deregister/{}", self.agent_url, service.id());
        match self.http.put(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(
                    service = %service.identifier(),
                    id = %service.id(),
                    "unregister service from consul successfully"
                );
                self.keeper.untrack(service.id()).await;
                true
            }
            Ok(resp) => {
                error!(
                    service = %service.identifier(),
                    id = %service.id(),
                    status = %resp.status(),
                    "unable to unregister service from consul"
                );
                false
            }
            Err(e) => {
                error!(
                    service = %service.identifier(),
                    id = %service.id(),
                    error = %e,
                    "unable to unregister service from consul"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_keeper() -> ConsulServiceKeeper {
        ConsulServiceKeeper::new(HttpClient::new(), "http://localhost:8500".to_string())
    }

    #[tokio::test]
    async fn test_keeper_tracking_round_trip() {
        let keeper = make_keeper();
        keeper.track("instance-1").await;
        assert!(keeper.is_tracked("instance-1").await);

        assert!(keeper.untrack("instance-1").await);
        assert!(!keeper.is_tracked("instance-1").await);
    }

    #[tokio::test]
    async fn test_keeper_untrack_unknown_id_is_harmless() {
        let keeper = make_keeper();
        assert!(!keeper.untrack("never-registered").await);
    }

    #[tokio::test]
    async fn test_register_rejects_blank_id() {
        let registrar = ConsulServiceRegistrar {
            http: HttpClient::new(),
            agent_url: "http://localhost:8500".to_string(),
            check_ttl_ms: 5_000,
            keeper: Arc::new(make_keeper()),
        };
        let service = Service::from_parts("acme-rpc-echo", "echo", "", "127.0.0.1", 9090);
        assert!(!registrar.register(&service).await);
        assert!(!registrar.keeper.is_tracked("").await);
    }
}
