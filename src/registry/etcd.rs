//! 租约存储（etcd）数据中心
//!
//! 实例以 `{prefix}/{identifier}/{id}` 为键写入，附带 TTL 租约；
//! 发现缓存由前缀监听驱动：put 事件把实例追加进对应服务的列表，
//! delete 事件按值相等从列表中移除。保活器按配置间隔逐租约续约，
//! 续约失败只丢弃本地映射，后端条目等租约到期自然消失。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::cache::{CacheLoader, RefreshAheadCache};
use super::{BackendParts, DiscovererProvider, Discoverer, Registrar, check_registrable};
use crate::config::{DataCenterKind, EtcdConfig};
use crate::error::{ArgusError, Result};
use crate::service::Service;
use crate::strategy::RoundRobinStrategy;

/// 监听已经保证新鲜度，刷新窗口只作兜底
const DISCOVERY_REFRESH_WINDOW: Duration = Duration::from_secs(60);

/// 发现缓存容量
const DISCOVERY_CACHE_SIZE: usize = 100;

/// 续约的并发上限
const KEEP_ALIVE_CONCURRENCY: usize = 10;

pub(crate) async fn build(config: &EtcdConfig, shutdown: CancellationToken) -> Result<BackendParts> {
    let client = Client::connect(config.endpoint_urls(), None)
        .await
        .map_err(|e| ArgusError::discovery(format!("cannot connect to etcd: {}", e)))?;

    let key_prefix = config.key_prefix().to_string();

    let keeper = Arc::new(EtcdServiceKeeper::new(client.clone()));
    keeper.clone().spawn(config.keep_interval(), shutdown.clone());

    let discoverer: Arc<dyn Discoverer> = Arc::new(
        EtcdServiceDiscoverer::new(client.clone(), key_prefix.clone(), shutdown.clone()),
    );
    let registrar = Arc::new(EtcdServiceRegistrar {
        client,
        key_prefix,
        ttl_secs: (config.service_ttl_ms / 1_000) as i64,
        keeper,
    });
    let provider = Arc::new(DiscovererProvider::new(
        DataCenterKind::Etcd,
        discoverer.clone(),
        Box::new(RoundRobinStrategy::new()),
    ));
    Ok(BackendParts {
        discoverer,
        registrar,
        provider,
    })
}

fn service_key(prefix: &str, identifier: &str) -> String {
    format!("{}/{}", prefix, identifier)
}

fn instance_key(prefix: &str, identifier: &str, id: &str) -> String {
    format!("{}/{}/{}", prefix, identifier, id)
}

/// 实例键形如 `{prefix}/{identifier}/{id}`，倒数第二段是服务名
fn extract_service_name(key: &str) -> Option<&str> {
    let elements: Vec<&str> = key.split('/').collect();
    if elements.len() < 2 {
        return None;
    }
    Some(elements[elements.len() - 2])
}

fn parse_service(raw: &[u8]) -> Option<Service> {
    match serde_json::from_slice::<Service>(raw) {
        Ok(service) => Some(service),
        Err(e) => {
            warn!(
                error = %e,
                payload = %String::from_utf8_lossy(raw),
                "cannot deserialize etcd payload to a service, dropping it"
            );
            None
        }
    }
}

// -------- Discoverer --------

struct EtcdServiceDiscoverer {
    cache: Arc<RefreshAheadCache<String, Vec<Service>>>,
}

impl EtcdServiceDiscoverer {
    fn new(client: Client, key_prefix: String, shutdown: CancellationToken) -> Self {
        let loader = Arc::new(EtcdKvLoader {
            client: client.clone(),
            key_prefix: key_prefix.clone(),
        });
        let cache = Arc::new(RefreshAheadCache::new(
            loader,
            DISCOVERY_REFRESH_WINDOW,
            DISCOVERY_CACHE_SIZE,
            shutdown.clone(),
        ));
        spawn_watch(client, key_prefix, cache.clone(), shutdown);
        Self { cache }
    }
}

#[async_trait]
impl Discoverer for EtcdServiceDiscoverer {
    async fn find_all_by_name(&self, name: &str) -> Vec<Service> {
        self.cache.get(&name.to_string()).await.unwrap_or_default()
    }
}

/// 按服务名前缀查询 etcd
struct EtcdKvLoader {
    client: Client,
    key_prefix: String,
}

#[async_trait]
impl CacheLoader<String, Vec<Service>> for EtcdKvLoader {
    async fn load(
        &self,
        name: &String,
    ) -> std::result::Result<Vec<Service>, Box<dyn std::error::Error + Send + Sync>> {
        let mut client = self.client.clone();
        let key = service_key(&self.key_prefix, name);
        let resp = client
            .get(key, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut services = Vec::new();
        for kv in resp.kvs() {
            if let Some(service) = parse_service(kv.value()) {
                services.push(service);
            }
        }
        Ok(services)
    }
}

/// 前缀监听，把变更直接回灌进发现缓存
fn spawn_watch(
    client: Client,
    key_prefix: String,
    cache: Arc<RefreshAheadCache<String, Vec<Service>>>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut client = client;
        let options = WatchOptions::new().with_prefix().with_prev_key();
        let (mut watcher, mut stream) = match client.watch(key_prefix.clone(), Some(options)).await
        {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "cannot establish etcd watch");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = watcher.cancel().await;
                    break;
                }
                message = stream.message() => match message {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            process_watch_event(&cache, event).await;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "etcd watch stream error");
                        break;
                    }
                },
            }
        }
    });
}

async fn process_watch_event(
    cache: &RefreshAheadCache<String, Vec<Service>>,
    event: &etcd_client::Event,
) {
    match event.event_type() {
        EventType::Put => {
            let Some(kv) = event.kv() else { return };
            let key = String::from_utf8_lossy(kv.key()).to_string();
            let Some(name) = extract_service_name(&key).map(str::to_string) else {
                warn!(key = %key, "cannot extract service name from etcd watch event");
                return;
            };
            let Some(service) = parse_service(kv.value()) else { return };
            cache
                .update(&name, |current| {
                    let mut services = current.unwrap_or_default();
                    services.push(service);
                    Some(services)
                })
                .await;
            debug!(key = %key, "put new service instance to cache by watch event");
        }
        EventType::Delete => {
            // delete 事件的新值为空，实例内容在 prev_kv 里
            let Some(prev) = event.prev_kv() else {
                let Some(kv) = event.kv() else { return };
                warn!(
                    key = %String::from_utf8_lossy(kv.key()).to_string(),
                    "etcd delete event without previous value"
                );
                return;
            };
            let key = String::from_utf8_lossy(prev.key()).to_string();
            let Some(name) = extract_service_name(&key).map(str::to_string) else {
                warn!(key = %key, "cannot extract service name from etcd watch event");
                return;
            };
            let Some(prev_service) = parse_service(prev.value()) else { return };
            cache
                .update(&name, |current| match current {
                    Some(mut services) => {
                        let before = services.len();
                        services.retain(|s| s != &prev_service);
                        if services.len() == before {
                            warn!(key = %key, "cannot find the deleted instance in cache");
                        } else {
                            debug!(key = %key, "removed service instance from cache by watch event");
                        }
                        Some(services)
                    }
                    None => {
                        warn!(key = %key, "cannot find any cached instances for deleted key");
                        None
                    }
                })
                .await;
        }
    }
}

// -------- Keeper --------

/// 租约保活器
///
/// 跟踪租约 id 到实例的映射，按固定间隔逐租约发送一次 keep-alive。
pub(crate) struct EtcdServiceKeeper {
    client: Client,
    leases: Arc<tokio::sync::RwLock<HashMap<i64, Service>>>,
}

impl EtcdServiceKeeper {
    fn new(client: Client) -> Self {
        Self {
            client,
            leases: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
        }
    }

    pub(crate) async fn keep(&self, lease_id: i64, service: Service) {
        self.leases.write().await.entry(lease_id).or_insert(service);
    }

    pub(crate) async fn remove(&self, lease_id: i64) -> Option<Service> {
        self.leases.write().await.remove(&lease_id)
    }

    pub(crate) async fn lease_id_of(&self, service: &Service) -> Option<i64> {
        self.leases
            .read()
            .await
            .iter()
            .find(|(_, tracked)| *tracked == service)
            .map(|(lease_id, _)| *lease_id)
    }

    pub(crate) async fn tracked_count(&self) -> usize {
        self.leases.read().await.len()
    }

    fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.keep_alive_all().await,
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    async fn keep_alive_all(&self) {
        let snapshot: Vec<(i64, Service)> = self
            .leases
            .read()
            .await
            .iter()
            .map(|(lease_id, service)| (*lease_id, service.clone()))
            .collect();

        futures::stream::iter(snapshot)
            .for_each_concurrent(KEEP_ALIVE_CONCURRENCY, |(lease_id, service)| async move {
                if let Err(reason) = self.keep_alive_once(lease_id).await {
                    error!(
                        service = %service.identifier(),
                        lease_id,
                        reason = %reason,
                        "etcd keep alive failed, dropping the lease locally"
                    );
                    // 后端条目不主动删除，等租约到期自然过期
                    self.remove(lease_id).await;
                } else {
                    debug!(lease_id, "etcd keep alive succeed");
                }
            })
            .await;
    }

    async fn keep_alive_once(&self, lease_id: i64) -> std::result::Result<(), String> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(|e| format!("keep alive request failed: {}", e))?;
        keeper
            .keep_alive()
            .await
            .map_err(|e| format!("keep alive send failed: {}", e))?;
        match stream.message().await {
            Ok(Some(resp)) if resp.ttl() > 0 => Ok(()),
            Ok(Some(_)) => Err("lease has already expired".to_string()),
            Ok(None) => Err("keep alive stream closed".to_string()),
            Err(e) => Err(format!("keep alive response failed: {}", e)),
        }
    }
}

// -------- Registrar --------

struct EtcdServiceRegistrar {
    client: Client,
    key_prefix: String,
    ttl_secs: i64,
    keeper: Arc<EtcdServiceKeeper>,
}

#[async_trait]
impl Registrar for EtcdServiceRegistrar {
    async fn register(&self, service: &Service) -> bool {
        if !check_registrable(service, DataCenterKind::Etcd) {
            return false;
        }

        let payload = match serde_json::to_string(service) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    service = %service.identifier(),
                    id = %service.id(),
                    error = %e,
                    "cannot serialize service payload"
                );
                return false;
            }
        };

        let mut client = self.client.clone();
        let lease_id = match client.lease_grant(self.ttl_secs, None).await {
            Ok(lease) => lease.id(),
            Err(e) => {
                error!(
                    service = %service.identifier(),
                    id = %service.id(),
                    error = %e,
                    "unable to grant a lease from etcd"
                );
                return false;
            }
        };

        let key = instance_key(&self.key_prefix, service.identifier(), service.id());
        match client
            .put(key, payload, Some(PutOptions::new().with_lease(lease_id)))
            .await
        {
            Ok(_) => {
                debug!(
                    service = %service.identifier(),
                    id = %service.id(),
                    lease_id,
                    "register service to etcd successfully"
                );
                self.keeper.keep(lease_id, service.clone()).await;
                true
            }
            Err(e) => {
                error!(
                    service = %service.identifier(),
                    id = %service.id(),
                    error = %e,
                    "unable to register service to etcd"
                );
                // 写入失败时回收刚申请的租约，避免遗留半注册状态
                let _ = client.lease_revoke(lease_id).await;
                false
            }
        }
    }

    async fn unregister(&self, service: &Service) -> bool {
        let Some(lease_id) = self.keeper.lease_id_of(service).await else {
            warn!(
                service = %service.identifier(),
                id = %service.id(),
                "cannot unregister service because no associated lease is tracked"
            );
            return false;
        };

        let mut client = self.client.clone();
        match client.lease_revoke(lease_id).await {
            Ok(_) => {
                self.keeper.remove(lease_id).await;
                debug!(
                    service = %service.identifier(),
                    id = %service.id(),
                    lease_id,
                    "unregister service from etcd successfully"
                );
                true
            }
            Err(e) => {
                error!(
                    service = %service.identifier(),
                    id = %service.id(),
                    lease_id,
                    error = %e,
                    "unable to unregister service from etcd"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(service_key("argus/services", "acme-rpc-echo"), "argus/services/acme-rpc-echo");
        assert_eq!(
            instance_key("argus/services", "acme-rpc-echo", "instance-1"),
            "argus/services/acme-rpc-echo/instance-1"
        );
    }

    #[test]
    fn test_extract_service_name() {
        assert_eq!(
            extract_service_name("argus/services/acme-rpc-echo/instance-1"),
            Some("acme-rpc-echo")
        );
        assert_eq!(extract_service_name("single"), None);
    }

    #[test]
    fn test_parse_service_rejects_malformed_payload() {
        assert!(parse_service(b"not-json").is_none());

        let service = Service::from_parts("acme-rpc-echo", "echo", "instance-1", "10.0.0.1", 9090);
        let payload = serde_json::to_vec(&service).unwrap();
        assert_eq!(parse_service(&payload).unwrap(), service);
    }
}
