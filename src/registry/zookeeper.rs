//! 层级存储（Zookeeper）数据中心
//!
//! 实例注册为 `{base}/{identifier}/{id}` 下的临时节点，负载是服务 JSON；
//! 会话断开后临时节点自动消失，所以不需要额外的保活任务。
//! 发现走子节点枚举 + 数据读取，由刷新预载缓存兜底新鲜度。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use zookeeper_client as zk;

use super::cache::{CacheLoader, RefreshAheadCache};
use super::{BackendParts, DiscovererProvider, Discoverer, Registrar, check_registrable};
use crate::config::{DataCenterKind, ZookeeperConfig};
use crate::error::{ArgusError, Result};
use crate::service::Service;
use crate::strategy::RoundRobinStrategy;

/// 发现缓存的刷新窗口
const DISCOVERY_REFRESH_WINDOW: Duration = Duration::from_secs(5);

/// 发现缓存容量
const DISCOVERY_CACHE_SIZE: usize = 100;

pub(crate) async fn build(
    config: &ZookeeperConfig,
    shutdown: CancellationToken,
) -> Result<BackendParts> {
    let client = zk::Client::connector()
        .session_timeout(config.session_timeout())
        .connect(&config.connect_string)
        .await
        .map_err(|e| ArgusError::discovery(format!("cannot connect to zookeeper: {}", e)))?;
    let client = Arc::new(client);
    let base_path = config.base_path().to_string();

    let discoverer: Arc<dyn Discoverer> = Arc::new(ZookeeperServiceDiscoverer::new(
        client.clone(),
        base_path.clone(),
        shutdown,
    ));
    let registrar = Arc::new(ZookeeperServiceRegistrar { client, base_path });
    let provider = Arc::new(DiscovererProvider::new(
        DataCenterKind::Zookeeper,
        discoverer.clone(),
        Box::new(RoundRobinStrategy::new()),
    ));
    Ok(BackendParts {
        discoverer,
        registrar,
        provider,
    })
}

fn service_path(base_path: &str, identifier: &str) -> String {
    format!("{}/{}", base_path, identifier)
}

fn instance_path(base_path: &str, identifier: &str, id: &str) -> String {
    format!("{}/{}/{}", base_path, identifier, id)
}

// -------- Discoverer --------

struct ZookeeperServiceDiscoverer {
    client: Arc<zk::Client>,
    base_path: String,
    cache: RefreshAheadCache<String, Vec<Service>>,
}

impl ZookeeperServiceDiscoverer {
    fn new(client: Arc<zk::Client>, base_path: String, shutdown: CancellationToken) -> Self {
        let loader = Arc::new(ZnodeLoader {
            client: client.clone(),
            base_path: base_path.clone(),
        });
        Self {
            client,
            base_path,
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
impl Discoverer for ZookeeperServiceDiscoverer {
    async fn find_all_by_name(&self, name: &str) -> Vec<Service> {
        self.cache.get(&name.to_string()).await.unwrap_or_default()
    }

    async fn find_all(&self) -> Result<HashMap<String, Vec<Service>>> {
        let names = match self.client.list_children(&self.base_path).await {
            Ok(names) => names,
            Err(zk::Error::NoNode) => return Ok(HashMap::new()),
            Err(e) => {
                error!(error = %e, "cannot list services from zookeeper");
                return Ok(HashMap::new());
            }
        };

        let mut all = HashMap::new();
        for name in names {
            let instances = self.find_all_by_name(&name).await;
            all.insert(name, instances);
        }
        Ok(all)
    }
}

/// 枚举服务节点的子节点并读取实例负载
struct ZnodeLoader {
    client: Arc<zk::Client>,
    base_path: String,
}

#[async_trait]
impl CacheLoader<String, Vec<Service>> for ZnodeLoader {
    async fn load(
        &self,
        name: &String,
    ) -> std::result::Result<Vec<Service>, Box<dyn std::error::Error + Send + Sync>> {
        let path = service_path(&self.base_path, name);
        let children = match self.client.list_children(&path).await {
            Ok(children) => children,
            // 服务从未注册过，视为空集合
            Err(zk::Error::NoNode) => return Ok(Vec::new()),
            Err(e) => return Err(format!("cannot list instances of {}: {}", name, e).into()),
        };

        let mut services = Vec::new();
        for child in children {
            let child_path = instance_path(&self.base_path, name, &child);
            match self.client.get_data(&child_path).await {
                Ok((data, _stat)) => match serde_json::from_slice::<Service>(&data) {
                    Ok(service) => services.push(service),
                    Err(e) => {
                        warn!(
                            path = %child_path,
                            error = %e,
                            "cannot deserialize zookeeper payload to a service, dropping it"
                        );
                    }
                },
                // 枚举和读取之间节点可能刚好消失
                Err(zk::Error::NoNode) => continue,
                Err(e) => {
                    warn!(path = %child_path, error = %e, "cannot read instance data");
                }
            }
        }
        Ok(services)
    }
}

// -------- Registrar --------

struct ZookeeperServiceRegistrar {
    client: Arc<zk::Client>,
    base_path: String,
}

impl ZookeeperServiceRegistrar {
    /// 逐段补齐持久化父节点
    async fn ensure_container(&self, path: &str) -> std::result::Result<(), zk::Error> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self
                .client
                .create(
                    &current,
                    &[],
                    &zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all()),
                )
                .await
            {
                Ok(_) => {}
                Err(zk::Error::NodeExists) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Registrar for ZookeeperServiceRegistrar {
    async fn register(&self, service: &Service) -> bool {
        if !check_registrable(service, DataCenterKind::Zookeeper) {
            return false;
        }

        let payload = match serde_json::to_vec(service) {
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

        let parent = service_path(&self.base_path, service.identifier());
        if let Err(e) = self.ensure_container(&parent).await {
            error!(
                service = %service.identifier(),
                id = %service.id(),
                error = %e,
                "unable to prepare service path in zookeeper"
            );
            return false;
        }

        let path = instance_path(&self.base_path, service.identifier(), service.id());
        match self
            .client
            .create(
                &path,
                &payload,
                &zk::CreateMode::Ephemeral.with_acls(zk::Acls::anyone_all()),
            )
            .await
        {
            Ok(_) => {
                debug!(
                    service = %service.identifier(),
                    id = %service.id(),
                    "register service to zookeeper successfully"
                );
                true
            }
            // 同一会话重复注册视为成功
            Err(zk::Error::NodeExists) => {
                debug!(
                    service = %service.identifier(),
                    id = %service.id(),
                    "service instance already registered to zookeeper"
                );
                true
            }
            Err(e) => {
                error!(
                    service = %service.identifier(),
                    id = %service.id(),
                    error = %e,
                    "unable to register service to zookeeper"
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

        let path = instance_path(&self.base_path, service.identifier(), service.id());
        match self.client.delete(&path, None).await {
            Ok(_) => {
                debug!(
                    service = %service.identifier(),
                    id = %service.id(),
                    "unregister service from zookeeper successfully"
                );
                true
            }
            Err(zk::Error::NoNode) => {
                warn!(
                    service = %service.identifier(),
                    id = %service.id(),
                    "cannot unregister a service that has never been registered"
                );
                false
            }
            Err(e) => {
                error!(
                    service = %service.identifier(),
                    id = %service.id(),
                    error = %e,
                    "unable to unregister service from zookeeper"
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
    fn test_path_layout() {
        assert_eq!(service_path("/argus", "acme-rpc-echo"), "/argus/acme-rpc-echo");
        assert_eq!(
            instance_path("/argus", "acme-rpc-echo", "instance-1"),
            "/argus/acme-rpc-echo/instance-1"
        );
    }
}
