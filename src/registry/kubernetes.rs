//! 平台 API（Kubernetes）数据中心
//!
//! 只读后端：通过 API server 解析平台服务的集群内地址，
//! 注册与存活交由平台自身管理，注册方恒定成功。
//! 解析结果进刷新预载缓存；可选的 watch 订阅把服务增删直接回灌缓存。
//! 调试模式下用配置的节点地址和 nodePort 替代集群内地址，
//! 便于在集群外直连一个真实集群做本地开发。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::cache::{CacheLoader, RefreshAheadCache};
use super::{BackendParts, Discoverer, Provider, Registrar};
use crate::config::KubernetesConfig;
use crate::error::{ArgusError, Result};
use crate::service::{Service, ServiceMetaData};

/// watch 流断开后的重连间隔
const WATCH_RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub(crate) async fn build(
    config: &KubernetesConfig,
    shutdown: CancellationToken,
) -> Result<BackendParts> {
    let token = config.auth_token()?;
    let mut builder = reqwest::Client::builder();
    if !config.verify_ssl {
        builder = builder.danger_accept_invalid_certs(true);
    }
    let http = builder
        .build()
        .map_err(|e| ArgusError::configuration(format!("cannot build k8s http client: {}", e)))?;

    let api = Arc::new(K8sApiClient {
        http,
        base_path: config.base_path(),
        namespace: config.namespace.clone(),
        token,
    });

    let discoverer = Arc::new(K8sServiceDiscoverer::new(
        api.clone(),
        config,
        shutdown.clone(),
    ));
    if config.svc_watch {
        spawn_watch(api, discoverer.cache.clone(), shutdown);
    }

    let registrar = Arc::new(K8sServiceRegistrar);
    let provider = Arc::new(K8sServiceProvider {
        discoverer: discoverer.clone(),
        debug_mode: config.debug_node_host.is_some(),
    });
    Ok(BackendParts {
        discoverer,
        registrar,
        provider,
    })
}

// -------- API 对象 --------

#[derive(Debug, Clone, Deserialize)]
struct V1ServiceList {
    #[serde(default)]
    items: Vec<V1Service>,
}

#[derive(Debug, Clone, Deserialize)]
struct V1Service {
    metadata: Option<V1ObjectMeta>,
    spec: Option<V1ServiceSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct V1ObjectMeta {
    name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct V1ServiceSpec {
    #[serde(rename = "clusterIP")]
    cluster_ip: Option<String>,
    #[serde(default)]
    ports: Option<Vec<V1ServicePort>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct V1ServicePort {
    name: Option<String>,
    port: i32,
    node_port: Option<i32>,
}

impl V1Service {
    fn name(&self) -> Option<&str> {
        self.metadata.as_ref()?.name.as_deref()
    }

    fn cluster_ip(&self) -> Option<&str> {
        let ip = self.spec.as_ref()?.cluster_ip.as_deref()?;
        if ip.is_empty() || ip.eq_ignore_ascii_case("None") {
            return None;
        }
        Some(ip)
    }

    fn ports(&self) -> &[V1ServicePort] {
        self.spec
            .as_ref()
            .and_then(|spec| spec.ports.as_deref())
            .unwrap_or_default()
    }

    fn port_by_name(&self, port_name: &str) -> Option<&V1ServicePort> {
        self.ports().iter().find(|port| {
            port.name
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case(port_name))
        })
    }
}

// -------- API 客户端 --------

struct K8sApiClient {
    http: reqwest::Client,
    base_path: String,
    namespace: String,
    token: String,
}

type ApiError = Box<dyn std::error::Error + Send + Sync>;

impl K8sApiClient {
    async fn read_service(&self, name: &str) -> std::result::Result<Option<V1Service>, ApiError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/services/{}",
            self.base_path, self.namespace, name
        );
        let resp = self.http.get(&url).bearer_auth(&self.token).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(format!("k8s service read failed with status {}", resp.status()).into());
        }
        Ok(Some(resp.json::<V1Service>().await?))
    }

    async fn list_services(&self) -> std::result::Result<Vec<V1Service>, ApiError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/services",
            self.base_path, self.namespace
        );
        let resp = self.http.get(&url).bearer_auth(&self.token).send().await?;
        if !resp.status().is_success() {
            return Err(format!("k8s service list failed with status {}", resp.status()).into());
        }
        Ok(resp.json::<V1ServiceList>().await?.items)
    }
}

fn build_service(identifier: &str, host: &str, port: i32) -> Option<Service> {
    let port = u16::try_from(port).ok()?;
    Some(Service::from_parts(
        identifier,
        identifier,
        Uuid::new_v4().to_string(),
        host,
        port,
    ))
}

// -------- Discoverer --------

struct K8sServiceDiscoverer {
    api: Arc<K8sApiClient>,
    debug_node_host: Option<String>,
    cache: Arc<RefreshAheadCache<ServiceMetaData, Service>>,
}

impl K8sServiceDiscoverer {
    fn new(api: Arc<K8sApiClient>, config: &KubernetesConfig, shutdown: CancellationToken) -> Self {
        let loader = Arc::new(ClusterServiceLoader { api: api.clone() });
        Self {
            api,
            debug_node_host: config.debug_node_host.clone(),
            cache: Arc::new(RefreshAheadCache::new(
                loader,
                config.svc_refresh_interval(),
                config.svc_cache_size,
                shutdown,
            )),
        }
    }

    async fn find(&self, meta_data: &ServiceMetaData) -> Option<Service> {
        self.cache.get(meta_data).await
    }

    /// 调试解析：节点地址 + nodePort，绕过集群内地址
    async fn find_node_port(&self, meta_data: &ServiceMetaData) -> Option<Service> {
        let ServiceMetaData::Platform {
            service_name,
            port_name,
        } = meta_data
        else {
            return None;
        };
        let node_host = self.debug_node_host.as_deref()?;

        match self.api.read_service(service_name).await {
            Ok(Some(svc)) => {
                let node_port = svc.port_by_name(port_name).and_then(|p| p.node_port)?;
                let resolved = build_service(&meta_data.identifier(), node_host, node_port);
                if let Some(service) = &resolved {
                    debug!(
                        service = %service.identifier(),
                        host = %service.host(),
                        port = service.port(),
                        "resolved platform node-port service"
                    );
                }
                resolved
            }
            Ok(None) => None,
            Err(e) => {
                warn!(
                    service = %service_name,
                    error = %e,
                    "cannot resolve platform node-port service"
                );
                None
            }
        }
    }
}

#[async_trait]
impl Discoverer for K8sServiceDiscoverer {
    async fn find_all_by_name(&self, name: &str) -> Vec<Service> {
        let services = match self.api.list_services().await {
            Ok(services) => services,
            Err(e) => {
                error!(service = %name, error = %e, "cannot list platform services");
                return Vec::new();
            }
        };

        let mut instances = Vec::new();
        for svc in services {
            if !svc.name().is_some_and(|n| n.eq_ignore_ascii_case(name)) {
                continue;
            }
            let Some(ip) = svc.cluster_ip() else { continue };
            for port in svc.ports() {
                if let Some(service) = build_service(name, ip, port.port) {
                    instances.push(service);
                }
            }
        }
        instances
    }
}

/// 按平台元数据解析集群内地址
struct ClusterServiceLoader {
    api: Arc<K8sApiClient>,
}

#[async_trait]
impl CacheLoader<ServiceMetaData, Service> for ClusterServiceLoader {
    async fn load(
        &self,
        meta_data: &ServiceMetaData,
    ) -> std::result::Result<Service, ApiError> {
        let ServiceMetaData::Platform {
            service_name,
            port_name,
        } = meta_data
        else {
            return Err("platform service lookup requires platform metadata".into());
        };

        let svc = self
            .api
            .read_service(service_name)
            .await?
            .ok_or_else(|| format!("platform service {} not found", service_name))?;
        let ip = svc
            .cluster_ip()
            .ok_or_else(|| format!("platform service {} has no cluster ip", service_name))?;
        let port = svc
            .port_by_name(port_name)
            .ok_or_else(|| format!("platform service {} has no port named {}", service_name, port_name))?;

        build_service(&meta_data.identifier(), ip, port.port)
            .ok_or_else(|| format!("platform service {} port out of range", service_name).into())
    }
}

// -------- Watch --------

#[derive(Debug, Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    object: V1Service,
}

/// 订阅服务变化，把增删事件直接写进缓存
fn spawn_watch(
    api: Arc<K8sApiClient>,
    cache: Arc<RefreshAheadCache<ServiceMetaData, Service>>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = watch_once(&api, &cache) => {
                    if let Err(e) = result {
                        warn!(error = %e, "platform watch interrupted, reconnecting");
                    }
                    tokio::time::sleep(WATCH_RECONNECT_DELAY).await;
                }
            }
        }
    });
}

async fn watch_once(
    api: &K8sApiClient,
    cache: &RefreshAheadCache<ServiceMetaData, Service>,
) -> std::result::Result<(), ApiError> {
    let url = format!(
        "{}/api/v1/namespaces/{}/services",
        api.base_path, api.namespace
    );
    let resp = api
        .http
        .get(&url)
        .bearer_auth(&api.token)
        .query(&[("watch", "true")])
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(format!("k8s watch failed with status {}", resp.status()).into());
    }

    // watch 响应是以换行分隔的 JSON 事件流
    let mut stream = resp.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if line.len() <= 1 {
                continue;
            }
            match serde_json::from_slice::<WatchEvent>(&line) {
                Ok(event) => handle_watch_event(cache, event).await,
                Err(e) => {
                    warn!(error = %e, "dropping malformed platform watch event");
                }
            }
        }
    }
    Ok(())
}

async fn handle_watch_event(
    cache: &RefreshAheadCache<ServiceMetaData, Service>,
    event: WatchEvent,
) {
    let Some(service_name) = event.object.name().map(str::to_string) else {
        return;
    };
    let cluster_ip = event.object.cluster_ip().map(str::to_string);

    for port in event.object.ports() {
        let Some(port_name) = port.name.clone() else { continue };
        let Ok(meta_data) = ServiceMetaData::platform(service_name.clone(), port_name) else {
            continue;
        };
        match event.event_type.as_str() {
            "ADDED" | "MODIFIED" => {
                let Some(ip) = cluster_ip.as_deref() else { continue };
                if let Some(service) = build_service(&meta_data.identifier(), ip, port.port) {
                    debug!(service = %service_name, "platform watch event put service into cache");
                    cache.put(meta_data, service).await;
                }
            }
            "DELETED" => {
                debug!(service = %service_name, "platform watch event invalidated service");
                cache.invalidate(&meta_data).await;
            }
            other => {
                warn!(event_type = %other, "ignoring unknown platform watch event type");
            }
        }
    }
}

// -------- Registrar --------

/// 平台自身负责实例生命周期，注册方不需要做任何事情
struct K8sServiceRegistrar;

#[async_trait]
impl Registrar for K8sServiceRegistrar {
    async fn register(&self, _service: &Service) -> bool {
        true
    }

    async fn register_with_timeout(&self, _service: &Service, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    async fn unregister(&self, _service: &Service) -> bool {
        true
    }
}

// -------- Provider --------

struct K8sServiceProvider {
    discoverer: Arc<K8sServiceDiscoverer>,
    debug_mode: bool,
}

#[async_trait]
impl Provider for K8sServiceProvider {
    async fn get(&self, meta_data: &ServiceMetaData) -> Option<Service> {
        match meta_data {
            ServiceMetaData::Platform { .. } => {
                let resolved = if self.debug_mode {
                    self.discoverer.find_node_port(meta_data).await
                } else {
                    self.discoverer.find(meta_data).await
                };
                if resolved.is_none() {
                    warn!(
                        service = %meta_data.identifier(),
                        "cannot resolve any platform service instance"
                    );
                }
                resolved
            }
            ServiceMetaData::Standard { .. } => {
                warn!(
                    service = %meta_data.identifier(),
                    "platform provider requires platform service metadata"
                );
                None
            }
        }
    }

    async fn get_by_identifier(&self, identifier: &str) -> Option<Service> {
        error!(
            service = %identifier,
            "platform provider does not support resolving a service by identifier"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE_JSON: &str = r#"{
        "metadata": { "name": "echo-svc" },
        "spec": {
            "clusterIP": "10.96.0.12",
            "ports": [
                { "name": "rpc-port", "port": 9090, "nodePort": 30090 },
                { "name": "metrics", "port": 9100 }
            ]
        }
    }"#;

    #[test]
    fn test_v1_service_parsing() {
        let svc: V1Service = serde_json::from_str(SERVICE_JSON).unwrap();
        assert_eq!(svc.name(), Some("echo-svc"));
        assert_eq!(svc.cluster_ip(), Some("10.96.0.12"));

        let port = svc.port_by_name("RPC-Port").unwrap();
        assert_eq!(port.port, 9090);
        assert_eq!(port.node_port, Some(30090));
        assert!(svc.port_by_name("missing").is_none());
    }

    #[test]
    fn test_headless_service_has_no_cluster_ip() {
        let svc: V1Service = serde_json::from_str(
            r#"{ "metadata": { "name": "headless" }, "spec": { "clusterIP": "None" } }"#,
        )
        .unwrap();
        assert!(svc.cluster_ip().is_none());
    }

    #[test]
    fn test_watch_event_parsing() {
        let raw = format!(r#"{{ "type": "ADDED", "object": {} }}"#, SERVICE_JSON);
        let event: WatchEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(event.event_type, "ADDED");
        assert_eq!(event.object.name(), Some("echo-svc"));
    }

    #[test]
    fn test_build_service_rejects_invalid_port() {
        assert!(build_service("echo-svc", "10.96.0.12", -1).is_none());
        let service = build_service("echo-svc", "10.96.0.12", 9090).unwrap();
        assert_eq!(service.port(), 9090);
        assert_eq!(service.host(), "10.96.0.12");
    }
}
