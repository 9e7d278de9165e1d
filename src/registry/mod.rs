//! 注册中心模块
//!
//! 把多种数据中心后端（Zookeeper、etcd、Consul、Kubernetes、Local）
//! 统一在 Discoverer / Registrar / Provider 三个抽象之后，
//! `Registry` 按配置组装一组后端实现并持有它们的生命周期。

pub mod cache;
pub mod consul;
pub mod etcd;
pub mod kubernetes;
pub mod local;
pub mod zookeeper;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{DataCenterConfig, DataCenterKind};
use crate::error::{ArgusError, Result};
use crate::service::{Service, ServiceMetaData};
use crate::strategy::Strategy;

/// 服务发现读侧抽象
///
/// 只负责返回数据中心里当前已知的实例，挑选实例是 `Provider` 的职责。
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// 按服务名查找全部实例
    ///
    /// 任何内部错误都降级为空列表，发现路径永远不会向调用方抛错。
    async fn find_all_by_name(&self, name: &str) -> Vec<Service>;

    /// 查找全部服务及其实例，默认不支持
    async fn find_all(&self) -> Result<HashMap<String, Vec<Service>>> {
        Err(ArgusError::unsupported(
            "find_all is not supported by this discoverer",
        ))
    }
}

/// 服务注册写侧抽象
#[async_trait]
pub trait Registrar: Send + Sync {
    /// 注册一个服务实例
    ///
    /// 成功返回 `true`；后端拒绝或不可达时记录日志并返回 `false`，不抛错。
    async fn register(&self, service: &Service) -> bool;

    /// 带超时注册；没有原生超时支持的后端返回 `Unsupported`
    async fn register_with_timeout(&self, service: &Service, timeout: Duration) -> Result<bool> {
        let _ = (service, timeout);
        Err(ArgusError::unsupported(
            "register with timeout is not supported by this registrar",
        ))
    }

    /// 注销一个服务实例
    ///
    /// 注销从未注册过的实例返回 `false`，同样不抛错。
    async fn unregister(&self, service: &Service) -> bool;
}

/// 服务提供抽象：从发现结果中解析出一个可用实例
#[async_trait]
pub trait Provider: Send + Sync {
    /// 按服务元数据解析一个实例，无可用实例时返回 `None`
    async fn get(&self, meta_data: &ServiceMetaData) -> Option<Service>;

    /// 按接口标识解析一个实例（异步后缀应由调用方先行剥离）
    async fn get_by_identifier(&self, identifier: &str) -> Option<Service>;
}

/// 注册前的公共前置校验：标识与实例 id 都不能为空
pub(crate) fn check_registrable(service: &Service, data_center: DataCenterKind) -> bool {
    if service.identifier().trim().is_empty() {
        error!(
            data_center = %data_center,
            "aborting registration, a service with an empty identifier cannot be registered"
        );
        return false;
    }
    if service.id().trim().is_empty() {
        error!(
            service = %service.identifier(),
            data_center = %data_center,
            "aborting registration, a service with an empty id cannot be registered"
        );
        return false;
    }
    true
}

/// 通用 Provider 实现：Discoverer 查出候选集，策略挑出一个
pub(crate) struct DiscovererProvider {
    data_center: DataCenterKind,
    discoverer: Arc<dyn Discoverer>,
    strategy: Box<dyn Strategy>,
}

impl DiscovererProvider {
    pub(crate) fn new(
        data_center: DataCenterKind,
        discoverer: Arc<dyn Discoverer>,
        strategy: Box<dyn Strategy>,
    ) -> Self {
        Self {
            data_center,
            discoverer,
            strategy,
        }
    }
}

#[async_trait]
impl Provider for DiscovererProvider {
    async fn get(&self, meta_data: &ServiceMetaData) -> Option<Service> {
        self.get_by_identifier(&meta_data.identifier()).await
    }

    async fn get_by_identifier(&self, identifier: &str) -> Option<Service> {
        let candidates = self.discoverer.find_all_by_name(identifier).await;
        let chosen = self.strategy.choose(&candidates).cloned();
        if chosen.is_none() {
            warn!(
                service = %identifier,
                data_center = %self.data_center,
                "cannot resolve any service instance"
            );
        }
        chosen
    }
}

/// 后端组装结果：一组 Discoverer / Registrar / Provider
pub(crate) struct BackendParts {
    pub(crate) discoverer: Arc<dyn Discoverer>,
    pub(crate) registrar: Arc<dyn Registrar>,
    pub(crate) provider: Arc<dyn Provider>,
}

/// 注册中心
///
/// 按数据中心配置组装一组后端实现；缓存刷新、监听与保活任务
/// 都挂在本实例持有的取消令牌上，`close` 时一并停止。
pub struct Registry {
    kind: DataCenterKind,
    discoverer: Arc<dyn Discoverer>,
    registrar: Arc<dyn Registrar>,
    provider: Arc<dyn Provider>,
    shutdown: CancellationToken,
}

impl Registry {
    /// 按配置创建注册中心
    ///
    /// 配置校验失败返回配置错误；后端连接失败返回发现错误。
    pub async fn create(config: &DataCenterConfig) -> Result<Registry> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let parts = match config {
            DataCenterConfig::Zookeeper(c) => zookeeper::build(c, shutdown.clone()).await?,
            DataCenterConfig::Etcd(c) => etcd::build(c, shutdown.clone()).await?,
            DataCenterConfig::Consul(c) => consul::build(c, shutdown.clone()).await?,
            DataCenterConfig::Kubernetes(c) => kubernetes::build(c, shutdown.clone()).await?,
            DataCenterConfig::Local(c) => local::build(c)?,
        };
        info!(data_center = %config.kind(), "registry created");
        Ok(Registry {
            kind: config.kind(),
            discoverer: parts.discoverer,
            registrar: parts.registrar,
            provider: parts.provider,
            shutdown,
        })
    }

    pub fn kind(&self) -> DataCenterKind {
        self.kind
    }

    pub fn discoverer(&self) -> Arc<dyn Discoverer> {
        self.discoverer.clone()
    }

    pub fn registrar(&self) -> Arc<dyn Registrar> {
        self.registrar.clone()
    }

    pub fn provider(&self) -> Arc<dyn Provider> {
        self.provider.clone()
    }

    /// 关闭注册中心，停止它拥有的保活 / 监听 / 缓存刷新任务
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!(data_center = %self.kind, "registry closed");
            self.shutdown.cancel();
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
