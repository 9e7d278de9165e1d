//! 本地静态数据中心
//!
//! 没有真实的协调后端：提供方永远返回配置里的固定地址，
//! 注册方什么都不做并恒定成功，用于本地联调与测试。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{BackendParts, Discoverer, Provider, Registrar};
use crate::config::LocalConfig;
use crate::error::Result;
use crate::service::{Service, ServiceMetaData};

const LOCAL_SERVICE_IDENTIFIER: &str = "argus-local-service";

pub(crate) fn build(config: &LocalConfig) -> Result<BackendParts> {
    let service = Service::builder(LOCAL_SERVICE_IDENTIFIER)
        .host(config.host.clone())
        .port(config.port)
        .build()?;

    let discoverer = Arc::new(LocalServiceDiscoverer {
        service: service.clone(),
    });
    let registrar = Arc::new(LocalServiceRegistrar);
    let provider = Arc::new(LocalServiceProvider { service });
    Ok(BackendParts {
        discoverer,
        registrar,
        provider,
    })
}

struct LocalServiceDiscoverer {
    service: Service,
}

#[async_trait]
impl Discoverer for LocalServiceDiscoverer {
    async fn find_all_by_name(&self, _name: &str) -> Vec<Service> {
        vec![self.service.clone()]
    }

    async fn find_all(&self) -> Result<HashMap<String, Vec<Service>>> {
        let mut all = HashMap::new();
        all.insert(
            self.service.identifier().to_string(),
            vec![self.service.clone()],
        );
        Ok(all)
    }
}

/// 本地注册方不需要做任何事情
struct LocalServiceRegistrar;

#[async_trait]
impl Registrar for LocalServiceRegistrar {
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

struct LocalServiceProvider {
    service: Service,
}

#[async_trait]
impl Provider for LocalServiceProvider {
    async fn get(&self, _meta_data: &ServiceMetaData) -> Option<Service> {
        Some(self.service.clone())
    }

    async fn get_by_identifier(&self, _identifier: &str) -> Option<Service> {
        Some(self.service.clone())
    }
}
