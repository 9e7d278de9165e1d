//! 地址选择
//!
//! 把 Provider 解析出的服务实例适配成网络地址。
//! 选择器自身不保存长期状态：反复失败的地址通过共享的
//! 标记下线表跨调用降权，单次调用内已尝试过的地址
//! 由调用方通过排除集合硬过滤。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::registry::Provider;
use crate::service::{Service, ServiceMetaData, strip_async_suffix, strip_suffix_with};

/// 标记下线的默认生效时长
const DEFAULT_MARKDOWN_DURATION: Duration = Duration::from_secs(10);

/// 单次选择最多向 Provider 请求的轮数
const MAX_SELECTION_ROUNDS: usize = 16;

/// 网络地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddress {
    host: String,
    port: u16,
}

impl HostAddress {
    /// host 统一小写，保证排除与标记按大小写不敏感的语义生效
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().to_lowercase(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<&Service> for HostAddress {
    fn from(service: &Service) -> Self {
        HostAddress::new(service.host(), service.port())
    }
}

impl std::fmt::Display for HostAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 跨调用共享的地址健康标记
///
/// 标记有时效：过期后地址恢复正常参与选择。
pub struct HostMarkdown {
    marked: Mutex<HashMap<HostAddress, Instant>>,
    markdown_duration: Duration,
}

impl Default for HostMarkdown {
    fn default() -> Self {
        Self::new(DEFAULT_MARKDOWN_DURATION)
    }
}

impl HostMarkdown {
    pub fn new(markdown_duration: Duration) -> Self {
        Self {
            marked: Mutex::new(HashMap::new()),
            markdown_duration,
        }
    }

    /// 标记一个地址最近失败过
    pub fn markdown(&self, address: &HostAddress) {
        debug!(address = %address, "marking address down");
        self.marked
            .lock()
            .unwrap()
            .insert(address.clone(), Instant::now());
    }

    pub fn is_marked_down(&self, address: &HostAddress) -> bool {
        let mut marked = self.marked.lock().unwrap();
        match marked.get(address) {
            Some(marked_at) if marked_at.elapsed() < self.markdown_duration => true,
            Some(_) => {
                marked.remove(address);
                false
            }
            None => false,
        }
    }
}

/// 调用目标：服务元数据，或显式登记的接口标识
#[derive(Debug, Clone)]
pub enum ServiceTarget {
    MetaData(ServiceMetaData),
    Identifier(String),
}

impl ServiceTarget {
    pub fn meta_data(meta_data: ServiceMetaData) -> Self {
        ServiceTarget::MetaData(meta_data)
    }

    /// 按接口标识创建目标，剥离默认异步后缀
    pub fn identifier(identifier: impl AsRef<str>) -> Self {
        ServiceTarget::Identifier(strip_async_suffix(identifier.as_ref()).to_string())
    }

    /// 按接口标识创建目标，剥离指定后缀
    pub fn identifier_with_suffix(identifier: impl AsRef<str>, suffix: &str) -> Self {
        ServiceTarget::Identifier(strip_suffix_with(identifier.as_ref(), suffix).to_string())
    }

    pub fn describe(&self) -> String {
        match self {
            ServiceTarget::MetaData(meta_data) => meta_data.identifier(),
            ServiceTarget::Identifier(identifier) => identifier.clone(),
        }
    }
}

/// 地址选择器
///
/// 每个实例服务于一个调用目标；优先返回未被标记下线的地址，
/// 全部被标记时退而返回一个被标记的地址，只有排除集合是硬过滤。
pub struct AddressSelector {
    target: ServiceTarget,
    provider: Arc<dyn Provider>,
    markdown: Arc<HostMarkdown>,
}

impl AddressSelector {
    pub fn new(provider: Arc<dyn Provider>, target: ServiceTarget) -> Self {
        Self::with_markdown(provider, target, Arc::new(HostMarkdown::default()))
    }

    /// 与其他选择器共享同一份标记下线表
    pub fn with_markdown(
        provider: Arc<dyn Provider>,
        target: ServiceTarget,
        markdown: Arc<HostMarkdown>,
    ) -> Self {
        Self {
            target,
            provider,
            markdown,
        }
    }

    pub fn target(&self) -> &ServiceTarget {
        &self.target
    }

    /// 选择一个地址
    ///
    /// `_context` 预留给带亲和性的选择实现，这里不使用。
    pub async fn select_address(
        &self,
        _context: Option<&str>,
        excluded: &HashSet<HostAddress>,
    ) -> Option<HostAddress> {
        let mut fallback: Option<HostAddress> = None;
        for _ in 0..MAX_SELECTION_ROUNDS {
            let Some(service) = self.resolve().await else {
                break;
            };
            let address = HostAddress::from(&service);
            if excluded.contains(&address) {
                continue;
            }
            if self.markdown.is_marked_down(&address) {
                if fallback.is_none() {
                    fallback = Some(address);
                }
                continue;
            }
            return Some(address);
        }
        fallback
    }

    /// 标记一个地址最近失败过，后续选择会降权
    pub fn markdown(&self, address: &HostAddress) {
        self.markdown.markdown(address);
    }

    async fn resolve(&self) -> Option<Service> {
        match &self.target {
            ServiceTarget::MetaData(meta_data) => self.provider.get(meta_data).await,
            ServiceTarget::Identifier(identifier) => {
                self.provider.get_by_identifier(identifier).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataCenterKind;
    use crate::registry::{Discoverer, DiscovererProvider};
    use crate::strategy::RoundRobinStrategy;
    use async_trait::async_trait;

    struct StaticDiscoverer {
        services: Vec<Service>,
    }

    #[async_trait]
    impl Discoverer for StaticDiscoverer {
        async fn find_all_by_name(&self, _name: &str) -> Vec<Service> {
            self.services.clone()
        }
    }

    fn make_selector(ports: &[u16]) -> AddressSelector {
        let services = ports
            .iter()
            .map(|port| {
                Service::from_parts(
                    "acme-rpc-echo",
                    "echo",
                    format!("instance-{}", port),
                    "127.0.0.1",
                    *port,
                )
            })
            .collect();
        let provider = Arc::new(DiscovererProvider::new(
            DataCenterKind::Local,
            Arc::new(StaticDiscoverer { services }),
            Box::new(RoundRobinStrategy::new()),
        ));
        AddressSelector::new(provider, ServiceTarget::identifier("acme-rpc-echo"))
    }

    #[tokio::test]
    async fn test_select_skips_excluded_addresses() {
        let selector = make_selector(&[9001, 9002, 9003]);

        let mut excluded = HashSet::new();
        excluded.insert(HostAddress::new("127.0.0.1", 9001));
        excluded.insert(HostAddress::new("127.0.0.1", 9002));

        let address = selector.select_address(None, &excluded).await.unwrap();
        assert_eq!(address.port(), 9003);
    }

    #[tokio::test]
    async fn test_select_returns_none_when_all_excluded() {
        let selector = make_selector(&[9001, 9002]);

        let mut excluded = HashSet::new();
        excluded.insert(HostAddress::new("127.0.0.1", 9001));
        excluded.insert(HostAddress::new("127.0.0.1", 9002));

        assert!(selector.select_address(None, &excluded).await.is_none());
    }

    #[tokio::test]
    async fn test_marked_down_address_is_deprioritized_not_banned() {
        let selector = make_selector(&[9001, 9002]);
        let marked = HostAddress::new("127.0.0.1", 9001);
        selector.markdown(&marked);

        // 有干净地址时不选被标记的
        for _ in 0..4 {
            let address = selector.select_address(None, &HashSet::new()).await.unwrap();
            assert_eq!(address.port(), 9002);
        }

        // 全部被标记时仍要返回一个，保证调用能继续
        let other = HostAddress::new("127.0.0.1", 9002);
        selector.markdown(&other);
        assert!(selector.select_address(None, &HashSet::new()).await.is_some());
    }

    #[tokio::test]
    async fn test_markdown_expires() {
        let provider = {
            let services = vec![Service::from_parts(
                "acme-rpc-echo",
                "echo",
                "instance-1",
                "127.0.0.1",
                9001,
            )];
            Arc::new(DiscovererProvider::new(
                DataCenterKind::Local,
                Arc::new(StaticDiscoverer { services }),
                Box::new(RoundRobinStrategy::new()),
            ))
        };
        let markdown = Arc::new(HostMarkdown::new(Duration::from_millis(30)));
        let selector = AddressSelector::with_markdown(
            provider,
            ServiceTarget::identifier("acme-rpc-echo"),
            markdown.clone(),
        );

        let address = HostAddress::new("127.0.0.1", 9001);
        selector.markdown(&address);
        assert!(markdown.is_marked_down(&address));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!markdown.is_marked_down(&address));
    }

    #[tokio::test]
    async fn test_empty_instance_list_yields_none() {
        let selector = make_selector(&[]);
        assert!(selector.select_address(None, &HashSet::new()).await.is_none());
    }

    #[test]
    fn test_target_strips_async_suffix() {
        let target = ServiceTarget::identifier("acme.EchoService.Async");
        assert_eq!(target.describe(), "acme.EchoService");

        let target = ServiceTarget::identifier_with_suffix("EchoServiceFuture", "Future");
        assert_eq!(target.describe(), "EchoService");
    }
}
