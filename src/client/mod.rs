//! 调用客户端模块
//!
//! 把注册中心解析出的实例变成可靠的网络调用：
//! `AddressSelector` 负责挑地址，`MethodInvocation` 负责单次调用的
//! 重试 / 退避状态机，`MethodInvoker` 是外部注入的不透明网络调用方
//! （线协议与连接管理都在它背后，本模块不关心）。
//! 动态代理式的接口派发被显式登记的 `ServiceTarget` 取代：
//! 调用方在配置期把逻辑接口映射到服务标识，运行期不做任何类型内省。

pub mod address;
pub mod invocation;
pub mod retry;

pub use address::{AddressSelector, HostAddress, HostMarkdown, ServiceTarget};
pub use invocation::{FailureReason, MethodInvocation, RetriesFailed};
pub use retry::{
    DefaultOutcomeClassifier, HostStatus, InvokeError, OutcomeClassification, OutcomeClassifier,
    RetryPolicy,
};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::registry::Registry;

/// 一次方法调用的请求
///
/// 负载是不透明字节串，由上层的序列化约定解释。
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// 幂等方法允许对超时做重试
    pub idempotent: bool,
}

impl InvokeRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            headers: HashMap::new(),
            body: Bytes::new(),
            idempotent: false,
        }
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }
}

/// 一次方法调用的响应
#[derive(Debug, Clone)]
pub struct InvokeResponse {
    body: Bytes,
}

impl InvokeResponse {
    pub fn new(body: Bytes) -> Self {
        Self { body }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }
}

/// 不透明的网络调用方
///
/// 对指定地址发起一次网络尝试；失败以 [`InvokeError`] 表达，
/// 供重试状态机分类。实现方不做自己的重试。
#[async_trait]
pub trait MethodInvoker: Send + Sync {
    async fn invoke(
        &self,
        address: &HostAddress,
        request: &InvokeRequest,
    ) -> std::result::Result<InvokeResponse, InvokeError>;
}

/// 方法登记项
///
/// 接口方法在配置期显式登记到客户端，派发按方法名查表，
/// 不做任何运行期类型内省。登记项可以覆盖幂等标记和重试策略。
#[derive(Clone)]
pub struct MethodSpec {
    name: String,
    idempotent: bool,
    policy: Option<RetryPolicy>,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            idempotent: false,
            policy: None,
        }
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// 面向单个目标服务的调用客户端
///
/// 每次 `call` 驱动一个独立的调用状态机；
/// 并发调用之间只共享地址标记和发现缓存。
pub struct ServiceClient {
    invoker: Arc<dyn MethodInvoker>,
    selector: AddressSelector,
    policy: RetryPolicy,
    methods: HashMap<String, MethodSpec>,
}

impl ServiceClient {
    pub fn new(
        invoker: Arc<dyn MethodInvoker>,
        selector: AddressSelector,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            invoker,
            selector,
            policy,
            methods: HashMap::new(),
        }
    }

    /// 登记一个方法；同名登记后写覆盖先写
    pub fn with_method(mut self, spec: MethodSpec) -> Self {
        self.methods.insert(spec.name.clone(), spec);
        self
    }

    /// 发起一次调用，内部按策略重试，返回成功响应或终止错误
    ///
    /// 已登记的方法套用登记项里的幂等标记与重试策略；
    /// 未登记的方法按请求自带的标记执行。
    pub async fn call(
        &self,
        request: &InvokeRequest,
    ) -> std::result::Result<InvokeResponse, RetriesFailed> {
        let spec = self.methods.get(&request.method);
        let policy = spec
            .and_then(|s| s.policy.as_ref())
            .unwrap_or(&self.policy);
        let invocation = MethodInvocation::new(self.invoker.as_ref(), &self.selector, policy);

        match spec {
            Some(spec) if spec.idempotent != request.idempotent => {
                let adjusted = request.clone().with_idempotent(spec.idempotent);
                invocation.invoke(&adjusted).await
            }
            _ => invocation.invoke(request).await,
        }
    }

    pub fn target(&self) -> &ServiceTarget {
        self.selector.target()
    }
}

/// 客户端工厂
///
/// 持有一个注册中心实例，派生出的所有客户端共享
/// 同一份地址标记表和发现缓存。
pub struct ClientFactory {
    registry: Registry,
    invoker: Arc<dyn MethodInvoker>,
    policy: RetryPolicy,
    markdown: Arc<HostMarkdown>,
}

impl ClientFactory {
    /// 按客户端配置创建工厂
    pub async fn create(config: &ClientConfig, invoker: Arc<dyn MethodInvoker>) -> Result<Self> {
        let registry = Registry::create(&config.data_center).await?;
        Ok(Self::with_registry(registry, invoker))
    }

    pub fn with_registry(registry: Registry, invoker: Arc<dyn MethodInvoker>) -> Self {
        Self {
            registry,
            invoker,
            policy: RetryPolicy::default(),
            markdown: Arc::new(HostMarkdown::default()),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 为一个调用目标派生客户端
    pub fn client(&self, target: ServiceTarget) -> ServiceClient {
        let selector = AddressSelector::with_markdown(
            self.registry.provider(),
            target,
            self.markdown.clone(),
        );
        ServiceClient::new(self.invoker.clone(), selector, self.policy.clone())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// 关闭底层注册中心
    pub fn close(&self) {
        self.registry.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataCenterKind;
    use crate::registry::{Discoverer, DiscovererProvider};
    use crate::service::Service;
    use crate::strategy::RoundRobinStrategy;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

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

    /// 第一次返回超时状态，之后成功
    struct TimeoutOnceInvoker {
        results: Mutex<Vec<std::result::Result<InvokeResponse, InvokeError>>>,
        calls: AtomicUsize,
    }

    impl TimeoutOnceInvoker {
        fn new() -> Self {
            Self {
                results: Mutex::new(vec![Err(InvokeError::Status(
                    tonic::Status::deadline_exceeded("slow"),
                ))]),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MethodInvoker for TimeoutOnceInvoker {
        async fn invoke(
            &self,
            _address: &HostAddress,
            _request: &InvokeRequest,
        ) -> std::result::Result<InvokeResponse, InvokeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(InvokeResponse::new(Bytes::from_static(b"pong")))
            } else {
                results.remove(0)
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new().with_backoff_delay(Duration::from_millis(1), Duration::from_millis(2))
    }

    #[tokio::test]
    async fn test_unregistered_method_keeps_request_idempotency() {
        let invoker = Arc::new(TimeoutOnceInvoker::new());
        let client = ServiceClient::new(invoker.clone(), make_selector(&[9001, 9002]), fast_policy());

        // 请求未标记幂等：超时不可重试，立即终止
        let failed = client.call(&InvokeRequest::new("echo")).await.unwrap_err();
        assert_eq!(failed.reason, FailureReason::NonRetryable);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registered_idempotent_method_retries_timeout() {
        let invoker = Arc::new(TimeoutOnceInvoker::new());
        let client = ServiceClient::new(invoker.clone(), make_selector(&[9001, 9002]), fast_policy())
            .with_method(MethodSpec::new("echo").idempotent(true));

        let response = client.call(&InvokeRequest::new("echo")).await.unwrap();
        assert_eq!(response.body(), &Bytes::from_static(b"pong"));
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_method_spec_policy_override() {
        let invoker = Arc::new(TimeoutOnceInvoker::new());
        // 方法级策略：零重试预算，幂等也只允许初始一次尝试后终止
        let client = ServiceClient::new(invoker.clone(), make_selector(&[9001, 9002]), fast_policy())
            .with_method(
                MethodSpec::new("echo")
                    .idempotent(true)
                    .with_policy(fast_policy().with_max_retries(0)),
            );

        let failed = client.call(&InvokeRequest::new("echo")).await.unwrap_err();
        assert_eq!(failed.reason, FailureReason::MaxRetriesExceeded);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
    }
}
