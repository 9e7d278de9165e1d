//! 本地静态后端的端到端测试
//!
//! 不依赖任何外部协调服务，覆盖工厂分发、提供方、注册方
//! 以及完整的客户端调用链路。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use argus_core::{
    ArgusError, ClientFactory, DataCenterConfig, DataCenterKind, EtcdConfig, FailureReason,
    HostAddress, InvokeError, InvokeRequest, InvokeResponse, LocalConfig, MethodInvoker, Registry,
    RetryPolicy, Service, ServiceMetaData, ServiceTarget,
};

fn local_config() -> DataCenterConfig {
    DataCenterConfig::Local(LocalConfig::new("127.0.0.1", 9090))
}

#[tokio::test]
async fn test_local_provider_always_returns_configured_address() {
    let registry = Registry::create(&local_config()).await.unwrap();
    assert_eq!(registry.kind(), DataCenterKind::Local);

    let provider = registry.provider();
    let meta = ServiceMetaData::new("acme", "rpc", "echo").unwrap();

    let service = provider.get(&meta).await.unwrap();
    assert_eq!(service.host(), "127.0.0.1");
    assert_eq!(service.port(), 9090);

    let service = provider.get_by_identifier("anything-at-all").await.unwrap();
    assert_eq!(service.host(), "127.0.0.1");
    assert_eq!(service.port(), 9090);
}

#[tokio::test]
async fn test_local_registrar_always_succeeds() {
    let registry = Registry::create(&local_config()).await.unwrap();
    let registrar = registry.registrar();

    let service = Service::builder("acme-rpc-echo")
        .host("127.0.0.1")
        .port(9090)
        .build()
        .unwrap();

    assert!(registrar.register(&service).await);
    assert!(registrar.unregister(&service).await);
    // 本地后端的带超时注册同样恒定成功
    assert!(
        registrar
            .register_with_timeout(&service, std::time::Duration::from_millis(10))
            .await
            .unwrap()
    );

    registry.close();
}

#[tokio::test]
async fn test_factory_rejects_invalid_configuration() {
    // 续约间隔不小于 TTL 是配置错误
    let bad = DataCenterConfig::Etcd(EtcdConfig {
        service_ttl_ms: 2_000,
        keep_interval_ms: 2_000,
        ..EtcdConfig::default()
    });
    match Registry::create(&bad).await {
        Err(ArgusError::Configuration(_)) => {}
        other => panic!("expected a configuration error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_unknown_data_center_kind_is_a_configuration_error() {
    match "chubby".parse::<DataCenterKind>() {
        Err(ArgusError::Configuration(msg)) => assert!(msg.contains("chubby")),
        other => panic!("expected a configuration error, got {:?}", other),
    }
}

/// 校验目标地址并原样回显请求体
struct EchoInvoker {
    expected: HostAddress,
    calls: AtomicUsize,
}

#[async_trait]
impl MethodInvoker for EchoInvoker {
    async fn invoke(
        &self,
        address: &HostAddress,
        request: &InvokeRequest,
    ) -> Result<InvokeResponse, InvokeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if address != &self.expected {
            return Err(InvokeError::connection_failed(format!(
                "unexpected address {}",
                address
            )));
        }
        Ok(InvokeResponse::new(request.body.clone()))
    }
}

#[tokio::test]
async fn test_full_call_path_through_local_registry() {
    let registry = Registry::create(&local_config()).await.unwrap();
    let invoker = Arc::new(EchoInvoker {
        expected: HostAddress::new("127.0.0.1", 9090),
        calls: AtomicUsize::new(0),
    });

    let factory = ClientFactory::with_registry(registry, invoker.clone());
    let client = factory.client(ServiceTarget::identifier("acme.EchoService.Async"));

    let request = InvokeRequest::new("echo").with_body(Bytes::from_static(b"ping"));
    let response = client.call(&request).await.unwrap();

    assert_eq!(response.body(), &Bytes::from_static(b"ping"));
    assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.target().describe(), "acme.EchoService");

    factory.close();
}

/// 永远连接失败的调用方
struct RefusingInvoker;

#[async_trait]
impl MethodInvoker for RefusingInvoker {
    async fn invoke(
        &self,
        _address: &HostAddress,
        _request: &InvokeRequest,
    ) -> Result<InvokeResponse, InvokeError> {
        Err(InvokeError::connection_failed("connection refused"))
    }
}

#[tokio::test]
async fn test_single_down_host_fails_with_no_hosts_available() {
    let registry = Registry::create(&local_config()).await.unwrap();
    let factory = ClientFactory::with_registry(registry, Arc::new(RefusingInvoker))
        .with_policy(RetryPolicy::new().with_backoff_delay(
            std::time::Duration::from_millis(1),
            std::time::Duration::from_millis(2),
        ));
    let client = factory.client(ServiceTarget::identifier("acme-rpc-echo"));

    let failed = client
        .call(&InvokeRequest::new("echo"))
        .await
        .unwrap_err();

    // 唯一的地址被尝试过之后没有候选；连接级失败不消耗调用预算
    assert_eq!(failed.reason, FailureReason::NoHostsAvailable);
    assert_eq!(failed.invocation_attempts, 0);
    assert_eq!(failed.failed_connections, 1);
}
