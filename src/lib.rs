//! Argus Service Discovery Core Library
//!
//! Provides a unified abstraction over multiple coordination backends
//! (Zookeeper, etcd, Consul, Kubernetes and a static local mode) together
//! with a resilient invocation engine that routes and retries calls
//! against discovered instances.

pub mod config;
pub mod error;
pub mod net;
pub mod service;
pub mod strategy;

// 注册中心与后端适配
pub mod registry;

// 调用客户端
pub mod client;

// Re-exports
pub use config::{
    ClientConfig, ConsulConfig, DataCenterConfig, DataCenterKind, EndpointScheme, EtcdConfig,
    EtcdEndpoint, KubernetesConfig, LocalConfig, ServerConfig, ZookeeperConfig,
};
pub use error::{ArgusError, Result};
pub use service::{Service, ServiceBuilder, ServiceMetaData};
pub use strategy::{NullStrategy, RandomStrategy, RoundRobinStrategy, Strategy};

// 注册中心 re-exports
pub use registry::{Discoverer, Provider, Registrar, Registry};

// 调用客户端 re-exports
pub use client::{
    AddressSelector, ClientFactory, FailureReason, HostAddress, HostMarkdown, HostStatus,
    InvokeError, InvokeRequest, InvokeResponse, MethodInvocation, MethodInvoker, MethodSpec,
    RetriesFailed, RetryPolicy, ServiceClient, ServiceTarget,
};
