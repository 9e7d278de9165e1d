//! 数据中心配置
//!
//! 每种后端一个配置变体，字段在构造 / 加载后通过 `validate` 一次性校验。
//! 客户端与服务端使用两个独立的配置类型：
//! 服务端专属的宣告地址（register host）不会出现在客户端配置里。

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ArgusError, Result};

/// 平台内挂载的凭证文件路径
const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// 数据中心类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataCenterKind {
    Zookeeper,
    Etcd,
    Consul,
    Kubernetes,
    Local,
}

impl FromStr for DataCenterKind {
    type Err = ArgusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "zookeeper" | "zk" => Ok(DataCenterKind::Zookeeper),
            "etcd" => Ok(DataCenterKind::Etcd),
            "consul" => Ok(DataCenterKind::Consul),
            "kubernetes" | "k8s" => Ok(DataCenterKind::Kubernetes),
            "local" => Ok(DataCenterKind::Local),
            _ => Err(ArgusError::configuration(format!(
                "unknown data center kind: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for DataCenterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let literal = match self {
            DataCenterKind::Zookeeper => "zookeeper",
            DataCenterKind::Etcd => "etcd",
            DataCenterKind::Consul => "consul",
            DataCenterKind::Kubernetes => "kubernetes",
            DataCenterKind::Local => "local",
        };
        f.write_str(literal)
    }
}

/// 数据中心配置（按后端类型打标签）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DataCenterConfig {
    Zookeeper(ZookeeperConfig),
    Etcd(EtcdConfig),
    Consul(ConsulConfig),
    Kubernetes(KubernetesConfig),
    Local(LocalConfig),
}

impl DataCenterConfig {
    pub fn kind(&self) -> DataCenterKind {
        match self {
            DataCenterConfig::Zookeeper(_) => DataCenterKind::Zookeeper,
            DataCenterConfig::Etcd(_) => DataCenterKind::Etcd,
            DataCenterConfig::Consul(_) => DataCenterKind::Consul,
            DataCenterConfig::Kubernetes(_) => DataCenterKind::Kubernetes,
            DataCenterConfig::Local(_) => DataCenterKind::Local,
        }
    }

    /// 校验配置，非法参数返回配置错误
    pub fn validate(&self) -> Result<()> {
        match self {
            DataCenterConfig::Zookeeper(c) => c.validate(),
            DataCenterConfig::Etcd(c) => c.validate(),
            DataCenterConfig::Consul(c) => c.validate(),
            DataCenterConfig::Kubernetes(c) => c.validate(),
            DataCenterConfig::Local(c) => c.validate(),
        }
    }
}

// -------- Zookeeper --------

/// 层级存储（Zookeeper）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZookeeperConfig {
    /// 连接串，形如 `host1:port1,host2:port2`
    #[serde(default = "default_zk_connect_string")]
    pub connect_string: String,

    /// 会话超时（毫秒）
    #[serde(default = "default_zk_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// 所有数据记录在此基础路径之下
    #[serde(default = "default_zk_base_path")]
    pub base_path: String,
}

fn default_zk_connect_string() -> String {
    "localhost:2181".to_string()
}

fn default_zk_session_timeout_ms() -> u64 {
    15_000
}

fn default_zk_base_path() -> String {
    "/argus".to_string()
}

impl Default for ZookeeperConfig {
    fn default() -> Self {
        Self {
            connect_string: default_zk_connect_string(),
            session_timeout_ms: default_zk_session_timeout_ms(),
            base_path: default_zk_base_path(),
        }
    }
}

impl ZookeeperConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// 基础路径，保证不带尾部斜杠
    pub fn base_path(&self) -> &str {
        let trimmed = self.base_path.trim_end_matches('/');
        if trimmed.is_empty() { "/" } else { trimmed }
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_string.trim().is_empty() {
            return Err(ArgusError::configuration(
                "zookeeper connection string cannot be empty",
            ));
        }
        if !self.base_path.starts_with('/') {
            return Err(ArgusError::configuration(
                "zookeeper base path must start with '/'",
            ));
        }
        if self.session_timeout_ms == 0 {
            return Err(ArgusError::configuration(
                "zookeeper session timeout must be greater than 0",
            ));
        }
        Ok(())
    }
}

// -------- Etcd --------

/// 端点协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointScheme {
    Http,
    Https,
}

impl std::fmt::Display for EndpointScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointScheme::Http => f.write_str("http"),
            EndpointScheme::Https => f.write_str("https"),
        }
    }
}

/// 租约存储（etcd）端点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdEndpoint {
    #[serde(default = "default_endpoint_scheme")]
    pub scheme: EndpointScheme,
    #[serde(default = "default_etcd_host")]
    pub host: String,
    #[serde(default = "default_etcd_port")]
    pub port: u16,
}

fn default_endpoint_scheme() -> EndpointScheme {
    EndpointScheme::Http
}

fn default_etcd_host() -> String {
    "localhost".to_string()
}

fn default_etcd_port() -> u16 {
    2379
}

impl Default for EtcdEndpoint {
    fn default() -> Self {
        Self {
            scheme: default_endpoint_scheme(),
            host: default_etcd_host(),
            port: default_etcd_port(),
        }
    }
}

impl EtcdEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: EndpointScheme::Http,
            host: host.into(),
            port,
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// 租约存储（etcd）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    /// 端点列表，为空时使用默认端点
    #[serde(default)]
    pub endpoints: Vec<EtcdEndpoint>,

    /// 实例键前缀
    #[serde(default = "default_etcd_key_prefix")]
    pub key_prefix: String,

    /// 租约 TTL（毫秒）
    #[serde(default = "default_etcd_service_ttl_ms")]
    pub service_ttl_ms: u64,

    /// 续约间隔（毫秒），必须小于 TTL
    #[serde(default = "default_etcd_keep_interval_ms")]
    pub keep_interval_ms: u64,
}

fn default_etcd_key_prefix() -> String {
    "argus/services".to_string()
}

fn default_etcd_service_ttl_ms() -> u64 {
    5_000
}

fn default_etcd_keep_interval_ms() -> u64 {
    3_000
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            key_prefix: default_etcd_key_prefix(),
            service_ttl_ms: default_etcd_service_ttl_ms(),
            keep_interval_ms: default_etcd_keep_interval_ms(),
        }
    }
}

impl EtcdConfig {
    /// 端点 URL 列表，为空时回退到 `http://localhost:2379`
    pub fn endpoint_urls(&self) -> Vec<String> {
        if self.endpoints.is_empty() {
            vec![EtcdEndpoint::default().url()]
        } else {
            self.endpoints.iter().map(|e| e.url()).collect()
        }
    }

    /// 键前缀，保证不带尾部斜杠
    pub fn key_prefix(&self) -> &str {
        self.key_prefix.trim_end_matches('/')
    }

    pub fn service_ttl(&self) -> Duration {
        Duration::from_millis(self.service_ttl_ms)
    }

    pub fn keep_interval(&self) -> Duration {
        Duration::from_millis(self.keep_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_prefix().is_empty() {
            return Err(ArgusError::configuration("etcd key prefix cannot be empty"));
        }
        if self.service_ttl_ms < 1_000 {
            return Err(ArgusError::configuration(
                "etcd service TTL must be at least one second",
            ));
        }
        if self.keep_interval_ms == 0 {
            return Err(ArgusError::configuration(
                "etcd keep interval must be greater than 0",
            ));
        }
        if self.keep_interval_ms >= self.service_ttl_ms {
            return Err(ArgusError::configuration(
                "etcd keep interval cannot be longer than service TTL",
            ));
        }
        Ok(())
    }
}

// -------- Consul --------

/// 健康检查代理（Consul）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    #[serde(default = "default_consul_host")]
    pub host: String,

    #[serde(default = "default_consul_port")]
    pub port: u16,

    /// 心跳上报间隔（毫秒）
    #[serde(default = "default_consul_check_interval_ms")]
    pub check_interval_ms: u64,

    /// 注册时携带的健康检查 TTL（毫秒）
    #[serde(default = "default_consul_check_ttl_ms")]
    pub check_ttl_ms: u64,
}

fn default_consul_host() -> String {
    "localhost".to_string()
}

fn default_consul_port() -> u16 {
    8500
}

fn default_consul_check_interval_ms() -> u64 {
    2_000
}

fn default_consul_check_ttl_ms() -> u64 {
    5_000
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            host: default_consul_host(),
            port: default_consul_port(),
            check_interval_ms: default_consul_check_interval_ms(),
            check_ttl_ms: default_consul_check_ttl_ms(),
        }
    }
}

impl ConsulConfig {
    pub fn agent_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ArgusError::configuration("consul host cannot be empty"));
        }
        if self.check_interval_ms == 0 {
            return Err(ArgusError::configuration(
                "consul check interval must be greater than 0",
            ));
        }
        if self.check_ttl_ms <= self.check_interval_ms {
            return Err(ArgusError::configuration(
                "consul check TTL must be longer than the check interval",
            ));
        }
        Ok(())
    }
}

// -------- Kubernetes --------

/// 平台 API（Kubernetes）配置
///
/// API server 地址与凭证未显式配置时从运行环境读取：
/// 地址来自 `KUBERNETES_SERVICE_HOST` / `KUBERNETES_SERVICE_PORT`，
/// 凭证来自集群内挂载的 service account token 文件。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default = "default_k8s_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub api_server_host: Option<String>,

    #[serde(default)]
    pub api_server_port: Option<u16>,

    /// 显式指定的 bearer token，缺省时读取挂载的凭证文件
    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default = "default_true")]
    pub verify_ssl: bool,

    /// 服务缓存容量
    #[serde(default = "default_k8s_svc_cache_size")]
    pub svc_cache_size: usize,

    /// 服务缓存刷新窗口（毫秒）
    #[serde(default = "default_k8s_svc_refresh_interval_ms")]
    pub svc_refresh_interval_ms: u64,

    /// 是否开启服务变化监听
    #[serde(default)]
    pub svc_watch: bool,

    /// 调试模式下替代集群内地址的节点地址
    #[serde(default)]
    pub debug_node_host: Option<String>,
}

fn default_k8s_namespace() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_k8s_svc_cache_size() -> usize {
    100
}

fn default_k8s_svc_refresh_interval_ms() -> u64 {
    5_000
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: default_k8s_namespace(),
            api_server_host: None,
            api_server_port: None,
            auth_token: None,
            verify_ssl: true,
            svc_cache_size: default_k8s_svc_cache_size(),
            svc_refresh_interval_ms: default_k8s_svc_refresh_interval_ms(),
            svc_watch: false,
            debug_node_host: None,
        }
    }
}

impl KubernetesConfig {
    /// API server 基础地址
    pub fn base_path(&self) -> String {
        let host = self
            .api_server_host
            .clone()
            .or_else(|| std::env::var("KUBERNETES_SERVICE_HOST").ok())
            .unwrap_or_else(|| "localhost".to_string());
        let port = self
            .api_server_port
            .or_else(|| {
                std::env::var("KUBERNETES_SERVICE_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(443);
        format!("https://{}:{}", host, port)
    }

    /// 鉴权 token，显式配置优先，否则读取挂载的凭证文件
    pub fn auth_token(&self) -> Result<String> {
        if let Some(token) = &self.auth_token {
            if !token.trim().is_empty() {
                return Ok(token.clone());
            }
        }
        let raw = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH).map_err(|e| {
            ArgusError::configuration(format!(
                "cannot load service account token from {}: {}",
                SERVICE_ACCOUNT_TOKEN_PATH, e
            ))
        })?;
        Ok(raw.trim().to_string())
    }

    pub fn svc_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.svc_refresh_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(ArgusError::configuration("k8s namespace cannot be empty"));
        }
        if self.svc_cache_size == 0 {
            return Err(ArgusError::configuration(
                "k8s service cache size must be greater than 0",
            ));
        }
        Ok(())
    }
}

// -------- Local --------

/// 本地静态配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_local_host")]
    pub host: String,
    pub port: u16,
}

fn default_local_host() -> String {
    "localhost".to_string()
}

impl LocalConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ArgusError::configuration("local host cannot be empty"));
        }
        Ok(())
    }
}

// -------- Client / Server --------

/// 客户端配置，只包含数据中心连接参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub data_center: DataCenterConfig,
}

impl ClientConfig {
    pub fn new(data_center: DataCenterConfig) -> Self {
        Self { data_center }
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)
            .map_err(|e| ArgusError::configuration(format!("invalid client config: {}", e)))?;
        config.data_center.validate()?;
        Ok(config)
    }
}

/// 服务端配置，额外携带宣告给数据中心的注册地址
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub data_center: DataCenterConfig,

    /// 注册到数据中心的宣告地址，缺省时探测本机默认地址
    #[serde(default)]
    pub register_host: Option<String>,
}

impl ServerConfig {
    pub fn new(data_center: DataCenterConfig) -> Self {
        Self {
            data_center,
            register_host: None,
        }
    }

    pub fn with_register_host(mut self, host: impl Into<String>) -> Self {
        self.register_host = Some(host.into());
        self
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)
            .map_err(|e| ArgusError::configuration(format!("invalid server config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(host) = &self.register_host {
            if host.trim().is_empty() {
                return Err(ArgusError::configuration("register host cannot be empty"));
            }
        }
        self.data_center.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_str() {
        assert_eq!("etcd".parse::<DataCenterKind>().unwrap(), DataCenterKind::Etcd);
        assert_eq!("K8S".parse::<DataCenterKind>().unwrap(), DataCenterKind::Kubernetes);
        assert!("xyz".parse::<DataCenterKind>().is_err());
    }

    #[test]
    fn test_etcd_defaults_and_validation() {
        let config = EtcdConfig::default();
        assert_eq!(config.endpoint_urls(), vec!["http://localhost:2379".to_string()]);
        assert_eq!(config.key_prefix(), "argus/services");
        config.validate().unwrap();

        let bad = EtcdConfig {
            keep_interval_ms: 6_000,
            ..EtcdConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_etcd_key_prefix_strips_trailing_slashes() {
        let config = EtcdConfig {
            key_prefix: "argus/services///".to_string(),
            ..EtcdConfig::default()
        };
        assert_eq!(config.key_prefix(), "argus/services");
    }

    #[test]
    fn test_consul_interval_validation() {
        let bad = ConsulConfig {
            check_interval_ms: 5_000,
            check_ttl_ms: 5_000,
            ..ConsulConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_client_config_toml_round_trip() {
        let toml_text = r#"
            [data_center]
            kind = "etcd"
            key_prefix = "svc/registry/"
            service_ttl_ms = 6000
            keep_interval_ms = 2000

            [[data_center.endpoints]]
            host = "10.0.0.1"
            port = 2379
        "#;
        let config: ClientConfig = toml::from_str(toml_text).unwrap();
        match &config.data_center {
            DataCenterConfig::Etcd(etcd) => {
                assert_eq!(etcd.key_prefix(), "svc/registry");
                assert_eq!(etcd.endpoint_urls(), vec!["http://10.0.0.1:2379".to_string()]);
                assert_eq!(etcd.service_ttl_ms, 6000);
            }
            other => panic!("unexpected data center config: {:?}", other),
        }
        config.data_center.validate().unwrap();
    }

    #[test]
    fn test_server_config_register_host() {
        let config = ServerConfig::new(DataCenterConfig::Local(LocalConfig::new(
            "127.0.0.1",
            9090,
        )))
        .with_register_host("10.1.2.3");
        config.validate().unwrap();

        let bad = ServerConfig {
            register_host: Some("  ".to_string()),
            ..config
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_unknown_kind_in_toml_is_rejected() {
        let toml_text = r#"
            [data_center]
            kind = "chubby"
        "#;
        assert!(toml::from_str::<ClientConfig>(toml_text).is_err());
    }
}
