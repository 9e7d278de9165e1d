//! 服务值对象
//!
//! `Service` 是注册 / 发现流转的不可变实体，构建完成后不再修改；
//! 各后端持久化的 JSON 负载格式为
//! `{identifier, name, id, host, port, version, startUpTs, enable}`。

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ArgusError, Result};
use crate::net;

/// 接口标识默认的异步后缀
pub const DEFAULT_ASYNC_SUFFIX: &str = ".Async";

/// 服务实例
///
/// 相等性与哈希只覆盖 identifier / name / id / host / port，
/// 字符串一律大小写不敏感；version、startUpTs、enable 不参与。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// 服务标识（逻辑服务名，大小写不敏感）
    identifier: String,

    /// 展示名
    name: String,

    /// 实例唯一标识
    id: String,

    /// 实例地址
    host: String,

    /// 实例端口
    port: u16,

    /// 服务版本
    version: i32,

    /// 实例启动时间戳（毫秒）
    start_up_ts: i64,

    /// 是否启用
    enable: bool,
}

impl Service {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn start_up_ts(&self) -> i64 {
        self.start_up_ts
    }

    pub fn enable(&self) -> bool {
        self.enable
    }

    /// 以服务标识创建构建器
    pub fn builder(identifier: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder::new(identifier)
    }

    /// 从后端返回的字段直接构造实例，不做默认值补全
    pub fn from_parts(
        identifier: impl Into<String>,
        name: impl Into<String>,
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Service {
            identifier: identifier.into(),
            name: name.into(),
            id: id.into(),
            host: host.into(),
            port,
            version: 0,
            start_up_ts: 0,
            enable: true,
        }
    }

    /// 以服务元数据创建构建器
    pub fn builder_from_meta_data(meta_data: &ServiceMetaData) -> ServiceBuilder {
        ServiceBuilder::new(meta_data.identifier())
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.identifier.eq_ignore_ascii_case(&other.identifier)
            && self.name.eq_ignore_ascii_case(&other.name)
            && self.id.eq_ignore_ascii_case(&other.id)
            && self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
    }
}

impl Eq for Service {}

impl Hash for Service {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifier.to_ascii_lowercase().hash(state);
        self.name.to_ascii_lowercase().hash(state);
        self.id.to_ascii_lowercase().hash(state);
        self.host.to_ascii_lowercase().hash(state);
        self.port.hash(state);
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[id={}, addr={}:{}]",
            self.identifier, self.id, self.host, self.port
        )
    }
}

/// `Service` 构建器
///
/// 未显式提供的字段在 `build` 时补全：
/// id 生成随机 UUID，host 取本机默认宣告地址，
/// 端口低于 1024 视为未设置并随机探测一个空闲端口。
pub struct ServiceBuilder {
    identifier: String,
    name: Option<String>,
    id: Option<String>,
    host: Option<String>,
    port: u16,
    version: i32,
    enable: bool,
}

impl ServiceBuilder {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            name: None,
            id: None,
            host: None,
            port: 0,
            version: 0,
            enable: true,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn enable(mut self, enable: bool) -> Self {
        self.enable = enable;
        self
    }

    /// 校验并构建不可变的 `Service`
    pub fn build(self) -> Result<Service> {
        if self.identifier.trim().is_empty() {
            return Err(ArgusError::configuration("service identifier cannot be empty"));
        }
        let name = match self.name {
            Some(name) if !name.trim().is_empty() => name,
            _ => self.identifier.clone(),
        };
        let id = match self.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => Uuid::new_v4().to_string(),
        };
        let host = match self.host {
            Some(host) if !host.trim().is_empty() => host,
            _ => net::default_host(),
        };
        let port = if self.port >= net::PORT_RANGE_MIN {
            self.port
        } else {
            net::available_port()?
        };

        Ok(Service {
            identifier: self.identifier,
            name,
            id,
            host,
            port,
            version: self.version,
            start_up_ts: chrono::Utc::now().timestamp_millis(),
            enable: self.enable,
        })
    }
}

/// 服务元数据，描述如何注册 / 发现一个服务
///
/// 标准形式由组织、类别、服务名构成，标识为 `org-category-name`；
/// 平台形式用于平台原生服务查找，标识即平台服务名，
/// 相等性只比较平台字段。
#[derive(Debug, Clone)]
pub enum ServiceMetaData {
    Standard {
        organization: String,
        category: String,
        name: String,
    },
    Platform {
        service_name: String,
        port_name: String,
    },
}

impl ServiceMetaData {
    /// 创建标准服务元数据，三段都不能为空
    pub fn new(
        organization: impl Into<String>,
        category: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self> {
        let organization = organization.into();
        let category = category.into();
        let name = name.into();
        if organization.trim().is_empty() {
            return Err(ArgusError::configuration("service organization cannot be empty"));
        }
        if category.trim().is_empty() {
            return Err(ArgusError::configuration("service category cannot be empty"));
        }
        if name.trim().is_empty() {
            return Err(ArgusError::configuration("service name cannot be empty"));
        }
        Ok(ServiceMetaData::Standard {
            organization,
            category,
            name,
        })
    }

    /// 创建平台服务元数据
    pub fn platform(
        service_name: impl Into<String>,
        port_name: impl Into<String>,
    ) -> Result<Self> {
        let service_name = service_name.into();
        let port_name = port_name.into();
        if service_name.trim().is_empty() {
            return Err(ArgusError::configuration("platform service name cannot be empty"));
        }
        if port_name.trim().is_empty() {
            return Err(ArgusError::configuration("platform port name cannot be empty"));
        }
        Ok(ServiceMetaData::Platform {
            service_name,
            port_name,
        })
    }

    /// 服务标识，保证非空
    pub fn identifier(&self) -> String {
        match self {
            ServiceMetaData::Standard {
                organization,
                category,
                name,
            } => format!("{}-{}-{}", organization, category, name),
            ServiceMetaData::Platform { service_name, .. } => service_name.clone(),
        }
    }
}

impl PartialEq for ServiceMetaData {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                ServiceMetaData::Standard {
                    organization: o1,
                    category: c1,
                    name: n1,
                },
                ServiceMetaData::Standard {
                    organization: o2,
                    category: c2,
                    name: n2,
                },
            ) => {
                o1.eq_ignore_ascii_case(o2)
                    && c1.eq_ignore_ascii_case(c2)
                    && n1.eq_ignore_ascii_case(n2)
            }
            (
                ServiceMetaData::Platform {
                    service_name: s1,
                    port_name: p1,
                },
                ServiceMetaData::Platform {
                    service_name: s2,
                    port_name: p2,
                },
            ) => s1.eq_ignore_ascii_case(s2) && p1.eq_ignore_ascii_case(p2),
            _ => false,
        }
    }
}

impl Eq for ServiceMetaData {}

impl Hash for ServiceMetaData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ServiceMetaData::Standard {
                organization,
                category,
                name,
            } => {
                0u8.hash(state);
                organization.to_ascii_lowercase().hash(state);
                category.to_ascii_lowercase().hash(state);
                name.to_ascii_lowercase().hash(state);
            }
            ServiceMetaData::Platform {
                service_name,
                port_name,
            } => {
                1u8.hash(state);
                service_name.to_ascii_lowercase().hash(state);
                port_name.to_ascii_lowercase().hash(state);
            }
        }
    }
}

/// 去掉接口标识尾部的默认异步后缀
pub fn strip_async_suffix(identifier: &str) -> &str {
    strip_suffix_with(identifier, DEFAULT_ASYNC_SUFFIX)
}

/// 去掉接口标识尾部的指定后缀，不匹配时原样返回
pub fn strip_suffix_with<'a>(identifier: &'a str, suffix: &str) -> &'a str {
    if suffix.is_empty() {
        return identifier;
    }
    identifier.strip_suffix(suffix).unwrap_or(identifier)
}
