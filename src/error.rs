//! Argus 统一错误类型
//!
//! 发现与注册路径上的错误不向调用方抛出（降级为空结果 / false 并记录日志），
//! 这里的错误类型只覆盖配置、能力与内部传播场景。

use thiserror::Error;

/// Argus 统一错误类型
#[derive(Error, Debug)]
pub enum ArgusError {
    /// 配置错误（未知数据中心、非法参数），构造期致命
    #[error("configuration error: {0}")]
    Configuration(String),

    /// 后端不支持请求的能力
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// 发现失败（后端不可达、负载数据损坏），内部恢复为空结果
    #[error("discovery failure: {0}")]
    Discovery(String),

    /// 注册失败（后端拒绝或不可达），内部恢复为 false
    #[error("registration failure: {0}")]
    Registration(String),

    /// 序列化失败
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO 失败
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

impl ArgusError {
    /// 创建配置错误
    pub fn configuration(msg: impl Into<String>) -> Self {
        ArgusError::Configuration(msg.into())
    }

    /// 创建不支持错误
    pub fn unsupported(msg: impl Into<String>) -> Self {
        ArgusError::Unsupported(msg.into())
    }

    /// 创建发现错误
    pub fn discovery(msg: impl Into<String>) -> Self {
        ArgusError::Discovery(msg.into())
    }

    /// 创建注册错误
    pub fn registration(msg: impl Into<String>) -> Self {
        ArgusError::Registration(msg.into())
    }
}

/// crate 统一 Result 类型
pub type Result<T> = std::result::Result<T, ArgusError>;
