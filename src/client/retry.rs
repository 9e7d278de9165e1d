//! 重试策略与调用结果分类
//!
//! 每次网络尝试的结果被归类为三种宿主状态之一：
//! NORMAL（应用层 / 瞬时失败，消耗重试预算）、
//! DOWN（连接级失败）、OVERLOADED（背压拒绝）。
//! 后两种会把地址标记下线并计入该地址的连接失败次数，但不消耗预算。

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// 单次网络尝试的失败结果，由网络调用方产出、由分类器解读
#[derive(Debug, Error)]
pub enum InvokeError {
    /// 连接级失败（拨号失败、连接被重置）
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// 对端过载或背压拒绝
    #[error("server overloaded: {0}")]
    Overloaded(String),

    /// 应用层失败，是否可重试由产出方标记
    #[error("application error: {message}")]
    Application { message: String, retryable: bool },

    /// RPC 状态码，按 tonic 状态分类
    #[error("rpc status: {0}")]
    Status(#[from] tonic::Status),
}

impl InvokeError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        InvokeError::ConnectionFailed(msg.into())
    }

    pub fn overloaded(msg: impl Into<String>) -> Self {
        InvokeError::Overloaded(msg.into())
    }

    pub fn application(msg: impl Into<String>, retryable: bool) -> Self {
        InvokeError::Application {
            message: msg.into(),
            retryable,
        }
    }
}

/// 失败发生时目标宿主的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    /// 宿主正常，失败来自应用层或瞬时传输问题
    Normal,
    /// 宿主连接级不可用
    Down,
    /// 宿主过载
    Overloaded,
}

/// 一次失败的分类结果
#[derive(Debug, Clone, Copy)]
pub struct OutcomeClassification {
    /// 是否可重试；`None` 表示无法判断，按不可重试处理
    pub retryable: Option<bool>,
    pub host_status: HostStatus,
}

impl OutcomeClassification {
    pub fn new(retryable: Option<bool>, host_status: HostStatus) -> Self {
        Self {
            retryable,
            host_status,
        }
    }
}

/// 失败分类器
pub trait OutcomeClassifier: Send + Sync {
    fn classify(&self, error: &InvokeError, idempotent: bool) -> OutcomeClassification;
}

/// 默认分类器
///
/// tonic 状态码映射：`Unavailable` 视为宿主下线，
/// `ResourceExhausted` 视为过载，`DeadlineExceeded` 只对幂等方法重试，
/// 其余状态一律不重试。
#[derive(Default)]
pub struct DefaultOutcomeClassifier;

impl OutcomeClassifier for DefaultOutcomeClassifier {
    fn classify(&self, error: &InvokeError, idempotent: bool) -> OutcomeClassification {
        match error {
            InvokeError::ConnectionFailed(_) => {
                OutcomeClassification::new(Some(true), HostStatus::Down)
            }
            InvokeError::Overloaded(_) => {
                OutcomeClassification::new(Some(true), HostStatus::Overloaded)
            }
            InvokeError::Application { retryable, .. } => {
                OutcomeClassification::new(Some(*retryable), HostStatus::Normal)
            }
            InvokeError::Status(status) => match status.code() {
                tonic::Code::Unavailable => {
                    OutcomeClassification::new(Some(true), HostStatus::Down)
                }
                tonic::Code::ResourceExhausted => {
                    OutcomeClassification::new(Some(true), HostStatus::Overloaded)
                }
                tonic::Code::DeadlineExceeded => {
                    OutcomeClassification::new(Some(idempotent), HostStatus::Normal)
                }
                _ => OutcomeClassification::new(Some(false), HostStatus::Normal),
            },
        }
    }
}

/// 重试策略
///
/// 退避延迟按失败次数指数增长：NORMAL 路径以累计调用次数为键，
/// DOWN / OVERLOADED 路径以单个地址的连接失败次数为键。
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    max_retry_time: Duration,
    min_backoff_delay: Duration,
    max_backoff_delay: Duration,
    classifier: Arc<dyn OutcomeClassifier>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_retry_time: Duration::from_secs(60),
            min_backoff_delay: Duration::from_millis(10),
            max_backoff_delay: Duration::from_millis(100),
            classifier: Arc::new(DefaultOutcomeClassifier),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_retry_time(mut self, max_retry_time: Duration) -> Self {
        self.max_retry_time = max_retry_time;
        self
    }

    pub fn with_backoff_delay(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff_delay = min;
        self.max_backoff_delay = max;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn OutcomeClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_retry_time(&self) -> Duration {
        self.max_retry_time
    }

    /// 第 `failure_count` 次失败后的退避延迟
    pub fn backoff_delay(&self, failure_count: u32) -> Duration {
        let shift = failure_count.saturating_sub(1).min(10);
        let delay_ms = self.min_backoff_delay.as_millis() as u64 * (1u64 << shift);
        Duration::from_millis(delay_ms).min(self.max_backoff_delay)
    }

    pub fn classify(&self, error: &InvokeError, idempotent: bool) -> OutcomeClassification {
        self.classifier.classify(error, idempotent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_grows_exponentially() {
        let policy = RetryPolicy::new()
            .with_backoff_delay(Duration::from_millis(10), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(40));
        // 封顶在最大延迟
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_default_classifier_maps_transport_failures() {
        let classifier = DefaultOutcomeClassifier;

        let down = classifier.classify(&InvokeError::connection_failed("refused"), false);
        assert_eq!(down.host_status, HostStatus::Down);
        assert_eq!(down.retryable, Some(true));

        let overloaded = classifier.classify(&InvokeError::overloaded("queue full"), false);
        assert_eq!(overloaded.host_status, HostStatus::Overloaded);
        assert_eq!(overloaded.retryable, Some(true));
    }

    #[test]
    fn test_default_classifier_maps_status_codes() {
        let classifier = DefaultOutcomeClassifier;

        let unavailable = classifier.classify(
            &InvokeError::Status(tonic::Status::unavailable("down")),
            false,
        );
        assert_eq!(unavailable.host_status, HostStatus::Down);

        let exhausted = classifier.classify(
            &InvokeError::Status(tonic::Status::resource_exhausted("busy")),
            false,
        );
        assert_eq!(exhausted.host_status, HostStatus::Overloaded);

        // 超时只对幂等方法重试
        let timeout_idempotent = classifier.classify(
            &InvokeError::Status(tonic::Status::deadline_exceeded("slow")),
            true,
        );
        assert_eq!(timeout_idempotent.retryable, Some(true));
        let timeout_non_idempotent = classifier.classify(
            &InvokeError::Status(tonic::Status::deadline_exceeded("slow")),
            false,
        );
        assert_eq!(timeout_non_idempotent.retryable, Some(false));

        let invalid = classifier.classify(
            &InvokeError::Status(tonic::Status::invalid_argument("bad request")),
            true,
        );
        assert_eq!(invalid.retryable, Some(false));
        assert_eq!(invalid.host_status, HostStatus::Normal);
    }

    #[test]
    fn test_application_error_keeps_its_retryable_flag() {
        let classifier = DefaultOutcomeClassifier;
        let retryable = classifier.classify(&InvokeError::application("busy", true), false);
        assert_eq!(retryable.retryable, Some(true));
        assert_eq!(retryable.host_status, HostStatus::Normal);

        let terminal = classifier.classify(&InvokeError::application("bad", false), true);
        assert_eq!(terminal.retryable, Some(false));
    }
}
