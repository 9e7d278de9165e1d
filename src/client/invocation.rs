//! 单次调用的重试状态机
//!
//! 每个逻辑调用驱动一个独立的 `MethodInvocation` 实例：
//! 选地址（排除本次已尝试过的）→ 发起网络尝试 → 按结果分类。
//! NORMAL 失败消耗调用次数预算并按累计次数退避；
//! DOWN / OVERLOADED 失败把地址标记下线、累计该地址的连接失败数，
//! 重选后若新地址有历史连接失败则按该计数做连接退避。
//! 预算（最大重试次数 / 最长耗时）耗尽或遇到不可重试失败时，
//! 以一个携带原因与统计的终止错误收束整个调用。
//!
//! 取消语义：engine 返回的 future 被丢弃时，挂起的网络调用或
//! 退避定时器随之一起取消，已经产生的副作用不回滚。

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use super::address::{AddressSelector, HostAddress};
use super::retry::{HostStatus, InvokeError, RetryPolicy};
use super::{InvokeRequest, InvokeResponse, MethodInvoker};

/// 终止失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// 没有可用地址（从未有候选，或候选全部试过）
    NoHostsAvailable,
    /// 结果被分类为不可重试
    NonRetryable,
    /// 超过最大重试次数
    MaxRetriesExceeded,
    /// 超过最长重试耗时
    MaxRetryTimeExceeded,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let literal = match self {
            FailureReason::NoHostsAvailable => "no hosts available",
            FailureReason::NonRetryable => "non-retryable failure",
            FailureReason::MaxRetriesExceeded => "max retry attempts exceeded",
            FailureReason::MaxRetryTimeExceeded => "max retry time exceeded",
        };
        f.write_str(literal)
    }
}

/// 调用的终止错误，携带最后一次失败原因与完整的重试统计
#[derive(Debug, Error)]
#[error(
    "{reason}, rpc method: {method} (invocation attempts: {invocation_attempts}, \
     elapsed: {elapsed:?}, failed connections: {failed_connections}, \
     overloaded rejects: {overloaded_rejects})"
)]
pub struct RetriesFailed {
    pub method: String,
    pub reason: FailureReason,
    pub invocation_attempts: u32,
    pub elapsed: Duration,
    pub failed_connections: u32,
    pub overloaded_rejects: u32,
    #[source]
    pub cause: Option<InvokeError>,
}

/// 单次调用的状态机
pub struct MethodInvocation<'a> {
    invoker: &'a dyn MethodInvoker,
    selector: &'a AddressSelector,
    policy: &'a RetryPolicy,
    context: Option<String>,

    attempted: HashSet<HostAddress>,
    failed_connection_attempts: HashMap<HostAddress, u32>,
    invocation_attempts: u32,
    failed_connections: u32,
    overloaded_rejects: u32,
    last_error: Option<InvokeError>,
    started: Instant,
}

impl<'a> MethodInvocation<'a> {
    pub fn new(
        invoker: &'a dyn MethodInvoker,
        selector: &'a AddressSelector,
        policy: &'a RetryPolicy,
    ) -> Self {
        Self {
            invoker,
            selector,
            policy,
            context: None,
            attempted: HashSet::new(),
            failed_connection_attempts: HashMap::new(),
            invocation_attempts: 0,
            failed_connections: 0,
            overloaded_rejects: 0,
            last_error: None,
            started: Instant::now(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// 驱动状态机直到成功或终止失败
    pub async fn invoke(
        mut self,
        request: &InvokeRequest,
    ) -> std::result::Result<InvokeResponse, RetriesFailed> {
        // 初次尝试不做连接退避
        let mut no_connect_delay = true;
        loop {
            let Some(address) = self
                .selector
                .select_address(self.context.as_deref(), &self.attempted)
                .await
            else {
                return Err(self.fail(request, FailureReason::NoHostsAvailable));
            };

            if !no_connect_delay {
                let connection_failures = self
                    .failed_connection_attempts
                    .get(&address)
                    .copied()
                    .unwrap_or(0);
                if connection_failures > 0 {
                    let connect_delay = self.policy.backoff_delay(connection_failures);
                    debug!(
                        address = %address,
                        attempt = connection_failures,
                        delay = ?connect_delay,
                        "delaying connection to a previously failed address"
                    );
                    tokio::time::sleep(connect_delay).await;
                }
            }

            match self.invoker.invoke(&address, request).await {
                Ok(response) => {
                    // 成功清空该地址的连接失败计数
                    self.failed_connection_attempts.remove(&address);
                    return Ok(response);
                }
                Err(error) => match self.handle_failure(request, address, error) {
                    Ok(HostStatus::Normal) => {
                        let backoff = self.policy.backoff_delay(self.invocation_attempts);
                        debug!(
                            method = %request.method,
                            attempt = self.invocation_attempts,
                            delay = ?backoff,
                            overloaded_rejects = self.overloaded_rejects,
                            "failed invocation, will retry after backoff"
                        );
                        tokio::time::sleep(backoff).await;
                        no_connect_delay = true;
                    }
                    // 对下线 / 过载宿主的尝试不计入预算，立刻换地址，
                    // 退避交给下一轮的连接延迟
                    Ok(HostStatus::Down) | Ok(HostStatus::Overloaded) => {
                        no_connect_delay = false;
                    }
                    Err(failed) => return Err(failed),
                },
            }
        }
    }

    /// 按分类更新统计，决定继续重试（返回宿主状态）还是终止（返回错误)
    fn handle_failure(
        &mut self,
        request: &InvokeRequest,
        address: HostAddress,
        error: InvokeError,
    ) -> std::result::Result<HostStatus, RetriesFailed> {
        if matches!(error, InvokeError::ConnectionFailed(_)) {
            self.failed_connections += 1;
        }

        let classification = self.policy.classify(&error, request.idempotent);
        self.attempted.insert(address.clone());
        match classification.host_status {
            HostStatus::Normal => {
                // 只有宿主正常时的失败才保留为最终原因并消耗预算
                self.invocation_attempts += 1;
                self.last_error = Some(error);
            }
            HostStatus::Down | HostStatus::Overloaded => {
                self.selector.markdown(&address);
                *self
                    .failed_connection_attempts
                    .entry(address)
                    .or_insert(0) += 1;
                if classification.host_status == HostStatus::Overloaded {
                    self.overloaded_rejects += 1;
                }
                self.last_error = Some(error);
            }
        }

        if !classification.retryable.unwrap_or(false) {
            return Err(self.fail(request, FailureReason::NonRetryable));
        }
        if self.invocation_attempts > self.policy.max_retries() {
            return Err(self.fail(request, FailureReason::MaxRetriesExceeded));
        }
        if self.started.elapsed() >= self.policy.max_retry_time() {
            return Err(self.fail(request, FailureReason::MaxRetryTimeExceeded));
        }
        Ok(classification.host_status)
    }

    fn fail(&mut self, request: &InvokeRequest, reason: FailureReason) -> RetriesFailed {
        RetriesFailed {
            method: request.method.clone(),
            reason,
            invocation_attempts: self.invocation_attempts,
            elapsed: self.started.elapsed(),
            failed_connections: self.failed_connections,
            overloaded_rejects: self.overloaded_rejects,
            cause: self.last_error.take(),
        }
    }
}
