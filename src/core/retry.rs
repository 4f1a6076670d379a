//! 持久化重试策略：固定次数、固定间隔、每次尝试硬超时
//!
//! 只重试瞬时错误（LedgerError::is_transient）；不存在、非法状态迁移等直接返回。

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use crate::config::LedgerSection;
use crate::core::McpError;
use crate::ledger::LedgerError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 总尝试次数（至少 1）
    pub max_attempts: u32,
    /// 两次尝试之间的固定等待
    pub delay: Duration,
    /// 单次尝试超时
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1000),
            attempt_timeout: Duration::from_millis(5000),
        }
    }
}

impl From<&LedgerSection> for RetryPolicy {
    fn from(section: &LedgerSection) -> Self {
        Self {
            max_attempts: section.retry_attempts.max(1),
            delay: Duration::from_millis(section.retry_delay_ms),
            attempt_timeout: Duration::from_millis(section.attempt_timeout_ms),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            attempt_timeout,
        }
    }

    /// 执行持久化操作；operation 仅用于日志与错误信息
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, McpError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error: Option<LedgerError> = None;

        for attempt in 1..=attempts {
            match timeout(self.attempt_timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_transient() => {
                    return Err(McpError::from_ledger(operation, e));
                }
                Ok(Err(e)) => {
                    tracing::warn!(operation, attempt, error = %e, "Ledger operation failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    tracing::warn!(
                        operation,
                        attempt,
                        timeout_ms = self.attempt_timeout.as_millis() as u64,
                        "Ledger operation timed out"
                    );
                    last_error = None;
                }
            }

            if attempt < attempts {
                sleep(self.delay).await;
            }
        }

        match last_error {
            Some(source) => Err(McpError::Persistence {
                operation: operation.to_string(),
                source,
            }),
            None => Err(McpError::PersistenceTimeout {
                operation: operation.to_string(),
                attempts,
            }),
        }
    }

    /// 插入新记录：超时或瞬时失败的尝试可能已经写入，
    /// 之后的尝试遇到同 ID 的 Duplicate 视为已落库
    pub async fn run_insert<F, Fut>(&self, operation: &str, mut op: F) -> Result<(), McpError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), LedgerError>>,
    {
        let mut attempted = false;
        self.run(operation, || {
            let retried = std::mem::replace(&mut attempted, true);
            let attempt = op();
            async move {
                match attempt.await {
                    Err(LedgerError::Duplicate { kind, id }) if retried => {
                        tracing::debug!(%kind, %id, "Insert landed on an earlier attempt");
                        Ok(())
                    }
                    other => other,
                }
            }
        })
        .await
    }
}
