//! 统一的重试与退避
//!
//! 所有外部调用都经过 [`RetryExecutor`]。是否重试由纯函数 [`decide`] 决定，
//! 等待通过 [`Sleeper`] 完成，执行器本身不保存跨调用的状态。

use super::clock::Sleeper;
use crate::auth::CredentialProvider;
use crate::config::TransferConfig;
use crate::error::{ApiError, Classification, CredentialError, ErrorKind};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 总尝试次数（含第一次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// 单次等待上限
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// 第 attempt 次失败后的等待时间：min(base × 2^(attempt-1), max_delay)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RetryAfter(Duration),
    GiveUp,
}

/// 第 attempt 次尝试失败后是否继续
pub fn decide(attempt: u32, classification: Classification, policy: &RetryPolicy) -> Decision {
    match classification {
        Classification::Fatal => Decision::GiveUp,
        Classification::Retryable | Classification::Unknown if attempt < policy.max_attempts => {
            Decision::RetryAfter(policy.delay_after(attempt))
        }
        _ => Decision::GiveUp,
    }
}

/// 经过重试层后的调用失败
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("{operation} 失败（第 {attempts} 次尝试, {kind}）: {source}")]
    Failed {
        operation: String,
        attempts: u32,
        kind: ErrorKind,
        #[source]
        source: ApiError,
    },

    /// 凭据刷新失败或租户已停用
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::Failed { kind, .. } => *kind,
            CallError::Credential(_) => ErrorKind::Credential,
        }
    }
}

/// 重试执行器
pub struct RetryExecutor {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    credentials: Arc<dyn CredentialProvider>,
}

impl RetryExecutor {
    pub fn new(
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            policy,
            sleeper,
            credentials,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 使用默认分类器执行
    pub async fn execute<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.execute_with(operation, op, ApiError::kind).await
    }

    /// 使用指定分类器执行
    pub async fn execute_with<T, F, Fut, C>(
        &self,
        operation: &str,
        mut op: F,
        classify: C,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
        C: Fn(&ApiError) -> ErrorKind,
    {
        let mut attempt = 0u32;
        let mut refreshed = false;
        let mut unknown_retried = false;

        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => {
                    debug!(operation, attempt, "调用成功");
                    return Ok(value);
                }
                Err(err) => err,
            };

            if let ApiError::Credential(e) = &err {
                warn!(operation, attempt, tenant = %e.tenant, "凭据不可用: {}", e.message);
                return Err(CallError::Credential(e.clone()));
            }

            let kind = classify(&err);
            let mut classification = kind.classification();

            match kind {
                // 同一次调用只刷新一次凭据
                ErrorKind::ExpiredCredential if refreshed => {
                    classification = Classification::Fatal;
                }
                ErrorKind::ExpiredCredential => {
                    if let Some(tenant) = err.tenant() {
                        info!(operation, attempt, %tenant, "凭据过期，刷新后重试");
                        self.credentials.refresh(tenant).await?;
                    }
                    refreshed = true;
                }
                // Unknown 只重试一次
                ErrorKind::Unknown if unknown_retried => {
                    classification = Classification::Fatal;
                }
                ErrorKind::Unknown => unknown_retried = true,
                _ => {}
            }

            match decide(attempt, classification, &self.policy) {
                Decision::RetryAfter(delay) => {
                    warn!(
                        operation,
                        attempt,
                        kind = %kind,
                        "调用失败，{}ms 后重试: {}",
                        delay.as_millis(),
                        err
                    );
                    self.sleeper.sleep(delay).await;
                }
                Decision::GiveUp => {
                    warn!(operation, attempt, kind = %kind, "调用最终失败: {}", err);
                    return Err(CallError::Failed {
                        operation: operation.to_string(),
                        attempts: attempt,
                        kind,
                        source: err,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticCredentials, Tenant};
    use crate::core::clock::RecordingSleeper;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(sleeper: Arc<RecordingSleeper>) -> RetryExecutor {
        RetryExecutor::new(
            RetryPolicy::default(),
            sleeper,
            Arc::new(StaticCredentials::new("tok")),
        )
    }

    /// 统计刷新次数，可设置刷新失败
    #[derive(Default)]
    struct CountingCredentials {
        refreshes: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl CredentialProvider for CountingCredentials {
        async fn get_token(&self, _tenant: Tenant) -> Result<String, CredentialError> {
            Ok("tok".to_string())
        }

        async fn refresh(&self, tenant: Tenant) -> Result<String, CredentialError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CredentialError {
                    tenant,
                    message: "revoked".to_string(),
                });
            }
            Ok("tok-2".to_string())
        }
    }

    #[test]
    fn test_decide() {
        let policy = RetryPolicy::default();
        assert_eq!(
            decide(1, Classification::Retryable, &policy),
            Decision::RetryAfter(Duration::from_millis(1000))
        );
        assert_eq!(
            decide(2, Classification::Retryable, &policy),
            Decision::RetryAfter(Duration::from_millis(2000))
        );
        assert_eq!(decide(3, Classification::Retryable, &policy), Decision::GiveUp);
        assert_eq!(decide(1, Classification::Fatal, &policy), Decision::GiveUp);
        assert_eq!(
            decide(1, Classification::Unknown, &policy),
            Decision::RetryAfter(Duration::from_millis(1000))
        );
    }

    #[test]
    fn test_delay_is_capped_for_long_retry_chains() {
        let policy = RetryPolicy::from_config(&TransferConfig {
            max_attempts: 30,
            ..Default::default()
        });
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.delay_after(6), Duration::from_secs(32));
        assert_eq!(policy.delay_after(7), Duration::from_secs(60));
        assert_eq!(policy.delay_after(29), Duration::from_secs(60));
        assert_eq!(
            decide(20, Classification::Retryable, &policy),
            Decision::RetryAfter(Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn test_rate_limited_gets_three_attempts_with_increasing_delay() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = executor(sleeper.clone())
            .execute("list", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::status(Tenant::Source, 429, "slow down"))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert!(matches!(err, CallError::Failed { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // 只在两次尝试之间等待，且严格递增
        let delays = sleeper.delays();
        assert_eq!(delays.len(), 2);
        assert!(delays[0] < delays[1]);
    }

    #[tokio::test]
    async fn test_success_after_transient_failure() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let calls = &AtomicU32::new(0);

        let value = executor(sleeper.clone())
            .execute("upload", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ApiError::status(Tenant::Destination, 503, "busy"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(sleeper.delays().len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let calls = &AtomicU32::new(0);

        let err = executor(sleeper.clone())
            .execute("search", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ApiError::status(Tenant::Source, 403, "no"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_is_retried_once() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let calls = &AtomicU32::new(0);

        let err = executor(sleeper)
            .execute("download", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ApiError::Decode("garbled".to_string()))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_credential_refreshes_once() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let credentials = Arc::new(CountingCredentials::default());
        let executor = RetryExecutor::new(RetryPolicy::default(), sleeper, credentials.clone());
        let calls = &AtomicU32::new(0);

        let value = executor
            .execute("list", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ApiError::status(Tenant::Source, 401, "expired"))
                } else {
                    Ok("ok")
                }
            })
            .await
            .unwrap();
        assert_eq!(value, "ok");
        assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);

        // 刷新后仍然过期：不再刷新，直接失败
        let calls = &AtomicU32::new(0);
        let err = executor
            .execute("list", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ApiError::status(Tenant::Source, 401, "expired"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExpiredCredential);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_is_fatal() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let credentials = Arc::new(CountingCredentials {
            fail: true,
            ..Default::default()
        });
        let executor = RetryExecutor::new(RetryPolicy::default(), sleeper.clone(), credentials);
        let calls = &AtomicU32::new(0);

        let err = executor
            .execute("upload", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ApiError::status(Tenant::Destination, 401, "expired"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Credential(ref e) if e.tenant == Tenant::Destination));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays().is_empty());
    }
}
