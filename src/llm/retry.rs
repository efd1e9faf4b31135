//! 限流退避中间件
//!
//! 包装任意异步操作：遇到限流错误时按指数退避 + 抖动休眠后重试（可参考供应商给出的 retry-after），
//! 其它错误立即上抛；重试 max_retries 次后仍限流则上抛最后一次错误（总尝试次数 = max_retries + 1）。

use std::fmt::{self, Display};
use std::future::{self, Future};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::random;

use crate::llm::{AssistantReply, CompletionRequest, LlmClient, LlmError};
use crate::session::LlmMetadata;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// 抖动比例，0.3 表示 ±30%
    pub jitter_factor: f64,
    /// 是否采用供应商给出的等待时间（取与退避时间的较大者）
    pub respect_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(60_000),
            jitter_factor: 0.3,
            respect_retry_after: true,
        }
    }
}

/// 能判断自身是否为限流的错误
pub trait RateLimitAware {
    fn is_rate_limit(&self) -> bool;

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl RateLimitAware for LlmError {
    fn is_rate_limit(&self) -> bool {
        LlmError::is_rate_limit(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        LlmError::retry_after(self)
    }
}

/// 第 attempt 次重试（从 1 开始）的等待时间：min(max, base × 2^(attempt-1))，再加 ±jitter 扰动，下限为 0
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let base_ms = config.base_backoff.as_secs_f64() * 1000.0;
    let max_ms = config.max_backoff.as_secs_f64() * 1000.0;
    let capped = (base_ms * 2f64.powi(exponent)).min(max_ms);
    let jitter = if config.jitter_factor > 0.0 {
        capped * config.jitter_factor * (random::<f64>() * 2.0 - 1.0)
    } else {
        0.0
    };
    Duration::from_millis((capped + jitter).max(0.0).round() as u64)
}

/// 退避过程中值得写入会话审计的节点
#[derive(Clone, Debug, PartialEq)]
pub enum BackoffNotice {
    /// 供应商给出了等待时间
    RetryAfter { wait: Duration },
    /// 即将第 attempt 次重试
    Retrying {
        attempt: u32,
        max_retries: u32,
        delay: Duration,
    },
    /// 重试用尽，放弃
    Exhausted { max_retries: u32 },
}

impl fmt::Display for BackoffNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffNotice::RetryAfter { wait } => write!(
                f,
                "Provider requested {}ms wait (retry-after)",
                wait.as_millis()
            ),
            BackoffNotice::Retrying {
                attempt,
                max_retries,
                delay,
            } => write!(
                f,
                "Rate limit hit. Retry {attempt}/{max_retries} after {:.1}s",
                delay.as_secs_f64()
            ),
            BackoffNotice::Exhausted { max_retries } => write!(
                f,
                "Rate limit retry exhausted after {max_retries} attempts. Giving up."
            ),
        }
    }
}

/// 执行 work，限流时退避重试
pub async fn with_backoff<T, E, F, Fut>(config: &RetryConfig, work: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RateLimitAware + Display,
{
    run_with_backoff(config, work).await.map(|(value, _)| value)
}

/// 同 with_backoff，成功时附带实际重试次数
pub async fn run_with_backoff<T, E, F, Fut>(config: &RetryConfig, work: F) -> Result<(T, u32), E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RateLimitAware + Display,
{
    run_with_backoff_notify(config, work, |_| future::ready(())).await
}

/// 同 run_with_backoff，每个退避节点先交给 notify（如写入会话日志）
pub async fn run_with_backoff_notify<T, E, F, Fut, N, NFut>(
    config: &RetryConfig,
    mut work: F,
    mut notify: N,
) -> Result<(T, u32), E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RateLimitAware + Display,
    N: FnMut(BackoffNotice) -> NFut,
    NFut: Future<Output = ()>,
{
    let mut attempt: u32 = 0;
    loop {
        match work().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(retries = attempt, "Succeeded after rate-limit retries");
                }
                return Ok((value, attempt));
            }
            Err(e) if !e.is_rate_limit() => return Err(e),
            Err(e) => {
                if attempt >= config.max_retries {
                    tracing::warn!(
                        attempts = attempt + 1,
                        error = %e,
                        "Rate limit retries exhausted"
                    );
                    notify(BackoffNotice::Exhausted {
                        max_retries: config.max_retries,
                    })
                    .await;
                    return Err(e);
                }
                attempt += 1;
                let mut delay = calculate_backoff(attempt, config);
                if config.respect_retry_after {
                    if let Some(hint) = e.retry_after() {
                        notify(BackoffNotice::RetryAfter { wait: hint }).await;
                        delay = delay.max(hint);
                    }
                }
                tracing::warn!(
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Rate limited, backing off"
                );
                notify(BackoffNotice::Retrying {
                    attempt,
                    max_retries: config.max_retries,
                    delay,
                })
                .await;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// 为任意 LlmClient 加上限流退避；重试次数写入回复元数据
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 带退避地完成一次请求，退避节点交给 notify；重试次数写入回复元数据
    pub async fn complete_with_notices<N, NFut>(
        &self,
        request: &CompletionRequest,
        notify: N,
    ) -> Result<AssistantReply, LlmError>
    where
        N: FnMut(BackoffNotice) -> NFut,
        NFut: Future<Output = ()>,
    {
        let inner = &self.inner;
        let (mut reply, retries) =
            run_with_backoff_notify(&self.config, move || inner.complete(request), notify).await?;
        if retries > 0 {
            reply
                .metadata
                .get_or_insert_with(LlmMetadata::default)
                .retries = Some(retries);
        }
        Ok(reply)
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<AssistantReply, LlmError> {
        self.complete_with_notices(request, |_| future::ready(()))
            .await
    }
}
