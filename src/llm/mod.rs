//! LLM 层：客户端抽象、限流退避中间件、Mock 实现

pub mod mock;
pub mod retry;
pub mod traits;

pub use mock::MockLlmClient;
pub use retry::{
    calculate_backoff, run_with_backoff, run_with_backoff_notify, with_backoff, BackoffNotice,
    RateLimitAware, RetryConfig, RetryingLlmClient,
};
pub use traits::{
    parse_retry_after, AssistantReply, CompletionRequest, LlmClient, LlmError, ToolSpec,
    RATE_LIMIT_ERROR_TYPE,
};
