//! Agent 错误类型与错误分类
//!
//! 四类错误各有归宿：结构性错误由 Sanitizer 修复、只记录不上抛；瞬时工具错误按调用重试后转为工具结果；
//! 永久工具错误直接转为工具结果；限流错误由退避中间件重试，耗尽后作为本轮失败上抛。

use thiserror::Error;

use crate::llm::LlmError;
use crate::session::StoreError;

/// Agent 一轮运行中会上抛给调用方的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StoreError),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Delegation depth {depth} exceeds limit {max_depth}")]
    DepthExceeded { depth: usize, max_depth: usize },

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    ConfigError(String),
}

/// 错误分类，决定处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 日志结构损坏：由 Sanitizer 修复
    Structural,
    /// 连接重置、超时、5xx：按调用有限次重试
    Transient,
    /// 其余工具错误：立即作为错误结果返回
    Permanent,
    /// 上游限流：指数退避重试
    RateLimit,
}

impl AgentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AgentError::LlmError(e) => e.class(),
            AgentError::StorageError(_) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_rate_limit_class_propagates() {
        let err = AgentError::from(LlmError::RateLimited {
            retry_after_ms: Some(1000),
        });
        assert_eq!(err.class(), ErrorClass::RateLimit);
        assert_eq!(AgentError::Cancelled.class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_depth_error_message() {
        let err = AgentError::DepthExceeded {
            depth: 11,
            max_depth: 10,
        };
        assert_eq!(err.to_string(), "Delegation depth 11 exceeds limit 10");
    }
}
