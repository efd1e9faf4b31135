//! LLM 客户端抽象
//!
//! 所有后端实现 LlmClient::complete：输入系统提示、对话与可用工具，返回一条 assistant 回复（文本和/或工具调用）。
//! LlmError 携带足够的信息供退避中间件判断是否为限流。

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::core::ErrorClass;
use crate::memory::{Message, ToolCallRequest};
use crate::session::LlmMetadata;

/// 供应商限流错误的类型标记
pub const RATE_LIMIT_ERROR_TYPE: &str = "rate_limit_error";

/// 一次补全请求
#[derive(Clone, Debug, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

/// 暴露给模型的工具描述
#[derive(Clone, Debug, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 模型回复
#[derive(Clone, Debug, Default)]
pub struct AssistantReply {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub raw_content: Option<Value>,
    pub metadata: Option<LlmMetadata>,
}

impl AssistantReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn tool_calls(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }

    pub fn to_message(&self) -> Message {
        Message {
            content: self.content.clone(),
            raw_content: self.raw_content.clone(),
            ..Message::assistant_tool_calls(self.tool_calls.clone())
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Rate limited by provider")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Provider error [{kind}]: {message}")]
    Provider { kind: String, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error: {0}")]
    ApiError(String),
}

impl LlmError {
    /// 429、供应商 rate_limit_error 标记、或消息中含 "rate limit"
    pub fn is_rate_limit(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::Http {
                status, message, ..
            } => *status == 429 || mentions_rate_limit(message),
            LlmError::Provider { kind, message } => {
                kind == RATE_LIMIT_ERROR_TYPE || mentions_rate_limit(message)
            }
            LlmError::Network(message) | LlmError::ApiError(message) => mentions_rate_limit(message),
        }
    }

    /// 供应商给出的等待时间：显式 retry-after 值优先，其次解析消息中的 "retry after N seconds"
    pub fn retry_after(&self) -> Option<Duration> {
        let explicit = match self {
            LlmError::RateLimited { retry_after_ms } => *retry_after_ms,
            LlmError::Http { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        };
        explicit.map(Duration::from_millis).or_else(|| {
            let message = match self {
                LlmError::Http { message, .. } | LlmError::Provider { message, .. } => message,
                LlmError::Network(message) | LlmError::ApiError(message) => message,
                LlmError::RateLimited { .. } => return None,
            };
            parse_retry_after(message)
        })
    }

    pub fn class(&self) -> ErrorClass {
        if self.is_rate_limit() {
            ErrorClass::RateLimit
        } else if matches!(self, LlmError::Network(_))
            || matches!(self, LlmError::Http { status, .. } if *status >= 500)
        {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        }
    }
}

fn mentions_rate_limit(message: &str) -> bool {
    message.to_ascii_lowercase().contains("rate limit")
}

fn retry_after_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)retry[- ]after[:\s]+(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?)?")
            .expect("retry-after pattern is valid")
    })
}

/// 解析 "retry after N seconds" / "Retry-After: N"（无单位按秒）
pub fn parse_retry_after(message: &str) -> Option<Duration> {
    let caps = retry_after_regex().captures(message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let is_ms = caps
        .get(2)
        .map(|unit| unit.as_str().to_ascii_lowercase())
        .is_some_and(|unit| unit.starts_with("ms") || unit.starts_with("milli"));
    let ms = if is_ms { value } else { value * 1000.0 };
    Some(Duration::from_millis(ms.round() as u64))
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<AssistantReply, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_detection() {
        assert!(LlmError::RateLimited { retry_after_ms: None }.is_rate_limit());
        assert!(LlmError::Http {
            status: 429,
            message: "Too Many Requests".into(),
            retry_after_ms: None
        }
        .is_rate_limit());
        assert!(LlmError::Provider {
            kind: RATE_LIMIT_ERROR_TYPE.into(),
            message: "slow down".into()
        }
        .is_rate_limit());
        assert!(LlmError::ApiError("Rate Limit exceeded for org".into()).is_rate_limit());
        assert!(!LlmError::Http {
            status: 500,
            message: "boom".into(),
            retry_after_ms: None
        }
        .is_rate_limit());
        assert!(!LlmError::ApiError("invalid request".into()).is_rate_limit());
    }

    #[test]
    fn test_retry_after_hint() {
        assert_eq!(
            LlmError::RateLimited {
                retry_after_ms: Some(1500)
            }
            .retry_after(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            LlmError::ApiError("rate limit hit, retry after 7 seconds".into()).retry_after(),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            parse_retry_after("Retry-After: 250ms"),
            Some(Duration::from_millis(250))
        );
        assert_eq!(parse_retry_after("Retry-After: 3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("no hint here"), None);
    }

    #[test]
    fn test_error_class() {
        assert_eq!(LlmError::Network("reset".into()).class(), ErrorClass::Transient);
        assert_eq!(LlmError::ApiError("bad".into()).class(), ErrorClass::Permanent);
        assert_eq!(
            LlmError::RateLimited { retry_after_ms: None }.class(),
            ErrorClass::RateLimit
        );
    }
}
