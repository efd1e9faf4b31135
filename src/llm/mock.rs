//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本依次返回预设回复；脚本用完后回显最后一条 User 消息。记录收到的每个请求，便于断言上下文内容。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{AssistantReply, CompletionRequest, LlmClient, LlmError};
use crate::memory::Role;

/// 脚本化 Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<AssistantReply, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmClient {
    pub fn new(script: Vec<Result<AssistantReply, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 追加一条预设回复
    pub fn push(&self, reply: Result<AssistantReply, LlmError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(reply);
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// 已收到的请求（按调用顺序）
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<AssistantReply, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        if let Some(reply) = scripted {
            return reply;
        }

        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or("(no input)");
        Ok(AssistantReply::text(format!("Echo from Mock: {last_user}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Message;

    #[tokio::test]
    async fn test_script_then_echo() {
        let mock = MockLlmClient::new(vec![Err(LlmError::ApiError("boom".into()))]);
        let request = CompletionRequest {
            messages: vec![Message::user("ping")],
            ..CompletionRequest::default()
        };
        assert!(mock.complete(&request).await.is_err());
        let reply = mock.complete(&request).await.unwrap();
        assert_eq!(reply.content.as_deref(), Some("Echo from Mock: ping"));
        assert_eq!(mock.call_count(), 2);
    }
}
