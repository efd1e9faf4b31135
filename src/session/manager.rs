//! 会话管理器
//!
//! 将事件日志回放为有序的对话消息，并交给 Sanitizer 保证可直接续跑；另提供派生查询与任务清单恢复。

use std::sync::Arc;

use serde_json::Value;

use crate::memory::{Message, Role, TodoItem, ToolCallRequest};
use crate::session::event::{EventPayload, SessionEvent, SYSTEM_AGENT};
use crate::session::sanitizer::{format_issues, MessageSanitizer, SanitizationResult};
use crate::session::store::{EventStore, StoreError};

/// 任务清单工具名；恢复时查找其最近一次调用
pub const TODO_WRITE_TOOL: &str = "TodoWrite";

pub struct SessionManager {
    store: Arc<dyn EventStore>,
    sanitizer: MessageSanitizer,
}

impl SessionManager {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            sanitizer: MessageSanitizer::default(),
        }
    }

    pub fn with_sanitizer(mut self, sanitizer: MessageSanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub async fn session_exists(&self, session_id: &str) -> Result<bool, StoreError> {
        self.store.session_exists(session_id).await
    }

    /// 回放并清洗，返回可直接交给模型的消息序列
    pub async fn recover_session(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self.recover_session_detailed(session_id).await?.messages)
    }

    /// 同 recover_session，附带清洗问题列表
    pub async fn recover_session_detailed(
        &self,
        session_id: &str,
    ) -> Result<SanitizationResult, StoreError> {
        let events = self.store.read_events(session_id).await?;
        let projected = project_events(&events);
        let result = self.sanitizer.sanitize_messages(projected);
        if !result.issues.is_empty() {
            tracing::warn!(
                session_id,
                issues = result.issues.len(),
                "{}",
                format_issues(&result.issues)
            );
        }
        tracing::info!(
            session_id,
            events = events.len(),
            messages = result.messages.len(),
            "Session recovered"
        );
        Ok(result)
    }

    /// 原始投影（未清洗），供检查工具使用
    pub async fn project_session(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(project_events(&self.store.read_events(session_id).await?))
    }

    /// 最近一次 TodoWrite 调用的 todos；缺失、损坏或读取失败时为空
    pub async fn recover_todos(&self, session_id: &str) -> Vec<TodoItem> {
        let events = match self.store.read_events(session_id).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Failed to read events for todo recovery");
                return Vec::new();
            }
        };
        let last_params = events.iter().rev().find_map(|e| match &e.payload {
            EventPayload::ToolCall { tool, params, .. } if tool == TODO_WRITE_TOOL => Some(params),
            _ => None,
        });
        last_params
            .and_then(|params| params.get("todos"))
            .and_then(|todos| serde_json::from_value(todos.clone()).ok())
            .unwrap_or_default()
    }
}

/// 最后一条消息是否为带 tool_calls 的 assistant 消息
pub fn has_incomplete_tool_call(messages: &[Message]) -> bool {
    messages
        .last()
        .is_some_and(|m| m.role == Role::Assistant && m.has_tool_calls())
}

/// 最后一条 assistant 消息的第一个工具调用（仅当其为末条消息）
pub fn get_last_tool_call(messages: &[Message]) -> Option<&ToolCallRequest> {
    messages
        .last()
        .filter(|m| m.role == Role::Assistant)
        .and_then(|m| m.tool_calls.first())
}

/// 将事件按顺序投影为消息；非核心事件与系统 assistant 事件被跳过，
/// 相邻的纯工具调用 assistant 消息合并（同一并发组的调用回放为并行调用）
pub fn project_events(events: &[SessionEvent]) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::with_capacity(events.len());

    for event in events {
        match &event.payload {
            EventPayload::User { content } => messages.push(Message::user(content.clone())),
            EventPayload::Assistant {
                content,
                agent,
                raw_content,
            } => {
                if agent.as_deref() == Some(SYSTEM_AGENT) {
                    continue;
                }
                messages.push(Message {
                    content: content.clone(),
                    raw_content: raw_content.clone(),
                    ..Message::assistant_tool_calls(Vec::new())
                });
            }
            EventPayload::ToolCall {
                id, tool, params, ..
            } => {
                let call = ToolCallRequest::new(id.clone(), tool.clone(), params.to_string());
                match messages.last_mut() {
                    Some(last) if is_tool_call_only(last) => last.tool_calls.push(call),
                    _ => messages.push(Message::assistant_tool_calls(vec![call])),
                }
            }
            EventPayload::ToolResult {
                tool_call_id,
                result,
                ..
            } => messages.push(Message::tool(tool_call_id.clone(), result_text(result))),
            other => {
                tracing::trace!(kind = other.kind(), "Skipping non-replayable event");
            }
        }
    }

    messages
}

fn is_tool_call_only(msg: &Message) -> bool {
    msg.role == Role::Assistant && msg.has_tool_calls() && !msg.has_text() && !msg.has_raw_content()
}

/// 工具结果转为回放文本：执行器写入的 `{content, error?}` 信封取其正文，其它形状原样序列化
fn result_text(result: &Value) -> String {
    let text = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match result {
        Value::Object(map) => match (map.get("error"), map.get("content"), map.get("message")) {
            (Some(Value::String(error)), _, _) => error.clone(),
            (Some(Value::Bool(true)), _, Some(message)) => text(message),
            (None, Some(content), _) if !content.is_null() => text(content),
            _ => result.to_string(),
        },
        other => text(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::logger::EventLogger;
    use crate::session::store::InMemoryEventStore;
    use serde_json::json;

    async fn setup() -> (Arc<InMemoryEventStore>, EventLogger, SessionManager) {
        let store = Arc::new(InMemoryEventStore::new());
        let logger = EventLogger::new(store.clone(), "s");
        let manager = SessionManager::new(store.clone());
        (store, logger, manager)
    }

    #[tokio::test]
    async fn test_recover_full_turn() {
        let (_, logger, manager) = setup().await;
        logger.log_user_message("list files").await;
        logger
            .log_assistant_message("main", Some("Looking".into()), None, None)
            .await;
        logger.log_tool_call("main", "ls", "c1", json!({"path": "."})).await;
        logger.log_tool_result("c1", json!("a.txt")).await;
        logger.log_agent_complete("main", 10).await;
        logger.log_system_message("rate limited, retrying").await;

        let messages = manager.recover_session("s").await.unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], Message::user("list files"));
        assert_eq!(messages[1], Message::assistant("Looking"));
        assert_eq!(messages[2].tool_calls[0].name, "ls");
        assert_eq!(messages[2].tool_calls[0].arguments, r#"{"path":"."}"#);
        assert_eq!(messages[3], Message::tool("c1", "a.txt"));
    }

    #[tokio::test]
    async fn test_parallel_group_crash_keeps_completed_call() {
        let (_, logger, manager) = setup().await;
        logger.log_user_message("hi").await;
        logger.log_tool_call("main", "echo", "A", json!({})).await;
        logger.log_tool_call("main", "echo", "B", json!({})).await;
        logger.log_tool_result("A", json!({"content": "ok"})).await;

        let result = manager.recover_session_detailed("s").await.unwrap();
        assert_eq!(result.messages.len(), 3);
        let ids: Vec<&str> = result.messages[1].tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["A"]);
        assert_eq!(result.messages[2].content.as_deref(), Some("ok"));
        assert_eq!(result.issues.len(), 1);
    }

    #[tokio::test]
    async fn test_recover_missing_session_is_empty() {
        let (_, _, manager) = setup().await;
        assert!(manager.recover_session("nobody").await.unwrap().is_empty());
        assert!(manager.recover_todos("nobody").await.is_empty());
    }

    #[tokio::test]
    async fn test_recover_todos_uses_latest_call() {
        let (_, logger, manager) = setup().await;
        let todos = |content: &str| {
            json!({"todos": [{"id": "1", "content": content, "status": "pending", "activeForm": "Doing"}]})
        };
        logger.log_tool_call("main", TODO_WRITE_TOOL, "t1", todos("first")).await;
        logger.log_tool_call("main", "echo", "e1", json!({"todos": []})).await;
        logger.log_tool_call("main", TODO_WRITE_TOOL, "t2", todos("second")).await;

        let recovered = manager.recover_todos("s").await;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].content, "second");

        logger
            .log_tool_call("main", TODO_WRITE_TOOL, "t3", json!({"todos": "broken"}))
            .await;
        assert!(manager.recover_todos("s").await.is_empty());
    }

    #[test]
    fn test_derived_queries() {
        let call = ToolCallRequest::new("c9", "echo", "{}");
        let pending = vec![
            Message::user("x"),
            Message::assistant_tool_calls(vec![call.clone(), ToolCallRequest::new("c10", "echo", "{}")]),
        ];
        assert!(has_incomplete_tool_call(&pending));
        assert_eq!(get_last_tool_call(&pending), Some(&call));

        let done = vec![Message::user("x"), Message::assistant("done")];
        assert!(!has_incomplete_tool_call(&done));
        assert_eq!(get_last_tool_call(&done), None);
        assert!(!has_incomplete_tool_call(&[]));
    }

    #[test]
    fn test_projection_skips_unrecognized() {
        let events = vec![
            SessionEvent::new(EventPayload::Unrecognized {
                kind: "model_selection".into(),
                data: json!({}),
            }),
            SessionEvent::new(EventPayload::User {
                content: "hi".into(),
            }),
        ];
        assert_eq!(project_events(&events), vec![Message::user("hi")]);
    }

    #[test]
    fn test_result_text_unwraps_envelopes() {
        assert_eq!(result_text(&json!("plain")), "plain");
        assert_eq!(result_text(&json!({"content": "ok"})), "ok");
        assert_eq!(result_text(&json!({"content": null, "error": "boom"})), "boom");
        assert_eq!(
            result_text(&json!({"error": true, "message": "Tool x not found"})),
            "Tool x not found"
        );
        assert_eq!(result_text(&json!({"rows": 2})), r#"{"rows":2}"#);
    }
}
