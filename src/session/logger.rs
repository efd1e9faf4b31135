//! 会话事件记录器
//!
//! 每个会话一个 EventLogger：为事件打时间戳，先交给 EventStore 持久化，再通过 broadcast 推送给实时订阅者。
//! 持久化失败只记录错误日志，不中断调用方（写入为尽力而为）。

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::memory::TodoItem;
use crate::session::event::{EventPayload, LlmMetadata, SessionEvent, SYSTEM_AGENT};
use crate::session::store::EventStore;

const LIVE_CHANNEL_CAPACITY: usize = 256;

/// 事件记录器；clone 后共享同一存储与订阅通道
#[derive(Clone)]
pub struct EventLogger {
    store: Arc<dyn EventStore>,
    session_id: String,
    live: broadcast::Sender<SessionEvent>,
    trace_id: Option<String>,
    parent_call_id: Option<String>,
}

impl EventLogger {
    pub fn new(store: Arc<dyn EventStore>, session_id: impl Into<String>) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            store,
            session_id: session_id.into(),
            live,
            trace_id: None,
            parent_call_id: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// 带调用链上下文的副本：之后记录的 tool_call 事件附带 traceId / parentCallId
    pub fn with_trace(&self, trace_id: impl Into<String>, parent_call_id: Option<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            parent_call_id,
            ..self.clone()
        }
    }

    /// 子会话记录器（委派的 sidechain 运行），写入 `<session>__sidechain_<call id>`，不与父会话的回放交错
    pub fn for_sidechain(&self, parent_call_id: &str) -> Self {
        let suffix: String = parent_call_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        Self {
            session_id: format!("{}__sidechain_{}", self.session_id, suffix),
            ..self.clone()
        }
    }

    /// 订阅之后产生的事件
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.live.subscribe()
    }

    pub async fn emit(&self, payload: EventPayload, metadata: Option<LlmMetadata>) {
        let event = SessionEvent::new(payload).with_metadata(metadata);
        if let Err(e) = self.store.append_event(&self.session_id, &event).await {
            tracing::error!(
                session_id = %self.session_id,
                kind = event.kind(),
                error = %e,
                "Failed to persist session event"
            );
        }
        // 没有订阅者时 send 返回 Err，忽略
        let _ = self.live.send(event);
    }

    pub async fn flush(&self) {
        if let Err(e) = self.store.flush(&self.session_id).await {
            tracing::warn!(session_id = %self.session_id, error = %e, "Failed to flush session log");
        }
    }

    pub async fn log_user_message(&self, content: impl Into<String>) {
        self.emit(
            EventPayload::User {
                content: content.into(),
            },
            None,
        )
        .await;
    }

    pub async fn log_assistant_message(
        &self,
        agent: &str,
        content: Option<String>,
        raw_content: Option<Value>,
        metadata: Option<LlmMetadata>,
    ) {
        self.emit(
            EventPayload::Assistant {
                content,
                agent: Some(agent.to_string()),
                raw_content,
            },
            metadata,
        )
        .await;
    }

    /// 内部系统消息（如限流重试提示），回放时排除
    pub async fn log_system_message(&self, content: impl Into<String>) {
        self.emit(
            EventPayload::Assistant {
                content: Some(content.into()),
                agent: Some(SYSTEM_AGENT.to_string()),
                raw_content: None,
            },
            None,
        )
        .await;
    }

    pub async fn log_tool_call(&self, agent: &str, tool: &str, id: &str, params: Value) {
        self.emit(
            EventPayload::ToolCall {
                id: id.to_string(),
                tool: tool.to_string(),
                params,
                agent: Some(agent.to_string()),
                trace_id: self.trace_id.clone(),
                parent_call_id: self.parent_call_id.clone(),
            },
            None,
        )
        .await;
    }

    pub async fn log_tool_result(&self, tool_call_id: &str, result: Value) {
        self.emit(EventPayload::tool_result(tool_call_id, result), None)
            .await;
    }

    pub async fn log_delegation(&self, parent: &str, child: &str, task: &str) {
        self.emit(
            EventPayload::Delegation {
                parent: parent.to_string(),
                child: child.to_string(),
                task: task.to_string(),
            },
            None,
        )
        .await;
    }

    pub async fn log_delegation_complete(&self, parent: &str, child: &str, result: &str) {
        self.emit(
            EventPayload::DelegationComplete {
                parent: parent.to_string(),
                child: child.to_string(),
                result: result.to_string(),
            },
            None,
        )
        .await;
    }

    pub async fn log_agent_start(&self, agent: &str, depth: usize, task: Option<&str>) {
        self.emit(
            EventPayload::AgentStart {
                agent: agent.to_string(),
                depth,
                task: task.map(str::to_string),
            },
            None,
        )
        .await;
    }

    pub async fn log_agent_complete(&self, agent: &str, duration_ms: u64) {
        self.emit(
            EventPayload::AgentComplete {
                agent: agent.to_string(),
                duration_ms,
            },
            None,
        )
        .await;
    }

    pub async fn log_agent_error(&self, agent: &str, message: &str) {
        self.emit(
            EventPayload::AgentError {
                agent: agent.to_string(),
                message: message.to_string(),
            },
            None,
        )
        .await;
    }

    pub async fn log_todo_update(&self, todos: Vec<TodoItem>) {
        self.emit(EventPayload::TodoUpdate { todos }, None).await;
    }

    pub async fn log_session_recovery(&self, message_count: usize, todo_count: Option<usize>) {
        self.emit(
            EventPayload::SessionRecovery {
                session_id: self.session_id.clone(),
                message_count,
                todo_count,
            },
            None,
        )
        .await;
    }

    pub async fn log_safety_limit(&self, reason: &str, agent: &str, details: Option<String>) {
        self.emit(
            EventPayload::SafetyLimit {
                reason: reason.to_string(),
                agent: agent.to_string(),
                details,
            },
            None,
        )
        .await;
    }
}
