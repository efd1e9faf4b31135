//! 会话事件
//!
//! 事件日志中的每一行都是一个 EventRecord：`{type, timestamp, data, metadata?}`。
//! 读取时转换为 SessionEvent（带类型的 payload），未知 type 保留为 Unrecognized，回放时跳过。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::TodoItem;

/// 由内部系统（而非模型）产生的 assistant 事件的 agent 名，回放时排除
pub const SYSTEM_AGENT: &str = "system";

/// 持久化格式（JSONL 每行一个）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// 模型调用元数据（对恢复逻辑不透明）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// 事件 payload：核心四类参与回放，其余仅持久化
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    User {
        content: String,
    },
    Assistant {
        #[serde(default)]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_content: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        id: String,
        tool: String,
        #[serde(default)]
        params: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_call_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        result_size_bytes: usize,
        #[serde(default)]
        estimated_tokens: usize,
    },
    Delegation {
        parent: String,
        child: String,
        task: String,
    },
    DelegationComplete {
        parent: String,
        child: String,
        result: String,
    },
    AgentStart {
        agent: String,
        depth: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    AgentComplete {
        agent: String,
        duration_ms: u64,
    },
    AgentError {
        agent: String,
        message: String,
    },
    TodoUpdate {
        todos: Vec<TodoItem>,
    },
    #[serde(rename_all = "camelCase")]
    SessionRecovery {
        session_id: String,
        message_count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        todo_count: Option<usize>,
    },
    SafetyLimit {
        reason: String,
        agent: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    /// 无法识别的 type（或已知 type 但 data 形状不符），原样保留
    #[serde(skip)]
    Unrecognized { kind: String, data: Value },
}

impl EventPayload {
    pub fn kind(&self) -> &str {
        match self {
            EventPayload::User { .. } => "user",
            EventPayload::Assistant { .. } => "assistant",
            EventPayload::ToolCall { .. } => "tool_call",
            EventPayload::ToolResult { .. } => "tool_result",
            EventPayload::Delegation { .. } => "delegation",
            EventPayload::DelegationComplete { .. } => "delegation_complete",
            EventPayload::AgentStart { .. } => "agent_start",
            EventPayload::AgentComplete { .. } => "agent_complete",
            EventPayload::AgentError { .. } => "agent_error",
            EventPayload::TodoUpdate { .. } => "todo_update",
            EventPayload::SessionRecovery { .. } => "session_recovery",
            EventPayload::SafetyLimit { .. } => "safety_limit",
            EventPayload::Unrecognized { kind, .. } => kind,
        }
    }

    /// 是否参与对话回放（user / assistant / tool_call / tool_result）
    pub fn is_core(&self) -> bool {
        matches!(
            self,
            EventPayload::User { .. }
                | EventPayload::Assistant { .. }
                | EventPayload::ToolCall { .. }
                | EventPayload::ToolResult { .. }
        )
    }

    /// 工具结果 payload：附带大小与 token 估算（字节数 / 4 向上取整）
    pub fn tool_result(tool_call_id: impl Into<String>, result: Value) -> Self {
        let result_size_bytes = result.to_string().len();
        EventPayload::ToolResult {
            tool_call_id: tool_call_id.into(),
            result,
            result_size_bytes,
            estimated_tokens: result_size_bytes.div_ceil(4),
        }
    }
}

/// 追加到会话日志后不可变的事件
#[derive(Clone, Debug, PartialEq)]
pub struct SessionEvent {
    /// 毫秒时间戳
    pub timestamp: i64,
    pub payload: EventPayload,
    pub metadata: Option<LlmMetadata>,
}

impl SessionEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Option<LlmMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn kind(&self) -> &str {
        self.payload.kind()
    }

    pub fn to_record(&self) -> Result<EventRecord, serde_json::Error> {
        let (kind, data) = match &self.payload {
            EventPayload::Unrecognized { kind, data } => (kind.clone(), data.clone()),
            known => {
                let mut tagged = serde_json::to_value(known)?;
                let data = tagged.get_mut("data").map(Value::take).unwrap_or(Value::Null);
                (known.kind().to_string(), data)
            }
        };
        let metadata = self
            .metadata
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        Ok(EventRecord {
            kind,
            timestamp: self.timestamp,
            data,
            metadata,
        })
    }

    /// 宽容转换：data 形状不符时降级为 Unrecognized，metadata 解析失败时丢弃
    pub fn from_record(record: EventRecord) -> Self {
        let EventRecord {
            kind,
            timestamp,
            data,
            metadata,
        } = record;
        let tagged = serde_json::json!({ "type": kind, "data": data });
        let payload = serde_json::from_value::<EventPayload>(tagged)
            .unwrap_or(EventPayload::Unrecognized { kind, data });
        let metadata = metadata.and_then(|m| serde_json::from_value(m).ok());
        Self {
            timestamp,
            payload,
            metadata,
        }
    }
}
