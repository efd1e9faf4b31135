//! 委派（Task 工具）
//!
//! Task 工具只声明参数 schema，执行由 ToolExecutor 接管：不调用工具体，而是通过 Delegate 回调启动子 Agent。
//! 子 Agent 采用「拉取」隔离：只拿到任务描述，parent_messages 恒为空，所需上下文由子 Agent 自行用工具获取。

use std::time::Instant;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::memory::Message;
use crate::tools::schema::schema_value;
use crate::tools::{Tool, ToolError, ToolOutput};

pub const TASK_TOOL_NAME: &str = "Task";

/// 默认最大委派深度
pub const DEFAULT_MAX_DEPTH: usize = 10;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskArgs {
    /// 目标子 Agent 名称
    pub subagent_type: String,
    /// 交给子 Agent 的完整任务描述
    pub prompt: String,
}

/// 一次 Agent 运行的执行上下文
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub depth: usize,
    pub max_depth: usize,
    pub parent_agent: Option<String>,
    pub is_sidechain: bool,
    /// 委派时恒为空（拉取隔离）
    pub parent_messages: Vec<Message>,
    pub trace_id: String,
    pub parent_call_id: Option<String>,
    pub started_at: Instant,
}

impl ExecutionContext {
    /// 顶层运行：depth 0，新 trace id
    pub fn root(max_depth: usize) -> Self {
        Self {
            depth: 0,
            max_depth,
            parent_agent: None,
            is_sidechain: false,
            parent_messages: Vec::new(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            parent_call_id: None,
            started_at: Instant::now(),
        }
    }

    /// 子运行上下文：depth + 1，继承 trace id，不携带父对话
    pub fn child(&self, parent_agent: &str, call_id: &str) -> Self {
        Self {
            depth: self.depth + 1,
            max_depth: self.max_depth,
            parent_agent: Some(parent_agent.to_string()),
            is_sidechain: true,
            parent_messages: Vec::new(),
            trace_id: self.trace_id.clone(),
            parent_call_id: Some(call_id.to_string()),
            started_at: Instant::now(),
        }
    }

    pub fn exceeds_max_depth(&self) -> bool {
        self.depth > self.max_depth
    }
}

/// 委派回调：由 Agent 运行时实现，启动一个子 Agent 并返回其最终文本
#[async_trait]
pub trait Delegate: Send + Sync {
    async fn delegate(
        &self,
        target_agent: &str,
        task: &str,
        context: ExecutionContext,
    ) -> Result<String, AgentError>;
}

/// Task 工具声明（执行由 ToolExecutor 的委派路径完成）
pub struct TaskTool;

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        TASK_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Delegate a self-contained task to a specialised sub-agent. The sub-agent does not see this \
         conversation: include everything it needs in the prompt."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<TaskArgs>()
    }

    async fn execute(&self, _args: Value) -> Result<ToolOutput, ToolError> {
        Err(ToolError::Failed(
            "Task must be dispatched through the tool executor".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_context_is_isolated() {
        let mut root = ExecutionContext::root(DEFAULT_MAX_DEPTH);
        root.parent_messages.push(Message::user("secret parent history"));
        let child = root.child("main", "call_1");
        assert_eq!(child.depth, 1);
        assert!(child.parent_messages.is_empty());
        assert!(child.is_sidechain);
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_call_id.as_deref(), Some("call_1"));
        assert_eq!(child.parent_agent.as_deref(), Some("main"));
    }

    #[test]
    fn test_depth_limit() {
        let mut ctx = ExecutionContext::root(1);
        ctx = ctx.child("a", "1");
        assert!(!ctx.exceeds_max_depth());
        assert!(ctx.child("b", "2").exceeds_max_depth());
    }
}
