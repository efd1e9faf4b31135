//! TodoWrite 工具：整体替换当前会话的任务清单
//!
//! 写入时校验（单一 in_progress、内容不重复、非空）；校验失败返回软错误，清单保持不变。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::memory::{TodoItem, TodoList};
use crate::session::TODO_WRITE_TOOL;
use crate::tools::schema::schema_value;
use crate::tools::{Tool, ToolError, ToolOutput};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TodoWriteArgs {
    /// 完整的新任务清单
    pub todos: Vec<TodoItem>,
}

pub struct TodoWriteTool {
    todos: Arc<RwLock<TodoList>>,
}

impl TodoWriteTool {
    pub fn new(todos: Arc<RwLock<TodoList>>) -> Self {
        Self { todos }
    }
}

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        TODO_WRITE_TOOL
    }

    fn description(&self) -> &str {
        "Replace the task list for this session. Keep exactly one task in_progress while working."
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<TodoWriteArgs>()
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let args: TodoWriteArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let count = args.todos.len();
        let mut todos = self.todos.write().await;
        match todos.update(args.todos) {
            Ok(()) => Ok(ToolOutput::ok(format!(
                "Todo list updated with {count} items. Tasks are tracked in session."
            ))),
            Err(e) => Ok(ToolOutput::error(e.to_string())),
        }
    }
}
