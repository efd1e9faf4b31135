//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / schema / 并发安全标记 / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调度时分组、加超时与重试。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::core::ErrorClass;
use crate::llm::ToolSpec;

/// 工具执行产出：content 为结果，error 为工具自报的软错误（不重试）
#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutput {
    pub content: Value,
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn ok(content: impl Into<Value>) -> Self {
        Self {
            content: content.into(),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: Value::Null,
            error: Some(message.into()),
        }
    }
}

/// 工具执行失败；瞬时错误（连接重置、超时、5xx）会被执行器重试
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("Operation timed out: {0}")]
    TimedOut(String),

    #[error("Upstream returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ToolError::ConnectionReset(_) | ToolError::TimedOut(_) => ErrorClass::Transient,
            ToolError::Status { status, .. } if *status >= 500 => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、并发安全标记、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（与模型返回的 tool_calls[].name 对应）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema（供 LLM 生成正确的参数格式）
    /// 默认返回空对象，表示无参数或参数格式不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 是否可与相邻的并发安全调用同时执行（只读、无共享可变状态）
    fn is_concurrency_safe(&self) -> bool {
        false
    }

    /// 执行工具
    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "Tool registered twice, replacing previous definition");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// 未知工具视为不安全
    pub fn is_concurrency_safe(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .is_some_and(|tool| tool.is_concurrency_safe())
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 暴露给模型的工具列表；allowed 为 Some 时只包含其中的工具
    pub fn specs(&self, allowed: Option<&[String]>) -> Vec<ToolSpec> {
        self.tool_names()
            .into_iter()
            .filter(|name| allowed.map_or(true, |a| a.iter().any(|x| x == name)))
            .filter_map(|name| {
                let tool = self.tools.get(&name)?;
                Some(ToolSpec {
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                    name,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[test]
    fn test_tool_error_classification() {
        assert!(ToolError::ConnectionReset("peer".into()).is_transient());
        assert!(ToolError::TimedOut("read".into()).is_transient());
        assert!(ToolError::Status {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(!ToolError::Status {
            status: 404,
            message: "missing".into()
        }
        .is_transient());
        assert!(!ToolError::Failed("nope".into()).is_transient());
    }

    #[test]
    fn test_registry_specs_respect_allowed_list() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        assert!(registry.is_concurrency_safe("echo"));
        assert!(!registry.is_concurrency_safe("missing"));
        assert_eq!(registry.specs(None).len(), 1);
        assert!(registry.specs(Some(&["other".to_string()])).is_empty());
        assert_eq!(registry.specs(None)[0].name, "echo");
    }
}
