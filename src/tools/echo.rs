//! Echo 工具（测试用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::schema_value;
use crate::tools::{Tool, ToolError, ToolOutput};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EchoArgs {
    /// 要回显的文本
    pub text: String,
}

/// Echo 工具：回显文本；只读，可并发
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing). Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<EchoArgs>()
    }

    fn is_concurrency_safe(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let args: EchoArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        Ok(ToolOutput::ok(args.text))
    }
}
