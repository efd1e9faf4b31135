//! 工具层：Tool trait 与注册表、调度执行器、内置工具（TodoWrite / Task / echo）

pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;
pub mod task;
pub mod todo_write;

pub use echo::EchoTool;
pub use executor::{
    DispatchContext, ExecutorConfig, ToolExecutor, ToolGroup, ToolResult,
    DEFAULT_MAX_CONCURRENT_TOOLS,
};
pub use registry::{Tool, ToolError, ToolOutput, ToolRegistry};
pub use schema::schema_value;
pub use task::{Delegate, ExecutionContext, TaskArgs, TaskTool, DEFAULT_MAX_DEPTH, TASK_TOOL_NAME};
pub use todo_write::TodoWriteTool;
