//! Hive - Agent 执行状态恢复与工具调度引擎
//!
//! 模块划分：
//! - **agent**: Agent 运行时（工具循环、委派、会话恢复）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、运行时构建器
//! - **llm**: LLM 客户端抽象、限流退避中间件、Mock
//! - **memory**: 对话消息模型与任务清单
//! - **observability**: tracing 初始化
//! - **session**: 事件日志存储、事件记录器、消息清洗、会话恢复
//! - **tools**: Tool trait、注册表、调度执行器与内置工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod session;
pub mod tools;

pub use agent::{AgentDefinition, AgentRunner};
pub use core::{AgentError, RuntimeBuilder};
pub use session::{MessageSanitizer, SessionManager};
