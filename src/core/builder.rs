//! 运行时构建器：统一的初始化逻辑
//!
//! 从 AppConfig 选择事件日志后端、组装工具注册表（TodoWrite / Task / echo + 自定义工具）与执行器，
//! 为 LLM 客户端套上限流退避，最终得到绑定到某个会话的 AgentRunner。

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::agent::{AgentDefinition, AgentRunner};
use crate::config::{AppConfig, SessionBackend, SessionSection};
use crate::core::AgentError;
use crate::llm::{LlmClient, MockLlmClient, RetryingLlmClient};
use crate::memory::TodoList;
use crate::session::{
    validate_session_id, EventLogger, EventStore, FileEventStore, InMemoryEventStore,
    NoopEventStore,
};
use crate::tools::{EchoTool, TaskTool, TodoWriteTool, Tool, ToolExecutor, ToolRegistry};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful agent. Use the available tools when they help, \
     keep the task list current with TodoWrite, and delegate self-contained work with Task.";

/// 按 [session] 段选择事件日志后端
pub fn build_store(session: &SessionSection) -> Arc<dyn EventStore> {
    match session.backend {
        SessionBackend::None => Arc::new(NoopEventStore),
        SessionBackend::Memory => Arc::new(InMemoryEventStore::new()),
        SessionBackend::File => Arc::new(FileEventStore::new(&session.dir)),
    }
}

/// 运行时构建器
pub struct RuntimeBuilder {
    config: AppConfig,
    session_id: String,
    system_prompt: String,
    llm: Option<Arc<dyn LlmClient>>,
    store: Option<Arc<dyn EventStore>>,
    agents: Vec<AgentDefinition>,
    extra_tools: Vec<Arc<dyn Tool>>,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig, session_id: impl Into<String>) -> Self {
        Self {
            config,
            session_id: session_id.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            llm: None,
            store: None,
            agents: Vec::new(),
            extra_tools: Vec::new(),
        }
    }

    /// 设置默认 Agent 的系统提示词
    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    /// 从 config/prompts/system.md 加载系统提示词，找不到则保持内置提示词
    pub fn with_system_prompt_from_file(mut self) -> Self {
        if let Some(prompt) = ["config/prompts/system.md", "../config/prompts/system.md"]
            .into_iter()
            .find_map(|p| std::fs::read_to_string(p).ok())
        {
            self.system_prompt = prompt;
        }
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 显式指定存储（覆盖 [session].backend）
    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 注册额外的 Agent（如委派目标）
    pub fn with_agent(mut self, agent: AgentDefinition) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.extra_tools.push(Arc::new(tool));
        self
    }

    /// 内置工具 + 自定义工具；TodoWrite 与返回的清单共享状态
    pub fn build_tool_registry(&self, todos: Arc<RwLock<TodoList>>) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(TodoWriteTool::new(todos));
        tools.register(TaskTool);
        tools.register(EchoTool);
        for tool in &self.extra_tools {
            tools.register_arc(tool.clone());
        }
        tools
    }

    pub fn build(self) -> Result<AgentRunner, AgentError> {
        validate_session_id(&self.session_id).map_err(AgentError::StorageError)?;

        let store = self
            .store
            .clone()
            .unwrap_or_else(|| build_store(&self.config.session));
        let llm = match self.llm.clone() {
            Some(llm) => llm,
            None => {
                tracing::warn!("No LLM client configured, using mock client");
                Arc::new(MockLlmClient::default())
            }
        };

        let todos = Arc::new(RwLock::new(TodoList::new()));
        let registry = self.build_tool_registry(todos.clone());
        tracing::info!(
            session_id = %self.session_id,
            backend = ?self.config.session.backend,
            tools = ?registry.tool_names(),
            "Building agent runtime"
        );
        let executor = Arc::new(ToolExecutor::new(
            Arc::new(registry),
            self.config.tools.executor_config(),
        ));
        let llm = RetryingLlmClient::new(llm, self.config.retry.retry_config());
        let logger = EventLogger::new(store, self.session_id.clone());

        let mut runner = AgentRunner::new(llm, executor, logger, todos)
            .with_max_iterations(self.config.app.max_iterations)
            .with_max_depth(self.config.app.max_depth)
            .with_agent(AgentDefinition::new(
                self.config.app.default_agent.clone(),
                self.system_prompt.clone(),
            ));
        for agent in self.agents {
            runner = runner.with_agent(agent);
        }
        Ok(runner)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

/// 便捷函数：加载配置（失败时使用默认值）并创建构建器
pub fn create_runtime_builder(
    config_path: Option<PathBuf>,
    session_id: impl Into<String>,
) -> RuntimeBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    RuntimeBuilder::new(config, session_id).with_system_prompt_from_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::AssistantReply;
    use crate::memory::ToolCallRequest;

    #[test]
    fn test_registry_has_builtins() {
        let builder = RuntimeBuilder::new(AppConfig::default(), "s");
        let registry = builder.build_tool_registry(Arc::new(RwLock::new(TodoList::new())));
        assert_eq!(registry.tool_names(), vec!["Task", "TodoWrite", "echo"]);
        assert!(registry.is_concurrency_safe("echo"));
        assert!(!registry.is_concurrency_safe("TodoWrite"));
    }

    #[test]
    fn test_rejects_bad_session_id() {
        let result = RuntimeBuilder::new(AppConfig::default(), "../escape").build();
        assert!(matches!(result, Err(AgentError::StorageError(_))));
    }

    #[tokio::test]
    async fn test_built_runner_delegates_to_registered_agent() {
        let store = Arc::new(InMemoryEventStore::new());
        let mock = Arc::new(MockLlmClient::new(vec![
            Ok(AssistantReply::tool_calls(vec![ToolCallRequest::new(
                "t1",
                "Task",
                r#"{"subagent_type":"helper","prompt":"say hi"}"#,
            )])),
            Ok(AssistantReply::text("hi")),
            Ok(AssistantReply::text("helper said hi")),
        ]));
        let runner = RuntimeBuilder::new(AppConfig::default(), "built")
            .with_llm(mock.clone())
            .with_store(store.clone())
            .with_agent(AgentDefinition::new("helper", "You help."))
            .build()
            .unwrap();

        assert_eq!(runner.agent_names(), vec!["helper", "main"]);
        let answer = runner.execute("main", "ask the helper", None).await.unwrap();
        assert_eq!(answer, "helper said hi");
        assert!(store.session_exists("built__sidechain_t1").await.unwrap());
    }
}
