//! Agent 运行时
//!
//! AgentRunner 驱动单个 Agent 的工具循环：调用模型（经限流退避）→ 记录回复 → 调度工具 → 追加结果，直到模型不再请求工具。
//! 顶层运行先从事件日志恢复会话与任务清单；委派的子运行写入独立的 sidechain 会话，且从不恢复历史。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::llm::{CompletionRequest, LlmClient, RetryingLlmClient};
use crate::memory::{Message, TodoList, ToolCallRequest};
use crate::session::{EventLogger, SessionEvent, SessionManager, TODO_WRITE_TOOL};
use crate::tools::{
    Delegate, DispatchContext, ExecutionContext, ToolExecutor, ToolResult, DEFAULT_MAX_DEPTH,
};

pub const DEFAULT_MAX_ITERATIONS: usize = 20;

const NO_RESPONSE: &str = "No response generated";

/// Agent 定义：名称、系统提示词、可用工具（None 为全部）
#[derive(Clone, Debug)]
pub struct AgentDefinition {
    pub name: String,
    pub system_prompt: String,
    pub tools: Option<Vec<String>>,
    pub model: Option<String>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            tools: None,
            model: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

pub struct AgentRunner {
    llm: RetryingLlmClient,
    executor: Arc<ToolExecutor>,
    agents: HashMap<String, AgentDefinition>,
    sessions: SessionManager,
    logger: EventLogger,
    todos: Arc<RwLock<TodoList>>,
    max_iterations: usize,
    max_depth: usize,
    cancel: CancellationToken,
}

impl AgentRunner {
    /// todos 须与注册到 executor 的 TodoWriteTool 共享同一份清单
    pub fn new(
        llm: RetryingLlmClient,
        executor: Arc<ToolExecutor>,
        logger: EventLogger,
        todos: Arc<RwLock<TodoList>>,
    ) -> Self {
        Self {
            llm,
            executor,
            agents: HashMap::new(),
            sessions: SessionManager::new(logger.store().clone()),
            logger,
            todos,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_depth: DEFAULT_MAX_DEPTH,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_agent(mut self, agent: AgentDefinition) -> Self {
        self.agents.insert(agent.name.clone(), agent);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn session_id(&self) -> &str {
        self.logger.session_id()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn todos(&self) -> &Arc<RwLock<TodoList>> {
        &self.todos
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    /// 取消令牌：取消后当前运行在下一次迭代前（或模型调用中）以 Cancelled 结束
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 实时订阅本会话事件
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.logger.subscribe()
    }

    /// 运行一个 Agent；context 为 None 表示顶层运行
    pub async fn execute(
        &self,
        agent_name: &str,
        prompt: &str,
        context: Option<ExecutionContext>,
    ) -> Result<String, AgentError> {
        let agent = self
            .agents
            .get(agent_name)
            .ok_or_else(|| AgentError::UnknownAgent(agent_name.to_string()))?;
        let context = context.unwrap_or_else(|| ExecutionContext::root(self.max_depth));
        if context.exceeds_max_depth() {
            return Err(AgentError::DepthExceeded {
                depth: context.depth,
                max_depth: context.max_depth,
            });
        }

        let base = if context.is_sidechain {
            let call_id = context
                .parent_call_id
                .as_deref()
                .unwrap_or(&context.trace_id);
            self.logger.for_sidechain(call_id)
        } else {
            self.logger.clone()
        };
        let logger = base.with_trace(context.trace_id.clone(), context.parent_call_id.clone());

        let mut messages = if context.is_sidechain {
            context.parent_messages.clone()
        } else {
            self.recover(&logger).await?
        };

        tracing::info!(
            agent = agent_name,
            depth = context.depth,
            session_id = logger.session_id(),
            history = messages.len(),
            "Agent started"
        );
        logger
            .log_agent_start(agent_name, context.depth, Some(prompt))
            .await;
        logger.log_user_message(prompt).await;
        messages.push(Message::user(prompt));

        let result = self.run_loop(agent, &mut messages, &context, &logger).await;

        match &result {
            Ok(_) => {
                let duration_ms = context.started_at.elapsed().as_millis() as u64;
                logger.log_agent_complete(agent_name, duration_ms).await;
                tracing::info!(agent = agent_name, duration_ms, "Agent completed");
            }
            Err(e) => {
                logger.log_agent_error(agent_name, &e.to_string()).await;
                tracing::error!(agent = agent_name, error = %e, "Agent failed");
            }
        }
        logger.flush().await;
        result
    }

    /// 回放事件日志得到历史对话，并恢复任务清单
    async fn recover(&self, logger: &EventLogger) -> Result<Vec<Message>, AgentError> {
        let session_id = logger.session_id();
        let history = self.sessions.recover_session(session_id).await?;
        let todos = self.sessions.recover_todos(session_id).await;
        let todo_count = todos.len();
        if todo_count > 0 {
            self.todos.write().await.restore(todos);
        }
        if !history.is_empty() || todo_count > 0 {
            logger
                .log_session_recovery(history.len(), Some(todo_count))
                .await;
        }
        Ok(history)
    }

    async fn run_loop(
        &self,
        agent: &AgentDefinition,
        messages: &mut Vec<Message>,
        context: &ExecutionContext,
        logger: &EventLogger,
    ) -> Result<String, AgentError> {
        let allowed = self.allowed_tools(agent, context);
        let specs = self.executor.registry().specs(allowed.as_deref());
        let mut last_text: Option<String> = None;

        for iteration in 0..self.max_iterations {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let request = CompletionRequest {
                system: Some(self.system_prompt(agent, context).await),
                messages: messages.clone(),
                tools: specs.clone(),
            };
            let reply = tokio::select! {
                _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                reply = self.llm.complete_with_notices(&request, move |notice| async move {
                    logger.log_system_message(notice.to_string()).await;
                }) => reply?,
            };

            if reply.content.as_deref().is_some_and(|c| !c.is_empty()) || reply.raw_content.is_some() {
                logger
                    .log_assistant_message(
                        &agent.name,
                        reply.content.clone(),
                        reply.raw_content.clone(),
                        reply.metadata.clone(),
                    )
                    .await;
            }
            if let Some(text) = reply.content.as_ref().filter(|c| !c.is_empty()) {
                last_text = Some(text.clone());
            }

            if reply.tool_calls.is_empty() {
                return Ok(last_text.unwrap_or_else(|| NO_RESPONSE.to_string()));
            }

            tracing::debug!(
                agent = %agent.name,
                iteration,
                calls = reply.tool_calls.len(),
                "Dispatching tool calls"
            );
            messages.push(reply.to_message());

            let dispatch = DispatchContext {
                logger,
                agent: &agent.name,
                execution: context,
                allowed_tools: allowed.as_deref(),
                delegate: Some(self),
            };
            let results = self.executor.execute_tools(&reply.tool_calls, &dispatch).await;

            if todo_list_changed(&reply.tool_calls, &results) {
                let items = self.todos.read().await.items().to_vec();
                logger.log_todo_update(items).await;
            }
            messages.extend(results.iter().map(ToolResult::to_message));
        }

        tracing::warn!(
            agent = %agent.name,
            max_iterations = self.max_iterations,
            "Iteration limit reached"
        );
        logger
            .log_safety_limit(
                "max_iterations",
                &agent.name,
                Some(format!("Stopped after {} iterations", self.max_iterations)),
            )
            .await;
        Ok(last_text.unwrap_or_else(|| NO_RESPONSE.to_string()))
    }

    /// sidechain 运行不开放 TodoWrite：任务清单只属于顶层会话
    fn allowed_tools(&self, agent: &AgentDefinition, context: &ExecutionContext) -> Option<Vec<String>> {
        if !context.is_sidechain {
            return agent.tools.clone();
        }
        let names = agent
            .tools
            .clone()
            .unwrap_or_else(|| self.executor.tool_names());
        Some(
            names
                .into_iter()
                .filter(|name| name != TODO_WRITE_TOOL)
                .collect(),
        )
    }

    async fn system_prompt(&self, agent: &AgentDefinition, context: &ExecutionContext) -> String {
        if context.is_sidechain {
            return agent.system_prompt.clone();
        }
        let tasks = self.todos.read().await.to_prompt_section();
        if tasks.is_empty() {
            agent.system_prompt.clone()
        } else {
            format!("{}\n\n{}", agent.system_prompt, tasks)
        }
    }
}

fn todo_list_changed(calls: &[ToolCallRequest], results: &[ToolResult]) -> bool {
    calls
        .iter()
        .zip(results)
        .any(|(call, result)| call.name == TODO_WRITE_TOOL && !result.is_error)
}

#[async_trait]
impl Delegate for AgentRunner {
    async fn delegate(
        &self,
        target_agent: &str,
        task: &str,
        context: ExecutionContext,
    ) -> Result<String, AgentError> {
        self.execute(target_agent, task, Some(context)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{AssistantReply, LlmError, MockLlmClient, RetryConfig};
    use crate::memory::Role;
    use crate::session::{EventPayload, EventStore, InMemoryEventStore, SYSTEM_AGENT};
    use crate::tools::{EchoTool, ExecutorConfig, TaskTool, TodoWriteTool, ToolRegistry};

    struct Harness {
        store: Arc<InMemoryEventStore>,
        mock: Arc<MockLlmClient>,
        runner: AgentRunner,
    }

    fn harness(script: Vec<Result<AssistantReply, LlmError>>) -> Harness {
        let store = Arc::new(InMemoryEventStore::new());
        let mock = Arc::new(MockLlmClient::new(script));
        let todos = Arc::new(RwLock::new(TodoList::new()));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(TaskTool);
        registry.register(TodoWriteTool::new(todos.clone()));
        let executor = Arc::new(ToolExecutor::new(Arc::new(registry), ExecutorConfig::default()));
        let llm = RetryingLlmClient::new(
            mock.clone(),
            RetryConfig {
                max_retries: 1,
                jitter_factor: 0.0,
                ..RetryConfig::default()
            },
        );
        let runner = AgentRunner::new(llm, executor, EventLogger::new(store.clone(), "s"), todos)
            .with_agent(AgentDefinition::new("main", "You are the main agent."))
            .with_agent(
                AgentDefinition::new("researcher", "You research.").with_tools(vec!["echo".into()]),
            );
        Harness { store, mock, runner }
    }

    async fn kinds(store: &InMemoryEventStore, session: &str) -> Vec<String> {
        store
            .read_events(session)
            .await
            .unwrap()
            .iter()
            .map(|e| e.kind().to_string())
            .collect()
    }

    async fn logged(store: &InMemoryEventStore, session: &str, kind: &str) -> usize {
        kinds(store, session).await.iter().filter(|k| *k == kind).count()
    }

    async fn system_notices(store: &InMemoryEventStore, session: &str) -> Vec<String> {
        store
            .read_events(session)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::Assistant { agent, content, .. }
                    if agent.as_deref() == Some(SYSTEM_AGENT) =>
                {
                    content
                }
                _ => None,
            })
            .collect()
    }

    fn todo_json(content: &str) -> String {
        format!(
            r#"{{"todos":[{{"content":"{content}","status":"pending","activeForm":"Working"}}]}}"#
        )
    }

    fn call(id: &str, name: &str, args: &str) -> AssistantReply {
        AssistantReply::tool_calls(vec![ToolCallRequest::new(id, name, args)])
    }

    #[tokio::test]
    async fn test_plain_answer_is_logged() {
        let h = harness(vec![Ok(AssistantReply::text("hello there"))]);
        let answer = h.runner.execute("main", "hi", None).await.unwrap();
        assert_eq!(answer, "hello there");
        assert_eq!(
            kinds(&h.store, "s").await,
            vec!["agent_start", "user", "assistant", "agent_complete"]
        );
        let request = &h.mock.requests()[0];
        assert_eq!(request.system.as_deref(), Some("You are the main agent."));
        assert_eq!(request.tools.len(), 3);
    }

    #[tokio::test]
    async fn test_tool_results_feed_next_turn() {
        let h = harness(vec![
            Ok(call("c1", "echo", r#"{"text":"pong"}"#)),
            Ok(AssistantReply::text("done")),
        ]);
        let answer = h.runner.execute("main", "ping", None).await.unwrap();
        assert_eq!(answer, "done");

        let second = &h.mock.requests()[1];
        let last = second.messages.last().unwrap();
        assert_eq!(last.role, Role::Tool);
        assert_eq!(last.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(last.text(), "pong");

        let recovered = h.runner.sessions().recover_session("s").await.unwrap();
        assert_eq!(recovered.len(), 4);
        assert_eq!(recovered[1].tool_calls[0].id, "c1");
    }

    #[tokio::test]
    async fn test_delegation_pulls_only_the_task() {
        let h = harness(vec![
            Ok(call(
                "call_1",
                "Task",
                r#"{"subagent_type":"researcher","prompt":"find the config loader"}"#,
            )),
            Ok(AssistantReply::text("found it in config.rs")),
            Ok(AssistantReply::text("the loader lives in config.rs")),
        ]);
        let answer = h
            .runner
            .execute("main", "secret parent context", None)
            .await
            .unwrap();
        assert_eq!(answer, "the loader lives in config.rs");

        let requests = h.mock.requests();
        let child = &requests[1];
        assert_eq!(child.messages, vec![Message::user("find the config loader")]);
        assert_eq!(child.system.as_deref(), Some("You research."));
        assert_eq!(child.tools.len(), 1);

        let parent_last = requests[2].messages.last().unwrap();
        assert_eq!(parent_last.text(), "found it in config.rs");

        assert_eq!(logged(&h.store, "s", "delegation").await, 1);
        assert_eq!(logged(&h.store, "s", "delegation_complete").await, 1);
        assert_eq!(logged(&h.store, "s", "user").await, 1);
        let child_kinds = kinds(&h.store, "s__sidechain_call_1").await;
        assert_eq!(child_kinds.first().map(String::as_str), Some("agent_start"));
    }

    #[tokio::test]
    async fn test_depth_limit_blocks_delegation() {
        let mut h = harness(vec![
            Ok(call("t", "Task", r#"{"subagent_type":"researcher","prompt":"x"}"#)),
            Ok(AssistantReply::text("gave up")),
        ]);
        h.runner = h.runner.with_max_depth(0);
        let answer = h.runner.execute("main", "go", None).await.unwrap();
        assert_eq!(answer, "gave up");
        assert_eq!(logged(&h.store, "s", "safety_limit").await, 1);
        assert_eq!(h.mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_resumes_from_crashed_session() {
        let h = harness(vec![Ok(AssistantReply::text("resumed"))]);
        let logger = EventLogger::new(h.store.clone(), "s");
        logger.log_user_message("first question").await;
        logger
            .log_tool_call("main", "echo", "dangling", serde_json::json!({"text": "x"}))
            .await;
        logger
            .log_tool_call(
                "main",
                TODO_WRITE_TOOL,
                "todo",
                serde_json::json!({"todos": [
                    {"content": "Answer", "status": "in_progress", "activeForm": "Answering"}
                ]}),
            )
            .await;

        let answer = h.runner.execute("main", "continue", None).await.unwrap();
        assert_eq!(answer, "resumed");

        let request = &h.mock.requests()[0];
        assert_eq!(
            request.messages,
            vec![Message::user("first question"), Message::user("continue")]
        );
        assert!(request.system.as_deref().unwrap().contains("[>] Answer"));
        assert_eq!(h.runner.todos().read().await.len(), 1);
        assert_eq!(logged(&h.store, "s", "session_recovery").await, 1);
    }

    #[tokio::test]
    async fn test_todo_write_logs_update() {
        let h = harness(vec![
            Ok(call(
                "w",
                TODO_WRITE_TOOL,
                r#"{"todos":[{"content":"Plan","status":"pending","activeForm":"Planning"}]}"#,
            )),
            Ok(AssistantReply::text("planned")),
        ]);
        h.runner.execute("main", "plan", None).await.unwrap();
        let events = h.store.read_events("s").await.unwrap();
        let update = events.iter().find_map(|e| match &e.payload {
            EventPayload::TodoUpdate { todos } => Some(todos.clone()),
            _ => None,
        });
        assert_eq!(update.map(|t| t.len()), Some(1));
    }

    #[tokio::test]
    async fn test_sidechain_cannot_rewrite_parent_todos() {
        let mut h = harness(vec![
            Ok(call("w1", TODO_WRITE_TOOL, &todo_json("Parent plan"))),
            Ok(call(
                "t1",
                "Task",
                r#"{"subagent_type":"planner","prompt":"break it down"}"#,
            )),
            Ok(call("w2", TODO_WRITE_TOOL, &todo_json("Child step"))),
            Ok(AssistantReply::text("child done")),
            Ok(AssistantReply::text("all done")),
        ]);
        h.runner = h
            .runner
            .with_agent(AgentDefinition::new("planner", "You plan."));
        let answer = h.runner.execute("main", "plan the work", None).await.unwrap();
        assert_eq!(answer, "all done");

        let requests = h.mock.requests();
        let child = &requests[2];
        assert_eq!(child.system.as_deref(), Some("You plan."));
        assert!(child.tools.iter().all(|t| t.name != TODO_WRITE_TOOL));
        let refused = requests[3].messages.last().unwrap();
        assert_eq!(refused.text(), "Tool TodoWrite not found");

        let live: Vec<String> = h
            .runner
            .todos()
            .read()
            .await
            .items()
            .iter()
            .map(|t| t.content.clone())
            .collect();
        let recovered: Vec<String> = h
            .runner
            .sessions()
            .recover_todos("s")
            .await
            .into_iter()
            .map(|t| t.content)
            .collect();
        assert_eq!(live, vec!["Parent plan"]);
        assert_eq!(recovered, live);

        let parent_prompt = requests[4].system.as_deref().unwrap();
        assert!(parent_prompt.contains("Parent plan"));
        assert!(!parent_prompt.contains("Child step"));
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let mut h = harness(vec![
            Ok(call("1", "echo", r#"{"text":"a"}"#)),
            Ok(call("2", "echo", r#"{"text":"b"}"#)),
        ]);
        h.runner = h.runner.with_max_iterations(2);
        let answer = h.runner.execute("main", "loop", None).await.unwrap();
        assert_eq!(answer, NO_RESPONSE);
        assert_eq!(logged(&h.store, "s", "safety_limit").await, 1);
    }

    #[tokio::test]
    async fn test_unknown_agent_and_cancellation() {
        let h = harness(vec![]);
        assert!(matches!(
            h.runner.execute("nobody", "hi", None).await,
            Err(AgentError::UnknownAgent(_))
        ));

        h.runner.cancel_token().cancel();
        assert!(matches!(
            h.runner.execute("main", "hi", None).await,
            Err(AgentError::Cancelled)
        ));
        assert_eq!(logged(&h.store, "s", "agent_error").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhaustion_fails_the_turn() {
        let limited = || {
            Err(LlmError::RateLimited {
                retry_after_ms: None,
            })
        };
        let h = harness(vec![limited(), limited()]);
        let result = h.runner.execute("main", "hi", None).await;
        assert!(matches!(
            result,
            Err(AgentError::LlmError(LlmError::RateLimited { .. }))
        ));
        assert_eq!(h.mock.call_count(), 2);
        assert_eq!(
            system_notices(&h.store, "s").await,
            vec![
                "Rate limit hit. Retry 1/1 after 1.0s",
                "Rate limit retry exhausted after 1 attempts. Giving up."
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retries_are_audited_but_not_replayed() {
        let h = harness(vec![
            Err(LlmError::RateLimited {
                retry_after_ms: None,
            }),
            Ok(AssistantReply::text("hello")),
        ]);
        let answer = h.runner.execute("main", "hi", None).await.unwrap();
        assert_eq!(answer, "hello");
        assert_eq!(
            system_notices(&h.store, "s").await,
            vec!["Rate limit hit. Retry 1/1 after 1.0s"]
        );

        let replayed = h.runner.sessions().recover_session("s").await.unwrap();
        assert_eq!(replayed, vec![Message::user("hi"), Message::assistant("hello")]);
    }
}
