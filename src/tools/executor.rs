//! 工具执行器（调度编排）
//!
//! execute_tools 按原顺序把一批调用切分为连续的并发安全组 / 非安全组：安全组并发执行（最多 max_concurrent 个同时在途），
//! 非安全组逐个执行；结果顺序与输入一致。每个调用施加超时与瞬时错误重试，失败转为错误结果而不上抛；
//! 每个调用恰好记录一条 tool_call 事件与一条 tool_result 事件，并输出结构化审计日志（JSON）。
//! Task 调用走委派路径：不执行工具体，通过 Delegate 启动 depth + 1 的子 Agent。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::timeout;

use crate::memory::{Message, ToolCallRequest};
use crate::session::EventLogger;
use crate::tools::task::{Delegate, ExecutionContext, TaskArgs, TASK_TOOL_NAME};
use crate::tools::{Tool, ToolError, ToolOutput, ToolRegistry};

pub const DEFAULT_MAX_CONCURRENT_TOOLS: usize = 10;

/// 执行策略
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// 单次调用超时（可被调用参数中的 timeout 毫秒值覆盖）
    pub timeout: Duration,
    /// 瞬时错误的额外重试次数
    pub retry_count: u32,
    /// 线性退避基数：第 n 次失败后等待 base × n
    pub retry_base_delay: Duration,
    pub max_concurrent: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_count: 2,
            retry_base_delay: Duration::from_millis(1000),
            max_concurrent: DEFAULT_MAX_CONCURRENT_TOOLS,
        }
    }
}

/// 单个调用的结果（顺序与输入调用一致）
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
    /// 因超时被放弃
    pub timed_out: bool,
}

impl ToolResult {
    fn success(tool_call_id: &str, content: String) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            content,
            is_error: false,
            timed_out: false,
        }
    }

    fn error(tool_call_id: &str, content: String) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            content,
            is_error: true,
            timed_out: false,
        }
    }

    pub fn to_message(&self) -> Message {
        Message::tool(self.tool_call_id.clone(), self.content.clone())
    }
}

/// 连续且并发安全性相同的一段调用
#[derive(Clone, Debug, PartialEq)]
pub struct ToolGroup {
    pub concurrency_safe: bool,
    pub calls: Vec<ToolCallRequest>,
}

/// 单次调度所需的会话上下文
pub struct DispatchContext<'a> {
    pub logger: &'a EventLogger,
    pub agent: &'a str,
    pub execution: &'a ExecutionContext,
    /// 当前 Agent 允许使用的工具；None 表示不限
    pub allowed_tools: Option<&'a [String]>,
    pub delegate: Option<&'a dyn Delegate>,
}

/// 已记录 tool_call 事件、等待执行的调用
enum Prepared {
    Run {
        call: ToolCallRequest,
        tool: Arc<dyn Tool>,
        args: Value,
    },
    Delegate {
        call: ToolCallRequest,
        args: TaskArgs,
    },
    Done(ToolResult),
}

enum Outcome {
    Completed(ToolOutput),
    Failed(ToolError),
    TimedOut(Duration),
}

/// 工具执行器：分组、并发控制、超时、重试、委派
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    config: ExecutorConfig,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, config: ExecutorConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 一次线性扫描：安全性与前一个调用不同则开启新组；未知工具视为不安全
    pub fn group_tool_calls(&self, calls: &[ToolCallRequest]) -> Vec<ToolGroup> {
        let mut groups: Vec<ToolGroup> = Vec::new();
        for call in calls {
            let safe = self.registry.is_concurrency_safe(&call.name);
            match groups.last_mut() {
                Some(group) if group.concurrency_safe == safe => group.calls.push(call.clone()),
                _ => groups.push(ToolGroup {
                    concurrency_safe: safe,
                    calls: vec![call.clone()],
                }),
            }
        }
        groups
    }

    /// 执行一批调用，返回与输入等长、同序的结果
    pub async fn execute_tools(
        &self,
        calls: &[ToolCallRequest],
        ctx: &DispatchContext<'_>,
    ) -> Vec<ToolResult> {
        warn_duplicate_ids(calls);

        let mut results = Vec::with_capacity(calls.len());
        for group in self.group_tool_calls(calls) {
            if group.concurrency_safe && group.calls.len() > 1 {
                let mut prepared = Vec::with_capacity(group.calls.len());
                for call in group.calls {
                    prepared.push(self.prepare(call, ctx).await);
                }
                let batch: Vec<ToolResult> = stream::iter(prepared)
                    .map(|p| self.run(p, ctx))
                    .buffered(self.config.max_concurrent.max(1))
                    .collect()
                    .await;
                results.extend(batch);
            } else {
                for call in group.calls {
                    let prepared = self.prepare(call, ctx).await;
                    results.push(self.run(prepared, ctx).await);
                }
            }
        }
        results
    }

    /// 解析工具与参数并记录 tool_call 事件；无法执行的调用直接记录错误结果
    async fn prepare(&self, call: ToolCallRequest, ctx: &DispatchContext<'_>) -> Prepared {
        let allowed = ctx
            .allowed_tools
            .map_or(true, |names| names.iter().any(|n| n == &call.name));
        let tool = match self.registry.get(&call.name) {
            Some(tool) if allowed => tool,
            _ => {
                tracing::warn!(agent = ctx.agent, tool = %call.name, "Tool not found");
                let message = format!("Tool {} not found", call.name);
                ctx.logger
                    .log_tool_call(ctx.agent, &call.name, &call.id, json!({}))
                    .await;
                let logged = json!({"error": true, "message": message});
                return Prepared::Done(
                    self.finish(&call, ToolResult::error(&call.id, message), logged, ctx)
                        .await,
                );
            }
        };

        let args = match parse_arguments(&call.arguments) {
            Ok(args) => args,
            Err(e) => {
                let message = format!("Invalid arguments: {e}");
                ctx.logger
                    .log_tool_call(ctx.agent, &call.name, &call.id, json!({}))
                    .await;
                return Prepared::Done(self.fail(&call, message, ctx).await);
            }
        };

        ctx.logger
            .log_tool_call(ctx.agent, &call.name, &call.id, args.clone())
            .await;

        if tool.name() == TASK_TOOL_NAME {
            return match serde_json::from_value::<TaskArgs>(args) {
                Ok(args) => Prepared::Delegate { call, args },
                Err(e) => {
                    let message = format!("Invalid arguments: {e}");
                    Prepared::Done(self.fail(&call, message, ctx).await)
                }
            };
        }

        Prepared::Run { call, tool, args }
    }

    async fn run(&self, prepared: Prepared, ctx: &DispatchContext<'_>) -> ToolResult {
        match prepared {
            Prepared::Done(result) => result,
            Prepared::Delegate { call, args } => self.run_delegation(&call, args, ctx).await,
            Prepared::Run { call, tool, args } => {
                let (result, logged) = match self.execute_with_policy(&call, tool.as_ref(), args).await {
                    Outcome::Completed(output) => {
                        let text = value_text(&output.content);
                        let logged = match &output.error {
                            Some(err) => json!({"content": output.content, "error": err}),
                            None => json!({"content": output.content}),
                        };
                        let result = match output.error {
                            Some(err) if text.is_empty() => ToolResult::error(&call.id, err),
                            Some(err) => ToolResult::error(&call.id, format!("{err}\n\n{text}")),
                            None => ToolResult::success(&call.id, text),
                        };
                        (result, logged)
                    }
                    Outcome::Failed(e) => {
                        let message = e.to_string();
                        (
                            ToolResult::error(&call.id, message.clone()),
                            json!({"content": null, "error": message}),
                        )
                    }
                    Outcome::TimedOut(limit) => {
                        let message =
                            format!("Tool execution timed out after {}ms", limit.as_millis());
                        let result = ToolResult {
                            timed_out: true,
                            ..ToolResult::error(&call.id, message.clone())
                        };
                        (result, json!({"content": null, "error": message, "timedOut": true}))
                    }
                };
                self.finish(&call, result, logged, ctx).await
            }
        }
    }

    /// 超时 + 瞬时错误线性退避重试；执行器自身的超时不重试
    async fn execute_with_policy(&self, call: &ToolCallRequest, tool: &dyn Tool, args: Value) -> Outcome {
        let limit = args
            .get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(self.config.timeout);
        let args_preview = args_preview(&args);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let start = Instant::now();
            let result = timeout(limit, tool.execute(args.clone())).await;

            let (ok, outcome): (bool, &str) = match &result {
                Ok(Ok(output)) if output.error.is_none() => (true, "ok"),
                Ok(Ok(_)) | Ok(Err(_)) => (false, "error"),
                Err(_) => (false, "timeout"),
            };
            let audit = json!({
                "event": "tool_audit",
                "tool": call.name,
                "call_id": call.id,
                "attempt": attempt,
                "ok": ok,
                "outcome": outcome,
                "duration_ms": start.elapsed().as_millis() as u64,
                "args_preview": args_preview,
            });
            tracing::info!(audit = %audit.to_string(), "tool");

            match result {
                Err(_) => return Outcome::TimedOut(limit),
                Ok(Ok(output)) => return Outcome::Completed(output),
                Ok(Err(e)) if e.is_transient() && attempt <= self.config.retry_count => {
                    let delay = self.config.retry_base_delay * attempt;
                    tracing::warn!(
                        tool = %call.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient tool failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(Err(e)) => return Outcome::Failed(e),
            }
        }
    }

    /// 委派：拉取隔离，子上下文不携带父对话；不受工具超时与重试约束
    async fn run_delegation(
        &self,
        call: &ToolCallRequest,
        args: TaskArgs,
        ctx: &DispatchContext<'_>,
    ) -> ToolResult {
        let Some(delegate) = ctx.delegate else {
            let message = "Delegation is not available in this context".to_string();
            return self.fail(call, message, ctx).await;
        };

        let child = ctx.execution.child(ctx.agent, &call.id);
        if child.exceeds_max_depth() {
            let message = format!(
                "Maximum delegation depth {} exceeded, cannot delegate to {}",
                child.max_depth, args.subagent_type
            );
            ctx.logger
                .log_safety_limit("max_depth", ctx.agent, Some(message.clone()))
                .await;
            return self.fail(call, message, ctx).await;
        }

        tracing::info!(
            parent = ctx.agent,
            child = %args.subagent_type,
            depth = child.depth,
            "Delegating task"
        );
        ctx.logger
            .log_delegation(ctx.agent, &args.subagent_type, &args.prompt)
            .await;

        let (result, logged) = match delegate
            .delegate(&args.subagent_type, &args.prompt, child)
            .await
        {
            Ok(text) => {
                ctx.logger
                    .log_delegation_complete(ctx.agent, &args.subagent_type, &text)
                    .await;
                let logged = json!({"content": text});
                (ToolResult::success(&call.id, text), logged)
            }
            Err(e) => {
                let message = format!("Delegation to {} failed: {e}", args.subagent_type);
                ctx.logger
                    .log_delegation_complete(ctx.agent, &args.subagent_type, &message)
                    .await;
                (
                    ToolResult::error(&call.id, message.clone()),
                    json!({"content": null, "error": message}),
                )
            }
        };
        self.finish(call, result, logged, ctx).await
    }

    async fn fail(&self, call: &ToolCallRequest, message: String, ctx: &DispatchContext<'_>) -> ToolResult {
        let logged = json!({"content": null, "error": message});
        self.finish(call, ToolResult::error(&call.id, message), logged, ctx)
            .await
    }

    /// 记录 tool_result 事件
    async fn finish(
        &self,
        call: &ToolCallRequest,
        result: ToolResult,
        logged: Value,
        ctx: &DispatchContext<'_>,
    ) -> ToolResult {
        ctx.logger.log_tool_result(&call.id, logged).await;
        result
    }
}

/// 空字符串视为无参数
fn parse_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn warn_duplicate_ids(calls: &[ToolCallRequest]) {
    let mut seen = HashSet::new();
    for call in calls {
        if !seen.insert(call.id.as_str()) {
            tracing::warn!(call_id = %call.id, tool = %call.name, "Duplicate tool call id in batch");
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
