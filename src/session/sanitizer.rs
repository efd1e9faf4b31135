//! 消息清洗器
//!
//! 将任意（可能损坏、截断）的消息序列变为可直接回放给 LLM API 的合法序列，从不失败。
//!
//! 分五层依次处理：
//! 1. 结构校验：丢弃非对象、role 非法、tool 消息缺 tool_call_id、字段无法解析的条目
//! 2. 空消息移除：无文本、无 tool_calls、无 raw_content
//! 3. 调用/结果修复：移除未完成的 tool_calls（在下一条 assistant 之前无匹配结果），丢弃孤立的 tool 结果
//! 4. 最终校验：在 ±window 条消息范围内检查调用与结果一一对应
//! 5. 渐进回退：从尾部截断 1..5 条、保留前半段、最终返回空序列

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use crate::memory::{Message, Role};

/// 最终校验向前 / 向后扫描的消息条数
pub const VALIDATION_WINDOW: usize = 10;

/// 回退时最多从尾部截断的消息条数
pub const MAX_TAIL_TRUNCATION: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    IncompleteToolCall,
    OrphanedToolResult,
    InvalidMessage,
    EmptyMessage,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::IncompleteToolCall => "incomplete_tool_call",
            IssueType::OrphanedToolResult => "orphaned_tool_result",
            IssueType::InvalidMessage => "invalid_message",
            IssueType::EmptyMessage => "empty_message",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueAction {
    RemovedToolCalls,
    RemovedMessage,
    Skipped,
}

/// 清洗过程中发现并处理的问题；index 为该层输入中的位置，整体性问题为 None
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SanitizationIssue {
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub index: Option<usize>,
    pub action: IssueAction,
    pub details: String,
}

impl SanitizationIssue {
    fn new(
        issue_type: IssueType,
        index: Option<usize>,
        action: IssueAction,
        details: impl Into<String>,
    ) -> Self {
        Self {
            issue_type,
            index,
            action,
            details: details.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SanitizationResult {
    pub messages: Vec<Message>,
    pub issues: Vec<SanitizationIssue>,
    /// 始终为 true：清洗从不失败
    pub recovered: bool,
}

impl SanitizationResult {
    fn new(messages: Vec<Message>, issues: Vec<SanitizationIssue>) -> Self {
        Self {
            messages,
            issues,
            recovered: true,
        }
    }
}

/// 清洗器；window 控制最终校验的扫描范围
#[derive(Clone, Copy, Debug)]
pub struct MessageSanitizer {
    window: usize,
}

impl Default for MessageSanitizer {
    fn default() -> Self {
        Self::new(VALIDATION_WINDOW)
    }
}

/// 以默认窗口清洗原始 JSON 输入
pub fn sanitize(raw: &Value) -> SanitizationResult {
    MessageSanitizer::default().sanitize(raw)
}

/// 以默认窗口清洗已解析的消息
pub fn sanitize_messages(messages: Vec<Message>) -> SanitizationResult {
    MessageSanitizer::default().sanitize_messages(messages)
}

/// 以默认窗口做结构校验
pub fn validate_message_structure(messages: &[Message]) -> (bool, Vec<String>) {
    MessageSanitizer::default().validate_structure(messages)
}

impl MessageSanitizer {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn sanitize(&self, raw: &Value) -> SanitizationResult {
        let Some(entries) = raw.as_array() else {
            return SanitizationResult::new(
                Vec::new(),
                vec![SanitizationIssue::new(
                    IssueType::InvalidMessage,
                    None,
                    IssueAction::Skipped,
                    "Input is not a message array",
                )],
            );
        };

        let mut issues = Vec::new();
        let mut valid = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            match parse_entry(entry) {
                Ok(msg) => valid.push(msg),
                Err(reason) => issues.push(SanitizationIssue::new(
                    IssueType::InvalidMessage,
                    Some(index),
                    IssueAction::RemovedMessage,
                    reason,
                )),
            }
        }
        self.run(valid, issues)
    }

    pub fn sanitize_messages(&self, messages: Vec<Message>) -> SanitizationResult {
        let mut issues = Vec::new();
        let mut valid = Vec::with_capacity(messages.len());
        for (index, msg) in messages.into_iter().enumerate() {
            if msg.role == Role::Tool && !has_tool_call_id(&msg) {
                issues.push(SanitizationIssue::new(
                    IssueType::InvalidMessage,
                    Some(index),
                    IssueAction::RemovedMessage,
                    "Tool message missing tool_call_id",
                ));
            } else {
                valid.push(msg);
            }
        }
        self.run(valid, issues)
    }

    fn run(&self, valid: Vec<Message>, mut issues: Vec<SanitizationIssue>) -> SanitizationResult {
        if valid.is_empty() {
            return SanitizationResult::new(valid, issues);
        }

        let non_empty = remove_empty(valid, &mut issues);
        let repaired = repair_tool_calls(&non_empty, &mut issues);

        let (ok, errors) = self.validate_structure(&repaired);
        if ok {
            return SanitizationResult::new(repaired, issues);
        }

        issues.push(SanitizationIssue::new(
            IssueType::InvalidMessage,
            None,
            IssueAction::Skipped,
            format!(
                "Structure validation failed after repair: {}",
                errors.join("; ")
            ),
        ));
        let messages = self.fallback(&non_empty, &mut issues);
        SanitizationResult::new(messages, issues)
    }

    /// 调用 / 结果配对校验：每个调用在 window 内（下一条 assistant 之前）有结果，每个结果在 window 内有调用。
    /// 窗口至少覆盖一条 assistant 的整批并行调用：向前不少于 tool_calls 条，向后至少回溯到最近的 assistant。
    pub fn validate_structure(&self, messages: &[Message]) -> (bool, Vec<String>) {
        let mut errors = Vec::new();

        for (i, msg) in messages.iter().enumerate() {
            match msg.role {
                Role::Assistant if msg.has_tool_calls() => {
                    let reach = self.window.max(msg.tool_calls.len());
                    let end = (i + reach).min(messages.len().saturating_sub(1));
                    let mut answered = HashSet::new();
                    for later in messages.iter().take(end + 1).skip(i + 1) {
                        if later.role == Role::Assistant {
                            break;
                        }
                        if let (Role::Tool, Some(id)) = (later.role, later.tool_call_id.as_deref()) {
                            answered.insert(id);
                        }
                    }
                    for call in &msg.tool_calls {
                        if !answered.contains(call.id.as_str()) {
                            errors.push(format!(
                                "Message {i}: tool call {} has no matching result",
                                call.id
                            ));
                        }
                    }
                }
                Role::Tool => {
                    let id = msg.tool_call_id.as_deref().unwrap_or_default();
                    let owner = messages[..i]
                        .iter()
                        .rposition(|earlier| earlier.role == Role::Assistant)
                        .unwrap_or(0);
                    let start = i.saturating_sub(self.window).min(owner);
                    let matched = messages[start..i].iter().rev().any(|earlier| {
                        earlier.role == Role::Assistant
                            && earlier.tool_calls.iter().any(|c| c.id == id)
                    });
                    if !matched {
                        errors.push(format!(
                            "Message {i}: tool result {id} has no matching tool call"
                        ));
                    }
                }
                _ => {}
            }
        }

        (errors.is_empty(), errors)
    }

    fn fallback(&self, messages: &[Message], issues: &mut Vec<SanitizationIssue>) -> Vec<Message> {
        let len = messages.len();

        for dropped in 1..=MAX_TAIL_TRUNCATION {
            if dropped >= len {
                break;
            }
            let candidate = &messages[..len - dropped];
            if self.validate_structure(candidate).0 {
                issues.push(SanitizationIssue::new(
                    IssueType::InvalidMessage,
                    None,
                    IssueAction::RemovedMessage,
                    format!("Recovered by removing last {dropped} message(s)"),
                ));
                return candidate.to_vec();
            }
        }

        let half = len / 2;
        if half > 0 && self.validate_structure(&messages[..half]).0 {
            issues.push(SanitizationIssue::new(
                IssueType::InvalidMessage,
                None,
                IssueAction::RemovedMessage,
                format!("Recovered by keeping first {half} message(s)"),
            ));
            return messages[..half].to_vec();
        }

        issues.push(SanitizationIssue::new(
            IssueType::InvalidMessage,
            None,
            IssueAction::Skipped,
            "Could not recover a valid conversation, starting fresh",
        ));
        Vec::new()
    }
}

fn has_tool_call_id(msg: &Message) -> bool {
    msg.tool_call_id.as_deref().is_some_and(|id| !id.is_empty())
}

fn parse_entry(entry: &Value) -> Result<Message, String> {
    let obj = entry
        .as_object()
        .ok_or_else(|| "Entry is not an object".to_string())?;
    let role = obj
        .get("role")
        .and_then(Value::as_str)
        .ok_or_else(|| "Missing role".to_string())?;
    if !matches!(role, "system" | "user" | "assistant" | "tool") {
        return Err(format!("Invalid role: {role}"));
    }
    let msg: Message =
        serde_json::from_value(entry.clone()).map_err(|e| format!("Malformed message: {e}"))?;
    if msg.role == Role::Tool && !has_tool_call_id(&msg) {
        return Err("Tool message missing tool_call_id".to_string());
    }
    Ok(msg)
}

fn remove_empty(messages: Vec<Message>, issues: &mut Vec<SanitizationIssue>) -> Vec<Message> {
    messages
        .into_iter()
        .enumerate()
        .filter_map(|(index, msg)| {
            if msg.is_empty() {
                issues.push(SanitizationIssue::new(
                    IssueType::EmptyMessage,
                    Some(index),
                    IssueAction::RemovedMessage,
                    format!("Removed empty {} message", msg.role.as_str()),
                ));
                None
            } else {
                Some(msg)
            }
        })
        .collect()
}

/// assistant 消息 index 之后、下一条 assistant 之前没有匹配结果的调用 id
fn find_incomplete_tool_calls(messages: &[Message], index: usize) -> Vec<String> {
    let mut pending: Vec<&str> = messages[index]
        .tool_calls
        .iter()
        .map(|c| c.id.as_str())
        .collect();
    for later in &messages[index + 1..] {
        if later.role == Role::Assistant || pending.is_empty() {
            break;
        }
        if let (Role::Tool, Some(id)) = (later.role, later.tool_call_id.as_deref()) {
            pending.retain(|p| *p != id);
        }
    }
    pending.into_iter().map(str::to_string).collect()
}

fn repair_tool_calls(messages: &[Message], issues: &mut Vec<SanitizationIssue>) -> Vec<Message> {
    let mut fixed: Vec<Message> = Vec::with_capacity(messages.len());

    for (index, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::Assistant if msg.has_tool_calls() => {
                let incomplete = find_incomplete_tool_calls(messages, index);
                if incomplete.is_empty() {
                    fixed.push(msg.clone());
                    continue;
                }

                let ids = incomplete.join(", ");
                if incomplete.len() < msg.tool_calls.len() || msg.has_text() || msg.has_raw_content() {
                    let mut kept = msg.clone();
                    kept.tool_calls.retain(|c| !incomplete.contains(&c.id));
                    fixed.push(kept);
                    issues.push(SanitizationIssue::new(
                        IssueType::IncompleteToolCall,
                        Some(index),
                        IssueAction::RemovedToolCalls,
                        format!("Removed {} incomplete tool call(s): {ids}", incomplete.len()),
                    ));
                } else {
                    issues.push(SanitizationIssue::new(
                        IssueType::IncompleteToolCall,
                        Some(index),
                        IssueAction::RemovedMessage,
                        format!("Removed message with only incomplete tool calls: {ids}"),
                    ));
                }
            }
            Role::Tool => {
                let id = msg.tool_call_id.as_deref().unwrap_or_default();
                let matched = fixed.iter().rev().any(|earlier| {
                    earlier.role == Role::Assistant && earlier.tool_calls.iter().any(|c| c.id == id)
                });
                if matched {
                    fixed.push(msg.clone());
                } else {
                    issues.push(SanitizationIssue::new(
                        IssueType::OrphanedToolResult,
                        Some(index),
                        IssueAction::RemovedMessage,
                        format!("Removed orphaned tool result for {id}"),
                    ));
                }
            }
            _ => fixed.push(msg.clone()),
        }
    }

    fixed
}

/// 人类可读的问题摘要（用于日志）
pub fn format_issues(issues: &[SanitizationIssue]) -> String {
    if issues.is_empty() {
        return "No issues found".to_string();
    }
    let parts: Vec<String> = issues
        .iter()
        .map(|i| format!("[{}] {}", i.issue_type.as_str(), i.details))
        .collect();
    format!("Sanitized {} issue(s): {}", issues.len(), parts.join("; "))
}
