//! 任务清单（TodoWrite 的状态）
//!
//! 写入时校验：最多一个 in_progress、content 不重复、content / activeForm 非空；
//! 恢复时不校验，原样返回日志中最后一次 TodoWrite 的 todos。

use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TodoPriority {
    High,
    #[default]
    Medium,
    Low,
}

/// 单个任务项；activeForm 为进行中时展示的现在进行时描述
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    #[serde(default)]
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
    pub active_form: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TodoPriority>,
}

impl TodoItem {
    pub fn new(content: impl Into<String>, active_form: impl Into<String>, status: TodoStatus) -> Self {
        Self {
            id: String::new(),
            content: content.into(),
            status,
            active_form: active_form.into(),
            priority: None,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TodoError {
    #[error("Only one task can be in_progress at a time (found {0})")]
    MultipleInProgress(usize),

    #[error("Duplicate task content: {0}")]
    DuplicateContent(String),

    #[error("Task {0} has empty content")]
    EmptyContent(usize),

    #[error("Task {0} has empty activeForm")]
    EmptyActiveForm(usize),
}

/// 当前会话的任务清单
#[derive(Clone, Debug, Default)]
pub struct TodoList {
    items: Vec<TodoItem>,
}

impl TodoList {
    pub fn new() -> Self {
        Self::default()
    }

    /// 整体替换清单；校验失败时保持原状态
    pub fn update(&mut self, items: Vec<TodoItem>) -> Result<(), TodoError> {
        validate(&items)?;
        self.items = items
            .into_iter()
            .map(|mut item| {
                if item.id.is_empty() {
                    item.id = generate_id();
                }
                if item.priority.is_none() {
                    item.priority = Some(TodoPriority::default());
                }
                item
            })
            .collect();
        Ok(())
    }

    /// 用恢复得到的快照覆盖，不做校验
    pub fn restore(&mut self, items: Vec<TodoItem>) {
        self.items = items;
    }

    pub fn items(&self) -> &[TodoItem] {
        &self.items
    }

    pub fn in_progress(&self) -> Option<&TodoItem> {
        self.items.iter().find(|i| i.status == TodoStatus::InProgress)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 拼入 prompt 的清单段落
    pub fn to_prompt_section(&self) -> String {
        if self.items.is_empty() {
            return String::new();
        }
        let mut s = String::from("## Current Tasks\n");
        for item in &self.items {
            let mark = match item.status {
                TodoStatus::Completed => "[x]",
                TodoStatus::InProgress => "[>]",
                TodoStatus::Pending => "[ ]",
            };
            s.push_str(&format!("- {} {}\n", mark, item.content));
        }
        s
    }
}

pub fn validate(items: &[TodoItem]) -> Result<(), TodoError> {
    let in_progress = items
        .iter()
        .filter(|i| i.status == TodoStatus::InProgress)
        .count();
    if in_progress > 1 {
        return Err(TodoError::MultipleInProgress(in_progress));
    }

    let mut seen = HashSet::new();
    for (idx, item) in items.iter().enumerate() {
        if item.content.trim().is_empty() {
            return Err(TodoError::EmptyContent(idx));
        }
        if item.active_form.trim().is_empty() {
            return Err(TodoError::EmptyActiveForm(idx));
        }
        if !seen.insert(item.content.as_str()) {
            return Err(TodoError::DuplicateContent(item.content.clone()));
        }
    }
    Ok(())
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}
