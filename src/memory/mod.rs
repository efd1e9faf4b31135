//! 记忆层：对话消息模型、任务清单

pub mod conversation;
pub mod todo;

pub use conversation::{Message, Role, ToolCallRequest};
pub use todo::{TodoError, TodoItem, TodoList, TodoPriority, TodoStatus};
