//! 会话层：事件日志、事件记录器、消息清洗、会话恢复

pub mod event;
pub mod logger;
pub mod manager;
pub mod sanitizer;
pub mod store;

pub use event::{EventPayload, EventRecord, LlmMetadata, SessionEvent, TokenUsage, SYSTEM_AGENT};
pub use logger::EventLogger;
pub use manager::{
    get_last_tool_call, has_incomplete_tool_call, project_events, SessionManager, TODO_WRITE_TOOL,
};
pub use sanitizer::{
    format_issues, sanitize, sanitize_messages, validate_message_structure, IssueAction, IssueType,
    MessageSanitizer, SanitizationIssue, SanitizationResult, VALIDATION_WINDOW,
};
pub use store::{
    EventStore, FileEventStore, InMemoryEventStore, NoopEventStore, StoreError, DEFAULT_SESSION_DIR,
    validate_session_id,
};
