//! 会话恢复集成测试：JSONL 事件日志 → 回放 → 清洗

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hive::memory::{Message, Role, ToolCallRequest};
    use hive::session::{
        sanitize, sanitize_messages, EventLogger, EventStore, FileEventStore, IssueAction,
        IssueType, SessionManager, TODO_WRITE_TOOL,
    };
    use serde_json::json;

    fn file_store(dir: &tempfile::TempDir) -> Arc<FileEventStore> {
        Arc::new(FileEventStore::new(dir.path()))
    }

    #[tokio::test]
    async fn test_crash_mid_turn_recovers_resumable_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let logger = EventLogger::new(store.clone(), "crash");

        logger.log_agent_start("main", 0, Some("summarise")).await;
        logger.log_user_message("summarise the repo").await;
        logger
            .log_assistant_message("main", Some("Reading files".into()), None, None)
            .await;
        logger.log_tool_call("main", "read", "r1", json!({"path": "a"})).await;
        logger.log_tool_call("main", "read", "r2", json!({"path": "b"})).await;
        logger.log_tool_result("r1", json!({"content": "alpha"})).await;
        // 进程在 r2 返回前崩溃

        let manager = SessionManager::new(file_store(&dir));
        let result = manager.recover_session_detailed("crash").await.unwrap();
        assert_eq!(
            result.messages,
            vec![
                Message::user("summarise the repo"),
                Message::assistant("Reading files"),
                Message::assistant_tool_calls(vec![ToolCallRequest::new(
                    "r1",
                    "read",
                    r#"{"path":"a"}"#
                )]),
                Message::tool("r1", "alpha"),
            ]
        );
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].issue_type, IssueType::IncompleteToolCall);
        assert_eq!(result.issues[0].action, IssueAction::RemovedToolCalls);

        let again = sanitize_messages(result.messages.clone());
        assert!(again.issues.is_empty());
        assert_eq!(again.messages, result.messages);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let logger = EventLogger::new(store.clone(), "torn");
        logger.log_user_message("hello").await;

        let path = dir.path().join("torn").join("events.jsonl");
        let mut data = std::fs::read_to_string(&path).unwrap();
        data.push_str("{\"type\":\"assistant\",\"timest\n");
        data.push_str("not json at all\n");
        std::fs::write(&path, data).unwrap();
        logger
            .log_assistant_message("main", Some("hi".into()), None, None)
            .await;

        let events = store.read_events("torn").await.unwrap();
        assert_eq!(events.len(), 2);
        let messages = SessionManager::new(store).recover_session("torn").await.unwrap();
        assert_eq!(messages, vec![Message::user("hello"), Message::assistant("hi")]);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let a = EventLogger::new(store.clone(), "alpha");
        let b = EventLogger::new(store.clone(), "beta");

        let writes = (0..20).map(|i| {
            let (a, b) = (a.clone(), b.clone());
            async move {
                a.log_user_message(format!("a{i}")).await;
                b.log_user_message(format!("b{i}")).await;
            }
        });
        futures_util::future::join_all(writes).await;

        let alpha = store.read_events("alpha").await.unwrap();
        let beta = store.read_events("beta").await.unwrap();
        assert_eq!(alpha.len(), 20);
        assert_eq!(beta.len(), 20);
        assert_eq!(store.list_sessions().await.unwrap(), vec!["alpha", "beta"]);

        store.delete_session("alpha").await.unwrap();
        assert!(!store.session_exists("alpha").await.unwrap());
        assert!(store.session_exists("beta").await.unwrap());
    }

    #[tokio::test]
    async fn test_todos_recovered_from_last_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = file_store(&dir);
        let logger = EventLogger::new(store.clone(), "todo");
        logger
            .log_tool_call(
                "main",
                TODO_WRITE_TOOL,
                "t1",
                json!({"todos": [
                    {"content": "Draft", "status": "completed", "activeForm": "Drafting"},
                    {"content": "Review", "status": "in_progress", "activeForm": "Reviewing"}
                ]}),
            )
            .await;
        logger.log_tool_result("t1", json!({"content": "ok"})).await;

        let todos = SessionManager::new(store).recover_todos("todo").await;
        let contents: Vec<&str> = todos.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["Draft", "Review"]);
    }

    #[test]
    fn test_recovery_never_fails_on_garbage() {
        for raw in [
            json!(null),
            json!([]),
            json!("text"),
            json!({"role": "user"}),
            json!([null, 1, {"role": "wizard", "content": "x"}, {"content": "no role"}]),
        ] {
            let result = sanitize(&raw);
            assert!(result
                .messages
                .iter()
                .all(|m| m.role != Role::Tool || m.tool_call_id.is_some()));
            let second = sanitize_messages(result.messages.clone());
            assert!(second.issues.is_empty(), "not idempotent for {raw}");
        }
    }

    #[test]
    fn test_orphan_and_empty_messages_are_dropped() {
        let raw = json!([
            {"role": "user", "content": "hi"},
            {"role": "tool", "tool_call_id": "ghost", "content": "boo"},
            {"role": "assistant", "content": ""},
            {"role": "assistant", "content": "hello"}
        ]);
        let result = sanitize(&raw);
        assert_eq!(
            result.messages,
            vec![Message::user("hi"), Message::assistant("hello")]
        );
        let types: Vec<IssueType> = result.issues.iter().map(|i| i.issue_type).collect();
        assert!(types.contains(&IssueType::OrphanedToolResult));
        assert!(types.contains(&IssueType::EmptyMessage));
    }
}
