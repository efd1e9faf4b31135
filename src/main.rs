//! Hive 会话检查工具
//!
//! 入口：读取某个会话的事件日志，输出清洗后的对话、清洗问题、原始投影是否停在未完成的工具调用，以及恢复的任务清单。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hive::config::load_config;
use hive::session::{
    get_last_tool_call, has_incomplete_tool_call, validate_session_id, FileEventStore,
    SessionManager,
};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "hive")]
#[command(about = "Inspect and recover an agent session from its event log", long_about = None)]
struct Cli {
    /// 会话 id（事件日志目录名）
    session_id: String,

    /// 会话根目录，默认取 [session].dir
    #[arg(long)]
    dir: Option<PathBuf>,

    /// 额外的配置文件
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cli = Cli::parse();
    let config = load_config(cli.config.clone()).context("Failed to load config")?;
    validate_session_id(&cli.session_id).context("Invalid session id")?;

    let dir = cli.dir.unwrap_or(config.session.dir);
    let manager = SessionManager::new(Arc::new(FileEventStore::new(&dir)));

    if !manager
        .session_exists(&cli.session_id)
        .await
        .context("Failed to check session")?
    {
        anyhow::bail!(
            "Session {} not found under {}",
            cli.session_id,
            dir.display()
        );
    }

    let raw = manager
        .project_session(&cli.session_id)
        .await
        .context("Failed to read session events")?;
    let recovered = manager
        .recover_session_detailed(&cli.session_id)
        .await
        .context("Failed to recover session")?;
    let todos = manager.recover_todos(&cli.session_id).await;

    let report = json!({
        "session_id": cli.session_id,
        "messages": recovered.messages,
        "issues": recovered.issues,
        "recovered": recovered.recovered,
        "incomplete_tool_call": has_incomplete_tool_call(&raw),
        "last_tool_call": get_last_tool_call(&raw),
        "todos": todos,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to render report")?
    );

    Ok(())
}
