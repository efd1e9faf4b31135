//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__SESSION__BACKEND=file`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::RetryConfig;
use crate::session::DEFAULT_SESSION_DIR;
use crate::tools::{ExecutorConfig, DEFAULT_MAX_CONCURRENT_TOOLS, DEFAULT_MAX_DEPTH};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub session: SessionSection,
    pub tools: ToolsSection,
    pub retry: RetrySection,
}

/// [app] 段：应用名、默认 Agent、迭代与委派深度上限
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    #[serde(default = "default_agent")]
    pub default_agent: String,
    /// 单次运行最多的模型调用轮数
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            default_agent: default_agent(),
            max_iterations: default_max_iterations(),
            max_depth: default_max_depth(),
        }
    }
}

fn default_agent() -> String {
    "main".to_string()
}

fn default_max_iterations() -> usize {
    20
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

/// 事件日志后端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    /// 不持久化
    None,
    Memory,
    #[default]
    File,
}

/// [session] 段：事件日志后端与目录
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default)]
    pub backend: SessionBackend,
    #[serde(default = "default_session_dir")]
    pub dir: PathBuf,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            backend: SessionBackend::default(),
            dir: default_session_dir(),
        }
    }
}

fn default_session_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SESSION_DIR)
}

/// [tools] 段：工具超时、瞬时错误重试、并发上限
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            retry_count: default_retry_count(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_concurrent_tools: default_max_concurrent_tools(),
        }
    }
}

impl ToolsSection {
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            timeout: Duration::from_secs(self.tool_timeout_secs),
            retry_count: self.retry_count,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_concurrent: self.max_concurrent_tools.max(1),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_retry_count() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_max_concurrent_tools() -> usize {
    DEFAULT_MAX_CONCURRENT_TOOLS
}

/// [retry] 段：模型调用的限流退避
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    #[serde(default = "default_respect_retry_after")]
    pub respect_retry_after: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_factor: default_jitter_factor(),
            respect_retry_after: default_respect_retry_after(),
        }
    }
}

impl RetrySection {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            jitter_factor: self.jitter_factor.clamp(0.0, 1.0),
            respect_retry_after: self.respect_retry_after,
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_jitter_factor() -> f64 {
    0.3
}

fn default_respect_retry_after() -> bool {
    true
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
