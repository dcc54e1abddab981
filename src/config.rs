//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FLOWPILOT__*` 覆盖（双下划线表示嵌套，如 `FLOWPILOT__AGENT__MAX_STEPS=10`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub remote: RemoteSection,
    pub agent: AgentSection,
    pub store: StoreSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai / mock；openai 需要 OPENAI_API_KEY，缺失时回退到 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次 Planner 调用超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [remote] 段：远端浏览器工具面
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSection {
    #[serde(default = "default_mcp_url")]
    pub mcp_url: String,
    /// 单次远端调用超时（秒）
    #[serde(default = "default_remote_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            mcp_url: default_mcp_url(),
            request_timeout_secs: default_remote_timeout_secs(),
        }
    }
}

fn default_mcp_url() -> String {
    "https://browserbase-mcp-server.vercel.app/api/mcp".to_string()
}

fn default_remote_timeout_secs() -> u64 {
    120
}

/// [agent] 段：步数上限、单步重试预算、退避与提示词窗口
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_step_retry_budget")]
    pub step_retry_budget: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            step_retry_budget: default_step_retry_budget(),
            retry_backoff_ms: default_retry_backoff_ms(),
            history_window: default_history_window(),
        }
    }
}

fn default_max_steps() -> usize {
    30
}

fn default_step_retry_budget() -> u32 {
    crate::core::recovery::DEFAULT_STEP_RETRY_BUDGET
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_history_window() -> usize {
    crate::react::loop_::DEFAULT_HISTORY_WINDOW
}

/// [store] 段：sqlite（需 `async-sqlite` feature）或 memory
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            database_path: default_database_path(),
        }
    }
}

fn default_store_backend() -> String {
    "sqlite".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("workflows.db")
}

/// 从 config 目录加载配置，环境变量 FLOWPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FLOWPILOT__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("FLOWPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
