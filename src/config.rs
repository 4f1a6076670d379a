//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__REPLAY__MAX_EXPERIENCES=500`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub mcp: McpSection,
    pub ledger: LedgerSection,
    pub replay: ReplaySection,
    pub training: TrainingSection,
    pub logging: LoggingSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [mcp] 段：Agent 调用超时与奖励设定
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpSection {
    /// Agent 调用超时（秒）；0 表示不限时
    pub agent_timeout_secs: Option<u64>,
    /// 经验的基础优先级
    pub base_experience_priority: f64,
    pub success_reward: f64,
    pub failure_reward: f64,
    /// start() 时是否启动后台任务消费者
    pub task_worker: bool,
}

impl Default for McpSection {
    fn default() -> Self {
        Self {
            agent_timeout_secs: Some(30),
            base_experience_priority: 1.0,
            success_reward: 1.0,
            failure_reward: -0.5,
            task_worker: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Memory,
    Sqlite,
}

/// [ledger] 段：持久化后端与重试策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    pub backend: LedgerBackend,
    /// sqlite 后端的数据库文件
    pub sqlite_path: PathBuf,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// 单次持久化尝试的超时
    pub attempt_timeout_ms: u64,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Memory,
            sqlite_path: PathBuf::from("data/hive.db"),
            retry_attempts: 3,
            retry_delay_ms: 1000,
            attempt_timeout_ms: 5000,
        }
    }
}

/// [replay] 段：经验回放缓冲
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplaySection {
    pub max_experiences: usize,
    /// 高优先级经验的阈值
    pub priority_threshold: f64,
    /// reward > 0 时在基础优先级上叠加的加成
    pub positive_reward_bonus: f64,
}

impl Default for ReplaySection {
    fn default() -> Self {
        Self {
            max_experiences: 10_000,
            priority_threshold: 1.0,
            positive_reward_bonus: 0.5,
        }
    }
}

/// [training] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainingSection {
    /// random / priority / balanced
    pub sampling_strategy: String,
    pub sample_size: usize,
    /// 预留，目前不参与计算
    pub learning_rate: f64,
    pub allow_agents: Option<Vec<String>>,
    pub deny_agents: Vec<String>,
    pub priority_threshold: f64,
    /// 周期训练间隔（秒）；不设置则只能手动触发
    pub interval_secs: Option<u64>,
    pub min_experiences: usize,
    pub top_actions: usize,
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            sampling_strategy: "balanced".to_string(),
            sample_size: 100,
            learning_rate: 0.1,
            allow_agents: None,
            deny_agents: Vec::new(),
            priority_threshold: 1.0,
            interval_secs: None,
            min_experiences: 5,
            top_actions: 3,
        }
    }
}

/// [logging] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// RUST_LOG 未设置时使用的级别
    pub level: String,
    /// text / json
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// 加载配置：默认文件 → 可选的指定文件 → 环境变量
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
