//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，
//! 如 `HIVE__BREAKER__FAILURE_THRESHOLD=3`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub trace: TraceSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// [breaker] 段：熔断阈值与冷却
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSection {
    /// 连续失败多少次后打开熔断
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    /// 打开后的冷却时长（秒）
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// 半开状态下需要连续成功多少次才关闭
    #[serde(default = "default_half_open_quota")]
    pub half_open_quota: usize,
}

fn default_failure_threshold() -> usize {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_half_open_quota() -> usize {
    2
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            half_open_quota: default_half_open_quota(),
        }
    }
}

/// [cache] 段：L1 容量与 TTL、持久层调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// L1 最大条目数
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// 默认缓存 TTL（秒）
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// 后台清扫间隔（秒）
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// 单次持久层调用超时（秒），超时按熔断失败计
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,
}

fn default_max_entries() -> usize {
    1000
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_store_timeout_secs() -> u64 {
    10
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            default_ttl_secs: default_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            store_timeout_secs: default_store_timeout_secs(),
        }
    }
}

/// [orchestrator] 段：并发度、计划规模与各类超时
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// 同时执行的子任务上限
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// 单个计划的子任务上限，超出截断
    #[serde(default = "default_max_subtasks")]
    pub max_subtasks: usize,
    /// 单次 LLM 调用超时（秒）
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    /// 单次技能调用超时（秒）
    #[serde(default = "default_skill_timeout_secs")]
    pub skill_timeout_secs: u64,
    /// 会话历史保留条数
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_max_parallel() -> usize {
    4
}

fn default_max_subtasks() -> usize {
    16
}

fn default_llm_timeout_secs() -> u64 {
    60
}

fn default_skill_timeout_secs() -> u64 {
    30
}

fn default_history_limit() -> usize {
    20
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_subtasks: default_max_subtasks(),
            llm_timeout_secs: default_llm_timeout_secs(),
            skill_timeout_secs: default_skill_timeout_secs(),
            history_limit: default_history_limit(),
        }
    }
}

/// [trace] 段：成功采样率与输出截断
#[derive(Debug, Clone, Deserialize)]
pub struct TraceSection {
    /// SUCCESS 追踪的持久化采样率（0.0 - 1.0）；失败与超时始终持久化
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// 工具输出的最大保留字符数
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

fn default_sample_rate() -> f64 {
    0.1
}

fn default_max_output_chars() -> usize {
    2000
}

impl Default for TraceSection {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

/// [store] 段：持久化文档存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    /// SQLite 数据库路径；未设置时退化为内存存储
    pub db_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerSection::default(),
            cache: CacheSection::default(),
            orchestrator: OrchestratorSection::default(),
            trace: TraceSection::default(),
            store: StoreSection::default(),
        }
    }
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

/// 重新从磁盘与环境变量加载配置（调用方可在运行时用新配置重建组件）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
