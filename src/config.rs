//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONDUCTOR__*` 覆盖（双下划线表示嵌套，如 `CONDUCTOR__RETRY__MAX_ATTEMPTS=5`）。
//! 所有字段都有默认值，空配置也合法。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::RetryPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub engine: EngineSection,
    pub retry: RetrySection,
    pub tools: ToolsSection,
    pub gate: GateSection,
    pub correction: CorrectionSection,
    pub oracle: OracleSection,
}

/// [app] 段：指令目录、运行归档目录、单次运行的步数上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub directives_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub max_steps: usize,
    /// 人工澄清之间允许的自动修正次数
    pub max_corrections: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            directives_dir: PathBuf::from("directives"),
            runs_dir: PathBuf::from("runs"),
            max_steps: 64,
            max_corrections: 3,
        }
    }
}

/// [engine] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self { tool_timeout_secs: 30 }
    }
}

/// [retry] 段：Transient / Timeout 的退避重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 8000,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 工具目录文件（TOML）
    pub catalog: PathBuf,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            catalog: PathBuf::from("config/tools.toml"),
        }
    }
}

/// [gate] 段：预授权的计费工具；interactive 为 true 时 CLI 在终端询问
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GateSection {
    pub preauthorized: Vec<String>,
    pub interactive: bool,
}

/// [correction] 段：启用的自动修正规则，顺序即优先级
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrectionSection {
    pub rules: Vec<String>,
}

impl Default for CorrectionSection {
    fn default() -> Self {
        Self {
            rules: ["url_normalization", "trim_whitespace", "numeric_coercion", "alternate_tool"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// [oracle] 段：command 为空时使用内置的顺序决策器
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OracleSection {
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for OracleSection {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 60,
        }
    }
}

impl AppConfig {
    pub fn tool_budget(&self) -> Duration {
        Duration::from_secs(self.engine.tool_timeout_secs.max(1))
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle.timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            multiplier: self.retry.multiplier.max(1.0),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }
}

/// 从 config 目录加载配置，环境变量 CONDUCTOR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CONDUCTOR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignored");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONDUCTOR")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("gate.preauthorized")
            .with_list_parse_key("correction.rules")
            .with_list_parse_key("oracle.command"),
    );

    builder.build()?.try_deserialize()
}
