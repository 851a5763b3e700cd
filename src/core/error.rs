//! 错误分类与工具故障
//!
//! ConductorError 覆盖注册表、指令存储、执行引擎三层的全部错误；ToolFault 是工具自身返回的已分类故障，
//! 由 ExecutionEngine 写入 ExecutionRecord，再由 Orchestrator 按 FailureKind 决定重试 / 纠错 / 挂起 / 终止。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 运行过程中可能出现的错误（预检、存储、执行、配置等）
#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("Schema error for tool '{tool}': {reason}")]
    Schema { tool: String, reason: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Duplicate tool with incompatible descriptor: {0}")]
    DuplicateTool(String),

    #[error("Directive not found: {0}")]
    DirectiveNotFound(String),

    #[error("Concurrent amendment of directive '{id}': expected revision {expected}, found {found}")]
    ConcurrentAmendment { id: String, expected: u64, found: u64 },

    #[error("Directive already exists: {0}")]
    DirectiveExists(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Input error: {0}")]
    Input(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Tool timeout: {tool} exceeded {budget_ms}ms")]
    Timeout { tool: String, budget_ms: u64 },

    #[error("Cost gate: metered tool '{0}' requires authorization")]
    CostGate(String),

    #[error("Run {run} is {state}, cannot apply {resolution}")]
    NotSuspended {
        run: String,
        state: String,
        resolution: String,
    },

    #[error("Directive parse error: {0}")]
    Parse(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ConductorError {
    /// 映射到失败分类；非执行类错误（存储、配置）返回 None
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Schema { .. } => Some(FailureKind::Schema),
            Self::UnknownTool(_) => Some(FailureKind::UnknownTool),
            Self::Transient(_) => Some(FailureKind::Transient),
            Self::Input(_) => Some(FailureKind::Input),
            Self::Fatal(_) => Some(FailureKind::Fatal),
            Self::Timeout { .. } => Some(FailureKind::Timeout),
            Self::CostGate(_) => Some(FailureKind::CostGate),
            _ => None,
        }
    }
}

/// 执行失败分类（写入 ExecutionRecord，决定 Orchestrator 的状态迁移）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 网络 / 限流，可退避重试
    Transient,
    /// 参数错误，不重试，交给纠错
    Input,
    /// 内部错误，终止运行
    Fatal,
    /// 超出单次调用时间预算，按 Transient 处理
    Timeout,
    /// 计费工具缺少授权，挂起等待人工
    CostGate,
    /// 预检：参数不符合 schema
    Schema,
    /// 预检：工具未注册
    UnknownTool,
}

impl FailureKind {
    /// 是否允许在 Executing 内原地退避重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Input => "input",
            Self::Fatal => "fatal",
            Self::Timeout => "timeout",
            Self::CostGate => "cost_gate",
            Self::Schema => "schema",
            Self::UnknownTool => "unknown_tool",
        };
        f.write_str(s)
    }
}

/// 工具返回的已分类故障
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFault {
    pub kind: FailureKind,
    pub message: String,
}

impl ToolFault {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Input,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ToolFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
