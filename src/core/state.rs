//! 运行状态：RunState 状态机、TaskRun、ExecutionRecord
//!
//! TaskRun 由 Orchestrator 独占；records 只追加不修改，终态时整份 TaskRun 归档为 JSON，
//! 作为完整的审计轨迹。

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::FailureKind;
use crate::directive::Lesson;

/// 决策循环状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Planning,
    Executing,
    Correcting,
    AwaitingClarification,
    AwaitingAuthorization,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planning => "PLANNING",
            Self::Executing => "EXECUTING",
            Self::Correcting => "CORRECTING",
            Self::AwaitingClarification => "AWAITING_CLARIFICATION",
            Self::AwaitingAuthorization => "AWAITING_AUTHORIZATION",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// 单次调用结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { output: Value },
    Failure { kind: FailureKind, message: String },
}

/// 执行记录：每次调用尝试（含失败）恰好一条
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub tool: String,
    pub args: Value,
    pub started_at: DateTime<Utc>,
    /// 同一计划动作内的第几次尝试（从 1 开始）
    pub attempt: u32,
    pub outcome: Outcome,
    pub duration_ms: u64,
}

impl ExecutionRecord {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            Outcome::Failure { kind, .. } => Some(*kind),
            Outcome::Success { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<Failure> {
        match &self.outcome {
            Outcome::Failure { kind, message } => Some(Failure {
                tool: self.tool.clone(),
                args: self.args.clone(),
                kind: *kind,
                message: message.clone(),
            }),
            Outcome::Success { .. } => None,
        }
    }
}

/// 一次失败的视图：来自执行记录，或来自预检拒绝（无执行记录）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub tool: String,
    pub args: Value,
    pub kind: FailureKind,
    pub message: String,
}

/// 决策器选中的工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedCall {
    pub tool: String,
    pub args: Value,
}

/// 预检拒绝：参数未通过 schema，未消耗执行次数
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreflightRejection {
    pub tool: String,
    pub args: Value,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// 计费工具的人工授权
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Authorization {
    pub tool: String,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
}

/// 本次运行内已授权的计费工具集合
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Authorizations(HashMap<String, Authorization>);

impl Authorizations {
    pub fn grant(&mut self, tool: impl Into<String>, granted_by: impl Into<String>) {
        let tool = tool.into();
        self.0.insert(
            tool.clone(),
            Authorization {
                tool,
                granted_by: granted_by.into(),
                granted_at: Utc::now(),
            },
        );
    }

    pub fn is_authorized(&self, tool: &str) -> bool {
        self.0.contains_key(tool)
    }

    pub fn get(&self, tool: &str) -> Option<&Authorization> {
        self.0.get(tool)
    }
}

/// 一次指令运行
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub directive_id: String,
    /// 加载指令时的版本号，提交 Lesson 时作为乐观锁基线
    pub directive_revision: u64,
    pub state: RunState,
    pub records: Vec<ExecutionRecord>,
    pub artifacts: BTreeMap<String, Value>,
    pub authorizations: Authorizations,
    /// 纠错产生的参数覆盖：工具名 -> 参数
    pub arg_overrides: HashMap<String, Map<String, Value>>,
    /// 纠错产生的工具替换：原工具 -> 替代工具
    pub substitutions: HashMap<String, String>,
    pub pending_lessons: Vec<Lesson>,
    pub committed_lessons: Vec<Lesson>,
    pub rejections: Vec<PreflightRejection>,
    /// 已接受的自动修正次数（人工澄清后清零）
    pub corrections: usize,
    /// 等待执行（或授权后重新执行）的调用
    pub pending_call: Option<PlannedCall>,
    /// 进入 Correcting / AwaitingClarification 的失败
    pub pending_failure: Option<Failure>,
    /// 挂起或终止原因（澄清问题、授权说明、失败原因）
    pub reason: Option<String>,
    /// Lesson 提交失败时的说明；运行本身仍为 Succeeded
    pub commit_error: Option<String>,
    pub steps: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    pub fn new(directive_id: impl Into<String>, directive_revision: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            directive_id: directive_id.into(),
            directive_revision,
            state: RunState::Planning,
            records: Vec::new(),
            artifacts: BTreeMap::new(),
            authorizations: Authorizations::default(),
            arg_overrides: HashMap::new(),
            substitutions: HashMap::new(),
            pending_lessons: Vec::new(),
            committed_lessons: Vec::new(),
            rejections: Vec::new(),
            corrections: 0,
            pending_call: None,
            pending_failure: None,
            reason: None,
            commit_error: None,
            steps: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn records_for<'a>(&'a self, tool: &'a str) -> impl Iterator<Item = &'a ExecutionRecord> + 'a {
        self.records.iter().filter(move |r| r.tool == tool)
    }

    /// 当前工具名在替换后的实际工具
    pub fn effective_tool<'a>(&'a self, tool: &'a str) -> &'a str {
        self.substitutions
            .get(tool)
            .map(String::as_str)
            .unwrap_or(tool)
    }

    pub fn missing_outputs<'a>(&self, outputs: &'a [String]) -> Vec<&'a String> {
        outputs
            .iter()
            .filter(|o| !self.artifacts.contains_key(o.as_str()))
            .collect()
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = RunState::Failed;
        self.reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
    }
}
