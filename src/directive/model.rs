//! 指令数据模型：Directive、Lesson、修订记录
//!
//! 修订只追加：Lesson 合并进 history 与 edge_cases，原有文字永不被替换。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 声明的输入；value 为空时需由运行方提供
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredInput {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeCase {
    pub key: String,
    pub note: String,
}

impl EdgeCase {
    pub fn new(key: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            note: note.into(),
        }
    }
}

/// Lesson 类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonKind {
    /// 发现的约束
    Constraint,
    /// 新的边界情况
    EdgeCase,
    /// 修正后的参数
    CorrectedParameter,
    /// 改用替代工具
    AlternateTool,
}

impl LessonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Constraint => "constraint",
            Self::EdgeCase => "edge_case",
            Self::CorrectedParameter => "corrected_parameter",
            Self::AlternateTool => "alternate_tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "constraint" => Some(Self::Constraint),
            "edge_case" => Some(Self::EdgeCase),
            "corrected_parameter" => Some(Self::CorrectedParameter),
            "alternate_tool" => Some(Self::AlternateTool),
            _ => None,
        }
    }
}

/// 从一次失败中得到的结构化修订
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub kind: LessonKind,
    pub tool: String,
    pub summary: String,
    pub edge_case: Option<EdgeCase>,
    pub run_id: Option<Uuid>,
    pub learned_at: DateTime<Utc>,
}

impl Lesson {
    pub fn new(kind: LessonKind, tool: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            kind,
            tool: tool.into(),
            summary: summary.into(),
            edge_case: None,
            run_id: None,
            learned_at: Utc::now(),
        }
    }

    pub fn with_edge_case(mut self, edge_case: EdgeCase) -> Self {
        self.edge_case = Some(edge_case);
        self
    }

    pub fn from_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// 修订类型（修订日志的第三列）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisionKind {
    Created,
    OperatorEdit,
    Lesson(LessonKind),
}

impl std::fmt::Display for RevisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::OperatorEdit => f.write_str("operator_edit"),
            Self::Lesson(kind) => write!(f, "lesson/{}", kind.as_str()),
        }
    }
}

impl std::str::FromStr for RevisionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "operator_edit" => Ok(Self::OperatorEdit),
            other => other
                .strip_prefix("lesson/")
                .and_then(LessonKind::parse)
                .map(Self::Lesson)
                .ok_or_else(|| format!("unknown revision kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub number: u64,
    pub at: DateTime<Utc>,
    pub kind: RevisionKind,
    pub summary: String,
}

/// 结构化任务说明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub id: String,
    /// 乐观并发控制的版本号；每次成功修订 +1
    pub revision: u64,
    pub goal: String,
    pub inputs: Vec<DeclaredInput>,
    /// 允许使用的工具（有序）
    pub tools: Vec<String>,
    pub outputs: Vec<String>,
    pub edge_cases: Vec<EdgeCase>,
    pub history: Vec<Revision>,
}

impl Directive {
    /// 新草稿（revision 0，尚未入库）
    pub fn draft(id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: 0,
            goal: goal.into(),
            inputs: Vec::new(),
            tools: Vec::new(),
            outputs: Vec::new(),
            edge_cases: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn input(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.inputs.push(DeclaredInput {
            name: name.into(),
            value: value.map(str::to_string),
        });
        self
    }

    pub fn tool(mut self, name: impl Into<String>) -> Self {
        self.tools.push(name.into());
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn edge_case(mut self, key: impl Into<String>, note: impl Into<String>) -> Self {
        self.edge_cases.push(EdgeCase::new(key, note));
        self
    }

    pub fn edge_case_note(&self, key: &str) -> Option<&str> {
        self.edge_cases
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.note.as_str())
    }

    pub(crate) fn push_revision(&mut self, kind: RevisionKind, summary: impl Into<String>) {
        self.revision += 1;
        self.history.push(Revision {
            number: self.revision,
            at: Utc::now(),
            kind,
            summary: summary.into(),
        });
    }

    /// 合并 Lesson：追加修订日志，必要时追加边界情况；同键不同内容时以修订号区分，旧条目保留
    pub fn apply_lesson(&mut self, lesson: &Lesson) {
        self.push_revision(
            RevisionKind::Lesson(lesson.kind),
            format!("[{}] {}", lesson.tool, lesson.summary),
        );
        if let Some(edge) = &lesson.edge_case {
            let duplicate = self
                .edge_cases
                .iter()
                .any(|e| e.key == edge.key && e.note == edge.note);
            if duplicate {
                return;
            }
            let key = if self.edge_case_note(&edge.key).is_some() {
                format!("{} (r{})", edge.key, self.revision)
            } else {
                edge.key.clone()
            };
            self.edge_cases.push(EdgeCase::new(key, edge.note.clone()));
        }
    }
}

/// 人工批准覆盖已有指令的凭证；只应由面向操作员的入口（CLI）构造
#[derive(Debug, Clone)]
pub struct OperatorApproval {
    pub operator: String,
    pub approved_at: DateTime<Utc>,
}

impl OperatorApproval {
    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            approved_at: Utc::now(),
        }
    }
}
