//! 自我纠错：失败分类、修正提议、生成 Lesson；以及瞬时错误的退避重试策略
//!
//! SelfCorrection 按顺序询问 FixRule，取第一个给出的 Fix。修正只能是参数、工具选择或指令文字的变化，
//! 且不得带来额外计费：目标为 metered 工具的修正一律拒绝，交给人工澄清。

use std::time::Duration;

use serde_json::{Map, Value};

use crate::core::{ConductorError, ExecutionRecord, Failure, FailureKind, TaskRun};
use crate::directive::{Directive, EdgeCase, Lesson, LessonKind};
use crate::tools::{ParamType, ToolRegistry};

/// 瞬时错误（Transient / Timeout）的重试策略：指数退避，封顶
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 单个计划动作的最大尝试次数（含首次）
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次尝试失败后、下一次尝试前的等待时间
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = self.initial_backoff.as_millis() as f64 * exp;
        Duration::from_millis(ms as u64).min(self.max_backoff)
    }

    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// 自动修正
#[derive(Debug, Clone, PartialEq)]
pub enum Fix {
    /// 修正参数：args 为修正后的完整参数
    AdjustArgs {
        tool: String,
        args: Map<String, Value>,
        rule: String,
        note: String,
    },
    /// 改用替代工具
    AlternateTool { from: String, to: String },
    /// 仅补充指令文字（约束说明）
    AmendText { note: String },
}

/// 修正规则的上下文
pub struct FixContext<'a> {
    pub directive: &'a Directive,
    pub run: &'a TaskRun,
    pub registry: &'a ToolRegistry,
}

/// 修正规则：只根据失败与上下文给出 Fix，不得执行任何工具
pub trait FixRule: Send + Sync {
    fn name(&self) -> &str;

    fn propose(&self, failure: &Failure, ctx: &FixContext<'_>) -> Option<Fix>;
}

fn args_object(failure: &Failure) -> Map<String, Value> {
    failure.args.as_object().cloned().unwrap_or_default()
}

fn is_argument_failure(kind: FailureKind) -> bool {
    matches!(kind, FailureKind::Input | FailureKind::Schema)
}

/// URL 缺少 scheme 或带空白 / 尖括号 / 引号时规范化为 https://...
pub struct UrlNormalization;

impl UrlNormalization {
    fn normalize(raw: &str) -> Option<String> {
        let trimmed = raw
            .trim()
            .trim_matches(|c| matches!(c, '<' | '>' | '"' | '\''))
            .trim();
        if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
            return None;
        }
        let normalized = if trimmed.contains("://") {
            trimmed.to_string()
        } else if let Some(rest) = trimmed.strip_prefix("//") {
            format!("https://{}", rest)
        } else if trimmed.contains('.') {
            format!("https://{}", trimmed)
        } else {
            return None;
        };
        (normalized != raw).then_some(normalized)
    }
}

impl FixRule for UrlNormalization {
    fn name(&self) -> &str {
        "url_normalization"
    }

    fn propose(&self, failure: &Failure, _ctx: &FixContext<'_>) -> Option<Fix> {
        if !is_argument_failure(failure.kind) {
            return None;
        }
        let mut args = args_object(failure);
        let mut fixed = Vec::new();
        for (key, value) in args.iter_mut() {
            if !key.to_lowercase().contains("url") {
                continue;
            }
            if let Some(normalized) = value.as_str().and_then(Self::normalize) {
                *value = Value::String(normalized);
                fixed.push(key.clone());
            }
        }
        if fixed.is_empty() {
            return None;
        }
        Some(Fix::AdjustArgs {
            tool: failure.tool.clone(),
            args,
            rule: self.name().to_string(),
            note: format!(
                "normalize `{}` before calling `{}`: trim whitespace and quotes, prefix https:// when the scheme is missing",
                fixed.join("`, `"),
                failure.tool
            ),
        })
    }
}

/// 去掉字符串参数首尾空白
pub struct TrimWhitespace;

impl FixRule for TrimWhitespace {
    fn name(&self) -> &str {
        "trim_whitespace"
    }

    fn propose(&self, failure: &Failure, _ctx: &FixContext<'_>) -> Option<Fix> {
        if !is_argument_failure(failure.kind) {
            return None;
        }
        let mut args = args_object(failure);
        let mut fixed = Vec::new();
        for (key, value) in args.iter_mut() {
            if let Some(s) = value.as_str() {
                if s.trim() != s {
                    *value = Value::String(s.trim().to_string());
                    fixed.push(key.clone());
                }
            }
        }
        if fixed.is_empty() {
            return None;
        }
        Some(Fix::AdjustArgs {
            tool: failure.tool.clone(),
            args,
            rule: self.name().to_string(),
            note: format!("trim surrounding whitespace from `{}`", fixed.join("`, `")),
        })
    }
}

/// 声明为数字的参数收到了数字字符串时转为数字（仅 schema 预检失败）
pub struct NumericCoercion;

impl FixRule for NumericCoercion {
    fn name(&self) -> &str {
        "numeric_coercion"
    }

    fn propose(&self, failure: &Failure, ctx: &FixContext<'_>) -> Option<Fix> {
        if failure.kind != FailureKind::Schema {
            return None;
        }
        let descriptor = ctx.registry.resolve(&failure.tool).ok()?;
        let mut args = args_object(failure);
        let mut fixed = Vec::new();
        for (key, value) in args.iter_mut() {
            let Some(spec) = descriptor.param_spec(key) else {
                continue;
            };
            let Some(s) = value.as_str() else {
                continue;
            };
            let coerced = match spec.kind {
                ParamType::Integer => s.trim().parse::<i64>().ok().map(Value::from),
                ParamType::Number => s.trim().parse::<f64>().ok().map(Value::from),
                _ => None,
            };
            if let Some(v) = coerced {
                *value = v;
                fixed.push(key.clone());
            }
        }
        if fixed.is_empty() {
            return None;
        }
        Some(Fix::AdjustArgs {
            tool: failure.tool.clone(),
            args,
            rule: self.name().to_string(),
            note: format!("pass `{}` as numbers, not strings", fixed.join("`, `")),
        })
    }
}

/// 重试耗尽或超时后改用描述符声明的替代工具
pub struct AlternateToolRule;

impl FixRule for AlternateToolRule {
    fn name(&self) -> &str {
        "alternate_tool"
    }

    fn propose(&self, failure: &Failure, ctx: &FixContext<'_>) -> Option<Fix> {
        if !failure.kind.is_retryable() {
            return None;
        }
        // 失败的可能已是替代工具，候选以原工具的描述符为准
        let original = ctx
            .run
            .substitutions
            .iter()
            .find(|(_, to)| **to == failure.tool)
            .map(|(from, _)| from.clone())
            .unwrap_or_else(|| failure.tool.clone());
        let descriptor = ctx.registry.resolve(&original).ok()?;
        descriptor
            .alternates
            .iter()
            .filter(|alt| **alt != failure.tool && **alt != original)
            .find(|alt| {
                ctx.registry
                    .resolve(alt)
                    .map(|d| !d.is_metered())
                    .unwrap_or(false)
            })
            .map(|alt| Fix::AlternateTool {
                from: original.clone(),
                to: alt.clone(),
            })
    }
}

/// 自我纠错记录器
pub struct SelfCorrection {
    rules: Vec<Box<dyn FixRule>>,
}

impl Default for SelfCorrection {
    fn default() -> Self {
        Self {
            rules: vec![
                Box::new(UrlNormalization),
                Box::new(TrimWhitespace),
                Box::new(NumericCoercion),
                Box::new(AlternateToolRule),
            ],
        }
    }
}

impl SelfCorrection {
    pub fn new() -> Self {
        Self::default()
    }

    /// 无内置规则
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: impl FixRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// 按名称启用规则，顺序即优先级；未知名称是配置错误
    pub fn from_rule_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ConductorError> {
        names.iter().try_fold(Self::empty(), |recorder, name| {
            Ok(match name.as_ref() {
                "url_normalization" => recorder.with_rule(UrlNormalization),
                "trim_whitespace" => recorder.with_rule(TrimWhitespace),
                "numeric_coercion" => recorder.with_rule(NumericCoercion),
                "alternate_tool" => recorder.with_rule(AlternateToolRule),
                other => {
                    return Err(ConductorError::Config(format!("unknown fix rule '{}'", other)))
                }
            })
        })
    }

    pub fn classify(&self, record: &ExecutionRecord) -> Option<FailureKind> {
        record.failure_kind()
    }

    /// 依次询问规则；修正若需要额外计费（目标为 metered 工具）或与原参数无差别则丢弃
    pub fn propose_fix(&self, failure: &Failure, ctx: &FixContext<'_>) -> Option<Fix> {
        for rule in &self.rules {
            let Some(fix) = rule.propose(failure, ctx) else {
                continue;
            };
            if !is_cost_free(&fix, ctx.registry) {
                tracing::warn!(rule = rule.name(), tool = %failure.tool, "fix rejected: targets a metered tool");
                continue;
            }
            if let Fix::AdjustArgs { args, .. } = &fix {
                if failure.args.as_object() == Some(args) {
                    continue;
                }
            }
            tracing::info!(rule = rule.name(), tool = %failure.tool, kind = %failure.kind, "fix proposed");
            return Some(fix);
        }
        None
    }

    pub fn to_lesson(&self, failure: &Failure, fix: &Fix) -> Lesson {
        match fix {
            Fix::AdjustArgs { tool, rule, note, .. } => {
                Lesson::new(LessonKind::CorrectedParameter, tool.clone(), note.clone())
                    .with_edge_case(EdgeCase::new(format!("{}: {}", tool, rule), note.clone()))
            }
            Fix::AlternateTool { from, to } => Lesson::new(
                LessonKind::AlternateTool,
                from.clone(),
                format!("fall back to `{}` when `{}` keeps failing ({})", to, from, failure.kind),
            )
            .with_edge_case(EdgeCase::new(
                format!("{}: {}", from, failure.kind),
                format!("use `{}` instead", to),
            )),
            Fix::AmendText { note } => Lesson::new(LessonKind::Constraint, failure.tool.clone(), note.clone())
                .with_edge_case(EdgeCase::new(
                    format!("{}: {}", failure.tool, failure.kind),
                    note.clone(),
                )),
        }
    }
}

fn is_cost_free(fix: &Fix, registry: &ToolRegistry) -> bool {
    let target = match fix {
        Fix::AdjustArgs { tool, .. } => tool,
        Fix::AlternateTool { to, .. } => to,
        Fix::AmendText { .. } => return true,
    };
    registry
        .resolve(target)
        .map(|d| !d.is_metered())
        .unwrap_or(false)
}
