//! 执行引擎
//!
//! invoke(tool, args, budget, authorizations)：预检参数 -> 计费闸门 -> 在独立任务中带超时执行 -> 分类故障。
//! 每次尝试（含失败）恰好产生一条 ExecutionRecord，并输出结构化审计日志（JSON）；
//! 预检失败直接返回错误，不产生记录。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::time::timeout;
use uuid::Uuid;

use crate::core::{Authorizations, ConductorError, ExecutionRecord, FailureKind, Outcome};
use crate::tools::ToolRegistry;

/// 执行引擎：持有只读注册表，对每次调用施加预算超时
pub struct ExecutionEngine {
    registry: Arc<ToolRegistry>,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 执行一次尝试；Err 只可能是预检错误（SchemaError / UnknownToolError）
    pub async fn invoke(
        &self,
        tool_name: &str,
        args: Value,
        budget: Duration,
        authorizations: &Authorizations,
        attempt: u32,
    ) -> Result<ExecutionRecord, ConductorError> {
        self.registry.validate_args(tool_name, &args)?;
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| ConductorError::UnknownTool(tool_name.to_string()))?;

        let started_at = Utc::now();
        let start = Instant::now();
        let preview = args_preview(&args);

        let outcome = if tool.descriptor().is_metered() && !authorizations.is_authorized(tool_name) {
            Outcome::Failure {
                kind: FailureKind::CostGate,
                message: ConductorError::CostGate(tool_name.to_string()).to_string(),
            }
        } else {
            let call_args = args.clone();
            let mut handle = tokio::spawn(async move { tool.execute(call_args).await });
            match timeout(budget, &mut handle).await {
                Ok(Ok(Ok(output))) => Outcome::Success { output },
                Ok(Ok(Err(fault))) => Outcome::Failure {
                    kind: normalize_kind(fault.kind),
                    message: fault.message,
                },
                Ok(Err(join_err)) => Outcome::Failure {
                    kind: FailureKind::Fatal,
                    message: format!("tool task failed: {}", join_err),
                },
                Err(_) => {
                    handle.abort();
                    Outcome::Failure {
                        kind: FailureKind::Timeout,
                        message: ConductorError::Timeout {
                            tool: tool_name.to_string(),
                            budget_ms: budget.as_millis() as u64,
                        }
                        .to_string(),
                    }
                }
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let (ok, result) = match &outcome {
            Outcome::Success { .. } => (true, "ok".to_string()),
            Outcome::Failure { kind, .. } => (false, kind.to_string()),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "attempt": attempt,
            "ok": ok,
            "outcome": result,
            "duration_ms": duration_ms,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        Ok(ExecutionRecord {
            id: Uuid::new_v4(),
            tool: tool_name.to_string(),
            args,
            started_at,
            attempt,
            outcome,
            duration_ms,
        })
    }
}

/// 工具自报的预检类错误归一到执行期分类
fn normalize_kind(kind: FailureKind) -> FailureKind {
    match kind {
        FailureKind::Schema => FailureKind::Input,
        FailureKind::UnknownTool | FailureKind::CostGate => FailureKind::Fatal,
        other => other,
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
