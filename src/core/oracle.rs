//! 决策器：给定指令与当前运行状态，选出下一步动作
//!
//! DecisionOracle 是可插拔能力（规则、模型、人工均可）；内置 SequentialOracle 按指令声明的工具顺序推进，
//! 参数按名称从纠错覆盖、已有产物（含输入）中绑定。CommandOracle 把每一步交给外部命令（如包装 LLM 的脚本），
//! 其输出由 parse_action 解析。

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::core::{ConductorError, FailureKind, PlannedCall, TaskRun};
use crate::directive::{Directive, Lesson};
use crate::tools::command::classify_exit;
use crate::tools::{ToolDescriptor, ToolRegistry};

/// 决策器的输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// 调用工具
    Invoke { tool: String, args: Value },
    /// 需要人工澄清
    AskClarification { question: String },
    /// 向指令追加一条 Lesson（运行成功后提交）
    AmendDirective { lesson: Lesson },
    /// 声明目标已达成
    Complete,
    /// 放弃运行
    Abort { reason: String },
}

/// 决策器可见的状态（只读）
pub struct DirectiveState<'a> {
    pub directive: &'a Directive,
    pub run: &'a TaskRun,
    pub registry: &'a ToolRegistry,
}

#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn decide(&self, state: &DirectiveState<'_>) -> Result<Action, ConductorError>;
}

/// 解析外部决策器输出：支持 ```json ... ``` 代码块或裸 JSON
pub fn parse_action(output: &str) -> Result<Action, ConductorError> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end < start {
            return Err(ConductorError::Parse(format!("no action JSON in: {}", trimmed)));
        }
        &trimmed[start..=end]
    } else {
        return Err(ConductorError::Parse(format!("no action JSON in: {}", trimmed)));
    };
    serde_json::from_str(json_str)
        .map_err(|e| ConductorError::Parse(format!("{}: {}", e, json_str)))
}

impl From<PlannedCall> for Action {
    fn from(call: PlannedCall) -> Self {
        Action::Invoke {
            tool: call.tool,
            args: call.args,
        }
    }
}

/// 写给外部决策器的上下文
#[derive(Serialize)]
struct OracleContext<'a> {
    directive: &'a Directive,
    run: &'a TaskRun,
    tools: Vec<&'a ToolDescriptor>,
}

/// 外部命令决策器：每一步启动一次命令，stdin 为 {directive, run, tools} 的 JSON，stdout 为一个 Action
///
/// 退出码约定同工具目录：75 临时错误，64/65 输入错误，其它非零为 Fatal。
pub struct CommandOracle {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandOracle {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// ["程序", "参数", ...]；空列表返回 None
    pub fn from_command(command: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program, args.to_vec(), timeout))
    }
}

#[async_trait]
impl DecisionOracle for CommandOracle {
    async fn decide(&self, state: &DirectiveState<'_>) -> Result<Action, ConductorError> {
        let payload = serde_json::to_vec(&OracleContext {
            directive: state.directive,
            run: state.run,
            tools: state.registry.descriptors(),
        })?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&payload).await;
        }
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(ConductorError::Timeout {
                    tool: format!("oracle {}", self.program.display()),
                    budget_ms: self.timeout.as_millis() as u64,
                })
            }
        };

        if !output.status.success() {
            let fault = classify_exit(output.status.code(), &String::from_utf8_lossy(&output.stderr));
            return Err(match fault.kind {
                FailureKind::Transient => ConductorError::Transient(fault.message),
                FailureKind::Input => ConductorError::Input(fault.message),
                _ => ConductorError::Fatal(fault.message),
            });
        }
        let action = parse_action(&String::from_utf8_lossy(&output.stdout))?;
        tracing::debug!(run = %state.run.id, ?action, "oracle decided");
        Ok(action)
    }
}

/// 规则决策器：依次找第一个尚未产出全部输出的工具，绑定参数后调用
#[derive(Debug, Default)]
pub struct SequentialOracle;

impl SequentialOracle {
    fn is_done(state: &DirectiveState<'_>, tool: &str, outputs: &[String]) -> bool {
        if outputs.is_empty() {
            state.run.records_for(tool).any(|r| r.is_success())
        } else {
            outputs.iter().all(|o| state.run.artifacts.contains_key(o))
        }
    }
}

#[async_trait]
impl DecisionOracle for SequentialOracle {
    async fn decide(&self, state: &DirectiveState<'_>) -> Result<Action, ConductorError> {
        let run = state.run;
        for declared in &state.directive.tools {
            let tool = run.effective_tool(declared);
            let descriptor = state.registry.resolve(tool)?;
            if Self::is_done(state, tool, &descriptor.outputs) {
                continue;
            }

            let overrides = run.arg_overrides.get(tool);
            let mut args = Map::new();
            let mut missing = Vec::new();
            for param in &descriptor.params {
                let bound = overrides
                    .and_then(|o| o.get(&param.name))
                    .or_else(|| run.artifacts.get(&param.name));
                match bound {
                    Some(value) => {
                        args.insert(param.name.clone(), value.clone());
                    }
                    None if param.required => missing.push(param.name.as_str()),
                    None => {}
                }
            }
            if !missing.is_empty() {
                return Ok(Action::AskClarification {
                    question: format!(
                        "`{}` needs `{}`, which no input or earlier step provides",
                        tool,
                        missing.join("`, `")
                    ),
                });
            }
            return Ok(Action::Invoke {
                tool: tool.to_string(),
                args: Value::Object(args),
            });
        }

        let missing = run.missing_outputs(&state.directive.outputs);
        if missing.is_empty() {
            Ok(Action::Complete)
        } else {
            Ok(Action::Abort {
                reason: format!(
                    "every permitted tool ran but outputs are missing: {}",
                    missing
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            })
        }
    }
}
