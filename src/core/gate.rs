//! 人工闸门：计费授权与澄清
//!
//! Orchestrator 在 AwaitingAuthorization / AwaitingClarification 时询问 HumanGate。
//! 闸门可以立即答复，也可以 Defer：运行挂起并归档，之后通过 Orchestrator::resume 继续。

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

use crate::core::{ConductorError, TaskRun};
use crate::tools::ToolDescriptor;

#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizationDecision {
    Grant { by: String },
    Deny { reason: String },
    Defer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClarificationAnswer {
    /// 补充参数：写入产物（同名参数随后按名绑定）
    Provide(Map<String, Value>),
    Abandon { reason: String },
    Defer,
}

/// 挂起运行的外部答复（resume 使用）
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Grant { by: String },
    Deny { reason: String },
    Provide(Map<String, Value>),
    Abandon { reason: String },
}

impl Resolution {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Grant { .. } => "grant",
            Self::Deny { .. } => "deny",
            Self::Provide(_) => "clarification",
            Self::Abandon { .. } => "abandon",
        }
    }
}

#[async_trait]
pub trait HumanGate: Send + Sync {
    async fn authorize(&self, run: &TaskRun, tool: &ToolDescriptor) -> AuthorizationDecision;

    async fn clarify(&self, run: &TaskRun, question: &str) -> ClarificationAnswer;
}

/// 非交互闸门：只放行配置中预授权的计费工具，其余一律挂起
#[derive(Debug, Default)]
pub struct PolicyGate {
    preauthorized: HashSet<String>,
}

impl PolicyGate {
    pub fn new(preauthorized: impl IntoIterator<Item = String>) -> Self {
        Self {
            preauthorized: preauthorized.into_iter().collect(),
        }
    }
}

#[async_trait]
impl HumanGate for PolicyGate {
    async fn authorize(&self, _run: &TaskRun, tool: &ToolDescriptor) -> AuthorizationDecision {
        if self.preauthorized.contains(&tool.name) {
            AuthorizationDecision::Grant {
                by: "policy".to_string(),
            }
        } else {
            AuthorizationDecision::Defer
        }
    }

    async fn clarify(&self, _run: &TaskRun, _question: &str) -> ClarificationAnswer {
        ClarificationAnswer::Defer
    }
}

/// 解析 `key=value` 列表；value 能按 JSON 解析时取 JSON 值，否则作为字符串
pub fn parse_assignments<S: AsRef<str>>(items: &[S]) -> Result<Map<String, Value>, ConductorError> {
    let mut map = Map::new();
    for item in items {
        let item = item.as_ref();
        let (key, raw) = item
            .split_once('=')
            .ok_or_else(|| ConductorError::Parse(format!("expected key=value, got '{}'", item)))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ConductorError::Parse(format!("empty key in '{}'", item)));
        }
        let value = serde_json::from_str::<Value>(raw.trim())
            .unwrap_or_else(|_| Value::String(raw.trim().to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

/// 交互闸门：在终端提示并读取一行答复
pub struct ConsoleGate {
    operator: String,
    reader: Mutex<Box<dyn AsyncBufRead + Unpin + Send>>,
}

impl ConsoleGate {
    pub fn stdin(operator: impl Into<String>) -> Self {
        Self::from_reader(operator, BufReader::new(tokio::io::stdin()))
    }

    pub fn from_reader(operator: impl Into<String>, reader: impl AsyncBufRead + Unpin + Send + 'static) -> Self {
        Self {
            operator: operator.into(),
            reader: Mutex::new(Box::new(reader)),
        }
    }

    /// EOF 或读取失败返回 None
    async fn read_answer(&self) -> Option<String> {
        let mut line = String::new();
        let mut reader = self.reader.lock().await;
        match reader.read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => Some(line.trim().to_string()),
            Err(e) => {
                tracing::warn!("console gate read failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl HumanGate for ConsoleGate {
    async fn authorize(&self, run: &TaskRun, tool: &ToolDescriptor) -> AuthorizationDecision {
        println!(
            "[run {}] `{}` is a metered tool. Authorize this run to call it? [y]es / [n]o / [l]ater",
            run.id, tool.name
        );
        match self.read_answer().await.as_deref() {
            Some("y") | Some("yes") => AuthorizationDecision::Grant {
                by: self.operator.clone(),
            },
            Some("n") | Some("no") => AuthorizationDecision::Deny {
                reason: format!("{} declined `{}`", self.operator, tool.name),
            },
            _ => AuthorizationDecision::Defer,
        }
    }

    async fn clarify(&self, run: &TaskRun, question: &str) -> ClarificationAnswer {
        println!("[run {}] {}", run.id, question);
        println!("Answer with key=value pairs, `abandon` to stop, or an empty line to decide later.");
        let Some(answer) = self.read_answer().await else {
            return ClarificationAnswer::Defer;
        };
        if answer.is_empty() {
            return ClarificationAnswer::Defer;
        }
        if answer == "abandon" {
            return ClarificationAnswer::Abandon {
                reason: format!("abandoned by {}", self.operator),
            };
        }
        let items: Vec<&str> = answer.split_whitespace().collect();
        match parse_assignments(&items) {
            Ok(values) => ClarificationAnswer::Provide(values),
            Err(e) => {
                tracing::warn!("unreadable clarification: {}", e);
                ClarificationAnswer::Defer
            }
        }
    }
}
