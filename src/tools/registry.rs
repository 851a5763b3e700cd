//! 工具注册表
//!
//! 所有工具实现 Tool trait（descriptor / execute），由 ToolRegistry 按名注册与解析；
//! 调用前通过 validate_args 做预检，ExecutionEngine 只接收已通过预检的参数。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{ConductorError, ToolFault};
use crate::tools::schema::ToolDescriptor;

/// 工具 trait：描述符（名称、参数、输出、计费类别）与异步执行（args 为 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    /// 执行工具；失败时返回已分类的 ToolFault
    async fn execute(&self, args: Value) -> Result<Value, ToolFault>;

    fn name(&self) -> &str {
        &self.descriptor().name
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名且描述符兼容时视为重复加载，保留原工具
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), ConductorError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), ConductorError> {
        let name = tool.name().to_string();
        if let Some(existing) = self.tools.get(&name) {
            if existing.descriptor().is_compatible(tool.descriptor()) {
                tracing::debug!(tool = %name, "tool already registered, keeping existing");
                return Ok(());
            }
            return Err(ConductorError::DuplicateTool(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<&ToolDescriptor, ConductorError> {
        self.tools
            .get(name)
            .map(|t| t.descriptor())
            .ok_or_else(|| ConductorError::UnknownTool(name.to_string()))
    }

    /// 指令加载时的快速失败检查：所有引用的工具必须已注册
    pub fn resolve_all<'a>(
        &self,
        names: impl IntoIterator<Item = &'a String>,
    ) -> Result<Vec<&ToolDescriptor>, ConductorError> {
        names.into_iter().map(|n| self.resolve(n)).collect()
    }

    pub fn validate_args(&self, name: &str, args: &Value) -> Result<(), ConductorError> {
        let descriptor = self.resolve(name)?;
        descriptor
            .validate(args)
            .map_err(|reason| ConductorError::Schema {
                tool: name.to_string(),
                reason,
            })
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut list: Vec<&ToolDescriptor> = self.tools.values().map(|t| t.descriptor()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// 全部描述符的 JSON（供 CLI 展示或外部决策器理解可用工具）
    pub fn to_schema_json(&self) -> String {
        serde_json::to_string_pretty(&self.descriptors()).unwrap_or_else(|_| "[]".to_string())
    }
}
