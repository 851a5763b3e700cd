//! 工具目录加载器
//!
//! 从 TOML 目录（默认 config/tools.toml）读取 [[tool]] 条目，构建 CommandTool 并注册。

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::ConductorError;
use crate::tools::command::CommandTool;
use crate::tools::schema::ToolDescriptor;
use crate::tools::ToolRegistry;

/// 目录条目：描述符字段 + 命令行
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub descriptor: ToolDescriptor,
    /// 可执行文件；含路径分隔符时相对目录文件所在目录解析
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// 透传给工具进程的环境变量名
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct CatalogToml {
    #[serde(default)]
    tool: Vec<CatalogEntry>,
}

pub fn parse_catalog(text: &str) -> Result<Vec<CatalogEntry>, ConductorError> {
    let parsed: CatalogToml =
        toml::from_str(text).map_err(|e| ConductorError::Config(format!("tool catalog: {}", e)))?;
    Ok(parsed.tool)
}

/// 读取目录文件；文件不存在时返回空目录
pub fn load_catalog(path: &Path) -> Result<Vec<CatalogEntry>, ConductorError> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_catalog(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "tool catalog not found, registry is empty");
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

fn resolve_program(command: &str, base_dir: &Path) -> PathBuf {
    let program = PathBuf::from(command);
    if program.is_relative() && command.contains(std::path::MAIN_SEPARATOR) {
        base_dir.join(program)
    } else {
        program
    }
}

/// 将目录条目注册进注册表；同名不兼容条目返回 DuplicateTool
pub fn register_catalog(
    registry: &mut ToolRegistry,
    entries: &[CatalogEntry],
    base_dir: &Path,
) -> Result<(), ConductorError> {
    for entry in entries {
        let program = resolve_program(&entry.command, base_dir);
        registry.register(CommandTool::new(entry, program))?;
    }
    tracing::info!(count = entries.len(), "tool catalog registered");
    Ok(())
}
