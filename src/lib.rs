//! Conductor - 指令路由与自我纠错编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、运行状态机、执行重试与纠错、决策器、人工闸门、运行归档
//! - **directive**: 指令模型、Markdown 格式与带版本的指令存储
//! - **observability**: 日志初始化
//! - **tools**: 工具描述符与注册表、执行引擎、外部命令工具与工具目录

pub mod config;
pub mod core;
pub mod directive;
pub mod observability;
pub mod tools;

pub use crate::core::{Orchestrator, RunState, TaskRun};
pub use crate::directive::{Directive, DirectiveStore};
