//! 外部命令工具：由工具目录 [[tool]] 注册，运行「程序 + 参数模板」
//!
//! 参数模板中的 {{key}} 从调用参数中取值；完整参数同时以 JSON 写入 stdin。无 shell，直接 exec。
//! 退出码约定：0 成功（stdout 为 JSON 或纯文本），75 临时错误，64/65 参数错误，其它一律 Fatal。
//! 子进程只继承 PATH 与条目声明的环境变量；变量值不进日志。

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::core::ToolFault;
use crate::tools::catalog::CatalogEntry;
use crate::tools::schema::ToolDescriptor;
use crate::tools::Tool;

const EXIT_USAGE: i32 = 64;
const EXIT_DATAERR: i32 = 65;
const EXIT_TEMPFAIL: i32 = 75;
/// stderr 摘要最大字符数
const STDERR_PREVIEW_CHARS: usize = 500;

pub struct CommandTool {
    descriptor: ToolDescriptor,
    program: PathBuf,
    args_template: Vec<String>,
    env_passthrough: Vec<String>,
    workdir: Option<PathBuf>,
}

impl CommandTool {
    pub fn new(entry: &CatalogEntry, program: PathBuf) -> Self {
        Self {
            descriptor: entry.descriptor.clone(),
            program,
            args_template: entry.args.clone(),
            env_passthrough: entry.env.clone(),
            workdir: entry.workdir.clone(),
        }
    }

    /// 替换模板中的 {{key}}
    fn substitute(&self, args: &Value) -> Vec<String> {
        let empty = serde_json::Map::new();
        let obj = args.as_object().unwrap_or(&empty);
        self.args_template
            .iter()
            .map(|tpl| {
                let mut s = tpl.clone();
                for (k, v) in obj {
                    let placeholder = format!("{{{{{}}}}}", k);
                    let val = match v {
                        Value::String(x) => x.clone(),
                        _ => v.to_string(),
                    };
                    s = s.replace(&placeholder, &val);
                }
                s
            })
            .collect()
    }
}

pub(crate) fn classify_exit(code: Option<i32>, stderr: &str) -> ToolFault {
    let detail: String = stderr.trim().chars().take(STDERR_PREVIEW_CHARS).collect();
    match code {
        Some(EXIT_TEMPFAIL) => ToolFault::transient(detail),
        Some(EXIT_USAGE) | Some(EXIT_DATAERR) => ToolFault::input(detail),
        Some(code) => ToolFault::fatal(format!("exit code {}: {}", code, detail)),
        None => ToolFault::fatal(format!("terminated by signal: {}", detail)),
    }
}

fn parse_stdout(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[async_trait]
impl Tool for CommandTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolFault> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.substitute(&args))
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        for name in &self.env_passthrough {
            if let Ok(value) = std::env::var(name) {
                cmd.env(name, value);
            }
        }
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        tracing::debug!(tool = %self.descriptor.name, program = %self.program.display(), "spawning tool");
        let mut child = cmd
            .spawn()
            .map_err(|e| ToolFault::fatal(format!("spawn {} failed: {}", self.program.display(), e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            // 工具可以不读 stdin，写入失败（管道已关闭）不算错误
            let _ = stdin.write_all(args.to_string().as_bytes()).await;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ToolFault::fatal(format!("wait failed: {}", e)))?;

        if output.status.success() {
            Ok(parse_stdout(&output.stdout))
        } else {
            Err(classify_exit(
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }
}
