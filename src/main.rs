//! Conductor 命令行入口
//!
//! run / resume 驱动指令运行并打印执行记录；show / create / list 管理指令；tools 查看工具目录。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use conductor::config::{load_config, AppConfig};
use conductor::core::{
    parse_assignments, registry_from_config, ConductorError, ConsoleGate, HumanGate, Orchestrator,
    Outcome, PolicyGate, Resolution, RunState, RunSupervisor, TaskRun,
};
use conductor::directive::{format, DirectiveStore, OperatorApproval};
use conductor::tools::descriptor_schema_json;

/// Conductor - 按指令编排工具调用，失败时自我纠错并把经验写回指令
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// 运行指令
    Run {
        directive: String,
        /// 输入参数，可重复
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// 在终端询问授权与澄清（覆盖 [gate].interactive）
        #[arg(long)]
        interactive: bool,
        /// 以 JSON 输出整个运行
        #[arg(long)]
        json: bool,
    },

    /// 继续一个挂起的运行
    Resume {
        run_id: String,
        #[command(flatten)]
        answer: ResumeAnswer,
        #[arg(long)]
        json: bool,
    },

    /// 显示指令
    Show {
        directive: String,
        #[arg(long)]
        json: bool,
    },

    /// 从 Markdown 文件创建指令
    Create {
        file: PathBuf,
        /// 覆盖已存在的指令（需要 --operator）
        #[arg(long, requires = "operator")]
        overwrite: bool,
        #[arg(long, value_name = "NAME")]
        operator: Option<String>,
    },

    /// 列出全部指令
    List,

    /// 列出工具目录
    Tools {
        /// 输出描述符的 JSON
        #[arg(long)]
        json: bool,
        /// 输出描述符格式的 JSON Schema
        #[arg(long)]
        schema: bool,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ResumeAnswer {
    /// 授权挂起的计费工具
    #[arg(long)]
    grant: bool,
    /// 拒绝授权
    #[arg(long, value_name = "REASON")]
    deny: Option<String>,
    /// 回答澄清问题
    #[arg(long, value_name = "KEY=VALUE", num_args = 1..)]
    provide: Vec<String>,
    /// 放弃运行
    #[arg(long, value_name = "REASON")]
    abandon: Option<String>,
}

fn operator_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "operator".to_string())
}

fn gate_for(cfg: &AppConfig, interactive: bool) -> Arc<dyn HumanGate> {
    if interactive || cfg.gate.interactive {
        Arc::new(ConsoleGate::stdin(operator_name()))
    } else {
        Arc::new(PolicyGate::new(cfg.gate.preauthorized.clone()))
    }
}

/// 只有显式 --overwrite 才携带操作员批准；单独的 --operator 不允许覆盖
fn overwrite_approval(overwrite: bool, operator: Option<String>) -> Option<OperatorApproval> {
    if overwrite {
        operator.map(OperatorApproval::new)
    } else {
        None
    }
}

fn resolution(answer: ResumeAnswer) -> anyhow::Result<Resolution> {
    if answer.grant {
        return Ok(Resolution::Grant { by: operator_name() });
    }
    if let Some(reason) = answer.deny {
        return Ok(Resolution::Deny { reason });
    }
    if let Some(reason) = answer.abandon {
        return Ok(Resolution::Abandon { reason });
    }
    let values = parse_assignments(&answer.provide).context("Invalid --provide")?;
    Ok(Resolution::Provide(values))
}

fn print_run(run: &TaskRun, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }
    println!("run {} [{}] directive {} r{}", run.id, run.state, run.directive_id, run.directive_revision);
    for (i, record) in run.records.iter().enumerate() {
        let outcome = match &record.outcome {
            Outcome::Success { .. } => "ok".to_string(),
            Outcome::Failure { kind, message } => format!("{}: {}", kind, message),
        };
        println!(
            "  {:>2}. {} (attempt {}, {}ms) {}",
            i + 1,
            record.tool,
            record.attempt,
            record.duration_ms,
            outcome
        );
    }
    for rejection in &run.rejections {
        println!("  rejected {}: {}", rejection.tool, rejection.reason);
    }
    for (name, value) in &run.artifacts {
        println!("  {} = {}", name, value);
    }
    for lesson in &run.committed_lessons {
        println!("  lesson [{}] {}", lesson.kind.as_str(), lesson.summary);
    }
    if let Some(reason) = &run.reason {
        println!("  reason: {}", reason);
    }
    if let Some(err) = &run.commit_error {
        println!("  lessons not committed: {}", err);
    }
    match run.state {
        RunState::AwaitingAuthorization => {
            println!("  continue with: conductor resume {} --grant | --deny <reason>", run.id)
        }
        RunState::AwaitingClarification => println!(
            "  continue with: conductor resume {} --provide key=value... | --abandon <reason>",
            run.id
        ),
        _ => {}
    }
    Ok(())
}

fn finish(run: &TaskRun, json: bool) -> anyhow::Result<()> {
    print_run(run, json)?;
    if run.state == RunState::Failed {
        bail!("run {} failed", run.id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conductor::observability::init();
    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;

    let supervisor = RunSupervisor::new();
    let interrupt = supervisor.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Run {
            directive,
            inputs,
            interactive,
            json,
        } => {
            let inputs = parse_assignments(&inputs).context("Invalid --input")?;
            let orchestrator = Orchestrator::from_config(&cfg, gate_for(&cfg, interactive))
                .context("Failed to build orchestrator")?;
            let run = orchestrator
                .start(&directive, inputs, supervisor.child_token())
                .await
                .with_context(|| format!("Cannot run directive '{}'", directive))?;
            finish(&run, json)?;
        }
        Commands::Resume {
            run_id,
            answer,
            json,
        } => {
            let id = Uuid::parse_str(&run_id).context("Invalid run id")?;
            let orchestrator = Orchestrator::from_config(&cfg, gate_for(&cfg, false))
                .context("Failed to build orchestrator")?;
            let archive = orchestrator
                .archive()
                .context("Run archive is not configured")?;
            let run = archive.load(id).await?;
            let run = orchestrator
                .resume(run, resolution(answer)?, supervisor.child_token())
                .await?;
            finish(&run, json)?;
        }
        Commands::Show { directive, json } => {
            let store = DirectiveStore::new(&cfg.app.directives_dir);
            let directive = store.load(&directive).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&directive)?);
            } else {
                print!("{}", format::render(&directive));
            }
        }
        Commands::Create {
            file,
            overwrite,
            operator,
        } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Cannot read {}", file.display()))?;
            let draft = format::parse(&text)?;
            if overwrite && operator.is_none() {
                bail!("--overwrite requires --operator");
            }
            let store = DirectiveStore::new(&cfg.app.directives_dir);
            let created = match store.create(draft, overwrite_approval(overwrite, operator)).await {
                Err(ConductorError::DirectiveExists(id)) => {
                    bail!("directive '{}' already exists; use --overwrite --operator <name>", id)
                }
                result => result?,
            };
            println!(
                "stored {} r{} at {}",
                created.id,
                created.revision,
                store.path_for(&created.id).display()
            );
        }
        Commands::List => {
            let store = DirectiveStore::new(&cfg.app.directives_dir);
            for id in store.list().await? {
                println!("{}", id);
            }
        }
        Commands::Tools { json, schema } => {
            if schema {
                println!("{}", descriptor_schema_json());
                return Ok(());
            }
            let registry = registry_from_config(&cfg)?;
            if json {
                println!("{}", registry.to_schema_json());
                return Ok(());
            }
            for d in registry.descriptors() {
                let params = d
                    .params
                    .iter()
                    .map(|p| if p.required { format!("{}*", p.name) } else { p.name.clone() })
                    .collect::<Vec<_>>()
                    .join(", ");
                println!(
                    "{:<24} {:<8} ({}) -> [{}]  {}",
                    d.name,
                    if d.is_metered() { "metered" } else { "free" },
                    params,
                    d.outputs.join(", "),
                    d.description
                );
            }
        }
    }

    Ok(())
}
