//! 编排器：单个 TaskRun 的决策循环
//!
//! Planning（询问决策器）-> Executing（执行引擎）-> 观察结果，再回到 Planning。
//! 瞬时错误在 Executing 内退避重试；参数错误与重试耗尽进入 Correcting 由 SelfCorrection 提出修正；
//! 计费授权与澄清交给 HumanGate，Defer 时运行挂起并归档，之后由 resume 继续。
//! 运行成功后按顺序提交 Lesson（每条以上一条的版本号为基线）。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::gate::{AuthorizationDecision, ClarificationAnswer, HumanGate, Resolution};
use crate::core::oracle::{Action, CommandOracle, DecisionOracle, DirectiveState, SequentialOracle};
use crate::core::recovery::{Fix, FixContext, RetryPolicy, SelfCorrection};
use crate::core::{
    ConductorError, Failure, FailureKind, Outcome, PlannedCall, PreflightRejection, RunArchive,
    RunState, TaskRun,
};
use crate::directive::{Directive, DirectiveStore};
use crate::tools::{load_catalog, register_catalog, ExecutionEngine, ToolRegistry};

/// 运行参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// 单次工具调用的时间预算
    pub budget: Duration,
    pub retry: RetryPolicy,
    /// 单次运行的决策步数上限（防止决策器不收敛）
    pub max_steps: usize,
    /// 两次人工澄清之间允许的自动修正次数
    pub max_corrections: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            max_steps: 64,
            max_corrections: 3,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            budget: cfg.tool_budget(),
            retry: cfg.retry_policy(),
            max_steps: cfg.app.max_steps.max(1),
            max_corrections: cfg.app.max_corrections,
        }
    }
}

enum Flow {
    Continue,
    Suspend,
}

/// 按配置加载工具目录并构建注册表；目录中的相对命令以目录文件所在目录为基准
pub fn registry_from_config(cfg: &AppConfig) -> Result<ToolRegistry, ConductorError> {
    let entries = load_catalog(&cfg.tools.catalog)?;
    let base_dir = cfg
        .tools
        .catalog
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let mut registry = ToolRegistry::new();
    register_catalog(&mut registry, &entries, &base_dir)?;
    Ok(registry)
}

pub struct Orchestrator {
    engine: ExecutionEngine,
    store: Arc<DirectiveStore>,
    oracle: Arc<dyn DecisionOracle>,
    gate: Arc<dyn HumanGate>,
    recorder: SelfCorrection,
    settings: OrchestratorSettings,
    archive: Option<RunArchive>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        store: Arc<DirectiveStore>,
        oracle: Arc<dyn DecisionOracle>,
        gate: Arc<dyn HumanGate>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            engine: ExecutionEngine::new(registry),
            store,
            oracle,
            gate,
            recorder: SelfCorrection::new(),
            settings,
            archive: None,
        }
    }

    pub fn with_recorder(mut self, recorder: SelfCorrection) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_archive(mut self, archive: RunArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// 由配置组装：工具目录、指令目录、运行归档、修正规则与决策器（未配置命令时为 SequentialOracle）
    pub fn from_config(cfg: &AppConfig, gate: Arc<dyn HumanGate>) -> Result<Self, ConductorError> {
        let registry = registry_from_config(cfg)?;
        let store = DirectiveStore::new(&cfg.app.directives_dir);
        let recorder = SelfCorrection::from_rule_names(&cfg.correction.rules)?;
        let oracle: Arc<dyn DecisionOracle> =
            match CommandOracle::from_command(&cfg.oracle.command, cfg.oracle_timeout()) {
                Some(oracle) => Arc::new(oracle),
                None => Arc::new(SequentialOracle),
            };
        Ok(Self::new(
            Arc::new(registry),
            Arc::new(store),
            oracle,
            gate,
            OrchestratorSettings::from_config(cfg),
        )
        .with_recorder(recorder)
        .with_archive(RunArchive::new(&cfg.app.runs_dir)))
    }

    pub fn registry(&self) -> &ToolRegistry {
        self.engine.registry()
    }

    pub fn store(&self) -> &DirectiveStore {
        &self.store
    }

    pub fn archive(&self) -> Option<&RunArchive> {
        self.archive.as_ref()
    }

    /// 开始运行指令；指令不存在或引用了未注册的工具时直接返回错误，不产生运行
    pub async fn start(
        &self,
        directive_id: &str,
        inputs: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<TaskRun, ConductorError> {
        let directive = self.store.load(directive_id).await?;
        self.registry().resolve_all(&directive.tools)?;

        let mut run = TaskRun::new(&directive.id, directive.revision);
        for input in &directive.inputs {
            if let Some(value) = &input.value {
                run.artifacts
                    .insert(input.name.clone(), Value::String(value.clone()));
            }
        }
        run.artifacts.extend(inputs);
        tracing::info!(
            run = %run.id,
            directive = %directive.id,
            revision = directive.revision,
            "run started"
        );

        self.drive(&directive, &mut run, &cancel).await;
        Ok(run)
    }

    /// 以外部答复继续挂起的运行；状态与答复不匹配时返回 NotSuspended
    pub async fn resume(
        &self,
        mut run: TaskRun,
        resolution: Resolution,
        cancel: CancellationToken,
    ) -> Result<TaskRun, ConductorError> {
        let matches = matches!(
            (run.state, &resolution),
            (RunState::AwaitingAuthorization, Resolution::Grant { .. })
                | (RunState::AwaitingAuthorization, Resolution::Deny { .. })
                | (RunState::AwaitingClarification, Resolution::Provide(_))
                | (RunState::AwaitingClarification, Resolution::Abandon { .. })
        );
        if !matches {
            return Err(ConductorError::NotSuspended {
                run: run.id.to_string(),
                state: run.state.to_string(),
                resolution: resolution.label().to_string(),
            });
        }

        let directive = self.store.load(&run.directive_id).await?;
        self.registry().resolve_all(&directive.tools)?;
        tracing::info!(run = %run.id, resolution = resolution.label(), "run resumed");
        match resolution {
            Resolution::Grant { by } => self.grant(&mut run, by),
            Resolution::Deny { reason } | Resolution::Abandon { reason } => run.fail(reason),
            Resolution::Provide(values) => self.apply_clarification(&mut run, values),
        }

        self.drive(&directive, &mut run, &cancel).await;
        Ok(run)
    }

    async fn drive(&self, directive: &Directive, run: &mut TaskRun, cancel: &CancellationToken) {
        loop {
            if run.state.is_terminal() {
                break;
            }
            if cancel.is_cancelled() {
                run.fail("cancelled");
                break;
            }
            let flow = match run.state {
                RunState::Planning => self.plan(directive, run).await,
                RunState::Executing => self.execute(run, cancel).await,
                RunState::Correcting => self.correct(directive, run),
                RunState::AwaitingAuthorization => self.await_authorization(run, cancel).await,
                RunState::AwaitingClarification => self.await_clarification(run, cancel).await,
                RunState::Succeeded | RunState::Failed => Flow::Continue,
            };
            if let Flow::Suspend = flow {
                tracing::info!(run = %run.id, state = %run.state, reason = ?run.reason, "run suspended");
                break;
            }
        }

        if run.state == RunState::Succeeded {
            self.commit_lessons(run).await;
        }
        if run.state.is_terminal() {
            tracing::info!(
                run = %run.id,
                state = %run.state,
                records = run.records.len(),
                lessons = run.committed_lessons.len(),
                reason = ?run.reason,
                "run finished"
            );
        }
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.save(run).await {
                tracing::warn!(run = %run.id, "run archive failed: {}", e);
            }
        }
    }

    fn transition(run: &mut TaskRun, to: RunState) {
        tracing::debug!(run = %run.id, from = %run.state, to = %to, "state transition");
        run.state = to;
        if to.is_terminal() {
            run.finished_at = Some(Utc::now());
        }
    }

    fn fail(run: &mut TaskRun, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::debug!(run = %run.id, from = %run.state, to = %RunState::Failed, "state transition");
        tracing::warn!(run = %run.id, "run failed: {}", reason);
        run.fail(reason);
    }

    fn permits(directive: &Directive, run: &TaskRun, tool: &str) -> bool {
        directive.tools.iter().any(|t| t == tool) || run.substitutions.values().any(|t| t == tool)
    }

    async fn plan(&self, directive: &Directive, run: &mut TaskRun) -> Flow {
        let missing = run.missing_outputs(&directive.outputs);
        if missing.is_empty() {
            Self::transition(run, RunState::Succeeded);
            return Flow::Continue;
        }
        if run.steps >= self.settings.max_steps {
            Self::fail(run, format!("step limit of {} reached", self.settings.max_steps));
            return Flow::Continue;
        }
        run.steps += 1;

        let decision = {
            let state = DirectiveState {
                directive,
                run: &*run,
                registry: self.registry(),
            };
            self.oracle.decide(&state).await
        };
        let action = match decision {
            Ok(action) => action,
            Err(e) => {
                Self::fail(run, format!("decision oracle failed: {}", e));
                return Flow::Continue;
            }
        };

        match action {
            Action::Invoke { tool, args } => {
                let tool = run.effective_tool(&tool).to_string();
                if !Self::permits(directive, run, &tool) {
                    Self::fail(
                        run,
                        format!("tool `{}` is not permitted by directive `{}`", tool, directive.id),
                    );
                    return Flow::Continue;
                }
                let args = match (args, run.arg_overrides.get(&tool)) {
                    (Value::Object(mut map), Some(overrides)) => {
                        map.extend(overrides.clone());
                        Value::Object(map)
                    }
                    (Value::Null, Some(overrides)) => Value::Object(overrides.clone()),
                    (args, _) => args,
                };
                run.pending_call = Some(PlannedCall { tool, args });
                Self::transition(run, RunState::Executing);
            }
            Action::AskClarification { question } => {
                run.reason = Some(question);
                Self::transition(run, RunState::AwaitingClarification);
            }
            Action::AmendDirective { lesson } => {
                run.pending_lessons.push(lesson.from_run(run.id));
            }
            Action::Complete => {
                let missing = run
                    .missing_outputs(&directive.outputs)
                    .into_iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                Self::fail(run, format!("completion declared with outputs missing: {}", missing));
            }
            Action::Abort { reason } => Self::fail(run, reason),
        }
        Flow::Continue
    }

    async fn execute(&self, run: &mut TaskRun, cancel: &CancellationToken) -> Flow {
        let Some(call) = run.pending_call.clone() else {
            Self::fail(run, "executing without a planned call");
            return Flow::Continue;
        };
        let retry = &self.settings.retry;
        let mut attempt = 1;
        loop {
            let result = self
                .engine
                .invoke(
                    &call.tool,
                    call.args.clone(),
                    self.settings.budget,
                    &run.authorizations,
                    attempt,
                )
                .await;
            let record = match result {
                Ok(record) => record,
                Err(e) if e.failure_kind() == Some(FailureKind::Schema) => {
                    tracing::warn!(run = %run.id, tool = %call.tool, "pre-flight rejection: {}", e);
                    run.rejections.push(PreflightRejection {
                        tool: call.tool.clone(),
                        args: call.args.clone(),
                        reason: e.to_string(),
                        at: Utc::now(),
                    });
                    run.pending_failure = Some(Failure {
                        tool: call.tool.clone(),
                        args: call.args.clone(),
                        kind: FailureKind::Schema,
                        message: e.to_string(),
                    });
                    Self::transition(run, RunState::Correcting);
                    return Flow::Continue;
                }
                Err(e) => {
                    Self::fail(run, e.to_string());
                    return Flow::Continue;
                }
            };
            let kind = self.recorder.classify(&record);
            let failure = record.failure();
            let output = match &record.outcome {
                Outcome::Success { output } => Some(output.clone()),
                Outcome::Failure { .. } => None,
            };
            run.records.push(record);

            if cancel.is_cancelled() {
                Self::fail(run, "cancelled; in-flight result discarded");
                return Flow::Continue;
            }

            if let Some(output) = output {
                self.store_artifacts(run, &call.tool, output);
                run.pending_call = None;
                run.pending_failure = None;
                Self::transition(run, RunState::Planning);
                return Flow::Continue;
            }
            let (Some(kind), Some(failure)) = (kind, failure) else {
                Self::fail(run, format!("{}: unclassified failure", call.tool));
                return Flow::Continue;
            };

            match kind {
                FailureKind::Transient | FailureKind::Timeout => {
                    if !retry.allows_retry(attempt) {
                        tracing::warn!(
                            run = %run.id,
                            tool = %call.tool,
                            attempts = attempt,
                            "retries exhausted"
                        );
                        run.pending_failure = Some(failure);
                        Self::transition(run, RunState::Correcting);
                        return Flow::Continue;
                    }
                    let delay = retry.delay_after(attempt);
                    tracing::warn!(
                        run = %run.id,
                        tool = %call.tool,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "{}, retrying",
                        failure.message
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            Self::fail(run, "cancelled during retry backoff");
                            return Flow::Continue;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                FailureKind::Input | FailureKind::Schema => {
                    run.pending_failure = Some(failure);
                    Self::transition(run, RunState::Correcting);
                    return Flow::Continue;
                }
                FailureKind::CostGate => {
                    run.reason = Some(format!("`{}` is metered and needs authorization", call.tool));
                    run.pending_failure = Some(failure);
                    Self::transition(run, RunState::AwaitingAuthorization);
                    return Flow::Continue;
                }
                FailureKind::Fatal | FailureKind::UnknownTool => {
                    Self::fail(run, format!("{}: {}", call.tool, failure.message));
                    return Flow::Continue;
                }
            }
        }
    }

    /// 成功输出写入产物：对象按声明的输出名取字段；只声明一个输出时整体作为该输出
    fn store_artifacts(&self, run: &mut TaskRun, tool: &str, output: Value) {
        let outputs = match self.registry().resolve(tool) {
            Ok(d) => d.outputs.clone(),
            Err(_) => return,
        };
        match output {
            Value::Object(map) if !outputs.is_empty() && outputs.iter().all(|o| map.contains_key(o)) => {
                for name in outputs {
                    if let Some(v) = map.get(&name) {
                        run.artifacts.insert(name, v.clone());
                    }
                }
            }
            output if outputs.len() == 1 => {
                run.artifacts.insert(outputs[0].clone(), output);
            }
            Value::Object(map) => {
                for name in outputs {
                    if let Some(v) = map.get(&name) {
                        run.artifacts.insert(name, v.clone());
                    }
                }
            }
            _ => {}
        }
    }

    fn correct(&self, directive: &Directive, run: &mut TaskRun) -> Flow {
        let Some(failure) = run.pending_failure.clone() else {
            Self::fail(run, "correcting without a recorded failure");
            return Flow::Continue;
        };
        if run.corrections >= self.settings.max_corrections {
            run.reason = Some(format!(
                "{} automatic corrections did not help; `{}` still fails ({}): {}",
                run.corrections, failure.tool, failure.kind, failure.message
            ));
            Self::transition(run, RunState::AwaitingClarification);
            return Flow::Continue;
        }

        let fix = {
            let ctx = FixContext {
                directive,
                run: &*run,
                registry: self.registry(),
            };
            self.recorder.propose_fix(&failure, &ctx)
        };
        let Some(fix) = fix else {
            run.reason = Some(format!(
                "no automatic fix for `{}` ({}): {}",
                failure.tool, failure.kind, failure.message
            ));
            Self::transition(run, RunState::AwaitingClarification);
            return Flow::Continue;
        };

        let lesson = self.recorder.to_lesson(&failure, &fix).from_run(run.id);
        match fix {
            Fix::AdjustArgs { tool, args, .. } => {
                run.arg_overrides.insert(tool, args);
            }
            Fix::AlternateTool { from, to } => {
                run.substitutions.insert(from, to);
            }
            Fix::AmendText { .. } => {}
        }
        tracing::info!(run = %run.id, tool = %failure.tool, lesson = %lesson.summary, "fix applied");
        run.pending_lessons.push(lesson);
        run.corrections += 1;
        run.pending_call = None;
        run.pending_failure = None;
        Self::transition(run, RunState::Planning);
        Flow::Continue
    }

    async fn await_authorization(&self, run: &mut TaskRun, cancel: &CancellationToken) -> Flow {
        let Some(call) = run.pending_call.clone() else {
            Self::fail(run, "awaiting authorization without a planned call");
            return Flow::Continue;
        };
        let descriptor = match self.registry().resolve(&call.tool) {
            Ok(d) => d.clone(),
            Err(e) => {
                Self::fail(run, e.to_string());
                return Flow::Continue;
            }
        };
        let decision = tokio::select! {
            _ = cancel.cancelled() => None,
            decision = self.gate.authorize(run, &descriptor) => Some(decision),
        };
        let Some(decision) = decision else {
            Self::fail(run, "cancelled while awaiting authorization");
            return Flow::Continue;
        };
        match decision {
            AuthorizationDecision::Grant { by } => {
                self.grant(run, by);
                Flow::Continue
            }
            AuthorizationDecision::Deny { reason } => {
                Self::fail(run, reason);
                Flow::Continue
            }
            AuthorizationDecision::Defer => Flow::Suspend,
        }
    }

    fn grant(&self, run: &mut TaskRun, by: String) {
        if let Some(call) = &run.pending_call {
            tracing::info!(run = %run.id, tool = %call.tool, by = %by, "metered tool authorized");
            run.authorizations.grant(call.tool.clone(), by);
        }
        run.reason = None;
        run.pending_failure = None;
        Self::transition(run, RunState::Planning);
    }

    async fn await_clarification(&self, run: &mut TaskRun, cancel: &CancellationToken) -> Flow {
        let question = run
            .reason
            .clone()
            .unwrap_or_else(|| "more information is needed".to_string());
        let answer = tokio::select! {
            _ = cancel.cancelled() => None,
            answer = self.gate.clarify(run, &question) => Some(answer),
        };
        let Some(answer) = answer else {
            Self::fail(run, "cancelled while awaiting clarification");
            return Flow::Continue;
        };
        match answer {
            ClarificationAnswer::Provide(values) => {
                self.apply_clarification(run, values);
                Flow::Continue
            }
            ClarificationAnswer::Abandon { reason } => {
                Self::fail(run, reason);
                Flow::Continue
            }
            ClarificationAnswer::Defer => Flow::Suspend,
        }
    }

    /// 澄清答复：针对失败的调用时覆盖其参数，否则作为产物（按名绑定到后续参数）
    fn apply_clarification(&self, run: &mut TaskRun, values: Map<String, Value>) {
        match run.pending_failure.take() {
            Some(failure) => {
                let mut args = failure.args.as_object().cloned().unwrap_or_default();
                args.extend(values);
                run.arg_overrides.insert(failure.tool, args);
            }
            None => run.artifacts.extend(values),
        }
        run.corrections = 0;
        run.reason = None;
        run.pending_call = None;
        Self::transition(run, RunState::Planning);
    }

    /// 依次提交 Lesson；冲突时停止，剩余 Lesson 保留在 pending_lessons 并记录 commit_error
    async fn commit_lessons(&self, run: &mut TaskRun) {
        let mut base = run.directive_revision;
        let mut lessons = std::mem::take(&mut run.pending_lessons).into_iter();
        while let Some(lesson) = lessons.next() {
            match self.store.amend(&run.directive_id, base, &lesson).await {
                Ok(updated) => {
                    base = updated.revision;
                    run.committed_lessons.push(lesson);
                }
                Err(e) => {
                    tracing::warn!(run = %run.id, directive = %run.directive_id, "lesson commit failed: {}", e);
                    run.commit_error = Some(e.to_string());
                    run.pending_lessons.push(lesson);
                    run.pending_lessons.extend(lessons);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gate::PolicyGate;
    use crate::core::ToolFault;
    use crate::tools::{ParamSpec, Tool, ToolDescriptor};
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo(ToolDescriptor, Value);

    #[async_trait]
    impl Tool for Echo {
        fn descriptor(&self) -> &ToolDescriptor {
            &self.0
        }

        async fn execute(&self, _args: Value) -> Result<Value, ToolFault> {
            Ok(self.1.clone())
        }
    }

    /// 永不声明完成的决策器
    struct Looping;

    #[async_trait]
    impl DecisionOracle for Looping {
        async fn decide(&self, _state: &DirectiveState<'_>) -> Result<Action, ConductorError> {
            Ok(Action::Invoke {
                tool: "noop".into(),
                args: json!({}),
            })
        }
    }

    async fn orchestrator(
        dir: &Path,
        oracle: Arc<dyn DecisionOracle>,
        tools: Vec<Echo>,
        directive: Directive,
    ) -> Orchestrator {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool).unwrap();
        }
        let store = DirectiveStore::new(dir);
        store.create(directive, None).await.unwrap();
        Orchestrator::new(
            Arc::new(registry),
            Arc::new(store),
            oracle,
            Arc::new(PolicyGate::default()),
            OrchestratorSettings::default(),
        )
    }

    #[test]
    fn test_from_config_rejects_unknown_fix_rule() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.tools.catalog = dir.path().join("tools.toml");
        cfg.correction.rules = vec!["guess_harder".into()];
        assert!(matches!(
            Orchestrator::from_config(&cfg, Arc::new(PolicyGate::default())),
            Err(ConductorError::Config(_))
        ));

        cfg.correction.rules = vec!["numeric_coercion".into()];
        assert!(Orchestrator::from_config(&cfg, Arc::new(PolicyGate::default())).is_ok());
    }

    #[tokio::test]
    async fn test_object_output_maps_to_declared_names() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Echo(
            ToolDescriptor::new("meta").output("title").output("lang"),
            json!({"title": "Hi", "lang": "en", "extra": 1}),
        );
        let directive = Directive::draft("meta", "page metadata")
            .tool("meta")
            .output("title")
            .output("lang");
        let orch = orchestrator(dir.path(), Arc::new(SequentialOracle), vec![tool], directive).await;
        let run = orch
            .start("meta", Map::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.artifacts["title"], json!("Hi"));
        assert_eq!(run.artifacts["lang"], json!("en"));
        assert!(!run.artifacts.contains_key("extra"));
    }

    #[tokio::test]
    async fn test_step_limit_stops_runaway_oracle() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Echo(ToolDescriptor::new("noop"), Value::Null);
        let directive = Directive::draft("loop", "never ends").tool("noop").output("never");
        let orch = orchestrator(dir.path(), Arc::new(Looping), vec![tool], directive).await;
        let run = orch
            .start("loop", Map::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.steps, OrchestratorSettings::default().max_steps);
        assert!(run.reason.unwrap().contains("step limit"));
    }

    #[tokio::test]
    async fn test_unpermitted_tool_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let tools = vec![
            Echo(ToolDescriptor::new("noop"), Value::Null),
            Echo(ToolDescriptor::new("other").output("x"), json!(1)),
        ];
        let directive = Directive::draft("narrow", "only other").tool("other").output("x");
        let orch = orchestrator(dir.path(), Arc::new(Looping), tools, directive).await;
        let run = orch
            .start("narrow", Map::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert!(run.records.is_empty());
        assert!(run.reason.unwrap().contains("not permitted"));
    }

    #[tokio::test]
    async fn test_input_defaults_seed_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Echo(
            ToolDescriptor::new("fetch_page")
                .param(ParamSpec::string("url").required())
                .output("html"),
            json!("<html/>"),
        );
        let directive = Directive::draft("fetch", "fetch")
            .input("url", Some("https://example.com"))
            .tool("fetch_page")
            .output("html");
        let orch = orchestrator(dir.path(), Arc::new(SequentialOracle), vec![tool], directive).await;
        let mut inputs = Map::new();
        inputs.insert("url".into(), json!("https://override.example"));
        let run = orch.start("fetch", inputs, CancellationToken::new()).await.unwrap();
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.records[0].args["url"], json!("https://override.example"));
    }

    #[tokio::test]
    async fn test_resume_rejects_mismatched_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let directive = Directive::draft("d", "g").tool("noop").output("x");
        let orch = orchestrator(
            dir.path(),
            Arc::new(SequentialOracle),
            vec![Echo(ToolDescriptor::new("noop"), Value::Null)],
            directive,
        )
        .await;
        let run = TaskRun::new("d", 1);
        let err = orch
            .resume(run, Resolution::Grant { by: "alice".into() }, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::NotSuspended { .. }));
    }
}
