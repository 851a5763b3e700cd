//! 编排器端到端场景：进程内假工具 + 临时目录中的指令存储

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use conductor::core::{
    Action, AuthorizationDecision, ClarificationAnswer, ConductorError, ConsoleGate, DecisionOracle,
    DirectiveState, FailureKind, HumanGate, Orchestrator, OrchestratorSettings, PolicyGate,
    Resolution, RetryPolicy, RunArchive, RunState, SequentialOracle, TaskRun, ToolFault,
};
use conductor::directive::{Directive, DirectiveStore, Lesson, LessonKind, RevisionKind};
use conductor::tools::{ParamSpec, ParamType, Tool, ToolDescriptor, ToolRegistry};

type Behaviour = Box<dyn Fn(usize, &Value) -> Result<Value, ToolFault> + Send + Sync>;

/// 假工具：按调用序号决定结果，并记录调用次数
struct FakeTool {
    descriptor: ToolDescriptor,
    calls: Arc<AtomicUsize>,
    delay: Duration,
    behaviour: Behaviour,
}

#[async_trait]
impl Tool for FakeTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolFault> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.behaviour)(n, &args)
    }
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn fetch_descriptor(name: &str) -> ToolDescriptor {
    ToolDescriptor::new(name)
        .param(ParamSpec::string("url").required().non_empty())
        .output("html")
        .idempotent()
}

/// 前 transient_failures 次返回 503；URL 缺少 scheme 时返回参数错误
fn fetch_page(calls: Arc<AtomicUsize>, transient_failures: usize) -> FakeTool {
    FakeTool {
        descriptor: fetch_descriptor("fetch_page"),
        calls,
        delay: Duration::ZERO,
        behaviour: Box::new(move |n, args| {
            let url = args["url"].as_str().unwrap_or_default();
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(ToolFault::input(format!("malformed url: {}", url)));
            }
            if n < transient_failures {
                return Err(ToolFault::transient("503 Service Unavailable"));
            }
            Ok(json!(format!("<html><head><title>Title of {}</title></head></html>", url)))
        }),
    }
}

fn extract_title(calls: Arc<AtomicUsize>) -> FakeTool {
    FakeTool {
        descriptor: ToolDescriptor::new("extract_title")
            .param(ParamSpec::string("html").required())
            .output("title"),
        calls,
        delay: Duration::ZERO,
        behaviour: Box::new(|_, args| {
            let html = args["html"].as_str().unwrap_or_default();
            let start = html.find("<title>").map(|i| i + "<title>".len());
            let end = html.find("</title>");
            match (start, end) {
                (Some(s), Some(e)) if s <= e => Ok(json!(html[s..e].trim())),
                _ => Err(ToolFault::input("no <title> element")),
            }
        }),
    }
}

fn translate(calls: Arc<AtomicUsize>) -> FakeTool {
    FakeTool {
        descriptor: ToolDescriptor::new("translate")
            .param(ParamSpec::string("title").required())
            .output("translation")
            .metered(),
        calls,
        delay: Duration::ZERO,
        behaviour: Box::new(|_, args| Ok(json!(format!("[de] {}", args["title"].as_str().unwrap_or_default())))),
    }
}

fn page_titles() -> Directive {
    Directive::draft("page_titles", "Fetch the page at `url` and report its title")
        .input("url", None)
        .tool("fetch_page")
        .tool("extract_title")
        .output("title")
}

fn inputs(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect()
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        budget: Duration::from_secs(2),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(5),
        },
        max_steps: 32,
        max_corrections: 3,
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<DirectiveStore>,
    registry: Arc<ToolRegistry>,
    archive: RunArchive,
}

impl Harness {
    async fn new(tools: Vec<FakeTool>, directives: Vec<Directive>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DirectiveStore::new(dir.path().join("directives")));
        for directive in directives {
            store.create(directive, None).await.unwrap();
        }
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool).unwrap();
        }
        let archive = RunArchive::new(dir.path().join("runs"));
        Self {
            _dir: dir,
            store,
            registry: Arc::new(registry),
            archive,
        }
    }

    fn orchestrator_with(&self, gate: Arc<dyn HumanGate>, oracle: Arc<dyn DecisionOracle>) -> Orchestrator {
        Orchestrator::new(
            self.registry.clone(),
            self.store.clone(),
            oracle,
            gate,
            settings(),
        )
        .with_archive(self.archive.clone())
    }

    fn orchestrator(&self, gate: Arc<dyn HumanGate>) -> Orchestrator {
        self.orchestrator_with(gate, Arc::new(SequentialOracle))
    }

    async fn assert_outputs_present(&self, run: &TaskRun) {
        assert_eq!(run.state, RunState::Succeeded);
        let directive = self.store.load(&run.directive_id).await.unwrap();
        for output in &directive.outputs {
            assert!(run.artifacts.contains_key(output), "missing output {}", output);
        }
    }
}

fn policy() -> Arc<dyn HumanGate> {
    Arc::new(PolicyGate::default())
}

#[tokio::test]
async fn test_transient_failures_retried_then_succeed() {
    let fetch_calls = counter();
    let h = Harness::new(
        vec![fetch_page(fetch_calls.clone(), 2), extract_title(counter())],
        vec![page_titles()],
    )
    .await;
    let run = h
        .orchestrator(policy())
        .start("page_titles", inputs(&[("url", "https://example.com")]), CancellationToken::new())
        .await
        .unwrap();

    h.assert_outputs_present(&run).await;
    let fetches: Vec<_> = run.records_for("fetch_page").collect();
    assert_eq!(fetches.len(), 3);
    assert_eq!(fetches.iter().filter(|r| !r.is_success()).count(), 2);
    assert!(fetches[..2]
        .iter()
        .all(|r| r.failure_kind() == Some(FailureKind::Transient)));
    assert_eq!(fetches.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(run.records_for("extract_title").count(), 1);
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 3);
    assert_eq!(run.artifacts["title"], json!("Title of https://example.com"));

    assert!(run.committed_lessons.is_empty());
    let directive = h.store.load("page_titles").await.unwrap();
    assert_eq!(directive.revision, run.directive_revision);
}

#[tokio::test]
async fn test_malformed_url_fixed_and_one_lesson_committed() {
    let h = Harness::new(
        vec![fetch_page(counter(), 0), extract_title(counter())],
        vec![page_titles()],
    )
    .await;
    let run = h
        .orchestrator(policy())
        .start("page_titles", inputs(&[("url", "example.com/news")]), CancellationToken::new())
        .await
        .unwrap();

    h.assert_outputs_present(&run).await;
    let fetches: Vec<_> = run.records_for("fetch_page").collect();
    assert_eq!(fetches.len(), 2);
    assert_eq!(fetches[0].failure_kind(), Some(FailureKind::Input));
    assert_eq!(fetches[0].args["url"], json!("example.com/news"));
    assert_eq!(fetches[1].args["url"], json!("https://example.com/news"));
    assert_eq!(run.corrections, 1);

    assert_eq!(run.committed_lessons.len(), 1);
    assert!(run.pending_lessons.is_empty());
    let lesson = &run.committed_lessons[0];
    assert_eq!(lesson.kind, LessonKind::CorrectedParameter);
    assert_eq!(lesson.run_id, Some(run.id));

    let directive = h.store.load("page_titles").await.unwrap();
    assert_eq!(directive.revision, run.directive_revision + 1);
    assert!(directive.edge_case_note("fetch_page: url_normalization").is_some());
    assert_eq!(
        directive.history.last().unwrap().kind,
        RevisionKind::Lesson(LessonKind::CorrectedParameter)
    );
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let fetch_calls = counter();
    let extract_calls = counter();
    let h = Harness::new(
        vec![
            fetch_page(fetch_calls.clone(), usize::MAX),
            extract_title(extract_calls.clone()),
        ],
        vec![page_titles()],
    )
    .await;
    let orchestrator = h.orchestrator(policy());
    let run = orchestrator
        .start("page_titles", inputs(&[("url", "https://example.com")]), CancellationToken::new())
        .await
        .unwrap();

    // 无替代工具：重试耗尽 -> 无可用修正 -> 等待澄清
    assert_eq!(run.state, RunState::AwaitingClarification);
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 3);
    assert_eq!(run.records.len(), 3);
    assert!(run.records.iter().all(|r| r.attempt <= settings().retry.max_attempts));
    assert_eq!(extract_calls.load(Ordering::SeqCst), 0);
    assert!(run.reason.as_deref().unwrap_or_default().contains("fetch_page"));

    let run = orchestrator
        .resume(
            run,
            Resolution::Abandon {
                reason: "site is down".into(),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.records.len(), 3);
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_alternate_tool_after_retries_exhausted() {
    let mut primary = fetch_page(counter(), usize::MAX);
    primary.descriptor = primary.descriptor.alternate("fetch_page_cached");
    let mut cached = fetch_page(counter(), 0);
    cached.descriptor = fetch_descriptor("fetch_page_cached");
    let h = Harness::new(vec![primary, cached, extract_title(counter())], vec![page_titles()]).await;

    let run = h
        .orchestrator(policy())
        .start("page_titles", inputs(&[("url", "https://example.com")]), CancellationToken::new())
        .await
        .unwrap();

    h.assert_outputs_present(&run).await;
    assert_eq!(run.records_for("fetch_page").count(), 3);
    assert_eq!(run.records_for("fetch_page_cached").count(), 1);
    assert_eq!(run.substitutions["fetch_page"], "fetch_page_cached");
    assert_eq!(run.committed_lessons.len(), 1);
    assert_eq!(run.committed_lessons[0].kind, LessonKind::AlternateTool);
}

fn translate_titles() -> Directive {
    Directive::draft("translate_titles", "Translate the title of the page at `url`")
        .input("url", None)
        .tool("fetch_page")
        .tool("extract_title")
        .tool("translate")
        .output("translation")
}

#[tokio::test]
async fn test_metered_tool_never_invoked_without_authorization() {
    let translate_calls = counter();
    let h = Harness::new(
        vec![
            fetch_page(counter(), 0),
            extract_title(counter()),
            translate(translate_calls.clone()),
        ],
        vec![translate_titles()],
    )
    .await;
    let orchestrator = h.orchestrator(policy());
    let run = orchestrator
        .start("translate_titles", inputs(&[("url", "https://example.com")]), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.state, RunState::AwaitingAuthorization);
    assert_eq!(translate_calls.load(Ordering::SeqCst), 0);
    let gated = run.records.last().unwrap();
    assert_eq!(gated.tool, "translate");
    assert_eq!(gated.failure_kind(), Some(FailureKind::CostGate));
    assert!(!run.authorizations.is_authorized("translate"));

    // 挂起的运行已归档
    let archived = h.archive.load(run.id).await.unwrap();
    assert_eq!(archived.state, RunState::AwaitingAuthorization);

    let run = orchestrator
        .resume(
            archived,
            Resolution::Deny {
                reason: "over budget".into(),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.reason.as_deref(), Some("over budget"));
    assert_eq!(translate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_granted_authorization_resumes_into_planning() {
    let translate_calls = counter();
    let h = Harness::new(
        vec![
            fetch_page(counter(), 0),
            extract_title(counter()),
            translate(translate_calls.clone()),
        ],
        vec![translate_titles()],
    )
    .await;
    let orchestrator = h.orchestrator(policy());
    let run = orchestrator
        .start("translate_titles", inputs(&[("url", "https://example.com")]), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.state, RunState::AwaitingAuthorization);

    let run = orchestrator
        .resume(run, Resolution::Grant { by: "alice".into() }, CancellationToken::new())
        .await
        .unwrap();
    h.assert_outputs_present(&run).await;
    assert_eq!(translate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(run.authorizations.get("translate").unwrap().granted_by, "alice");
    assert_eq!(run.artifacts["translation"], json!("[de] Title of https://example.com"));
    // fetch / extract 没有重新执行
    assert_eq!(run.records_for("fetch_page").count(), 1);
}

#[tokio::test]
async fn test_preauthorized_policy_and_denying_gate() {
    struct Denying;

    #[async_trait]
    impl HumanGate for Denying {
        async fn authorize(&self, _run: &TaskRun, tool: &ToolDescriptor) -> AuthorizationDecision {
            AuthorizationDecision::Deny {
                reason: format!("{} is not in the budget", tool.name),
            }
        }

        async fn clarify(&self, _run: &TaskRun, _question: &str) -> ClarificationAnswer {
            ClarificationAnswer::Defer
        }
    }

    let translate_calls = counter();
    let h = Harness::new(
        vec![
            fetch_page(counter(), 0),
            extract_title(counter()),
            translate(translate_calls.clone()),
        ],
        vec![translate_titles()],
    )
    .await;

    let run = h
        .orchestrator(Arc::new(Denying))
        .start("translate_titles", inputs(&[("url", "https://example.com")]), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(translate_calls.load(Ordering::SeqCst), 0);

    let run = h
        .orchestrator(Arc::new(PolicyGate::new(vec!["translate".to_string()])))
        .start("translate_titles", inputs(&[("url", "https://example.com")]), CancellationToken::new())
        .await
        .unwrap();
    h.assert_outputs_present(&run).await;
    assert_eq!(translate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(run.authorizations.get("translate").unwrap().granted_by, "policy");
}

fn top_n(calls: Arc<AtomicUsize>) -> FakeTool {
    FakeTool {
        descriptor: ToolDescriptor::new("top_n")
            .param(ParamSpec::new("n", ParamType::Integer).required().range(Some(1.0), Some(50.0)))
            .output("top"),
        calls,
        delay: Duration::ZERO,
        behaviour: Box::new(|_, args| {
            let n = args["n"].as_u64().unwrap_or_default() as usize;
            Ok(json!((1..=n).collect::<Vec<_>>()))
        }),
    }
}

fn top_stories(default_n: Option<&str>) -> Directive {
    Directive::draft("top_stories", "List the top `n` stories")
        .input("n", default_n)
        .tool("top_n")
        .output("top")
}

#[tokio::test]
async fn test_schema_invalid_args_never_reach_the_tool() {
    let calls = counter();
    let h = Harness::new(vec![top_n(calls.clone())], vec![top_stories(Some("5"))]).await;

    // 默认输入是字符串 "5"：预检拒绝，数字转换后再调用
    let run = h
        .orchestrator(policy())
        .start("top_stories", Map::new(), CancellationToken::new())
        .await
        .unwrap();
    h.assert_outputs_present(&run).await;
    assert_eq!(run.rejections.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let records: Vec<_> = run.records_for("top_n").collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].args["n"], json!(5));
    assert_eq!(run.committed_lessons.len(), 1);
}

#[tokio::test]
async fn test_unfixable_schema_error_asks_and_clarification_overrides_args() {
    let calls = counter();
    let h = Harness::new(vec![top_n(calls.clone())], vec![top_stories(None)]).await;
    let orchestrator = h.orchestrator(policy());

    let mut given = Map::new();
    given.insert("n".into(), json!("five"));
    let run = orchestrator
        .start("top_stories", given, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.state, RunState::AwaitingClarification);
    assert!(run.records.is_empty());
    assert_eq!(run.rejections.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let mut answer = Map::new();
    answer.insert("n".into(), json!(3));
    let run = orchestrator
        .resume(run, Resolution::Provide(answer), CancellationToken::new())
        .await
        .unwrap();
    h.assert_outputs_present(&run).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(run.artifacts["top"], json!([1, 2, 3]));
}

#[tokio::test]
async fn test_unknown_tool_fails_fast() {
    let fetch_calls = counter();
    let directive = page_titles().tool("ghost");
    let h = Harness::new(vec![fetch_page(fetch_calls.clone(), 0), extract_title(counter())], vec![directive]).await;
    let err = h
        .orchestrator(policy())
        .start("page_titles", inputs(&[("url", "https://example.com")]), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::UnknownTool(name) if name == "ghost"));
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_directive() {
    let h = Harness::new(vec![], vec![]).await;
    let err = h
        .orchestrator(policy())
        .start("nope", Map::new(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::DirectiveNotFound(_)));
}

#[tokio::test]
async fn test_cancellation_discards_in_flight_result() {
    let mut slow = fetch_page(counter(), 0);
    slow.delay = Duration::from_millis(200);
    let h = Harness::new(vec![slow, extract_title(counter())], vec![page_titles()]).await;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });
    let run = h
        .orchestrator(policy())
        .start("page_titles", inputs(&[("url", "https://example.com")]), token)
        .await
        .unwrap();

    assert_eq!(run.state, RunState::Failed);
    assert!(run.reason.as_deref().unwrap_or_default().contains("cancelled"));
    // 记录保留在审计轨迹中，但结果没有写入产物
    assert_eq!(run.records.len(), 1);
    assert!(run.records[0].is_success());
    assert!(!run.artifacts.contains_key("html"));
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn test_cancelled_before_first_step() {
    let fetch_calls = counter();
    let h = Harness::new(vec![fetch_page(fetch_calls.clone(), 0), extract_title(counter())], vec![page_titles()]).await;
    let token = CancellationToken::new();
    token.cancel();
    let run = h
        .orchestrator(policy())
        .start("page_titles", inputs(&[("url", "https://example.com")]), token)
        .await
        .unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert!(run.records.is_empty());
    assert_eq!(fetch_calls.load(Ordering::SeqCst), 0);
}

/// 终端闸门：读端永远等不到输入（写端保持打开，不会 EOF）
fn silent_console() -> (Arc<dyn HumanGate>, tokio::io::DuplexStream) {
    let (reader, writer) = tokio::io::duplex(64);
    let gate = ConsoleGate::from_reader("alice", tokio::io::BufReader::new(reader));
    (Arc::new(gate), writer)
}

fn cancel_after(token: &CancellationToken, delay: Duration) {
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        canceller.cancel();
    });
}

#[tokio::test]
async fn test_cancel_interrupts_authorization_prompt() {
    let translate_calls = counter();
    let h = Harness::new(
        vec![
            fetch_page(counter(), 0),
            extract_title(counter()),
            translate(translate_calls.clone()),
        ],
        vec![translate_titles()],
    )
    .await;
    let (gate, _writer) = silent_console();
    let token = CancellationToken::new();
    cancel_after(&token, Duration::from_millis(50));

    let run = tokio::time::timeout(
        Duration::from_secs(3),
        h.orchestrator(gate)
            .start("translate_titles", inputs(&[("url", "https://example.com")]), token),
    )
    .await
    .expect("prompt must not outlive cancellation")
    .unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert!(run.reason.as_deref().unwrap_or_default().contains("cancelled"));
    assert_eq!(translate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_interrupts_clarification_prompt() {
    let h = Harness::new(vec![fetch_page(counter(), 0), extract_title(counter())], vec![page_titles()]).await;
    let (gate, _writer) = silent_console();
    let token = CancellationToken::new();
    cancel_after(&token, Duration::from_millis(50));

    let run = tokio::time::timeout(
        Duration::from_secs(3),
        h.orchestrator(gate).start("page_titles", Map::new(), token),
    )
    .await
    .expect("prompt must not outlive cancellation")
    .unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert!(run.reason.as_deref().unwrap_or_default().contains("cancelled"));
    assert!(run.records.is_empty());
}

#[tokio::test]
async fn test_missing_input_clarified_from_archive() {
    let h = Harness::new(vec![fetch_page(counter(), 0), extract_title(counter())], vec![page_titles()]).await;
    let orchestrator = h.orchestrator(policy());
    let run = orchestrator
        .start("page_titles", Map::new(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.state, RunState::AwaitingClarification);
    assert!(run.reason.as_deref().unwrap_or_default().contains("url"));

    let archived = h.archive.load(run.id).await.unwrap();
    let err = orchestrator
        .resume(archived.clone(), Resolution::Grant { by: "alice".into() }, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::NotSuspended { .. }));

    let run = orchestrator
        .resume(
            archived,
            Resolution::Provide(inputs(&[("url", "https://example.com")])),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    h.assert_outputs_present(&run).await;
    assert_eq!(h.archive.load(run.id).await.unwrap().state, RunState::Succeeded);
}

/// 在第一次决策时抢先修订同一指令，模拟并发运行
struct Interloper {
    store: Arc<DirectiveStore>,
    fired: AtomicBool,
}

#[async_trait]
impl DecisionOracle for Interloper {
    async fn decide(&self, state: &DirectiveState<'_>) -> Result<Action, ConductorError> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let lesson = Lesson::new(LessonKind::Constraint, "fetch_page", "another run learned this first");
            self.store
                .amend(&state.directive.id, state.directive.revision, &lesson)
                .await?;
        }
        SequentialOracle.decide(state).await
    }
}

#[tokio::test]
async fn test_lesson_commit_conflict_is_reported() {
    let h = Harness::new(vec![fetch_page(counter(), 0), extract_title(counter())], vec![page_titles()]).await;
    let oracle = Arc::new(Interloper {
        store: h.store.clone(),
        fired: AtomicBool::new(false),
    });
    let run = h
        .orchestrator_with(policy(), oracle)
        .start("page_titles", inputs(&[("url", "example.com")]), CancellationToken::new())
        .await
        .unwrap();

    // 运行本身成功，但 Lesson 未提交且没有丢失
    h.assert_outputs_present(&run).await;
    assert!(run.committed_lessons.is_empty());
    assert_eq!(run.pending_lessons.len(), 1);
    assert!(run
        .commit_error
        .as_deref()
        .unwrap_or_default()
        .contains("Concurrent amendment"));

    let directive = h.store.load("page_titles").await.unwrap();
    assert_eq!(directive.revision, run.directive_revision + 1);
    assert_eq!(
        directive.history.last().unwrap().kind,
        RevisionKind::Lesson(LessonKind::Constraint)
    );
}
