//! 核心编排层：错误分类、运行状态、纠错与重试、决策器、人工闸门、主控循环、运行归档、取消监管

pub mod archive;
pub mod error;
pub mod gate;
pub mod oracle;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use archive::RunArchive;
pub use error::{ConductorError, FailureKind, ToolFault};
pub use gate::{
    parse_assignments, AuthorizationDecision, ClarificationAnswer, ConsoleGate, HumanGate,
    PolicyGate, Resolution,
};
pub use oracle::{
    parse_action, Action, CommandOracle, DecisionOracle, DirectiveState, SequentialOracle,
};
pub use orchestrator::{registry_from_config, Orchestrator, OrchestratorSettings};
pub use recovery::{
    AlternateToolRule, Fix, FixContext, FixRule, NumericCoercion, RetryPolicy, SelfCorrection,
    TrimWhitespace, UrlNormalization,
};
pub use session_supervisor::RunSupervisor;
pub use state::{
    Authorization, Authorizations, ExecutionRecord, Failure, Outcome, PlannedCall,
    PreflightRejection, RunState, TaskRun,
};
