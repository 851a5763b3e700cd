//! 指令的 Markdown 格式：解析与渲染
//!
//! ```text
//! # Directive: <id>
//! revision: <n>
//!
//! ## Goal / ## Inputs / ## Tools / ## Outputs / ## Edge Cases / ## Revision Log
//! ```
//! 列表段落每行一个 `- ` 条目；边界情况为 `- **key**: note`；修订日志为 `- r<n> | <rfc3339> | <kind> | <summary>`。

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::core::ConductorError;
use crate::directive::model::{DeclaredInput, Directive, EdgeCase, Revision, RevisionKind};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Goal,
    Inputs,
    Tools,
    Outputs,
    EdgeCases,
    RevisionLog,
}

impl Section {
    fn from_heading(heading: &str) -> Option<Self> {
        match heading.trim().to_lowercase().as_str() {
            "goal" => Some(Self::Goal),
            "inputs" => Some(Self::Inputs),
            "tools" => Some(Self::Tools),
            "outputs" => Some(Self::Outputs),
            "edge cases" => Some(Self::EdgeCases),
            "revision log" => Some(Self::RevisionLog),
            _ => None,
        }
    }
}

fn parse_err(line_no: usize, msg: impl std::fmt::Display) -> ConductorError {
    ConductorError::Parse(format!("line {}: {}", line_no + 1, msg))
}

static TITLE_RE: OnceLock<Regex> = OnceLock::new();
static REVISION_RE: OnceLock<Regex> = OnceLock::new();
static EDGE_RE: OnceLock<Regex> = OnceLock::new();
static LOG_RE: OnceLock<Regex> = OnceLock::new();

/// Goal 中以 `## ` 开头的行会被读成段落标题：渲染时多加一个反斜杠，解析时去掉一个
fn escape_goal_line(line: &str) -> String {
    if line.trim_start_matches('\\').starts_with("## ") {
        format!("\\{}", line)
    } else {
        line.to_string()
    }
}

fn unescape_goal_line(line: &str) -> &str {
    match line.strip_prefix('\\') {
        Some(rest) if rest.trim_start_matches('\\').starts_with("## ") => rest,
        _ => line,
    }
}

/// 解析 Markdown 指令
pub fn parse(text: &str) -> Result<Directive, ConductorError> {
    let title_re = TITLE_RE.get_or_init(|| Regex::new(r"^#\s+Directive:\s*(\S+)\s*$").expect("static regex"));
    let revision_re = REVISION_RE.get_or_init(|| Regex::new(r"^revision:\s*(\d+)\s*$").expect("static regex"));
    let edge_re = EDGE_RE.get_or_init(|| Regex::new(r"^\*\*(.+?)\*\*:\s*(.*)$").expect("static regex"));
    let log_re = LOG_RE.get_or_init(|| {
        Regex::new(r"^r(\d+)\s*\|\s*(\S+)\s*\|\s*(\S+)\s*\|\s*(.*)$").expect("static regex")
    });

    let mut id: Option<String> = None;
    let mut revision = 0u64;
    let mut goal_lines: Vec<&str> = Vec::new();
    let mut directive = Directive::draft("", "");
    let mut section = Section::Preamble;

    for (no, raw) in text.lines().enumerate() {
        let line = raw.trim_end();
        if let Some(heading) = line.strip_prefix("## ") {
            section = Section::from_heading(heading)
                .ok_or_else(|| parse_err(no, format!("unknown section '{}'", heading.trim())))?;
            continue;
        }
        if section == Section::Goal {
            goal_lines.push(unescape_goal_line(line));
            continue;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if section == Section::Preamble {
            if let Some(c) = title_re.captures(trimmed) {
                id = Some(c[1].to_string());
            } else if let Some(c) = revision_re.captures(trimmed) {
                revision = c[1].parse().map_err(|e| parse_err(no, e))?;
            } else {
                return Err(parse_err(no, "expected '# Directive: <id>' or 'revision: <n>'"));
            }
            continue;
        }
        let item = trimmed
            .strip_prefix("- ")
            .ok_or_else(|| parse_err(no, "expected a '- ' list item"))?
            .trim();
        match section {
            Section::Inputs => {
                let (name, value) = match item.split_once(':') {
                    Some((n, v)) => (n.trim(), Some(v.trim().to_string()).filter(|v| !v.is_empty())),
                    None => (item, None),
                };
                directive.inputs.push(DeclaredInput {
                    name: name.to_string(),
                    value,
                });
            }
            Section::Tools => directive.tools.push(item.to_string()),
            Section::Outputs => directive.outputs.push(item.to_string()),
            Section::EdgeCases => {
                let c = edge_re
                    .captures(item)
                    .ok_or_else(|| parse_err(no, "expected '- **key**: note'"))?;
                directive.edge_cases.push(EdgeCase::new(&c[1], &c[2]));
            }
            Section::RevisionLog => {
                let c = log_re
                    .captures(item)
                    .ok_or_else(|| parse_err(no, "expected '- r<n> | <time> | <kind> | <summary>'"))?;
                let number = c[1].parse().map_err(|e| parse_err(no, e))?;
                let at = DateTime::parse_from_rfc3339(&c[2])
                    .map_err(|e| parse_err(no, e))?
                    .with_timezone(&Utc);
                let kind: RevisionKind = c[3].parse().map_err(|e| parse_err(no, e))?;
                directive.history.push(Revision {
                    number,
                    at,
                    kind,
                    summary: c[4].trim().to_string(),
                });
            }
            Section::Preamble | Section::Goal => unreachable!(),
        }
    }

    directive.id = id.ok_or_else(|| ConductorError::Parse("missing '# Directive: <id>' title".into()))?;
    directive.revision = revision;
    directive.goal = goal_lines.join("\n").trim().to_string();
    if directive.goal.is_empty() {
        return Err(ConductorError::Parse(format!(
            "directive '{}' has no goal",
            directive.id
        )));
    }
    Ok(directive)
}

fn one_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 渲染为 Markdown；条目中的换行折叠为空格，保证可被 parse 读回
pub fn render(d: &Directive) -> String {
    let goal = d
        .goal
        .trim()
        .lines()
        .map(escape_goal_line)
        .collect::<Vec<_>>()
        .join("\n");
    let mut out = format!("# Directive: {}\nrevision: {}\n\n## Goal\n\n{}\n", d.id, d.revision, goal);

    out.push_str("\n## Inputs\n\n");
    for input in &d.inputs {
        match &input.value {
            Some(v) => out.push_str(&format!("- {}: {}\n", input.name, one_line(v))),
            None => out.push_str(&format!("- {}\n", input.name)),
        }
    }
    out.push_str("\n## Tools\n\n");
    for tool in &d.tools {
        out.push_str(&format!("- {}\n", tool));
    }
    out.push_str("\n## Outputs\n\n");
    for output in &d.outputs {
        out.push_str(&format!("- {}\n", output));
    }
    out.push_str("\n## Edge Cases\n\n");
    for edge in &d.edge_cases {
        out.push_str(&format!("- **{}**: {}\n", one_line(&edge.key), one_line(&edge.note)));
    }
    out.push_str("\n## Revision Log\n\n");
    for rev in &d.history {
        out.push_str(&format!(
            "- r{} | {} | {} | {}\n",
            rev.number,
            rev.at.to_rfc3339(),
            rev.kind,
            one_line(&rev.summary)
        ));
    }
    out
}
