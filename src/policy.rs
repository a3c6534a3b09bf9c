//! Tool call classification.
//!
//! [`classify`] is a pure function of the tool name, its input, the task's
//! working directory and the effective permission mode. Path isolation is
//! checked first and no mode can bypass it.

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use crate::config::PermissionMode;

/// Tools whose input names a file or directory.
const PATH_TOOLS: &[&str] = &["Read", "Write", "Edit", "NotebookEdit", "Glob", "Grep", "LS"];
const PATH_KEYS: &[&str] = &["file_path", "path", "notebook_path"];

/// Read-only or informational tools that never wait for a human.
const SAFE_TOOLS: &[&str] = &["Read", "Glob", "Grep", "WebFetch", "WebSearch", "LS"];

/// Tools that wait for a human unless the mode says otherwise.
const APPROVAL_TOOLS: &[&str] = &["Bash", "Write", "Edit", "NotebookEdit"];

const EDIT_TOOLS: &[&str] = &["Write", "Edit", "NotebookEdit"];

const READ_ONLY_COMMANDS: &[&str] = &["cat", "less", "head", "tail", "grep", "find", "ls", "tree"];

pub const QUESTION_TOOL: &str = "AskUserQuestion";
pub const EXIT_PLAN_TOOL: &str = "ExitPlanMode";
const PLANS_DIR_MARKER: &str = ".claude/plans/";
const PLAN_EXCERPT_CHARS: usize = 500;

static SYSTEM_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[\s'"=:;|&(<>])(/(?:etc|var|usr|home|tmp)/[^\s'";|&)<>]*)"#).unwrap()
});

static DEEP_TRAVERSAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.\./\.\.").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Classification {
    AutoAllow,
    /// Wait on the permission gate. `warning` flags a shell command that
    /// reaches outside the working tree; it does not deny anything.
    RequiresApproval { warning: Option<String> },
    RequiresAnswer {
        question: String,
        options: Vec<String>,
    },
    RequiresPlanReview {
        plan_file: Option<String>,
        plan_content: Option<String>,
    },
    Deny { reason: String },
}

impl Classification {
    pub fn is_gated(&self) -> bool {
        matches!(
            self,
            Classification::RequiresApproval { .. }
                | Classification::RequiresAnswer { .. }
                | Classification::RequiresPlanReview { .. }
        )
    }
}

pub fn classify(
    tool_name: &str,
    input: &Value,
    working_dir: &Path,
    mode: PermissionMode,
) -> Classification {
    if let Some(reason) = isolation_violation(tool_name, input, working_dir) {
        return Classification::Deny { reason };
    }

    if tool_name == QUESTION_TOOL {
        if let Some((question, options)) = extract_question(input) {
            return Classification::RequiresAnswer { question, options };
        }
    }

    if tool_name == EXIT_PLAN_TOOL {
        return Classification::RequiresPlanReview {
            plan_file: str_field(input, "planFile"),
            plan_content: str_field(input, "plan").or_else(|| str_field(input, "planContent")),
        };
    }

    if let Some(review) = plan_file_write(tool_name, input) {
        return review;
    }

    if SAFE_TOOLS.contains(&tool_name) {
        return Classification::AutoAllow;
    }

    if mode == PermissionMode::AcceptEdits && EDIT_TOOLS.contains(&tool_name) {
        return Classification::AutoAllow;
    }

    if APPROVAL_TOOLS.contains(&tool_name) {
        let warning = if tool_name == "Bash" {
            input
                .get("command")
                .and_then(Value::as_str)
                .and_then(|command| danger_warning(command, working_dir))
        } else {
            None
        };
        return Classification::RequiresApproval { warning };
    }

    Classification::AutoAllow
}

fn str_field(input: &Value, key: &str) -> Option<String> {
    input
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn str_or_empty<'a>(input: &'a Value, key: &str) -> &'a str {
    input.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn target_path(input: &Value) -> Option<&str> {
    PATH_KEYS
        .iter()
        .filter_map(|key| input.get(*key).and_then(Value::as_str))
        .find(|path| !path.is_empty())
}

fn isolation_violation(tool_name: &str, input: &Value, working_dir: &Path) -> Option<String> {
    if !PATH_TOOLS.contains(&tool_name) {
        return None;
    }
    let path = target_path(input)?;
    if is_within(Path::new(path), working_dir) {
        return None;
    }
    Some(format!(
        "Access denied: Path '{}' is outside the current project. You can only access files within: {}",
        path,
        working_dir.display()
    ))
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Whether `path`, resolved against `root` when relative, stays under `root`.
pub fn is_within(path: &Path, root: &Path) -> bool {
    let root = normalize(root);
    let full = if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&root.join(path))
    };
    full.starts_with(&root)
}

fn extract_question(input: &Value) -> Option<(String, Vec<String>)> {
    let first = input.get("questions")?.as_array()?.first()?;
    let question = first
        .get("question")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let options = first
        .get("options")
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .map(|opt| {
                    opt.get("label")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                })
                .collect()
        })
        .unwrap_or_default();
    Some((question, options))
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(PLAN_EXCERPT_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// A Write or Edit into the plans directory goes through plan review.
fn plan_file_write(tool_name: &str, input: &Value) -> Option<Classification> {
    if tool_name != "Write" && tool_name != "Edit" {
        return None;
    }
    let file_path = input.get("file_path").and_then(Value::as_str)?;
    if !file_path.contains(PLANS_DIR_MARKER) {
        return None;
    }
    let plan_content = if tool_name == "Edit" {
        format!(
            "Editing a plan:\n\nWas:\n{}\n\nIt became:\n{}",
            excerpt(str_or_empty(input, "old_string")),
            excerpt(str_or_empty(input, "new_string"))
        )
    } else {
        str_or_empty(input, "content").to_string()
    };
    Some(Classification::RequiresPlanReview {
        plan_file: Some(file_path.to_string()),
        plan_content: Some(plan_content),
    })
}

fn is_read_only_command(command: &str) -> bool {
    command
        .split_whitespace()
        .next()
        .is_some_and(|first| READ_ONLY_COMMANDS.contains(&first))
}

/// Warning text for a shell command that reaches outside `working_dir`.
pub fn danger_warning(command: &str, working_dir: &Path) -> Option<String> {
    if is_read_only_command(command) {
        return None;
    }
    let escapes_tree = SYSTEM_PATH
        .captures_iter(command)
        .filter_map(|caps| caps.get(1))
        .any(|m| !is_within(Path::new(m.as_str()), working_dir));
    if !escapes_tree && !DEEP_TRAVERSAL.is_match(command) {
        return None;
    }
    let shown: String = command.chars().take(100).collect();
    Some(format!("Command may access files outside the project: {}", shown))
}

/// Short human-readable summary of a tool call for a permission prompt.
pub fn describe_input(tool_name: &str, input: &Value) -> String {
    let field = match tool_name {
        "Bash" => input.get("command").and_then(Value::as_str),
        "Write" | "Edit" => input.get("file_path").and_then(Value::as_str),
        _ => None,
    };
    match field {
        Some(text) => text.to_string(),
        None => input.to_string().chars().take(PLAN_EXCERPT_CHARS).collect(),
    }
}
