// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Permission checking for tool calls.
//!
//! The checker is a single-method capability.  The dispatcher wraps it with
//! a skill-scope wrapper while a skill is active: tool calls matching the
//! skill's allowed-tools patterns short-circuit to allow, everything else
//! falls through to the wrapped checker.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::tool::ToolCall;

/// What the checker decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionBehavior {
    Allow,
    Deny,
    /// The call needs interactive approval the current context cannot give.
    /// The dispatcher treats this the same as a deny.
    Ask,
}

/// Outcome of a permission check.
#[derive(Debug, Clone)]
pub struct PermissionResult {
    pub behavior: PermissionBehavior,
    /// Replacement input for the tool, when the checker rewrote it.
    pub updated_input: Option<Value>,
    /// Permission rules the checker wants persisted (e.g. "always allow
    /// this command").  Opaque to the dispatcher.
    pub updated_rules: Vec<String>,
    pub message: Option<String>,
    /// When set on a deny, the loop stops entirely instead of feeding the
    /// denial back to the model.
    pub interrupt: bool,
    /// Correlation id of the checked tool-use block.
    pub tool_use_id: Option<String>,
}

impl PermissionResult {
    pub fn allow() -> Self {
        Self {
            behavior: PermissionBehavior::Allow,
            updated_input: None,
            updated_rules: Vec::new(),
            message: None,
            interrupt: false,
            tool_use_id: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            behavior: PermissionBehavior::Deny,
            message: Some(message.into()),
            ..Self::allow()
        }
    }

    pub fn ask(message: impl Into<String>) -> Self {
        Self {
            behavior: PermissionBehavior::Ask,
            message: Some(message.into()),
            ..Self::allow()
        }
    }

    pub fn with_interrupt(mut self) -> Self {
        self.interrupt = true;
        self
    }

    pub fn with_updated_input(mut self, input: Value) -> Self {
        self.updated_input = Some(input);
        self
    }

    pub fn for_call(mut self, call: &ToolCall) -> Self {
        self.tool_use_id = Some(call.id.clone());
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.behavior == PermissionBehavior::Allow
    }
}

/// Single-method permission capability.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check(&self, call: &ToolCall) -> PermissionResult;
}

/// Checker that allows everything.  The default for embedders that mediate
/// permissions elsewhere.
#[derive(Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn check(&self, call: &ToolCall) -> PermissionResult {
        PermissionResult::allow().for_call(call)
    }
}

// ─── Skill scope ─────────────────────────────────────────────────────────────

/// Ephemeral permission broadening tied to the currently invoked skill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillScope {
    pub skill_name: String,
    /// Allowed-tools patterns; see [`pattern_matches`] for the grammar.
    pub allowed_tools: Vec<String>,
}

impl SkillScope {
    pub fn permits(&self, call: &ToolCall) -> bool {
        self.allowed_tools.iter().any(|p| pattern_matches(p, call))
    }
}

/// Wraps a checker with an active skill scope: a pattern match
/// short-circuits to allow, otherwise the wrapped checker decides.
pub struct SkillScopeChecker {
    scope: SkillScope,
    inner: Arc<dyn PermissionChecker>,
}

impl SkillScopeChecker {
    pub fn new(scope: SkillScope, inner: Arc<dyn PermissionChecker>) -> Self {
        Self { scope, inner }
    }
}

#[async_trait]
impl PermissionChecker for SkillScopeChecker {
    async fn check(&self, call: &ToolCall) -> PermissionResult {
        if self.scope.permits(call) {
            return PermissionResult::allow().for_call(call);
        }
        self.inner.check(call).await
    }
}

// ─── Background mode ─────────────────────────────────────────────────────────

/// Checker for unattended runs: auto-allows only a pre-approved pattern set
/// and always denies the interactive ask-the-user tool (nobody is there to
/// answer).  Everything else is denied.
pub struct BackgroundChecker {
    approved: Vec<String>,
    ask_tool: String,
}

impl BackgroundChecker {
    pub fn new(approved: Vec<String>, ask_tool: impl Into<String>) -> Self {
        Self {
            approved,
            ask_tool: ask_tool.into(),
        }
    }
}

#[async_trait]
impl PermissionChecker for BackgroundChecker {
    async fn check(&self, call: &ToolCall) -> PermissionResult {
        if call.name == self.ask_tool {
            return PermissionResult::deny(format!(
                "{} is not available in background mode",
                self.ask_tool
            ))
            .for_call(call);
        }
        if self.approved.iter().any(|p| pattern_matches(p, call)) {
            return PermissionResult::allow().for_call(call);
        }
        PermissionResult::deny(format!(
            "{} is not pre-approved for background mode",
            call.name
        ))
        .for_call(call)
    }
}

// ─── Pattern grammar ─────────────────────────────────────────────────────────

/// Match an allowed-tools pattern against a tool call.
///
/// Grammar:
/// - `Name` — exact tool-name match.
/// - `mcp__*` — tool-name match by shell-style glob (`*`, `?`).
/// - `Name(arg-pattern)` — the name matches *and* the call's scalar argument
///   matches `arg-pattern`.  The scalar is `command` for Bash; for other
///   tools the first non-empty of `command`/`path`/`file_path`/`url`.
///   An arg-pattern of the form `prefix:*` matches by command word: the
///   scalar equals `prefix` or starts with `prefix` followed by a space.
///   Any other arg-pattern is a literal equality or shell-glob match.
pub fn pattern_matches(pattern: &str, call: &ToolCall) -> bool {
    if let Some((name_part, rest)) = pattern.split_once('(') {
        if let Some(arg_pattern) = rest.strip_suffix(')') {
            if !name_matches(name_part, &call.name) {
                return false;
            }
            let scalar = call_scalar(call).unwrap_or("");
            return arg_matches(arg_pattern, scalar);
        }
    }
    name_matches(pattern, &call.name)
}

fn name_matches(pattern: &str, name: &str) -> bool {
    if pattern.contains('*') || pattern.contains('?') {
        glob_to_regex(pattern).is_some_and(|re| re.is_match(name))
    } else {
        pattern == name
    }
}

/// The scalar argument a constrained pattern is checked against.
fn call_scalar(call: &ToolCall) -> Option<&str> {
    let field = |key: &str| {
        call.args
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    };
    if call.name == "Bash" {
        return field("command");
    }
    field("command")
        .or_else(|| field("path"))
        .or_else(|| field("file_path"))
        .or_else(|| field("url"))
}

fn arg_matches(pattern: &str, value: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix(":*") {
        return value == prefix || value.starts_with(&format!("{prefix} "));
    }
    if pattern.contains('*') || pattern.contains('?') {
        return glob_to_regex(pattern).is_some_and(|re| re.is_match(value));
    }
    pattern == value
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "t1".into(),
            name: name.into(),
            args,
        }
    }

    // ── Bare and glob names ───────────────────────────────────────────────────

    #[test]
    fn bare_name_exact_match() {
        assert!(pattern_matches("Read", &call("Read", json!({}))));
        assert!(!pattern_matches("Read", &call("Write", json!({}))));
    }

    #[test]
    fn glob_name_matches_prefix_family() {
        let c = call("mcp__server__list", json!({}));
        assert!(pattern_matches("mcp__*", &c));
        assert!(!pattern_matches("mcp__*", &call("Bash", json!({}))));
    }

    #[test]
    fn question_mark_matches_single_char() {
        assert!(pattern_matches("Tool?", &call("Tool1", json!({}))));
        assert!(!pattern_matches("Tool?", &call("Tool12", json!({}))));
    }

    // ── Constrained form ──────────────────────────────────────────────────────

    #[test]
    fn bash_prefix_pattern_matches_command_word() {
        let p = "Bash(git:*)";
        assert!(pattern_matches(p, &call("Bash", json!({"command": "git"}))));
        assert!(pattern_matches(p, &call("Bash", json!({"command": "git status"}))));
        assert!(!pattern_matches(p, &call("Bash", json!({"command": "github-cli"}))));
        assert!(!pattern_matches(p, &call("Bash", json!({"command": "rm -rf /"}))));
    }

    #[test]
    fn constrained_name_must_match_too() {
        assert!(!pattern_matches(
            "Bash(git:*)",
            &call("Shell", json!({"command": "git status"}))
        ));
    }

    #[test]
    fn literal_arg_pattern_is_exact() {
        let p = "Bash(ls -la)";
        assert!(pattern_matches(p, &call("Bash", json!({"command": "ls -la"}))));
        assert!(!pattern_matches(p, &call("Bash", json!({"command": "ls"}))));
    }

    #[test]
    fn glob_arg_pattern_matches() {
        let p = "Read(/etc/*)";
        assert!(pattern_matches(
            p,
            &call("Read", json!({"file_path": "/etc/hosts"}))
        ));
        assert!(!pattern_matches(
            p,
            &call("Read", json!({"file_path": "/home/user"}))
        ));
    }

    #[test]
    fn non_bash_scalar_falls_through_field_order() {
        // `path` wins over `file_path` when both exist; empty strings skipped.
        let c = call("Fetch", json!({"command": "", "path": "/tmp/x", "url": "http://a"}));
        assert!(pattern_matches("Fetch(/tmp/*)", &c));
    }

    #[test]
    fn url_scalar_is_used_when_others_absent() {
        let c = call("WebFetch", json!({"url": "https://example.com/doc"}));
        assert!(pattern_matches("WebFetch(https://example.com/*)", &c));
    }

    #[test]
    fn missing_scalar_only_matches_empty_patterns() {
        let c = call("Bash", json!({}));
        assert!(!pattern_matches("Bash(git:*)", &c));
        assert!(pattern_matches("Bash(*)", &c));
    }

    // ── SkillScope ────────────────────────────────────────────────────────────

    #[test]
    fn scope_permits_any_matching_pattern() {
        let scope = SkillScope {
            skill_name: "deploy".into(),
            allowed_tools: vec!["Read".into(), "Bash(kubectl:*)".into()],
        };
        assert!(scope.permits(&call("Read", json!({}))));
        assert!(scope.permits(&call("Bash", json!({"command": "kubectl get pods"}))));
        assert!(!scope.permits(&call("Bash", json!({"command": "rm -rf /"}))));
    }

    struct DenyAll;

    #[async_trait]
    impl PermissionChecker for DenyAll {
        async fn check(&self, call: &ToolCall) -> PermissionResult {
            PermissionResult::deny("nope").for_call(call)
        }
    }

    #[tokio::test]
    async fn scope_wrapper_short_circuits_to_allow() {
        let scope = SkillScope {
            skill_name: "s".into(),
            allowed_tools: vec!["Grep".into()],
        };
        let checker = SkillScopeChecker::new(scope, Arc::new(DenyAll));
        let r = checker.check(&call("Grep", json!({}))).await;
        assert!(r.is_allowed());
    }

    #[tokio::test]
    async fn scope_wrapper_falls_through_to_inner() {
        let scope = SkillScope {
            skill_name: "s".into(),
            allowed_tools: vec!["Grep".into()],
        };
        let checker = SkillScopeChecker::new(scope, Arc::new(DenyAll));
        let r = checker.check(&call("Bash", json!({}))).await;
        assert_eq!(r.behavior, PermissionBehavior::Deny);
    }

    // ── BackgroundChecker ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn background_allows_only_approved() {
        let checker = BackgroundChecker::new(
            vec!["Read".into(), "Bash(git:*)".into()],
            "AskUserQuestion",
        );
        assert!(checker.check(&call("Read", json!({}))).await.is_allowed());
        assert!(checker
            .check(&call("Bash", json!({"command": "git log"})))
            .await
            .is_allowed());
        assert!(!checker
            .check(&call("Write", json!({})))
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn background_always_denies_ask_tool() {
        // Even an explicit approval cannot enable the interactive tool.
        let checker =
            BackgroundChecker::new(vec!["AskUserQuestion".into()], "AskUserQuestion");
        let r = checker.check(&call("AskUserQuestion", json!({}))).await;
        assert_eq!(r.behavior, PermissionBehavior::Deny);
    }

    // ── PermissionResult ──────────────────────────────────────────────────────

    #[test]
    fn deny_with_interrupt_carries_both() {
        let r = PermissionResult::deny("stop").with_interrupt();
        assert_eq!(r.behavior, PermissionBehavior::Deny);
        assert!(r.interrupt);
        assert_eq!(r.message.as_deref(), Some("stop"));
    }

    #[test]
    fn ask_is_not_allowed() {
        assert!(!PermissionResult::ask("confirm?").is_allowed());
    }
}
