//! Declarative allow/deny policy and the pure decision functions over it.
//!
//! - `delivery` mode is default-deny: a path or command must match an allow rule and
//!   must not match a deny rule.
//! - `core` mode is default-allow: only deny rules apply.
//!
//! Deny always wins. File rules use directory-prefix semantics relative to the
//! workdir; command allow rules are literal prefixes and deny rules are substrings.
//! A small built-in list of destructive command patterns is denied for every policy.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::paths::{display_relative, is_within};

/// Destructive command fragments denied regardless of policy or mode.
pub const BUILTIN_COMMAND_DENY: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "rm -rf *",
    "mkfs",
    "dd if=",
    ":(){ :|:& };:",
    "> /dev/sd",
    "chmod -R 777 /",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Default-deny.
    Delivery,
    /// Default-allow; only deny rules are enforced.
    #[default]
    Core,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileRules {
    pub allow_read: Vec<String>,
    pub allow_write: Vec<String>,
    pub deny_read: Vec<String>,
    pub deny_write: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandRules {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

/// Advisory command classes that callers may surface before running a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalClass {
    Network,
    Destructive,
    DependencyInstall,
    GitPush,
    Publish,
}

impl ApprovalClass {
    fn patterns(self) -> &'static [&'static str] {
        match self {
            ApprovalClass::Network => &["curl ", "wget ", "ssh ", "scp "],
            ApprovalClass::Destructive => &[
                "rm -r",
                "rm -f",
                "git reset --hard",
                "git clean",
                "drop table",
            ],
            ApprovalClass::DependencyInstall => &[
                "npm install",
                "npm i ",
                "yarn add",
                "pnpm add",
                "pip install",
                "cargo add",
                "cargo install",
            ],
            ApprovalClass::GitPush => &["git push"],
            ApprovalClass::Publish => &["npm publish", "cargo publish", "docker push"],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalClass::Network => "network",
            ApprovalClass::Destructive => "destructive",
            ApprovalClass::DependencyInstall => "dependency_install",
            ApprovalClass::GitPush => "git_push",
            ApprovalClass::Publish => "publish",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalRules {
    pub required_for: Vec<ApprovalClass>,
    pub require_reason: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckRules {
    /// Check names that must pass before a commit.
    pub required: Vec<String>,
    pub rollback_on_fail: bool,
    /// Optional check name → shell command overrides.
    pub commands: BTreeMap<String, String>,
}

impl Default for CheckRules {
    fn default() -> Self {
        Self {
            required: Vec::new(),
            rollback_on_fail: true,
            commands: BTreeMap::new(),
        }
    }
}

impl CheckRules {
    /// Resolve a check name to the shell command that runs it.
    pub fn command_for(&self, name: &str) -> String {
        if let Some(command) = self.commands.get(name) {
            return command.clone();
        }
        match name {
            "test" => "npm test".to_string(),
            "lint" | "build" | "typecheck" => format!("npm run {name}"),
            other => other.to_string(),
        }
    }
}

/// Immutable policy value. Executors share it behind an `Arc` and may swap it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RalphPolicy {
    pub mode: PolicyMode,
    pub files: FileRules,
    pub commands: CommandRules,
    pub approval: ApprovalRules,
    pub checks: CheckRules,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    FileReadDenied,
    FileWriteDenied,
    CommandDenied,
}

impl ViolationType {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationType::FileReadDenied => "file read denied",
            ViolationType::FileWriteDenied => "file write denied",
            ViolationType::CommandDenied => "command denied",
        }
    }
}

/// Record of a denied operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    #[serde(rename = "type")]
    pub violation_type: ViolationType,
    pub rule: String,
    pub detail: String,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Policy violation: {} ({}): {}",
            self.violation_type.as_str(),
            self.rule,
            self.detail
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub violation: Option<PolicyViolation>,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            violation: None,
        }
    }

    fn deny(violation_type: ViolationType, rule: &str, detail: String) -> Self {
        Self {
            allowed: false,
            violation: Some(PolicyViolation {
                violation_type,
                rule: rule.to_string(),
                detail,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub requires_approval: bool,
    pub approval_class: Option<ApprovalClass>,
}

/// Permissive baseline: read/write everywhere, core mode, built-in command denies only.
pub fn default_policy() -> RalphPolicy {
    RalphPolicy {
        mode: PolicyMode::Core,
        files: FileRules {
            allow_read: vec![".".to_string()],
            allow_write: vec![".".to_string()],
            deny_read: Vec::new(),
            deny_write: Vec::new(),
        },
        commands: CommandRules::default(),
        approval: ApprovalRules::default(),
        checks: CheckRules::default(),
    }
}

pub fn check_file_read(policy: &RalphPolicy, path: &Path, workdir: &Path) -> PolicyDecision {
    check_file(
        policy,
        path,
        workdir,
        FileAccess {
            violation_type: ViolationType::FileReadDenied,
            allow: &policy.files.allow_read,
            deny: &policy.files.deny_read,
            allow_list_name: "files.allowRead",
        },
    )
}

pub fn check_file_write(policy: &RalphPolicy, path: &Path, workdir: &Path) -> PolicyDecision {
    check_file(
        policy,
        path,
        workdir,
        FileAccess {
            violation_type: ViolationType::FileWriteDenied,
            allow: &policy.files.allow_write,
            deny: &policy.files.deny_write,
            allow_list_name: "files.allowWrite",
        },
    )
}

/// First `files.denyRead` rule covering `path`, regardless of mode or allow-list.
pub fn read_denied_by_rule<'a>(
    policy: &'a RalphPolicy,
    path: &Path,
    workdir: &Path,
) -> Option<&'a str> {
    policy
        .files
        .deny_read
        .iter()
        .find(|rule| is_within(path, Path::new(rule.as_str()), workdir))
        .map(String::as_str)
}

struct FileAccess<'a> {
    violation_type: ViolationType,
    allow: &'a [String],
    deny: &'a [String],
    allow_list_name: &'static str,
}

fn check_file(
    policy: &RalphPolicy,
    path: &Path,
    workdir: &Path,
    access: FileAccess<'_>,
) -> PolicyDecision {
    let shown = display_relative(path, workdir);
    if let Some(rule) = access
        .deny
        .iter()
        .find(|rule| is_within(path, Path::new(rule.as_str()), workdir))
    {
        return PolicyDecision::deny(access.violation_type, rule, shown);
    }
    if policy.mode == PolicyMode::Core {
        return PolicyDecision::allow();
    }
    let allowed = access
        .allow
        .iter()
        .any(|rule| is_within(path, Path::new(rule.as_str()), workdir));
    if allowed {
        PolicyDecision::allow()
    } else {
        PolicyDecision::deny(access.violation_type, access.allow_list_name, shown)
    }
}

/// Decide whether `command` may run.
///
/// The built-in destructive list and `commands.deny` are checked first in every mode;
/// `commands.allow` only applies in delivery mode.
pub fn check_command(policy: &RalphPolicy, command: &str) -> PolicyDecision {
    if let Some(decision) = check_command_denies(policy, command) {
        return decision;
    }
    if policy.mode == PolicyMode::Core {
        return PolicyDecision::allow();
    }
    let trimmed = command.trim();
    let allowed = policy
        .commands
        .allow
        .iter()
        .any(|rule| !rule.is_empty() && trimmed.starts_with(rule.as_str()));
    if allowed {
        PolicyDecision::allow()
    } else {
        PolicyDecision::deny(
            ViolationType::CommandDenied,
            "commands.allow",
            command.to_string(),
        )
    }
}

/// Deny-list half of [`check_command`]: `Some` when a deny rule matches.
pub fn check_command_denies(policy: &RalphPolicy, command: &str) -> Option<PolicyDecision> {
    builtin_command_denial(command).or_else(|| {
        policy
            .commands
            .deny
            .iter()
            .find(|rule| !rule.is_empty() && command.contains(rule.as_str()))
            .map(|rule| PolicyDecision::deny(ViolationType::CommandDenied, rule, command.to_string()))
    })
}

/// Built-in destructive-pattern check, applied even without a policy.
pub fn builtin_command_denial(command: &str) -> Option<PolicyDecision> {
    BUILTIN_COMMAND_DENY
        .iter()
        .find(|pattern| command.contains(**pattern))
        .map(|pattern| {
            PolicyDecision::deny(ViolationType::CommandDenied, pattern, command.to_string())
        })
}

/// Advisory: report the first configured approval class matching `command`.
pub fn requires_approval(policy: &RalphPolicy, command: &str) -> ApprovalDecision {
    let lowered = command.to_lowercase();
    let class = policy.approval.required_for.iter().copied().find(|class| {
        class
            .patterns()
            .iter()
            .any(|pattern| lowered.contains(*pattern))
    });
    ApprovalDecision {
        requires_approval: class.is_some(),
        approval_class: class,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKDIR: &str = "/repo";

    fn delivery(allow_commands: &[&str]) -> RalphPolicy {
        RalphPolicy {
            mode: PolicyMode::Delivery,
            commands: CommandRules {
                allow: allow_commands.iter().map(|s| s.to_string()).collect(),
                deny: Vec::new(),
            },
            ..RalphPolicy::default()
        }
    }

    fn workdir() -> &'static Path {
        Path::new(WORKDIR)
    }

    #[test]
    fn delivery_denies_commands_outside_allow_list() {
        let policy = delivery(&["npm test"]);
        let decision = check_command(&policy, "python x.py");
        assert!(!decision.allowed);
        let violation = decision.violation.expect("violation");
        assert_eq!(violation.violation_type, ViolationType::CommandDenied);
        assert_eq!(violation.rule, "commands.allow");
    }

    #[test]
    fn delivery_allow_entries_match_by_prefix() {
        let policy = delivery(&["npm test"]);
        assert!(check_command(&policy, "npm test").allowed);
        assert!(check_command(&policy, "npm test -- --grep parser").allowed);
        assert!(!check_command(&policy, "npm run build").allowed);
    }

    #[test]
    fn core_mode_skips_allow_list() {
        let mut policy = delivery(&["npm test"]);
        policy.mode = PolicyMode::Core;
        assert!(check_command(&policy, "python x.py").allowed);
    }

    #[test]
    fn deny_entries_match_anywhere_and_override_allow() {
        let mut policy = delivery(&["npm"]);
        policy.commands.deny = vec!["sudo".to_string()];
        let decision = check_command(&policy, "npm test && sudo reboot");
        assert!(!decision.allowed);
        assert_eq!(decision.violation.expect("violation").rule, "sudo");

        policy.mode = PolicyMode::Core;
        assert!(!check_command(&policy, "echo hi; sudo ls").allowed);
    }

    #[test]
    fn builtin_denies_apply_in_every_mode() {
        let permissive = default_policy();
        let decision = check_command(&permissive, "rm -rf / --no-preserve-root");
        assert!(!decision.allowed);
        assert_eq!(decision.violation.expect("violation").rule, "rm -rf /");

        let strict = delivery(&["rm"]);
        assert!(!check_command(&strict, "rm -rf ~").allowed);
    }

    #[test]
    fn delivery_file_rules_are_default_deny() {
        let mut policy = delivery(&[]);
        policy.files.allow_write = vec!["src".to_string()];
        assert!(check_file_write(&policy, Path::new("src/x.ts"), workdir()).allowed);

        let denied = check_file_write(&policy, Path::new("docs/readme.md"), workdir());
        assert!(!denied.allowed);
        let violation = denied.violation.expect("violation");
        assert_eq!(violation.violation_type, ViolationType::FileWriteDenied);
        assert_eq!(violation.rule, "files.allowWrite");
        assert_eq!(violation.detail, "docs/readme.md");

        assert!(!check_file_read(&policy, Path::new("src/x.ts"), workdir()).allowed);
    }

    #[test]
    fn file_deny_overrides_allow_in_both_modes() {
        let mut policy = delivery(&[]);
        policy.files.allow_read = vec![".".to_string()];
        policy.files.deny_read = vec![".env".to_string(), "secrets".to_string()];
        assert!(check_file_read(&policy, Path::new("src/main.rs"), workdir()).allowed);
        assert!(!check_file_read(&policy, Path::new(".env"), workdir()).allowed);
        assert!(!check_file_read(&policy, Path::new("secrets/key.pem"), workdir()).allowed);

        policy.mode = PolicyMode::Core;
        let decision = check_file_read(&policy, Path::new("secrets/key.pem"), workdir());
        assert_eq!(decision.violation.expect("violation").rule, "secrets");
    }

    #[test]
    fn core_mode_allows_unlisted_paths() {
        let policy = RalphPolicy::default();
        assert!(check_file_write(&policy, Path::new("anything/at/all"), workdir()).allowed);
    }

    #[test]
    fn default_policy_is_permissive() {
        let policy = default_policy();
        assert!(check_file_read(&policy, Path::new("a/b"), workdir()).allowed);
        assert!(check_file_write(&policy, Path::new("a/b"), workdir()).allowed);
        assert!(check_command(&policy, "python x.py").allowed);
    }

    #[test]
    fn approval_is_reported_for_configured_classes_only() {
        let mut policy = default_policy();
        assert!(!requires_approval(&policy, "git push origin main").requires_approval);

        policy.approval.required_for = vec![ApprovalClass::Publish, ApprovalClass::GitPush];
        let decision = requires_approval(&policy, "git push origin main");
        assert!(decision.requires_approval);
        assert_eq!(decision.approval_class, Some(ApprovalClass::GitPush));
        assert!(!requires_approval(&policy, "npm test").requires_approval);
    }

    #[test]
    fn check_names_resolve_to_commands() {
        let mut checks = CheckRules::default();
        assert_eq!(checks.command_for("test"), "npm test");
        assert_eq!(checks.command_for("lint"), "npm run lint");
        assert_eq!(checks.command_for("cargo clippy"), "cargo clippy");
        checks
            .commands
            .insert("test".to_string(), "cargo test".to_string());
        assert_eq!(checks.command_for("test"), "cargo test");
    }

    #[test]
    fn policy_parses_from_toml_with_defaults() {
        let raw = r#"
mode = "delivery"

[files]
allow_write = ["src"]

[commands]
allow = ["npm test"]

[approval]
required_for = ["git_push"]

[checks]
required = ["test"]
"#;
        let policy: RalphPolicy = toml::from_str(raw).expect("parse policy");
        assert_eq!(policy.mode, PolicyMode::Delivery);
        assert_eq!(policy.files.allow_write, vec!["src".to_string()]);
        assert!(policy.files.allow_read.is_empty());
        assert_eq!(policy.approval.required_for, vec![ApprovalClass::GitPush]);
        assert!(policy.checks.rollback_on_fail);
    }
}
