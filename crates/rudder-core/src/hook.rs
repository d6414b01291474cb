//! Lifecycle hooks
//!
//! A hook is an ordinary manifest document annotated with one or more
//! trigger events. It is executed around a release transition and is never
//! part of the release's steady-state resources.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event that triggers a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEvent {
    PreInstall,
    PostInstall,
    PreDelete,
    PostDelete,
    PreUpgrade,
    PostUpgrade,
    PreRollback,
    PostRollback,
    Test,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::PreInstall => "pre-install",
            HookEvent::PostInstall => "post-install",
            HookEvent::PreDelete => "pre-delete",
            HookEvent::PostDelete => "post-delete",
            HookEvent::PreUpgrade => "pre-upgrade",
            HookEvent::PostUpgrade => "post-upgrade",
            HookEvent::PreRollback => "pre-rollback",
            HookEvent::PostRollback => "post-rollback",
            HookEvent::Test => "test",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pre-install" => Ok(HookEvent::PreInstall),
            "post-install" => Ok(HookEvent::PostInstall),
            "pre-delete" => Ok(HookEvent::PreDelete),
            "post-delete" => Ok(HookEvent::PostDelete),
            "pre-upgrade" => Ok(HookEvent::PreUpgrade),
            "post-upgrade" => Ok(HookEvent::PostUpgrade),
            "pre-rollback" => Ok(HookEvent::PreRollback),
            "post-rollback" => Ok(HookEvent::PostRollback),
            // "test-success" is the legacy spelling
            "test" | "test-success" => Ok(HookEvent::Test),
            other => Err(format!("unknown hook event '{}'", other)),
        }
    }
}

/// When a hook resource is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookDeletePolicy {
    /// Delete the previous hook resource before creating the new one
    BeforeHookCreation,
    HookSucceeded,
    HookFailed,
}

impl FromStr for HookDeletePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "before-hook-creation" => Ok(Self::BeforeHookCreation),
            "hook-succeeded" => Ok(Self::HookSucceeded),
            "hook-failed" => Ok(Self::HookFailed),
            other => Err(format!("unknown hook delete policy '{}'", other)),
        }
    }
}

/// When the hook's output is captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookOutputLogPolicy {
    HookSucceeded,
    HookFailed,
}

impl FromStr for HookOutputLogPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "hook-succeeded" => Ok(Self::HookSucceeded),
            "hook-failed" => Ok(Self::HookFailed),
            other => Err(format!("unknown hook output log policy '{}'", other)),
        }
    }
}

/// Phase of the last hook execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookPhase {
    #[default]
    Unknown,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HookPhase::Unknown => "unknown",
            HookPhase::Running => "running",
            HookPhase::Succeeded => "succeeded",
            HookPhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Record of the most recent run of a hook
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookExecution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub phase: HookPhase,

    /// Captured container output, when an output-log policy asked for it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

/// Hook definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    /// `metadata.name` of the hook resource
    pub name: String,

    pub kind: String,

    /// Template path the hook was rendered from
    pub path: String,

    /// Single-document manifest
    pub manifest: String,

    pub events: Vec<HookEvent>,

    /// Lower runs first
    #[serde(default)]
    pub weight: i32,

    #[serde(default)]
    pub delete_policies: Vec<HookDeletePolicy>,

    #[serde(default)]
    pub output_log_policies: Vec<HookOutputLogPolicy>,

    #[serde(default)]
    pub last_run: HookExecution,
}

impl Hook {
    /// Create a hook for the given events with default policies
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        path: impl Into<String>,
        manifest: impl Into<String>,
        events: Vec<HookEvent>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            path: path.into(),
            manifest: manifest.into(),
            events,
            weight: 0,
            delete_policies: Vec::new(),
            output_log_policies: Vec::new(),
            last_run: HookExecution::default(),
        }
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_delete_policy(mut self, policy: HookDeletePolicy) -> Self {
        if !self.delete_policies.contains(&policy) {
            self.delete_policies.push(policy);
        }
        self
    }

    pub fn with_output_log_policy(mut self, policy: HookOutputLogPolicy) -> Self {
        if !self.output_log_policies.contains(&policy) {
            self.output_log_policies.push(policy);
        }
        self
    }

    /// Check if this hook runs for an event
    pub fn runs_on(&self, event: HookEvent) -> bool {
        self.events.contains(&event)
    }

    /// Check a delete policy; no declared policy means `before-hook-creation`
    pub fn has_delete_policy(&self, policy: HookDeletePolicy) -> bool {
        if self.delete_policies.is_empty() {
            return policy == HookDeletePolicy::BeforeHookCreation;
        }
        self.delete_policies.contains(&policy)
    }

    pub fn has_output_log_policy(&self, policy: HookOutputLogPolicy) -> bool {
        self.output_log_policies.contains(&policy)
    }
}

/// Indices of the hooks that run for `event`, in execution order
///
/// Ordering is by ascending weight, then name. The sort is stable, so hooks
/// with equal weight and name keep their declaration order.
pub fn execution_order(hooks: &[Hook], event: HookEvent) -> Vec<usize> {
    let mut selected: Vec<usize> = hooks
        .iter()
        .enumerate()
        .filter(|(_, h)| h.runs_on(event))
        .map(|(i, _)| i)
        .collect();
    selected.sort_by(|&a, &b| {
        hooks[a]
            .weight
            .cmp(&hooks[b].weight)
            .then_with(|| hooks[a].name.cmp(&hooks[b].name))
    });
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(name: &str, weight: i32, events: Vec<HookEvent>) -> Hook {
        Hook::new(name, "Job", format!("templates/{}.yaml", name), "", events).with_weight(weight)
    }

    #[test]
    fn test_hook_event_parse() {
        assert_eq!("pre-install".parse::<HookEvent>(), Ok(HookEvent::PreInstall));
        assert_eq!(" post-rollback ".parse::<HookEvent>(), Ok(HookEvent::PostRollback));
        assert_eq!("test-success".parse::<HookEvent>(), Ok(HookEvent::Test));
        assert!("during-install".parse::<HookEvent>().is_err());
    }

    #[test]
    fn test_hook_event_display_matches_serde() {
        for event in [HookEvent::PreUpgrade, HookEvent::PostDelete, HookEvent::Test] {
            let json = serde_json::to_string(&event).unwrap();
            assert_eq!(json, format!("\"{}\"", event));
        }
    }

    #[test]
    fn test_default_delete_policy() {
        let h = hook("a", 0, vec![HookEvent::PreInstall]);
        assert!(h.has_delete_policy(HookDeletePolicy::BeforeHookCreation));
        assert!(!h.has_delete_policy(HookDeletePolicy::HookSucceeded));

        let h = h.with_delete_policy(HookDeletePolicy::HookSucceeded);
        assert!(!h.has_delete_policy(HookDeletePolicy::BeforeHookCreation));
        assert!(h.has_delete_policy(HookDeletePolicy::HookSucceeded));
    }

    #[test]
    fn test_execution_order_weight_then_name() {
        let hooks = vec![
            hook("b", 1, vec![HookEvent::PreInstall]),
            hook("a", 1, vec![HookEvent::PreInstall]),
            hook("z", 0, vec![HookEvent::PreInstall]),
            hook("skip", -5, vec![HookEvent::PostInstall]),
        ];

        let order: Vec<&str> = execution_order(&hooks, HookEvent::PreInstall)
            .into_iter()
            .map(|i| hooks[i].name.as_str())
            .collect();

        assert_eq!(order, vec!["z", "a", "b"]);
    }

    #[test]
    fn test_execution_order_negative_weights_first() {
        let hooks = vec![
            hook("late", 10, vec![HookEvent::Test]),
            hook("early", -10, vec![HookEvent::Test]),
        ];
        let order = execution_order(&hooks, HookEvent::Test);
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_hook_serde_defaults() {
        let json = r#"{"name":"x","kind":"Job","path":"p","manifest":"m","events":["test"]}"#;
        let h: Hook = serde_json::from_str(json).unwrap();
        assert_eq!(h.weight, 0);
        assert_eq!(h.last_run.phase, HookPhase::Unknown);
        assert!(h.delete_policies.is_empty());
    }
}
