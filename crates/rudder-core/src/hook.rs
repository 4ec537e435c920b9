//! Lifecycle hooks extracted from rendered manifests

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle event a hook is attached to
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

    /// Is this a "pre" event (runs before resources are touched)?
    pub fn is_pre(&self) -> bool {
        matches!(
            self,
            HookEvent::PreInstall
                | HookEvent::PreUpgrade
                | HookEvent::PreRollback
                | HookEvent::PreDelete
        )
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookEvent {
    type Err = CoreError;

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
            // "test-success" is the pre-3 spelling
            "test" | "test-success" => Ok(HookEvent::Test),
            other => Err(CoreError::UnknownHookEvent(other.to_string())),
        }
    }
}

/// When hook resources are deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookDeletePolicy {
    /// Delete the previous instance before creating the hook again
    BeforeHookCreation,
    /// Delete after the hook ran successfully
    HookSucceeded,
    /// Delete after the hook failed
    HookFailed,
}

impl FromStr for HookDeletePolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "before-hook-creation" => Ok(HookDeletePolicy::BeforeHookCreation),
            "hook-succeeded" => Ok(HookDeletePolicy::HookSucceeded),
            "hook-failed" => Ok(HookDeletePolicy::HookFailed),
            other => Err(CoreError::UnknownHookEvent(other.to_string())),
        }
    }
}

/// A rendered manifest that runs at a lifecycle event instead of being
/// applied with the release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    /// `metadata.name` of the hook resource
    pub name: String,

    /// Resource kind (e.g. `Job`)
    pub kind: String,

    /// Template path the hook was rendered from
    pub path: String,

    /// Rendered YAML document
    pub manifest: String,

    pub events: Vec<HookEvent>,

    /// Ordering weight (lower runs first)
    #[serde(default)]
    pub weight: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete_policies: Vec<HookDeletePolicy>,
}

impl Hook {
    pub fn runs_on(&self, event: HookEvent) -> bool {
        self.events.contains(&event)
    }

    pub fn has_delete_policy(&self, policy: HookDeletePolicy) -> bool {
        self.delete_policies.contains(&policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_events() {
        assert_eq!("pre-install".parse::<HookEvent>().unwrap(), HookEvent::PreInstall);
        assert_eq!(" post-rollback ".parse::<HookEvent>().unwrap(), HookEvent::PostRollback);
        assert_eq!("test-success".parse::<HookEvent>().unwrap(), HookEvent::Test);
        assert!("crd-install".parse::<HookEvent>().is_err());
        assert!("during-install".parse::<HookEvent>().is_err());
    }

    #[test]
    fn test_display_matches_parse() {
        for event in [
            HookEvent::PreInstall,
            HookEvent::PostDelete,
            HookEvent::PreUpgrade,
            HookEvent::Test,
        ] {
            assert_eq!(event.to_string().parse::<HookEvent>().unwrap(), event);
        }
    }

    #[test]
    fn test_pre_events() {
        assert!(HookEvent::PreDelete.is_pre());
        assert!(!HookEvent::PostInstall.is_pre());
        assert!(!HookEvent::Test.is_pre());
    }

    #[test]
    fn test_runs_on() {
        let hook = Hook {
            name: "migrate".to_string(),
            kind: "Job".to_string(),
            path: "app/templates/migrate.yaml".to_string(),
            manifest: String::new(),
            events: vec![HookEvent::PreInstall, HookEvent::PreUpgrade],
            weight: 0,
            delete_policies: vec![HookDeletePolicy::HookSucceeded],
        };
        assert!(hook.runs_on(HookEvent::PreUpgrade));
        assert!(!hook.runs_on(HookEvent::PostInstall));
        assert!(hook.has_delete_policy(HookDeletePolicy::HookSucceeded));
    }
}
