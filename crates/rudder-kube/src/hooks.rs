//! Hook execution
//!
//! Hooks attached to an event run one at a time in weight order. Each hook
//! is applied, then awaited (Jobs until complete). Delete policies decide
//! whether the previous instance is removed before creation and whether the
//! hook resource is removed after it succeeds or fails. A hook without any
//! delete policy behaves as `before-hook-creation`.

use std::time::Duration;

use rudder_core::{Hook, HookDeletePolicy, HookEvent};
use tracing::{debug, info, warn};

use crate::error::{KubeError, Result};
use crate::resources::ResourceClient;

/// How long a single hook may run
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs the hooks of a release against a [`ResourceClient`]
pub struct HookRunner<'a> {
    resources: &'a dyn ResourceClient,
    namespace: &'a str,
    timeout: Duration,
}

impl<'a> HookRunner<'a> {
    pub fn new(resources: &'a dyn ResourceClient, namespace: &'a str) -> Self {
        Self {
            resources,
            namespace,
            timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run every hook registered for `event`, stopping at the first failure
    pub async fn run(&self, hooks: &[Hook], event: HookEvent) -> Result<()> {
        let mut selected: Vec<&Hook> = hooks.iter().filter(|h| h.runs_on(event)).collect();
        if selected.is_empty() {
            return Ok(());
        }
        selected.sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.name.cmp(&b.name)));

        info!(event = %event, count = selected.len(), "running hooks");
        for hook in selected {
            self.run_one(hook, event).await?;
        }
        Ok(())
    }

    async fn run_one(&self, hook: &Hook, event: HookEvent) -> Result<()> {
        debug!(hook = %hook.name, weight = hook.weight, "executing hook");
        let failed = |message: String| KubeError::HookFailed {
            hook: hook.name.clone(),
            event: event.to_string(),
            message,
        };

        if hook.delete_policies.is_empty()
            || hook.has_delete_policy(HookDeletePolicy::BeforeHookCreation)
        {
            self.resources
                .delete(self.namespace, &hook.manifest)
                .await
                .map_err(|e| failed(e.to_string()))?;
        }

        let outcome = match self.resources.apply(self.namespace, &hook.manifest).await {
            Ok(summary) => summary.into_result().map(|_| ()),
            Err(e) => Err(e),
        };
        let outcome = match outcome {
            Ok(()) => {
                self.resources
                    .wait_for_hook(self.namespace, &hook.kind, &hook.name, self.timeout)
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                if hook.has_delete_policy(HookDeletePolicy::HookSucceeded) {
                    self.cleanup(hook).await;
                }
                Ok(())
            }
            Err(e) => {
                if hook.has_delete_policy(HookDeletePolicy::HookFailed) {
                    self.cleanup(hook).await;
                }
                Err(failed(e.to_string()))
            }
        }
    }

    async fn cleanup(&self, hook: &Hook) {
        if let Err(e) = self.resources.delete(self.namespace, &hook.manifest).await {
            warn!(hook = %hook.name, "failed to delete hook resource: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{Call, FakeResources};

    fn hook(name: &str, weight: i32, policies: Vec<HookDeletePolicy>) -> Hook {
        Hook {
            name: name.to_string(),
            kind: "Job".to_string(),
            path: format!("web/templates/{}.yaml", name),
            manifest: format!("apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: {}", name),
            events: vec![HookEvent::PreInstall],
            weight,
            delete_policies: policies,
        }
    }

    fn applied(calls: &[Call]) -> Vec<String> {
        calls
            .iter()
            .filter_map(|c| match c {
                Call::Wait(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_hooks_run_in_weight_order() {
        let fake = FakeResources::default();
        let hooks = vec![
            hook("late", 5, vec![HookDeletePolicy::HookSucceeded]),
            hook("early", -1, vec![HookDeletePolicy::HookSucceeded]),
            hook("middle", 0, vec![HookDeletePolicy::HookSucceeded]),
        ];

        HookRunner::new(&fake, "default")
            .run(&hooks, HookEvent::PreInstall)
            .await
            .unwrap();

        assert_eq!(applied(&fake.calls()), vec!["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn test_other_events_are_ignored() {
        let fake = FakeResources::default();
        let hooks = vec![hook("migrate", 0, vec![])];

        HookRunner::new(&fake, "default")
            .run(&hooks, HookEvent::PostInstall)
            .await
            .unwrap();

        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_default_policy_deletes_before_creation() {
        let fake = FakeResources::default();
        let hooks = vec![hook("migrate", 0, vec![])];

        HookRunner::new(&fake, "default")
            .run(&hooks, HookEvent::PreInstall)
            .await
            .unwrap();

        let calls = fake.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[0], Call::Delete(_)));
        assert!(matches!(calls[1], Call::Apply(_)));
        assert_eq!(calls[2], Call::Wait("migrate".to_string()));
    }

    #[tokio::test]
    async fn test_failure_stops_and_cleans_up() {
        let fake = FakeResources::default();
        fake.fail_hook("first");
        let hooks = vec![
            hook("first", 0, vec![HookDeletePolicy::HookFailed]),
            hook("second", 1, vec![HookDeletePolicy::HookSucceeded]),
        ];

        let err = HookRunner::new(&fake, "default")
            .run(&hooks, HookEvent::PreInstall)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            KubeError::HookFailed { ref hook, ref event, .. } if hook == "first" && event == "pre-install"
        ));
        let calls = fake.calls();
        assert!(matches!(calls.last(), Some(Call::Delete(_))));
        assert!(!applied(&calls).contains(&"second".to_string()));
    }

    #[tokio::test]
    async fn test_rejected_apply_fails_hook() {
        let fake = FakeResources::default();
        fake.fail_on("name: broken");
        let hooks = vec![hook("broken", 0, vec![HookDeletePolicy::HookSucceeded])];

        let err = HookRunner::new(&fake, "default")
            .run(&hooks, HookEvent::PreInstall)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("hook 'broken' failed during pre-install"));
        assert!(applied(&fake.calls()).is_empty());
    }
}
