//! Annotation parsing with Helm compatibility
//!
//! Rudder reads `rudder.io/*` annotations first and falls back to the
//! `helm.sh/*` spelling so existing charts keep working.

use std::collections::BTreeMap;

use rudder_core::{HookDeletePolicy, HookEvent};

/// Rudder-native annotations
pub mod rudder {
    /// Hook events annotation
    pub const HOOK: &str = "rudder.io/hook";
    /// Hook weight for ordering
    pub const HOOK_WEIGHT: &str = "rudder.io/hook-weight";
    /// Hook delete policy
    pub const HOOK_DELETE_POLICY: &str = "rudder.io/hook-delete-policy";
    /// Resource policy (keep on uninstall)
    pub const RESOURCE_POLICY: &str = "rudder.io/resource-policy";
}

/// Helm-compatible annotations
pub mod helm {
    pub const HOOK: &str = "helm.sh/hook";
    pub const HOOK_WEIGHT: &str = "helm.sh/hook-weight";
    pub const HOOK_DELETE_POLICY: &str = "helm.sh/hook-delete-policy";
    pub const RESOURCE_POLICY: &str = "helm.sh/resource-policy";
}

/// Hook value that older charts used for CRDs; such documents are dropped
pub const LEGACY_CRD_INSTALL: &str = "crd-install";

/// Get annotation value, preferring Rudder over Helm
pub fn get_annotation<'a>(
    annotations: &'a BTreeMap<String, String>,
    rudder_key: &str,
    helm_key: &str,
) -> Option<&'a str> {
    annotations
        .get(rudder_key)
        .or_else(|| annotations.get(helm_key))
        .map(|s| s.as_str())
}

/// Raw hook annotation value, if any
pub fn hook_annotation(annotations: &BTreeMap<String, String>) -> Option<&str> {
    get_annotation(annotations, rudder::HOOK, helm::HOOK)
}

/// Split a comma-separated annotation value
pub fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Outcome of reading a hook annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvents {
    /// Every listed event is known
    Events(Vec<HookEvent>),
    /// `crd-install`: the document is not a resource nor a hook
    LegacyCrdInstall,
    /// At least one listed event is unknown
    Unknown(String),
}

/// Parse hook events from an annotation value
pub fn parse_hook_events(value: &str) -> HookEvents {
    let mut events = Vec::new();
    for item in split_list(value) {
        if item == LEGACY_CRD_INSTALL {
            return HookEvents::LegacyCrdInstall;
        }
        match item.parse::<HookEvent>() {
            Ok(event) => {
                if !events.contains(&event) {
                    events.push(event);
                }
            }
            Err(_) => return HookEvents::Unknown(item.to_string()),
        }
    }
    if events.is_empty() {
        HookEvents::Unknown(value.to_string())
    } else {
        HookEvents::Events(events)
    }
}

/// Parse hook weight (default: 0)
pub fn parse_hook_weight(annotations: &BTreeMap<String, String>) -> i32 {
    get_annotation(annotations, rudder::HOOK_WEIGHT, helm::HOOK_WEIGHT)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Parse hook delete policies; unknown entries are ignored
pub fn parse_delete_policies(annotations: &BTreeMap<String, String>) -> Vec<HookDeletePolicy> {
    get_annotation(annotations, rudder::HOOK_DELETE_POLICY, helm::HOOK_DELETE_POLICY)
        .map(|v| split_list(v).filter_map(|p| p.parse().ok()).collect())
        .unwrap_or_default()
}

/// Resource should survive uninstall
pub fn should_keep_resource(annotations: &BTreeMap<String, String>) -> bool {
    get_annotation(annotations, rudder::RESOURCE_POLICY, helm::RESOURCE_POLICY)
        .is_some_and(|v| v.trim() == "keep")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_rudder_key_preferred() {
        let ann = annotations(&[(rudder::HOOK, "pre-install"), (helm::HOOK, "post-install")]);
        assert_eq!(hook_annotation(&ann), Some("pre-install"));
    }

    #[test]
    fn test_helm_fallback() {
        let ann = annotations(&[(helm::HOOK_WEIGHT, "-5")]);
        assert_eq!(parse_hook_weight(&ann), -5);
    }

    #[test]
    fn test_weight_defaults_to_zero() {
        assert_eq!(parse_hook_weight(&BTreeMap::new()), 0);
        let ann = annotations(&[(rudder::HOOK_WEIGHT, "heavy")]);
        assert_eq!(parse_hook_weight(&ann), 0);
    }

    #[test]
    fn test_parse_hook_events() {
        assert_eq!(
            parse_hook_events("pre-install, post-upgrade"),
            HookEvents::Events(vec![HookEvent::PreInstall, HookEvent::PostUpgrade])
        );
        assert_eq!(parse_hook_events("crd-install"), HookEvents::LegacyCrdInstall);
        assert_eq!(
            parse_hook_events("pre-install,pre-launch"),
            HookEvents::Unknown("pre-launch".to_string())
        );
        assert!(matches!(parse_hook_events(" , "), HookEvents::Unknown(_)));
    }

    #[test]
    fn test_delete_policies() {
        let ann = annotations(&[(
            helm::HOOK_DELETE_POLICY,
            "before-hook-creation,hook-succeeded,sometimes",
        )]);
        assert_eq!(
            parse_delete_policies(&ann),
            vec![
                HookDeletePolicy::BeforeHookCreation,
                HookDeletePolicy::HookSucceeded
            ]
        );
    }

    #[test]
    fn test_keep_policy() {
        assert!(should_keep_resource(&annotations(&[(helm::RESOURCE_POLICY, "keep")])));
        assert!(!should_keep_resource(&annotations(&[(rudder::RESOURCE_POLICY, "delete")])));
    }
}
