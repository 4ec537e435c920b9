//! Release actions: install, upgrade, rollback and uninstall
//!
//! Every action runs its store checks (name validity, the pending-operation
//! guard, name availability) before touching the cluster. Once resources
//! have been applied, record writes go through
//! [`Configuration::record_release`] and no longer abort the action.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rudder_core::{Chart, HookEvent, Release, ReleaseStatus, Values, validate_release_name};
use tracing::{info, warn};

use crate::config::{Configuration, RenderOptions, RenderedRelease};
use crate::error::{KubeError, Result};
use crate::hooks::{DEFAULT_HOOK_TIMEOUT, HookRunner};
use crate::labels::ReleaseLabel;
use crate::manifest::{KindOrder, join_documents, parse_release_manifest, sort_by_kind};
use crate::postrender::PostRenderer;
use crate::resources::ResourceClient;
use crate::storage::OWNER;

/// Options for install operation
#[derive(Clone)]
pub struct InstallOptions {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Render only: no cluster contact, no record written
    pub dry_run: bool,

    /// Re-use the name of an uninstalled or failed release
    pub replace: bool,

    /// Keep the notes of sub-charts
    pub sub_notes: bool,

    /// Put the chart's CRDs into the rendered manifest instead of
    /// applying them ahead of it
    pub include_crds: bool,

    /// Do not install the chart's CRDs before the release
    pub skip_crds: bool,

    /// Do not run hooks
    pub disable_hooks: bool,

    /// Custom labels to add to the release record
    pub labels: BTreeMap<String, String>,

    /// Description for this release
    pub description: Option<String>,

    /// Tracking label stamped onto rendered workloads
    pub release_label: Option<ReleaseLabel>,

    pub post_renderer: Option<Arc<dyn PostRenderer>>,

    /// Per-hook timeout
    pub hook_timeout: Duration,
}

impl InstallOptions {
    /// Create default install options with name and namespace
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            dry_run: false,
            replace: false,
            sub_notes: false,
            include_crds: false,
            skip_crds: false,
            disable_hooks: false,
            labels: BTreeMap::new(),
            description: None,
            release_label: None,
            post_renderer: None,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    /// Enable dry-run mode
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn replace(mut self) -> Self {
        self.replace = true;
        self
    }

    pub fn with_sub_notes(mut self) -> Self {
        self.sub_notes = true;
        self
    }

    pub fn include_crds(mut self) -> Self {
        self.include_crds = true;
        self
    }

    pub fn skip_crds(mut self) -> Self {
        self.skip_crds = true;
        self
    }

    pub fn no_hooks(mut self) -> Self {
        self.disable_hooks = true;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Stamp `rudder.io/release=<name>` onto supported kinds
    pub fn with_release_label(mut self) -> Self {
        self.release_label = Some(ReleaseLabel::for_release(self.name.clone()));
        self
    }

    pub fn with_post_renderer(mut self, post_renderer: Arc<dyn PostRenderer>) -> Self {
        self.post_renderer = Some(post_renderer);
        self
    }
}

/// Options for upgrade operation
#[derive(Clone)]
pub struct UpgradeOptions {
    pub name: String,
    pub namespace: String,

    /// Render only: no cluster contact, no record written
    pub dry_run: bool,

    /// Merge the new values over the current revision's values
    pub reuse_values: bool,

    pub sub_notes: bool,
    pub disable_hooks: bool,
    pub labels: BTreeMap<String, String>,
    pub description: Option<String>,
    pub release_label: Option<ReleaseLabel>,
    pub post_renderer: Option<Arc<dyn PostRenderer>>,
    pub hook_timeout: Duration,
}

impl UpgradeOptions {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            dry_run: false,
            reuse_values: false,
            sub_notes: false,
            disable_hooks: false,
            labels: BTreeMap::new(),
            description: None,
            release_label: None,
            post_renderer: None,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn reuse_values(mut self) -> Self {
        self.reuse_values = true;
        self
    }

    pub fn with_sub_notes(mut self) -> Self {
        self.sub_notes = true;
        self
    }

    pub fn no_hooks(mut self) -> Self {
        self.disable_hooks = true;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_release_label(mut self) -> Self {
        self.release_label = Some(ReleaseLabel::for_release(self.name.clone()));
        self
    }

    pub fn with_post_renderer(mut self, post_renderer: Arc<dyn PostRenderer>) -> Self {
        self.post_renderer = Some(post_renderer);
        self
    }
}

/// Options for rollback operation
#[derive(Debug, Clone)]
pub struct RollbackOptions {
    pub name: String,

    /// Revision to roll back to (0 = the one before the latest)
    pub revision: u32,

    /// Resolve the target without writing anything
    pub dry_run: bool,

    pub disable_hooks: bool,
    pub hook_timeout: Duration,
}

impl RollbackOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: 0,
            dry_run: false,
            disable_hooks: false,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    /// Rollback to a specific revision
    pub fn to_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn no_hooks(mut self) -> Self {
        self.disable_hooks = true;
        self
    }
}

/// Options for uninstall operation
#[derive(Debug, Clone)]
pub struct UninstallOptions {
    pub name: String,

    /// Keep the release history, marked uninstalled
    pub keep_history: bool,

    /// Report what would be removed without removing it
    pub dry_run: bool,

    pub disable_hooks: bool,
    pub hook_timeout: Duration,
}

impl UninstallOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keep_history: false,
            dry_run: false,
            disable_hooks: false,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    /// Keep release history after uninstall
    pub fn keep_history(mut self) -> Self {
        self.keep_history = true;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn no_hooks(mut self) -> Self {
        self.disable_hooks = true;
        self
    }
}

impl Configuration {
    /// Install a chart as a new release
    pub async fn install(
        &self,
        chart: &Chart,
        values: &Values,
        options: &InstallOptions,
    ) -> Result<Release> {
        validate_release_name(&options.name)?;

        let mut replaced = None;
        let revision = if options.dry_run {
            1
        } else {
            self.releases.ensure_not_pending(&options.name).await?;
            replaced = self.check_name_available(&options.name, options.replace).await?;
            self.releases.next_revision(&options.name).await?
        };

        let resources = if options.dry_run {
            None
        } else {
            Some(self.require_connector()?.resources().await?)
        };

        // with include_crds the CRDs lead the rendered manifest and are
        // applied with it
        if let Some(resources) = &resources
            && !options.skip_crds
            && !options.include_crds
        {
            self.install_crds(resources.as_ref(), chart, &options.namespace)
                .await?;
        }

        let render = RenderOptions {
            revision,
            offline: options.dry_run,
            include_crds: options.include_crds,
            sub_notes: options.sub_notes,
            release_label: options.release_label.clone(),
            post_renderer: options.post_renderer.clone(),
            ..RenderOptions::new(&options.name, &options.namespace)
        };
        let rendered = self.render_resources(chart, values, &render).await?;

        let mut release = self.new_release(
            &options.name,
            &options.namespace,
            revision,
            chart,
            values.clone(),
            rendered,
        );
        release.labels = options.labels.clone();
        release.set_status(ReleaseStatus::PendingInstall, "Initial install underway");

        let Some(resources) = resources else {
            release.description = "Dry run complete".to_string();
            return Ok(release);
        };

        self.releases.create(&release).await?;

        let runner = HookRunner::new(resources.as_ref(), &options.namespace)
            .with_timeout(options.hook_timeout);
        let outcome = self
            .deploy(&runner, resources.as_ref(), &release, HookPhases::INSTALL, options.disable_hooks)
            .await;
        if let Err(e) = outcome {
            return Err(self.fail_release(release, e).await);
        }

        if let Some(mut previous) = replaced
            && previous.status != ReleaseStatus::Uninstalled
        {
            previous.mark_superseded();
            self.record_release(&previous).await;
        }

        let description = options
            .description
            .clone()
            .unwrap_or_else(|| "Install complete".to_string());
        release.mark_deployed(description);
        release.last_deployed = Some(self.now());
        self.record_release(&release).await;
        self.releases.prune_history(&release.name).await;

        info!(release = %release.name, revision = release.version, "installed");
        Ok(release)
    }

    /// Upgrade a release to a new chart or values
    pub async fn upgrade(
        &self,
        chart: &Chart,
        values: &Values,
        options: &UpgradeOptions,
    ) -> Result<Release> {
        validate_release_name(&options.name)?;
        self.releases.ensure_not_pending(&options.name).await?;

        let last = self.releases.last(&options.name).await?;
        let current = match self.releases.deployed(&options.name).await {
            Ok(deployed) => deployed,
            Err(KubeError::NoDeployedRelease { .. })
                if matches!(last.status, ReleaseStatus::Failed | ReleaseStatus::Superseded) =>
            {
                last.clone()
            }
            Err(e) => return Err(e),
        };

        let values = if options.reuse_values {
            let mut merged = current.config.clone();
            merged.merge(values);
            merged
        } else {
            values.clone()
        };

        let revision = self.releases.next_revision(&options.name).await?;

        let render = RenderOptions {
            revision,
            is_upgrade: true,
            offline: options.dry_run,
            sub_notes: options.sub_notes,
            release_label: options.release_label.clone(),
            post_renderer: options.post_renderer.clone(),
            ..RenderOptions::new(&options.name, &options.namespace)
        };
        let rendered = self.render_resources(chart, &values, &render).await?;

        let mut release = self.new_release(
            &options.name,
            &options.namespace,
            revision,
            chart,
            values,
            rendered,
        );
        release.first_deployed = current.first_deployed;
        release.labels = current.labels.clone();
        release.labels.extend(options.labels.clone());
        release.set_status(ReleaseStatus::PendingUpgrade, "Preparing upgrade");

        if options.dry_run {
            release.description = "Dry run complete".to_string();
            return Ok(release);
        }

        let resources = self.require_connector()?.resources().await?;
        self.releases.create(&release).await?;

        let runner = HookRunner::new(resources.as_ref(), &options.namespace)
            .with_timeout(options.hook_timeout);
        let outcome = self
            .deploy(&runner, resources.as_ref(), &release, HookPhases::UPGRADE, options.disable_hooks)
            .await;
        if let Err(e) = outcome {
            return Err(self.fail_release(release, e).await);
        }

        self.delete_stale(resources.as_ref(), &current, &release).await;

        let mut previous = current;
        previous.mark_superseded();
        self.record_release(&previous).await;

        let description = options
            .description
            .clone()
            .unwrap_or_else(|| "Upgrade complete".to_string());
        release.mark_deployed(description);
        release.last_deployed = Some(self.now());
        self.record_release(&release).await;
        self.releases.prune_history(&release.name).await;

        info!(release = %release.name, revision = release.version, "upgraded");
        Ok(release)
    }

    /// Roll a release back to an earlier revision, recorded as a new revision
    pub async fn rollback(&self, options: &RollbackOptions) -> Result<Release> {
        validate_release_name(&options.name)?;
        self.releases.ensure_not_pending(&options.name).await?;

        let current = self.releases.last(&options.name).await?;
        let target_revision = if options.revision == 0 {
            current.version.saturating_sub(1)
        } else {
            options.revision
        };
        if target_revision == 0 {
            return Err(KubeError::RollbackNotPossible {
                name: options.name.clone(),
                reason: "no previous revision to roll back to".to_string(),
            });
        }

        let target = match self.releases.get(&options.name, target_revision).await {
            Ok(target) => target,
            Err(e) if e.is_not_found() => {
                return Err(KubeError::RollbackNotPossible {
                    name: options.name.clone(),
                    reason: format!("revision {} not found", target_revision),
                });
            }
            Err(e) => return Err(e),
        };

        let revision = self.releases.next_revision(&options.name).await?;
        let mut release = Release::new(
            &target.name,
            &target.namespace,
            revision,
            target.chart.clone(),
            target.config.clone(),
        );
        release.manifest = target.manifest.clone();
        release.hooks = target.hooks.clone();
        release.notes = target.notes.clone();
        release.labels = target.labels.clone();
        release.first_deployed = current.first_deployed;
        release.last_deployed = Some(self.now());
        release.set_status(
            ReleaseStatus::PendingRollback,
            format!("Rollback to {}", target_revision),
        );

        if options.dry_run {
            return Ok(release);
        }

        let resources = self.require_connector()?.resources().await?;
        self.releases.create(&release).await?;

        let runner = HookRunner::new(resources.as_ref(), &release.namespace)
            .with_timeout(options.hook_timeout);
        let outcome = self
            .deploy(&runner, resources.as_ref(), &release, HookPhases::ROLLBACK, options.disable_hooks)
            .await;
        if let Err(e) = outcome {
            return Err(self.fail_release(release, e).await);
        }

        self.delete_stale(resources.as_ref(), &current, &release).await;

        let deployed = BTreeMap::from([
            ("name".to_string(), options.name.clone()),
            ("owner".to_string(), OWNER.to_string()),
            ("status".to_string(), ReleaseStatus::Deployed.to_string()),
        ]);
        match self.releases.query(&deployed).await {
            Ok(previous) => {
                for mut previous in previous {
                    previous.mark_superseded();
                    self.record_release(&previous).await;
                }
            }
            Err(e) => warn!(release = %release.name, "could not supersede deployed revisions: {}", e),
        }

        release.mark_deployed(format!("Rollback to {}", target_revision));
        release.last_deployed = Some(self.now());
        self.record_release(&release).await;
        self.releases.prune_history(&release.name).await;

        info!(release = %release.name, revision = release.version, target = target_revision, "rolled back");
        Ok(release)
    }

    /// Remove a release's resources and, unless kept, its history
    pub async fn uninstall(&self, options: &UninstallOptions) -> Result<Release> {
        validate_release_name(&options.name)?;

        let mut release = self.releases.last(&options.name).await?;
        if release.status == ReleaseStatus::Uninstalled {
            if options.keep_history {
                return Err(KubeError::AlreadyUninstalled {
                    name: options.name.clone(),
                });
            }
            if !options.dry_run {
                self.releases.delete_history(&options.name).await?;
            }
            return Ok(release);
        }

        if options.dry_run {
            return Ok(release);
        }

        let resources = self.require_connector()?.resources().await?;

        release.mark_uninstalling();
        self.releases.update(&release).await?;

        let runner = HookRunner::new(resources.as_ref(), &release.namespace)
            .with_timeout(options.hook_timeout);

        if !options.disable_hooks {
            runner.run(&release.hooks, HookEvent::PreDelete).await?;
        }

        let mut errors = Vec::new();

        let mut manifests = parse_release_manifest(&release.manifest)?;
        sort_by_kind(&mut manifests, KindOrder::Uninstall);
        if !manifests.is_empty() {
            match resources
                .delete(&release.namespace, &join_documents(&manifests))
                .await
            {
                Ok(summary) => errors.extend(
                    summary
                        .failed
                        .into_iter()
                        .map(|(name, err)| format!("{}: {}", name, err)),
                ),
                Err(e) => errors.push(e.to_string()),
            }
        }

        if !options.disable_hooks
            && let Err(e) = runner.run(&release.hooks, HookEvent::PostDelete).await
        {
            errors.push(e.to_string());
        }

        release.mark_uninstalled();
        release.deleted = Some(self.now());

        if options.keep_history {
            self.record_release(&release).await;
        } else if let Err(e) = self.releases.delete_history(&options.name).await {
            errors.push(format!("failed to purge release history: {}", e));
        }

        if !errors.is_empty() {
            return Err(KubeError::UninstallIncomplete {
                name: options.name.clone(),
                errors,
            });
        }

        info!(release = %release.name, kept_history = options.keep_history, "uninstalled");
        Ok(release)
    }

    /// The previous revision a new install replaces, if any. Fails when the
    /// name is held by a release that is not uninstalled, unless `replace`.
    async fn check_name_available(&self, name: &str, replace: bool) -> Result<Option<Release>> {
        match self.releases.last(name).await {
            Ok(last) if last.status == ReleaseStatus::Uninstalled || replace => Ok(Some(last)),
            Ok(_) => Err(KubeError::NameInUse {
                name: name.to_string(),
            }),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn install_crds(
        &self,
        resources: &dyn ResourceClient,
        chart: &Chart,
        namespace: &str,
    ) -> Result<()> {
        let crds = chart.crd_objects();
        if crds.is_empty() {
            return Ok(());
        }

        for crd in &crds {
            info!("installing CRD {}", crd.filename);
            resources
                .apply(namespace, &crd.file.data)
                .await?
                .into_result()?;
        }
        // new kinds must show up in the next negotiation
        self.invalidate_capabilities();
        Ok(())
    }

    fn new_release(
        &self,
        name: &str,
        namespace: &str,
        revision: u32,
        chart: &Chart,
        values: Values,
        rendered: RenderedRelease,
    ) -> Release {
        let mut release = Release::new(name, namespace, revision, chart.metadata.clone(), values);
        let now = self.now();
        release.first_deployed = Some(now);
        release.last_deployed = Some(now);
        release.manifest = rendered.manifest;
        release.hooks = rendered.hooks;
        release.notes = rendered.notes;
        release
    }

    /// Pre hooks, apply, post hooks
    async fn deploy(
        &self,
        runner: &HookRunner<'_>,
        resources: &dyn ResourceClient,
        release: &Release,
        phases: HookPhases,
        disable_hooks: bool,
    ) -> Result<()> {
        if !disable_hooks {
            runner.run(&release.hooks, phases.pre).await?;
        }

        resources
            .apply(&release.namespace, &release.manifest)
            .await?
            .into_result()?;

        if !disable_hooks {
            runner.run(&release.hooks, phases.post).await?;
        }
        Ok(())
    }

    /// Delete resources of `previous` that `next` no longer renders
    async fn delete_stale(&self, resources: &dyn ResourceClient, previous: &Release, next: &Release) {
        let (old, new) = match (
            parse_release_manifest(&previous.manifest),
            parse_release_manifest(&next.manifest),
        ) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(e), _) | (_, Err(e)) => {
                warn!(release = %next.name, "skipping removal of stale resources: {}", e);
                return;
            }
        };

        let keep: HashSet<(&str, &str, &str)> = new
            .iter()
            .map(|m| (m.head.api_version.as_str(), m.head.kind.as_str(), m.head.name.as_str()))
            .collect();
        let mut stale: Vec<_> = old
            .into_iter()
            .filter(|m| {
                !keep.contains(&(m.head.api_version.as_str(), m.head.kind.as_str(), m.head.name.as_str()))
            })
            .collect();
        if stale.is_empty() {
            return;
        }

        sort_by_kind(&mut stale, KindOrder::Uninstall);
        match resources
            .delete(&next.namespace, &join_documents(&stale))
            .await
        {
            Ok(summary) if !summary.is_success() => {
                warn!(release = %next.name, "stale resources not removed: {}", summary.summary());
            }
            Ok(_) => {}
            Err(e) => warn!(release = %next.name, "failed to remove stale resources: {}", e),
        }
    }

    /// Mark a release failed (leniently) and hand back the error
    async fn fail_release(&self, mut release: Release, error: KubeError) -> KubeError {
        warn!(release = %release.name, revision = release.version, "release failed: {}", error);
        release.mark_failed(&error);
        release.last_deployed = Some(self.now());
        self.record_release(&release).await;
        self.releases.prune_history(&release.name).await;
        error
    }
}

/// Hook events surrounding the apply of an action
#[derive(Debug, Clone, Copy)]
struct HookPhases {
    pre: HookEvent,
    post: HookEvent,
}

impl HookPhases {
    const INSTALL: Self = Self {
        pre: HookEvent::PreInstall,
        post: HookEvent::PostInstall,
    };
    const UPGRADE: Self = Self {
        pre: HookEvent::PreUpgrade,
        post: HookEvent::PostUpgrade,
    };
    const ROLLBACK: Self = Self {
        pre: HookEvent::PreRollback,
        post: HookEvent::PostRollback,
    };
}
