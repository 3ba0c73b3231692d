//! Per-project lifecycle of ephemeral instances: one autoscaling group + launch
//! configuration pair per slug, reconciled against a short-lived cache.

use chrono::Utc;
use fleeting_common::naming::{
    autoscale_group_name, cache_key, cache_prefix, launch_config_name, project_tag, ready_tag,
    SHUTDOWN_ACTION_NAME,
};
use fleeting_common::{
    CleanupReport, CreateOutcome, DestroyOutcome, Instance, InstanceRecord, InstanceState,
    InstanceStatus,
};
use fleeting_providers::inventory::{
    AutoscalingGroupSpec, DiscoveredInstance, GroupTag, LaunchConfigurationSpec,
};
use fleeting_providers::{FleetProvider, ProviderError};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::project::{Project, ProjectError};
use crate::readiness::{ProbeQueue, ReadinessProber};
use crate::settings::Settings;
use crate::temp_cache::TempCache;

/// Provider states an instance can be listed in before it is gone for good.
const LISTED_STATES: &[&str] = &["pending", "running", "shutting-down", "stopping", "stopped"];

pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error("project {project} has no `{key}` metadata")]
    MissingMetadata { project: String, key: &'static str },
}

/// Knobs the controller needs beyond its provider and cache.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub git_base_url: String,
    pub default_instance_type: String,
    pub availability_zones: Vec<String>,
    /// Extra `{{name}}` substitutions for bootstrap templates.
    pub build_vars: BTreeMap<String, String>,
    pub probe_concurrency: usize,
}

impl FleetConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            git_base_url: settings.git_base_url.clone(),
            default_instance_type: settings.default_instance_type.clone(),
            availability_zones: settings.aws.availability_zones.clone(),
            build_vars: settings.build_vars.clone(),
            probe_concurrency: settings.probe_concurrency,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub slug: String,
    pub git_user: String,
    pub git_branch: String,
    pub key_name: String,
    pub security_groups: Vec<String>,
    pub notify_topic: Option<String>,
    pub lifetime: Duration,
}

impl CreateRequest {
    pub fn new(
        slug: &str,
        git_user: &str,
        git_branch: &str,
        key_name: &str,
        security_groups: Vec<String>,
    ) -> Self {
        Self {
            slug: slug.to_string(),
            git_user: git_user.to_string(),
            git_branch: git_branch.to_string(),
            key_name: key_name.to_string(),
            security_groups,
            notify_topic: None,
            lifetime: DEFAULT_LIFETIME,
        }
    }

    /// Request using the deployment's key pair, security groups and notification topic.
    pub fn from_settings(
        settings: &Settings,
        slug: &str,
        git_user: &str,
        git_branch: &str,
    ) -> Self {
        Self::new(
            slug,
            git_user,
            git_branch,
            &settings.key_name,
            settings.security_groups.clone(),
        )
        .with_notify_topic(settings.notify_topic.clone())
    }

    pub fn with_notify_topic(mut self, topic: Option<String>) -> Self {
        self.notify_topic = topic;
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }
}

pub struct FleetController {
    provider: Arc<dyn FleetProvider>,
    cache: Arc<dyn TempCache>,
    config: FleetConfig,
    http: reqwest::Client,
    probes: ProbeQueue,
}

impl FleetController {
    pub fn new(
        provider: Arc<dyn FleetProvider>,
        cache: Arc<dyn TempCache>,
        config: FleetConfig,
    ) -> Result<Self, FleetError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(5))
            .build()?;
        let prober = Arc::new(ReadinessProber::new(provider.clone())?);
        let probes = ProbeQueue::new(prober, config.probe_concurrency);
        Ok(Self {
            provider,
            cache,
            config,
            http,
            probes,
        })
    }

    pub fn provider(&self) -> &Arc<dyn FleetProvider> {
        &self.provider
    }

    // -------------------------------------------------------------------------
    // list()
    // -------------------------------------------------------------------------

    /// Provider listing merged with the cache overlay.
    ///
    /// Slugs with a `terminated` cache entry are hidden; `pending` cache entries the
    /// provider does not list yet are appended. Running instances without a ready tag
    /// get a background probe whose result shows up on a later call.
    pub async fn list(&self, project: &Project) -> Result<Vec<Instance>, FleetError> {
        let tag_key = project_tag(&project.id);
        let discovered = self.provider.list_instances(&tag_key, LISTED_STATES).await?;
        let overlay = self.cached_records(project).await;

        let terminated: HashSet<&str> = overlay
            .iter()
            .filter(|r| r.state == InstanceState::Terminated)
            .map(|r| r.slug.as_str())
            .collect();

        let ready_key = ready_tag(&project.id);
        let mut listed = HashSet::new();
        let mut out = Vec::new();
        for inst in discovered {
            let Some(record) = decode_tag(&inst, &tag_key) else {
                continue;
            };
            if terminated.contains(record.slug.as_str()) {
                continue;
            }
            let state = InstanceState::parse(&inst.state);
            let ready_url = inst.tag(&ready_key).map(|v| v.to_string());
            if state == InstanceState::Running && ready_url.is_none() {
                if self.probes.dispatch(project.clone(), inst.clone()).is_none() {
                    tracing::debug!(
                        instance_id = %inst.instance_id,
                        "readiness check already pending"
                    );
                }
            }
            listed.insert(record.slug.clone());
            out.push(Instance {
                slug: record.slug,
                git_user: record.git_user,
                git_branch: record.git_branch,
                state,
                lifetime: record.lifetime,
                launch_time: inst.launch_time,
                ready_url,
                instance_id: Some(inst.instance_id),
                public_host: inst.public_host,
            });
        }

        for record in overlay {
            if record.state == InstanceState::Pending && !listed.contains(&record.slug) {
                listed.insert(record.slug.clone());
                out.push(Instance::from_record(record));
            }
        }
        Ok(out)
    }

    async fn cached_records(&self, project: &Project) -> Vec<InstanceRecord> {
        match self.cache.find(&cache_prefix(&project.id)).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    project = %project.id,
                    error = %e,
                    "cache lookup failed; listing without overlay"
                );
                Vec::new()
            }
        }
    }

    async fn remember(&self, project: &Project, record: &InstanceRecord) {
        let key = cache_key(&project.id, &record.slug);
        if let Err(e) = self.cache.put(&key, record).await {
            tracing::warn!(key = %key, error = %e, "cache write failed");
        }
    }

    // -------------------------------------------------------------------------
    // status()
    // -------------------------------------------------------------------------

    pub async fn status(
        &self,
        project: &Project,
        slug: &str,
    ) -> Result<InstanceStatus, FleetError> {
        let group_name = autoscale_group_name(&project.id, slug);
        let groups = self.provider.list_autoscaling_groups(&[group_name]).await?;
        let Some(group) = groups.into_iter().next() else {
            return Ok(InstanceStatus::NotFound);
        };

        let ids: Vec<String> = group.instances.iter().map(|i| i.instance_id.clone()).collect();
        if ids.is_empty() {
            return Ok(if group.min_size >= 1 {
                InstanceStatus::DoesNotYetExist
            } else {
                InstanceStatus::DoesNotExist
            });
        }

        // The group can know an instance id before the compute API does.
        let Some(inst) = self.provider.describe_instances(&ids).await?.into_iter().next() else {
            return Ok(InstanceStatus::DoesNotYetExist);
        };
        if let Some(url) = inst.tag(&ready_tag(&project.id)) {
            return Ok(InstanceStatus::Ready { url: url.to_string() });
        }
        Ok(self.probes.prober().probe(project, &inst).await)
    }

    // -------------------------------------------------------------------------
    // create()
    // -------------------------------------------------------------------------

    pub async fn create(
        &self,
        project: &Project,
        req: &CreateRequest,
    ) -> Result<CreateOutcome, FleetError> {
        if !self.git_ref_exists(project, &req.git_user, &req.git_branch).await? {
            tracing::info!(
                project = %project.id,
                user = %req.git_user,
                branch = %req.git_branch,
                "unknown git reference"
            );
            return Ok(CreateOutcome::InvalidGitInfo);
        }

        let image_id = project
            .meta("image-id")
            .ok_or_else(|| FleetError::MissingMetadata {
                project: project.id.clone(),
                key: "image-id",
            })?
            .to_string();
        let instance_type = project
            .meta("instance-type")
            .unwrap_or(self.config.default_instance_type.as_str())
            .to_string();

        let group_name = autoscale_group_name(&project.id, &req.slug);
        let config_name = launch_config_name(&project.id, &req.slug);
        let existing = self
            .provider
            .list_autoscaling_groups(std::slice::from_ref(&group_name))
            .await?;
        if existing
            .iter()
            .any(|g| !g.instances.is_empty() || g.min_size >= 1)
        {
            return Ok(CreateOutcome::InstanceAlreadyExists);
        }

        let report = self.cleanup(project).await;
        if report.deleted > 0 || report.errors > 0 {
            tracing::info!(
                project = %project.id,
                deleted = report.deleted,
                errors = report.errors,
                "pre-create cleanup"
            );
        }
        // A drained pair for this very slug would make the creates below collide.
        self.reclaim_drained_pair(&group_name, &config_name).await?;

        let lifetime_secs = req.lifetime.as_secs();
        let record =
            InstanceRecord::pending(&req.slug, &req.git_user, &req.git_branch, Some(lifetime_secs));

        self.provider
            .create_launch_configuration(&LaunchConfigurationSpec {
                name: config_name.clone(),
                image_id,
                instance_type,
                key_name: req.key_name.clone(),
                security_groups: req.security_groups.clone(),
                user_data: project.render(&self.template_vars(project, req)),
            })
            .await?;
        self.provider
            .create_autoscaling_group(&AutoscalingGroupSpec {
                name: group_name.clone(),
                launch_configuration: config_name,
                availability_zones: self.config.availability_zones.clone(),
                min_size: 1,
                max_size: 1,
                desired_capacity: 1,
                tags: vec![GroupTag {
                    key: project_tag(&project.id),
                    value: record.encode(),
                    propagate_at_launch: true,
                }],
            })
            .await?;

        let lifetime = chrono::Duration::from_std(req.lifetime)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let shutdown_at = Utc::now() + lifetime;
        self.provider
            .schedule_capacity_change(&group_name, SHUTDOWN_ACTION_NAME, shutdown_at, 0)
            .await?;

        if let Some(topic) = req.notify_topic.as_deref() {
            self.provider
                .subscribe_termination_notifications(&group_name, topic)
                .await?;
        }

        self.remember(project, &record).await;
        tracing::info!(
            project = %project.id,
            slug = %req.slug,
            group = %group_name,
            shutdown_at = %shutdown_at,
            "instance created"
        );
        Ok(CreateOutcome::Done)
    }

    /// HEAD `{base}/{user}/{repo}/tree/{branch}`; only a 404 counts as "does not exist".
    async fn git_ref_exists(
        &self,
        project: &Project,
        git_user: &str,
        git_branch: &str,
    ) -> Result<bool, FleetError> {
        let repo = project.repo_name().ok_or_else(|| FleetError::MissingMetadata {
            project: project.id.clone(),
            key: "repo",
        })?;
        let url = format!(
            "{}/{}/{}/tree/{}",
            self.config.git_base_url, git_user, repo, git_branch
        );
        let resp = self.http.head(&url).send().await?;
        Ok(resp.status() != reqwest::StatusCode::NOT_FOUND)
    }

    fn template_vars(&self, project: &Project, req: &CreateRequest) -> BTreeMap<String, String> {
        let mut vars = self.config.build_vars.clone();
        vars.insert("project".to_string(), project.id.clone());
        vars.insert("slug".to_string(), req.slug.clone());
        vars.insert("git_user".to_string(), req.git_user.clone());
        vars.insert("git_branch".to_string(), req.git_branch.clone());
        vars
    }

    async fn reclaim_drained_pair(
        &self,
        group_name: &str,
        config_name: &str,
    ) -> Result<(), FleetError> {
        let groups = self.provider.list_autoscaling_groups(&[group_name.to_string()]).await?;
        for group in groups {
            tracing::info!(group = %group.name, "removing drained group before re-create");
            self.provider.delete_autoscaling_group(&group.name).await?;
        }
        let configs = self
            .provider
            .list_launch_configurations(&[config_name.to_string()])
            .await?;
        for config in configs {
            self.provider.delete_launch_configuration(&config.name).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // destroy()
    // -------------------------------------------------------------------------

    pub async fn destroy(&self, project: &Project, slug: &str) -> DestroyOutcome {
        // Hide the slug right away; the provider listing lags behind.
        self.remember(project, &InstanceRecord::terminated(slug)).await;

        let group_name = autoscale_group_name(&project.id, slug);
        let config_name = launch_config_name(&project.id, slug);

        let groups = match self.provider.list_autoscaling_groups(&[group_name.clone()]).await {
            Ok(groups) => groups,
            Err(e) => return destroy_error(slug, e),
        };
        let configs = match self
            .provider
            .list_launch_configurations(&[config_name.clone()])
            .await
        {
            Ok(configs) => configs,
            Err(e) => return destroy_error(slug, e),
        };
        if groups.is_empty() && configs.is_empty() {
            return DestroyOutcome::NotFound;
        }

        if !groups.is_empty() {
            match self.provider.delete_autoscaling_group(&group_name).await {
                Ok(()) => tracing::info!(group = %group_name, "group deleted"),
                Err(e) if e.is_busy() => {
                    tracing::info!(
                        group = %group_name,
                        reason = %e,
                        "group busy; shutting instances down instead"
                    );
                    return match self.provider.shutdown_autoscaling_group(&group_name).await {
                        Ok(()) => DestroyOutcome::ShutdownInProgress,
                        Err(e) => destroy_error(slug, e),
                    };
                }
                Err(e) => return destroy_error(slug, e),
            }
        }

        if !configs.is_empty() {
            if let Err(e) = self.provider.delete_launch_configuration(&config_name).await {
                return destroy_error(slug, e);
            }
            tracing::info!(launch_configuration = %config_name, "launch configuration deleted");
        }
        DestroyOutcome::Done
    }

    // -------------------------------------------------------------------------
    // cleanup()
    // -------------------------------------------------------------------------

    /// Delete resource pairs left behind by terminated instances. Never fails.
    ///
    /// A group is only deleted once it is drained (minimum 0, no instances); its
    /// launch configuration only once the group is gone.
    pub async fn cleanup(&self, project: &Project) -> CleanupReport {
        let mut report = CleanupReport::default();
        let tag_key = project_tag(&project.id);
        let terminated = match self.provider.list_instances(&tag_key, &["terminated"]).await {
            Ok(instances) => instances,
            Err(e) => {
                tracing::warn!(
                    project = %project.id,
                    error = %e,
                    "cleanup: cannot list terminated instances"
                );
                report.errors += 1;
                return report;
            }
        };

        let slugs: BTreeSet<String> = terminated
            .iter()
            .filter_map(|inst| decode_tag(inst, &tag_key))
            .map(|record| record.slug)
            .collect();

        for slug in slugs {
            let group_name = autoscale_group_name(&project.id, &slug);
            // The launch configuration stays while a live group still uses it.
            let listed = self.provider.list_autoscaling_groups(&[group_name.clone()]).await;
            let group_gone = match listed {
                Ok(groups) => {
                    let mut gone = true;
                    for group in &groups {
                        if group.min_size != 0 || !group.instances.is_empty() {
                            gone = false;
                            continue;
                        }
                        let result = self.provider.delete_autoscaling_group(&group.name).await;
                        gone &= result.is_ok();
                        tally(&mut report, "group", &group.name, result);
                    }
                    gone
                }
                Err(e) => {
                    tracing::warn!(group = %group_name, error = %e, "cleanup: cannot list group");
                    report.errors += 1;
                    false
                }
            };
            if !group_gone {
                continue;
            }

            let config_name = launch_config_name(&project.id, &slug);
            match self.provider.list_launch_configurations(&[config_name.clone()]).await {
                Ok(configs) => {
                    for config in &configs {
                        let result = self.provider.delete_launch_configuration(&config.name).await;
                        tally(&mut report, "launch configuration", &config.name, result);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        launch_configuration = %config_name,
                        error = %e,
                        "cleanup: cannot list launch configuration"
                    );
                    report.errors += 1;
                }
            }
        }
        report
    }

    // -------------------------------------------------------------------------
    // console_log()
    // -------------------------------------------------------------------------

    /// Serial console of the slug's instance, if it has one yet.
    pub async fn console_log(
        &self,
        project: &Project,
        slug: &str,
    ) -> Result<Option<String>, FleetError> {
        let group_name = autoscale_group_name(&project.id, slug);
        let groups = self.provider.list_autoscaling_groups(&[group_name]).await?;
        let Some(instance_id) = groups
            .into_iter()
            .next()
            .and_then(|g| g.instances.into_iter().next())
            .map(|i| i.instance_id)
        else {
            return Ok(None);
        };
        Ok(self.provider.console_output(&instance_id).await?)
    }
}

fn decode_tag(inst: &DiscoveredInstance, tag_key: &str) -> Option<InstanceRecord> {
    let raw = inst.tag(tag_key)?;
    match InstanceRecord::decode(raw) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(
                instance_id = %inst.instance_id,
                error = %e,
                "ignoring instance with unreadable fleet tag"
            );
            None
        }
    }
}

fn tally(report: &mut CleanupReport, kind: &str, name: &str, result: Result<(), ProviderError>) {
    match result {
        Ok(()) => {
            tracing::info!(kind, name, "cleanup: deleted");
            report.deleted += 1;
        }
        Err(e) => {
            tracing::warn!(kind, name, error = %e, "cleanup: delete failed");
            report.errors += 1;
        }
    }
}

fn destroy_error(slug: &str, e: ProviderError) -> DestroyOutcome {
    tracing::warn!(slug, error = %e, "destroy failed");
    DestroyOutcome::Error(e.code().to_string())
}
