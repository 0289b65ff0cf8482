// ABOUTME: Daemon control operations layered on the mirror: schedule, cancel, deploy, delete
// ABOUTME: Each one talks to the daemon first, then patches the mirror and drops stale cache entries

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use super::{jobs_key, SyncEngine, LIST_JOBS, LIST_PROJECTS, LIST_VERSIONS};
use crate::cache::CacheKey;
use crate::error::{ManagerError, Result};
use crate::models::{Job, JobStatus, NewJob, Node, Project, Spider, SpiderGroup};
use crate::predicate::{JobField, Predicate, SpiderField};
use crate::remote::ScheduleRequest;
use crate::resolver::VersionResolver;

/// Result of starting or stopping a spider group. Per-spider failures do not
/// stop the rest of the group.
#[derive(Debug, Default, Serialize)]
pub struct GroupRun {
    pub jobs: Vec<Job>,
    #[serde(serialize_with = "crate::models::serialize_errors")]
    pub errors: Vec<ManagerError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployOutcome {
    pub project: String,
    pub version: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct NodeInfo {
    pub status: serde_json::Value,
    pub projects: Vec<Project>,
}

impl SyncEngine {
    /// Schedules one run of `spider` and records a pending placeholder job.
    ///
    /// Returns `None` when the daemon accepted the call but handed back no
    /// job id.
    pub async fn schedule_spider(
        &self,
        node: &Node,
        spider: &Spider,
        version_pin: Option<&str>,
        args: &BTreeMap<String, String>,
    ) -> Result<Option<Job>> {
        ensure_node(node, &spider.node, "spider")?;

        let request = ScheduleRequest {
            project: spider.project.clone(),
            spider: spider.name.clone(),
            version: version_pin.map(str::to_string),
            args: args.clone(),
        };
        let response = self
            .api
            .schedule(node, &request)
            .await
            .map_err(ManagerError::transport)?;

        let Some(job_id) = response.jobid else {
            tracing::warn!(node = %node.name, spider = %spider, status = %response.status.describe(), "daemon returned no job id");
            return Ok(None);
        };

        let row = NewJob {
            spider_id: spider.id,
            log_url: Some(format!("/logs/{}/{}/{}.log", spider.project, spider.name, job_id)),
            job_id,
            status: JobStatus::Pending,
            start_time: self.clock.now(),
            end_time: None,
            pid: None,
            items_url: None,
        };
        let job = self.store.insert_job(&node.name, &row)?;
        self.cache.invalidate(&jobs_key(node, &spider.project)).await;

        tracing::info!(node = %node.name, spider = %spider, job_id = %job.job_id, "scheduled");
        Ok(Some(job))
    }

    /// Schedules each spider in turn; the first transport failure aborts.
    pub async fn start_spiders(&self, node: &Node, spiders: &[Spider]) -> Result<Vec<Job>> {
        let mut jobs = Vec::with_capacity(spiders.len());
        for spider in spiders {
            if let Some(job) = self.schedule_spider(node, spider, None, &BTreeMap::new()).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Cancels one job. `None` means the daemon refused; the mirror is left
    /// alone. A job that vanished from the mirror after the daemon cancelled
    /// it is reported as [`ManagerError::NotFound`].
    pub async fn cancel_job(&self, node: &Node, job: &Job) -> Result<Option<Job>> {
        ensure_node(node, &job.node, "job")?;

        let response = self
            .api
            .cancel(node, &job.spider.project, &job.job_id)
            .await
            .map_err(ManagerError::transport)?;
        if !response.is_ok() {
            tracing::warn!(node = %node.name, job_id = %job.job_id, status = %response.describe(), "cancel refused");
            return Ok(None);
        }

        self.cache.invalidate(&jobs_key(node, &job.spider.project)).await;
        let stopped = self
            .store
            .mark_job_stopped(&node.name, &job.job_id, self.clock.now())?;
        Ok(Some(stopped))
    }

    /// Cancels every pending or running job of a logical spider, across all
    /// of its versions.
    pub async fn stop_spider(&self, node: &Node, project: &str, spider: &str) -> Result<Vec<Job>> {
        let targets = self
            .sync_then_read_jobs(node, &active_jobs_of(project, spider))
            .await?;

        let mut stopped = Vec::new();
        for job in &targets {
            if let Some(job) = self.cancel_job(node, job).await? {
                stopped.push(job);
            }
        }
        tracing::info!(node = %node.name, project, spider, stopped = stopped.len(), "spider stopped");
        Ok(stopped)
    }

    /// Schedules every spider of the group. A pinned group runs and resolves
    /// against its version; otherwise each spider resolves to the newest
    /// version deployed before now.
    pub async fn start_spider_group(&self, node: &Node, group: &SpiderGroup) -> Result<GroupRun> {
        ensure_node(node, &group.node, "spider group")?;

        let history = VersionResolver::new(&self.store).history(&node.name, &group.project)?;
        let now = self.clock.now();
        let mut run = GroupRun::default();

        for name in &group.spiders {
            let resolved = match &group.version {
                Some(version) => history.resolve_pinned(name, version, None),
                None => history.resolve(name, now, None),
            };
            let spider = match resolved {
                Ok(spider) => spider,
                Err(err) => {
                    tracing::warn!(group = %group.name, error = %err, "group member skipped");
                    run.errors.push(err);
                    continue;
                }
            };

            match self
                .schedule_spider(node, &spider, group.version.as_deref(), &group.args)
                .await
            {
                Ok(Some(job)) => run.jobs.push(job),
                Ok(None) => run.errors.push(ManagerError::Rejected(format!(
                    "no job id returned for {}",
                    spider
                ))),
                Err(err) => run.errors.push(err),
            }
        }
        Ok(run)
    }

    /// Cancels the active jobs of every spider in the group.
    pub async fn stop_spider_group(&self, node: &Node, group: &SpiderGroup) -> Result<GroupRun> {
        ensure_node(node, &group.node, "spider group")?;

        self.sync_node(node).await?;
        let mut run = GroupRun::default();
        for name in &group.spiders {
            let mut filter = active_jobs_of(&group.project, name);
            if let Some(version) = &group.version {
                filter = filter.and(Predicate::is(JobField::Spider(SpiderField::Version(
                    version.clone(),
                ))));
            }

            for job in self.jobs(node, &filter)? {
                match self.cancel_job(node, &job).await {
                    Ok(Some(job)) => run.jobs.push(job),
                    Ok(None) => run.errors.push(ManagerError::Rejected(format!(
                        "cancel refused for job {}",
                        job.job_id
                    ))),
                    Err(err) => run.errors.push(err),
                }
            }
        }
        Ok(run)
    }

    /// Uploads an egg as a new version. Without an explicit token the current
    /// Unix time is used, so the version stays orderable by deploy time.
    ///
    /// The mirror learns about the version on the next sync.
    pub async fn deploy_version(
        &self,
        node: &Node,
        project: &str,
        version: Option<&str>,
        egg: &Path,
    ) -> Result<DeployOutcome> {
        let version = match version {
            Some(v) => v.to_string(),
            None => self.clock.now().timestamp().to_string(),
        };

        let bytes = tokio::fs::read(egg)
            .await
            .map_err(|e| ManagerError::Upload(format!("cannot read egg {}: {}", egg.display(), e)))?;
        if bytes.is_empty() {
            return Err(ManagerError::Upload(format!("egg {} is empty", egg.display())));
        }

        let response = self
            .api
            .add_version(node, project, &version, bytes)
            .await
            .map_err(ManagerError::transport)?;
        if !response.is_ok() {
            return Err(ManagerError::Upload(response.describe()));
        }

        self.forget_listings(node, project).await;
        tracing::info!(node = %node.name, project, version = %version, "version deployed");
        Ok(DeployOutcome {
            project: project.to_string(),
            version,
            message: response.describe(),
        })
    }

    /// Deletes one version remotely and marks its mirror row stale. Spiders
    /// and jobs under it are kept for attribution of historical runs.
    pub async fn delete_version(&self, node: &Node, project: &Project) -> Result<()> {
        ensure_node(node, &project.node, "project")?;

        let response = self
            .api
            .delete_version(node, &project.name, &project.version)
            .await
            .map_err(ManagerError::transport)?;
        if !response.is_ok() {
            return Err(ManagerError::Rejected(response.describe()));
        }

        self.store.mark_version_stale(project.id, self.clock.now())?;
        self.forget_listings(node, &project.name).await;
        tracing::info!(node = %node.name, project = %project.name, version = %project.version, "version deleted");
        Ok(())
    }

    /// Deletes a project with all versions. Returns how many mirror rows went stale.
    pub async fn delete_project(&self, node: &Node, project: &str) -> Result<usize> {
        let response = self
            .api
            .delete_project(node, project)
            .await
            .map_err(ManagerError::transport)?;
        if !response.is_ok() {
            return Err(ManagerError::Rejected(response.describe()));
        }

        let staled = self
            .store
            .mark_stale_projects(&node.name, project, &[], self.clock.now())?;
        self.forget_listings(node, project).await;
        tracing::info!(node = %node.name, project, staled, "project deleted");
        Ok(staled)
    }

    pub async fn daemon_status(&self, node: &Node) -> Result<serde_json::Value> {
        self.api
            .daemon_status(node)
            .await
            .map_err(ManagerError::transport)
    }

    /// Daemon load plus the node's current project rows.
    pub async fn node_info(&self, node: &Node) -> Result<NodeInfo> {
        let status = self.daemon_status(node).await?;
        let projects = self.sync_projects(node).await?;
        Ok(NodeInfo { status, projects })
    }

    async fn forget_listings(&self, node: &Node, project: &str) {
        self.cache
            .invalidate(&CacheKey::new(LIST_PROJECTS).arg(&node.name))
            .await;
        self.cache
            .invalidate(&CacheKey::new(LIST_VERSIONS).arg(&node.name).arg(project))
            .await;
        self.cache.invalidate_node_op(&node.name, LIST_JOBS).await;
    }
}

fn active_jobs_of(project: &str, spider: &str) -> Predicate<JobField> {
    Predicate::is(JobField::Spider(SpiderField::Project(project.to_string())))
        .and(Predicate::is(JobField::Spider(SpiderField::Name(spider.to_string()))))
        .and(Predicate::one_of([
            JobField::Status(JobStatus::Pending),
            JobField::Status(JobStatus::Running),
        ]))
}

fn ensure_node(node: &Node, owner: &str, what: &str) -> Result<()> {
    if node.name == owner {
        return Ok(());
    }
    Err(ManagerError::NotFound(format!(
        "{} belongs to node '{}', not '{}'",
        what, owner, node.name
    )))
}
