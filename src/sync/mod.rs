// ABOUTME: Per-node refresh cycle: projects, versions, spiders, then jobs
// ABOUTME: Remote listings go through the TTL cache; results commit to the mirror store

mod control;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use tracing::Instrument;

use crate::cache::{CacheKey, TtlCache};
use crate::clock::Clock;
use crate::config::CacheSettings;
use crate::error::{ManagerError, Result};
use crate::models::{Job, JobStatus, NewJob, Node, Project, Spider, SyncResult};
use crate::predicate::{JobField, Predicate, ProjectField, SpiderField};
use crate::remote::{DaemonApi, JobListing, RemoteJob};
use crate::resolver::{VersionHistory, VersionResolver};
use crate::store::MirrorStore;

pub use control::{DeployOutcome, GroupRun, NodeInfo};

const SYNC_NODE: &str = "sync_node";
const LIST_PROJECTS: &str = "list_projects";
const LIST_VERSIONS: &str = "list_versions";
const LIST_JOBS: &str = "list_jobs";
const SYNC_SPIDERS: &str = "sync_spiders";

/// Parses a daemon timestamp (`YYYY-MM-DD HH:MM:SS.ffffff`, naive in the
/// daemon's local offset). RFC 3339 strings are accepted as-is.
pub fn parse_daemon_time(raw: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").ok()?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

struct JobSync {
    jobs: Vec<Job>,
    failures: Vec<ManagerError>,
}

pub struct SyncEngine {
    api: Arc<dyn DaemonApi>,
    store: Arc<MirrorStore>,
    cache: TtlCache,
    clock: Arc<dyn Clock>,
    ttls: CacheSettings,
}

impl SyncEngine {
    pub fn new(
        api: Arc<dyn DaemonApi>,
        store: Arc<MirrorStore>,
        clock: Arc<dyn Clock>,
        ttls: CacheSettings,
    ) -> Self {
        Self {
            api,
            store,
            cache: TtlCache::new(Arc::clone(&clock)),
            clock,
            ttls,
        }
    }

    pub fn store(&self) -> &MirrorStore {
        &self.store
    }

    /// Runs one full refresh cycle for `node`.
    ///
    /// Concurrent calls for the same node are serialized; with a non-zero
    /// `sync_ttl_secs` a recent result is returned as-is. Fails only when the
    /// project/version listing cannot be fetched or the mirror cannot be
    /// written; per-project spider failures and per-job attribution failures
    /// are reported in `errors`.
    pub async fn sync_node(&self, node: &Node) -> Result<Arc<SyncResult>> {
        let key = CacheKey::new(SYNC_NODE).arg(&node.name);
        self.cache
            .get_or_compute(key, self.ttls.sync(), || {
                self.run_cycle(node)
                    .instrument(tracing::info_span!("sync_node", node = %node.name))
            })
            .await
    }

    /// Syncs independent nodes concurrently.
    pub async fn sync_all(&self, nodes: &[Node]) -> Vec<(String, Result<Arc<SyncResult>>)> {
        let cycles = nodes
            .iter()
            .map(|node| async move { (node.name.clone(), self.sync_node(node).await) });
        futures::future::join_all(cycles).await
    }

    async fn run_cycle(&self, node: &Node) -> Result<SyncResult> {
        let started = Instant::now();
        let projects = self.sync_projects(node).await?;

        let mut result = SyncResult::new(&node.name);
        for project in projects.iter().filter(|p| !p.stale && !p.spiders_synced) {
            match self.sync_project_spiders(node, project).await {
                Ok(true) => result.spiders_synced_count += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(project = %project.name, version = %project.version, error = %err, "spider sync failed");
                    result.errors.push(err);
                }
            }
        }

        // Projects stay committed even if the job step fails.
        match self.sync_jobs(node).await {
            Ok(outcome) => {
                result.jobs = outcome.jobs;
                result.errors.extend(outcome.failures);
            }
            Err(err) => {
                tracing::warn!(error = %err, "job sync failed, previous job set kept");
                result.errors.push(err);
                result.jobs = self.store.jobs(&node.name)?;
            }
        }

        result.projects = self.store.projects(&node.name)?;
        tracing::info!(
            projects = result.projects.len(),
            spiders_synced = result.spiders_synced_count,
            jobs = result.jobs.len(),
            errors = result.errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sync complete"
        );
        Ok(result)
    }

    /// Steps 1-2: fetch names and versions, then reconcile the node's project
    /// rows in one transaction.
    pub async fn sync_projects(&self, node: &Node) -> Result<Vec<Project>> {
        let names = self.fetch_project_names(node).await?;

        let mut listing = BTreeMap::new();
        for name in names.iter() {
            let versions = self.fetch_versions(node, name).await?;
            listing.insert(name.clone(), versions.as_ref().clone());
        }

        let diff = self.store.reconcile_projects(&node.name, &listing, self.clock.now())?;
        tracing::debug!(node = %node.name, inserted = diff.inserted, staled = diff.staled, "projects reconciled");
        self.store.projects(&node.name)
    }

    /// Fetches and stores the spider set of one project version, once.
    /// Returns `false` without a remote call when already synced.
    pub async fn sync_project_spiders(&self, node: &Node, project: &Project) -> Result<bool> {
        let key = CacheKey::new(SYNC_SPIDERS)
            .arg(&node.name)
            .arg(&project.name)
            .arg(&project.version);

        let synced = self
            .cache
            .get_or_compute(key, Duration::ZERO, || async {
                if project.spiders_synced || self.store.spiders_synced(project.id)? {
                    return Ok(false);
                }
                let names = self
                    .api
                    .list_spiders(node, &project.name, Some(&project.version))
                    .await
                    .map_err(ManagerError::transport)?;
                tracing::debug!(project = %project.name, version = %project.version, spiders = names.len(), "fetched spiders");
                self.store
                    .upsert_spiders_if_unsynced(project.id, &names, self.clock.now())
            })
            .await?;
        Ok(*synced)
    }

    /// Steps 4-5: attribute every remote job, then replace the node's job set.
    async fn sync_jobs(&self, node: &Node) -> Result<JobSync> {
        let now = self.clock.now();
        let resolver = VersionResolver::new(&self.store);
        let mut rows = Vec::new();
        let mut failures = Vec::new();

        for name in self.store.project_names(&node.name)? {
            let listing = self.fetch_jobs(node, &name).await?;
            let history = resolver.history(&node.name, &name)?;

            for (status, entry) in buckets(&listing) {
                match attribute(node, &history, status, entry, now) {
                    Ok(row) => rows.push(row),
                    Err(err) => {
                        tracing::warn!(error = %err, "job excluded from mirror");
                        failures.push(err);
                    }
                }
            }
        }

        self.store.replace_jobs(&node.name, &rows)?;
        Ok(JobSync {
            jobs: self.store.jobs(&node.name)?,
            failures,
        })
    }

    async fn fetch_project_names(&self, node: &Node) -> Result<Arc<Vec<String>>> {
        let key = CacheKey::new(LIST_PROJECTS).arg(&node.name);
        self.cache
            .get_or_compute(key, self.ttls.projects(), || async {
                self.api
                    .list_projects(node)
                    .await
                    .map_err(ManagerError::transport)
            })
            .await
    }

    async fn fetch_versions(&self, node: &Node, project: &str) -> Result<Arc<Vec<String>>> {
        let key = CacheKey::new(LIST_VERSIONS).arg(&node.name).arg(project);
        self.cache
            .get_or_compute(key, self.ttls.versions(), || async {
                self.api
                    .list_versions(node, project)
                    .await
                    .map_err(ManagerError::transport)
            })
            .await
    }

    async fn fetch_jobs(&self, node: &Node, project: &str) -> Result<Arc<JobListing>> {
        let key = jobs_key(node, project);
        self.cache
            .get_or_compute(key, self.ttls.jobs(), || async {
                self.api
                    .list_jobs(node, project)
                    .await
                    .map_err(ManagerError::transport)
            })
            .await
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn projects(&self, node: &Node, filter: &Predicate<ProjectField>) -> Result<Vec<Project>> {
        Ok(filter.filter(self.store.projects(&node.name)?))
    }

    pub fn spiders(&self, node: &Node, filter: &Predicate<SpiderField>) -> Result<Vec<Spider>> {
        Ok(filter.filter(self.store.spiders(&node.name)?))
    }

    pub fn jobs(&self, node: &Node, filter: &Predicate<JobField>) -> Result<Vec<Job>> {
        Ok(filter.filter(self.store.jobs(&node.name)?))
    }

    pub async fn sync_then_read_projects(
        &self,
        node: &Node,
        filter: &Predicate<ProjectField>,
    ) -> Result<Vec<Project>> {
        self.sync_node(node).await?;
        self.projects(node, filter)
    }

    pub async fn sync_then_read_spiders(
        &self,
        node: &Node,
        filter: &Predicate<SpiderField>,
    ) -> Result<Vec<Spider>> {
        self.sync_node(node).await?;
        self.spiders(node, filter)
    }

    pub async fn sync_then_read_jobs(
        &self,
        node: &Node,
        filter: &Predicate<JobField>,
    ) -> Result<Vec<Job>> {
        self.sync_node(node).await?;
        self.jobs(node, filter)
    }
}

fn jobs_key(node: &Node, project: &str) -> CacheKey {
    CacheKey::new(LIST_JOBS).arg(&node.name).arg(project)
}

fn buckets(listing: &JobListing) -> impl Iterator<Item = (JobStatus, &RemoteJob)> {
    let pending = listing.pending.iter().map(|j| (JobStatus::Pending, j));
    let running = listing.running.iter().map(|j| (JobStatus::Running, j));
    let finished = listing.finished.iter().map(|j| (JobStatus::Finished, j));
    pending.chain(running).chain(finished)
}

fn attribute(
    node: &Node,
    history: &VersionHistory,
    status: JobStatus,
    entry: &RemoteJob,
    now: DateTime<Utc>,
) -> Result<NewJob> {
    let job_id = Some(entry.id.as_str());
    let offset = node.offset();

    // Pending jobs have not started; they will run against what is live now.
    let start_time = match entry.start_time.as_deref() {
        Some(raw) => parse_daemon_time(raw, offset).ok_or_else(|| {
            history.attribution_error(&entry.spider, job_id, format!("unparseable start_time '{}'", raw))
        })?,
        None => now,
    };

    let spider = match entry.version.as_deref() {
        Some(version) => history.resolve_pinned(&entry.spider, version, job_id)?,
        None => history.resolve(&entry.spider, start_time, job_id)?,
    };

    Ok(NewJob {
        spider_id: spider.id,
        job_id: entry.id.clone(),
        status,
        start_time,
        end_time: entry
            .end_time
            .as_deref()
            .and_then(|raw| parse_daemon_time(raw, offset)),
        pid: entry.pid,
        log_url: entry.log_url.clone(),
        items_url: entry.items_url.clone(),
    })
}
