// ABOUTME: Attributes a job to the project version it most likely ran against
// ABOUTME: Uses deploy timestamps encoded in version tokens, newest-before-start first

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{ManagerError, Result};
use crate::models::{Project, Spider};
use crate::store::MirrorStore;

/// Interprets a version token as a Unix deploy timestamp.
pub fn deploy_time(version: &str) -> Option<DateTime<Utc>> {
    let secs = version.trim().parse::<i64>().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

pub struct VersionResolver<'a> {
    store: &'a MirrorStore,
}

impl<'a> VersionResolver<'a> {
    pub fn new(store: &'a MirrorStore) -> Self {
        Self { store }
    }

    /// Resolves one job's owning spider. Loads the project's history each
    /// call; use [`VersionResolver::history`] when resolving many jobs.
    pub fn resolve(
        &self,
        node: &str,
        project: &str,
        spider: &str,
        start_time: DateTime<Utc>,
    ) -> Result<Spider> {
        self.history(node, project)?.resolve(spider, start_time, None)
    }

    /// Snapshot of every mirrored version of `project` with its spider set.
    pub fn history(&self, node: &str, project: &str) -> Result<VersionHistory> {
        let mut entries = Vec::new();
        for row in self.store.project_versions(node, project)? {
            let deployed_at = deploy_time(&row.version);
            if deployed_at.is_none() {
                tracing::warn!(
                    node,
                    project,
                    version = %row.version,
                    "non-numeric version token, excluded from deploy-time ordering"
                );
            }
            let spiders = self
                .store
                .spiders_for_project(row.id)?
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect();
            entries.push(VersionEntry {
                project: row,
                deployed_at,
                spiders,
            });
        }

        // Newest deploy first; ties fall back to insertion order, newest first.
        entries.sort_by(|a, b| {
            b.deployed_at
                .cmp(&a.deployed_at)
                .then_with(|| b.project.id.cmp(&a.project.id))
        });

        Ok(VersionHistory {
            node: node.to_string(),
            project: project.to_string(),
            entries,
        })
    }
}

struct VersionEntry {
    project: Project,
    deployed_at: Option<DateTime<Utc>>,
    spiders: HashMap<String, Spider>,
}

/// The deploy history of one logical project on one node, ordered newest first.
pub struct VersionHistory {
    node: String,
    project: String,
    entries: Vec<VersionEntry>,
}

impl VersionHistory {
    /// Versions deployed strictly before `start_time`, newest first.
    ///
    /// A version whose deploy timestamp equals the job start is not a
    /// candidate. A stale version only qualifies for jobs that started before
    /// a listing last reported it; anything later cannot have run it.
    pub fn candidates(&self, start_time: DateTime<Utc>) -> impl Iterator<Item = &Project> + '_ {
        self.candidate_entries(start_time).map(|e| &e.project)
    }

    fn candidate_entries(&self, start_time: DateTime<Utc>) -> impl Iterator<Item = &VersionEntry> + '_ {
        self.entries
            .iter()
            .filter(move |e| matches!(e.deployed_at, Some(at) if at < start_time))
            .filter(move |e| !e.project.stale || start_time < e.project.listed_at)
    }

    pub fn resolve(
        &self,
        spider: &str,
        start_time: DateTime<Utc>,
        job_id: Option<&str>,
    ) -> Result<Spider> {
        let mut candidates = 0;
        for entry in self.candidate_entries(start_time) {
            candidates += 1;
            if let Some(found) = entry.spiders.get(spider) {
                return Ok(found.clone());
            }
            tracing::debug!(
                node = %self.node,
                project = %self.project,
                version = %entry.project.version,
                spider,
                "spider absent from candidate version, trying older"
            );
        }

        let reason = if candidates == 0 {
            format!("no live numeric version deployed before {}", start_time)
        } else {
            format!("spider not found in any of {} candidate version(s)", candidates)
        };
        Err(self.attribution_error(spider, job_id, reason))
    }

    /// Looks the spider up under one exact version token, numeric or not.
    pub fn resolve_pinned(&self, spider: &str, version: &str, job_id: Option<&str>) -> Result<Spider> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.project.version == version)
            .ok_or_else(|| {
                self.attribution_error(spider, job_id, format!("version {} is not mirrored", version))
            })?;

        entry.spiders.get(spider).cloned().ok_or_else(|| {
            self.attribution_error(spider, job_id, format!("spider not found in version {}", version))
        })
    }

    pub(crate) fn attribution_error(&self, spider: &str, job_id: Option<&str>, reason: String) -> ManagerError {
        ManagerError::Attribution {
            node: self.node.clone(),
            project: self.project.clone(),
            spider: spider.to_string(),
            job_id: job_id.map(str::to_string),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    use tracing::{Dispatch, Level};
    use tracing_subscriber::fmt::MakeWriter;

    use super::*;
    use crate::models::NewProject;
    use crate::store::tests::{seed_version, SEEDED_AT};

    #[derive(Clone, Default)]
    struct LogBuffer {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    struct LogBufferGuard {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl<'a> MakeWriter<'a> for LogBuffer {
        type Writer = LogBufferGuard;

        fn make_writer(&'a self) -> Self::Writer {
            LogBufferGuard {
                buffer: self.buffer.clone(),
            }
        }
    }

    impl Write for LogBufferGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn store_with(versions: &[(&str, &[&str])]) -> MirrorStore {
        let store = MirrorStore::in_memory().unwrap();
        for (version, spiders) in versions {
            seed_version(&store, "n1", "shop", version, spiders);
        }
        store
    }

    #[test]
    fn test_deploy_time_parses_integers_only() {
        assert_eq!(deploy_time("1700000000"), Some(at(1_700_000_000)));
        assert_eq!(deploy_time("v1"), None);
        assert_eq!(deploy_time("1.5"), None);
        assert_eq!(deploy_time("r1a2b3c"), None);
    }

    #[test]
    fn test_after_latest_version_selects_latest() {
        let store = store_with(&[("1000", &["items"]), ("2000", &["items"]), ("3000", &["items"])]);
        let spider = VersionResolver::new(&store)
            .resolve("n1", "shop", "items", at(3001))
            .unwrap();
        assert_eq!(spider.version, "3000");
    }

    #[test]
    fn test_between_versions_selects_earlier() {
        let store = store_with(&[("1000", &["items"]), ("2000", &["items"])]);
        let spider = VersionResolver::new(&store)
            .resolve("n1", "shop", "items", at(1500))
            .unwrap();
        assert_eq!(spider.version, "1000");
    }

    #[test]
    fn test_falls_through_to_older_version_with_spider() {
        let store = store_with(&[("1000", &["items"]), ("2000", &["prices"])]);
        let spider = VersionResolver::new(&store)
            .resolve("n1", "shop", "items", at(2500))
            .unwrap();
        assert_eq!(spider.version, "1000");
    }

    #[test]
    fn test_missing_everywhere_is_attribution_error() {
        let store = store_with(&[("1000", &["prices"]), ("2000", &["prices"])]);
        let err = VersionResolver::new(&store)
            .resolve("n1", "shop", "items", at(1500))
            .unwrap_err();
        assert!(err.is_attribution());
    }

    #[test]
    fn test_job_before_any_deploy_is_attribution_error() {
        let store = store_with(&[("1000", &["items"])]);
        let err = VersionResolver::new(&store)
            .resolve("n1", "shop", "items", at(999))
            .unwrap_err();
        assert!(err.to_string().contains("no live numeric version deployed before"));
    }

    #[test]
    fn test_start_equal_to_deploy_time_excludes_that_version() {
        let store = store_with(&[("1000", &["items"]), ("2000", &["items"])]);
        let spider = VersionResolver::new(&store)
            .resolve("n1", "shop", "items", at(2000))
            .unwrap();
        assert_eq!(spider.version, "1000");
    }

    #[test]
    fn test_non_numeric_versions_are_skipped_with_warning() {
        let store = MirrorStore::in_memory().unwrap();
        seed_version(&store, "n1", "x", "v1", &["items"]);
        seed_version(&store, "n1", "x", "1700000000", &["items"]);

        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(Level::WARN)
            .with_ansi(false)
            .finish();
        let dispatch = Dispatch::new(subscriber);

        let resolver = VersionResolver::new(&store);
        let history = tracing::dispatcher::with_default(&dispatch, || resolver.history("n1", "x").unwrap());

        let logs = logs.contents();
        assert!(logs.contains("non-numeric version token"), "logs: {}", logs);
        assert!(logs.contains("version=v1"), "logs: {}", logs);
        assert!(!logs.contains("version=1700000000"), "logs: {}", logs);
        let candidates: Vec<_> = history
            .candidates(at(1_800_000_000))
            .map(|p| p.version.as_str())
            .collect();
        assert_eq!(candidates, vec!["1700000000"]);

        let spider = history.resolve("items", at(1_800_000_000), Some("job-1")).unwrap();
        assert_eq!(spider.version, "1700000000");
    }

    #[test]
    fn test_gapped_history_ignores_other_projects_and_nodes() {
        let store = MirrorStore::in_memory().unwrap();
        seed_version(&store, "n1", "shop", "1000", &["items"]);
        seed_version(&store, "n1", "shop", "5000", &["items"]);
        seed_version(&store, "n1", "news", "4000", &["items"]);
        seed_version(&store, "n2", "shop", "4500", &["items"]);

        let spider = VersionResolver::new(&store)
            .resolve("n1", "shop", "items", at(4900))
            .unwrap();
        assert_eq!((spider.node.as_str(), spider.version.as_str()), ("n1", "1000"));
    }

    #[test]
    fn test_resolve_pinned_uses_exact_version() {
        let store = MirrorStore::in_memory().unwrap();
        seed_version(&store, "n1", "shop", "v1", &["items"]);
        seed_version(&store, "n1", "shop", "2000", &["prices"]);

        let history = VersionResolver::new(&store).history("n1", "shop").unwrap();
        assert_eq!(history.resolve_pinned("items", "v1", None).unwrap().version, "v1");
        assert!(history.resolve_pinned("items", "2000", Some("j")).is_err());
        assert!(history.resolve_pinned("items", "9999", Some("j")).is_err());
    }

    #[test]
    fn test_stale_version_only_covers_jobs_started_before_it_was_last_listed() {
        let store = store_with(&[("1000", &["items"]), ("2000", &["items"])]);
        let listed = at(SEEDED_AT);
        store
            .reconcile_projects(
                "n1",
                &[("shop".to_string(), vec!["1000".to_string()])].into_iter().collect(),
                at(SEEDED_AT + 60),
            )
            .unwrap();

        let history = VersionResolver::new(&store).history("n1", "shop").unwrap();
        let before = listed - chrono::Duration::seconds(1);
        assert_eq!(history.resolve("items", before, None).unwrap().version, "2000");
        assert_eq!(history.resolve("items", listed, None).unwrap().version, "1000");
        assert_eq!(history.resolve("items", at(SEEDED_AT + 600), None).unwrap().version, "1000");
        let versions: Vec<_> = history
            .candidates(at(SEEDED_AT + 600))
            .map(|p| p.version.as_str())
            .collect();
        assert_eq!(versions, vec!["1000"]);
    }

    #[test]
    fn test_every_version_stale_leaves_new_jobs_unattributed() {
        let store = store_with(&[("1000", &["items"])]);
        store
            .mark_stale_projects("n1", "shop", &[], at(SEEDED_AT + 60))
            .unwrap();
        let err = VersionResolver::new(&store)
            .resolve("n1", "shop", "items", at(SEEDED_AT + 120))
            .unwrap_err();
        assert!(err.is_attribution());

        // Listed again: the row revives and covers new jobs.
        store
            .upsert_projects(&[NewProject::new("n1", "shop", "1000")], at(SEEDED_AT + 180))
            .unwrap();
        let spider = VersionResolver::new(&store)
            .resolve("n1", "shop", "items", at(SEEDED_AT + 240))
            .unwrap();
        assert_eq!(spider.version, "1000");
    }
}
