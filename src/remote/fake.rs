// ABOUTME: In-process daemon double for engine tests
// ABOUTME: Holds scripted remote state and counts every call it receives

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::models::{JobListing, ScheduleResponse, StatusResponse};
use super::{DaemonApi, ScheduleRequest};
use crate::models::Node;

#[derive(Default)]
struct State {
    versions: BTreeMap<String, Vec<String>>,
    spiders: HashMap<(String, String), Vec<String>>,
    jobs: HashMap<String, JobListing>,
    calls: HashMap<&'static str, usize>,
    failing: Vec<&'static str>,
    scheduled: Vec<ScheduleRequest>,
    uploads: Vec<(String, String, usize)>,
    next_job: usize,
    reject_uploads: bool,
}

#[derive(Default)]
pub struct FakeDaemon {
    state: Mutex<State>,
}

impl FakeDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(self, project: &str, version: &str, spiders: &[&str]) -> Self {
        self.add_version(project, version, spiders);
        self
    }

    pub fn add_version(&self, project: &str, version: &str, spiders: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state
            .versions
            .entry(project.to_string())
            .or_default()
            .push(version.to_string());
        state.spiders.insert(
            (project.to_string(), version.to_string()),
            spiders.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn remove_version(&self, project: &str, version: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(versions) = state.versions.get_mut(project) {
            versions.retain(|v| v != version);
        }
    }

    pub fn set_jobs(&self, project: &str, listing: JobListing) {
        self.state
            .lock()
            .unwrap()
            .jobs
            .insert(project.to_string(), listing);
    }

    pub fn fail(&self, op: &'static str) {
        self.state.lock().unwrap().failing.push(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.state.lock().unwrap().failing.retain(|o| *o != op);
    }

    pub fn reject_uploads(&self) {
        self.state.lock().unwrap().reject_uploads = true;
    }

    pub fn calls(&self, op: &'static str) -> usize {
        self.state.lock().unwrap().calls.get(op).copied().unwrap_or(0)
    }

    pub fn scheduled(&self) -> Vec<ScheduleRequest> {
        self.state.lock().unwrap().scheduled.clone()
    }

    pub fn uploads(&self) -> Vec<(String, String, usize)> {
        self.state.lock().unwrap().uploads.clone()
    }

    fn enter(&self, op: &'static str) -> Result<std::sync::MutexGuard<'_, State>> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(op).or_default() += 1;
        if state.failing.contains(&op) {
            anyhow::bail!("{} timed out", op);
        }
        Ok(state)
    }
}

fn ok() -> StatusResponse {
    StatusResponse {
        status: "ok".into(),
        message: None,
        node_name: Some("fake".into()),
    }
}

#[async_trait]
impl DaemonApi for FakeDaemon {
    async fn list_projects(&self, _node: &Node) -> Result<Vec<String>> {
        let state = self.enter("list_projects")?;
        Ok(state
            .versions
            .iter()
            .filter(|(_, versions)| !versions.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn list_versions(&self, _node: &Node, project: &str) -> Result<Vec<String>> {
        let state = self.enter("list_versions")?;
        Ok(state.versions.get(project).cloned().unwrap_or_default())
    }

    async fn list_spiders(
        &self,
        _node: &Node,
        project: &str,
        version: Option<&str>,
    ) -> Result<Vec<String>> {
        let state = self.enter("list_spiders")?;
        let version = match version {
            Some(v) => v.to_string(),
            None => state
                .versions
                .get(project)
                .and_then(|v| v.last().cloned())
                .unwrap_or_default(),
        };
        Ok(state
            .spiders
            .get(&(project.to_string(), version))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_jobs(&self, _node: &Node, project: &str) -> Result<JobListing> {
        let state = self.enter("list_jobs")?;
        Ok(state.jobs.get(project).cloned().unwrap_or_default())
    }

    async fn schedule(&self, _node: &Node, request: &ScheduleRequest) -> Result<ScheduleResponse> {
        let mut state = self.enter("schedule")?;
        state.scheduled.push(request.clone());
        state.next_job += 1;
        Ok(ScheduleResponse {
            jobid: Some(format!("job-{}", state.next_job)),
            status: ok(),
        })
    }

    async fn cancel(&self, _node: &Node, _project: &str, _job_id: &str) -> Result<StatusResponse> {
        drop(self.enter("cancel")?);
        Ok(ok())
    }

    async fn add_version(
        &self,
        _node: &Node,
        project: &str,
        version: &str,
        egg: Vec<u8>,
    ) -> Result<StatusResponse> {
        let mut state = self.enter("add_version")?;
        if state.reject_uploads {
            return Ok(StatusResponse {
                status: "error".into(),
                message: Some("egg is not a valid zip".into()),
                node_name: None,
            });
        }
        state
            .uploads
            .push((project.to_string(), version.to_string(), egg.len()));
        Ok(ok())
    }

    async fn delete_version(
        &self,
        _node: &Node,
        project: &str,
        version: &str,
    ) -> Result<StatusResponse> {
        let mut state = self.enter("delete_version")?;
        if let Some(versions) = state.versions.get_mut(project) {
            versions.retain(|v| v != version);
        }
        Ok(ok())
    }

    async fn delete_project(&self, _node: &Node, project: &str) -> Result<StatusResponse> {
        let mut state = self.enter("delete_project")?;
        state.versions.remove(project);
        Ok(ok())
    }

    async fn daemon_status(&self, _node: &Node) -> Result<serde_json::Value> {
        drop(self.enter("daemon_status")?);
        Ok(serde_json::json!({"status": "ok", "running": 0, "pending": 0, "finished": 0}))
    }
}
