// ABOUTME: Domain entities mirrored from the daemons: nodes, projects, spiders, jobs
// ABOUTME: Also carries spider groups and the per-node sync result

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ManagerError;

/// A remote crawl daemon endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Offset of the daemon's local clock; job timestamps are reported naive.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

fn default_port() -> u16 {
    6800
}

impl Node {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_port(),
            tls: false,
            username: None,
            password: None,
            utc_offset_minutes: 0,
        }
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }
}

/// One deployed version of a project on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: i64,
    pub node: String,
    pub name: String,
    pub version: String,
    pub spiders_synced: bool,
    pub stale: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last time a daemon listing reported this version.
    pub listed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NewProject {
    pub node: String,
    pub name: String,
    pub version: String,
}

impl NewProject {
    pub fn new(node: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

/// A spider bound to exactly one project version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Spider {
    pub id: i64,
    pub project_id: i64,
    pub node: String,
    pub project: String,
    pub version: String,
    pub name: String,
}

impl fmt::Display for Spider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.project, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Finished,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Stopped => "stopped",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "finished" => Ok(JobStatus::Finished),
            "stopped" => Ok(JobStatus::Stopped),
            other => Err(ManagerError::Store(format!("unknown job status '{}'", other))),
        }
    }
}

/// A mirrored job with its resolved owning spider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: i64,
    pub node: String,
    pub job_id: String,
    pub spider: Spider,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub pid: Option<i64>,
    pub log_url: Option<String>,
    pub items_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub spider_id: i64,
    pub job_id: String,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub pid: Option<i64>,
    pub log_url: Option<String>,
    pub items_url: Option<String>,
}

/// A named batch of logical spiders, optionally pinned to one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiderGroup {
    pub name: String,
    pub node: String,
    pub project: String,
    pub version: Option<String>,
    pub spiders: Vec<String>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Outcome of one node's refresh cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncResult {
    pub node: String,
    pub projects: Vec<Project>,
    /// Project versions whose spider lists were fetched during this cycle.
    pub spiders_synced_count: usize,
    pub jobs: Vec<Job>,
    #[serde(serialize_with = "serialize_errors")]
    pub errors: Vec<ManagerError>,
}

impl SyncResult {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            ..Self::default()
        }
    }

    pub fn attribution_failures(&self) -> impl Iterator<Item = &ManagerError> {
        self.errors.iter().filter(|e| e.is_attribution())
    }
}

pub(crate) fn serialize_errors<S>(errors: &[ManagerError], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_seq(errors.iter().map(|e| e.to_string()))
}
