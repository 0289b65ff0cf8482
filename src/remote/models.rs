// ABOUTME: Wire shapes of the daemon's JSON control API
// ABOUTME: Deserialized from list/schedule/cancel/deploy responses

use serde::{Deserialize, Serialize};

/// Fields every daemon response carries alongside its payload.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub node_name: Option<String>,
}

impl StatusResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    pub fn describe(&self) -> String {
        match &self.message {
            Some(message) => format!("status {}: {}", self.status, message),
            None => format!("status {}", self.status),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListProjects {
    #[serde(default)]
    pub projects: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListVersions {
    #[serde(default)]
    pub versions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListSpiders {
    #[serde(default)]
    pub spiders: Vec<String>,
}

/// One entry of a `listjobs.json` bucket.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct RemoteJob {
    pub id: String,
    pub spider: String,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub pid: Option<i64>,
    #[serde(default)]
    pub log_url: Option<String>,
    #[serde(default)]
    pub items_url: Option<String>,
    /// Only reported for pending jobs scheduled with an explicit version.
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct JobListing {
    #[serde(default)]
    pub pending: Vec<RemoteJob>,
    #[serde(default)]
    pub running: Vec<RemoteJob>,
    #[serde(default)]
    pub finished: Vec<RemoteJob>,
}

impl JobListing {
    pub fn len(&self) -> usize {
        self.pending.len() + self.running.len() + self.finished.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleResponse {
    #[serde(default)]
    pub jobid: Option<String>,
    #[serde(flatten)]
    pub status: StatusResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_listing_parses_daemon_payload() {
        let body = r#"{
            "node_name": "crawler-1",
            "status": "ok",
            "pending": [{"id": "p1", "spider": "items", "project": "shop"}],
            "running": [{"id": "r1", "spider": "items", "pid": 9012,
                         "start_time": "2024-01-01 10:00:00.123456"}],
            "finished": [{"id": "f1", "spider": "prices",
                          "start_time": "2024-01-01 09:00:00.000001",
                          "end_time": "2024-01-01 09:05:00.000001",
                          "log_url": "/logs/shop/prices/f1.log",
                          "items_url": "/items/shop/prices/f1.jl"}]
        }"#;
        let listing: JobListing = serde_json::from_str(body).unwrap();
        assert_eq!(listing.len(), 3);
        assert_eq!(listing.pending[0].start_time, None);
        assert_eq!(listing.running[0].pid, Some(9012));
        assert_eq!(listing.finished[0].log_url.as_deref(), Some("/logs/shop/prices/f1.log"));
    }

    #[test]
    fn test_schedule_response_flattens_status() {
        let ok: ScheduleResponse =
            serde_json::from_str(r#"{"status": "ok", "jobid": "6487ec79"}"#).unwrap();
        assert_eq!(ok.jobid.as_deref(), Some("6487ec79"));
        assert!(ok.status.is_ok());

        let err: ScheduleResponse =
            serde_json::from_str(r#"{"status": "error", "message": "spider 'x' not found"}"#)
                .unwrap();
        assert!(err.jobid.is_none());
        assert_eq!(err.status.describe(), "status error: spider 'x' not found");
    }
}
