// ABOUTME: Remote daemon access: the control API seam and its HTTP implementation
// ABOUTME: Credentials are looked up per node through a provider

pub mod client;
#[cfg(test)]
pub(crate) mod fake;
pub mod models;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Node;

pub use client::RemoteClient;
pub use models::{JobListing, RemoteJob, ScheduleResponse, StatusResponse};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

pub trait CredentialProvider: Send + Sync {
    fn auth_for(&self, node: &Node) -> Option<Credentials>;
}

/// Reads the username/password configured on the node itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeCredentials;

impl CredentialProvider for NodeCredentials {
    fn auth_for(&self, node: &Node) -> Option<Credentials> {
        match (&node.username, &node.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub project: String,
    pub spider: String,
    /// Sent as `_version`; without it the daemon runs the newest version.
    pub version: Option<String>,
    pub args: BTreeMap<String, String>,
}

impl ScheduleRequest {
    pub fn form(&self) -> Vec<(String, String)> {
        let mut form = vec![
            ("project".to_string(), self.project.clone()),
            ("spider".to_string(), self.spider.clone()),
        ];
        if let Some(version) = &self.version {
            form.push(("_version".to_string(), version.clone()));
        }
        for (key, value) in &self.args {
            form.push((key.clone(), value.clone()));
        }
        form
    }
}

/// The daemon control operations the engine consumes.
#[async_trait]
pub trait DaemonApi: Send + Sync {
    async fn list_projects(&self, node: &Node) -> Result<Vec<String>>;

    async fn list_versions(&self, node: &Node, project: &str) -> Result<Vec<String>>;

    async fn list_spiders(
        &self,
        node: &Node,
        project: &str,
        version: Option<&str>,
    ) -> Result<Vec<String>>;

    async fn list_jobs(&self, node: &Node, project: &str) -> Result<JobListing>;

    async fn schedule(&self, node: &Node, request: &ScheduleRequest) -> Result<ScheduleResponse>;

    async fn cancel(&self, node: &Node, project: &str, job_id: &str) -> Result<StatusResponse>;

    async fn add_version(
        &self,
        node: &Node,
        project: &str,
        version: &str,
        egg: Vec<u8>,
    ) -> Result<StatusResponse>;

    async fn delete_version(&self, node: &Node, project: &str, version: &str)
        -> Result<StatusResponse>;

    async fn delete_project(&self, node: &Node, project: &str) -> Result<StatusResponse>;

    async fn daemon_status(&self, node: &Node) -> Result<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_credentials_require_both_parts() {
        let mut node = Node::new("n1", "localhost");
        assert_eq!(NodeCredentials.auth_for(&node), None);

        node.username = Some("admin".into());
        assert_eq!(NodeCredentials.auth_for(&node), None);

        node.password = Some("secret".into());
        assert_eq!(
            NodeCredentials.auth_for(&node),
            Some(Credentials {
                username: "admin".into(),
                password: "secret".into()
            })
        );
    }

    #[test]
    fn test_schedule_form_includes_version_and_args() {
        let mut args = BTreeMap::new();
        args.insert("category".to_string(), "books".to_string());
        let request = ScheduleRequest {
            project: "shop".into(),
            spider: "items".into(),
            version: Some("1700000000".into()),
            args,
        };
        let form = request.form();
        assert_eq!(form[0], ("project".to_string(), "shop".to_string()));
        assert!(form.contains(&("_version".to_string(), "1700000000".to_string())));
        assert!(form.contains(&("category".to_string(), "books".to_string())));
    }
}
