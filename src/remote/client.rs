// ABOUTME: HTTP client for the daemon's JSON control API
// ABOUTME: Attaches per-node basic auth, bounds every call with a timeout, maps failures

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{multipart, Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use super::models::{
    JobListing, ListProjects, ListSpiders, ListVersions, ScheduleResponse, StatusResponse,
};
use super::{CredentialProvider, DaemonApi, ScheduleRequest};
use crate::config::TimeoutSettings;
use crate::models::Node;

pub struct RemoteClient {
    client: Client,
    credentials: Arc<dyn CredentialProvider>,
    control_timeout: Duration,
    upload_timeout: Duration,
}

impl RemoteClient {
    pub fn new(credentials: Arc<dyn CredentialProvider>, timeouts: &TimeoutSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeouts.upload())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            credentials,
            control_timeout: timeouts.control(),
            upload_timeout: timeouts.upload(),
        })
    }

    fn request(&self, method: Method, node: &Node, endpoint: &str, timeout: Duration) -> RequestBuilder {
        let url = format!("{}/{}", node.base_url(), endpoint);
        tracing::debug!(node = %node.name, %method, %url, "daemon request");

        let builder = self.client.request(method, &url).timeout(timeout);
        match self.credentials.auth_for(node) {
            Some(creds) => builder.basic_auth(creds.username, Some(creds.password)),
            None => builder,
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        node: &Node,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self
            .request(Method::GET, node, endpoint, self.control_timeout)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to reach {} on node {}", endpoint, node.name))?;

        decode_checked(response, endpoint).await
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        node: &Node,
        endpoint: &str,
        form: &[(String, String)],
    ) -> Result<T> {
        let response = self
            .request(Method::POST, node, endpoint, self.control_timeout)
            .form(form)
            .send()
            .await
            .with_context(|| format!("Failed to reach {} on node {}", endpoint, node.name))?;

        decode(response, endpoint).await
    }
}

async fn read_body(response: Response, endpoint: &str) -> Result<String> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("{} failed with status {}: {}", endpoint, status, body);
    }

    response
        .text()
        .await
        .with_context(|| format!("Failed to read {} response body", endpoint))
}

async fn decode<T: DeserializeOwned>(response: Response, endpoint: &str) -> Result<T> {
    let body = read_body(response, endpoint).await?;
    serde_json::from_str(&body).with_context(|| format!("Failed to parse {} response", endpoint))
}

/// Like `decode`, but a `"status": "error"` payload is a failure.
async fn decode_checked<T: DeserializeOwned>(response: Response, endpoint: &str) -> Result<T> {
    let body = read_body(response, endpoint).await?;
    let status: StatusResponse = serde_json::from_str(&body)
        .with_context(|| format!("Failed to parse {} response", endpoint))?;
    if status.status == "error" {
        anyhow::bail!("{} returned {}", endpoint, status.describe());
    }

    serde_json::from_str(&body).with_context(|| format!("Failed to parse {} response", endpoint))
}

#[async_trait]
impl DaemonApi for RemoteClient {
    async fn list_projects(&self, node: &Node) -> Result<Vec<String>> {
        let listing: ListProjects = self.get(node, "listprojects.json", &[]).await?;
        Ok(listing.projects)
    }

    async fn list_versions(&self, node: &Node, project: &str) -> Result<Vec<String>> {
        let listing: ListVersions = self
            .get(node, "listversions.json", &[("project", project)])
            .await?;
        Ok(listing.versions)
    }

    async fn list_spiders(
        &self,
        node: &Node,
        project: &str,
        version: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut query = vec![("project", project)];
        if let Some(version) = version {
            query.push(("_version", version));
        }
        let listing: ListSpiders = self.get(node, "listspiders.json", &query).await?;
        Ok(listing.spiders)
    }

    async fn list_jobs(&self, node: &Node, project: &str) -> Result<JobListing> {
        self.get(node, "listjobs.json", &[("project", project)]).await
    }

    async fn schedule(&self, node: &Node, request: &ScheduleRequest) -> Result<ScheduleResponse> {
        self.post_form(node, "schedule.json", &request.form()).await
    }

    async fn cancel(&self, node: &Node, project: &str, job_id: &str) -> Result<StatusResponse> {
        let form = [
            ("project".to_string(), project.to_string()),
            ("job".to_string(), job_id.to_string()),
        ];
        self.post_form(node, "cancel.json", &form).await
    }

    async fn add_version(
        &self,
        node: &Node,
        project: &str,
        version: &str,
        egg: Vec<u8>,
    ) -> Result<StatusResponse> {
        let egg = multipart::Part::bytes(egg)
            .file_name(format!("{}-{}.egg", project, version))
            .mime_str("application/octet-stream")
            .context("Failed to build egg upload part")?;
        let form = multipart::Form::new()
            .text("project", project.to_string())
            .text("version", version.to_string())
            .part("egg", egg);

        let response = self
            .request(Method::POST, node, "addversion.json", self.upload_timeout)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("Failed to upload {} {} to node {}", project, version, node.name))?;

        decode(response, "addversion.json").await
    }

    async fn delete_version(
        &self,
        node: &Node,
        project: &str,
        version: &str,
    ) -> Result<StatusResponse> {
        let form = [
            ("project".to_string(), project.to_string()),
            ("version".to_string(), version.to_string()),
        ];
        self.post_form(node, "delversion.json", &form).await
    }

    async fn delete_project(&self, node: &Node, project: &str) -> Result<StatusResponse> {
        let form = [("project".to_string(), project.to_string())];
        self.post_form(node, "delproject.json", &form).await
    }

    async fn daemon_status(&self, node: &Node) -> Result<serde_json::Value> {
        self.get(node, "daemonstatus.json", &[]).await
    }
}
