// ABOUTME: Error taxonomy for mirror synchronization and daemon control
// ABOUTME: Each variant maps to one failure class with its own propagation rule

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// Network, timeout or HTTP-status failure talking to a daemon.
    Transport(String),
    /// A job could not be mapped onto a mirrored spider/version.
    Attribution {
        node: String,
        project: String,
        spider: String,
        job_id: Option<String>,
        reason: String,
    },
    /// Egg missing locally or rejected by `addversion.json`.
    Upload(String),
    /// The daemon answered a control call with `status != "ok"`.
    Rejected(String),
    Store(String),
    Config(String),
    NotFound(String),
}

impl ManagerError {
    pub fn transport(err: anyhow::Error) -> Self {
        ManagerError::Transport(format!("{:#}", err))
    }

    pub fn is_attribution(&self) -> bool {
        matches!(self, ManagerError::Attribution { .. })
    }
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ManagerError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ManagerError::Attribution {
                node,
                project,
                spider,
                job_id,
                reason,
            } => match job_id {
                Some(job_id) => write!(
                    f,
                    "Attribution error: job {} ({}/{} on node {}): {}",
                    job_id, project, spider, node, reason
                ),
                None => write!(
                    f,
                    "Attribution error: {}/{} on node {}: {}",
                    project, spider, node, reason
                ),
            },
            ManagerError::Upload(msg) => write!(f, "Upload error: {}", msg),
            ManagerError::Rejected(msg) => write!(f, "Daemon rejected request: {}", msg),
            ManagerError::Store(msg) => write!(f, "Mirror store error: {}", msg),
            ManagerError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ManagerError::NotFound(msg) => write!(f, "Not found: {}", msg),
        }
    }
}

impl std::error::Error for ManagerError {}

impl From<rusqlite::Error> for ManagerError {
    fn from(err: rusqlite::Error) -> Self {
        ManagerError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for ManagerError {
    fn from(err: serde_json::Error) -> Self {
        ManagerError::Store(format!("invalid stored JSON: {}", err))
    }
}

pub type Result<T, E = ManagerError> = std::result::Result<T, E>;
