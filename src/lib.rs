// ABOUTME: Library root for the Scrapyd fleet manager
// ABOUTME: Mirrors daemon state into SQLite and attributes jobs to deployed versions

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod predicate;
pub mod remote;
pub mod resolver;
pub mod store;
pub mod sync;

pub use cache::{CacheKey, TtlCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{ManagerError, Result};
pub use models::{Job, JobStatus, Node, Project, Spider, SpiderGroup, SyncResult};
pub use predicate::{JobField, Predicate, ProjectField, SpiderField};
pub use remote::{DaemonApi, NodeCredentials, RemoteClient};
pub use resolver::VersionResolver;
pub use store::MirrorStore;
pub use sync::SyncEngine;
