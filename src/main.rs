// ABOUTME: CLI entry point for the Scrapyd fleet manager
// ABOUTME: Loads node config, opens the mirror and dispatches sync/control subcommands

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use scrapyd_manager::config::DEFAULT_CONFIG_PATH;
use scrapyd_manager::logging::init_logging;
use scrapyd_manager::{
    Clock, Config, JobField, JobStatus, ManagerError, MirrorStore, Node, NodeCredentials, Predicate,
    ProjectField, RemoteClient, SpiderField, SpiderGroup, SyncEngine, SystemClock, VersionResolver,
};

#[derive(Parser)]
#[command(name = "scrapyd-manager")]
#[command(about = "Mirror and control a fleet of Scrapyd daemons", version)]
struct Cli {
    /// Path to the config file
    #[arg(long, short = 'c', global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Debug logging for this crate
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh the mirror from one node, or from every node with --all
    Sync {
        #[arg(required_unless_present = "all")]
        node: Option<String>,

        #[arg(long, conflicts_with = "node")]
        all: bool,
    },

    /// List mirrored project versions
    Projects {
        node: String,

        #[arg(long)]
        name: Option<String>,

        /// Include versions no longer reported by the daemon
        #[arg(long)]
        include_stale: bool,
    },

    /// List mirrored spiders
    Spiders {
        node: String,

        #[arg(long)]
        project: Option<String>,

        #[arg(long)]
        version: Option<String>,
    },

    /// List mirrored jobs
    Jobs {
        node: String,

        #[arg(long)]
        project: Option<String>,

        #[arg(long)]
        spider: Option<String>,

        /// pending, running, finished or stopped
        #[arg(long)]
        status: Option<JobStatus>,
    },

    /// Schedule a spider run
    Schedule {
        node: String,
        project: String,
        spider: String,

        /// Run this exact version instead of the newest one
        #[arg(long)]
        version: Option<String>,

        /// Spider argument, repeatable (key=value)
        #[arg(long = "arg", value_parser = parse_key_value)]
        args: Vec<(String, String)>,
    },

    /// Cancel one job by its daemon job id
    Cancel { node: String, job_id: String },

    /// Cancel every pending or running job of a spider
    StopSpider {
        node: String,
        project: String,
        spider: String,
    },

    /// Upload an egg as a new project version
    Deploy {
        node: String,
        project: String,
        egg: PathBuf,

        /// Version token (default: current Unix time)
        #[arg(long)]
        version: Option<String>,
    },

    /// Delete one project version from the daemon
    DeleteVersion {
        node: String,
        project: String,
        version: String,

        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Delete a project with all of its versions from the daemon
    DeleteProject {
        node: String,
        project: String,

        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Show daemon load and mirrored projects
    Status { node: String },

    /// Manage spider groups
    Group {
        #[command(subcommand)]
        action: GroupCommands,
    },
}

#[derive(Subcommand)]
enum GroupCommands {
    /// Create or replace a group
    Add {
        name: String,
        node: String,
        project: String,

        /// Comma-separated spider names
        #[arg(long, value_delimiter = ',', required = true)]
        spiders: Vec<String>,

        /// Pin every run to this version
        #[arg(long)]
        version: Option<String>,

        #[arg(long = "arg", value_parser = parse_key_value)]
        args: Vec<(String, String)>,

        #[arg(long)]
        description: Option<String>,
    },

    /// List groups
    List,

    /// Delete a group
    Remove { name: String },

    /// Schedule every spider of a group
    Start { name: String },

    /// Cancel the active jobs of a group
    Stop { name: String },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config = Config::load(&cli.config)?;
    let store = Arc::new(
        MirrorStore::open(&config.database)
            .with_context(|| format!("Failed to open mirror at {}", config.database.display()))?,
    );
    let client = RemoteClient::new(Arc::new(NodeCredentials), &config.timeouts)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = SyncEngine::new(Arc::new(client), store, Arc::clone(&clock), config.cache.clone());

    let app = App {
        config: &config,
        engine: &engine,
        clock,
        json: cli.json,
    };
    app.run(cli.command).await
}

struct App<'a> {
    config: &'a Config,
    engine: &'a SyncEngine,
    clock: Arc<dyn Clock>,
    json: bool,
}

impl<'a> App<'a> {
    async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Sync { node: _, all: true } => self.sync_all().await,
            Commands::Sync { node, all: false } => {
                let node = self.node(node.as_deref().unwrap_or_default())?;
                let result = self.engine.sync_node(node).await?;
                self.emit(&*result, || {
                    println!(
                        "{}: {} project version(s), {} job(s), {} spider set(s) fetched",
                        result.node,
                        result.projects.len(),
                        result.jobs.len(),
                        result.spiders_synced_count
                    );
                    for err in &result.errors {
                        println!("  ! {}", err);
                    }
                })
            }
            Commands::Projects {
                node,
                name,
                include_stale,
            } => {
                let node = self.node(&node)?;
                let mut filter = Predicate::default();
                if let Some(name) = name {
                    filter = filter.and(Predicate::is(ProjectField::Name(name)));
                }
                if !include_stale {
                    filter = filter.and(Predicate::is(ProjectField::Stale(false)));
                }
                let projects = self.engine.sync_then_read_projects(node, &filter).await?;
                self.emit(&projects, || {
                    for p in &projects {
                        let stale = if p.stale { " (stale)" } else { "" };
                        println!("{}\t{}{}", p.name, p.version, stale);
                    }
                })
            }
            Commands::Spiders {
                node,
                project,
                version,
            } => {
                let node = self.node(&node)?;
                let mut filter = Predicate::default();
                if let Some(project) = project {
                    filter = filter.and(Predicate::is(SpiderField::Project(project)));
                }
                if let Some(version) = version {
                    filter = filter.and(Predicate::is(SpiderField::Version(version)));
                }
                let spiders = self.engine.sync_then_read_spiders(node, &filter).await?;
                self.emit(&spiders, || {
                    for s in &spiders {
                        println!("{}", s);
                    }
                })
            }
            Commands::Jobs {
                node,
                project,
                spider,
                status,
            } => {
                let node = self.node(&node)?;
                let mut filter = Predicate::default();
                if let Some(project) = project {
                    filter = filter.and(Predicate::is(JobField::Spider(SpiderField::Project(project))));
                }
                if let Some(spider) = spider {
                    filter = filter.and(Predicate::is(JobField::Spider(SpiderField::Name(spider))));
                }
                if let Some(status) = status {
                    filter = filter.and(Predicate::is(JobField::Status(status)));
                }
                let jobs = self.engine.sync_then_read_jobs(node, &filter).await?;
                self.emit(&jobs, || {
                    for j in &jobs {
                        println!(
                            "{}\t{}\t{}\t{}",
                            j.job_id,
                            j.status,
                            j.spider,
                            j.start_time.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                })
            }
            Commands::Schedule {
                node,
                project,
                spider,
                version,
                args,
            } => {
                let node = self.node(&node)?;
                self.engine.sync_node(node).await?;

                let history = VersionResolver::new(self.engine.store()).history(&node.name, &project)?;
                let target = match version.as_deref() {
                    Some(v) => history.resolve_pinned(&spider, v, None)?,
                    None => history.resolve(&spider, self.clock.now(), None)?,
                };
                let args: BTreeMap<String, String> = args.into_iter().collect();

                match self
                    .engine
                    .schedule_spider(node, &target, version.as_deref(), &args)
                    .await?
                {
                    Some(job) => self.emit(&job, || println!("scheduled {} as job {}", job.spider, job.job_id)),
                    None => bail!("daemon on node '{}' returned no job id", node.name),
                }
            }
            Commands::Cancel { node, job_id } => {
                let node = self.node(&node)?;
                let jobs = self
                    .engine
                    .sync_then_read_jobs(node, &Predicate::is(JobField::JobId(job_id.clone())))
                    .await?;
                let Some(job) = jobs.first() else {
                    return Err(ManagerError::NotFound(format!("job '{}' on node '{}'", job_id, node.name)).into());
                };
                match self.engine.cancel_job(node, job).await? {
                    Some(job) => self.emit(&job, || println!("stopped job {}", job.job_id)),
                    None => bail!("daemon refused to cancel job {}", job_id),
                }
            }
            Commands::StopSpider {
                node,
                project,
                spider,
            } => {
                let node = self.node(&node)?;
                let stopped = self.engine.stop_spider(node, &project, &spider).await?;
                self.emit(&stopped, || println!("stopped {} job(s)", stopped.len()))
            }
            Commands::Deploy {
                node,
                project,
                egg,
                version,
            } => {
                let node = self.node(&node)?;
                let outcome = self
                    .engine
                    .deploy_version(node, &project, version.as_deref(), &egg)
                    .await?;
                self.emit(&outcome, || {
                    println!("deployed {} version {}", outcome.project, outcome.version)
                })
            }
            Commands::DeleteVersion {
                node,
                project,
                version,
                yes,
            } => {
                let node = self.node(&node)?;
                self.engine.sync_projects(node).await?;
                let row = self
                    .engine
                    .store()
                    .project(&node.name, &project, &version)?
                    .ok_or_else(|| ManagerError::NotFound(format!("{} version {}", project, version)))?;

                if !yes && !confirm(&format!("Delete {} version {} from node '{}'?", project, version, node.name))? {
                    println!("Aborted");
                    return Ok(());
                }
                self.engine.delete_version(node, &row).await?;
                println!("deleted {} version {}", project, version);
                Ok(())
            }
            Commands::DeleteProject { node, project, yes } => {
                let node = self.node(&node)?;
                if !yes && !confirm(&format!("Delete project {} and ALL its versions from node '{}'?", project, node.name))? {
                    println!("Aborted");
                    return Ok(());
                }
                let staled = self.engine.delete_project(node, &project).await?;
                println!("deleted project {} ({} mirrored version(s) marked stale)", project, staled);
                Ok(())
            }
            Commands::Status { node } => {
                let node = self.node(&node)?;
                let info = self.engine.node_info(node).await?;
                self.emit(&info, || {
                    println!("{} ({})", node.name, node.base_url());
                    for key in ["running", "pending", "finished"] {
                        println!("  {}: {}", key, info.status[key]);
                    }
                    println!("  live project versions: {}", info.projects.iter().filter(|p| !p.stale).count());
                })
            }
            Commands::Group { action } => self.group(action).await,
        }
    }

    async fn group(&self, action: GroupCommands) -> anyhow::Result<()> {
        let store = self.engine.store();
        match action {
            GroupCommands::Add {
                name,
                node,
                project,
                spiders,
                version,
                args,
                description,
            } => {
                self.node(&node)?;
                let group = SpiderGroup {
                    name,
                    node,
                    project,
                    version,
                    spiders,
                    args: args.into_iter().collect(),
                    description,
                };
                store.save_spider_group(&group, self.clock.now())?;
                self.emit(&group, || println!("saved group {}", group.name))
            }
            GroupCommands::List => {
                let groups = store.spider_groups()?;
                self.emit(&groups, || {
                    for g in &groups {
                        let pin = g.version.as_deref().unwrap_or("latest");
                        println!("{}\t{}/{}@{}\t{}", g.name, g.node, g.project, pin, g.spiders.join(","));
                    }
                })
            }
            GroupCommands::Remove { name } => {
                if !store.delete_spider_group(&name)? {
                    return Err(ManagerError::NotFound(format!("group '{}'", name)).into());
                }
                println!("removed group {}", name);
                Ok(())
            }
            GroupCommands::Start { name } => {
                let group = self.spider_group(&name)?;
                let node = self.node(&group.node)?;
                self.engine.sync_node(node).await?;
                let run = self.engine.start_spider_group(node, &group).await?;
                self.emit(&run, || {
                    println!("started {} job(s)", run.jobs.len());
                    for err in &run.errors {
                        println!("  ! {}", err);
                    }
                })
            }
            GroupCommands::Stop { name } => {
                let group = self.spider_group(&name)?;
                let node = self.node(&group.node)?;
                let run = self.engine.stop_spider_group(node, &group).await?;
                self.emit(&run, || {
                    println!("stopped {} job(s)", run.jobs.len());
                    for err in &run.errors {
                        println!("  ! {}", err);
                    }
                })
            }
        }
    }

    async fn sync_all(&self) -> anyhow::Result<()> {
        let bar = ProgressBar::new(self.config.nodes.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );

        let cycles = self.config.nodes.iter().map(|node| {
            let bar = bar.clone();
            async move {
                let result = self.engine.sync_node(node).await;
                bar.set_message(node.name.clone());
                bar.inc(1);
                (node.name.clone(), result)
            }
        });
        let results = futures::future::join_all(cycles).await;
        bar.finish_and_clear();

        let mut failed = 0;
        for (name, result) in &results {
            match result {
                Ok(sync) => println!(
                    "{}: {} project version(s), {} job(s), {} error(s)",
                    name,
                    sync.projects.len(),
                    sync.jobs.len(),
                    sync.errors.len()
                ),
                Err(err) => {
                    failed += 1;
                    println!("{}: FAILED: {}", name, err);
                }
            }
        }
        if failed > 0 {
            bail!("{} of {} node(s) failed to sync", failed, results.len());
        }
        Ok(())
    }

    fn node(&self, name: &str) -> anyhow::Result<&'a Node> {
        Ok(self.config.node(name)?)
    }

    fn spider_group(&self, name: &str) -> anyhow::Result<SpiderGroup> {
        self.engine
            .store()
            .spider_group(name)?
            .ok_or_else(|| ManagerError::NotFound(format!("group '{}'", name)).into())
    }

    fn emit<T: Serialize + ?Sized>(&self, value: &T, human: impl FnOnce()) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human();
        }
        Ok(())
    }
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    Ok(Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}
