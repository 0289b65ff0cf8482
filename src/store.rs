// ABOUTME: SQLite-backed local mirror of daemon state
// ABOUTME: Bulk upserts for projects/spiders, transactional full replacement for jobs

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{ManagerError, Result};
use crate::models::{Job, JobStatus, NewJob, NewProject, Project, Spider, SpiderGroup};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node TEXT NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    spiders_synced INTEGER NOT NULL DEFAULT 0,
    stale INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    listed_at TEXT NOT NULL,
    UNIQUE (node, name, version)
);

CREATE TABLE IF NOT EXISTS spiders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (project_id, name)
);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node TEXT NOT NULL,
    spider_id INTEGER NOT NULL REFERENCES spiders(id),
    job_id TEXT NOT NULL,
    status TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    pid INTEGER,
    log_url TEXT,
    items_url TEXT,
    UNIQUE (node, spider_id, job_id)
);

CREATE INDEX IF NOT EXISTS idx_jobs_node ON jobs(node);

CREATE TABLE IF NOT EXISTS spider_groups (
    name TEXT PRIMARY KEY,
    node TEXT NOT NULL,
    project TEXT NOT NULL,
    version TEXT,
    spiders TEXT NOT NULL,
    args TEXT NOT NULL,
    description TEXT,
    updated_at TEXT NOT NULL
);
";

const PROJECT_COLUMNS: &str =
    "id, node, name, version, spiders_synced, stale, created_at, updated_at, listed_at";

const SPIDER_SELECT: &str = "
SELECT s.id, s.project_id, p.node, p.name, p.version, s.name
FROM spiders s JOIN projects p ON p.id = s.project_id";

const JOB_SELECT: &str = "
SELECT j.id, j.node, j.job_id, j.status, j.start_time, j.end_time, j.pid, j.log_url, j.items_url,
       s.id, s.project_id, p.node, p.name, p.version, s.name
FROM jobs j
JOIN spiders s ON s.id = j.spider_id
JOIN projects p ON p.id = s.project_id";

const INSERT_JOB: &str = "
INSERT OR REPLACE INTO jobs
    (node, spider_id, job_id, status, start_time, end_time, pid, log_url, items_url)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

macro_rules! job_params {
    ($node:expr, $row:expr) => {
        params![
            $node,
            $row.spider_id,
            $row.job_id,
            $row.status.as_str(),
            $row.start_time,
            $row.end_time,
            $row.pid,
            $row.log_url,
            $row.items_url,
        ]
    };
}

/// Counts from one project reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectDiff {
    pub inserted: usize,
    pub staled: usize,
}

pub struct MirrorStore {
    conn: Mutex<Connection>,
}

impl MirrorStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::bootstrap(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        add_listed_at(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ManagerError::Store("mirror connection lock poisoned".into()))
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    /// Inserts rows that are absent, revives stale ones and records `now` as
    /// the time each row was last seen listed. Returns how many rows were
    /// newly inserted.
    pub fn upsert_projects(&self, rows: &[NewProject], now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let inserted = insert_projects(&tx, rows, now)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Marks every live version of `node`/`name` not in `keep_versions` stale.
    pub fn mark_stale_projects(
        &self,
        node: &str,
        name: &str,
        keep_versions: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let staled = stale_versions_except(&tx, node, name, keep_versions, now)?;
        tx.commit()?;
        Ok(staled)
    }

    /// Applies a full remote listing (`name -> versions`) for one node in a
    /// single transaction: new versions inserted, unlisted ones marked stale.
    pub fn reconcile_projects(
        &self,
        node: &str,
        listing: &BTreeMap<String, Vec<String>>,
        now: DateTime<Utc>,
    ) -> Result<ProjectDiff> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let rows: Vec<NewProject> = listing
            .iter()
            .flat_map(|(name, versions)| {
                versions
                    .iter()
                    .map(move |version| NewProject::new(node, name.as_str(), version.as_str()))
            })
            .collect();
        let inserted = insert_projects(&tx, &rows, now)?;

        let mut names: BTreeSet<String> = live_project_names(&tx, node)?.into_iter().collect();
        names.extend(listing.keys().cloned());

        let mut staled = 0;
        for name in &names {
            let keep = listing.get(name).map(Vec::as_slice).unwrap_or(&[]);
            staled += stale_versions_except(&tx, node, name, keep, now)?;
        }

        tx.commit()?;
        Ok(ProjectDiff { inserted, staled })
    }

    pub fn mark_version_stale(&self, project_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE projects SET stale = 1, updated_at = ?2 WHERE id = ?1 AND stale = 0",
            params![project_id, now],
        )?;
        Ok(changed > 0)
    }

    /// Every mirrored version on `node`, stale ones included.
    pub fn projects(&self, node: &str) -> Result<Vec<Project>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM projects WHERE node = ?1 ORDER BY name, id",
            PROJECT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![node], map_project)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Deploy history of one logical project, stale versions included.
    pub fn project_versions(&self, node: &str, name: &str) -> Result<Vec<Project>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM projects WHERE node = ?1 AND name = ?2 ORDER BY id",
            PROJECT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![node, name], map_project)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn project(&self, node: &str, name: &str, version: &str) -> Result<Option<Project>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM projects WHERE node = ?1 AND name = ?2 AND version = ?3",
                    PROJECT_COLUMNS
                ),
                params![node, name, version],
                map_project,
            )
            .optional()?)
    }

    /// Distinct names of projects with at least one live version.
    pub fn project_names(&self, node: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        live_project_names(&conn, node)
    }

    pub fn spiders_synced(&self, project_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        spiders_synced(&conn, project_id)?
            .ok_or_else(|| ManagerError::NotFound(format!("project row {}", project_id)))
    }

    // ------------------------------------------------------------------
    // Spiders
    // ------------------------------------------------------------------

    /// Inserts the spider set of one project version and flags it synced, in
    /// one transaction. Returns `false` without writing if already synced.
    pub fn upsert_spiders_if_unsynced(
        &self,
        project_id: i64,
        names: &[String],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        match spiders_synced(&tx, project_id)? {
            None => {
                return Err(ManagerError::NotFound(format!("project row {}", project_id)));
            }
            Some(true) => return Ok(false),
            Some(false) => {}
        }

        {
            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO spiders (project_id, name, created_at) VALUES (?1, ?2, ?3)",
            )?;
            for name in names {
                insert.execute(params![project_id, name, now])?;
            }
        }
        tx.execute(
            "UPDATE projects SET spiders_synced = 1, updated_at = ?2 WHERE id = ?1",
            params![project_id, now],
        )?;

        tx.commit()?;
        Ok(true)
    }

    pub fn spiders_for_project(&self, project_id: i64) -> Result<Vec<Spider>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached(&format!("{} WHERE s.project_id = ?1 ORDER BY s.name", SPIDER_SELECT))?;
        let rows = stmt.query_map(params![project_id], map_spider)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn spiders(&self, node: &str) -> Result<Vec<Spider>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE p.node = ?1 ORDER BY p.name, p.id, s.name",
            SPIDER_SELECT
        ))?;
        let rows = stmt.query_map(params![node], map_spider)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Replaces the node's entire job set with `rows` in one transaction.
    pub fn replace_jobs(&self, node: &str, rows: &[NewJob]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let removed = tx.execute("DELETE FROM jobs WHERE node = ?1", params![node])?;
        {
            let mut insert = tx.prepare_cached(INSERT_JOB)?;
            for row in rows {
                insert.execute(job_params!(node, row))?;
            }
        }

        tx.commit()?;
        tracing::debug!(node, removed, inserted = rows.len(), "replaced job set");
        Ok(rows.len())
    }

    pub fn insert_job(&self, node: &str, row: &NewJob) -> Result<Job> {
        let conn = self.conn()?;
        conn.execute(INSERT_JOB, job_params!(node, row))?;
        let id = conn.last_insert_rowid();
        job_by_id(&conn, id)?.ok_or_else(|| ManagerError::NotFound(format!("job row {}", id)))
    }

    /// Marks a job stopped by its daemon job id. Row ids do not survive a
    /// job set replacement, so the lookup goes by `(node, job_id)`.
    pub fn mark_job_stopped(&self, node: &str, job_id: &str, end_time: DateTime<Utc>) -> Result<Job> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3, end_time = ?4 WHERE node = ?1 AND job_id = ?2",
            params![node, job_id, JobStatus::Stopped.as_str(), end_time],
        )?;
        if changed == 0 {
            return Err(ManagerError::NotFound(format!("job {} on node {}", job_id, node)));
        }
        Ok(conn.query_row(
            &format!("{} WHERE j.node = ?1 AND j.job_id = ?2 ORDER BY j.id DESC LIMIT 1", JOB_SELECT),
            params![node, job_id],
            map_job,
        )?)
    }

    pub fn jobs(&self, node: &str) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE j.node = ?1 ORDER BY j.start_time DESC, j.id",
            JOB_SELECT
        ))?;
        let rows = stmt.query_map(params![node], map_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ------------------------------------------------------------------
    // Spider groups
    // ------------------------------------------------------------------

    pub fn save_spider_group(&self, group: &SpiderGroup, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO spider_groups (name, node, project, version, spiders, args, description, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(name) DO UPDATE SET
                node = excluded.node, project = excluded.project, version = excluded.version,
                spiders = excluded.spiders, args = excluded.args,
                description = excluded.description, updated_at = excluded.updated_at",
            params![
                group.name,
                group.node,
                group.project,
                group.version,
                serde_json::to_string(&group.spiders)?,
                serde_json::to_string(&group.args)?,
                group.description,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn spider_groups(&self) -> Result<Vec<SpiderGroup>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT name, node, project, version, spiders, args, description FROM spider_groups ORDER BY name",
        )?;
        let rows = stmt.query_map([], map_group)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn spider_group(&self, name: &str) -> Result<Option<SpiderGroup>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT name, node, project, version, spiders, args, description FROM spider_groups WHERE name = ?1",
                params![name],
                map_group,
            )
            .optional()?)
    }

    pub fn delete_spider_group(&self, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM spider_groups WHERE name = ?1", params![name])? > 0)
    }
}

/// Mirrors created before `listed_at` existed get the column, seeded from
/// `updated_at`.
fn add_listed_at(conn: &Connection) -> Result<()> {
    let present = conn
        .prepare("SELECT 1 FROM pragma_table_info('projects') WHERE name = 'listed_at'")?
        .exists([])?;
    if !present {
        tracing::info!("adding listed_at to projects table");
        conn.execute_batch(
            "ALTER TABLE projects ADD COLUMN listed_at TEXT;
             UPDATE projects SET listed_at = updated_at;",
        )?;
    }
    Ok(())
}

fn insert_projects(conn: &Connection, rows: &[NewProject], now: DateTime<Utc>) -> Result<usize> {
    let mut insert = conn.prepare_cached(
        "INSERT OR IGNORE INTO projects
            (node, name, version, spiders_synced, stale, created_at, updated_at, listed_at)
         VALUES (?1, ?2, ?3, 0, 0, ?4, ?4, ?4)",
    )?;
    // SET expressions read the pre-update row, so the CASE sees the old flag.
    let mut touch = conn.prepare_cached(
        "UPDATE projects
         SET listed_at = ?4, updated_at = CASE stale WHEN 1 THEN ?4 ELSE updated_at END, stale = 0
         WHERE node = ?1 AND name = ?2 AND version = ?3",
    )?;

    let mut inserted = 0;
    for row in rows {
        inserted += insert.execute(params![row.node, row.name, row.version, now])?;
        touch.execute(params![row.node, row.name, row.version, now])?;
    }
    Ok(inserted)
}

fn stale_versions_except(
    conn: &Connection,
    node: &str,
    name: &str,
    keep: &[String],
    now: DateTime<Utc>,
) -> Result<usize> {
    let live: Vec<(i64, String)> = {
        let mut stmt = conn.prepare_cached(
            "SELECT id, version FROM projects WHERE node = ?1 AND name = ?2 AND stale = 0",
        )?;
        let rows = stmt.query_map(params![node, name], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut mark = conn.prepare_cached("UPDATE projects SET stale = 1, updated_at = ?2 WHERE id = ?1")?;
    let mut staled = 0;
    for (id, version) in live {
        if !keep.contains(&version) {
            tracing::info!(node, project = name, %version, "version no longer reported, marking stale");
            staled += mark.execute(params![id, now])?;
        }
    }
    Ok(staled)
}

fn live_project_names(conn: &Connection, node: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT name FROM projects WHERE node = ?1 AND stale = 0 ORDER BY name",
    )?;
    let rows = stmt.query_map(params![node], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
}

fn spiders_synced(conn: &Connection, project_id: i64) -> Result<Option<bool>> {
    Ok(conn
        .query_row(
            "SELECT spiders_synced FROM projects WHERE id = ?1",
            params![project_id],
            |row| row.get(0),
        )
        .optional()?)
}

fn job_by_id(conn: &Connection, id: i64) -> Result<Option<Job>> {
    Ok(conn
        .query_row(&format!("{} WHERE j.id = ?1", JOB_SELECT), params![id], map_job)
        .optional()?)
}

fn map_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        node: row.get(1)?,
        name: row.get(2)?,
        version: row.get(3)?,
        spiders_synced: row.get(4)?,
        stale: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        listed_at: row.get(8)?,
    })
}

fn map_spider(row: &Row<'_>) -> rusqlite::Result<Spider> {
    Ok(Spider {
        id: row.get(0)?,
        project_id: row.get(1)?,
        node: row.get(2)?,
        project: row.get(3)?,
        version: row.get(4)?,
        name: row.get(5)?,
    })
}

fn map_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(3)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(Job {
        id: row.get(0)?,
        node: row.get(1)?,
        job_id: row.get(2)?,
        status,
        start_time: row.get(4)?,
        end_time: row.get(5)?,
        pid: row.get(6)?,
        log_url: row.get(7)?,
        items_url: row.get(8)?,
        spider: Spider {
            id: row.get(9)?,
            project_id: row.get(10)?,
            node: row.get(11)?,
            project: row.get(12)?,
            version: row.get(13)?,
            name: row.get(14)?,
        },
    })
}

fn map_group(row: &Row<'_>) -> rusqlite::Result<SpiderGroup> {
    let spiders: String = row.get(4)?;
    let args: String = row.get(5)?;
    Ok(SpiderGroup {
        name: row.get(0)?,
        node: row.get(1)?,
        project: row.get(2)?,
        version: row.get(3)?,
        spiders: serde_json::from_str(&spiders)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        args: serde_json::from_str(&args)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        description: row.get(6)?,
    })
}
