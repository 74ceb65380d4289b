use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use cadforge_common::{Concept, DesignProject, GeneratedUnit, Part, PartBreakdown, UnitTarget};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::{
    DesignStore, PartOutcome, ProjectUpdate, apply_begin, apply_complete, apply_release,
    apply_settle,
};
use crate::errors::StoreError;

/// Async-safe handle to the design database.
///
/// All access runs on tokio's blocking pool; the mutex serializes writers,
/// which is what makes the part operations atomic.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<DesignDb>>,
}

impl DbHandle {
    pub fn new(db: DesignDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&DesignDb) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Database(anyhow::anyhow!("DB task panicked: {}", e)))?
    }
}

fn target_key(target: UnitTarget) -> String {
    match target {
        UnitTarget::OverallModel => "overall_model".to_string(),
        UnitTarget::Part { number } => format!("part:{}", number),
    }
}

pub struct DesignDb {
    conn: Connection,
}

impl DesignDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                status TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS concepts (
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                revision INTEGER NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (project_id, revision)
            );

            CREATE TABLE IF NOT EXISTS breakdowns (
                project_id TEXT PRIMARY KEY REFERENCES projects(id) ON DELETE CASCADE,
                revision INTEGER NOT NULL,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS units (
                unit_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                target TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS attempts (
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                target TEXT NOT NULL,
                last_attempt INTEGER NOT NULL,
                PRIMARY KEY (project_id, target)
            );

            CREATE INDEX IF NOT EXISTS idx_projects_created ON projects(created_at);
            CREATE INDEX IF NOT EXISTS idx_units_target ON units(project_id, target, attempt);
            ",
        )?;
        Ok(())
    }

    // ── Projects ─────────────────────────────────────────────────────────

    pub fn insert_project(&self, project: &DesignProject) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO projects (id, user_id, stage, status, body, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                project.id.to_string(),
                project.user_id,
                project.stage.as_str(),
                project.status.as_str(),
                serde_json::to_string(project)?,
                project.created_at.to_rfc3339(),
                project.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_project(&self, id: Uuid) -> Result<Option<DesignProject>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM projects WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    fn require_project(&self, id: Uuid) -> Result<DesignProject, StoreError> {
        self.get_project(id)?
            .ok_or(StoreError::ProjectNotFound { id })
    }

    fn write_project(&self, project: &DesignProject) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE projects SET stage = ?2, status = ?3, body = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                project.id.to_string(),
                project.stage.as_str(),
                project.status.as_str(),
                serde_json::to_string(project)?,
                project.updated_at.to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::ProjectNotFound { id: project.id });
        }
        Ok(())
    }

    pub fn list_projects(&self) -> Result<Vec<DesignProject>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT body FROM projects ORDER BY created_at DESC")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StoreError::from))
            .collect()
    }

    pub fn update_project(
        &self,
        id: Uuid,
        update: ProjectUpdate,
    ) -> Result<DesignProject, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut project = self.require_project(id)?;
        update(&mut project);
        self.write_project(&project)?;
        tx.commit()?;
        Ok(project)
    }

    // ── Concepts and breakdowns ──────────────────────────────────────────

    pub fn save_concept(&self, concept: &Concept) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO concepts (project_id, revision, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                concept.project_id.to_string(),
                concept.revision,
                serde_json::to_string(concept)?,
                concept.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn latest_concept(&self, project_id: Uuid) -> Result<Option<Concept>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM concepts WHERE project_id = ?1
                 ORDER BY revision DESC LIMIT 1",
                params![project_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    pub fn save_breakdown(&self, breakdown: &PartBreakdown) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO breakdowns (project_id, revision, body) VALUES (?1, ?2, ?3)",
            params![
                breakdown.project_id.to_string(),
                breakdown.revision,
                serde_json::to_string(breakdown)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_breakdown(&self, project_id: Uuid) -> Result<Option<PartBreakdown>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM breakdowns WHERE project_id = ?1",
                params![project_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    // ── Units ────────────────────────────────────────────────────────────

    /// Counter row per target, seeded from units recorded before it existed.
    pub fn reserve_attempt(
        &self,
        project_id: Uuid,
        target: UnitTarget,
    ) -> Result<u32, StoreError> {
        let number = self.conn.query_row(
            "INSERT INTO attempts (project_id, target, last_attempt)
             VALUES (?1, ?2, COALESCE(
                 (SELECT MAX(attempt) FROM units WHERE project_id = ?1 AND target = ?2), 0) + 1)
             ON CONFLICT (project_id, target) DO UPDATE SET last_attempt = last_attempt + 1
             RETURNING last_attempt",
            params![project_id.to_string(), target_key(target)],
            |row| row.get(0),
        )?;
        Ok(number)
    }

    pub fn record_unit(&self, unit: &GeneratedUnit) -> Result<(), StoreError> {
        let inserted = self.conn.execute(
            "INSERT INTO units
                 (unit_id, project_id, target, attempt, outcome, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (unit_id) DO NOTHING",
            params![
                unit.unit_id,
                unit.project_id.to_string(),
                target_key(unit.target),
                unit.attempt,
                unit.outcome.kind_str(),
                serde_json::to_string(unit)?,
                unit.created_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateUnit {
                unit_id: unit.unit_id.clone(),
            });
        }
        Ok(())
    }

    pub fn list_units(
        &self,
        project_id: Uuid,
        target: Option<UnitTarget>,
    ) -> Result<Vec<GeneratedUnit>, StoreError> {
        let bodies = match target {
            Some(target) => {
                let mut stmt = self.conn.prepare(
                    "SELECT body FROM units WHERE project_id = ?1 AND target = ?2
                     ORDER BY attempt, created_at",
                )?;
                let rows = stmt
                    .query_map(params![project_id.to_string(), target_key(target)], |row| {
                        row.get::<_, String>(0)
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT body FROM units WHERE project_id = ?1 ORDER BY attempt, created_at",
                )?;
                let rows = stmt
                    .query_map(params![project_id.to_string()], |row| {
                        row.get::<_, String>(0)
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StoreError::from))
            .collect()
    }

    pub fn get_unit(&self, unit_id: &str) -> Result<Option<GeneratedUnit>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM units WHERE unit_id = ?1",
                params![unit_id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    // ── Part counters ────────────────────────────────────────────────────

    fn part_records(
        &self,
        project_id: Uuid,
        part_number: u32,
    ) -> Result<(DesignProject, PartBreakdown), StoreError> {
        let project = self.require_project(project_id)?;
        let breakdown = self
            .get_breakdown(project_id)?
            .ok_or(StoreError::PartNotFound {
                project_id,
                part_number,
            })?;
        Ok((project, breakdown))
    }

    pub fn begin_part(&self, project_id: Uuid, part_number: u32) -> Result<Part, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let (mut project, mut breakdown) = self.part_records(project_id, part_number)?;
        let part = apply_begin(&mut project, &mut breakdown, part_number)?;
        self.save_breakdown(&breakdown)?;
        self.write_project(&project)?;
        tx.commit()?;
        Ok(part)
    }

    pub fn settle_part(
        &self,
        project_id: Uuid,
        part_number: u32,
        outcome: PartOutcome,
    ) -> Result<DesignProject, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let (mut project, mut breakdown) = self.part_records(project_id, part_number)?;
        apply_settle(&mut project, &mut breakdown, part_number, outcome)?;
        self.save_breakdown(&breakdown)?;
        self.write_project(&project)?;
        tx.commit()?;
        Ok(project)
    }

    pub fn release_part(
        &self,
        project_id: Uuid,
        part_number: u32,
        outcome: PartOutcome,
    ) -> Result<bool, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let (mut project, mut breakdown) = self.part_records(project_id, part_number)?;
        if !apply_release(&mut project, &mut breakdown, part_number, outcome)? {
            return Ok(false);
        }
        self.save_breakdown(&breakdown)?;
        self.write_project(&project)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn complete_if_settled(&self, project_id: Uuid) -> Result<bool, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut project = self.require_project(project_id)?;
        if !apply_complete(&mut project) {
            return Ok(false);
        }
        self.write_project(&project)?;
        tx.commit()?;
        Ok(true)
    }
}

/// Durable store backed by a single SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbHandle,
}

impl SqliteStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self {
            db: DbHandle::new(DesignDb::new(path)?),
        })
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self {
            db: DbHandle::new(DesignDb::new_in_memory()?),
        })
    }
}

#[async_trait]
impl DesignStore for SqliteStore {
    async fn insert_project(&self, project: &DesignProject) -> Result<(), StoreError> {
        let project = project.clone();
        self.db.call(move |db| db.insert_project(&project)).await
    }

    async fn load_project(&self, id: Uuid) -> Result<DesignProject, StoreError> {
        self.db.call(move |db| db.require_project(id)).await
    }

    async fn list_projects(&self) -> Result<Vec<DesignProject>, StoreError> {
        self.db.call(|db| db.list_projects()).await
    }

    async fn update_project(
        &self,
        id: Uuid,
        update: ProjectUpdate,
    ) -> Result<DesignProject, StoreError> {
        self.db.call(move |db| db.update_project(id, update)).await
    }

    async fn save_concept(&self, concept: &Concept) -> Result<(), StoreError> {
        let concept = concept.clone();
        self.db.call(move |db| db.save_concept(&concept)).await
    }

    async fn latest_concept(&self, project_id: Uuid) -> Result<Option<Concept>, StoreError> {
        self.db.call(move |db| db.latest_concept(project_id)).await
    }

    async fn save_breakdown(&self, breakdown: &PartBreakdown) -> Result<(), StoreError> {
        let breakdown = breakdown.clone();
        self.db.call(move |db| db.save_breakdown(&breakdown)).await
    }

    async fn load_breakdown(&self, project_id: Uuid) -> Result<Option<PartBreakdown>, StoreError> {
        self.db.call(move |db| db.get_breakdown(project_id)).await
    }

    async fn reserve_attempt(
        &self,
        project_id: Uuid,
        target: UnitTarget,
    ) -> Result<u32, StoreError> {
        self.db
            .call(move |db| db.reserve_attempt(project_id, target))
            .await
    }

    async fn record_unit(&self, unit: &GeneratedUnit) -> Result<(), StoreError> {
        let unit = unit.clone();
        self.db.call(move |db| db.record_unit(&unit)).await
    }

    async fn list_units(
        &self,
        project_id: Uuid,
        target: Option<UnitTarget>,
    ) -> Result<Vec<GeneratedUnit>, StoreError> {
        self.db
            .call(move |db| db.list_units(project_id, target))
            .await
    }

    async fn load_unit(&self, unit_id: &str) -> Result<Option<GeneratedUnit>, StoreError> {
        let unit_id = unit_id.to_string();
        self.db.call(move |db| db.get_unit(&unit_id)).await
    }

    async fn begin_part(&self, project_id: Uuid, part_number: u32) -> Result<Part, StoreError> {
        self.db
            .call(move |db| db.begin_part(project_id, part_number))
            .await
    }

    async fn settle_part(
        &self,
        project_id: Uuid,
        part_number: u32,
        outcome: PartOutcome,
    ) -> Result<DesignProject, StoreError> {
        self.db
            .call(move |db| db.settle_part(project_id, part_number, outcome))
            .await
    }

    async fn release_part(
        &self,
        project_id: Uuid,
        part_number: u32,
        outcome: PartOutcome,
    ) -> Result<bool, StoreError> {
        self.db
            .call(move |db| db.release_part(project_id, part_number, outcome))
            .await
    }

    async fn complete_if_settled(&self, project_id: Uuid) -> Result<bool, StoreError> {
        self.db
            .call(move |db| db.complete_if_settled(project_id))
            .await
    }
}
