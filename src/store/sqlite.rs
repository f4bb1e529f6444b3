//! SQLite store: WAL-mode database with JSON body columns.
//!
//! Typed records are stored whole as JSON; only the columns needed for
//! lookup, scoping, and ordering are broken out.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};

use crate::core::errors::{Result, TsimError};
use crate::core::ids::{FuzzRunId, ScenarioId};
use crate::fuzz::run::FuzzRun;
use crate::isolation::guard::Scope;
use crate::scenario::model::{RunFailure, Scenario, ScenarioState, ScenarioSummary, Snapshot};
use crate::store::{SimulationStore, claim_error, scope_key};

/// Durable [`SimulationStore`]. The connection is serialized behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| TsimError::io(parent, source))?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check that WAL mode is active (for diagnostics).
    pub fn is_wal_mode(&self) -> bool {
        self.conn
            .lock()
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .map(|mode| mode.eq_ignore_ascii_case("wal"))
            .unwrap_or(false)
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    Ok(serde_json::from_str(body)?)
}

fn not_found(id: &ScenarioId) -> TsimError {
    TsimError::NotFound {
        kind: "scenario",
        id: id.to_string(),
    }
}

impl SimulationStore for SqliteStore {
    fn insert_scenario(&self, scenario: &Scenario) -> Result<()> {
        let body = serde_json::to_string(scenario)?;
        let conn = self.conn.lock();
        let exists: bool = conn
            .prepare_cached("SELECT 1 FROM scenarios WHERE id = ?1")?
            .exists(params![scenario.id.as_str()])?;
        if exists {
            return Err(TsimError::Duplicate {
                kind: "scenario",
                id: scenario.id.to_string(),
            });
        }
        conn.prepare_cached(
            "INSERT INTO scenarios (id, scope, state, body) VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![
            scenario.id.as_str(),
            scope_key(&scenario.scope),
            scenario.state.as_str(),
            body,
        ])?;
        Ok(())
    }

    fn scenario(&self, id: &ScenarioId) -> Result<Option<Scenario>> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .prepare_cached("SELECT body FROM scenarios WHERE id = ?1")?
            .query_row(params![id.as_str()], |row| row.get(0))
            .optional()?;
        body.as_deref().map(decode).transpose()
    }

    fn claim_run(&self, id: &ScenarioId) -> Result<Scenario> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let body: Option<String> = tx
            .query_row(
                "SELECT body FROM scenarios WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let mut scenario: Scenario = decode(&body.ok_or_else(|| not_found(id))?)?;
        if let Some(err) = claim_error(&scenario) {
            return Err(err);
        }
        scenario.state = ScenarioState::Running;
        scenario.failure = None;
        let claimed = tx.execute(
            "UPDATE scenarios SET state = ?2, body = ?3 WHERE id = ?1 AND state = ?4",
            params![
                id.as_str(),
                ScenarioState::Running.as_str(),
                serde_json::to_string(&scenario)?,
                ScenarioState::Draft.as_str(),
            ],
        )?;
        if claimed == 0 {
            return Err(TsimError::RunInProgress {
                scenario_id: id.to_string(),
            });
        }
        tx.commit()?;
        Ok(scenario)
    }

    fn set_state(
        &self,
        id: &ScenarioId,
        state: ScenarioState,
        failure: Option<&RunFailure>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let body: Option<String> = tx
            .query_row(
                "SELECT body FROM scenarios WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let mut scenario: Scenario = decode(&body.ok_or_else(|| not_found(id))?)?;
        scenario.state = state;
        scenario.failure = failure.cloned();
        tx.execute(
            "UPDATE scenarios SET state = ?2, body = ?3 WHERE id = ?1",
            params![id.as_str(), state.as_str(), serde_json::to_string(&scenario)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn append_snapshot(&self, id: &ScenarioId, snapshot: &Snapshot) -> Result<()> {
        let body = serde_json::to_string(snapshot)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists = tx
            .prepare_cached("SELECT 1 FROM scenarios WHERE id = ?1")?
            .exists(params![id.as_str()])?;
        if !exists {
            return Err(not_found(id));
        }
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE scenario_id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        let expected = usize::try_from(count).unwrap_or(usize::MAX);
        if snapshot.index != expected {
            return Err(TsimError::AppendOutOfOrder {
                scenario_id: id.to_string(),
                expected,
                got: snapshot.index,
            });
        }
        tx.execute(
            "INSERT INTO snapshots (scenario_id, idx, body) VALUES (?1, ?2, ?3)",
            params![id.as_str(), count, body],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn snapshots(&self, id: &ScenarioId) -> Result<Vec<Snapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT body FROM snapshots WHERE scenario_id = ?1 ORDER BY idx ASC")?;
        let bodies = stmt
            .query_map(params![id.as_str()], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies.iter().map(|body| decode(body)).collect()
    }

    fn snapshot_count(&self, id: &ScenarioId) -> Result<usize> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM snapshots WHERE scenario_id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn list_scenarios(&self, scope: &Scope) -> Result<Vec<ScenarioSummary>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT body FROM scenarios WHERE scope = ?1 ORDER BY seq ASC")?;
        let bodies = stmt
            .query_map(params![scope_key(scope)], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|body| decode::<Scenario>(body).map(|s| s.summary()))
            .collect()
    }

    fn delete_scenario(&self, id: &ScenarioId) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let state: Option<String> = tx
            .query_row(
                "SELECT state FROM scenarios WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if state.as_deref() == Some(ScenarioState::Running.as_str()) {
            return Err(TsimError::RunInProgress {
                scenario_id: id.to_string(),
            });
        }
        tx.execute(
            "DELETE FROM snapshots WHERE scenario_id = ?1",
            params![id.as_str()],
        )?;
        let deleted = tx.execute("DELETE FROM scenarios WHERE id = ?1", params![id.as_str()])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    fn insert_fuzz_run(&self, run: &FuzzRun) -> Result<()> {
        let body = serde_json::to_string(run)?;
        let conn = self.conn.lock();
        let exists = conn
            .prepare_cached("SELECT 1 FROM fuzz_runs WHERE id = ?1")?
            .exists(params![run.id.as_str()])?;
        if exists {
            return Err(TsimError::Duplicate {
                kind: "fuzz run",
                id: run.id.to_string(),
            });
        }
        conn.prepare_cached(
            "INSERT INTO fuzz_runs (id, scope, scenario_id, passed, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?
        .execute(params![
            run.id.as_str(),
            scope_key(&run.scope),
            run.scenario_id.as_str(),
            run.passed,
            body,
        ])?;
        Ok(())
    }

    fn fuzz_run(&self, id: &FuzzRunId) -> Result<Option<FuzzRun>> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .prepare_cached("SELECT body FROM fuzz_runs WHERE id = ?1")?
            .query_row(params![id.as_str()], |row| row.get(0))
            .optional()?;
        body.as_deref().map(decode).transpose()
    }

    fn list_fuzz_runs(&self, scope: &Scope, limit: usize) -> Result<Vec<FuzzRun>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT body FROM fuzz_runs WHERE scope = ?1 ORDER BY seq DESC LIMIT ?2",
        )?;
        let bodies = stmt
            .query_map(params![scope_key(scope), limit], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies.iter().map(|body| decode(body)).collect()
    }
}

// ──────────────────── schema & pragmas ────────────────────

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        eprintln!("[TSIM-SQLITE] WARNING: requested WAL mode but got '{mode}'");
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS scenarios (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            scope TEXT NOT NULL,
            state TEXT NOT NULL,
            body TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            scenario_id TEXT NOT NULL REFERENCES scenarios(id) ON DELETE CASCADE,
            idx INTEGER NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (scenario_id, idx)
        );

        CREATE TABLE IF NOT EXISTS fuzz_runs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            scope TEXT NOT NULL,
            scenario_id TEXT NOT NULL,
            passed INTEGER NOT NULL,
            body TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_scenarios_scope ON scenarios(scope, seq);
        CREATE INDEX IF NOT EXISTS idx_fuzz_runs_scope ON fuzz_runs(scope, seq);",
    )?;
    Ok(())
}
