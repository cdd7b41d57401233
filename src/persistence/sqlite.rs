//! SQLite persistence
//!
//! Everything is stored as JSON documents in a single table keyed by
//! `(kind, id)`, with the scope and a timestamp broken out for queries.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::{Persistence, Result};
use crate::analyzer::SituationalModel;
use crate::decider::Decision;
use crate::error::PersistenceError;
use crate::learner::LearnedWeights;
use crate::models::ScopeId;
use crate::twin::DigitalTwin;

const KIND_TWIN: &str = "twin";
const KIND_DECISION: &str = "decision";
const KIND_MODEL: &str = "model";
const KIND_WEIGHTS: &str = "weights";

pub struct SqlitePersistence {
    db: Mutex<Connection>,
}

impl SqlitePersistence {
    /// Open or create the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PersistenceError::Storage(format!("creating {}: {}", parent.display(), e)))?;
        }
        let db = Connection::open(path)?;

        // WAL keeps checkpoints from blocking readers
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(&db)?;

        info!(path = %path.display(), "SQLite persistence opened");
        Ok(Self { db: Mutex::new(db) })
    }

    fn init(db: &Connection) -> Result<()> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                scope TEXT,
                ts INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (kind, id)
            );
            CREATE INDEX IF NOT EXISTS documents_scope ON documents (kind, scope, ts);",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| PersistenceError::Storage("connection lock poisoned".to_string()))
    }

    fn load_kind<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>> {
        let db = self.conn()?;
        let mut stmt = db.prepare_cached("SELECT data FROM documents WHERE kind = ?1 ORDER BY ts, id")?;
        let rows = stmt.query_map([kind], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }
}

fn upsert<T: Serialize>(
    tx: &rusqlite::Transaction<'_>,
    kind: &str,
    id: &str,
    scope: Option<&str>,
    ts: i64,
    doc: &T,
) -> Result<()> {
    let data = serde_json::to_string(doc)?;
    tx.execute(
        "INSERT INTO documents (kind, id, scope, ts, data) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(kind, id) DO UPDATE SET scope = ?3, ts = ?4, data = ?5",
        params![kind, id, scope, ts, data],
    )?;
    Ok(())
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn save_twins(&self, twins: &[DigitalTwin]) -> Result<()> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM documents WHERE kind = ?1", [KIND_TWIN])?;
        for twin in twins {
            let ts = twin
                .last_sync_timestamp
                .map(|t| t.timestamp_millis())
                .unwrap_or(0);
            upsert(&tx, KIND_TWIN, &twin.id, Some(twin.scope.as_str()), ts, twin)?;
        }
        tx.commit()?;
        debug!(count = twins.len(), "Twins saved");
        Ok(())
    }

    async fn load_twins(&self) -> Result<Vec<DigitalTwin>> {
        let mut twins: Vec<DigitalTwin> = self.load_kind(KIND_TWIN)?;
        twins.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(twins)
    }

    async fn save_decisions(&self, decisions: &[Decision]) -> Result<()> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        for decision in decisions {
            upsert(
                &tx,
                KIND_DECISION,
                &decision.id,
                Some(decision.scope.as_str()),
                decision.created_at.timestamp_millis(),
                decision,
            )?;
        }
        tx.commit()?;
        debug!(count = decisions.len(), "Decisions saved");
        Ok(())
    }

    async fn load_decisions(&self) -> Result<Vec<Decision>> {
        self.load_kind(KIND_DECISION)
    }

    async fn last_decision(&self, scope: &ScopeId) -> Result<Option<Decision>> {
        let db = self.conn()?;
        let data: Option<String> = db
            .query_row(
                "SELECT data FROM documents WHERE kind = ?1 AND scope = ?2 ORDER BY ts DESC LIMIT 1",
                params![KIND_DECISION, scope.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn save_models(&self, models: &[SituationalModel]) -> Result<()> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        for model in models {
            let ts = model.emotion().updated_at.timestamp_millis();
            upsert(&tx, KIND_MODEL, model.scope.as_str(), Some(model.scope.as_str()), ts, model)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn load_models(&self) -> Result<Vec<SituationalModel>> {
        self.load_kind(KIND_MODEL)
    }

    async fn save_weights(&self, weights: &LearnedWeights) -> Result<()> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        upsert(&tx, KIND_WEIGHTS, "learned", None, chrono::Utc::now().timestamp_millis(), weights)?;
        tx.commit()?;
        Ok(())
    }

    async fn load_weights(&self) -> Result<Option<LearnedWeights>> {
        Ok(self.load_kind(KIND_WEIGHTS)?.into_iter().next())
    }
}
