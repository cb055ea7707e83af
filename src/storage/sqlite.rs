//! SQLite storage backend

use super::traits::{CommitOutcome, GraphStats, GraphStore, OpenStore, StorageError, StorageResult};
use crate::graph::merge::{merge_entity, merge_relationship};
use crate::graph::{
    ChunkCommit, ChunkId, Entity, EntityId, EntityType, MergePolicy, Relationship, RelationshipId,
    RelationshipType,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const ENTITY_COLUMNS: &str = "id, entity_type, name, canonical_key, description, properties_json, \
     confidence, source_collection, source_chunk_ids_json, created_at, updated_at";

const RELATIONSHIP_COLUMNS: &str = "id, source_id, target_id, relationship_type, properties_json, \
     confidence, source_collection, source_chunk_ids_json, created_at, updated_at";

/// SQLite-backed graph store
///
/// Single database file holding entities, relationships, the per-collection
/// chunk ledger, daily usage counters and run locks. Thread-safe via an
/// internal mutex on the connection, which also serializes chunk commits
/// that touch the same entity.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// Raw entity columns, converted after the row borrow ends
struct EntityRow {
    id: String,
    entity_type: String,
    name: String,
    canonical_key: String,
    description: Option<String>,
    properties_json: String,
    confidence: f64,
    source_collection: String,
    chunks_json: String,
    created_at: String,
    updated_at: String,
}

impl EntityRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            name: row.get(2)?,
            canonical_key: row.get(3)?,
            description: row.get(4)?,
            properties_json: row.get(5)?,
            confidence: row.get(6)?,
            source_collection: row.get(7)?,
            chunks_json: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_entity(self) -> StorageResult<Entity> {
        Ok(Entity {
            id: EntityId::parse(&self.id).map_err(|_| StorageError::InvalidId(self.id.clone()))?,
            entity_type: EntityType::parse(&self.entity_type),
            name: self.name,
            canonical_key: self.canonical_key,
            description: self.description,
            properties: serde_json::from_str(&self.properties_json)?,
            confidence: self.confidence,
            source_collection: self.source_collection,
            source_chunk_ids: serde_json::from_str::<BTreeSet<String>>(&self.chunks_json)?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

/// Raw relationship columns
struct RelationshipRow {
    id: String,
    source_id: String,
    target_id: String,
    relationship_type: String,
    properties_json: String,
    confidence: f64,
    source_collection: String,
    chunks_json: String,
    created_at: String,
    updated_at: String,
}

impl RelationshipRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_id: row.get(1)?,
            target_id: row.get(2)?,
            relationship_type: row.get(3)?,
            properties_json: row.get(4)?,
            confidence: row.get(5)?,
            source_collection: row.get(6)?,
            chunks_json: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_relationship(self) -> StorageResult<Relationship> {
        let parse_entity =
            |s: &str| EntityId::parse(s).map_err(|_| StorageError::InvalidId(s.to_string()));
        Ok(Relationship {
            id: RelationshipId::parse(&self.id).map_err(|_| StorageError::InvalidId(self.id.clone()))?,
            source: parse_entity(&self.source_id)?,
            target: parse_entity(&self.target_id)?,
            relationship_type: RelationshipType::parse(&self.relationship_type),
            properties: serde_json::from_str(&self.properties_json)?,
            confidence: self.confidence,
            source_collection: self.source_collection,
            source_chunk_ids: serde_json::from_str::<BTreeSet<String>>(&self.chunks_json)?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

fn parse_time(s: &str) -> StorageResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| StorageError::DateParse(e.to_string()))?
        .with_timezone(&Utc))
}

impl SqliteStore {
    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- WAL so queries can read while a run is committing chunks
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                name TEXT NOT NULL,
                canonical_key TEXT NOT NULL,
                description TEXT,
                properties_json TEXT NOT NULL,
                confidence REAL NOT NULL,
                source_collection TEXT NOT NULL,
                source_chunk_ids_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(name);
            CREATE INDEX IF NOT EXISTS idx_entities_key ON entities(canonical_key);
            CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type);

            CREATE TABLE IF NOT EXISTS relationships (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                relationship_type TEXT NOT NULL,
                properties_json TEXT NOT NULL,
                confidence REAL NOT NULL,
                source_collection TEXT NOT NULL,
                source_chunk_ids_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (source_id) REFERENCES entities(id) ON DELETE CASCADE,
                FOREIGN KEY (target_id) REFERENCES entities(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_id);
            CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_id);
            CREATE INDEX IF NOT EXISTS idx_relationships_type ON relationships(relationship_type);

            -- Processed-set: one row per committed (collection, chunk)
            CREATE TABLE IF NOT EXISTS chunk_ledger (
                collection TEXT NOT NULL,
                chunk_id TEXT NOT NULL,
                entities INTEGER NOT NULL,
                relationships INTEGER NOT NULL,
                committed_at TEXT NOT NULL,
                PRIMARY KEY (collection, chunk_id)
            ) WITHOUT ROWID;

            CREATE TABLE IF NOT EXISTS daily_usage (
                pipeline TEXT NOT NULL,
                day TEXT NOT NULL,
                chunks INTEGER NOT NULL,
                PRIMARY KEY (pipeline, day)
            );

            CREATE TABLE IF NOT EXISTS run_locks (
                pipeline TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn select_entity(conn: &Connection, id: &EntityId) -> StorageResult<Option<Entity>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS),
                params![id.to_string()],
                EntityRow::read,
            )
            .optional()?;
        row.map(EntityRow::into_entity).transpose()
    }

    fn select_entities(conn: &Connection, column: &str, value: &str) -> StorageResult<Vec<Entity>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM entities WHERE {} = ?1 ORDER BY confidence DESC, id",
            ENTITY_COLUMNS, column
        ))?;
        let rows = stmt
            .query_map(params![value], EntityRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    /// Stored entity an untyped endpoint should merge into: the most confident
    /// typed entity with the same canonical key
    fn bind_untyped(conn: &Connection, incoming: &Entity) -> StorageResult<EntityId> {
        let bound = Self::select_entities(conn, "canonical_key", &incoming.canonical_key)?
            .into_iter()
            .find(|stored| !matches!(&stored.entity_type, EntityType::Other(label) if label == "unknown"));
        Ok(bound.map(|stored| stored.id).unwrap_or(incoming.id))
    }

    /// Point a relationship at rebound endpoints, re-deriving its id
    fn rebind<'a>(rel: &'a Relationship, rebound: &HashMap<EntityId, EntityId>) -> Cow<'a, Relationship> {
        if !rebound.contains_key(&rel.source) && !rebound.contains_key(&rel.target) {
            return Cow::Borrowed(rel);
        }
        let mut rel = rel.clone();
        if let Some(id) = rebound.get(&rel.source) {
            rel.source = *id;
        }
        if let Some(id) = rebound.get(&rel.target) {
            rel.target = *id;
        }
        rel.id = RelationshipId::derive(&rel.source, &rel.relationship_type, &rel.target);
        Cow::Owned(rel)
    }

    fn entity_exists(conn: &Connection, id: &EntityId) -> StorageResult<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM entities WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn write_entity(conn: &Connection, entity: &Entity) -> StorageResult<()> {
        conn.execute(
            r#"
            INSERT INTO entities (id, entity_type, name, canonical_key, description, properties_json,
                                  confidence, source_collection, source_chunk_ids_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                description = excluded.description,
                properties_json = excluded.properties_json,
                confidence = excluded.confidence,
                source_collection = excluded.source_collection,
                source_chunk_ids_json = excluded.source_chunk_ids_json,
                updated_at = excluded.updated_at
            "#,
            params![
                entity.id.to_string(),
                entity.entity_type.as_str(),
                entity.name,
                entity.canonical_key,
                entity.description,
                serde_json::to_string(&entity.properties)?,
                entity.confidence,
                entity.source_collection,
                serde_json::to_string(&entity.source_chunk_ids)?,
                entity.created_at.to_rfc3339(),
                entity.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn select_relationship(conn: &Connection, id: &RelationshipId) -> StorageResult<Option<Relationship>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM relationships WHERE id = ?1", RELATIONSHIP_COLUMNS),
                params![id.to_string()],
                RelationshipRow::read,
            )
            .optional()?;
        row.map(RelationshipRow::into_relationship).transpose()
    }

    fn select_relationships(conn: &Connection, column: &str, value: &str) -> StorageResult<Vec<Relationship>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM relationships WHERE {} = ?1 ORDER BY id",
            RELATIONSHIP_COLUMNS, column
        ))?;
        let rows = stmt
            .query_map(params![value], RelationshipRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RelationshipRow::into_relationship).collect()
    }

    fn write_relationship(conn: &Connection, rel: &Relationship) -> StorageResult<()> {
        conn.execute(
            r#"
            INSERT INTO relationships (id, source_id, target_id, relationship_type, properties_json,
                                       confidence, source_collection, source_chunk_ids_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                properties_json = excluded.properties_json,
                confidence = excluded.confidence,
                source_collection = excluded.source_collection,
                source_chunk_ids_json = excluded.source_chunk_ids_json,
                updated_at = excluded.updated_at
            "#,
            params![
                rel.id.to_string(),
                rel.source.to_string(),
                rel.target.to_string(),
                rel.relationship_type.as_str(),
                serde_json::to_string(&rel.properties)?,
                rel.confidence,
                rel.source_collection,
                serde_json::to_string(&rel.source_chunk_ids)?,
                rel.created_at.to_rfc3339(),
                rel.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn count_by(conn: &Connection, sql: &str) -> StorageResult<Vec<(String, usize)>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|(k, n)| (k, n as usize)).collect())
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl GraphStore for SqliteStore {
    // === Merge/Upsert ===

    fn commit_chunk(&self, commit: &ChunkCommit, policy: &MergePolicy) -> StorageResult<CommitOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut outcome = CommitOutcome::default();

        // Entities first so every relationship below has both endpoints
        let mut rebound = HashMap::new();
        for incoming in &commit.entities {
            let id = if commit.untyped.contains(&incoming.id) {
                Self::bind_untyped(&tx, incoming)?
            } else {
                incoming.id
            };
            if id != incoming.id {
                tracing::debug!(name = %incoming.name, bound_to = %id, "Binding untyped endpoint");
                rebound.insert(incoming.id, id);
            }
            match Self::select_entity(&tx, &id)? {
                Some(mut stored) => {
                    merge_entity(&mut stored, incoming, policy);
                    Self::write_entity(&tx, &stored)?;
                    outcome.entities_merged += 1;
                }
                None => {
                    Self::write_entity(&tx, incoming)?;
                    outcome.entities_created += 1;
                }
            }
        }

        for original in &commit.relationships {
            let incoming = Self::rebind(original, &rebound);
            if incoming.source == incoming.target {
                continue;
            }
            for endpoint in [&incoming.source, &incoming.target] {
                if !Self::entity_exists(&tx, endpoint)? {
                    // Dropping `tx` rolls back this chunk only
                    return Err(StorageError::MissingEndpoint {
                        relationship: incoming.id.to_string(),
                        entity: endpoint.to_string(),
                    });
                }
            }
            match Self::select_relationship(&tx, &incoming.id)? {
                Some(mut stored) => {
                    merge_relationship(&mut stored, &incoming, policy);
                    Self::write_relationship(&tx, &stored)?;
                    outcome.relationships_merged += 1;
                }
                None => {
                    Self::write_relationship(&tx, &incoming)?;
                    outcome.relationships_created += 1;
                }
            }
        }

        tx.execute(
            r#"
            INSERT INTO chunk_ledger (collection, chunk_id, entities, relationships, committed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(collection, chunk_id) DO NOTHING
            "#,
            params![
                commit.collection,
                commit.chunk_id,
                commit.entities.len() as i64,
                commit.relationships.len() as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok(outcome)
    }

    // === Processed-set tracking ===

    fn processed_chunk_ids(&self, collection: &str) -> StorageResult<HashSet<ChunkId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT chunk_id FROM chunk_ledger WHERE collection = ?1")?;
        let ids = stmt
            .query_map(params![collection], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    fn is_chunk_processed(&self, collection: &str, chunk_id: &str) -> StorageResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM chunk_ledger WHERE collection = ?1 AND chunk_id = ?2",
                params![collection, chunk_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // === Entity Operations ===

    fn load_entity(&self, id: &EntityId) -> StorageResult<Option<Entity>> {
        let conn = self.conn()?;
        Self::select_entity(&conn, id)
    }

    fn find_entities_by_name(&self, name: &str) -> StorageResult<Vec<Entity>> {
        let conn = self.conn()?;
        Self::select_entities(&conn, "name", name)
    }

    fn find_entities_by_key(&self, canonical_key: &str) -> StorageResult<Vec<Entity>> {
        let conn = self.conn()?;
        Self::select_entities(&conn, "canonical_key", canonical_key)
    }

    fn delete_entity(&self, id: &EntityId) -> StorageResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM relationships WHERE source_id = ?1 OR target_id = ?1",
            params![id.to_string()],
        )?;
        let rows = tx.execute("DELETE FROM entities WHERE id = ?1", params![id.to_string()])?;

        tx.commit()?;
        Ok(rows > 0)
    }

    // === Relationship Operations ===

    fn load_relationship(&self, id: &RelationshipId) -> StorageResult<Option<Relationship>> {
        let conn = self.conn()?;
        Self::select_relationship(&conn, id)
    }

    fn relationships_from(&self, id: &EntityId) -> StorageResult<Vec<Relationship>> {
        let conn = self.conn()?;
        Self::select_relationships(&conn, "source_id", &id.to_string())
    }

    fn relationships_to(&self, id: &EntityId) -> StorageResult<Vec<Relationship>> {
        let conn = self.conn()?;
        Self::select_relationships(&conn, "target_id", &id.to_string())
    }

    // === Run bookkeeping ===

    fn usage_on(&self, pipeline: &str, day: NaiveDate) -> StorageResult<u64> {
        let conn = self.conn()?;
        let chunks: Option<i64> = conn
            .query_row(
                "SELECT chunks FROM daily_usage WHERE pipeline = ?1 AND day = ?2",
                params![pipeline, day.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(chunks.unwrap_or(0).max(0) as u64)
    }

    fn record_usage(&self, pipeline: &str, day: NaiveDate, chunks: u64) -> StorageResult<u64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            r#"
            INSERT INTO daily_usage (pipeline, day, chunks) VALUES (?1, ?2, ?3)
            ON CONFLICT(pipeline, day) DO UPDATE SET chunks = chunks + excluded.chunks
            "#,
            params![pipeline, day.to_string(), chunks as i64],
        )?;
        let total: i64 = tx.query_row(
            "SELECT chunks FROM daily_usage WHERE pipeline = ?1 AND day = ?2",
            params![pipeline, day.to_string()],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(total.max(0) as u64)
    }

    fn acquire_run_lock(&self, pipeline: &str, holder: &str, ttl: Duration) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT holder, acquired_at FROM run_locks WHERE pipeline = ?1",
                params![pipeline],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((current, acquired_at)) = existing {
            if current != holder {
                let age = Utc::now().signed_duration_since(parse_time(&acquired_at)?);
                let stale = chrono::Duration::from_std(ttl)
                    .map(|ttl| age >= ttl)
                    .unwrap_or(false);
                if !stale {
                    return Err(StorageError::LockHeld {
                        pipeline: pipeline.to_string(),
                        holder: current,
                    });
                }
                tracing::warn!(
                    pipeline,
                    stale_holder = %current,
                    "Taking over stale run lock"
                );
            }
        }

        tx.execute(
            r#"
            INSERT INTO run_locks (pipeline, holder, acquired_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(pipeline) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at
            "#,
            params![pipeline, holder, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn release_run_lock(&self, pipeline: &str, holder: &str) -> StorageResult<bool> {
        let conn = self.conn()?;
        let rows = conn.execute(
            "DELETE FROM run_locks WHERE pipeline = ?1 AND holder = ?2",
            params![pipeline, holder],
        )?;
        Ok(rows > 0)
    }

    // === Diagnostics ===

    fn stats(&self) -> StorageResult<GraphStats> {
        let conn = self.conn()?;
        let entities: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
        let relationships: i64 =
            conn.query_row("SELECT COUNT(*) FROM relationships", [], |row| row.get(0))?;

        Ok(GraphStats {
            entities: entities as usize,
            relationships: relationships as usize,
            entities_by_type: Self::count_by(
                &conn,
                "SELECT entity_type, COUNT(*) FROM entities GROUP BY entity_type",
            )?
            .into_iter()
            .collect(),
            relationships_by_type: Self::count_by(
                &conn,
                "SELECT relationship_type, COUNT(*) FROM relationships GROUP BY relationship_type",
            )?
            .into_iter()
            .collect(),
            processed_chunks: Self::count_by(
                &conn,
                "SELECT collection, COUNT(*) FROM chunk_ledger GROUP BY collection",
            )?
            .into_iter()
            .collect(),
        })
    }

    fn ping(&self) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}
