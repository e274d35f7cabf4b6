//! SQLite storage backend for the knowledge graph.
//!
//! [`Database`] owns a bounded connection pool and implements the nine
//! graph operations. Every mutation runs as one transaction per call:
//! items are applied in input order and a failure rolls the whole batch
//! back (the transaction is dropped un-committed on any error path).
//! Entities, observations, and relations live in three normalized
//! tables; surrogate ids stay internal and all views are rendered by
//! entity name.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::graph::{
    Entity, KnowledgeGraph, ObservationDeletion, ObservationInput, ObservationResult, Relation,
};

// Validation constants
const MAX_NAME_LENGTH: usize = 256;
const MAX_TYPE_LENGTH: usize = 128;
const MAX_OBSERVATION_LENGTH: usize = 4096;

const POOL_MAX_SIZE: u32 = 15;
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection customizer to set PRAGMAs and register SQL functions on
/// every new connection
#[derive(Debug)]
struct SqliteCustomizer;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for SqliteCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // SQLite's built-in lower() folds ASCII only; this folds the
        // full Unicode range so search stays case-insensitive for
        // non-ASCII names too.
        conn.create_scalar_function(
            "lower_fold",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let text = ctx.get::<String>(0)?;
                Ok(text.to_lowercase())
            },
        )?;
        Ok(())
    }
}

fn validate_name(name: &str, field: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::InvalidInput(format!("{field} cannot be empty")));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(StoreError::InvalidInput(format!(
            "{field} too long (max {MAX_NAME_LENGTH} chars)"
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(StoreError::InvalidInput(format!(
            "{field} contains control characters"
        )));
    }
    Ok(())
}

fn validate_label(label: &str, field: &str) -> Result<(), StoreError> {
    if label.is_empty() {
        return Err(StoreError::InvalidInput(format!("{field} cannot be empty")));
    }
    if label.len() > MAX_TYPE_LENGTH {
        return Err(StoreError::InvalidInput(format!(
            "{field} too long (max {MAX_TYPE_LENGTH} chars)"
        )));
    }
    if label.contains('\0') {
        return Err(StoreError::InvalidInput(format!(
            "{field} contains null bytes"
        )));
    }
    Ok(())
}

fn validate_observation(obs: &str) -> Result<(), StoreError> {
    if obs.len() > MAX_OBSERVATION_LENGTH {
        return Err(StoreError::InvalidInput(format!(
            "observation too long (max {MAX_OBSERVATION_LENGTH} chars)"
        )));
    }
    if obs.contains('\0') {
        return Err(StoreError::InvalidInput(
            "observation contains null bytes".to_string(),
        ));
    }
    Ok(())
}

fn build_placeholders(count: usize, offset: usize) -> String {
    (offset..offset + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Quotes every whitespace-separated term so user input cannot inject
/// FTS5 query syntax or trigger a syntax error.
fn sanitize_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| {
            let stripped = term.trim_matches('"');
            let escaped = stripped.replace('"', "\"\"");
            format!("\"{}\"", escaped)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_db_path(path: &Path) -> Result<(), StoreError> {
    match path.extension() {
        Some(ext) if ext == "db" => Ok(()),
        _ => Err(StoreError::InvalidInput(
            "database path must have .db extension".to_string(),
        )),
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    entity_type TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
) STRICT;

CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE(entity_id, content)
) STRICT;

CREATE TABLE IF NOT EXISTS relations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    to_entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    relation_type TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE(from_entity_id, to_entity_id, relation_type)
) STRICT;

CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type);
CREATE INDEX IF NOT EXISTS idx_observations_entity ON observations(entity_id);
CREATE INDEX IF NOT EXISTS idx_relations_from ON relations(from_entity_id);
CREATE INDEX IF NOT EXISTS idx_relations_to ON relations(to_entity_id);
CREATE INDEX IF NOT EXISTS idx_relations_type ON relations(relation_type);

CREATE TRIGGER IF NOT EXISTS entities_touch
AFTER UPDATE ON entities
WHEN new.updated_at = old.updated_at
BEGIN
    UPDATE entities SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
    WHERE id = new.id;
END;

CREATE VIRTUAL TABLE IF NOT EXISTS entities_fts USING fts5(
    name, content='entities', content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS entities_ai AFTER INSERT ON entities BEGIN
    INSERT INTO entities_fts(rowid, name) VALUES (new.id, new.name);
END;

CREATE TRIGGER IF NOT EXISTS entities_ad AFTER DELETE ON entities BEGIN
    INSERT INTO entities_fts(entities_fts, rowid, name)
    VALUES ('delete', old.id, old.name);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
    content, content='observations', content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS observations_ai AFTER INSERT ON observations BEGIN
    INSERT INTO observations_fts(rowid, content) VALUES (new.id, new.content);
END;

CREATE TRIGGER IF NOT EXISTS observations_ad AFTER DELETE ON observations BEGIN
    INSERT INTO observations_fts(observations_fts, rowid, content)
    VALUES ('delete', old.id, old.content);
END;
"#;

/// The knowledge graph store: a bounded SQLite connection pool plus the
/// nine operations the MCP tool layer dispatches to.
#[derive(Clone, Debug)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Opens (or creates) the database at `path` and applies the schema.
    ///
    /// Schema creation is idempotent, so opening an already-initialized
    /// database is safe.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        validate_db_path(path)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::InvalidInput(format!(
                        "cannot create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(POOL_MAX_SIZE)
            .connection_timeout(POOL_ACQUIRE_TIMEOUT)
            .connection_customizer(Box::new(SqliteCustomizer))
            .build(manager)?;

        {
            let conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            conn.execute_batch(SCHEMA)?;
        }

        Ok(Self { pool })
    }

    /// Creates the entities whose names are not yet taken, together with
    /// their observations. Items whose name already exists are silently
    /// skipped -- never merged or updated. Returns the created subset in
    /// input order.
    pub fn create_entities(&self, entities: &[Entity]) -> Result<Vec<Entity>, StoreError> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        for entity in entities {
            validate_name(&entity.name, "entity name")?;
            validate_label(&entity.entity_type, "entity type")?;
            for obs in &entity.observations {
                validate_observation(obs)?;
            }
        }

        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        let mut created = Vec::new();

        {
            let mut insert_entity = tx.prepare_cached(
                "INSERT OR IGNORE INTO entities (name, entity_type) VALUES (?1, ?2)",
            )?;
            let mut insert_obs = tx.prepare_cached(
                "INSERT OR IGNORE INTO observations (entity_id, content) VALUES (?1, ?2)",
            )?;

            for entity in entities {
                let rows = insert_entity.execute(params![&entity.name, &entity.entity_type])?;
                if rows == 0 {
                    debug!(name = %entity.name, "entity exists, skipping");
                    continue;
                }
                let entity_id = tx.last_insert_rowid();
                for obs in &entity.observations {
                    insert_obs.execute(params![entity_id, obs])?;
                }
                created.push(entity.clone());
            }
        }

        tx.commit()?;
        Ok(created)
    }

    /// Creates the relations whose endpoints resolve and whose triple is
    /// not already stored. A missing endpoint is a soft skip; a
    /// duplicate triple is an idempotent skip. Returns the created
    /// subset in input order.
    pub fn create_relations(&self, relations: &[Relation]) -> Result<Vec<Relation>, StoreError> {
        if relations.is_empty() {
            return Ok(Vec::new());
        }

        for rel in relations {
            validate_name(&rel.from, "from entity")?;
            validate_name(&rel.to, "to entity")?;
            validate_label(&rel.relation_type, "relation type")?;
        }

        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        let mut created = Vec::new();

        {
            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO relations (from_entity_id, to_entity_id, relation_type)
                 VALUES (?1, ?2, ?3)",
            )?;

            for rel in relations {
                let Some(from_id) = entity_id_by_name(&tx, &rel.from)? else {
                    warn!(from = %rel.from, to = %rel.to, "relation endpoint missing, skipping");
                    continue;
                };
                let Some(to_id) = entity_id_by_name(&tx, &rel.to)? else {
                    warn!(from = %rel.from, to = %rel.to, "relation endpoint missing, skipping");
                    continue;
                };
                let rows = insert.execute(params![from_id, to_id, &rel.relation_type])?;
                if rows > 0 {
                    created.push(rel.clone());
                }
            }
        }

        tx.commit()?;
        Ok(created)
    }

    /// Appends observations to existing entities, returning per item the
    /// contents actually inserted (already-present strings are omitted).
    ///
    /// Unlike the create operations, an unknown entity name here is a
    /// hard error that rolls back the entire batch.
    pub fn add_observations(
        &self,
        inputs: &[ObservationInput],
    ) -> Result<Vec<ObservationResult>, StoreError> {
        for input in inputs {
            validate_name(&input.entity_name, "entity name")?;
            for obs in &input.contents {
                validate_observation(obs)?;
            }
        }

        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        let mut results = Vec::new();

        {
            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO observations (entity_id, content) VALUES (?1, ?2)",
            )?;

            for input in inputs {
                let Some(entity_id) = entity_id_by_name(&tx, &input.entity_name)? else {
                    // Dropping the transaction rolls back everything
                    // inserted for earlier items in this batch.
                    return Err(StoreError::EntityNotFound(input.entity_name.clone()));
                };

                let mut added = Vec::new();
                for content in &input.contents {
                    let rows = insert.execute(params![entity_id, content])?;
                    if rows > 0 {
                        added.push(content.clone());
                    }
                }

                results.push(ObservationResult {
                    entity_name: input.entity_name.clone(),
                    added_observations: added,
                });
            }
        }

        tx.commit()?;
        Ok(results)
    }

    /// Deletes the named entities together with their observations and
    /// every relation they participate in. Unknown names are silent
    /// no-ops.
    pub fn delete_entities(&self, names: &[String]) -> Result<(), StoreError> {
        if names.is_empty() {
            return Ok(());
        }

        for name in names {
            validate_name(name, "entity name")?;
        }

        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        let mut deleted = 0usize;

        // Children first so the FTS delete triggers see every removed row.
        for name in names {
            let Some(id) = entity_id_by_name(&tx, name)? else {
                continue;
            };
            tx.execute(
                "DELETE FROM relations WHERE from_entity_id = ?1 OR to_entity_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM observations WHERE entity_id = ?1", params![id])?;
            deleted += tx.execute("DELETE FROM entities WHERE id = ?1", params![id])?;
        }

        tx.commit()?;
        debug!(deleted, "entities deleted");
        Ok(())
    }

    /// Deletes the listed observation strings from their entities.
    /// Unknown entities and non-matching content strings are silently
    /// ignored.
    pub fn delete_observations(&self, deletions: &[ObservationDeletion]) -> Result<(), StoreError> {
        if deletions.is_empty() {
            return Ok(());
        }

        for deletion in deletions {
            validate_name(&deletion.entity_name, "entity name")?;
        }

        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        let mut deleted = 0usize;

        {
            let mut delete = tx.prepare_cached(
                "DELETE FROM observations WHERE entity_id = ?1 AND content = ?2",
            )?;

            for deletion in deletions {
                let Some(entity_id) = entity_id_by_name(&tx, &deletion.entity_name)? else {
                    continue;
                };
                for content in &deletion.observations {
                    deleted += delete.execute(params![entity_id, content])?;
                }
            }
        }

        tx.commit()?;
        debug!(deleted, "observations deleted");
        Ok(())
    }

    /// Deletes the listed relation triples. Unresolved endpoints and
    /// missing triples are silent no-ops.
    pub fn delete_relations(&self, relations: &[Relation]) -> Result<(), StoreError> {
        if relations.is_empty() {
            return Ok(());
        }

        for rel in relations {
            validate_name(&rel.from, "from entity")?;
            validate_name(&rel.to, "to entity")?;
            validate_label(&rel.relation_type, "relation type")?;
        }

        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        let mut deleted = 0usize;

        {
            let mut delete = tx.prepare_cached(
                "DELETE FROM relations
                 WHERE from_entity_id = ?1 AND to_entity_id = ?2 AND relation_type = ?3",
            )?;

            for rel in relations {
                let Some(from_id) = entity_id_by_name(&tx, &rel.from)? else {
                    continue;
                };
                let Some(to_id) = entity_id_by_name(&tx, &rel.to)? else {
                    continue;
                };
                deleted += delete.execute(params![from_id, to_id, &rel.relation_type])?;
            }
        }

        tx.commit()?;
        debug!(deleted, "relations deleted");
        Ok(())
    }

    /// Returns the full graph: every entity with its observations
    /// (oldest first) and every relation, rendered by entity name.
    pub fn read_graph(&self) -> Result<KnowledgeGraph, StoreError> {
        let conn = self.pool.get()?;
        let (mut entities, ids) = collect_entities(
            &conn,
            "SELECT id, name, entity_type FROM entities ORDER BY name",
            &[],
        )?;
        attach_observations(&conn, &mut entities, &ids)?;
        let relations = relations_between(&conn, &ids)?;
        Ok(KnowledgeGraph {
            entities,
            relations,
        })
    }

    /// Returns the subgraph of entities matching `query`: a
    /// case-insensitive substring of the name, the entity type, or any
    /// owned observation, or a full-text match on name or observation
    /// content. Any match condition wins; results are unranked. The
    /// relations returned are the induced subgraph (both endpoints
    /// matched). A blank query matches nothing.
    pub fn search_nodes(&self, query: &str) -> Result<KnowledgeGraph, StoreError> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Ok(KnowledgeGraph::default());
        }

        let conn = self.pool.get()?;
        let needle = trimmed.to_lowercase();
        let fts_query = sanitize_fts5_query(trimmed);

        let (mut entities, ids) = collect_entities(
            &conn,
            "SELECT e.id, e.name, e.entity_type FROM entities e
             WHERE instr(lower_fold(e.name), ?1) > 0
                OR instr(lower_fold(e.entity_type), ?1) > 0
                OR EXISTS (
                    SELECT 1 FROM observations o
                    WHERE o.entity_id = e.id AND instr(lower_fold(o.content), ?1) > 0)
                OR e.id IN (SELECT rowid FROM entities_fts WHERE entities_fts MATCH ?2)
                OR e.id IN (
                    SELECT o.entity_id FROM observations o
                    JOIN observations_fts f ON f.rowid = o.id
                    WHERE observations_fts MATCH ?2)
             ORDER BY e.name",
            &[&needle as &dyn rusqlite::ToSql, &fts_query],
        )?;
        attach_observations(&conn, &mut entities, &ids)?;
        let relations = relations_between(&conn, &ids)?;
        Ok(KnowledgeGraph {
            entities,
            relations,
        })
    }

    /// Returns the subgraph of exactly the named entities (unknown names
    /// are silently dropped) and the relations between them. An empty
    /// input returns an empty graph without touching the pool.
    pub fn open_nodes(&self, names: &[String]) -> Result<KnowledgeGraph, StoreError> {
        if names.is_empty() {
            return Ok(KnowledgeGraph::default());
        }

        for name in names {
            validate_name(name, "entity name")?;
        }

        let conn = self.pool.get()?;
        let placeholders = build_placeholders(names.len(), 1);
        let sql = format!(
            "SELECT id, name, entity_type FROM entities WHERE name IN ({}) ORDER BY name",
            placeholders
        );
        let name_params: Vec<&dyn rusqlite::ToSql> =
            names.iter().map(|n| n as &dyn rusqlite::ToSql).collect();

        let (mut entities, ids) = collect_entities(&conn, &sql, name_params.as_slice())?;
        attach_observations(&conn, &mut entities, &ids)?;
        let relations = relations_between(&conn, &ids)?;
        Ok(KnowledgeGraph {
            entities,
            relations,
        })
    }
}

/// Resolves an entity name to its surrogate id.
fn entity_id_by_name(conn: &Connection, name: &str) -> Result<Option<i64>, StoreError> {
    let id = conn
        .query_row(
            "SELECT id FROM entities WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Runs an entity query returning `(id, name, entity_type)` rows and
/// produces entities (observations still empty) plus their ids, in the
/// query's order.
fn collect_entities(
    conn: &Connection,
    sql: &str,
    sql_params: &[&dyn rusqlite::ToSql],
) -> Result<(Vec<Entity>, Vec<i64>), StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(sql_params, |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut entities = Vec::new();
    let mut ids = Vec::new();
    for row in rows {
        let (id, name, entity_type) = row?;
        ids.push(id);
        entities.push(Entity {
            name,
            entity_type,
            observations: Vec::new(),
        });
    }
    Ok((entities, ids))
}

/// Fills in each entity's observations, oldest first. `ids` must be
/// parallel to `entities`.
fn attach_observations(
    conn: &Connection,
    entities: &mut [Entity],
    ids: &[i64],
) -> Result<(), StoreError> {
    if ids.is_empty() {
        return Ok(());
    }

    let index: HashMap<i64, usize> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let placeholders = build_placeholders(ids.len(), 1);
    let sql = format!(
        "SELECT entity_id, content FROM observations
         WHERE entity_id IN ({}) ORDER BY created_at, id",
        placeholders
    );
    let id_params: Vec<&dyn rusqlite::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(id_params.as_slice(), |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    for row in rows {
        let (entity_id, content) = row?;
        if let Some(&i) = index.get(&entity_id) {
            entities[i].observations.push(content);
        }
    }
    Ok(())
}

/// Returns the relations whose both endpoints lie in `ids` (the induced
/// subgraph), rendered by name and ordered by (from, to).
fn relations_between(conn: &Connection, ids: &[i64]) -> Result<Vec<Relation>, StoreError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders_from = build_placeholders(ids.len(), 1);
    let placeholders_to = build_placeholders(ids.len(), ids.len() + 1);
    let sql = format!(
        "SELECT ef.name, et.name, r.relation_type FROM relations r
         JOIN entities ef ON ef.id = r.from_entity_id
         JOIN entities et ON et.id = r.to_entity_id
         WHERE r.from_entity_id IN ({}) AND r.to_entity_id IN ({})
         ORDER BY ef.name, et.name",
        placeholders_from, placeholders_to
    );

    let mut id_params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(ids.len() * 2);
    for id in ids {
        id_params.push(id);
    }
    for id in ids {
        id_params.push(id);
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(id_params.as_slice(), |row| {
        Ok(Relation {
            from: row.get(0)?,
            to: row.get(1)?,
            relation_type: row.get(2)?,
        })
    })?;

    let mut relations = Vec::new();
    for row in rows {
        relations.push(row?);
    }
    Ok(relations)
}
