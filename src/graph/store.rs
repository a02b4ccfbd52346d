//! SQLite graph store primitives.
//!
//! Everything here is synchronous and takes a `&Connection` so callers can run
//! several primitives inside one transaction (a `Transaction` derefs to a
//! `Connection`). Async callers go through `Db::with_connection`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, SwgraphError};
use crate::graph::EntityKind;

/// Scalar attributes of a hydrated entity, ordered by field name.
pub type Attributes = BTreeMap<String, Value>;

/// Hydration state of an entity. `Failed` is an unhydrated entity excluded from selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntityStatus {
    Unhydrated,
    Hydrated,
    Failed,
}

impl EntityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityStatus::Unhydrated => "unhydrated",
            EntityStatus::Hydrated => "hydrated",
            EntityStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityStatus {
    type Err = SwgraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unhydrated" => Ok(EntityStatus::Unhydrated),
            "hydrated" => Ok(EntityStatus::Hydrated),
            "failed" => Ok(EntityStatus::Failed),
            other => Err(SwgraphError::InvalidInput(format!("unknown entity status: {}", other))),
        }
    }
}

/// Identity of an entity: natural key scoped by kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub key: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, key: impl Into<String>) -> Self {
        Self { kind, key: key.into() }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.key)
    }
}

/// An unhydrated entity selected for fetching. `kind` is the raw stored name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntity {
    pub id: i64,
    pub key: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub id: i64,
    pub key: String,
    pub kind: EntityKind,
    pub status: EntityStatus,
    pub attributes: Option<Attributes>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
}

impl StoredEntity {
    pub fn is_hydrated(&self) -> bool {
        self.status == EntityStatus::Hydrated
    }
}

/// Entity left in the failed state, for the end-of-pass summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedEntity {
    pub key: String,
    pub kind: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// A typed edge as seen from one of its endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub rel_type: String,
    pub other: EntityRef,
}

/// Entity counts per (kind, status) and relationship counts per type.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStats {
    pub entities: Vec<(String, String, i64)>,
    pub relationships: Vec<(String, i64)>,
}

impl GraphStats {
    pub fn total_entities(&self) -> i64 {
        self.entities.iter().map(|(_, _, n)| n).sum()
    }

    pub fn count_with_status(&self, status: EntityStatus) -> i64 {
        self.entities
            .iter()
            .filter(|(_, s, _)| s == status.as_str())
            .map(|(_, _, n)| n)
            .sum()
    }

    pub fn total_relationships(&self) -> i64 {
        self.relationships.iter().map(|(_, n)| n).sum()
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Canonical form of a natural key: trimmed, without trailing slashes.
///
/// Returns `None` for keys that are blank after trimming.
pub fn canonical_key(raw: &str) -> Option<String> {
    let key = raw.trim().trim_end_matches('/');
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

fn entity_id(conn: &Connection, kind: EntityKind, key: &str) -> Result<i64> {
    let id = conn.query_row(
        "SELECT id FROM entities WHERE kind = ?1 AND entity_key = ?2",
        params![kind.as_str(), key],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Create or hydrate an entity with its full attribute set.
///
/// Write-if-different: a hydrated entity whose stored attributes equal
/// `attributes` is left untouched. Returns the entity id and whether a row
/// was inserted or updated.
pub fn upsert_entity(
    conn: &Connection,
    kind: EntityKind,
    key: &str,
    attributes: &Attributes,
) -> Result<(i64, bool)> {
    let attributes_json = serde_json::to_string(attributes)
        .map_err(|e| SwgraphError::InvalidInput(format!("attributes for {}: {}", key, e)))?;
    let ts = now();

    let changed = conn.execute(
        r#"
        INSERT INTO entities (entity_key, kind, status, attributes_json, discovered_at, hydrated_at)
        VALUES (?1, ?2, 'hydrated', ?3, ?4, ?4)
        ON CONFLICT(kind, entity_key) DO UPDATE SET
            status = 'hydrated',
            attributes_json = excluded.attributes_json,
            hydrated_at = COALESCE(entities.hydrated_at, excluded.hydrated_at),
            claimed_by = NULL,
            claimed_at = NULL,
            last_error = NULL
        WHERE entities.status != 'hydrated'
           OR entities.attributes_json IS NOT excluded.attributes_json
        "#,
        params![key, kind.as_str(), attributes_json, ts],
    )?;

    Ok((entity_id(conn, kind, key)?, changed > 0))
}

/// Create a placeholder for `key` if no entity of that kind exists yet.
///
/// Document kinds start unhydrated. Tag kinds have nothing to fetch and are
/// created hydrated with their value as `name`. Existing entities are never
/// modified, so a hydrated entity can't be demoted. Returns the id and
/// whether the entity was created.
pub fn ensure_stub(conn: &Connection, kind: EntityKind, key: &str) -> Result<(i64, bool)> {
    let ts = now();
    let created = if kind.is_tag() {
        let mut attributes = Attributes::new();
        attributes.insert(kind.key_field().to_string(), Value::String(key.to_string()));
        let attributes_json = serde_json::to_string(&attributes)
            .map_err(|e| SwgraphError::InvalidInput(format!("tag {}: {}", key, e)))?;
        conn.execute(
            "INSERT INTO entities (entity_key, kind, status, attributes_json, discovered_at, hydrated_at) \
             VALUES (?1, ?2, 'hydrated', ?3, ?4, ?4) \
             ON CONFLICT(kind, entity_key) DO NOTHING",
            params![key, kind.as_str(), attributes_json, ts],
        )?
    } else {
        conn.execute(
            "INSERT INTO entities (entity_key, kind, status, discovered_at) \
             VALUES (?1, ?2, 'unhydrated', ?3) \
             ON CONFLICT(kind, entity_key) DO NOTHING",
            params![key, kind.as_str(), ts],
        )?
    };

    Ok((entity_id(conn, kind, key)?, created > 0))
}

/// Idempotent edge creation. Returns whether the edge is new.
pub fn ensure_relationship(conn: &Connection, source_id: i64, rel_type: &str, target_id: i64) -> Result<bool> {
    let created = conn.execute(
        "INSERT INTO relationships (source_id, rel_type, target_id, created_at) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(source_id, rel_type, target_id) DO NOTHING",
        params![source_id, rel_type, target_id, now()],
    )?;
    Ok(created > 0)
}

/// Oldest-discovered unhydrated entity that no worker has claimed.
pub fn find_one_unhydrated(conn: &Connection) -> Result<Option<PendingEntity>> {
    let pending = conn
        .query_row(
            "SELECT id, entity_key, kind FROM entities \
             WHERE status = 'unhydrated' AND claimed_by IS NULL \
             ORDER BY id LIMIT 1",
            [],
            |row| {
                Ok(PendingEntity {
                    id: row.get(0)?,
                    key: row.get(1)?,
                    kind: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(pending)
}

/// Select and claim the next unhydrated entity for `worker` atomically.
///
/// Runs as an IMMEDIATE transaction so concurrent workers serialize on the
/// write lock and never claim the same entity.
pub fn claim_next_unhydrated(conn: &mut Connection, worker: &str) -> Result<Option<PendingEntity>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let pending = find_one_unhydrated(&tx)?;
    if let Some(p) = &pending {
        tx.execute(
            "UPDATE entities SET claimed_by = ?1, claimed_at = ?2 WHERE id = ?3",
            params![worker, now(), p.id],
        )?;
    }
    tx.commit()?;
    Ok(pending)
}

/// Unhydrated entities currently claimed by some worker.
pub fn count_in_flight(conn: &Connection) -> Result<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM entities WHERE status = 'unhydrated' AND claimed_by IS NOT NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(n)
}

pub fn count_with_status(conn: &Connection, status: EntityStatus) -> Result<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM entities WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )?;
    Ok(n)
}

pub fn release_claim(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE entities SET claimed_by = NULL, claimed_at = NULL WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}

/// Drop every claim. Called at drain start: claims from an interrupted run are stale.
pub fn release_all_claims(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "UPDATE entities SET claimed_by = NULL, claimed_at = NULL WHERE claimed_by IS NOT NULL",
        [],
    )?;
    Ok(n)
}

/// Move an unhydrated entity to `failed`, or record another failed attempt on
/// an entity that is already failed. Hydrated entities are never touched.
pub fn mark_failed(conn: &Connection, id: i64, error: &str, attempts: u32) -> Result<bool> {
    let n = conn.execute(
        "UPDATE entities SET status = 'failed', last_error = ?1, attempts = attempts + ?2, \
             claimed_by = NULL, claimed_at = NULL \
         WHERE id = ?3 AND status IN ('unhydrated', 'failed')",
        params![error, attempts, id],
    )?;
    Ok(n > 0)
}

/// Make every failed entity selectable again. Attempt history is kept.
pub fn reset_failed(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "UPDATE entities SET status = 'unhydrated', claimed_by = NULL, claimed_at = NULL \
         WHERE status = 'failed'",
        [],
    )?;
    Ok(n)
}

pub fn list_failed(conn: &Connection) -> Result<Vec<FailedEntity>> {
    let mut stmt = conn.prepare(
        "SELECT entity_key, kind, attempts, last_error FROM entities WHERE status = 'failed' ORDER BY id",
    )?;
    let failed = stmt
        .query_map([], |row| {
            Ok(FailedEntity {
                key: row.get(0)?,
                kind: row.get(1)?,
                attempts: row.get(2)?,
                last_error: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(failed)
}

pub fn get_entity(conn: &Connection, kind: EntityKind, key: &str) -> Result<Option<StoredEntity>> {
    let row = conn
        .query_row(
            "SELECT id, entity_key, status, attributes_json, attempts, last_error, claimed_by \
             FROM entities WHERE kind = ?1 AND entity_key = ?2",
            params![kind.as_str(), key],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((id, key, status, attributes_json, attempts, last_error, claimed_by)) = row else {
        return Ok(None);
    };
    let attributes = attributes_json
        .map(|json| serde_json::from_str::<Attributes>(&json))
        .transpose()
        .map_err(|e| SwgraphError::InvalidInput(format!("stored attributes for {}: {}", key, e)))?;

    Ok(Some(StoredEntity {
        id,
        key,
        kind,
        status: status.parse()?,
        attributes,
        attempts,
        last_error,
        claimed_by,
    }))
}

fn edges(conn: &Connection, sql: &str, entity: &EntityRef) -> Result<Vec<Edge>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![entity.kind.as_str(), entity.key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

    rows.into_iter()
        .map(|(rel_type, kind, key)| {
            Ok(Edge {
                rel_type,
                other: EntityRef::new(kind.parse()?, key),
            })
        })
        .collect()
}

/// Edges leaving `entity`, ordered by type then target discovery order.
pub fn relationships_from(conn: &Connection, entity: &EntityRef) -> Result<Vec<Edge>> {
    edges(
        conn,
        "SELECT r.rel_type, t.kind, t.entity_key FROM relationships r \
         JOIN entities s ON s.id = r.source_id \
         JOIN entities t ON t.id = r.target_id \
         WHERE s.kind = ?1 AND s.entity_key = ?2 \
         ORDER BY r.rel_type, t.id",
        entity,
    )
}

/// Edges arriving at `entity`, ordered by type then source discovery order.
pub fn relationships_to(conn: &Connection, entity: &EntityRef) -> Result<Vec<Edge>> {
    edges(
        conn,
        "SELECT r.rel_type, s.kind, s.entity_key FROM relationships r \
         JOIN entities s ON s.id = r.source_id \
         JOIN entities t ON t.id = r.target_id \
         WHERE t.kind = ?1 AND t.entity_key = ?2 \
         ORDER BY r.rel_type, s.id",
        entity,
    )
}

pub fn graph_stats(conn: &Connection) -> Result<GraphStats> {
    let mut stmt = conn.prepare(
        "SELECT kind, status, COUNT(*) FROM entities GROUP BY kind, status ORDER BY kind, status",
    )?;
    let entities: Vec<(String, String, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

    let mut stmt = conn.prepare(
        "SELECT rel_type, COUNT(*) FROM relationships GROUP BY rel_type ORDER BY rel_type",
    )?;
    let relationships: Vec<(String, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

    Ok(GraphStats { entities, relationships })
}
