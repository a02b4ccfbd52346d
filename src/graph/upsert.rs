//! Schema-driven merge of a fetched document into the graph.
//!
//! One routine serves every kind: the document is first turned into an
//! [`UpsertPlan`] (pure, no store access), then the plan is applied inside a
//! single transaction. Applying a plan hydrates the entity and creates a stub
//! plus a typed edge for every referenced key, which is how new crawl work is
//! discovered.

use std::collections::HashSet;

use rusqlite::{Connection, TransactionBehavior};
use serde_json::{Map, Number, Value};

use crate::db::Db;
use crate::error::{Result, SwgraphError};
use crate::graph::schema::{fields_of, Cardinality, Direction, FieldSpec, ScalarType};
use crate::graph::store::{self, canonical_key, Attributes, EntityRef};
use crate::graph::EntityKind;

/// A fetched document: flat mapping from field name to JSON value.
pub type Document = Map<String, Value>;

/// One edge the plan will assert, with its endpoint stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedReference {
    pub field: &'static str,
    pub rel_type: &'static str,
    pub direction: Direction,
    pub target: EntityRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertPlan {
    pub entity: EntityRef,
    pub attributes: Attributes,
    pub references: Vec<PlannedReference>,
}

/// What an upsert changed in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub entity: EntityRef,
    /// The entity row was inserted or its attributes/status changed.
    pub changed: bool,
    /// Newly created placeholder or tag entities.
    pub stubs_created: usize,
    pub relationships_created: usize,
}

impl UpsertOutcome {
    /// True when the upsert left the store exactly as it was.
    pub fn is_noop(&self) -> bool {
        !self.changed && self.stubs_created == 0 && self.relationships_created == 0
    }
}

/// Turn a JSON value into a document, rejecting anything that isn't an object.
pub fn as_document(value: Value) -> Result<Document> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(SwgraphError::MalformedDocument(format!(
            "expected a JSON object, got {}",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn canonical_key_for(kind: EntityKind, raw: &str) -> Option<String> {
    if kind.is_tag() {
        let value = raw.trim();
        (!value.is_empty()).then(|| value.to_string())
    } else {
        canonical_key(raw)
    }
}

/// Resolve the entity's natural key from its key field.
pub fn resolve_key(kind: EntityKind, document: &Document) -> Result<String> {
    let field = kind.key_field();
    match document.get(field) {
        Some(Value::String(raw)) => canonical_key_for(kind, raw).ok_or_else(|| {
            SwgraphError::MalformedDocument(format!("{} document has a blank '{}'", kind, field))
        }),
        Some(other) => Err(SwgraphError::MalformedDocument(format!(
            "{} document has a non-string '{}' ({})",
            kind,
            field,
            json_type(other)
        ))),
        None => Err(SwgraphError::MalformedDocument(format!(
            "{} document is missing its key field '{}'",
            kind, field
        ))),
    }
}

/// Split a comma-joined tag string into trimmed, non-blank values.
pub fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_numeric(raw: &str) -> Option<String> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Store numeric strings of numeric fields as numbers; keep everything else as given.
fn coerce_scalar(ty: ScalarType, value: &Value) -> Value {
    let Value::String(raw) = value else {
        return value.clone();
    };
    let coerced = match ty {
        ScalarType::Integer => parse_numeric(raw)
            .and_then(|s| s.parse::<i64>().ok())
            .map(Value::from),
        ScalarType::Number => parse_numeric(raw)
            .and_then(|s| s.parse::<f64>().ok())
            .and_then(Number::from_f64)
            .map(Value::Number),
        ScalarType::Text | ScalarType::Date => None,
    };
    coerced.unwrap_or_else(|| value.clone())
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

/// Keys referenced by one field, canonicalized and de-duplicated in document order.
fn reference_keys(kind: EntityKind, spec: &FieldSpec, value: &Value) -> Result<Vec<String>> {
    let Some(target) = spec.target_kind() else {
        return Ok(Vec::new());
    };
    let is_tags = matches!(spec.cardinality, Cardinality::Tags(_));

    let raw: Vec<&str> = match value {
        Value::Null => Vec::new(),
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items
            .iter()
            .filter(|item| !item.is_null())
            .map(|item| {
                item.as_str().ok_or_else(|| {
                    SwgraphError::MalformedDocument(format!(
                        "{}.{} contains a {} where a key was expected",
                        kind,
                        spec.name,
                        json_type(item)
                    ))
                })
            })
            .collect::<Result<_>>()?,
        other => {
            return Err(SwgraphError::MalformedDocument(format!(
                "{}.{} must be a key or list of keys, got {}",
                kind,
                spec.name,
                json_type(other)
            )))
        }
    };

    let candidates: Vec<String> = if is_tags {
        raw.into_iter().flat_map(split_tags).collect()
    } else {
        raw.into_iter().filter_map(|r| canonical_key_for(target, r)).collect()
    };

    let mut seen = HashSet::new();
    Ok(candidates.into_iter().filter(|k| seen.insert(k.clone())).collect())
}

/// Build the merge plan for a document without touching the store.
pub fn plan_upsert(kind: EntityKind, document: &Document) -> Result<UpsertPlan> {
    let key = resolve_key(kind, document)?;
    let fields = fields_of(kind);

    let mut attributes = Attributes::new();
    if kind.is_tag() {
        attributes.insert(kind.key_field().to_string(), Value::String(key.clone()));
    }

    for (name, value) in document {
        if name == kind.key_field() || value.is_null() {
            continue;
        }
        match fields.iter().find(|f| f.name == name).map(|f| f.cardinality) {
            Some(Cardinality::Scalar(ty)) => {
                if !is_scalar(value) {
                    return Err(SwgraphError::MalformedDocument(format!(
                        "{}.{} must be a scalar, got {}",
                        kind,
                        name,
                        json_type(value)
                    )));
                }
                attributes.insert(name.clone(), coerce_scalar(ty, value));
            }
            Some(_) => {}
            None if is_scalar(value) => {
                attributes.insert(name.clone(), value.clone());
            }
            None => {
                log::debug!("Skipping non-scalar field {}.{} ({})", kind, name, json_type(value));
            }
        }
    }

    let mut references = Vec::new();
    for spec in fields {
        let Some(reference) = spec.reference() else {
            continue;
        };
        let Some(value) = document.get(spec.name) else {
            continue;
        };
        for target_key in reference_keys(kind, spec, value)? {
            references.push(PlannedReference {
                field: spec.name,
                rel_type: reference.rel_type,
                direction: reference.direction,
                target: EntityRef::new(reference.target, target_key),
            });
        }
    }

    Ok(UpsertPlan {
        entity: EntityRef::new(kind, key),
        attributes,
        references,
    })
}

/// Apply a plan with the store primitives. The caller owns the transaction.
pub fn apply_plan(conn: &Connection, plan: &UpsertPlan) -> Result<UpsertOutcome> {
    let (entity_id, changed) =
        store::upsert_entity(conn, plan.entity.kind, &plan.entity.key, &plan.attributes)?;

    let mut stubs_created = 0;
    let mut relationships_created = 0;
    for reference in &plan.references {
        let (target_id, created) = store::ensure_stub(conn, reference.target.kind, &reference.target.key)?;
        if created {
            stubs_created += 1;
        }
        let (source, target) = match reference.direction {
            Direction::Outgoing => (entity_id, target_id),
            Direction::Incoming => (target_id, entity_id),
        };
        if store::ensure_relationship(conn, source, reference.rel_type, target)? {
            relationships_created += 1;
        }
    }

    Ok(UpsertOutcome {
        entity: plan.entity.clone(),
        changed,
        stubs_created,
        relationships_created,
    })
}

/// Plan and apply a document in one IMMEDIATE transaction.
pub fn upsert_in_tx(conn: &mut Connection, kind: EntityKind, document: &Document) -> Result<UpsertOutcome> {
    let plan = plan_upsert(kind, document)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let outcome = apply_plan(&tx, &plan)?;
    tx.commit()?;
    Ok(outcome)
}

/// Upsert a fetched document of a known kind.
pub async fn upsert_document(db: &Db, kind: EntityKind, document: Document) -> Result<UpsertOutcome> {
    let outcome = db
        .with_connection(move |conn| upsert_in_tx(conn, kind, &document))
        .await?;
    log::debug!(
        "Upserted {} (changed: {}, new stubs: {}, new relationships: {})",
        outcome.entity,
        outcome.changed,
        outcome.stubs_created,
        outcome.relationships_created
    );
    Ok(outcome)
}

/// Upsert with the kind given by name, as stored on a pending entity.
///
/// Fails with `UnknownKind` when the name has no schema entry.
pub async fn upsert_document_named(db: &Db, kind: &str, document: Document) -> Result<UpsertOutcome> {
    let kind: EntityKind = kind.parse()?;
    upsert_document(db, kind, document).await
}
