//! Property graph built from the source API.
//!
//! `schema` describes the entity kinds and their fields, `store` holds the
//! SQLite primitives (entities double as the crawl work queue), and `upsert`
//! merges fetched documents into the store.

pub mod schema;
pub mod store;
pub mod upsert;

pub use schema::{fields_of, Cardinality, Direction, EntityKind, FieldSpec, RefSpec, ScalarType};
pub use store::{
    Attributes, Edge, EntityRef, EntityStatus, FailedEntity, GraphStats, PendingEntity, StoredEntity,
};
pub use upsert::{
    as_document, plan_upsert, upsert_document, upsert_document_named, Document, UpsertOutcome,
    UpsertPlan,
};
