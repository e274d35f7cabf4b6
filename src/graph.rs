//! Knowledge graph domain types.
//!
//! These shapes double as MCP tool arguments and results, so they carry
//! serde camelCase renaming and JSON schemas. Entity names are the only
//! externally visible identifiers; storage-level surrogate ids never
//! appear here.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A named, typed node in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Unique, case-sensitive entity name.
    pub name: String,
    /// Free-text category label.
    pub entity_type: String,
    /// Free-text observations attached to this entity, oldest first.
    #[serde(default)]
    pub observations: Vec<String>,
}

/// A directed, typed edge between two entities, addressed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub from: String,
    pub to: String,
    pub relation_type: String,
}

/// A full or filtered view of the graph.
///
/// Entities are ordered by name, relations by (from, to).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KnowledgeGraph {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

/// Observations to append to one existing entity.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservationInput {
    pub entity_name: String,
    pub contents: Vec<String>,
}

/// Per-entity outcome of `add_observations`: the contents that were
/// actually inserted (already-present strings are omitted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservationResult {
    pub entity_name: String,
    pub added_observations: Vec<String>,
}

/// Observation strings to remove from one entity.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservationDeletion {
    pub entity_name: String,
    pub observations: Vec<String>,
}
