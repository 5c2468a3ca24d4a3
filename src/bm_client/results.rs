//! Strict result shapes returned by the typed façade.
//!
//! Each operation deserializes the structured payload into one of these types
//! through [`validate`]; any missing or mistyped field becomes an
//! `InvalidResponse` naming the operation. Optional fields are only those the
//! remote may legitimately omit.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::BmError;

/// Deserialize `payload` into `T`, naming `operation` on failure.
pub fn validate<T: DeserializeOwned>(operation: &str, payload: Value) -> Result<T, BmError> {
    if !payload.is_object() {
        return Err(BmError::invalid_response(
            operation,
            format!("expected an object payload, got {}", value_kind(&payload)),
        ));
    }
    serde_json::from_value(payload).map_err(|e| BmError::invalid_response(operation, e.to_string()))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Search ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub permalink: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub score: Option<f64>,
    pub file_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SearchPayload {
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataSearchResult {
    pub results: Vec<SearchResult>,
    pub current_page: u32,
    pub page_size: u32,
}

// ─── Notes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteResult {
    pub title: String,
    pub permalink: String,
    pub content: String,
    pub file_path: String,
    #[serde(default)]
    pub checksum: Option<String>,
    /// `created` or `updated` for writes.
    #[serde(default)]
    pub action: Option<String>,
}

/// Edit discriminator as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOperation {
    Append,
    Prepend,
    FindReplace,
    ReplaceSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditNoteResult {
    pub title: String,
    pub permalink: String,
    pub file_path: String,
    pub operation: EditOperation,
    #[serde(default)]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteNoteResult {
    pub deleted: bool,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveNoteResult {
    pub moved: bool,
    pub title: String,
    pub permalink: String,
    pub file_path: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
}

// ─── Context & Activity ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub title: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub category: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub primary_result: MemoryItem,
    #[serde(default)]
    pub observations: Vec<Observation>,
    #[serde(default)]
    pub related_results: Vec<MemoryItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResult {
    pub results: Vec<ContextEntry>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentResult {
    pub title: String,
    pub permalink: String,
    pub file_path: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RecentPayload {
    pub results: Vec<RecentResult>,
}

// ─── Projects & Workspaces ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_private: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectListResult {
    pub projects: Vec<ProjectInfo>,
    #[serde(default)]
    pub default_project: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub tenant_id: String,
    pub name: String,
    pub workspace_type: String,
    pub role: String,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub has_active_subscription: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceResult {
    pub workspaces: Vec<WorkspaceInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CreateProjectPayload {
    pub project: ProjectInfo,
}

// ─── Schema ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteValidation {
    pub note_identifier: String,
    pub passed: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaValidationResult {
    #[serde(default)]
    pub entity_type: Option<String>,
    pub total_notes: u32,
    pub valid_count: u32,
    pub warning_count: u32,
    pub error_count: u32,
    pub results: Vec<NoteValidation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFrequency {
    pub name: String,
    pub count: u32,
    pub total: u32,
    pub percentage: f64,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub sample_values: Vec<String>,
    #[serde(default)]
    pub is_array: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaInferResult {
    pub entity_type: String,
    pub notes_analyzed: u32,
    pub field_frequencies: Vec<FieldFrequency>,
    pub suggested_schema: Map<String, Value>,
    #[serde(default)]
    pub suggested_required: Vec<String>,
    #[serde(default)]
    pub suggested_optional: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDiffResult {
    pub entity_type: String,
    pub schema_found: bool,
    pub new_fields: Vec<FieldFrequency>,
    pub dropped_fields: Vec<FieldFrequency>,
    #[serde(default)]
    pub cardinality_changes: Vec<String>,
}

impl SchemaDiffResult {
    pub fn has_drift(&self) -> bool {
        !self.new_fields.is_empty()
            || !self.dropped_fields.is_empty()
            || !self.cardinality_changes.is_empty()
    }
}
