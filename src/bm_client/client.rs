//! bm client: the typed operation façade.
//!
//! Every collaborator (CLI commands, slash commands, HTTP handlers, hooks)
//! goes through [`BmClient`]. Each method builds its argument map, calls the
//! gateway, and validates the structured payload into a concrete result.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{Map, Value};

use super::config::BridgeConfig;
use super::errors::BmError;
use super::gateway::CallGateway;
use super::lifecycle::{SessionConnector, StdioConnector};
use super::results::{
    validate, ContextResult, CreateProjectPayload, DeleteNoteResult, EditNoteResult,
    EditOperation, MetadataSearchResult, MoveNoteResult, NoteResult, ProjectInfo,
    ProjectListResult, RecentPayload, RecentResult, SchemaDiffResult, SchemaInferResult,
    SchemaValidationResult, SearchPayload, SearchResult, WorkspaceResult,
};
use super::retry::RetryPolicy;
use super::supervisor::{SessionStatus, SessionSupervisor};
use super::tools;

/// Folder holding the daily conversation notes.
const CONVERSATION_FOLDER: &str = "conversations";

/// Lowercase fragments of a tool error that mean the target note is absent.
const MISSING_NOTE_MARKERS: &[&str] = &["not found", "does not exist", "no such"];

// ─── Request Options ─────────────────────────────────────────────────────────

/// Search strategy understood by `search_notes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Text,
    Title,
    Permalink,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub page: Option<u32>,
    pub search_type: Option<SearchType>,
    pub types: Vec<String>,
    pub after_date: Option<String>,
    pub project: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteNoteOptions {
    pub tags: Vec<String>,
    pub note_type: Option<String>,
    pub project: Option<String>,
}

/// One edit. Variant-specific preconditions (find text present, heading
/// present) are enforced by the remote; its rejection is surfaced verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteEdit {
    Append {
        content: String,
    },
    Prepend {
        content: String,
    },
    FindReplace {
        find_text: String,
        content: String,
        expected_replacements: Option<u32>,
    },
    ReplaceSection {
        section: String,
        content: String,
    },
}

impl NoteEdit {
    pub fn operation(&self) -> EditOperation {
        match self {
            NoteEdit::Append { .. } => EditOperation::Append,
            NoteEdit::Prepend { .. } => EditOperation::Prepend,
            NoteEdit::FindReplace { .. } => EditOperation::FindReplace,
            NoteEdit::ReplaceSection { .. } => EditOperation::ReplaceSection,
        }
    }

    fn content(&self) -> &str {
        match self {
            NoteEdit::Append { content }
            | NoteEdit::Prepend { content }
            | NoteEdit::FindReplace { content, .. }
            | NoteEdit::ReplaceSection { content, .. } => content,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub depth: Option<u32>,
    pub timeframe: Option<String>,
    pub max_related: Option<u32>,
}

// ─── Argument Builder ────────────────────────────────────────────────────────

/// Tool argument map; `None` values are left out entirely.
#[derive(Debug, Default)]
struct Args(Map<String, Value>);

impl Args {
    fn new() -> Self {
        Self::default()
    }

    fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    fn set_opt<T: Into<Value>>(self, key: &str, value: Option<T>) -> Self {
        match value {
            Some(v) => self.set(key, v),
            None => self,
        }
    }

    /// Insert the serde encoding of `value`, so enums go out under the same
    /// names their `Serialize` impl uses everywhere else.
    fn set_serialized<T: Serialize>(
        self,
        tool: &str,
        key: &str,
        value: Option<T>,
    ) -> Result<Self, BmError> {
        let Some(value) = value else {
            return Ok(self);
        };
        let encoded = serde_json::to_value(value).map_err(|e| BmError::InvalidArguments {
            tool: tool.to_string(),
            reason: format!("cannot encode {key}: {e}"),
        })?;
        Ok(self.set(key, encoded))
    }

    fn set_list(self, key: &str, values: &[String]) -> Self {
        if values.is_empty() {
            self
        } else {
            self.set(key, values.to_vec())
        }
    }

    fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

// ─── BmClient ────────────────────────────────────────────────────────────────

/// Typed access to the bm knowledge graph over a supervised session.
#[derive(Clone)]
pub struct BmClient {
    gateway: CallGateway,
    project: String,
    project_path: Option<String>,
}

impl BmClient {
    /// Build a client that launches `bm` as described by `config`.
    pub fn from_config(config: &BridgeConfig) -> Self {
        let connector = StdioConnector::new(
            config.server_command(),
            Duration::from_millis(config.handshake_timeout_ms),
        );
        let client = Self::with_connector(
            Arc::new(connector),
            config.retry_policy(),
            Duration::from_millis(config.call_timeout_ms),
            &config.project,
        );
        match &config.project_path {
            Some(path) => client.with_project_path(path),
            None => client,
        }
    }

    /// Build a client over any connector.
    pub fn with_connector(
        connector: Arc<dyn SessionConnector>,
        policy: RetryPolicy,
        call_timeout: Duration,
        project: &str,
    ) -> Self {
        let supervisor = SessionSupervisor::new(connector, policy);
        Self {
            gateway: CallGateway::new(supervisor, call_timeout),
            project: project.to_string(),
            project_path: None,
        }
    }

    /// Directory used by [`BmClient::ensure_configured_project`].
    pub fn with_project_path(mut self, path: &str) -> Self {
        self.project_path = Some(path.to_string());
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn project_path(&self) -> Option<&str> {
        self.project_path.as_deref()
    }

    pub fn gateway(&self) -> &CallGateway {
        &self.gateway
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    pub async fn start(&self) -> Result<(), BmError> {
        self.gateway.supervisor().start().await
    }

    pub async fn stop(&self) {
        self.gateway.supervisor().stop().await
    }

    pub async fn status(&self) -> SessionStatus {
        self.gateway.supervisor().status().await
    }

    // ─── Search ──────────────────────────────────────────────────────────

    pub async fn search(
        &self,
        query: &str,
        limit: u32,
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>, BmError> {
        let args = Args::new()
            .set("query", query)
            .set("page_size", limit)
            .set_opt("page", options.page)
            .set_serialized(tools::SEARCH_NOTES, "search_type", options.search_type)?
            .set_list("types", &options.types)
            .set_opt("after_date", options.after_date.clone())
            .set_opt("project", options.project.clone());
        let payload = self.gateway.call_tool(tools::SEARCH_NOTES, args.into_value()).await?;
        let parsed: SearchPayload = validate(tools::SEARCH_NOTES, payload)?;
        Ok(parsed.results)
    }

    /// Search by frontmatter fields, e.g. `{"status": "draft"}`.
    pub async fn search_by_metadata(
        &self,
        filters: Map<String, Value>,
        limit: Option<u32>,
        page: Option<u32>,
    ) -> Result<MetadataSearchResult, BmError> {
        let args = Args::new()
            .set("filters", Value::Object(filters))
            .set_opt("page_size", limit)
            .set_opt("page", page);
        let payload = self
            .gateway
            .call_tool(tools::SEARCH_BY_METADATA, args.into_value())
            .await?;
        validate(tools::SEARCH_BY_METADATA, payload)
    }

    // ─── Notes ───────────────────────────────────────────────────────────

    pub async fn read_note(&self, identifier: &str) -> Result<NoteResult, BmError> {
        require(tools::READ_NOTE, "identifier", identifier)?;
        let args = Args::new().set("identifier", identifier);
        let payload = self.gateway.call_tool(tools::READ_NOTE, args.into_value()).await?;
        validate(tools::READ_NOTE, payload)
    }

    pub async fn write_note(
        &self,
        title: &str,
        content: &str,
        folder: &str,
        options: &WriteNoteOptions,
    ) -> Result<NoteResult, BmError> {
        require(tools::WRITE_NOTE, "title", title)?;
        let args = Args::new()
            .set("title", title)
            .set("content", content)
            .set("folder", folder)
            .set_list("tags", &options.tags)
            .set_opt("note_type", options.note_type.clone())
            .set_opt("project", options.project.clone());
        let payload = self.gateway.call_tool(tools::WRITE_NOTE, args.into_value()).await?;
        validate(tools::WRITE_NOTE, payload)
    }

    pub async fn edit_note(&self, identifier: &str, edit: &NoteEdit) -> Result<EditNoteResult, BmError> {
        require(tools::EDIT_NOTE, "identifier", identifier)?;
        match edit {
            NoteEdit::FindReplace { find_text, .. } => require(tools::EDIT_NOTE, "find_text", find_text)?,
            NoteEdit::ReplaceSection { section, .. } => require(tools::EDIT_NOTE, "section", section)?,
            NoteEdit::Append { .. } | NoteEdit::Prepend { .. } => {}
        }
        let mut args = Args::new()
            .set("identifier", identifier)
            .set_serialized(tools::EDIT_NOTE, "operation", Some(edit.operation()))?
            .set("content", edit.content());
        match edit {
            NoteEdit::FindReplace {
                find_text,
                expected_replacements,
                ..
            } => {
                args = args
                    .set("find_text", find_text.as_str())
                    .set_opt("expected_replacements", *expected_replacements);
            }
            NoteEdit::ReplaceSection { section, .. } => {
                args = args.set("section", section.as_str());
            }
            NoteEdit::Append { .. } | NoteEdit::Prepend { .. } => {}
        }
        let payload = self.gateway.call_tool(tools::EDIT_NOTE, args.into_value()).await?;
        validate(tools::EDIT_NOTE, payload)
    }

    /// Delete a note. Succeeds only when the remote confirms `deleted: true`.
    pub async fn delete_note(&self, identifier: &str) -> Result<DeleteNoteResult, BmError> {
        require(tools::DELETE_NOTE, "identifier", identifier)?;
        let args = Args::new().set("identifier", identifier);
        let payload = self.gateway.call_tool(tools::DELETE_NOTE, args.into_value()).await?;
        let result: DeleteNoteResult = validate(tools::DELETE_NOTE, payload)?;
        if !result.deleted {
            return Err(BmError::Tool {
                tool: tools::DELETE_NOTE.to_string(),
                message: format!("note '{identifier}' was not deleted"),
            });
        }
        Ok(result)
    }

    /// Move a note. Succeeds only when the remote confirms `moved: true`.
    pub async fn move_note(
        &self,
        identifier: &str,
        destination_path: &str,
    ) -> Result<MoveNoteResult, BmError> {
        require(tools::MOVE_NOTE, "identifier", identifier)?;
        require(tools::MOVE_NOTE, "destination_path", destination_path)?;
        let args = Args::new()
            .set("identifier", identifier)
            .set("destination_path", destination_path);
        let payload = self.gateway.call_tool(tools::MOVE_NOTE, args.into_value()).await?;
        let result: MoveNoteResult = validate(tools::MOVE_NOTE, payload)?;
        if !result.moved {
            return Err(BmError::Tool {
                tool: tools::MOVE_NOTE.to_string(),
                message: format!("note '{identifier}' was not moved to '{destination_path}'"),
            });
        }
        Ok(result)
    }

    // ─── Context & Activity ──────────────────────────────────────────────

    /// Traverse the graph from a `memory://` URL.
    pub async fn build_context(&self, url: &str, options: &ContextOptions) -> Result<ContextResult, BmError> {
        let args = Args::new()
            .set("url", url)
            .set_opt("depth", options.depth)
            .set_opt("timeframe", options.timeframe.clone())
            .set_opt("max_related", options.max_related);
        let payload = self.gateway.call_tool(tools::BUILD_CONTEXT, args.into_value()).await?;
        validate(tools::BUILD_CONTEXT, payload)
    }

    pub async fn recent_activity(&self, timeframe: Option<&str>) -> Result<Vec<RecentResult>, BmError> {
        let args = Args::new().set_opt("timeframe", timeframe);
        let payload = self
            .gateway
            .call_tool(tools::RECENT_ACTIVITY, args.into_value())
            .await?;
        let parsed: RecentPayload = validate(tools::RECENT_ACTIVITY, payload)?;
        Ok(parsed.results)
    }

    // ─── Projects & Workspaces ───────────────────────────────────────────

    pub async fn list_projects(&self) -> Result<ProjectListResult, BmError> {
        let payload = self
            .gateway
            .call_tool(tools::LIST_PROJECTS, Args::new().into_value())
            .await?;
        validate(tools::LIST_PROJECTS, payload)
    }

    pub async fn list_workspaces(&self) -> Result<WorkspaceResult, BmError> {
        let payload = self
            .gateway
            .call_tool(tools::LIST_WORKSPACES, Args::new().into_value())
            .await?;
        validate(tools::LIST_WORKSPACES, payload)
    }

    pub async fn create_project(
        &self,
        name: &str,
        path: &str,
        set_default: bool,
    ) -> Result<ProjectInfo, BmError> {
        require(tools::CREATE_PROJECT, "project_name", name)?;
        let args = Args::new()
            .set("project_name", name)
            .set("project_path", path)
            .set("set_default", set_default);
        let payload = self.gateway.call_tool(tools::CREATE_PROJECT, args.into_value()).await?;
        let parsed: CreateProjectPayload = validate(tools::CREATE_PROJECT, payload)?;
        Ok(parsed.project)
    }

    /// Make sure the configured project exists, creating it at `path` if not.
    pub async fn ensure_project(&self, path: &str) -> Result<ProjectInfo, BmError> {
        let listing = self.list_projects().await?;
        if let Some(existing) = listing.projects.into_iter().find(|p| p.name == self.project) {
            tracing::debug!(project = %existing.name, path = %existing.path, "project already exists");
            return Ok(existing);
        }
        tracing::info!(project = %self.project, path, "creating bm project");
        self.create_project(&self.project, path, false).await
    }

    /// [`BmClient::ensure_project`] at the configured `project_path`.
    pub async fn ensure_configured_project(&self) -> Result<ProjectInfo, BmError> {
        let Some(path) = self.project_path.as_deref() else {
            return Err(BmError::Config {
                reason: format!("no project_path configured for project '{}'", self.project),
            });
        };
        self.ensure_project(path).await
    }

    // ─── Schema ──────────────────────────────────────────────────────────

    /// Validate notes against their schema: by note type, or a single note.
    pub async fn schema_validate(
        &self,
        note_type: Option<&str>,
        identifier: Option<&str>,
    ) -> Result<SchemaValidationResult, BmError> {
        let args = Args::new()
            .set_opt("note_type", note_type)
            .set_opt("identifier", identifier);
        let payload = self
            .gateway
            .call_tool(tools::SCHEMA_VALIDATE, args.into_value())
            .await?;
        validate(tools::SCHEMA_VALIDATE, payload)
    }

    pub async fn schema_infer(
        &self,
        note_type: &str,
        threshold: Option<f64>,
    ) -> Result<SchemaInferResult, BmError> {
        let args = Args::new()
            .set("note_type", note_type)
            .set_opt("threshold", threshold);
        let payload = self.gateway.call_tool(tools::SCHEMA_INFER, args.into_value()).await?;
        validate(tools::SCHEMA_INFER, payload)
    }

    pub async fn schema_diff(&self, note_type: &str) -> Result<SchemaDiffResult, BmError> {
        let args = Args::new().set("note_type", note_type);
        let payload = self.gateway.call_tool(tools::SCHEMA_DIFF, args.into_value()).await?;
        validate(tools::SCHEMA_DIFF, payload)
    }

    // ─── Conversation Capture ────────────────────────────────────────────

    /// Record one user/assistant exchange in today's conversation note.
    ///
    /// Appends to `conversations/conversations-YYYY-MM-DD`. Only when the
    /// remote reports that note missing is it created with `write_note`; any
    /// other rejection is returned so an existing day is never overwritten.
    pub async fn index_conversation(
        &self,
        user_message: &str,
        assistant_response: &str,
    ) -> Result<(), BmError> {
        let now = Local::now();
        let title = conversation_title(&now);
        let entry = conversation_entry(&now, user_message, assistant_response);
        let identifier = format!("{CONVERSATION_FOLDER}/{title}");

        match self
            .edit_note(&identifier, &NoteEdit::Append { content: entry.clone() })
            .await
        {
            Ok(_) => Ok(()),
            Err(BmError::Tool { message, .. }) if is_missing_note(&message) => {
                tracing::debug!(note = %identifier, reason = %message, "creating conversation note");
                let content = format!("# {title}\n\n{entry}");
                let options = WriteNoteOptions {
                    tags: vec!["conversation".to_string()],
                    ..Default::default()
                };
                self.write_note(&title, &content, CONVERSATION_FOLDER, &options)
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }
}

/// Reject blank required arguments before they reach the remote.
fn require(tool: &str, field: &str, value: &str) -> Result<(), BmError> {
    if value.trim().is_empty() {
        return Err(BmError::InvalidArguments {
            tool: tool.to_string(),
            reason: format!("{field} must not be empty"),
        });
    }
    Ok(())
}

fn is_missing_note(message: &str) -> bool {
    let lower = message.to_lowercase();
    MISSING_NOTE_MARKERS.iter().any(|m| lower.contains(m))
}

fn conversation_title(now: &DateTime<Local>) -> String {
    format!("conversations-{}", now.format("%Y-%m-%d"))
}

fn conversation_entry(now: &DateTime<Local>, user: &str, assistant: &str) -> String {
    format!(
        "### {}\n\n**User:** {}\n\n**Assistant:** {}\n",
        now.format("%H:%M"),
        user.trim(),
        assistant.trim()
    )
}

// ─── Tests ───────────────────────────────────────────────────────────────────
