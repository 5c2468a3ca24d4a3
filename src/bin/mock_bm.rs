//! Mock `bm mcp` server for integration tests.
//!
//! Speaks newline-delimited JSON-RPC 2.0 on stdio, advertises the full bm
//! tool set and keeps notes in memory for the life of the process.
//!
//! # Environment Variables
//!
//! - `MOCK_BM_OMIT_TOOLS`: comma-separated tool names left out of `tools/list`
//! - `MOCK_BM_SPAWN_LOG`: file that gets one line appended per process start
//! - `MOCK_BM_CRASH_ONCE_FILE`: on the first `tools/call`, if this file does
//!   not exist, create it and exit without answering
//! - `MOCK_BM_HANG_INIT`: never answer `initialize`
//! - `MOCK_BM_HANG_INIT_ONCE_FILE`: like the crash marker, but leave
//!   `initialize` unanswered instead of exiting
//! - `MOCK_BM_HANG_CALL_ONCE_FILE`: leave the first `tools/call` unanswered
//! - `MOCK_BM_FAIL_START`: exit with status 1 before reading any input
//! - `MOCK_BM_PAGE_SIZE`: tools per `tools/list` page (default: 8)
//! - `MOCK_BM_STDOUT_NOISE`: print a non-JSON banner line on stdout first
//!
//! # Usage
//!
//! ```bash
//! printf '%s\n' '{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}' \
//!   | cargo run --bin mock_bm -- mcp --transport stdio --project main
//! ```

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;

use anyhow::Context;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const TOOLS: &[&str] = &[
    "search_notes",
    "search_by_metadata",
    "read_note",
    "write_note",
    "edit_note",
    "build_context",
    "recent_activity",
    "list_memory_projects",
    "list_workspaces",
    "create_memory_project",
    "delete_note",
    "move_note",
    "schema_validate",
    "schema_infer",
    "schema_diff",
];

type ToolOutcome = Result<Value, String>;

/// What the main loop does with one request.
enum Reply {
    Answer(Result<Value, (i64, String)>),
    /// Keep running but never respond.
    Silent,
    /// Exit the process without responding.
    Exit,
}

/// A misbehaviour switch read from the environment.
enum Trigger {
    Never,
    Always,
    /// Fires once per marker file: the first process to see it missing
    /// creates it and fires.
    Once(PathBuf),
}

impl Trigger {
    fn from_env(always_var: Option<&str>, once_var: &str) -> Self {
        if always_var.is_some_and(|v| std::env::var_os(v).is_some()) {
            return Trigger::Always;
        }
        match std::env::var_os(once_var) {
            Some(path) => Trigger::Once(PathBuf::from(path)),
            None => Trigger::Never,
        }
    }

    fn fire(&self) -> bool {
        match self {
            Trigger::Never => false,
            Trigger::Always => true,
            Trigger::Once(marker) => !marker.exists() && std::fs::write(marker, "fired\n").is_ok(),
        }
    }
}

#[derive(Debug, Clone)]
struct Note {
    title: String,
    folder: String,
    content: String,
    tags: Vec<String>,
    note_type: String,
    created_at: String,
    seq: u64,
}

impl Note {
    fn permalink(&self) -> String {
        if self.folder.is_empty() {
            slugify(&self.title)
        } else {
            format!("{}/{}", self.folder.trim_matches('/'), slugify(&self.title))
        }
    }

    fn summary(&self) -> Value {
        let permalink = self.permalink();
        json!({
            "title": self.title,
            "permalink": permalink,
            "content": self.content,
            "file_path": format!("{permalink}.md"),
            "checksum": format!("{:08x}", checksum(&self.content)),
        })
    }
}

// ─── Mock State ──────────────────────────────────────────────────────────────

struct MockBm {
    project: String,
    notes: BTreeMap<String, Note>,
    projects: Vec<(String, String)>,
    seq: u64,
    omitted: Vec<String>,
    page_size: usize,
    crash_call: Trigger,
    hang_init: Trigger,
    hang_call: Trigger,
}

impl MockBm {
    fn from_env(project: String) -> Self {
        let omitted = std::env::var("MOCK_BM_OMIT_TOOLS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let page_size = std::env::var("MOCK_BM_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(8);
        let projects = vec![(project.clone(), format!("/tmp/bm/{project}"))];

        Self {
            project,
            notes: BTreeMap::new(),
            projects,
            seq: 0,
            omitted,
            page_size,
            crash_call: Trigger::from_env(None, "MOCK_BM_CRASH_ONCE_FILE"),
            hang_init: Trigger::from_env(Some("MOCK_BM_HANG_INIT"), "MOCK_BM_HANG_INIT_ONCE_FILE"),
            hang_call: Trigger::from_env(None, "MOCK_BM_HANG_CALL_ONCE_FILE"),
        }
    }

    fn handle(&mut self, method: &str, params: &Value) -> Reply {
        let outcome = match method {
            "initialize" if self.hang_init.fire() => return Reply::Silent,
            "initialize" => Ok(json!({
                "protocolVersion": params
                    .get("protocolVersion")
                    .cloned()
                    .unwrap_or_else(|| json!("2025-06-18")),
                "capabilities": {"tools": {"listChanged": false}},
                "serverInfo": {"name": "mock-bm", "version": env!("CARGO_PKG_VERSION")},
            })),
            "tools/list" => Ok(self.list_tools(params)),
            "tools/call" => {
                if self.crash_call.fire() {
                    return Reply::Exit;
                }
                if self.hang_call.fire() {
                    return Reply::Silent;
                }
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                self.call_tool(name, &args)
            }
            "ping" => Ok(json!({})),
            other => Err((-32601, format!("Method not found: {other}"))),
        };
        Reply::Answer(outcome)
    }

    fn list_tools(&self, params: &Value) -> Value {
        let advertised: Vec<&str> = TOOLS
            .iter()
            .copied()
            .filter(|t| !self.omitted.iter().any(|o| o == t))
            .collect();
        let start = params
            .get("cursor")
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0)
            .min(advertised.len());
        let end = (start + self.page_size).min(advertised.len());

        let tools: Vec<Value> = advertised[start..end]
            .iter()
            .map(|name| json!({"name": name, "inputSchema": {"type": "object"}}))
            .collect();
        let mut page = json!({ "tools": tools });
        if end < advertised.len() {
            page["nextCursor"] = json!(end.to_string());
        }
        page
    }

    fn call_tool(&mut self, name: &str, args: &Value) -> Result<Value, (i64, String)> {
        let outcome = match name {
            "write_note" => self.write_note(args),
            "read_note" => self.read_note(args),
            "search_notes" => self.search_notes(args),
            "search_by_metadata" => self.search_by_metadata(args),
            "edit_note" => self.edit_note(args),
            "delete_note" => self.delete_note(args),
            "move_note" => self.move_note(args),
            "build_context" => self.build_context(args),
            "recent_activity" => Ok(self.recent_activity()),
            "list_memory_projects" => Ok(self.list_projects()),
            "list_workspaces" => Ok(json!({"result": {"workspaces": [{
                "tenant_id": "local",
                "name": "Local",
                "workspace_type": "personal",
                "role": "owner",
                "has_active_subscription": false,
            }]}})),
            "create_memory_project" => self.create_project(args),
            "schema_validate" => Ok(self.schema_validate(args)),
            "schema_infer" => Ok(self.schema_infer(args)),
            "schema_diff" => Ok(json!({
                "entity_type": str_arg(args, "note_type").unwrap_or_default(),
                "schema_found": false,
                "new_fields": [],
                "dropped_fields": [],
                "cardinality_changes": [],
            })),
            other => return Err((-32602, format!("Unknown tool: {other}"))),
        };
        Ok(tool_result(outcome))
    }

    // ─── Notes ───────────────────────────────────────────────────────────

    fn resolve(&self, identifier: &str) -> Option<String> {
        let id = identifier.trim_start_matches("memory://").trim_end_matches(".md");
        if self.notes.contains_key(id) {
            return Some(id.to_string());
        }
        self.notes
            .iter()
            .find(|(_, n)| n.title.eq_ignore_ascii_case(id))
            .map(|(k, _)| k.clone())
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn write_note(&mut self, args: &Value) -> ToolOutcome {
        let title = str_arg(args, "title")?;
        let content = str_arg(args, "content")?;
        let folder = str_arg(args, "folder")?;
        let tags = args
            .get("tags")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|t| t.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let note_type = args
            .get("note_type")
            .and_then(Value::as_str)
            .unwrap_or("note")
            .to_string();

        let seq = self.next_seq();
        let note = Note {
            title,
            folder,
            content,
            tags,
            note_type,
            created_at: chrono::Utc::now().to_rfc3339(),
            seq,
        };
        let permalink = note.permalink();
        let action = if self.notes.contains_key(&permalink) {
            "updated"
        } else {
            "created"
        };
        let mut summary = note.summary();
        summary["action"] = json!(action);
        self.notes.insert(permalink, note);
        Ok(summary)
    }

    fn read_note(&self, args: &Value) -> ToolOutcome {
        let identifier = str_arg(args, "identifier")?;
        let key = self
            .resolve(&identifier)
            .ok_or_else(|| format!("Note not found: {identifier}"))?;
        Ok(self.notes[&key].summary())
    }

    fn search_notes(&self, args: &Value) -> ToolOutcome {
        let query = str_arg(args, "query")?.to_lowercase();
        let limit = args.get("page_size").and_then(Value::as_u64).unwrap_or(10) as usize;
        let results: Vec<Value> = self
            .notes
            .values()
            .filter(|n| {
                n.title.to_lowercase().contains(&query) || n.content.to_lowercase().contains(&query)
            })
            .take(limit)
            .map(|n| {
                let mut hit = n.summary();
                hit["score"] = json!(1.0);
                hit
            })
            .collect();
        Ok(json!({ "results": results }))
    }

    fn search_by_metadata(&self, args: &Value) -> ToolOutcome {
        let filters = args
            .get("filters")
            .and_then(Value::as_object)
            .ok_or("filters must be an object")?;
        let page_size = args.get("page_size").and_then(Value::as_u64).unwrap_or(20);
        let results: Vec<Value> = self
            .notes
            .values()
            .filter(|n| filters.iter().all(|(k, v)| metadata_matches(n, k, v)))
            .take(page_size as usize)
            .map(Note::summary)
            .collect();
        Ok(json!({
            "results": results,
            "current_page": args.get("page").and_then(Value::as_u64).unwrap_or(1),
            "page_size": page_size,
        }))
    }

    fn edit_note(&mut self, args: &Value) -> ToolOutcome {
        let identifier = str_arg(args, "identifier")?;
        let operation = str_arg(args, "operation")?;
        let content = str_arg(args, "content")?;
        let key = self
            .resolve(&identifier)
            .ok_or_else(|| format!("Entity not found: {identifier}"))?;

        let current = self.notes[&key].content.clone();
        let updated = match operation.as_str() {
            "append" => format!("{}\n{content}", current.trim_end()),
            "prepend" => format!("{content}\n{current}"),
            "find_replace" => {
                let find_text = str_arg(args, "find_text")?;
                let found = current.matches(find_text.as_str()).count();
                if found == 0 {
                    return Err(format!("Text to replace not found: '{find_text}'"));
                }
                let expected = args
                    .get("expected_replacements")
                    .and_then(Value::as_u64)
                    .unwrap_or(1) as usize;
                if found != expected {
                    return Err(format!(
                        "Expected {expected} occurrences of '{find_text}', but found {found}"
                    ));
                }
                current.replace(find_text.as_str(), &content)
            }
            "replace_section" => {
                let section = str_arg(args, "section")?;
                replace_section(&current, &section, &content)
                    .ok_or_else(|| format!("Section '{section}' not found"))?
            }
            other => return Err(format!("Invalid operation: {other}")),
        };

        let seq = self.next_seq();
        let note = self
            .notes
            .get_mut(&key)
            .ok_or_else(|| format!("Entity not found: {identifier}"))?;
        note.content = updated;
        note.seq = seq;
        let summary = note.summary();
        Ok(json!({
            "title": summary["title"],
            "permalink": summary["permalink"],
            "file_path": summary["file_path"],
            "checksum": summary["checksum"],
            "operation": operation,
        }))
    }

    fn delete_note(&mut self, args: &Value) -> ToolOutcome {
        let identifier = str_arg(args, "identifier")?;
        match self.resolve(&identifier).and_then(|k| self.notes.remove(&k)) {
            Some(note) => {
                let permalink = note.permalink();
                Ok(json!({
                    "deleted": true,
                    "title": note.title,
                    "permalink": permalink,
                    "file_path": format!("{permalink}.md"),
                }))
            }
            None => Ok(json!({ "deleted": false })),
        }
    }

    fn move_note(&mut self, args: &Value) -> ToolOutcome {
        let identifier = str_arg(args, "identifier")?;
        let destination = str_arg(args, "destination_path")?;
        let key = self
            .resolve(&identifier)
            .ok_or_else(|| format!("Entity not found: {identifier}"))?;
        let mut note = self
            .notes
            .remove(&key)
            .ok_or_else(|| format!("Entity not found: {identifier}"))?;

        let target = destination.trim_end_matches(".md");
        let (folder, stem) = target.rsplit_once('/').unwrap_or(("", target));
        note.folder = folder.to_string();
        note.title = stem.to_string();
        let permalink = note.permalink();
        let file_path = format!("{permalink}.md");
        self.notes.insert(permalink.clone(), note.clone());

        Ok(json!({
            "moved": true,
            "title": note.title,
            "permalink": permalink,
            "file_path": file_path,
            "source": format!("{key}.md"),
            "destination": destination,
        }))
    }

    // ─── Context, Projects, Schema ───────────────────────────────────────

    fn build_context(&self, args: &Value) -> ToolOutcome {
        let url = str_arg(args, "url")?;
        let results: Vec<Value> = self
            .resolve(&url)
            .map(|k| {
                let note = &self.notes[&k];
                let related: Vec<Value> = self
                    .notes
                    .values()
                    .filter(|other| other.folder == note.folder && other.title != note.title)
                    .map(|other| json!({"title": other.title, "type": "entity", "permalink": other.permalink()}))
                    .collect();
                let mut primary = note.summary();
                primary["type"] = json!("entity");
                primary["created_at"] = json!(note.created_at);
                vec![json!({
                    "primary_result": primary,
                    "observations": [],
                    "related_results": related,
                })]
            })
            .unwrap_or_default();
        Ok(json!({ "results": results, "has_more": false }))
    }

    fn recent_activity(&self) -> Value {
        let mut notes: Vec<&Note> = self.notes.values().collect();
        notes.sort_by(|a, b| b.seq.cmp(&a.seq));
        let results: Vec<Value> = notes
            .into_iter()
            .map(|n| {
                let permalink = n.permalink();
                json!({
                    "title": n.title,
                    "permalink": permalink,
                    "file_path": format!("{permalink}.md"),
                    "created_at": n.created_at,
                })
            })
            .collect();
        json!({ "results": results })
    }

    fn list_projects(&self) -> Value {
        let projects: Vec<Value> = self
            .projects
            .iter()
            .map(|(name, path)| json!({"name": name, "path": path, "is_default": *name == self.project}))
            .collect();
        json!({ "projects": projects, "default_project": self.project })
    }

    fn create_project(&mut self, args: &Value) -> ToolOutcome {
        let name = str_arg(args, "project_name")?;
        let path = str_arg(args, "project_path")?;
        if self.projects.iter().any(|(n, _)| *n == name) {
            return Err(format!("Project '{name}' already exists"));
        }
        self.projects.push((name.clone(), path.clone()));
        Ok(json!({ "project": {"name": name, "path": path, "is_default": false} }))
    }

    fn schema_validate(&self, args: &Value) -> Value {
        let note_type = args.get("note_type").and_then(Value::as_str);
        let identifier = args.get("identifier").and_then(Value::as_str);
        let target = identifier.and_then(|id| self.resolve(id));

        let results: Vec<Value> = self
            .notes
            .iter()
            .filter(|(k, n)| match (&target, note_type) {
                (Some(t), _) => *k == t,
                (None, Some(ty)) => n.note_type == ty,
                (None, None) => true,
            })
            .map(|(k, n)| {
                let errors: Vec<String> = if n.content.trim().is_empty() {
                    vec!["note has no content".to_string()]
                } else {
                    Vec::new()
                };
                json!({"note_identifier": k, "passed": errors.is_empty(), "warnings": [], "errors": errors})
            })
            .collect();
        let errors = results.iter().filter(|r| r["passed"] == json!(false)).count();

        json!({
            "entity_type": note_type,
            "total_notes": results.len(),
            "valid_count": results.len() - errors,
            "warning_count": 0,
            "error_count": errors,
            "results": results,
        })
    }

    fn schema_infer(&self, args: &Value) -> Value {
        let note_type = str_arg(args, "note_type").unwrap_or_default();
        let notes: Vec<&Note> = self.notes.values().filter(|n| n.note_type == note_type).collect();
        let total = notes.len();
        let tagged = notes.iter().filter(|n| !n.tags.is_empty()).count();
        let percentage = |count: usize| if total == 0 { 0.0 } else { count as f64 * 100.0 / total as f64 };

        json!({
            "entity_type": note_type,
            "notes_analyzed": total,
            "field_frequencies": [
                {"name": "title", "count": total, "total": total, "percentage": percentage(total)},
                {"name": "tags", "count": tagged, "total": total, "percentage": percentage(tagged), "is_array": true},
            ],
            "suggested_schema": {"title": "string", "tags?": "array"},
            "suggested_required": ["title"],
            "suggested_optional": ["tags"],
            "excluded": [],
        })
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn str_arg(args: &Value, key: &str) -> Result<String, String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| format!("missing required argument '{key}'"))
}

fn tool_result(outcome: ToolOutcome) -> Value {
    match outcome {
        Ok(structured) => json!({
            "content": [{"type": "text", "text": structured.to_string()}],
            "structuredContent": structured,
            "isError": false,
        }),
        Err(message) => json!({
            "content": [{"type": "text", "text": message}],
            "isError": true,
        }),
    }
}

fn metadata_matches(note: &Note, key: &str, expected: &Value) -> bool {
    match (key, expected) {
        ("type", Value::String(t)) => note.note_type == *t,
        ("tags", Value::String(t)) => note.tags.iter().any(|tag| tag == t),
        ("title", Value::String(t)) => note.title == *t,
        _ => false,
    }
}

fn replace_section(body: &str, heading: &str, content: &str) -> Option<String> {
    let lines: Vec<&str> = body.lines().collect();
    let start = lines.iter().position(|l| l.trim() == heading.trim())?;
    let end = lines[start + 1..]
        .iter()
        .position(|l| l.starts_with('#'))
        .map(|i| start + 1 + i)
        .unwrap_or(lines.len());

    let mut out: Vec<&str> = lines[..=start].to_vec();
    out.extend(content.lines());
    out.extend(&lines[end..]);
    Some(out.join("\n"))
}

fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for ch in title.chars() {
        if ch.is_alphanumeric() {
            slug.extend(ch.to_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

fn checksum(content: &str) -> u32 {
    content
        .bytes()
        .fold(2166136261u32, |h, b| (h ^ b as u32).wrapping_mul(16777619))
}

fn project_from_args() -> String {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| a == "--project")
        .and_then(|i| args.get(i + 1).cloned())
        .unwrap_or_else(|| "main".to_string())
}

fn record_spawn(project: &str) -> anyhow::Result<()> {
    let Some(path) = std::env::var_os("MOCK_BM_SPAWN_LOG") else {
        return Ok(());
    };
    let mut log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open spawn log {}", PathBuf::from(&path).display()))?;
    writeln!(log, "spawn pid={} project={project}", std::process::id())?;
    Ok(())
}

// ─── Main ────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let project = project_from_args();
    record_spawn(&project)?;
    eprintln!("INFO mock bm starting project={project}");

    if std::env::var_os("MOCK_BM_FAIL_START").is_some() {
        eprintln!("ERROR mock bm configured to fail on start");
        std::process::exit(1);
    }

    let mut stdout = tokio::io::stdout();
    if std::env::var_os("MOCK_BM_STDOUT_NOISE").is_some() {
        stdout.write_all(b"mock bm ready (not json)\n").await?;
        stdout.flush().await?;
    }

    let mut server = MockBm::from_env(project);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("WARNING ignoring malformed input: {e}");
                continue;
            }
        };
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = message.get("params").cloned().unwrap_or(Value::Object(Map::new()));

        let outcome = match server.handle(method, &params) {
            Reply::Answer(outcome) => outcome,
            Reply::Silent => {
                eprintln!("WARNING mock bm leaving {method} unanswered");
                continue;
            }
            Reply::Exit => {
                eprintln!("ERROR mock bm crashing on {method}");
                std::process::exit(1);
            }
        };
        let response = match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            }
        };

        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }

    eprintln!("INFO mock bm stdin closed, exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Coffee Brewing Methods!"), "coffee-brewing-methods");
        assert_eq!(slugify("  a--b  "), "a-b");
    }

    #[test]
    fn test_replace_section_stops_at_next_heading() {
        let body = "# Plan\n## Tasks\n- old\n## Notes\nkeep";
        let updated = replace_section(body, "## Tasks", "- new").unwrap();
        assert_eq!(updated, "# Plan\n## Tasks\n- new\n## Notes\nkeep");
        assert!(replace_section(body, "## Missing", "x").is_none());
    }

    #[test]
    fn test_once_trigger_fires_a_single_time() {
        let dir = tempfile::tempdir().unwrap();
        let trigger = Trigger::Once(dir.path().join("marker"));
        assert!(trigger.fire());
        assert!(!trigger.fire());
        assert!(!Trigger::Never.fire());
        assert!(Trigger::Always.fire());
    }

    #[test]
    fn test_tools_list_paginates() {
        let mut server = MockBm::from_env("main".into());
        server.page_size = 8;
        let first = server.list_tools(&json!({}));
        assert_eq!(first["tools"].as_array().unwrap().len(), 8);
        assert_eq!(first["nextCursor"], "8");
        let second = server.list_tools(&json!({"cursor": "8"}));
        assert_eq!(second["tools"].as_array().unwrap().len(), 7);
        assert!(second.get("nextCursor").is_none());
    }
}
