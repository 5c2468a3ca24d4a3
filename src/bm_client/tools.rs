//! Remote tool names and the handshake capability check.

pub const SEARCH_NOTES: &str = "search_notes";
pub const SEARCH_BY_METADATA: &str = "search_by_metadata";
pub const READ_NOTE: &str = "read_note";
pub const WRITE_NOTE: &str = "write_note";
pub const EDIT_NOTE: &str = "edit_note";
pub const BUILD_CONTEXT: &str = "build_context";
pub const RECENT_ACTIVITY: &str = "recent_activity";
pub const LIST_PROJECTS: &str = "list_memory_projects";
pub const LIST_WORKSPACES: &str = "list_workspaces";
pub const CREATE_PROJECT: &str = "create_memory_project";
pub const DELETE_NOTE: &str = "delete_note";
pub const MOVE_NOTE: &str = "move_note";
pub const SCHEMA_VALIDATE: &str = "schema_validate";
pub const SCHEMA_INFER: &str = "schema_infer";
pub const SCHEMA_DIFF: &str = "schema_diff";

/// Tools a session must advertise to be usable.
pub const REQUIRED_TOOLS: &[&str] = &[
    SEARCH_NOTES,
    SEARCH_BY_METADATA,
    READ_NOTE,
    WRITE_NOTE,
    EDIT_NOTE,
    BUILD_CONTEXT,
    RECENT_ACTIVITY,
    LIST_PROJECTS,
    LIST_WORKSPACES,
    CREATE_PROJECT,
    DELETE_NOTE,
    MOVE_NOTE,
    SCHEMA_VALIDATE,
    SCHEMA_INFER,
    SCHEMA_DIFF,
];

/// Required tools absent from `advertised`, in `REQUIRED_TOOLS` order.
pub fn missing_required_tools(advertised: &[String]) -> Vec<String> {
    REQUIRED_TOOLS
        .iter()
        .filter(|name| !advertised.iter().any(|a| a == *name))
        .map(|name| name.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_tools() -> Vec<String> {
        REQUIRED_TOOLS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_full_set_has_nothing_missing() {
        let mut advertised = all_tools();
        advertised.push("canvas".to_string());
        assert!(missing_required_tools(&advertised).is_empty());
    }

    #[test]
    fn test_reports_missing_in_table_order() {
        let advertised: Vec<String> = all_tools()
            .into_iter()
            .filter(|t| t != SCHEMA_DIFF && t != READ_NOTE)
            .collect();
        assert_eq!(
            missing_required_tools(&advertised),
            vec![READ_NOTE.to_string(), SCHEMA_DIFF.to_string()]
        );
    }

    #[test]
    fn test_required_tool_count() {
        assert_eq!(REQUIRED_TOOLS.len(), 15);
    }
}
