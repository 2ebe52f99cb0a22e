// PRP Agent — Intent Tool Registry
// The tool schemas the model may call during a turn, declared once.
// Dispatch lives on the Agent (it needs both the repository and the LLM
// for translation); this module only knows names, schemas and argument
// shapes.

use crate::types::{FunctionDefinition, ToolDefinition};
use serde::Deserialize;
use serde_json::json;

pub const TOOL_LIST_PRPS: &str = "list_prps";
pub const TOOL_CREATE_PRP: &str = "create_prp";
pub const TOOL_ANALYZE_PRP: &str = "analyze_prp";
pub const TOOL_UPDATE_PRP_STATUS: &str = "update_prp_status";

/// Every intent tool the model may call, in one place.
pub fn intent_tools() -> Vec<ToolDefinition> {
    vec![
        tool(
            TOOL_LIST_PRPS,
            "List Product Requirement Prompts, optionally filtered by status or a search term.",
            json!({
                "type": "object",
                "properties": {
                    "status": {
                        "type": "string",
                        "enum": ["draft", "active", "archived"],
                        "description": "Only PRPs in this status"
                    },
                    "search": {
                        "type": "string",
                        "description": "Substring matched against name and search text"
                    }
                },
                "required": []
            }),
        ),
        tool(
            TOOL_CREATE_PRP,
            "Create a new Product Requirement Prompt. The name must be unique.",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Unique short identifier, e.g. 'auth-system'" },
                    "title": { "type": "string" },
                    "description": { "type": "string" },
                    "objective": { "type": "string" },
                    "priority": { "type": "string", "enum": ["low", "medium", "high"] },
                    "tags": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["name", "title", "description", "objective"]
            }),
        ),
        tool(
            TOOL_ANALYZE_PRP,
            "Fetch a PRP by id or name for analysis. Pending translations are resolved first.",
            json!({
                "type": "object",
                "properties": {
                    "prp": { "type": "string", "description": "PRP id or name" }
                },
                "required": ["prp"]
            }),
        ),
        tool(
            TOOL_UPDATE_PRP_STATUS,
            "Move a PRP to a new status.",
            json!({
                "type": "object",
                "properties": {
                    "prp": { "type": "string", "description": "PRP id or name" },
                    "status": { "type": "string", "enum": ["draft", "active", "archived"] }
                },
                "required": ["prp", "status"]
            }),
        ),
    ]
}

fn tool(name: &str, description: &str, parameters: serde_json::Value) -> ToolDefinition {
    ToolDefinition {
        tool_type: "function".into(),
        function: FunctionDefinition {
            name: name.into(),
            description: description.into(),
            parameters,
        },
    }
}

// ── Argument shapes ────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListPrpsArgs {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PrpKeyArgs {
    pub prp: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusArgs {
    pub prp: String,
    pub status: String,
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_declares_each_intent_once() {
        let tools = intent_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.function.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                TOOL_LIST_PRPS,
                TOOL_CREATE_PRP,
                TOOL_ANALYZE_PRP,
                TOOL_UPDATE_PRP_STATUS
            ]
        );
        let mut deduped = names.clone();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len());
    }

    #[test]
    fn schemas_are_objects_with_required_lists() {
        for t in intent_tools() {
            assert_eq!(t.tool_type, "function");
            assert_eq!(t.function.parameters["type"], "object");
            assert!(t.function.parameters["required"].is_array());
        }
    }

    #[test]
    fn list_args_accept_empty_object() {
        let args: ListPrpsArgs = serde_json::from_str("{}").unwrap();
        assert!(args.status.is_none());
        assert!(args.search.is_none());
    }
}
