//! Tool catalog exposed to every child
//!
//! Descriptions are composed from the user-editable instructions file plus a
//! generated roster of MCP-enabled agents, so a child always knows who it can
//! address.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::permissions::ToolSettings;
use crate::config::AgentConfig;

pub const AGENT_QUERY: &str = "AgentQuery";
pub const SELF_QUERY: &str = "SelfQuery";
pub const AGENT_MESSAGE: &str = "AgentMessage";
pub const AGENT_BROADCAST: &str = "AgentBroadcast";
pub const NOTIFY_USER: &str = "NotifyUser";
pub const ASK_USER_QUESTION: &str = "AskUserQuestion";
pub const REQUEST_TOOL_PERMISSION: &str = "RequestToolPermission";
pub const EXIT_PLAN_MODE: &str = "ExitPlanMode";
pub const BACKLOG_ADD: &str = "BacklogAdd";
pub const BACKLOG_UPDATE: &str = "BacklogUpdate";
pub const BACKLOG_LIST: &str = "BacklogList";

/// Tool definition in the shape the MCP client expects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// The roster appended to inter-agent tool descriptions
fn agent_roster(agents: &[AgentConfig]) -> String {
    let lines: Vec<String> = agents
        .iter()
        .filter(|a| a.mcp_enabled)
        .map(|a| match &a.description {
            Some(desc) => format!("- {} ({}): {}", a.slug, a.name, desc),
            None => format!("- {} ({})", a.slug, a.name),
        })
        .collect();
    if lines.is_empty() {
        "No other agents are currently available.".to_string()
    } else {
        format!("Available agents:\n{}", lines.join("\n"))
    }
}

fn compose(settings: &ToolSettings, base: &str, roster: Option<&str>) -> String {
    let mut description = String::new();
    if !settings.instructions.is_empty() {
        description.push_str(&settings.instructions);
        description.push_str("\n\n");
    }
    description.push_str(base);
    if let Some(roster) = roster {
        description.push_str("\n\n");
        description.push_str(roster);
    }
    description
}

/// Enabled tools with composed descriptions
pub fn catalog(settings: &ToolSettings, agents: &[AgentConfig]) -> Vec<ToolDefinition> {
    let roster = agent_roster(agents);

    let all = vec![
        ToolDefinition {
            name: AGENT_QUERY.to_string(),
            description: compose(
                settings,
                "Ask another agent a question. Spawns a fresh, stateless assistant in \
                 that agent's folder and returns its answer verbatim.",
                Some(&roster),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "agent": {"type": "string", "description": "Slug of the agent to query"},
                    "prompt": {"type": "string", "description": "Question or task for the agent"},
                    "from_agent": {"type": "string", "description": "Slug of the calling agent"}
                },
                "required": ["agent", "prompt"]
            }),
        },
        ToolDefinition {
            name: SELF_QUERY.to_string(),
            description: compose(
                settings,
                "Ask a fresh, stateless copy of yourself, in your own folder. Useful for \
                 side questions that should not pollute the conversation.",
                None,
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "prompt": {"type": "string", "description": "Question for the stateless copy"},
                    "from_agent": {"type": "string", "description": "Slug of the calling agent"}
                },
                "required": ["prompt", "from_agent"]
            }),
        },
        ToolDefinition {
            name: AGENT_MESSAGE.to_string(),
            description: compose(
                settings,
                "Leave a message in another agent's inbox. Non-blocking; the recipient \
                 sees it the next time its user checks the inbox.",
                Some(&roster),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "to": {
                        "description": "Recipient slug, or an array of slugs",
                        "anyOf": [
                            {"type": "string"},
                            {"type": "array", "items": {"type": "string"}}
                        ]
                    },
                    "message": {"type": "string"},
                    "priority": {"type": "string", "enum": ["normal", "high"]},
                    "from_agent": {"type": "string", "description": "Slug of the calling agent"}
                },
                "required": ["to", "message"]
            }),
        },
        ToolDefinition {
            name: AGENT_BROADCAST.to_string(),
            description: compose(
                settings,
                "Leave a message in every available agent's inbox.",
                Some(&roster),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string"},
                    "priority": {"type": "string", "enum": ["normal", "high"]},
                    "from_agent": {"type": "string", "description": "Slug of the calling agent"}
                },
                "required": ["message"]
            }),
        },
        ToolDefinition {
            name: NOTIFY_USER.to_string(),
            description: compose(
                settings,
                "Fire a desktop notification at the user. Non-blocking.",
                None,
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "message": {"type": "string"},
                    "notification_type": {"type": "string", "enum": ["info", "success", "warning", "error"]},
                    "from_agent": {"type": "string"}
                },
                "required": ["message"]
            }),
        },
        ToolDefinition {
            name: ASK_USER_QUESTION.to_string(),
            description: compose(
                settings,
                "Ask the user one or more questions and wait for structured answers. \
                 Blocks until the user answers, skips, or the request times out.",
                None,
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "questions": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "question": {"type": "string"},
                                "options": {"type": "array", "items": {"type": "string"}},
                                "multi_select": {"type": "boolean"}
                            },
                            "required": ["question"]
                        }
                    },
                    "from_agent": {"type": "string"}
                },
                "required": ["questions"]
            }),
        },
        ToolDefinition {
            name: REQUEST_TOOL_PERMISSION.to_string(),
            description: compose(
                settings,
                "Ask the user to allow a tool invocation. Blocks for the decision; a \
                 permanent grant is persisted before this call returns.",
                None,
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tool_name": {"type": "string"},
                    "input": {"type": "object", "description": "The invocation being requested"},
                    "from_agent": {"type": "string"}
                },
                "required": ["tool_name", "from_agent"]
            }),
        },
        ToolDefinition {
            name: EXIT_PLAN_MODE.to_string(),
            description: compose(
                settings,
                "Submit the plan for review and wait for the user's verdict. Use this \
                 instead of the built-in plan exit, which does not work in this \
                 invocation mode.",
                None,
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "plan": {"type": "string", "description": "The plan, as Markdown"},
                    "from_agent": {"type": "string"}
                },
                "required": ["plan"]
            }),
        },
        ToolDefinition {
            name: BACKLOG_ADD.to_string(),
            description: compose(
                settings,
                "Add an item to your backlog.",
                None,
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "from_agent": {"type": "string", "description": "Slug of the owning agent"},
                    "title": {"type": "string"},
                    "context": {"type": "string"},
                    "status": {"type": "string", "enum": ["idea", "planned", "in_progress", "done", "parked"]},
                    "type": {"type": "string", "enum": ["bug_fix", "new_feature", "feature_expansion", "improvement", "refactor", "validation", "tech_debt", "documentation"]},
                    "tags": {"type": "string", "description": "Comma-separated tags"},
                    "parent_id": {"type": "string"}
                },
                "required": ["from_agent", "title"]
            }),
        },
        ToolDefinition {
            name: BACKLOG_UPDATE.to_string(),
            description: compose(
                settings,
                "Update a backlog item. Prefix context with `append:` to append \
                 instead of replacing.",
                None,
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "from_agent": {"type": "string"},
                    "id": {"type": "string"},
                    "title": {"type": "string"},
                    "context": {"type": "string"},
                    "status": {"type": "string", "enum": ["idea", "planned", "in_progress", "done", "parked"]},
                    "type": {"type": "string", "enum": ["bug_fix", "new_feature", "feature_expansion", "improvement", "refactor", "validation", "tech_debt", "documentation"]},
                    "tags": {"type": "string"}
                },
                "required": ["from_agent", "id"]
            }),
        },
        ToolDefinition {
            name: BACKLOG_LIST.to_string(),
            description: compose(
                settings,
                "List your backlog as XML. Item contents may include Markdown, so the \
                 envelope is XML rather than a bullet list.",
                None,
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "from_agent": {"type": "string"},
                    "status": {"type": "string", "enum": ["idea", "planned", "in_progress", "done", "parked"]}
                },
                "required": ["from_agent"]
            }),
        },
    ];

    all.into_iter()
        .filter(|tool| settings.is_enabled(&tool.name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn agents() -> Vec<AgentConfig> {
        let mut visible = AgentConfig::new("Builder", PathBuf::from("/p"));
        visible.description = Some("Owns the build".to_string());
        let mut hidden = AgentConfig::new("Scratch", PathBuf::from("/q"));
        hidden.mcp_enabled = false;
        vec![visible, hidden]
    }

    #[test]
    fn roster_lists_only_mcp_enabled_agents() {
        let settings = ToolSettings::default();
        let tools = catalog(&settings, &agents());
        let query = tools.iter().find(|t| t.name == AGENT_QUERY).unwrap();
        assert!(query.description.contains("builder (Builder): Owns the build"));
        assert!(!query.description.contains("scratch"));
    }

    #[test]
    fn instructions_prefix_every_description() {
        let settings = ToolSettings {
            instructions: "House rules apply.".to_string(),
            disabled: HashSet::new(),
        };
        let tools = catalog(&settings, &[]);
        assert!(tools
            .iter()
            .all(|t| t.description.starts_with("House rules apply.")));
    }

    #[test]
    fn disabled_tools_are_omitted_from_catalog() {
        let settings = ToolSettings {
            instructions: String::new(),
            disabled: [AGENT_QUERY.to_string()].into_iter().collect(),
        };
        let tools = catalog(&settings, &[]);
        assert!(!tools.iter().any(|t| t.name == AGENT_QUERY));
        assert!(tools.iter().any(|t| t.name == ASK_USER_QUESTION));
    }

    #[test]
    fn full_catalog_has_eleven_tools() {
        let settings = ToolSettings::default();
        assert_eq!(catalog(&settings, &[]).len(), 11);
    }
}
