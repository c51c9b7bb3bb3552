//! Gateway-management tools served under the `mcpmu.` prefix

use serde_json::{json, Value};

use crate::protocol::Tool;
use crate::server::{GatewayHandler, RouterError};

/// Result of a manager-tool dispatch, with a flag for tools that change the
/// exported tool view (the facade follows up with `tools/list_changed`).
pub(crate) struct ManagerOutcome {
    pub result: Result<Value, RouterError>,
    pub view_changed: bool,
}

impl ManagerOutcome {
    fn plain(result: Result<Value, RouterError>) -> Self {
        Self {
            result,
            view_changed: false,
        }
    }

    fn view(result: Result<Value, RouterError>) -> Self {
        let view_changed = result.is_ok();
        Self {
            result,
            view_changed,
        }
    }
}

/// Definitions of the manager tools, unqualified names prefixed `mcpmu.`.
pub fn manager_tools() -> Vec<Tool> {
    vec![
        Tool::new(
            "mcpmu.servers_list",
            "List configured downstream servers with their lifecycle state",
            json!({"type": "object", "properties": {}}),
        ),
        Tool::new(
            "mcpmu.server_start",
            "Start a configured downstream server",
            json!({
                "type": "object",
                "properties": {"name": {"type": "string", "description": "Server name"}},
                "required": ["name"]
            }),
        ),
        Tool::new(
            "mcpmu.server_stop",
            "Stop a running downstream server",
            json!({
                "type": "object",
                "properties": {"name": {"type": "string", "description": "Server name"}},
                "required": ["name"]
            }),
        ),
        Tool::new(
            "mcpmu.namespace_set",
            "Switch the active namespace",
            json!({
                "type": "object",
                "properties": {"name": {"type": "string", "description": "Namespace name"}},
                "required": ["name"]
            }),
        ),
        Tool::new(
            "mcpmu.permission_set",
            "Allow or deny one tool in a namespace",
            json!({
                "type": "object",
                "properties": {
                    "namespace": {"type": "string", "description": "Namespace; defaults to the active one"},
                    "server": {"type": "string", "description": "Server exporting the tool"},
                    "tool": {"type": "string", "description": "Unqualified tool name"},
                    "enabled": {"type": "boolean", "description": "true to allow, false to deny"}
                },
                "required": ["server", "tool", "enabled"]
            }),
        ),
    ]
}

/// Dispatch a manager tool by its unqualified name.
pub(crate) async fn dispatch<H: GatewayHandler>(
    handler: &H,
    tool: &str,
    arguments: Option<Value>,
) -> ManagerOutcome {
    let args = arguments.unwrap_or_else(|| json!({}));
    match tool {
        "servers_list" => ManagerOutcome::plain(handler.servers_list().await),
        "server_start" => match required_str(&args, "name") {
            Ok(name) => ManagerOutcome::view(handler.server_start(name).await),
            Err(err) => ManagerOutcome::plain(Err(err)),
        },
        "server_stop" => match required_str(&args, "name") {
            Ok(name) => ManagerOutcome::view(handler.server_stop(name).await),
            Err(err) => ManagerOutcome::plain(Err(err)),
        },
        "namespace_set" => match required_str(&args, "name") {
            Ok(name) => ManagerOutcome::view(handler.namespace_set(name).await),
            Err(err) => ManagerOutcome::plain(Err(err)),
        },
        "permission_set" => {
            let server = required_str(&args, "server");
            let tool_name = required_str(&args, "tool");
            let enabled = args.get("enabled").and_then(Value::as_bool);
            match (server, tool_name, enabled) {
                (Ok(server), Ok(tool_name), Some(enabled)) => {
                    let namespace = args.get("namespace").and_then(Value::as_str);
                    ManagerOutcome::view(
                        handler
                            .permission_set(namespace, server, tool_name, enabled)
                            .await,
                    )
                }
                (Err(err), _, _) | (_, Err(err), _) => ManagerOutcome::plain(Err(err)),
                (_, _, None) => ManagerOutcome::plain(Err(RouterError::InvalidParams(
                    "'enabled' boolean is required".to_string(),
                ))),
            }
        }
        other => ManagerOutcome::plain(Err(RouterError::NotFound(format!(
            "unknown manager tool: mcpmu.{other}"
        )))),
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, RouterError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RouterError::InvalidParams(format!("'{key}' string is required")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::MANAGER_TOOL_PREFIX;

    #[test]
    fn all_manager_tools_carry_the_reserved_prefix() {
        for tool in manager_tools() {
            assert!(
                tool.name.starts_with(MANAGER_TOOL_PREFIX),
                "{} lacks prefix",
                tool.name
            );
            assert!(tool.input_schema.is_object());
        }
    }
}
