use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    ExecuteCommand,
    ExecuteScript,
    CreateScript,
    ListDirectory,
    GetSystemInfo,
    CheckEnvironmentStatus,
}

impl ToolKind {
    pub const ALL: [ToolKind; 6] = [
        ToolKind::ExecuteCommand,
        ToolKind::ExecuteScript,
        ToolKind::CreateScript,
        ToolKind::ListDirectory,
        ToolKind::GetSystemInfo,
        ToolKind::CheckEnvironmentStatus,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ExecuteCommand => "execute-command",
            Self::ExecuteScript => "execute-script",
            Self::CreateScript => "create-script",
            Self::ListDirectory => "list-directory",
            Self::GetSystemInfo => "get-system-info",
            Self::CheckEnvironmentStatus => "check-environment-status",
        }
    }

    /// Accepts canonical names in any case or separator style, plus the
    /// legacy `*_bash_*` and `check_wsl_status` names.
    pub fn resolve(raw: &str) -> Option<Self> {
        let normalized = normalize_name(raw);
        match normalized.as_str() {
            "execute-command" | "execute-bash-command" => Some(Self::ExecuteCommand),
            "execute-script" | "execute-bash-script" => Some(Self::ExecuteScript),
            "create-script" | "create-bash-script" => Some(Self::CreateScript),
            "list-directory" => Some(Self::ListDirectory),
            "get-system-info" => Some(Self::GetSystemInfo),
            "check-environment-status" | "check-wsl-status" => {
                Some(Self::CheckEnvironmentStatus)
            }
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::ExecuteCommand => "Execute a bash command in the WSL Linux environment",
            Self::ExecuteScript => "Execute a bash script file in the WSL Linux environment",
            Self::CreateScript => "Create a bash script file with the specified content",
            Self::ListDirectory => "List contents of a directory in the WSL Linux environment",
            Self::GetSystemInfo => "Get system information about the WSL Linux environment",
            Self::CheckEnvironmentStatus => {
                "Check WSL status and get information about the target distribution"
            }
        }
    }

    pub fn input_schema(self) -> Value {
        match self {
            Self::ExecuteCommand => json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The bash command to execute"
                    },
                    "workingDirectory": {
                        "type": "string",
                        "description": "Working directory for the command (defaults to the current directory)"
                    },
                    "timeout": {
                        "type": "number",
                        "description": "Timeout in milliseconds (defaults to the configured command timeout)"
                    }
                },
                "required": ["command"]
            }),
            Self::ExecuteScript => json!({
                "type": "object",
                "properties": {
                    "scriptPath": {
                        "type": "string",
                        "description": "Path to the bash script file"
                    },
                    "args": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Arguments to pass to the script"
                    },
                    "workingDirectory": {
                        "type": "string",
                        "description": "Working directory for the script"
                    },
                    "timeout": {
                        "type": "number",
                        "description": "Timeout in milliseconds (defaults to the configured script timeout)"
                    }
                },
                "required": ["scriptPath"]
            }),
            Self::CreateScript => json!({
                "type": "object",
                "properties": {
                    "scriptPath": {
                        "type": "string",
                        "description": "Path where the script file is created"
                    },
                    "content": {
                        "type": "string",
                        "description": "Content of the bash script"
                    },
                    "executable": {
                        "type": "boolean",
                        "description": "Make the script executable",
                        "default": true
                    }
                },
                "required": ["scriptPath", "content"]
            }),
            Self::ListDirectory => json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory path to list",
                        "default": "."
                    },
                    "detailed": {
                        "type": "boolean",
                        "description": "Show detailed information (ls -la)",
                        "default": false
                    }
                }
            }),
            Self::GetSystemInfo | Self::CheckEnvironmentStatus => json!({
                "type": "object",
                "properties": {}
            }),
        }
    }
}

/// Tool descriptors in the shape `tools/list` returns them.
pub fn list_tools() -> Vec<Value> {
    ToolKind::ALL
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name(),
                "description": tool.description(),
                "inputSchema": tool.input_schema(),
            })
        })
        .collect()
}

fn normalize_name(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace(['_', ' '], "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_canonical_snake_case_and_legacy_names() {
        assert_eq!(
            ToolKind::resolve("execute-command"),
            Some(ToolKind::ExecuteCommand)
        );
        assert_eq!(
            ToolKind::resolve("execute_bash_command"),
            Some(ToolKind::ExecuteCommand)
        );
        assert_eq!(
            ToolKind::resolve(" Check_WSL_Status "),
            Some(ToolKind::CheckEnvironmentStatus)
        );
        assert_eq!(ToolKind::resolve("list_directory"), Some(ToolKind::ListDirectory));
        assert_eq!(ToolKind::resolve("frobnicate"), None);
        assert_eq!(ToolKind::resolve(""), None);
    }

    #[test]
    fn every_tool_round_trips_through_its_name() {
        for tool in ToolKind::ALL {
            assert_eq!(ToolKind::resolve(tool.name()), Some(tool));
        }
    }

    #[test]
    fn listed_schemas_declare_required_arguments() {
        let tools = list_tools();
        assert_eq!(tools.len(), 6);
        let create = tools
            .iter()
            .find(|tool| tool["name"] == "create-script")
            .expect("create-script listed");
        assert_eq!(
            create["inputSchema"]["required"],
            json!(["scriptPath", "content"])
        );
        let list = tools
            .iter()
            .find(|tool| tool["name"] == "list-directory")
            .expect("list-directory listed");
        assert!(list["inputSchema"].get("required").is_none());
    }
}
