use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::command::{BuildError, CommandBuilder, Invocation, Operation};
use crate::config::RuntimeConfig;
use crate::distro::{parse_listing, DistributionDetector};
use crate::exec::{ExecutionRequest, ExecutionResult, FailureReason, ProcessRunner};
use crate::tool_registry::ToolKind;

const SYSTEM_INFO_BATTERY: &[(&str, &[&str])] = &[
    ("System information", &["uname", "-a"]),
    ("OS release information", &["cat", "/etc/os-release"]),
    ("Current user", &["whoami"]),
    ("Current directory", &["pwd"]),
    ("Disk usage", &["df", "-h"]),
    ("Memory usage", &["free", "-h"]),
    ("System uptime", &["uptime"]),
    ("Kernel version", &["cat", "/proc/version"]),
];
const CONNECTION_CHECK: &[&str] = &["echo", "connection test successful"];
const OS_RELEASE_CHECK: &[&str] = &["cat", "/etc/os-release"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorCode {
    UnknownTool,
    InvalidArguments,
    NoTargetEnvironment,
}

impl DispatchErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownTool => "unknown_tool",
            Self::InvalidArguments => "invalid_arguments",
            Self::NoTargetEnvironment => "no_target_environment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DispatchError {
    pub code: DispatchErrorCode,
    pub message: String,
}

impl DispatchError {
    fn new(code: DispatchErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(DispatchErrorCode::InvalidArguments, message)
    }
}

impl From<BuildError> for DispatchError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::EmptyTarget => {
                Self::new(DispatchErrorCode::NoTargetEnvironment, err.to_string())
            }
            BuildError::StrictRejected { .. } => Self::invalid(err.to_string()),
        }
    }
}

type DispatchResult<T> = Result<T, DispatchError>;

/// The uniform result of one tool call. `success=false` is an ordinary
/// value; only dispatch-level problems become a [`DispatchError`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponseEnvelope {
    pub success: bool,
    #[serde(flatten)]
    pub arguments: Map<String, Value>,
    pub target_environment: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub timestamp: String,
}

impl ToolResponseEnvelope {
    fn new(target_environment: &str, arguments: Map<String, Value>) -> Self {
        Self {
            success: true,
            arguments,
            target_environment: target_environment.to_owned(),
            payload: Map::new(),
            error: None,
            failure_reason: None,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.payload.insert(key.to_owned(), value.into());
    }

    fn fail(&mut self, error: impl Into<String>, reason: Option<FailureReason>) {
        self.success = false;
        self.error = Some(error.into());
        self.failure_reason = reason;
    }

    fn absorb_result(&mut self, result: &ExecutionResult, stdout_key: &str) {
        self.insert(stdout_key, result.stdout.clone());
        self.insert("stderr", result.stderr.clone());
        self.insert("exitCode", json!(result.exit_code));
        self.insert("durationMs", result.duration_ms);
        if let Some(message) = result.error_message() {
            self.fail(message, result.failure_reason);
        }
    }

    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|err| {
            json!({
                "success": false,
                "error": format!("failed serializing tool response: {err}"),
                "timestamp": self.timestamp,
            })
            .to_string()
        })
    }
}

pub struct ToolDispatcher {
    config: Arc<RuntimeConfig>,
    builder: CommandBuilder,
    runner: Arc<dyn ProcessRunner>,
    detector: DistributionDetector,
}

impl ToolDispatcher {
    pub fn new(
        config: Arc<RuntimeConfig>,
        runner: Arc<dyn ProcessRunner>,
        detector: DistributionDetector,
    ) -> Self {
        let builder = CommandBuilder::new(config.bridge_program.clone(), config.quoting_mode);
        Self {
            config,
            builder,
            runner,
            detector,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub async fn dispatch(
        &self,
        name: &str,
        arguments: &Value,
    ) -> DispatchResult<ToolResponseEnvelope> {
        let Some(tool) = ToolKind::resolve(name) else {
            return Err(DispatchError::new(
                DispatchErrorCode::UnknownTool,
                format!("unknown tool `{name}`"),
            ));
        };
        let args = match arguments {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            _ => return Err(DispatchError::invalid("arguments must be a JSON object")),
        };
        if self.config.target_environment.trim().is_empty() {
            return Err(DispatchError::new(
                DispatchErrorCode::NoTargetEnvironment,
                "no target Linux environment resolved",
            ));
        }
        debug!(tool = tool.name(), "dispatching tool call");

        match tool {
            ToolKind::ExecuteCommand => self.execute_command(&args).await,
            ToolKind::ExecuteScript => self.execute_script(&args).await,
            ToolKind::CreateScript => self.create_script(&args).await,
            ToolKind::ListDirectory => self.list_directory(&args).await,
            ToolKind::GetSystemInfo => Ok(self.system_info().await),
            ToolKind::CheckEnvironmentStatus => Ok(self.environment_status().await),
        }
    }

    async fn execute_command(
        &self,
        args: &Map<String, Value>,
    ) -> DispatchResult<ToolResponseEnvelope> {
        let command = required_string_arg(args, "command")?;
        if command.trim().is_empty() {
            return Err(DispatchError::invalid("`command` must not be empty"));
        }
        let working_directory = optional_string_arg(args, "workingDirectory")?
            .unwrap_or_else(|| ".".to_owned());
        let timeout_ms = optional_timeout_arg(args)?.unwrap_or(self.config.default_timeout_ms);

        let steps = self.builder.build(
            Operation::RunCommand {
                command: &command,
                working_directory: &working_directory,
            },
            &self.config.target_environment,
        )?;

        let mut envelope = self.envelope(json!({
            "command": command,
            "workingDirectory": working_directory,
            "timeout": timeout_ms,
        }));
        let result = self.run_steps(ToolKind::ExecuteCommand, steps, timeout_ms).await;
        envelope.absorb_result(&result, "stdout");
        Ok(envelope)
    }

    async fn execute_script(
        &self,
        args: &Map<String, Value>,
    ) -> DispatchResult<ToolResponseEnvelope> {
        let script_path = required_string_arg(args, "scriptPath")?;
        if script_path.trim().is_empty() {
            return Err(DispatchError::invalid("`scriptPath` must not be empty"));
        }
        let script_args = optional_string_list_arg(args, "args")?;
        let working_directory = optional_string_arg(args, "workingDirectory")?
            .unwrap_or_else(|| ".".to_owned());
        let timeout_ms = optional_timeout_arg(args)?.unwrap_or(self.config.script_timeout_ms);

        let steps = self.builder.build(
            Operation::RunScript {
                script_path: &script_path,
                args: &script_args,
                working_directory: &working_directory,
            },
            &self.config.target_environment,
        )?;

        let mut envelope = self.envelope(json!({
            "scriptPath": script_path,
            "args": script_args,
            "workingDirectory": working_directory,
            "timeout": timeout_ms,
        }));
        let result = self.run_steps(ToolKind::ExecuteScript, steps, timeout_ms).await;
        envelope.absorb_result(&result, "stdout");
        Ok(envelope)
    }

    async fn create_script(
        &self,
        args: &Map<String, Value>,
    ) -> DispatchResult<ToolResponseEnvelope> {
        let script_path = required_string_arg(args, "scriptPath")?;
        if script_path.trim().is_empty() {
            return Err(DispatchError::invalid("`scriptPath` must not be empty"));
        }
        let content = required_string_arg(args, "content")?;
        if content.is_empty() {
            return Err(DispatchError::invalid("`content` must not be empty"));
        }
        let executable = optional_bool_arg(args, "executable")?.unwrap_or(true);

        let steps = self.builder.build(
            Operation::CreateScript {
                script_path: &script_path,
                content: &content,
                executable,
            },
            &self.config.target_environment,
        )?;

        let mut envelope = self.envelope(json!({
            "scriptPath": script_path,
            "executable": executable,
        }));
        let result = self
            .run_steps(ToolKind::CreateScript, steps, self.config.default_timeout_ms)
            .await;
        match result.error_message() {
            Some(message) => {
                envelope.insert("stderr", result.stderr.clone());
                envelope.fail(message, result.failure_reason);
            }
            None => envelope.insert("message", "Script created successfully"),
        }
        Ok(envelope)
    }

    async fn list_directory(
        &self,
        args: &Map<String, Value>,
    ) -> DispatchResult<ToolResponseEnvelope> {
        let path = optional_string_arg(args, "path")?
            .filter(|path| !path.trim().is_empty())
            .unwrap_or_else(|| ".".to_owned());
        let detailed = optional_bool_arg(args, "detailed")?.unwrap_or(false);

        let steps = self.builder.build(
            Operation::ListDirectory {
                path: &path,
                detailed,
            },
            &self.config.target_environment,
        )?;

        let mut envelope = self.envelope(json!({
            "path": path,
            "detailed": detailed,
        }));
        let result = self
            .run_steps(ToolKind::ListDirectory, steps, self.config.default_timeout_ms)
            .await;
        envelope.absorb_result(&result, "listing");
        Ok(envelope)
    }

    /// Runs the whole battery concurrently; each command's failure is
    /// reported in its own entry.
    async fn system_info(&self) -> ToolResponseEnvelope {
        let runs = SYSTEM_INFO_BATTERY.iter().map(|(label, argv)| async move {
            let outcome = match self.builder.direct(&self.config.target_environment, argv) {
                Ok(invocation) => Ok(self
                    .run_one(
                        ToolKind::GetSystemInfo,
                        invocation,
                        self.config.default_timeout_ms,
                    )
                    .await),
                Err(err) => Err(err),
            };
            (*label, argv.join(" "), outcome)
        });
        let outcomes = join_all(runs).await;

        let mut envelope = self.envelope(json!({}));
        let mut info = Map::new();
        let mut succeeded = 0usize;
        for (label, command, outcome) in outcomes {
            let entry = match outcome {
                Ok(result) if result.is_success() => {
                    succeeded += 1;
                    json!({ "command": command, "output": result.stdout.trim() })
                }
                Ok(result) => json!({
                    "command": command,
                    "error": result.error_message(),
                    "failureReason": result.failure_reason,
                    "stderr": result.stderr.trim(),
                }),
                Err(err) => json!({ "command": command, "error": err.to_string() }),
            };
            info.insert(label.to_owned(), entry);
        }
        envelope.insert("systemInfo", Value::Object(info));
        if succeeded == 0 {
            envelope.fail("every system information command failed", None);
        }
        envelope
    }

    async fn environment_status(&self) -> ToolResponseEnvelope {
        let target = self.config.target_environment.as_str();
        let mut envelope = self.envelope(json!({}));
        envelope.insert(
            "serverConfig",
            json!({
                "configuredTarget": self.config.configured_target,
                "targetSource": self.config.target_source.as_str(),
                "defaultTimeoutMs": self.config.default_timeout_ms,
                "scriptTimeoutMs": self.config.script_timeout_ms,
                "maxOutputBytes": self.config.max_output_bytes,
                "maxConcurrentProcesses": self.config.max_concurrent_processes,
                "quotingMode": self.config.quoting_mode.as_str(),
                "debugMode": self.config.debug_mode,
                "bridgeProgram": self.config.bridge_program,
            }),
        );

        match self.detector.raw_listing().await {
            Ok(raw) => {
                let environments = parse_listing(raw.as_bytes());
                let running = environments
                    .iter()
                    .find(|env| env.name.eq_ignore_ascii_case(target))
                    .map(|env| env.running);
                envelope.insert("environmentStatus", "Running");
                envelope.insert("targetRunning", json!(running));
                envelope.insert("allEnvironments", raw);
                envelope.insert("environments", json!(environments));
            }
            Err(err) => {
                envelope.insert("environmentStatus", "Error");
                envelope.fail(err.to_string(), None);
            }
        }

        let (connection, os_info) = tokio::join!(
            self.quick_check(CONNECTION_CHECK),
            self.quick_check(OS_RELEASE_CHECK)
        );
        envelope.insert(
            "connectionTest",
            connection.unwrap_or_else(|message| format!("Test failed: {message}")),
        );
        envelope.insert(
            "osInfo",
            os_info.unwrap_or_else(|message| format!("OS info not available: {message}")),
        );
        envelope
    }

    async fn quick_check(&self, argv: &[&str]) -> Result<String, String> {
        let invocation = self
            .builder
            .direct(&self.config.target_environment, argv)
            .map_err(|err| err.to_string())?;
        let result = self
            .run_one(
                ToolKind::CheckEnvironmentStatus,
                invocation,
                self.config.default_timeout_ms,
            )
            .await;
        match result.error_message() {
            Some(message) => Err(message),
            None => Ok(result.stdout.trim().to_owned()),
        }
    }

    /// Runs the steps in order and stops at the first failure.
    async fn run_steps(
        &self,
        tool: ToolKind,
        steps: Vec<Invocation>,
        timeout_ms: u64,
    ) -> ExecutionResult {
        let mut last = ExecutionResult::launch_failed("no invocation built");
        for invocation in steps {
            last = self.run_one(tool, invocation, timeout_ms).await;
            if !last.is_success() {
                break;
            }
        }
        last
    }

    async fn run_one(
        &self,
        tool: ToolKind,
        invocation: Invocation,
        timeout_ms: u64,
    ) -> ExecutionResult {
        if self.config.debug_mode {
            info!(tool = tool.name(), timeout_ms, "invoking: {}", invocation.render());
        } else {
            debug!(tool = tool.name(), timeout_ms, "invoking: {}", invocation.render());
        }
        let result = self
            .runner
            .run(ExecutionRequest {
                invocation,
                timeout_ms,
                max_output_bytes: self.config.max_output_bytes,
            })
            .await;
        if let Some(reason) = result.failure_reason {
            debug!(
                tool = tool.name(),
                reason = reason.as_str(),
                "invocation failed: {}",
                result.error_message().unwrap_or_default()
            );
        }
        result
    }

    fn envelope(&self, arguments: Value) -> ToolResponseEnvelope {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        ToolResponseEnvelope::new(&self.config.target_environment, arguments)
    }
}

fn required_string_arg(args: &Map<String, Value>, key: &str) -> DispatchResult<String> {
    match args.get(key) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(Value::Null) | None => Err(DispatchError::invalid(format!("`{key}` is required"))),
        Some(_) => Err(DispatchError::invalid(format!("`{key}` must be a string"))),
    }
}

fn optional_string_arg(args: &Map<String, Value>, key: &str) -> DispatchResult<Option<String>> {
    match args.get(key) {
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(DispatchError::invalid(format!("`{key}` must be a string"))),
    }
}

fn optional_bool_arg(args: &Map<String, Value>, key: &str) -> DispatchResult<Option<bool>> {
    match args.get(key) {
        Some(Value::Bool(value)) => Ok(Some(*value)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(DispatchError::invalid(format!("`{key}` must be a boolean"))),
    }
}

fn optional_string_list_arg(args: &Map<String, Value>, key: &str) -> DispatchResult<Vec<String>> {
    match args.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_owned).ok_or_else(|| {
                    DispatchError::invalid(format!("`{key}` must contain only strings"))
                })
            })
            .collect(),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(_) => Err(DispatchError::invalid(format!(
            "`{key}` must be an array of strings"
        ))),
    }
}

fn optional_timeout_arg(args: &Map<String, Value>) -> DispatchResult<Option<u64>> {
    let Some(value) = args.get("timeout").filter(|value| !value.is_null()) else {
        return Ok(None);
    };
    value
        .as_u64()
        .filter(|ms| *ms > 0)
        .or_else(|| {
            value
                .as_f64()
                .filter(|ms| ms.is_finite() && *ms >= 1.0)
                .map(|ms| ms as u64)
        })
        .map(Some)
        .ok_or_else(|| DispatchError::invalid("`timeout` must be a positive number of milliseconds"))
}
