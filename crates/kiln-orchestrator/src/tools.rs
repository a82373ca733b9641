//! Agent-invocable tools bound to a sandbox
//!
//! Three tools, dispatched by name through a fixed lookup table:
//! - `terminal` runs a shell command
//! - `createOrUpdateFiles` writes files and records them in `RunState.files`
//! - `readFiles` reads files and caches them in `RunState.read_files`
//!
//! Each call reconnects to the sandbox through the provider, which extends its
//! idle timeout for as long as the agent keeps working.
//!
//! Tool failures are returned to the agent as data, never as `Err`. The agent
//! decides whether to retry.

use futures::future::BoxFuture;
use kiln_agent::{ToolCall, ToolDefinition};
use kiln_core::{FileMap, RunState};
use kiln_sandbox::{SandboxHandle, SandboxProvider};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// The closed set of tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Terminal,
    WriteFiles,
    ReadFiles,
}

impl ToolKind {
    pub const ALL: [ToolKind; 3] = [ToolKind::Terminal, ToolKind::WriteFiles, ToolKind::ReadFiles];

    /// Name the model calls the tool by
    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::Terminal => "terminal",
            ToolKind::WriteFiles => "createOrUpdateFiles",
            ToolKind::ReadFiles => "readFiles",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Definition advertised to the model
    pub fn definition(&self) -> ToolDefinition {
        let (description, parameters) = match self {
            ToolKind::Terminal => (
                "Run a terminal command in the sandbox",
                json!({
                    "type": "object",
                    "properties": { "command": { "type": "string" } },
                    "required": ["command"]
                }),
            ),
            ToolKind::WriteFiles => (
                "Create or update files in the sandbox",
                json!({
                    "type": "object",
                    "properties": {
                        "files": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "path": { "type": "string" },
                                    "content": { "type": "string" }
                                },
                                "required": ["path", "content"]
                            }
                        }
                    },
                    "required": ["files"]
                }),
            ),
            ToolKind::ReadFiles => (
                "Read files from the sandbox",
                json!({
                    "type": "object",
                    "properties": {
                        "files": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["files"]
                }),
            ),
        };

        ToolDefinition {
            name: self.name().to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// Result of one tool invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// JSON payload fed back to the agent
    pub payload: Value,
    /// Whether the payload is an error marker
    pub failed: bool,
}

impl ToolOutput {
    fn success(payload: Value) -> Self {
        Self {
            payload,
            failed: false,
        }
    }

    fn failure(payload: Value) -> Self {
        Self {
            payload,
            failed: true,
        }
    }

    /// Payload as text for the tool-result message
    pub fn to_message_content(&self) -> String {
        self.payload.to_string()
    }
}

/// One entry of a `createOrUpdateFiles` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct TerminalArgs {
    command: String,
}

#[derive(Debug, Deserialize)]
struct WriteFilesArgs {
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct ReadFilesArgs {
    files: Vec<String>,
}

/// Shared handler signature: `(args, RunState, SandboxHandle) -> result`
type ToolHandler =
    for<'a> fn(Value, &'a mut RunState, &'a dyn SandboxHandle) -> BoxFuture<'a, ToolOutput>;

const HANDLERS: [(ToolKind, ToolHandler); 3] = [
    (ToolKind::Terminal, terminal),
    (ToolKind::WriteFiles, create_or_update_files),
    (ToolKind::ReadFiles, read_files),
];

fn handler_for(name: &str) -> Option<ToolHandler> {
    let kind = ToolKind::from_name(name)?;
    HANDLERS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, handler)| *handler)
}

fn parse_args<T: DeserializeOwned>(kind: ToolKind, args: Value) -> Result<T, ToolOutput> {
    serde_json::from_value(args).map_err(|e| {
        ToolOutput::failure(json!({
            "error": format!("Error: invalid arguments for {}: {}", kind.name(), e)
        }))
    })
}

fn terminal<'a>(
    args: Value,
    _state: &'a mut RunState,
    sandbox: &'a dyn SandboxHandle,
) -> BoxFuture<'a, ToolOutput> {
    Box::pin(async move {
        let args: TerminalArgs = match parse_args(ToolKind::Terminal, args) {
            Ok(args) => args,
            Err(output) => return output,
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        let result = sandbox
            .run_command(
                &args.command,
                &mut |chunk: &str| stdout.push_str(chunk),
                &mut |chunk: &str| stderr.push_str(chunk),
            )
            .await;

        match result {
            Ok(_) => ToolOutput::success(json!({ "stdout": stdout, "stderr": stderr })),
            Err(e) => {
                debug!("Command failed: {}", e);
                ToolOutput::failure(json!({
                    "error": e.to_string(),
                    "stdout": stdout,
                    "stderr": stderr,
                }))
            }
        }
    })
}

/// Writes entries in order. Entries written before a failure are still merged
/// into `RunState.files`, so the state matches what the sandbox holds.
fn create_or_update_files<'a>(
    args: Value,
    state: &'a mut RunState,
    sandbox: &'a dyn SandboxHandle,
) -> BoxFuture<'a, ToolOutput> {
    Box::pin(async move {
        let args: WriteFilesArgs = match parse_args(ToolKind::WriteFiles, args) {
            Ok(args) => args,
            Err(output) => return output,
        };

        let mut written = FileMap::new();
        for file in args.files {
            if let Err(e) = sandbox.write_file(&file.path, &file.content).await {
                warn!("Write of {} failed after {} file(s)", file.path, written.len());
                let written_paths: Vec<String> = written.keys().cloned().collect();
                state.merge_files(written);
                return ToolOutput::failure(json!({
                    "error": format!("Error: {}", e),
                    "written": written_paths,
                    "failed": file.path,
                }));
            }
            written.insert(file.path, file.content);
        }

        let payload = json!(written);
        state.merge_files(written);
        ToolOutput::success(payload)
    })
}

fn read_files<'a>(
    args: Value,
    state: &'a mut RunState,
    sandbox: &'a dyn SandboxHandle,
) -> BoxFuture<'a, ToolOutput> {
    Box::pin(async move {
        let args: ReadFilesArgs = match parse_args(ToolKind::ReadFiles, args) {
            Ok(args) => args,
            Err(output) => return output,
        };

        let mut contents = FileMap::new();
        for path in args.files {
            match sandbox.read_file(&path).await {
                Ok(content) => {
                    contents.insert(path, content);
                }
                Err(e) => return ToolOutput::failure(json!({ "error": format!("Error: {}", e) })),
            }
        }

        let payload = json!(contents);
        state.read_files = contents;
        ToolOutput::success(payload)
    })
}

/// Tools bound to one job's sandbox
#[derive(Clone)]
pub struct ToolSet {
    sandboxes: Arc<dyn SandboxProvider>,
    sandbox_id: String,
}

impl ToolSet {
    pub fn new(sandboxes: Arc<dyn SandboxProvider>, sandbox_id: impl Into<String>) -> Self {
        Self {
            sandboxes,
            sandbox_id: sandbox_id.into(),
        }
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// Definitions of every tool, for the LLM request
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        ToolKind::ALL.iter().map(ToolKind::definition).collect()
    }

    /// Execute one tool call against the run state
    pub async fn dispatch(&self, call: &ToolCall, state: &mut RunState) -> ToolOutput {
        let Some(handler) = handler_for(&call.name) else {
            warn!("Agent called unknown tool {}", call.name);
            return ToolOutput::failure(json!({ "error": format!("Unknown tool: {}", call.name) }));
        };

        let sandbox = match self.sandboxes.acquire(&self.sandbox_id).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                warn!("Sandbox {} unavailable for {}: {}", self.sandbox_id, call.name, e);
                return ToolOutput::failure(json!({ "error": format!("Error: {}", e) }));
            }
        };

        debug!("Dispatching tool {}", call.name);
        handler(call.arguments.clone(), state, sandbox.as_ref()).await
    }
}
