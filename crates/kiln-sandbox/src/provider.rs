//! Sandbox handle and provider abstractions

use async_trait::async_trait;
use kiln_core::Result;
use std::sync::Arc;

/// Output from a sandbox command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Callback receiving streamed command output chunks
pub type OutputCallback<'a> = &'a mut (dyn FnMut(&str) + Send);

/// A connected remote execution environment
///
/// Command output is delivered to the callbacks as it arrives, so a caller
/// keeps whatever was produced even when the command later fails.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    /// Platform identifier of this sandbox
    fn id(&self) -> &str;

    /// Run a shell command
    ///
    /// A non-zero exit is an error; its output has already reached the callbacks.
    async fn run_command(
        &self,
        command: &str,
        on_stdout: OutputCallback<'_>,
        on_stderr: OutputCallback<'_>,
    ) -> Result<CommandOutput>;

    /// Create or overwrite a file
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    /// Read a file as text
    async fn read_file(&self, path: &str) -> Result<String>;

    /// Public host name serving `port`
    async fn host_for(&self, port: u16) -> Result<String>;
}

/// Resolves and creates sandboxes
///
/// Both operations extend the sandbox's idle timeout. Callers wrap them in the
/// throttled invoker since creation is subject to provider rate limits.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Create a new sandbox from a template
    async fn create(&self, template: &str) -> Result<Arc<dyn SandboxHandle>>;

    /// Connect to an existing sandbox by id
    async fn acquire(&self, id: &str) -> Result<Arc<dyn SandboxHandle>>;
}
