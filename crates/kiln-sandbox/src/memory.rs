//! In-memory sandbox for testing

use async_trait::async_trait;
use kiln_core::{KilnError, ProviderError, Result};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::provider::{CommandOutput, OutputCallback, SandboxHandle, SandboxProvider};

/// Canned behaviour for one command
#[derive(Debug, Clone, Default)]
pub struct ScriptedCommand {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: i32,
}

impl ScriptedCommand {
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: vec![stdout.to_string()],
            ..Default::default()
        }
    }

    pub fn failing(stdout: &str, stderr: &str, exit_code: i32) -> Self {
        Self {
            stdout: vec![stdout.to_string()],
            stderr: vec![stderr.to_string()],
            exit_code,
        }
    }
}

#[derive(Default)]
struct SandboxState {
    files: BTreeMap<String, String>,
    commands: HashMap<String, ScriptedCommand>,
    history: Vec<String>,
    failing_writes: HashSet<String>,
    failing_reads: HashSet<String>,
    host_failures: VecDeque<ProviderError>,
    idle_timeout: Option<Duration>,
}

/// Sandbox backed by an in-process file map
pub struct InMemorySandbox {
    id: String,
    domain: String,
    state: Mutex<SandboxState>,
    timeout_resets: AtomicU32,
}

impl InMemorySandbox {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: "sandbox.test".to_string(),
            state: Mutex::new(SandboxState::default()),
            timeout_resets: AtomicU32::new(0),
        }
    }

    /// Seed a file
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.lock()
            .files
            .insert(path.to_string(), content.to_string());
        self
    }

    /// Script the output of a command; unscripted commands succeed silently
    pub fn with_command(self, command: &str, output: ScriptedCommand) -> Self {
        self.lock().commands.insert(command.to_string(), output);
        self
    }

    /// Make writes to `path` fail
    pub fn with_failing_write(self, path: &str) -> Self {
        self.lock().failing_writes.insert(path.to_string());
        self
    }

    /// Make reads of `path` fail
    pub fn with_failing_read(self, path: &str) -> Self {
        self.lock().failing_reads.insert(path.to_string());
        self
    }

    /// Fail the next host resolution with this error
    pub fn with_host_failure(self, err: ProviderError) -> Self {
        self.lock().host_failures.push_back(err);
        self
    }

    /// Current content of every file
    pub fn files(&self) -> BTreeMap<String, String> {
        self.lock().files.clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    /// Commands run so far, in order
    pub fn command_history(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.lock().idle_timeout
    }

    /// How many times the idle timeout was (re)set
    pub fn timeout_resets(&self) -> u32 {
        self.timeout_resets.load(Ordering::SeqCst)
    }

    fn set_idle_timeout(&self, timeout: Duration) {
        self.lock().idle_timeout = Some(timeout);
        self.timeout_resets.fetch_add(1, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SandboxHandle for InMemorySandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run_command(
        &self,
        command: &str,
        on_stdout: OutputCallback<'_>,
        on_stderr: OutputCallback<'_>,
    ) -> Result<CommandOutput> {
        let scripted = {
            let mut state = self.lock();
            state.history.push(command.to_string());
            state.commands.get(command).cloned().unwrap_or_default()
        };

        for chunk in &scripted.stdout {
            on_stdout(chunk);
        }
        for chunk in &scripted.stderr {
            on_stderr(chunk);
        }

        if scripted.exit_code != 0 {
            return Err(KilnError::CommandExit {
                exit_code: scripted.exit_code,
            });
        }

        Ok(CommandOutput {
            stdout: scripted.stdout.concat(),
            stderr: scripted.stderr.concat(),
            exit_code: 0,
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let mut state = self.lock();
        if state.failing_writes.contains(path) {
            return Err(KilnError::Sandbox(format!("Failed to write {}", path)));
        }
        state.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let state = self.lock();
        if state.failing_reads.contains(path) {
            return Err(KilnError::Sandbox(format!("Failed to read {}", path)));
        }
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| KilnError::Sandbox(format!("File not found: {}", path)))
    }

    async fn host_for(&self, port: u16) -> Result<String> {
        if let Some(err) = self.lock().host_failures.pop_front() {
            return Err(err.into());
        }
        Ok(format!("{}-{}.{}", port, self.id, self.domain))
    }
}

/// Provider handing out in-memory sandboxes
pub struct InMemorySandboxProvider {
    sandboxes: Mutex<HashMap<String, Arc<InMemorySandbox>>>,
    template_sandbox: Mutex<Option<InMemorySandbox>>,
    create_failures: Mutex<VecDeque<ProviderError>>,
    idle_timeout: Duration,
    created: AtomicU32,
}

impl Default for InMemorySandboxProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySandboxProvider {
    pub fn new() -> Self {
        Self {
            sandboxes: Mutex::new(HashMap::new()),
            template_sandbox: Mutex::new(None),
            create_failures: Mutex::new(VecDeque::new()),
            idle_timeout: Duration::from_secs(30 * 60),
            created: AtomicU32::new(0),
        }
    }

    /// Use this sandbox for the next `create`
    pub fn with_sandbox(self, sandbox: InMemorySandbox) -> Self {
        *self
            .template_sandbox
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(sandbox);
        self
    }

    /// Fail the next `create` with this error
    pub fn with_create_failure(self, err: ProviderError) -> Self {
        self.create_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(err);
        self
    }

    /// Look up a sandbox created earlier
    pub fn sandbox(&self, id: &str) -> Option<Arc<InMemorySandbox>> {
        self.sandboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Number of successful creations
    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxProvider for InMemorySandboxProvider {
    async fn create(&self, template: &str) -> Result<Arc<dyn SandboxHandle>> {
        if let Some(err) = self
            .create_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(err.into());
        }

        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let sandbox = self
            .template_sandbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_else(|| InMemorySandbox::new(format!("{}-{}", template, n)));
        sandbox.set_idle_timeout(self.idle_timeout);

        let sandbox = Arc::new(sandbox);
        self.sandboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sandbox.id().to_string(), sandbox.clone());
        Ok(sandbox)
    }

    async fn acquire(&self, id: &str) -> Result<Arc<dyn SandboxHandle>> {
        let sandbox = self
            .sandbox(id)
            .ok_or_else(|| KilnError::Sandbox(format!("Sandbox not found: {}", id)))?;
        sandbox.set_idle_timeout(self.idle_timeout);
        Ok(sandbox)
    }
}
