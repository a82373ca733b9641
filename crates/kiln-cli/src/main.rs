//! Kiln CLI - run agent jobs against a project's conversation
//!
//! Usage:
//!   kiln init [dir]                      Write default configuration
//!   kiln run --project <id> <input>      Record a prompt and run a job
//!   kiln trigger <event.json>            Run a job from a trigger event
//!   kiln history --project <id>          Show a project's conversation

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kiln_core::{JobEvent, JobOutcome, JobRequest, KilnConfig, Message, NewMessage, TaskKind};
use kiln_orchestrator::{ConversationStore, FileConversationStore, JobRunner};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Sandboxed coding agent jobs")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding `.kiln/` (config and conversations)
    #[arg(long, global = true, default_value = ".")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default `.kiln/config.toml`
    Init {
        /// Target directory (defaults to the data directory)
        path: Option<PathBuf>,
    },

    /// Record a user prompt and run a job for it
    Run {
        /// Project identifier
        #[arg(short, long)]
        project: String,

        /// Job kind
        #[arg(short, long, default_value = "code")]
        kind: CliTaskKind,

        /// Update this message instead of creating a new one
        #[arg(long)]
        prior_message: Option<String>,

        /// The prompt
        input: String,
    },

    /// Run a job from a serialized trigger event
    Trigger {
        /// JSON file with `{"name": .., "data": {"projectId": .., "value": ..}}`
        event: PathBuf,
    },

    /// Show a project's conversation
    History {
        /// Project identifier
        #[arg(short, long)]
        project: String,
    },
}

/// CLI-friendly task kind
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliTaskKind {
    Code,
    Qa,
    Search,
}

impl From<CliTaskKind> for TaskKind {
    fn from(k: CliTaskKind) -> Self {
        match k {
            CliTaskKind::Code => TaskKind::Code,
            CliTaskKind::Qa => TaskKind::Qa,
            CliTaskKind::Search => TaskKind::Search,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { path } => cmd_init(path.unwrap_or(cli.data_dir)),
        Commands::Run {
            project,
            kind,
            prior_message,
            input,
        } => cmd_run(&cli.data_dir, project, kind.into(), prior_message, input).await,
        Commands::Trigger { event } => cmd_trigger(&cli.data_dir, event).await,
        Commands::History { project } => cmd_history(&cli.data_dir, project).await,
    }
}

fn cmd_init(path: PathBuf) -> Result<()> {
    info!("Initializing Kiln in {:?}", path);
    KilnConfig::write_default(&path).context("Failed to write default config")?;

    println!("Initialized Kiln in {:?}", path);
    println!("Created:");
    println!("  .kiln/config.toml");
    println!("\nNext steps:");
    println!("  1. Export OPENAI_API_KEY and E2B_API_KEY");
    println!("  2. Run 'kiln run --project <id> \"<prompt>\"'");
    Ok(())
}

fn runner(data_dir: &Path) -> Result<JobRunner> {
    let config = KilnConfig::load_or_default(data_dir).context("Failed to load config")?;
    JobRunner::connect(config, data_dir).context("Failed to connect job collaborators")
}

async fn cmd_run(
    data_dir: &Path,
    project: String,
    kind: TaskKind,
    prior_message: Option<String>,
    input: String,
) -> Result<()> {
    let runner = runner(data_dir)?;

    let prompt = runner
        .store()
        .create_message(NewMessage::user(&project, &input))
        .await
        .context("Failed to record prompt")?;
    info!("Recorded prompt {}", prompt.id);

    let mut request = JobRequest::new(project, input);
    if let Some(id) = prior_message {
        request = request.with_prior_message(id);
    }

    let outcome = runner.run(kind, request).await?;
    print_outcome(&outcome);
    Ok(())
}

async fn cmd_trigger(data_dir: &Path, event_file: PathBuf) -> Result<()> {
    let content = tokio::fs::read_to_string(&event_file)
        .await
        .with_context(|| format!("Failed to read {:?}", event_file))?;
    let event: JobEvent =
        serde_json::from_str(&content).context("Failed to parse trigger event JSON")?;

    let runner = runner(data_dir)?;
    let outcome = runner.handle_event(&event).await?;
    print_outcome(&outcome);
    Ok(())
}

async fn cmd_history(data_dir: &Path, project: String) -> Result<()> {
    let store = FileConversationStore::new(data_dir);
    let messages = store.messages_for_project(&project).await?;

    println!("Conversation: {}", project);
    println!("=============");
    if messages.is_empty() {
        println!("  (no messages)");
    }
    for message in &messages {
        print_message(message);
    }
    Ok(())
}

fn print_message(message: &Message) {
    println!(
        "\n[{}] {} ({}) {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        message.role,
        message.message_type,
        message.id
    );
    println!("  {}", message.content);
    if let Some(fragment) = &message.fragment {
        println!("  Fragment: {}", fragment.title);
        println!("  Preview:  {}", fragment.preview_url);
        for path in fragment.files.keys() {
            println!("    - {}", path);
        }
    }
}

fn print_outcome(outcome: &JobOutcome) {
    println!("{} message {}", outcome.message_type, outcome.message_id);
    println!("{}", outcome.content);
    if let Some(fragment) = &outcome.fragment {
        println!("\nFragment: {}", fragment.title);
        println!("Preview:  {}", fragment.preview_url);
        println!("Files ({}):", fragment.files.len());
        for path in fragment.files.keys() {
            println!("  - {}", path);
        }
    }
}
