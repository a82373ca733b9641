//! Prompts and conversation rendering
//!
//! System prompts for every agent, plus helpers that turn persisted
//! conversation history into LLM input.

use kiln_agent::ChatMessage;
use kiln_core::{Message, MessageRole};

/// System prompt of the coding agent
pub const CODE_AGENT_PROMPT: &str = "\
You are a senior software engineer working in a sandboxed Next.js environment.

Environment:
- The project is already running on port 3000 with hot reload
- Use the `terminal` tool to run commands (for example `npm install <pkg> --yes`)
- Use `createOrUpdateFiles` to write files; paths are relative to the project root
- Use `readFiles` to inspect existing files before changing them
- Never run `npm run dev`, `npm run build` or `npm start`; the server is already running

Instructions:
1. Build complete, production-quality features. No placeholders or TODOs.
2. Write every file the feature needs, including styles and small components.
3. Install any package you import before using it.
4. Prefer many small tool calls to one large one.

When the task is fully done, reply with a short plain-text summary of what you built.
Only send that final reply after all tool calls are finished.";

/// System prompt of the fragment title generator
pub const TITLE_PROMPT: &str = "\
You are an assistant that generates a short, descriptive title for a code fragment based on its summary.

The title should be:
- Relevant to what was built or changed
- Max 3 words
- Written in title case (e.g., \"Landing Page\", \"Chat Widget\")
- No punctuation, quotes, or prefixes

Only return the raw title.";

/// System prompt of the user-facing response generator
pub const RESPONSE_PROMPT: &str = "\
You are the final agent in a multi-agent system.
Your job is to generate a short, user-friendly message explaining what was just built, based on the summary provided by the other agents.
The application is a custom Next.js app tailored to the user's request.
Reply in a casual tone, as if you're wrapping up the process for the user. No need to mention the summary tags.
Your message should be 1 to 3 sentences, describing what the app does or what was changed, as if you're saying \"Here's what I built for you.\"
Do not add code, tags, or metadata. Only return the plain text response.";

/// System prompt of the Q&A assistant
pub const QA_PROMPT: &str = "\
You are a helpful assistant answering questions about the user's project and about web development in general.
Answer concisely and accurately. Use short code snippets only when they make the answer clearer.";

/// Leading line of the deep-search prompt
pub const SEARCH_SYSTEM_LINE: &str = "system: You are an AI agent searching online like an expert.";

/// Input of the artifact-producing second pass
pub fn artifact_pass_input(user_input: &str) -> String {
    format!("Write the following snippet: {}", user_input)
}

fn role_label(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

/// Persisted history as chat messages, in the given order
pub fn history_to_chat(history: &[Message]) -> Vec<ChatMessage> {
    history
        .iter()
        .map(|message| match message.role {
            MessageRole::User => ChatMessage::user(message.content.as_str()),
            MessageRole::Assistant => ChatMessage::assistant(message.content.as_str()),
        })
        .collect()
}

/// Render history plus the new input as `role: content` lines
pub fn render_transcript(history: &[Message], user_input: &str) -> String {
    history
        .iter()
        .map(|m| format!("{}: {}", role_label(m.role), m.content))
        .chain(std::iter::once(format!("user: {}", user_input)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deep-search prompt: system line followed by the transcript
pub fn build_search_prompt(history: &[Message], user_input: &str) -> String {
    format!(
        "{}\n{}",
        SEARCH_SYSTEM_LINE,
        render_transcript(history, user_input)
    )
}
