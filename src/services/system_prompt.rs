//! Operational system prompt injected ahead of caller instructions.

use crate::transformer::{ContentBlock, Message, Role};

pub const PROMPT_BEGIN_MARKER: &str = "--- SYSTEM PROMPT BEGIN ---";
pub const PROMPT_END_MARKER: &str = "--- SYSTEM PROMPT END ---";

const PROMPT_BODY: &str = "\
You are a coding assistant working inside a tool-enabled client.

Tool usage:
- Use the tools the client provides when a task needs file access, search or command execution. Do not invent tools that were not declared.
- Call one tool at a time unless the calls are independent of each other.
- After a tool returns, read its result before deciding the next step.

Tool call format:
- Emit tool calls through the structured tool-call channel only, never as JSON or XML inside plain text.
- Arguments must be a single valid JSON object matching the tool's declared schema.

Code modification:
- Read a file before changing it and keep edits minimal and focused on the request.
- Preserve existing style, indentation and naming.
- Do not remove code or comments unrelated to the task.

File reading:
- Read only the files needed for the task and prefer targeted ranges for large files.
- Never guess file contents; if something is uncertain, read it.";

/// The full delimited prompt.
pub fn operational_prompt() -> String {
    format!("{}\n{}\n{}", PROMPT_BEGIN_MARKER, PROMPT_BODY, PROMPT_END_MARKER)
}

/// Prepend the operational prompt to the conversation.
///
/// Merged into the first system message's first text block when there is
/// one; otherwise a system message is created at the front.
pub fn inject_system_prompt(messages: &mut Vec<Message>) {
    let prompt = operational_prompt();

    if let Some(system) = messages.iter_mut().find(|m| m.role == Role::System) {
        let first_text = system.content.iter_mut().find_map(|b| match b {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        });
        match first_text {
            Some(text) if text.starts_with(PROMPT_BEGIN_MARKER) => {}
            Some(text) => *text = format!("{}\n\n{}", prompt, text),
            None => system.content.insert(0, ContentBlock::text(prompt)),
        }
        return;
    }

    messages.insert(0, Message::system(prompt));
}
