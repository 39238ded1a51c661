//! Context prompt assembly.
//!
//! Builds the block of workspace state that is prepended to a user's message
//! before it is handed to an adapter. Pure and total: any combination of
//! inputs yields a string, possibly empty.

use chat_core::{ProjectRef, WorkspaceContext};

const CONTEXT_HEADER: &str = "Context:";
const MAX_TERMINAL_COMMANDS: usize = 5;

/// Build the context block for a prompt.
///
/// Returns `""` when `enabled` is false or every input is empty. Otherwise the
/// block starts with `Context:` and ends with a blank line, so the user's text
/// can be appended directly.
pub fn build_context_prompt(
    enabled: bool,
    project: Option<&ProjectRef>,
    files: &[String],
    selection: Option<&str>,
    terminal: &[String],
) -> String {
    if !enabled {
        return String::new();
    }

    let mut sections: Vec<String> = Vec::new();

    if let Some(name) = project.map(|p| p.name.trim()).filter(|n| !n.is_empty()) {
        sections.push(format!("Project: {}", name));
    }

    let files: Vec<&str> = non_blank(files).collect();
    if !files.is_empty() {
        sections.push(format!("Active Files: {}", files.join(", ")));
    }

    if let Some(selection) = selection.filter(|s| !s.trim().is_empty()) {
        let fence = fence_for(selection);
        sections.push(format!(
            "Selected Code:\n{fence}\n{}\n{fence}",
            selection.trim_end_matches('\n')
        ));
    }

    let commands: Vec<&str> = non_blank(terminal).collect();
    if !commands.is_empty() {
        let recent = &commands[commands.len().saturating_sub(MAX_TERMINAL_COMMANDS)..];
        sections.push(format!("Recent Terminal Commands: {}", recent.join(", ")));
    }

    if sections.is_empty() {
        return String::new();
    }

    format!("{}\n{}\n\n", CONTEXT_HEADER, sections.join("\n"))
}

/// [`build_context_prompt`] over a [`WorkspaceContext`].
pub fn build_workspace_prompt(enabled: bool, workspace: &WorkspaceContext) -> String {
    build_context_prompt(
        enabled,
        workspace.project.as_ref(),
        &workspace.files,
        workspace.selection.as_deref(),
        &workspace.terminal,
    )
}

/// Prefix `text` with a context block built by [`build_context_prompt`].
pub fn augment_prompt(context: &str, text: &str) -> String {
    if context.is_empty() {
        text.to_string()
    } else {
        format!("{}{}", context, text)
    }
}

fn non_blank(values: &[String]) -> impl Iterator<Item = &str> {
    values.iter().map(|v| v.trim()).filter(|v| !v.is_empty())
}

// A fence must be longer than any backtick run inside the selection.
fn fence_for(selection: &str) -> String {
    let mut longest = 0;
    let mut current = 0;
    for c in selection.chars() {
        if c == '`' {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    "`".repeat(longest.max(2) + 1)
}
