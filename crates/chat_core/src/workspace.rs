//! Workspace inputs that feed the context prompt.

use serde::{Deserialize, Serialize};

use crate::conversation::ConversationContext;
use crate::message::MessageContext;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRef {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ProjectRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Snapshot of what the user has open when a message is sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceContext {
    pub project: Option<ProjectRef>,
    pub files: Vec<String>,
    pub selection: Option<String>,
    /// Terminal history, oldest first
    pub terminal: Vec<String>,
}

impl WorkspaceContext {
    pub fn is_empty(&self) -> bool {
        self.project.is_none()
            && self.files.is_empty()
            && self.selection.as_deref().map_or(true, |s| s.trim().is_empty())
            && self.terminal.is_empty()
    }

    pub fn message_context(&self) -> MessageContext {
        MessageContext {
            files: non_empty(&self.files),
            terminal: non_empty(&self.terminal),
            selection: self
                .selection
                .clone()
                .filter(|selection| !selection.trim().is_empty()),
            project_path: self.project.as_ref().and_then(|p| p.path.clone()),
        }
    }

    pub fn conversation_context(&self) -> ConversationContext {
        ConversationContext {
            project_id: self.project.as_ref().map(|p| p.id.clone()),
            project_name: self.project.as_ref().map(|p| p.name.clone()),
            active_files: non_empty(&self.files),
        }
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}
