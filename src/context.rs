use serde::{Deserialize, Serialize};

pub const MAX_ATTACHMENTS: usize = 5;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are DAISY, a helpful, concise AI.
- Cite sources when using web context.
- Prefer Markdown with code fences for code.";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WebResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileItem {
    pub name: String,
    pub size: u64,
}

/// Side-panel context: search hits, attached files and the system prompt.
/// Lives only for the process; nothing here is persisted.
#[derive(Clone, Debug)]
pub struct ContextState {
    pub web_results: Vec<WebResult>,
    pub files: Vec<FileItem>,
    pub system_prompt: String,
}

impl Default for ContextState {
    fn default() -> Self {
        Self {
            web_results: Vec::new(),
            files: Vec::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl ContextState {
    pub fn add_web_result(&mut self, result: WebResult) {
        self.web_results.push(result);
    }

    pub fn add_web_results(&mut self, results: impl IntoIterator<Item = WebResult>) {
        self.web_results.extend(results);
    }

    pub fn clear_web_results(&mut self) {
        self.web_results.clear();
    }

    /// Attaches files until [`MAX_ATTACHMENTS`] is reached; returns how many were taken.
    pub fn add_files(&mut self, files: impl IntoIterator<Item = FileItem>) -> usize {
        let room = MAX_ATTACHMENTS.saturating_sub(self.files.len());
        let before = self.files.len();
        self.files.extend(files.into_iter().take(room));
        let accepted = self.files.len() - before;
        log::debug!("Attached {} files ({} total)", accepted, self.files.len());
        accepted
    }

    pub fn remove_file(&mut self, name: &str) -> bool {
        let before = self.files.len();
        self.files.retain(|f| f.name != name);
        self.files.len() != before
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }
}
