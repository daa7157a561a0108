//! Interactive exec session state
//!
//! One session per dashboard. It tracks the target service, a working
//! directory inside the container (kept in sync by probing `cd <dir> && pwd`),
//! command history and the visible output.

use std::collections::VecDeque;

use crate::model::ServiceKey;

pub const HISTORY_LIMIT: usize = 1000;
pub const OUTPUT_LIMIT: usize = 200;

/// What to run after the user pressed Enter
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecRequest {
    /// Run the line through the container's shell
    Run(String),
    /// Resolve a directory change; the command prints the new directory
    Cd { probe: String },
}

impl ExecRequest {
    pub fn command(&self) -> &str {
        match self {
            ExecRequest::Run(line) => line,
            ExecRequest::Cd { probe } => probe,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecSession {
    pub target: Option<ServiceKey>,
    pub container_id: Option<String>,
    pub cwd: Option<String>,
    pub input: String,
    pub history: Vec<String>,
    history_cursor: Option<usize>,
    draft: String,
    pub output: VecDeque<String>,
    pub running: Option<ExecRequest>,
}

impl ExecSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the session at a service. Switching services drops the output
    /// and working directory; history is kept.
    pub fn attach(&mut self, key: ServiceKey, container_id: Option<String>) {
        if self.target.as_ref() != Some(&key) {
            self.output.clear();
            self.cwd = None;
        }
        self.target = Some(key);
        self.container_id = container_id;
        self.input.clear();
        self.history_cursor = None;
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn type_char(&mut self, c: char) {
        self.input.push(c);
        self.history_cursor = None;
    }

    pub fn backspace(&mut self) {
        self.input.pop();
        self.history_cursor = None;
    }

    /// Consume the input line. Returns `None` for blank input or while a
    /// command is still running.
    pub fn submit(&mut self) -> Option<ExecRequest> {
        if self.running.is_some() {
            return None;
        }
        let line = self.input.trim().to_string();
        self.input.clear();
        self.history_cursor = None;
        self.draft.clear();
        if line.is_empty() {
            return None;
        }

        self.record_history(&line);
        let prompt = self.cwd.as_deref().unwrap_or("");
        self.push_output(format!("{prompt}$ {line}"));

        let request = match parse_cd(&line) {
            Some(dir) => ExecRequest::Cd {
                probe: cd_probe_command(dir),
            },
            None => ExecRequest::Run(line),
        };
        self.running = Some(request.clone());
        Some(request)
    }

    fn record_history(&mut self, line: &str) {
        if self.history.last().map(|s| s.as_str()) == Some(line) {
            return;
        }
        self.history.push(line.to_string());
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }

    pub fn push_output(&mut self, line: String) {
        self.output.push_back(line);
        while self.output.len() > OUTPUT_LIMIT {
            self.output.pop_front();
        }
    }

    /// The running command exited. `lines` is what it printed; for a `cd`
    /// probe the last absolute path becomes the new working directory.
    pub fn finish(&mut self, success: bool, lines: Vec<String>) {
        match self.running.take() {
            Some(ExecRequest::Cd { .. }) => {
                let resolved = lines
                    .iter()
                    .rev()
                    .map(|l| l.trim())
                    .find(|l| l.starts_with('/'));
                match (success, resolved) {
                    (true, Some(dir)) => self.cwd = Some(dir.to_string()),
                    _ => {
                        for line in lines {
                            self.push_output(line);
                        }
                        if !success {
                            self.push_output("cd: failed".to_string());
                        }
                    }
                }
            }
            Some(ExecRequest::Run(_)) | None => {
                for line in lines {
                    self.push_output(line);
                }
                if !success {
                    self.push_output("[exit: non-zero]".to_string());
                }
            }
        }
    }

    /// Step back through history (Up)
    pub fn history_prev(&mut self) {
        if self.history.is_empty() {
            return;
        }
        let index = match self.history_cursor {
            None => {
                self.draft = std::mem::take(&mut self.input);
                self.history.len() - 1
            }
            Some(0) => 0,
            Some(i) => i - 1,
        };
        self.history_cursor = Some(index);
        self.input = self.history[index].clone();
    }

    /// Step forward through history (Down); past the newest entry the
    /// unfinished line comes back
    pub fn history_next(&mut self) {
        let Some(index) = self.history_cursor else {
            return;
        };
        if index + 1 < self.history.len() {
            self.history_cursor = Some(index + 1);
            self.input = self.history[index + 1].clone();
        } else {
            self.history_cursor = None;
            self.input = std::mem::take(&mut self.draft);
        }
    }
}

/// `cd`, `cd <dir>` → `Some(dir)` (empty for a bare `cd`)
pub fn parse_cd(line: &str) -> Option<&str> {
    let line = line.trim();
    if line == "cd" {
        return Some("");
    }
    let rest = line.strip_prefix("cd ")?;
    let rest = rest.trim();
    // compound commands go to the shell untouched
    if rest.contains(['&', ';', '|']) {
        return None;
    }
    Some(rest)
}

/// Shell command that changes to `dir` and prints where it ended up
pub fn cd_probe_command(dir: &str) -> String {
    if dir.is_empty() {
        "cd && pwd".to_string()
    } else {
        format!("cd {} && pwd", shell_quote(dir))
    }
}

/// Quote for `sh` unless the word is plainly safe (keeps `~` expandable)
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./~-+:@%=".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
