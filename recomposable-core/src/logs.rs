//! Log buffering for the bottom panel
//!
//! Subprocess output arrives in arbitrary chunks. [`LineSplitter`] turns it
//! into lines (`\n`, `\r\n` and bare `\r` all terminate a line), and
//! [`LogPanelEntry`] keeps the capped tail shown under the service list.

use std::collections::VecDeque;

use crate::text::strip_ansi;

/// Incremental line splitter for chunked process output
#[derive(Clone, Debug, Default)]
pub struct LineSplitter {
    partial: String,
    /// Last chunk ended in `\r`; a leading `\n` in the next chunk belongs to it
    pending_cr: bool,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning the complete lines it finished (ANSI-stripped)
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut lines = Vec::new();
        let mut chars = chunk.chars().peekable();

        if self.pending_cr {
            self.pending_cr = false;
            if chars.peek() == Some(&'\n') {
                chars.next();
            }
        }

        while let Some(c) = chars.next() {
            match c {
                '\n' => lines.push(self.take()),
                '\r' => {
                    lines.push(self.take());
                    match chars.peek() {
                        Some('\n') => {
                            chars.next();
                        }
                        None => self.pending_cr = true,
                        Some(_) => {}
                    }
                }
                c => self.partial.push(c),
            }
        }

        lines
    }

    /// Flush whatever is left once the stream closes
    pub fn finish(&mut self) -> Option<String> {
        self.pending_cr = false;
        if self.partial.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> String {
        strip_ansi(&std::mem::take(&mut self.partial))
    }
}

/// What the bottom panel for a service is currently showing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogAction {
    Logs,
    Rebuilding,
    Restarting,
    Stopping,
    Starting,
    Started,
    Watching,
    Cascading,
    BuildFailed,
    RestartFailed,
    StopFailed,
    StartFailed,
    SwitchFailed,
}

impl LogAction {
    pub fn label(&self) -> &'static str {
        match self {
            LogAction::Logs => "logs",
            LogAction::Rebuilding => "rebuilding",
            LogAction::Restarting => "restarting",
            LogAction::Stopping => "stopping",
            LogAction::Starting => "starting",
            LogAction::Started => "started",
            LogAction::Watching => "watching",
            LogAction::Cascading => "cascading",
            LogAction::BuildFailed => "build failed",
            LogAction::RestartFailed => "restart failed",
            LogAction::StopFailed => "stop failed",
            LogAction::StartFailed => "start failed",
            LogAction::SwitchFailed => "switch failed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            LogAction::BuildFailed
                | LogAction::RestartFailed
                | LogAction::StopFailed
                | LogAction::StartFailed
                | LogAction::SwitchFailed
        )
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            LogAction::Rebuilding
                | LogAction::Restarting
                | LogAction::Stopping
                | LogAction::Starting
                | LogAction::Watching
                | LogAction::Cascading
        )
    }

    /// A build (plain or cascade) that is running or just failed
    pub fn is_build(&self) -> bool {
        matches!(
            self,
            LogAction::Rebuilding | LogAction::Cascading | LogAction::BuildFailed
        )
    }
}

/// Bottom panel content for one service
#[derive(Clone, Debug)]
pub struct LogPanelEntry {
    pub action: LogAction,
    pub service: String,
    pub lines: VecDeque<String>,
}

impl LogPanelEntry {
    pub fn new(action: LogAction, service: impl Into<String>) -> Self {
        Self {
            action,
            service: service.into(),
            lines: VecDeque::new(),
        }
    }

    /// Append lines, dropping the oldest beyond `cap`
    pub fn push_lines<I>(&mut self, lines: I, cap: usize)
    where
        I: IntoIterator<Item = String>,
    {
        for line in lines {
            self.lines.push_back(line);
        }
        while self.lines.len() > cap {
            self.lines.pop_front();
        }
    }

    pub fn push_line(&mut self, line: String, cap: usize) {
        self.push_lines(std::iter::once(line), cap);
    }

    pub fn reset(&mut self, action: LogAction) {
        self.action = action;
        self.lines.clear();
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Case-insensitive substring search; indices of matching lines, ascending
pub fn find_matches<S: AsRef<str>>(lines: &[S], query: &str) -> Vec<usize> {
    if query.is_empty() {
        return Vec::new();
    }
    let needle = query.to_lowercase();
    lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.as_ref().to_lowercase().contains(&needle))
        .map(|(i, _)| i)
        .collect()
}

// ============================================================================
// Bottom panel search
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PanelSearchState {
    /// Waiting for the full history fetch to finish
    Fetching,
    /// Showing the lines that matched
    Results { matches: usize },
}

/// Search over one service's full history, shown in place of its tail.
///
/// The panel content from before the search is kept verbatim and put back
/// when the search is cleared.
#[derive(Clone, Debug)]
pub struct PanelSearch {
    pub service: String,
    pub query: String,
    pub state: PanelSearchState,
    saved_action: LogAction,
    saved_lines: Vec<String>,
}

impl PanelSearch {
    /// Start a search, snapshotting the entry's current content
    pub fn begin(entry: &LogPanelEntry, query: impl Into<String>) -> Self {
        Self {
            service: entry.service.clone(),
            query: query.into(),
            state: PanelSearchState::Fetching,
            saved_action: entry.action,
            saved_lines: entry.snapshot(),
        }
    }

    /// Replace the entry's lines with the matches from `history`.
    /// With no matches the panel is left empty on purpose.
    pub fn apply(&mut self, entry: &mut LogPanelEntry, history: &[String]) {
        let matched: Vec<String> = find_matches(history, &self.query)
            .into_iter()
            .map(|i| history[i].clone())
            .collect();
        self.state = PanelSearchState::Results {
            matches: matched.len(),
        };
        entry.lines = matched.into();
    }

    /// An operation restarted the panel while it was searched
    pub fn reset(&mut self, action: LogAction) {
        self.saved_action = action;
        self.saved_lines.clear();
    }

    /// The panel's tag changed while it was searched
    pub fn retag(&mut self, action: LogAction) {
        self.saved_action = action;
    }

    /// Put the pre-search content back, with any tag set since
    pub fn restore(self, entry: &mut LogPanelEntry) {
        entry.action = self.saved_action;
        entry.lines = self.saved_lines.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splitter_handles_all_line_endings() {
        let mut s = LineSplitter::new();
        assert_eq!(s.push("a\nb\r\nc\rd"), vec!["a", "b", "c"]);
        assert_eq!(s.finish(), Some("d".to_string()));
        assert_eq!(s.finish(), None);
    }

    #[test]
    fn test_splitter_across_chunks() {
        let mut s = LineSplitter::new();
        assert!(s.push("hel").is_empty());
        assert_eq!(s.push("lo\r"), vec!["hello"]);
        // the \n completes the previous \r, not a blank line
        assert_eq!(s.push("\nworld\n"), vec!["world"]);
    }

    #[test]
    fn test_splitter_strips_ansi() {
        let mut s = LineSplitter::new();
        assert_eq!(s.push("\x1b[34m#1 [internal]\x1b[0m load\n"), vec!["#1 [internal] load"]);
    }

    #[test]
    fn test_panel_cap() {
        let mut entry = LogPanelEntry::new(LogAction::Rebuilding, "api");
        entry.push_lines((0..10).map(|i| i.to_string()), 4);
        assert_eq!(entry.snapshot(), vec!["6", "7", "8", "9"]);
        entry.reset(LogAction::Started);
        assert!(entry.lines.is_empty());
        assert_eq!(entry.action, LogAction::Started);
    }

    #[test]
    fn test_find_matches_case_insensitive() {
        let lines = ["ERROR here", "all good", "another Error"];
        assert_eq!(find_matches(&lines, "error"), vec![0, 2]);
        assert!(find_matches(&lines, "").is_empty());
        assert!(find_matches(&lines, "missing").is_empty());
    }

    #[test]
    fn test_action_classification() {
        assert!(LogAction::BuildFailed.is_failure());
        assert!(!LogAction::Started.is_failure());
        assert!(LogAction::Watching.is_in_progress());
        assert!(LogAction::BuildFailed.is_build());
        assert!(!LogAction::RestartFailed.is_build());
    }

    #[test]
    fn test_panel_search_restores_snapshot_verbatim() {
        let mut entry = LogPanelEntry::new(LogAction::Logs, "api");
        entry.push_lines(vec!["tail 1".to_string(), "tail 2".to_string()], 10);

        let mut search = PanelSearch::begin(&entry, "timeout");
        let history = vec![
            "boot".to_string(),
            "Timeout talking to db".to_string(),
            "ok".to_string(),
        ];
        search.apply(&mut entry, &history);
        assert_eq!(search.state, PanelSearchState::Results { matches: 1 });
        assert_eq!(entry.snapshot(), vec!["Timeout talking to db"]);

        search.restore(&mut entry);
        assert_eq!(entry.snapshot(), vec!["tail 1", "tail 2"]);
        assert_eq!(entry.action, LogAction::Logs);
    }

    #[test]
    fn test_panel_search_zero_matches_shows_empty_panel() {
        let mut entry = LogPanelEntry::new(LogAction::Logs, "api");
        entry.push_line("still here".to_string(), 10);

        let mut search = PanelSearch::begin(&entry, "nothing-matches-this");
        search.apply(&mut entry, &["a".to_string(), "b".to_string()]);

        // the old tail is not shown again until the search is cleared
        assert_eq!(search.state, PanelSearchState::Results { matches: 0 });
        assert!(entry.lines.is_empty());

        search.restore(&mut entry);
        assert_eq!(entry.snapshot(), vec!["still here"]);
    }
}
