use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::deps::DependencyGraph;
use crate::exec::ExecSession;
use crate::full_log::FullLogBuffer;
use crate::input::{ChordState, Mode, Overlay};
use crate::logs::{LogAction, LogPanelEntry, PanelSearch};
use crate::model::{flatten, ContainerStatus, FlatEntry, ServiceGroup, ServiceKey};
use crate::scan::PatternCounts;
use crate::stats::{StatsAggregator, StatsAverage};
use crate::worktree::{project_name, WorktreeOverride, WorktreePicker};

/// Build output kept per service for the full log view
pub const BUILD_LOG_LIMIT: usize = 10_000;

/// Everything the dashboard shows. Owned by the event loop, read by the
/// renderer.
#[derive(Debug)]
pub struct AppState {
    pub groups: Vec<ServiceGroup>,
    pub entries: Vec<FlatEntry>,
    pub cursor: usize,

    pub mode: Mode,
    pub overlay: Overlay,
    pub chord: ChordState,

    pub statuses: BTreeMap<ServiceKey, ContainerStatus>,
    pub panels: BTreeMap<ServiceKey, LogPanelEntry>,
    pub panel_lines: usize,
    /// Complete output of the latest build per service
    pub build_logs: BTreeMap<ServiceKey, Vec<String>>,
    /// Service whose panel the search replaced, with the saved content
    pub panel_search: Option<(ServiceKey, PanelSearch)>,
    /// Text typed into the search prompt
    pub search_input: String,

    pub stats: StatsAggregator,
    pub scan_counts: BTreeMap<ServiceKey, PatternCounts>,
    pub overrides: BTreeMap<ServiceKey, WorktreeOverride>,
    /// Lazily built, one per manifest
    pub graphs: BTreeMap<PathBuf, DependencyGraph>,

    pub full_log: Option<FullLogBuffer>,
    pub exec: ExecSession,
    pub picker: Option<WorktreePicker>,

    pub no_cache: bool,
    pub watch_available: Option<bool>,
    /// One-line notice in the footer (rejected actions and the like)
    pub notice: Option<String>,
}

impl AppState {
    pub fn new(groups: Vec<ServiceGroup>, panel_lines: usize, stats_capacity: usize) -> Self {
        let entries = flatten(&groups);
        Self {
            groups,
            entries,
            cursor: 0,
            mode: Mode::List,
            overlay: Overlay::None,
            chord: ChordState::new(),
            statuses: BTreeMap::new(),
            panels: BTreeMap::new(),
            panel_lines,
            build_logs: BTreeMap::new(),
            panel_search: None,
            search_input: String::new(),
            stats: StatsAggregator::new(stats_capacity),
            scan_counts: BTreeMap::new(),
            overrides: BTreeMap::new(),
            graphs: BTreeMap::new(),
            full_log: None,
            exec: ExecSession::new(),
            picker: None,
            no_cache: false,
            watch_available: None,
            notice: None,
        }
    }

    // ========================================================================
    // Selection
    // ========================================================================

    pub fn selected(&self) -> Option<&FlatEntry> {
        self.entries.get(self.cursor)
    }

    pub fn selected_key(&self) -> Option<ServiceKey> {
        self.selected().map(FlatEntry::key)
    }

    /// Move the cursor, clamped to the list. Returns true when it moved.
    pub fn move_cursor(&mut self, delta: isize) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let last = self.entries.len() as isize - 1;
        let next = (self.cursor as isize + delta).clamp(0, last) as usize;
        let moved = next != self.cursor;
        self.cursor = next;
        moved
    }

    pub fn cursor_to(&mut self, index: usize) -> bool {
        let target = index.min(self.entries.len().saturating_sub(1));
        let moved = target != self.cursor;
        self.cursor = target;
        moved
    }

    // ========================================================================
    // Worktree redirection
    // ========================================================================

    /// Manifest to execute against: the override when there is one
    pub fn effective_file(&self, key: &ServiceKey) -> PathBuf {
        self.overrides
            .get(key)
            .map(|o| o.manifest.clone())
            .unwrap_or_else(|| key.file.clone())
    }

    /// Project name to pin while redirected, so the container stays the same
    pub fn pinned_project(&self, key: &ServiceKey) -> Option<String> {
        self.overrides.get(key).and_then(|_| project_name(&key.file))
    }

    /// Point `key` at `manifest`; pointing it back at its own manifest
    /// removes the override
    pub fn set_override(&mut self, key: &ServiceKey, manifest: PathBuf, label: String) {
        if manifest == key.file {
            self.overrides.remove(key);
        } else {
            self.overrides
                .insert(key.clone(), WorktreeOverride { manifest, label });
        }
    }

    // ========================================================================
    // Status and stats
    // ========================================================================

    /// Replace every status belonging to `file` with a fresh poll
    pub fn apply_statuses(&mut self, file: &Path, polled: BTreeMap<String, ContainerStatus>) {
        self.statuses.retain(|key, _| key.file != file);
        for (service, mut status) in polled {
            let key = ServiceKey::new(file, service);
            status.worktree_label = self.overrides.get(&key).map(|o| o.label.clone());
            self.statuses.insert(key, status);
        }
    }

    pub fn running_keys(&self) -> Vec<(ServiceKey, String)> {
        self.statuses
            .iter()
            .filter(|(_, s)| s.is_running())
            .filter_map(|(k, s)| s.container_id.clone().map(|id| (k.clone(), id)))
            .collect()
    }

    pub fn key_for_container(&self, container_id: &str) -> Option<ServiceKey> {
        self.statuses
            .iter()
            .find(|(_, s)| {
                s.container_id
                    .as_deref()
                    .is_some_and(|id| id.starts_with(container_id) || container_id.starts_with(id))
            })
            .map(|(k, _)| k.clone())
    }

    pub fn record_stats(&mut self, key: &ServiceKey, cpu: f64, memory: u64) -> StatsAverage {
        self.stats.record(key, cpu, memory)
    }

    pub fn reset_stats(&mut self, key: &ServiceKey) {
        self.stats.reset(key);
    }

    // ========================================================================
    // Bottom panel
    // ========================================================================

    /// Clear the panel of `key` and tag it with `action`
    pub fn reset_panel(&mut self, key: &ServiceKey, action: LogAction) {
        if let Some((_, search)) = self.panel_search.as_mut().filter(|(k, _)| k == key) {
            // results stay on screen; the reset lands when the search clears
            search.reset(action);
            if let Some(entry) = self.panels.get_mut(key) {
                entry.action = action;
                return;
            }
        }
        self.panels
            .entry(key.clone())
            .and_modify(|p| p.reset(action))
            .or_insert_with(|| LogPanelEntry::new(action, key.service.clone()));
    }

    /// Keep the lines but change the tag (e.g. `rebuilding` → `build failed`)
    pub fn retag_panel(&mut self, key: &ServiceKey, action: LogAction) {
        if let Some((_, search)) = self.panel_search.as_mut().filter(|(k, _)| k == key) {
            search.retag(action);
        }
        self.panels
            .entry(key.clone())
            .or_insert_with(|| LogPanelEntry::new(action, key.service.clone()))
            .action = action;
    }

    /// Append lines to the panel, and to the full log view when it mirrors
    /// this key's build. Lines for a panel under search are held back so the
    /// results stay put.
    pub fn push_panel_lines(&mut self, key: &ServiceKey, lines: Vec<String>, mirror_build: bool) {
        if mirror_build {
            if let Some(view) = self.full_log.as_mut() {
                if view.build_key.as_ref() == Some(key) {
                    view.push_lines(lines.iter().cloned());
                }
            }
        }
        if self.panel_search.as_ref().is_some_and(|(k, _)| k == key) {
            return;
        }
        let cap = self.panel_lines;
        self.panels
            .entry(key.clone())
            .or_insert_with(|| LogPanelEntry::new(LogAction::Logs, key.service.clone()))
            .push_lines(lines, cap);
    }

    /// Start capturing a fresh build for `key`
    pub fn begin_build_log(&mut self, key: &ServiceKey) {
        self.build_logs.insert(key.clone(), Vec::new());
    }

    pub fn push_build_lines(&mut self, key: &ServiceKey, lines: &[String]) {
        let log = self.build_logs.entry(key.clone()).or_default();
        log.extend(lines.iter().cloned());
        if log.len() > BUILD_LOG_LIMIT {
            let excess = log.len() - BUILD_LOG_LIMIT;
            log.drain(..excess);
        }
    }

    pub fn panel_action(&self, key: &ServiceKey) -> Option<LogAction> {
        self.panels.get(key).map(|p| p.action)
    }

    /// Start a bottom panel search on the selected service
    pub fn begin_panel_search(&mut self, query: &str) -> Option<ServiceKey> {
        let key = self.selected_key()?;
        self.clear_panel_search();
        let entry = self
            .panels
            .entry(key.clone())
            .or_insert_with(|| LogPanelEntry::new(LogAction::Logs, key.service.clone()));
        let search = PanelSearch::begin(entry, query);
        self.panel_search = Some((key.clone(), search));
        Some(key)
    }

    /// Show the results of the history fetched for the search
    pub fn complete_panel_search(&mut self, key: &ServiceKey, history: &[String]) {
        let Some((search_key, search)) = self.panel_search.as_mut() else {
            return;
        };
        if search_key != key {
            return;
        }
        if let Some(entry) = self.panels.get_mut(key) {
            search.apply(entry, history);
        }
    }

    /// Drop the search and restore the panel's pre-search lines
    pub fn clear_panel_search(&mut self) {
        if let Some((key, search)) = self.panel_search.take() {
            if let Some(entry) = self.panels.get_mut(&key) {
                search.restore(entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::PanelSearchState;
    use crate::model::ContainerState;

    fn state() -> AppState {
        AppState::new(
            vec![
                ServiceGroup::new("/a/compose.yml".into(), vec!["api".into(), "db".into()]),
                ServiceGroup::new("/b/compose.yml".into(), vec!["web".into()]),
            ],
            3,
            6,
        )
    }

    #[test]
    fn test_cursor_clamps() {
        let mut s = state();
        assert!(!s.move_cursor(-1));
        assert!(s.move_cursor(5));
        assert_eq!(s.cursor, 2);
        assert_eq!(s.selected_key(), Some(ServiceKey::new("/b/compose.yml", "web")));
        assert!(s.cursor_to(0));
    }

    #[test]
    fn test_override_and_back() {
        let mut s = state();
        let key = ServiceKey::new("/a/compose.yml", "api");
        assert_eq!(s.effective_file(&key), PathBuf::from("/a/compose.yml"));
        assert_eq!(s.pinned_project(&key), None);

        s.set_override(&key, PathBuf::from("/a-feature/compose.yml"), "feature".into());
        assert_eq!(s.effective_file(&key), PathBuf::from("/a-feature/compose.yml"));
        assert_eq!(s.pinned_project(&key).as_deref(), Some("a"));

        s.set_override(&key, key.file.clone(), "main".into());
        assert!(s.overrides.is_empty());
    }

    #[test]
    fn test_statuses_replaced_per_file() {
        let mut s = state();
        let key = ServiceKey::new("/a/compose.yml", "api");
        s.set_override(&key, PathBuf::from("/wt/compose.yml"), "wt".into());

        let mut polled = BTreeMap::new();
        polled.insert("api".to_string(), ContainerStatus::new(ContainerState::Running));
        polled.insert("db".to_string(), ContainerStatus::new(ContainerState::Exited));
        s.apply_statuses(Path::new("/a/compose.yml"), polled);
        assert_eq!(s.statuses.len(), 2);
        assert_eq!(s.statuses[&key].worktree_label.as_deref(), Some("wt"));

        let mut polled = BTreeMap::new();
        polled.insert("api".to_string(), ContainerStatus::new(ContainerState::Running));
        s.apply_statuses(Path::new("/a/compose.yml"), polled);
        // db vanished from the poll, so it is unknown now
        assert_eq!(s.statuses.len(), 1);
    }

    #[test]
    fn test_panel_lines_capped_and_mirrored() {
        let mut s = state();
        let key = ServiceKey::new("/a/compose.yml", "api");
        s.reset_panel(&key, LogAction::Rebuilding);
        s.full_log = Some(FullLogBuffer::from_build(key.clone(), Vec::new()));

        let lines: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        s.push_panel_lines(&key, lines, true);

        assert_eq!(s.panels[&key].lines.len(), 3);
        assert_eq!(s.full_log.as_ref().unwrap().lines.len(), 5);
    }

    #[test]
    fn test_panel_search_freezes_and_restores() {
        let mut s = state();
        let key = ServiceKey::new("/a/compose.yml", "api");
        s.push_panel_lines(&key, vec!["one".into(), "two".into()], false);

        assert_eq!(s.begin_panel_search("boom"), Some(key.clone()));
        s.push_panel_lines(&key, vec!["three".into()], false);
        s.complete_panel_search(&key, &["boom 1".to_string(), "fine".to_string()]);

        let (_, search) = s.panel_search.as_ref().unwrap();
        assert_eq!(search.state, PanelSearchState::Results { matches: 1 });
        assert_eq!(s.panels[&key].snapshot(), vec!["boom 1"]);

        s.clear_panel_search();
        assert_eq!(s.panels[&key].snapshot(), vec!["one", "two"]);
    }

    #[test]
    fn test_operation_finishing_under_search_keeps_new_tag() {
        let mut s = state();
        let key = ServiceKey::new("/a/compose.yml", "api");
        s.reset_panel(&key, LogAction::Rebuilding);
        s.push_panel_lines(&key, vec!["#1 building".into()], false);

        s.begin_panel_search("boom");
        s.complete_panel_search(&key, &["boom 1".to_string()]);
        s.reset_panel(&key, LogAction::Started);
        // results stay up while the search is active
        assert_eq!(s.panels[&key].snapshot(), vec!["boom 1"]);
        assert_eq!(s.panels[&key].action, LogAction::Started);

        s.clear_panel_search();
        assert_eq!(s.panels[&key].action, LogAction::Started);
        assert!(s.panels[&key].snapshot().is_empty());
    }

    #[test]
    fn test_failure_under_search_keeps_lines_and_failed_tag() {
        let mut s = state();
        let key = ServiceKey::new("/a/compose.yml", "api");
        s.reset_panel(&key, LogAction::Rebuilding);
        s.push_panel_lines(&key, vec!["#1 building".into()], false);

        s.begin_panel_search("boom");
        s.retag_panel(&key, LogAction::BuildFailed);
        s.clear_panel_search();

        assert_eq!(s.panels[&key].action, LogAction::BuildFailed);
        assert_eq!(s.panels[&key].snapshot(), vec!["#1 building"]);
    }

    #[test]
    fn test_build_log_capped() {
        let mut s = state();
        let key = ServiceKey::new("/a/compose.yml", "api");
        s.begin_build_log(&key);
        let lines: Vec<String> = (0..BUILD_LOG_LIMIT + 10).map(|i| i.to_string()).collect();
        s.push_build_lines(&key, &lines);
        assert_eq!(s.build_logs[&key].len(), BUILD_LOG_LIMIT);
        assert_eq!(s.build_logs[&key][0], "10");
    }

    #[test]
    fn test_key_for_container_prefix() {
        let mut s = state();
        let mut status = ContainerStatus::new(ContainerState::Running);
        status.container_id = Some("0123456789abcdef".into());
        let mut polled = BTreeMap::new();
        polled.insert("db".to_string(), status);
        s.apply_statuses(Path::new("/a/compose.yml"), polled);

        assert_eq!(
            s.key_for_container("0123456789ab"),
            Some(ServiceKey::new("/a/compose.yml", "db"))
        );
        assert_eq!(s.running_keys().len(), 1);
    }
}
