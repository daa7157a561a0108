//! Dashboard controller
//!
//! [`App`] owns every spawned process and background query. Keys, process
//! output, query results and timer deadlines are fed in one at a time from
//! the event loop in `main`; nothing in here blocks.
//!
//! Each spawned process is tracked by its [`OpId`] together with what it is
//! for. Cancelling a process drops its entry first, so whatever it still
//! prints or however it exits afterwards is ignored.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use recomposable_core::cascade::{CascadeOperation, CascadeProgress, StepAction};
use recomposable_core::config::Config;
use recomposable_core::deps::DependencyGraph;
use recomposable_core::exec::ExecRequest;
use recomposable_core::full_log::{FullLogBuffer, INITIAL_TAIL, SearchStart, TailDepth};
use recomposable_core::input::{Action, Key, Mode, Overlay, interpret};
use recomposable_core::logs::LogAction;
use recomposable_core::model::{ContainerStatus, ServiceGroup, ServiceKey};
use recomposable_core::registry::{OperationKind, OperationRegistry, RegistryError};
use recomposable_core::scan::PatternCounts;
use recomposable_core::state::AppState;
use recomposable_core::stats::parse_stats_line;
use recomposable_core::timing::{Debouncer, RenderDecision, RenderThrottle};
use recomposable_core::worktree::{SwitchError, Worktree, WorktreePicker};

use crate::backend::{BuildOptions, ComposeBackend, ComposeTarget};
use crate::process::{Invocation, KILL_GRACE, OpId, ProcessEvent, ProcessHandle, Spawner};

/// Result of a background query, delivered back to the event loop
#[derive(Debug)]
pub enum QueryResult {
    Statuses {
        polled: Vec<(PathBuf, BTreeMap<String, ContainerStatus>)>,
        /// container id -> start time, for newly seen containers
        started: Vec<(String, String)>,
    },
    Scan {
        counts: Vec<(ServiceKey, PatternCounts)>,
    },
    Graph {
        root: ServiceKey,
        graph: DependencyGraph,
    },
    WatchAvailable(bool),
    Worktrees {
        key: ServiceKey,
        git_root: Option<PathBuf>,
        worktrees: Vec<Worktree>,
    },
    SwitchChecked {
        key: ServiceKey,
        manifest: PathBuf,
        label: String,
        result: Result<(), SwitchError>,
    },
    ExecContainer {
        key: ServiceKey,
        container_id: Option<String>,
    },
}

#[derive(Debug)]
pub enum AppEvent {
    Process(ProcessEvent),
    Query(QueryResult),
}

/// What a spawned process is doing for us
#[derive(Debug)]
enum Tracked {
    Lifecycle {
        key: ServiceKey,
        kind: OperationKind,
        /// Invocations still to run after this one (no-cache rebuild)
        remaining: VecDeque<Invocation>,
    },
    CascadeStep {
        root: ServiceKey,
        remaining: VecDeque<Invocation>,
    },
    PanelTail {
        key: ServiceKey,
    },
    FullTail,
    HistoryFetch {
        lines: Vec<String>,
    },
    PanelSearchFetch {
        key: ServiceKey,
        lines: Vec<String>,
    },
    Exec {
        /// `cd` probes are collected and interpreted on exit
        capture: bool,
        lines: Vec<String>,
    },
    Stats,
}

fn in_progress_tag(kind: OperationKind) -> LogAction {
    match kind {
        OperationKind::Rebuild => LogAction::Rebuilding,
        OperationKind::Restart => LogAction::Restarting,
        OperationKind::Stop => LogAction::Stopping,
        OperationKind::Start => LogAction::Starting,
        OperationKind::Watch => LogAction::Watching,
    }
}

fn failed_tag(kind: OperationKind) -> LogAction {
    match kind {
        // watch failures are build or sync failures
        OperationKind::Rebuild | OperationKind::Watch => LogAction::BuildFailed,
        OperationKind::Restart => LogAction::RestartFailed,
        OperationKind::Stop => LogAction::StopFailed,
        OperationKind::Start => LogAction::StartFailed,
    }
}

pub struct App {
    backend: Arc<dyn ComposeBackend>,
    pub state: AppState,
    config: Config,
    registry: OperationRegistry<ProcessHandle>,
    ops: BTreeMap<OpId, Tracked>,
    spawner: Spawner,
    process_rx: mpsc::UnboundedReceiver<ProcessEvent>,
    query_tx: mpsc::UnboundedSender<QueryResult>,
    query_rx: mpsc::UnboundedReceiver<QueryResult>,
    queries: JoinSet<()>,

    panel_tails: BTreeMap<ServiceKey, ProcessHandle>,
    full_tail: Option<ProcessHandle>,
    history_fetch: Option<ProcessHandle>,
    search_fetch: Option<ProcessHandle>,
    exec_proc: Option<ProcessHandle>,
    stats_proc: Option<ProcessHandle>,

    /// container id -> RFC 3339 start time
    started_at: BTreeMap<String, String>,
    /// Cascade roots waiting for their dependency graph
    pending_cascades: BTreeSet<ServiceKey>,

    tail_debounce: Debouncer<ServiceKey>,
    render: RenderThrottle,
    dirty: bool,
    status_in_flight: bool,
    status_again: bool,
    /// Stats process and pattern scan still running for the current tick
    stats_pending: u8,
    viewport: usize,
    quit: bool,
    shut_down: bool,
}

impl App {
    pub fn new(backend: Arc<dyn ComposeBackend>, config: Config, groups: Vec<ServiceGroup>) -> Self {
        let (process_tx, process_rx) = mpsc::unbounded_channel();
        let (query_tx, query_rx) = mpsc::unbounded_channel();
        let mut state = AppState::new(groups, config.log_panel_lines, config.stats_buffer_size);
        state.no_cache = config.no_cache;

        Self {
            backend,
            state,
            tail_debounce: Debouncer::new(config.tail_debounce()),
            render: RenderThrottle::new(config.render_interval()),
            config,
            registry: OperationRegistry::new(),
            ops: BTreeMap::new(),
            spawner: Spawner::new(process_tx),
            process_rx,
            query_tx,
            query_rx,
            queries: JoinSet::new(),
            panel_tails: BTreeMap::new(),
            full_tail: None,
            history_fetch: None,
            search_fetch: None,
            exec_proc: None,
            stats_proc: None,
            started_at: BTreeMap::new(),
            pending_cascades: BTreeSet::new(),
            dirty: true,
            status_in_flight: false,
            status_again: false,
            stats_pending: 0,
            viewport: 20,
            quit: false,
            shut_down: false,
        }
    }

    /// Kick off the first status poll, the watch probe and the initial tail
    pub fn start(&mut self, now: Instant) {
        let backend = self.backend.clone();
        let tx = self.query_tx.clone();
        self.queries.spawn(async move {
            let available = backend.watch_available().await;
            let _ = tx.send(QueryResult::WatchAvailable(available));
        });
        self.poll_status();
        self.selection_changed(now);
    }

    // ========================================================================
    // Accessors for the renderer and the event loop
    // ========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &OperationRegistry<ProcessHandle> {
        &self.registry
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    /// Rows available to the full log view, as laid out by the last draw
    pub fn set_viewport(&mut self, rows: usize) {
        self.viewport = rows.max(1);
    }

    pub fn request_render(&mut self) {
        self.dirty = true;
    }

    /// Whether to redraw now. A request inside the throttle interval turns
    /// into one trailing redraw at the interval's end.
    pub fn render_due(&mut self, now: Instant) -> bool {
        if std::mem::take(&mut self.dirty) && self.render.request(now) == RenderDecision::Now {
            return true;
        }
        self.render.is_due(now)
    }

    pub fn rendered(&mut self, now: Instant) {
        self.render.rendered(now);
    }

    /// Earliest timer the event loop has to wake up for
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.tail_debounce.deadline(),
            self.render.deadline(),
            self.state.chord.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn on_timer(&mut self, now: Instant) {
        if let Some(key) = self.tail_debounce.poll(now) {
            self.attach_tail(key);
            self.dirty = true;
        }
        if self.state.chord.expire(now) {
            self.dirty = true;
        }
    }

    /// Next process or query event
    pub async fn next_event(&mut self) -> Option<AppEvent> {
        loop {
            tokio::select! {
                Some(event) = self.process_rx.recv() => return Some(AppEvent::Process(event)),
                Some(result) = self.query_rx.recv() => return Some(AppEvent::Query(result)),
                // reap finished query tasks
                Some(_) = self.queries.join_next(), if !self.queries.is_empty() => {}
                else => return None,
            }
        }
    }

    pub fn handle_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::Process(ProcessEvent::Lines { id, lines }) => self.on_lines(id, lines),
            AppEvent::Process(ProcessEvent::Exited { id, code }) => self.on_exit(id, code),
            AppEvent::Query(result) => self.on_query(result),
        }
        self.dirty = true;
    }

    pub fn handle_key(&mut self, key: Key, now: Instant) {
        let action = interpret(self.state.mode, self.state.overlay, &mut self.state.chord, key, now);
        if !matches!(action, Action::None | Action::Pending) {
            self.state.notice = None;
        }
        self.apply(action, now);
        self.dirty = true;
    }

    // ========================================================================
    // Actions
    // ========================================================================

    fn apply(&mut self, action: Action, now: Instant) {
        let selected = self.state.selected_key();
        match action {
            Action::None | Action::Pending => {}
            Action::Quit => self.quit = true,

            Action::MoveCursor(delta) => {
                if self.state.move_cursor(delta) {
                    self.selection_changed(now);
                }
            }
            Action::CursorTop => {
                if self.state.cursor_to(0) {
                    self.selection_changed(now);
                }
            }
            Action::CursorBottom => {
                if self.state.cursor_to(usize::MAX) {
                    self.selection_changed(now);
                }
            }

            Action::Rebuild => {
                if let Some(key) = selected {
                    self.start_operation(key, OperationKind::Rebuild);
                }
            }
            Action::CascadeRebuild => {
                if let Some(key) = selected {
                    self.cascade_rebuild(key);
                }
            }
            Action::Restart => {
                if let Some(key) = selected {
                    self.start_operation(key, OperationKind::Restart);
                }
            }
            Action::Stop => {
                if let Some(key) = selected {
                    self.start_operation(key, OperationKind::Stop);
                }
            }
            Action::Start => {
                if let Some(key) = selected {
                    self.start_operation(key, OperationKind::Start);
                }
            }
            Action::ToggleWatch => {
                if let Some(key) = selected {
                    self.toggle_watch(key);
                }
            }
            Action::ToggleNoCache => self.state.no_cache = !self.state.no_cache,

            Action::OpenLogs => {
                if let Some(key) = selected {
                    self.open_full_log(key);
                }
            }
            Action::OpenExec => {
                if let Some(key) = selected {
                    self.open_exec(key);
                    self.state.mode = Mode::Exec;
                }
            }
            Action::OpenExecPrompt => {
                if let Some(key) = selected {
                    self.open_exec(key);
                    self.state.overlay = Overlay::ExecPrompt;
                }
            }
            Action::OpenWorktreePicker => {
                if let Some(key) = selected {
                    self.request_worktrees(key);
                }
            }
            Action::OpenSearch => {
                self.state.search_input.clear();
                self.state.overlay = Overlay::Search;
            }
            Action::ClearSearch => self.clear_panel_search(),

            Action::InputChar(c) => match self.state.overlay {
                Overlay::Search => self.state.search_input.push(c),
                _ => self.state.exec.type_char(c),
            },
            Action::InputBackspace => match self.state.overlay {
                Overlay::Search => {
                    self.state.search_input.pop();
                }
                _ => self.state.exec.backspace(),
            },
            Action::InputSubmit => match self.state.overlay {
                Overlay::Search => self.submit_search(),
                _ => self.submit_exec(),
            },
            Action::InputCancel => {
                if self.state.overlay == Overlay::ExecPrompt {
                    self.interrupt_exec();
                }
                self.state.search_input.clear();
                self.state.overlay = Overlay::None;
            }
            Action::HistoryPrev => self.state.exec.history_prev(),
            Action::HistoryNext => self.state.exec.history_next(),
            Action::Interrupt => self.interrupt_exec(),

            Action::PickerMove(delta) => {
                if let Some(picker) = self.state.picker.as_mut() {
                    picker.move_cursor(delta);
                }
            }
            Action::PickerSelect => self.select_worktree(),
            Action::PickerClose => {
                self.state.picker = None;
                self.state.overlay = Overlay::None;
            }

            Action::Scroll(delta) => self.scroll_full_log(|view, rows| {
                if delta < 0 {
                    view.scroll_up(delta.unsigned_abs(), rows);
                } else {
                    view.scroll_down(delta as usize, rows);
                }
            }),
            Action::PageUp => self.scroll_full_log(|view, rows| view.scroll_up(rows, rows)),
            Action::PageDown => self.scroll_full_log(|view, rows| view.scroll_down(rows, rows)),
            Action::ScrollTop => self.scroll_full_log(|view, _| view.scroll_to_top()),
            Action::ScrollBottom => self.scroll_full_log(|view, _| view.scroll_to_bottom()),
            Action::NextMatch => {
                if let Some(view) = self.state.full_log.as_mut() {
                    view.next_match();
                }
            }
            Action::PrevMatch => {
                if let Some(view) = self.state.full_log.as_mut() {
                    view.prev_match();
                }
            }
            Action::Back => {
                if let Some(view) = self.state.full_log.as_mut().filter(|v| v.has_search()) {
                    view.clear_search();
                } else if self.state.full_log.is_some() {
                    self.close_full_log();
                }
            }
            Action::LeaveView => match self.state.mode {
                Mode::Exec => {
                    self.interrupt_exec();
                    self.state.mode = Mode::List;
                }
                _ => self.close_full_log(),
            },
        }
    }

    fn selection_changed(&mut self, now: Instant) {
        if let Some(key) = self.state.selected_key() {
            self.tail_debounce.schedule(key, now);
        }
    }

    /// Manifest and project to run `key` against
    fn target(&self, key: &ServiceKey) -> ComposeTarget {
        ComposeTarget::pinned(self.state.effective_file(key), self.state.pinned_project(key))
    }

    fn container_id(&self, key: &ServiceKey) -> Option<String> {
        self.state
            .statuses
            .get(key)
            .filter(|s| s.is_running())
            .and_then(|s| s.container_id.clone())
    }

    fn spawn(&mut self, invocation: &Invocation, purpose: Tracked) -> std::io::Result<ProcessHandle> {
        let handle = self.spawner.spawn(invocation)?;
        self.ops.insert(handle.id, purpose);
        Ok(handle)
    }

    /// Forget a process and kill it
    fn cancel(&mut self, handle: ProcessHandle) {
        self.ops.remove(&handle.id);
        handle.terminate();
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    fn start_operation(&mut self, key: ServiceKey, kind: OperationKind) {
        if let Some(active) = self.registry.active(&key) {
            self.state.notice = Some(format!("{} is busy ({active})", key.service));
            return;
        }

        let target = self.target(&key);
        let mut steps: VecDeque<Invocation> = match kind {
            OperationKind::Rebuild => {
                let opts = BuildOptions {
                    no_cache: self.state.no_cache,
                    no_deps: false,
                };
                self.backend.rebuild(&target, &key.service, opts).into()
            }
            OperationKind::Restart => VecDeque::from([self.backend.restart(&target, &key.service)]),
            OperationKind::Stop => VecDeque::from([self.backend.stop(&target, &key.service)]),
            OperationKind::Start => VecDeque::from([self.backend.start(&target, &key.service)]),
            OperationKind::Watch => VecDeque::from([self.backend.watch(&target, &key.service)]),
        };
        let Some(first) = steps.pop_front() else {
            return;
        };

        self.clear_panel_for_operation(&key, in_progress_tag(kind));
        if kind == OperationKind::Rebuild {
            self.state.begin_build_log(&key);
        }
        tracing::info!(service = %key, op = kind.label(), no_cache = self.state.no_cache, "operation started");

        let purpose = Tracked::Lifecycle {
            key: key.clone(),
            kind,
            remaining: steps,
        };
        match self.spawn(&first, purpose) {
            Ok(handle) => {
                if let Err(RegistryError::Busy { handle, .. }) = self.registry.begin(key, kind, handle) {
                    self.cancel(handle);
                }
            }
            Err(e) => {
                tracing::warn!(service = %key, error = %e, "failed to spawn");
                self.state
                    .push_panel_lines(&key, vec![format!("failed to run {}: {e}", first.program)], false);
                self.operation_finished(key, kind, false);
            }
        }
    }

    /// Stop the passive tail of `key`, drop a panel search on it and retag
    fn clear_panel_for_operation(&mut self, key: &ServiceKey, tag: LogAction) {
        if let Some(handle) = self.panel_tails.remove(key) {
            self.cancel(handle);
        }
        if self.state.panel_search.as_ref().is_some_and(|(k, _)| k == key) {
            self.clear_panel_search();
        }
        self.state.reset_panel(key, tag);
    }

    fn continue_operation(
        &mut self,
        key: ServiceKey,
        kind: OperationKind,
        next: Invocation,
        remaining: VecDeque<Invocation>,
    ) {
        let purpose = Tracked::Lifecycle {
            key: key.clone(),
            kind,
            remaining,
        };
        match self.spawn(&next, purpose) {
            Ok(handle) => {
                self.registry.replace(&key, kind, handle);
            }
            Err(e) => {
                tracing::warn!(service = %key, error = %e, "failed to spawn next step");
                self.registry.finish(&key, kind);
                self.state
                    .push_panel_lines(&key, vec![format!("failed to run {}: {e}", next.program)], false);
                self.operation_finished(key, kind, false);
            }
        }
    }

    fn operation_finished(&mut self, key: ServiceKey, kind: OperationKind, success: bool) {
        tracing::info!(service = %key, op = kind.label(), success, "operation finished");
        if success {
            self.forget_started_at(&key);
            self.state.reset_stats(&key);
            self.state.reset_panel(&key, LogAction::Started);
            if self.state.selected_key().as_ref() == Some(&key) {
                self.attach_tail(key);
            }
        } else {
            // keep the output up so the error stays readable
            self.state.retag_panel(&key, failed_tag(kind));
        }
        self.poll_status();
    }

    fn toggle_watch(&mut self, key: ServiceKey) {
        if let Some(handle) = self.registry.finish(&key, OperationKind::Watch) {
            tracing::info!(service = %key, "watch cancelled");
            self.cancel(handle);
            self.state.reset_panel(&key, LogAction::Logs);
            if self.state.selected_key().as_ref() == Some(&key) {
                self.attach_tail(key);
            }
            return;
        }
        if self.state.watch_available == Some(false) {
            self.state.notice = Some("docker compose watch is not available".to_string());
            return;
        }
        self.start_operation(key, OperationKind::Watch);
    }

    // ========================================================================
    // Cascading rebuilds
    // ========================================================================

    fn cascade_rebuild(&mut self, root: ServiceKey) {
        if let Some(active) = self.registry.active(&root) {
            self.state.notice = Some(format!("{} is busy ({active})", root.service));
            return;
        }
        if let Some(plan) = self
            .state
            .graphs
            .get(&root.file)
            .map(|graph| CascadeOperation::plan(graph, &root))
        {
            self.begin_cascade(root, plan);
            return;
        }
        if !self.pending_cascades.insert(root.clone()) {
            return;
        }

        let backend = self.backend.clone();
        let tx = self.query_tx.clone();
        self.queries.spawn(async move {
            let graph = backend.dependency_graph(&root.file).await;
            let _ = tx.send(QueryResult::Graph { root, graph });
        });
    }

    fn begin_cascade(&mut self, root: ServiceKey, plan: Option<CascadeOperation<ProcessHandle>>) {
        let Some(cascade) = plan else {
            // nothing depends on it
            self.start_operation(root, OperationKind::Rebuild);
            return;
        };
        let steps = cascade.steps.len();
        if let Err(RegistryError::Busy { active, .. }) = self.registry.begin_cascade(cascade) {
            self.state.notice = Some(format!("{} is busy ({active})", root.service));
            return;
        }

        self.clear_panel_for_operation(&root, LogAction::Cascading);
        self.state.begin_build_log(&root);
        tracing::info!(service = %root, steps, "cascade started");
        self.run_cascade_step(root);
    }

    fn run_cascade_step(&mut self, root: ServiceKey) {
        let Some(cascade) = self.registry.cascade(&root) else {
            return;
        };
        let (Some(step), Some(key)) = (cascade.current_step().cloned(), cascade.current_key()) else {
            return;
        };
        let header = format!("── {}", cascade.summary());
        self.push_cascade_lines(&root, vec![header]);

        if key != root {
            if let Some(active) = self.registry.active(&key) {
                self.push_cascade_lines(&root, vec![format!("{} is busy ({active})", key.service)]);
                self.cascade_step_finished(root, false);
                return;
            }
        }

        let target = self.target(&key);
        let mut invocations: VecDeque<Invocation> = match step.action {
            StepAction::Rebuild => {
                let opts = BuildOptions {
                    no_cache: self.state.no_cache,
                    no_deps: true,
                };
                self.backend.rebuild(&target, &key.service, opts).into()
            }
            StepAction::Restart => VecDeque::from([self.backend.restart(&target, &key.service)]),
        };
        let Some(first) = invocations.pop_front() else {
            self.cascade_step_finished(root, false);
            return;
        };
        self.spawn_cascade_step(root, first, invocations);
    }

    fn spawn_cascade_step(&mut self, root: ServiceKey, next: Invocation, remaining: VecDeque<Invocation>) {
        let purpose = Tracked::CascadeStep {
            root: root.clone(),
            remaining,
        };
        match self.spawn(&next, purpose) {
            Ok(handle) => match self.registry.cascade_mut(&root) {
                Some(cascade) => cascade.start_current(handle),
                None => self.cancel(handle),
            },
            Err(e) => {
                tracing::warn!(service = %root, error = %e, "failed to spawn cascade step");
                self.push_cascade_lines(&root, vec![format!("failed to run {}: {e}", next.program)]);
                self.cascade_step_finished(root, false);
            }
        }
    }

    fn push_cascade_lines(&mut self, root: &ServiceKey, lines: Vec<String>) {
        self.state.push_build_lines(root, &lines);
        self.state.push_panel_lines(root, lines, true);
    }

    fn cascade_step_finished(&mut self, root: ServiceKey, success: bool) {
        let Some(cascade) = self.registry.cascade_mut(&root) else {
            return;
        };
        let key = cascade.current_key();
        let progress = cascade.finish_current(success);
        if success {
            if let Some(key) = &key {
                self.forget_started_at(key);
                self.state.reset_stats(key);
            }
        }

        match progress {
            CascadeProgress::Next { .. } => self.run_cascade_step(root),
            CascadeProgress::Finished => {
                self.registry.finish_cascade(&root);
                tracing::info!(service = %root, "cascade finished");
                self.state.retag_panel(&root, LogAction::Started);
                self.poll_status();
            }
            CascadeProgress::Aborted { index, service } => {
                self.registry.finish_cascade(&root);
                tracing::warn!(service = %root, step = index + 1, failed = %service, "cascade aborted");
                self.push_cascade_lines(&root, vec![format!("cascade aborted at step {}: {service}", index + 1)]);
                let tag = if index == 0 {
                    LogAction::BuildFailed
                } else {
                    LogAction::RestartFailed
                };
                self.state.retag_panel(&root, tag);
                self.poll_status();
            }
        }
    }

    // ========================================================================
    // Process events
    // ========================================================================

    fn on_lines(&mut self, id: OpId, lines: Vec<String>) {
        let Some(tracked) = self.ops.get_mut(&id) else {
            return;
        };
        match tracked {
            Tracked::Lifecycle { key, kind, .. } => {
                let build = *kind == OperationKind::Rebuild;
                if build {
                    self.state.push_build_lines(key, &lines);
                }
                self.state.push_panel_lines(key, lines, build);
            }
            Tracked::CascadeStep { root, .. } => {
                self.state.push_build_lines(root, &lines);
                self.state.push_panel_lines(root, lines, true);
            }
            Tracked::PanelTail { key } => self.state.push_panel_lines(key, lines, false),
            Tracked::FullTail => {
                if let Some(view) = self.state.full_log.as_mut() {
                    view.push_lines(lines);
                }
            }
            Tracked::HistoryFetch { lines: buffer }
            | Tracked::PanelSearchFetch { lines: buffer, .. }
            | Tracked::Exec {
                capture: true,
                lines: buffer,
            } => buffer.extend(lines),
            Tracked::Exec { capture: false, .. } => {
                for line in lines {
                    self.state.exec.push_output(line);
                }
            }
            Tracked::Stats => {
                for sample in lines.iter().filter_map(|l| parse_stats_line(l)) {
                    if let Some(key) = self.state.key_for_container(&sample.container_id) {
                        self.state.record_stats(&key, sample.cpu_percent, sample.memory_bytes);
                    }
                }
            }
        }
    }

    fn on_exit(&mut self, id: OpId, code: Option<i32>) {
        let Some(tracked) = self.ops.remove(&id) else {
            tracing::trace!(id, "exit of a cancelled process");
            return;
        };
        // no exit code means a signal ended it
        let success = matches!(code, None | Some(0));

        match tracked {
            Tracked::Lifecycle {
                key,
                kind,
                mut remaining,
            } => {
                if success {
                    if let Some(next) = remaining.pop_front() {
                        self.continue_operation(key, kind, next, remaining);
                        return;
                    }
                }
                self.registry.finish(&key, kind);
                self.operation_finished(key, kind, success);
            }
            Tracked::CascadeStep { root, mut remaining } => {
                if success {
                    if let Some(next) = remaining.pop_front() {
                        self.spawn_cascade_step(root, next, remaining);
                        return;
                    }
                }
                self.cascade_step_finished(root, success);
            }
            Tracked::PanelTail { key } => {
                if self.panel_tails.get(&key).is_some_and(|h| h.id == id) {
                    self.panel_tails.remove(&key);
                }
            }
            Tracked::FullTail => {
                if self.full_tail.as_ref().is_some_and(|h| h.id == id) {
                    self.full_tail = None;
                }
            }
            Tracked::HistoryFetch { lines } => {
                self.history_fetch = None;
                let follow_up = match self.state.full_log.as_mut() {
                    Some(view) if success => view.complete_fetch(lines),
                    Some(view) => {
                        view.fail_fetch();
                        None
                    }
                    None => None,
                };
                if let Some(depth) = follow_up {
                    self.spawn_history_fetch(depth);
                }
            }
            Tracked::PanelSearchFetch { key, lines } => {
                self.search_fetch = None;
                self.state.complete_panel_search(&key, &lines);
            }
            Tracked::Exec { lines, .. } => {
                self.exec_proc = None;
                self.state.exec.finish(success, lines);
            }
            Tracked::Stats => {
                self.stats_proc = None;
                self.stats_pending = self.stats_pending.saturating_sub(1);
            }
        }
    }

    // ========================================================================
    // Query results
    // ========================================================================

    fn on_query(&mut self, result: QueryResult) {
        match result {
            QueryResult::Statuses { polled, started } => {
                self.status_in_flight = false;
                self.started_at.extend(started);
                for (file, mut statuses) in polled {
                    for status in statuses.values_mut() {
                        if let Some(id) = &status.container_id {
                            status.started_at = self.started_at.get(id).cloned();
                        }
                    }
                    self.state.apply_statuses(&file, statuses);
                }
                let live: BTreeSet<&String> = self
                    .state
                    .statuses
                    .values()
                    .filter_map(|s| s.container_id.as_ref())
                    .collect();
                self.started_at.retain(|id, _| live.contains(id));
                if std::mem::take(&mut self.status_again) {
                    self.poll_status();
                }
            }
            QueryResult::Scan { counts } => {
                self.stats_pending = self.stats_pending.saturating_sub(1);
                // services that stopped running drop out of the counts
                self.state.scan_counts = counts.into_iter().collect();
            }
            QueryResult::Graph { root, graph } => {
                self.pending_cascades.remove(&root);
                let plan = CascadeOperation::plan(&graph, &root);
                self.state.graphs.insert(root.file.clone(), graph);
                self.begin_cascade(root, plan);
            }
            QueryResult::WatchAvailable(available) => {
                tracing::debug!(available, "compose watch probe");
                self.state.watch_available = Some(available);
            }
            QueryResult::Worktrees {
                key,
                git_root,
                worktrees,
            } => self.open_worktree_picker(key, git_root, worktrees),
            QueryResult::SwitchChecked {
                key,
                manifest,
                label,
                result,
            } => match result {
                Ok(()) => {
                    tracing::info!(service = %key, manifest = %manifest.display(), %label, "worktree switched");
                    self.state.set_override(&key, manifest, label);
                    self.start_operation(key, OperationKind::Rebuild);
                }
                Err(e) => self.switch_failed(&key, e),
            },
            QueryResult::ExecContainer { key, container_id } => {
                if self.state.exec.target.as_ref() != Some(&key) {
                    return;
                }
                if container_id.is_none() {
                    self.state.exec.push_output(format!("{} has no running container", key.service));
                }
                self.state.exec.container_id = container_id;
            }
        }
    }

    // ========================================================================
    // Polling
    // ========================================================================

    /// Refresh container status for every manifest. A request while a poll
    /// is running is folded into one follow-up poll.
    pub fn poll_status(&mut self) {
        if self.shut_down {
            return;
        }
        if self.status_in_flight {
            self.status_again = true;
            return;
        }
        self.status_in_flight = true;

        let files: Vec<PathBuf> = self
            .state
            .groups
            .iter()
            .filter(|g| g.discovery_error.is_none())
            .map(|g| g.file.clone())
            .collect();
        // containers already running at the last poll with a known start time
        let known: BTreeSet<String> = self
            .state
            .statuses
            .values()
            .filter(|s| s.is_running())
            .filter_map(|s| s.container_id.clone())
            .filter(|id| self.started_at.contains_key(id))
            .collect();

        let backend = self.backend.clone();
        let tx = self.query_tx.clone();
        self.queries.spawn(async move {
            let mut polled = Vec::with_capacity(files.len());
            let mut started = Vec::new();
            for file in files {
                let statuses = backend.statuses(&file).await;
                for status in statuses.values().filter(|s| s.is_running()) {
                    let Some(id) = &status.container_id else {
                        continue;
                    };
                    if known.contains(id) {
                        continue;
                    }
                    if let Some(at) = backend.started_at(id).await {
                        started.push((id.clone(), at));
                    }
                }
                polled.push((file, statuses));
            }
            let _ = tx.send(QueryResult::Statuses { polled, started });
        });
    }

    /// The container was recreated or restarted; look its start time up again
    fn forget_started_at(&mut self, key: &ServiceKey) {
        if let Some(id) = self.state.statuses.get(key).and_then(|s| s.container_id.as_ref()) {
            self.started_at.remove(id);
        }
    }

    /// Sample CPU and memory of running containers and scan their recent logs
    pub fn poll_stats(&mut self) {
        if self.shut_down || self.stats_pending > 0 {
            return;
        }
        let running = self.state.running_keys();
        if running.is_empty() {
            return;
        }

        let ids: Vec<String> = running.iter().map(|(_, id)| id.clone()).collect();
        let invocation = self.backend.container_stats(&ids);
        match self.spawn(&invocation, Tracked::Stats) {
            Ok(handle) => {
                self.stats_proc = Some(handle);
                self.stats_pending += 1;
            }
            Err(e) => tracing::debug!(error = %e, "stats sample failed"),
        }

        if self.config.log_scan_patterns.is_empty() {
            return;
        }
        let patterns = self.config.log_scan_patterns.clone();
        let lines = self.config.log_scan_lines;
        let backend = self.backend.clone();
        let tx = self.query_tx.clone();
        self.stats_pending += 1;
        self.queries.spawn(async move {
            let mut counts = Vec::with_capacity(running.len());
            for (key, id) in running {
                let recent = backend.recent_logs(&id, lines).await;
                counts.push((key, PatternCounts::scan(&recent, &patterns)));
            }
            let _ = tx.send(QueryResult::Scan { counts });
        });
    }

    // ========================================================================
    // Bottom panel: passive tail and search
    // ========================================================================

    /// Tail the logs of `key` into its panel. Tails of other services are
    /// stopped unless an operation is running on them.
    fn attach_tail(&mut self, key: ServiceKey) {
        let stale: Vec<ServiceKey> = self
            .panel_tails
            .keys()
            .filter(|k| **k != key && !self.registry.is_busy(k))
            .cloned()
            .collect();
        for k in stale {
            if let Some(handle) = self.panel_tails.remove(&k) {
                self.cancel(handle);
            }
        }

        if self.panel_tails.contains_key(&key) || self.registry.is_busy(&key) {
            return;
        }
        if self.state.panel_search.as_ref().is_some_and(|(k, _)| *k == key) {
            return;
        }
        match self.state.panel_action(&key) {
            Some(action) if action.is_failure() => return,
            Some(LogAction::Started) => self.state.reset_panel(&key, LogAction::Started),
            _ => self.state.reset_panel(&key, LogAction::Logs),
        }

        let invocation = self
            .backend
            .tail_logs(&self.target(&key), &key.service, self.config.log_panel_lines);
        match self.spawn(&invocation, Tracked::PanelTail { key: key.clone() }) {
            Ok(handle) => {
                tracing::debug!(service = %key, "tail attached");
                self.panel_tails.insert(key, handle);
            }
            Err(e) => tracing::warn!(service = %key, error = %e, "failed to tail logs"),
        }
    }

    fn submit_search(&mut self) {
        let query = std::mem::take(&mut self.state.search_input);
        self.state.overlay = Overlay::None;
        match self.state.mode {
            Mode::Logs => self.search_full_log(&query),
            _ => self.search_panel(&query),
        }
    }

    fn search_panel(&mut self, query: &str) {
        if query.is_empty() {
            self.clear_panel_search();
            return;
        }
        if let Some(handle) = self.search_fetch.take() {
            self.cancel(handle);
        }
        let Some(key) = self.state.begin_panel_search(query) else {
            return;
        };

        let invocation = self
            .backend
            .fetch_logs(&self.target(&key), &key.service, TailDepth::All);
        let purpose = Tracked::PanelSearchFetch {
            key: key.clone(),
            lines: Vec::new(),
        };
        match self.spawn(&invocation, purpose) {
            Ok(handle) => self.search_fetch = Some(handle),
            Err(e) => {
                tracing::warn!(service = %key, error = %e, "history fetch failed");
                self.state.complete_panel_search(&key, &[]);
            }
        }
    }

    fn clear_panel_search(&mut self) {
        if let Some(handle) = self.search_fetch.take() {
            self.cancel(handle);
        }
        self.state.clear_panel_search();
    }

    // ========================================================================
    // Full log view
    // ========================================================================

    fn open_full_log(&mut self, key: ServiceKey) {
        self.close_full_log();

        let building = self.state.panel_action(&key).is_some_and(|a| a.is_build());
        if building {
            let lines = self.state.build_logs.get(&key).cloned().unwrap_or_default();
            self.state.full_log = Some(FullLogBuffer::from_build(key, lines));
        } else {
            let invocation = match self.container_id(&key) {
                Some(id) => self.backend.tail_container_logs(&id, INITIAL_TAIL),
                None => self.backend.tail_logs(&self.target(&key), &key.service, INITIAL_TAIL),
            };
            self.state.full_log = Some(FullLogBuffer::live(key.clone()));
            match self.spawn(&invocation, Tracked::FullTail) {
                Ok(handle) => self.full_tail = Some(handle),
                Err(e) => tracing::warn!(service = %key, error = %e, "failed to tail logs"),
            }
        }
        self.state.mode = Mode::Logs;
        self.state.overlay = Overlay::None;
    }

    fn close_full_log(&mut self) {
        if let Some(handle) = self.full_tail.take() {
            self.cancel(handle);
        }
        if let Some(handle) = self.history_fetch.take() {
            self.cancel(handle);
        }
        self.state.full_log = None;
        self.state.mode = Mode::List;
        self.state.overlay = Overlay::None;
    }

    fn scroll_full_log(&mut self, scroll: impl FnOnce(&mut FullLogBuffer, usize)) {
        let rows = self.viewport;
        let Some(view) = self.state.full_log.as_mut() else {
            return;
        };
        scroll(view, rows);
        if !view.wants_escalation() {
            return;
        }
        if let Some(depth) = view.begin_fetch() {
            self.spawn_history_fetch(depth);
        }
    }

    fn search_full_log(&mut self, query: &str) {
        let Some(view) = self.state.full_log.as_mut() else {
            return;
        };
        if let SearchStart::Fetch(depth) = view.request_search(query) {
            self.spawn_history_fetch(depth);
        }
    }

    /// Fetch `depth` lines of history for the open view. The view has
    /// already recorded the fetch as in flight.
    fn spawn_history_fetch(&mut self, depth: TailDepth) {
        let Some(key) = self.state.full_log.as_ref().map(|v| v.key.clone()) else {
            return;
        };
        let invocation = match self.container_id(&key) {
            Some(id) => self.backend.fetch_container_logs(&id, depth),
            None => self.backend.fetch_logs(&self.target(&key), &key.service, depth),
        };
        if let Some(handle) = self.history_fetch.take() {
            self.cancel(handle);
        }
        match self.spawn(&invocation, Tracked::HistoryFetch { lines: Vec::new() }) {
            Ok(handle) => {
                tracing::debug!(service = %key, depth = %depth.arg(), "fetching history");
                self.history_fetch = Some(handle);
            }
            Err(e) => {
                tracing::warn!(service = %key, error = %e, "history fetch failed");
                if let Some(view) = self.state.full_log.as_mut() {
                    view.fail_fetch();
                }
            }
        }
    }

    // ========================================================================
    // Exec
    // ========================================================================

    fn open_exec(&mut self, key: ServiceKey) {
        if self.state.exec.target.as_ref() != Some(&key) {
            self.interrupt_exec();
        }
        let container_id = self.container_id(&key);
        let lookup = container_id.is_none();
        self.state.exec.attach(key.clone(), container_id);
        if !lookup {
            return;
        }

        let target = self.target(&key);
        let backend = self.backend.clone();
        let tx = self.query_tx.clone();
        self.queries.spawn(async move {
            let container_id = backend.container_id(&target, &key.service).await;
            let _ = tx.send(QueryResult::ExecContainer { key, container_id });
        });
    }

    fn submit_exec(&mut self) {
        let Some(request) = self.state.exec.submit() else {
            return;
        };
        let Some(container_id) = self.state.exec.container_id.clone() else {
            self.state
                .exec
                .finish(false, vec!["no running container".to_string()]);
            return;
        };

        let invocation =
            self.backend
                .exec(&container_id, request.command(), self.state.exec.cwd.as_deref());
        let purpose = Tracked::Exec {
            capture: matches!(request, ExecRequest::Cd { .. }),
            lines: Vec::new(),
        };
        match self.spawn(&invocation, purpose) {
            Ok(handle) => self.exec_proc = Some(handle),
            Err(e) => self
                .state
                .exec
                .finish(false, vec![format!("failed to run {}: {e}", invocation.program)]),
        }
    }

    fn interrupt_exec(&mut self) {
        if let Some(handle) = self.exec_proc.take() {
            self.cancel(handle);
            self.state.exec.finish(false, vec!["^C".to_string()]);
        }
    }

    // ========================================================================
    // Worktrees
    // ========================================================================

    fn request_worktrees(&mut self, key: ServiceKey) {
        let dir = key
            .file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let backend = self.backend.clone();
        let tx = self.query_tx.clone();
        self.queries.spawn(async move {
            let git_root = backend.git_root(&dir).await;
            let worktrees = match &git_root {
                Some(root) => backend.worktrees(root).await,
                None => Vec::new(),
            };
            let _ = tx.send(QueryResult::Worktrees {
                key,
                git_root,
                worktrees,
            });
        });
    }

    fn open_worktree_picker(&mut self, key: ServiceKey, git_root: Option<PathBuf>, worktrees: Vec<Worktree>) {
        let Some(git_root) = git_root else {
            self.state.notice = Some(format!("{} is not in a git repository", key.service));
            return;
        };
        if worktrees.is_empty() {
            self.state.notice = Some("no worktrees found".to_string());
            return;
        }
        // the user moved on while git was answering
        if self.state.mode != Mode::List || self.state.overlay != Overlay::None {
            return;
        }
        let active = self.state.effective_file(&key);
        self.state.picker = Some(WorktreePicker::new(key, git_root, worktrees, Some(&active)));
        self.state.overlay = Overlay::WorktreePicker;
    }

    fn select_worktree(&mut self) {
        let Some(picker) = self.state.picker.take() else {
            return;
        };
        self.state.overlay = Overlay::None;
        let key = picker.key.clone();
        let label = picker.selected().map(Worktree::label).unwrap_or_default();

        let manifest = match picker.target_manifest() {
            Ok(manifest) => manifest,
            Err(e) => {
                self.switch_failed(&key, e);
                return;
            }
        };

        let backend = self.backend.clone();
        let tx = self.query_tx.clone();
        self.queries.spawn(async move {
            let result = if tokio::fs::metadata(&manifest).await.is_err() {
                Err(SwitchError::ManifestMissing(manifest.clone()))
            } else if !backend.service_defined_in(&manifest, &key.service).await {
                Err(SwitchError::ServiceMissing {
                    service: key.service.clone(),
                    manifest: manifest.clone(),
                })
            } else {
                Ok(())
            };
            let _ = tx.send(QueryResult::SwitchChecked {
                key,
                manifest,
                label,
                result,
            });
        });
    }

    fn switch_failed(&mut self, key: &ServiceKey, error: SwitchError) {
        tracing::warn!(service = %key, %error, "worktree switch refused");
        self.clear_panel_for_operation(key, LogAction::SwitchFailed);
        self.state.push_panel_lines(key, vec![error.to_string()], false);
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Kill every process we started and stop all timers. SIGTERM first,
    /// SIGKILL after the grace period. Returns how many processes were
    /// signalled; a second call does nothing.
    pub async fn shutdown(&mut self) -> usize {
        if self.shut_down {
            return 0;
        }
        self.shut_down = true;

        let mut handles: Vec<ProcessHandle> =
            self.registry.drain().into_iter().map(|(_, handle)| handle).collect();
        handles.extend(std::mem::take(&mut self.panel_tails).into_values());
        handles.extend(
            [
                self.full_tail.take(),
                self.history_fetch.take(),
                self.search_fetch.take(),
                self.exec_proc.take(),
                self.stats_proc.take(),
            ]
            .into_iter()
            .flatten(),
        );

        self.ops.clear();
        self.queries.abort_all();
        self.pending_cascades.clear();
        self.tail_debounce.cancel();
        self.render.cancel();
        self.state.chord.cancel();
        self.status_in_flight = false;
        self.status_again = false;
        self.stats_pending = 0;

        tracing::info!(processes = handles.len(), "shutting down");
        for handle in &handles {
            handle.kill(libc::SIGTERM);
        }
        if !handles.is_empty() {
            tokio::time::sleep(KILL_GRACE).await;
            for handle in &handles {
                handle.kill(libc::SIGKILL);
            }
        }
        handles.len()
    }
}
