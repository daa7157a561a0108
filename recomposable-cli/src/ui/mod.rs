//! Rendering
//!
//! Pure function of [`App`] state: nothing here changes what the dashboard
//! does, apart from reporting the full log viewport height back.

pub mod theme;

use chrono::Utc;
use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph},
};

use recomposable_core::compose::{format_uptime, parse_started_at};
use recomposable_core::input::{Mode, Overlay};
use recomposable_core::logs::{LogAction, PanelSearchState};
use recomposable_core::model::{ContainerStatus, ServiceKey};
use recomposable_core::registry::ActiveOperation;
use recomposable_core::stats::format_bytes;
use recomposable_core::text::{strip_ansi, truncate};

use crate::app::App;
pub use theme::styles;

const NAME_WIDTH: usize = 22;

pub fn draw(f: &mut Frame, app: &mut App) {
    let area = f.area();

    // [ header ]
    // [ body   ]
    // [ footer ]
    let outer = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(1),
            Constraint::Length(1),
        ])
        .split(area);

    draw_header(f, app, outer[0]);
    match app.state.mode {
        Mode::List => draw_list_mode(f, app, outer[1]),
        Mode::Logs => draw_full_log(f, app, outer[1]),
        Mode::Exec => draw_exec(f, app, outer[1]),
    }
    draw_footer(f, app, outer[2]);

    match app.state.overlay {
        Overlay::ExecPrompt => draw_exec_prompt(f, app, area),
        Overlay::WorktreePicker => draw_worktree_picker(f, app, area),
        Overlay::None | Overlay::Search => {}
    }
}

fn fit_title(s: &str, width: u16) -> String {
    // borders plus a space either side
    truncate(s, width.saturating_sub(4) as usize)
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}

// ---------------- Header ----------------

fn draw_header(f: &mut Frame, app: &App, area: Rect) {
    let state = &app.state;
    let running = state.statuses.values().filter(|s| s.is_running()).count();

    let (watch_label, watch_style) = match state.watch_available {
        Some(true) => ("watch ok", styles::success()),
        Some(false) => ("watch n/a", styles::text_muted()),
        None => ("watch ?", styles::text_muted()),
    };
    let (cache_label, cache_style) = if state.no_cache {
        ("no-cache on", styles::warn())
    } else {
        ("no-cache off", styles::text_muted())
    };

    let mut spans = vec![
        Span::styled(" recomposable ", styles::accent_bold()),
        Span::styled(
            format!("{}/{} running", running, state.entries.len()),
            styles::success(),
        ),
        Span::raw("  "),
        Span::styled(cache_label, cache_style),
        Span::raw("  "),
        Span::styled(watch_label, watch_style),
    ];
    let busy = app.registry().len();
    if busy > 0 {
        spans.push(Span::raw("  "));
        spans.push(Span::styled(format!("{busy} in flight"), styles::warn()));
    }
    f.render_widget(Paragraph::new(Line::from(spans)), area);
}

// ---------------- Service list + bottom panel ----------------

fn draw_list_mode(f: &mut Frame, app: &App, area: Rect) {
    let panel_height = bordered_rows(app.state.panel_lines).min(area.height / 2);
    let parts = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(panel_height)])
        .split(area);

    draw_services(f, app, parts[0]);
    draw_panel(f, app, parts[1]);
}

fn draw_services(f: &mut Frame, app: &App, area: Rect) {
    let state = &app.state;
    let mut items: Vec<ListItem> = Vec::new();
    let mut selected_row = None;
    let mut flat_index = 0;

    for group in &state.groups {
        let header = match &group.discovery_error {
            Some(err) => Line::from(vec![
                Span::styled(format!("{} ", group.label), styles::section_header()),
                Span::styled(truncate(err, 80), styles::error()),
            ]),
            None => Line::from(Span::styled(group.label.clone(), styles::section_header())),
        };
        items.push(ListItem::new(header));

        for service in &group.services {
            if flat_index == state.cursor {
                selected_row = Some(items.len());
            }
            let key = ServiceKey::new(group.file.clone(), service.clone());
            items.push(ListItem::new(service_row(app, &key)));
            flat_index += 1;
        }
    }

    let block = Block::default()
        .title(" Services ")
        .borders(Borders::ALL)
        .border_style(styles::border_subtle());
    let list = List::new(items)
        .block(block)
        .highlight_style(styles::selection())
        .highlight_symbol("▶ ");
    let mut list_state = ListState::default().with_selected(selected_row);
    f.render_stateful_widget(list, area, &mut list_state);
}

fn service_row(app: &App, key: &ServiceKey) -> Line<'static> {
    let state = &app.state;
    let status = state.statuses.get(key);
    let container_state = status.map(|s| &s.state);

    let mut spans = vec![
        Span::styled(
            format!("{} ", styles::state_icon(container_state)),
            styles::state(container_state),
        ),
        Span::styled(
            format!("{:<width$}", truncate(&key.service, NAME_WIDTH), width = NAME_WIDTH),
            styles::text(),
        ),
        Span::styled(
            format!(
                "{:<10}",
                container_state.map(|s| s.label().to_string()).unwrap_or_else(|| "-".into())
            ),
            styles::state(container_state),
        ),
    ];

    if let Some(health) = status.and_then(|s| s.health.as_ref()) {
        spans.push(Span::styled(
            format!("{} {:<10}", styles::health_icon(health), health.label()),
            styles::health(health),
        ));
    } else {
        spans.push(Span::raw(format!("{:<12}", "")));
    }

    spans.push(Span::styled(format!("{:<8}", uptime(status)), styles::info()));

    match state.stats.average(key) {
        Some(avg) => spans.push(Span::styled(
            format!(
                "{:>6.1}% {:>9}  ",
                avg.cpu_percent,
                format_bytes(avg.memory_bytes)
            ),
            styles::text_dim(),
        )),
        None => spans.push(Span::raw(format!("{:19}", ""))),
    }

    if let Some(ports) = status.map(ContainerStatus::ports_label).filter(|p| !p.is_empty()) {
        spans.push(Span::styled(format!("{ports}  "), styles::text_muted()));
    }
    if let Some(counts) = state.scan_counts.get(key).filter(|c| c.total() > 0) {
        spans.push(Span::styled(format!("{}  ", counts.label()), styles::warn()));
    }
    if let Some(label) = status.and_then(|s| s.worktree_label.as_deref()) {
        spans.push(Span::styled(format!("⎇ {label}  "), styles::info()));
    } else if let Some(o) = state.overrides.get(key) {
        spans.push(Span::styled(format!("⎇ {}  ", o.label), styles::info()));
    }
    if let Some(tag) = operation_tag(app, key) {
        spans.push(Span::styled(tag, styles::warn()));
    }

    Line::from(spans)
}

fn uptime(status: Option<&ContainerStatus>) -> String {
    status
        .filter(|s| s.is_running())
        .and_then(|s| s.started_at.as_deref())
        .and_then(parse_started_at)
        .map(|started| format_uptime(started, Utc::now()))
        .unwrap_or_default()
}

fn operation_tag(app: &App, key: &ServiceKey) -> Option<String> {
    let active = app.registry().active(key)?;
    Some(match active {
        ActiveOperation::Cascade => match app.registry().cascade(key) {
            Some(cascade) => format!("[cascade {}]", cascade.summary()),
            None => "[cascade]".to_string(),
        },
        other => format!("[{other}]"),
    })
}

fn draw_panel(f: &mut Frame, app: &App, area: Rect) {
    let state = &app.state;
    let Some(key) = state.selected_key() else {
        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(styles::border_subtle());
        f.render_widget(block, area);
        return;
    };

    let panel = state.panels.get(&key);
    let action = panel.map(|p| p.action).unwrap_or(LogAction::Logs);

    let mut title = vec![
        Span::styled(format!(" {} ", key.service), styles::text()),
        Span::styled(format!("[{}] ", action.label()), styles::action(action)),
    ];
    if let Some((_, search)) = state.panel_search.as_ref().filter(|(k, _)| *k == key) {
        let status = match search.state {
            PanelSearchState::Fetching => "searching…".to_string(),
            PanelSearchState::Results { matches } => format!("{matches} matches"),
        };
        title.push(Span::styled(
            format!("/{} ({status}) ", search.query),
            styles::accent_bold(),
        ));
    }

    let block = Block::default()
        .title(Line::from(title))
        .borders(Borders::ALL)
        .border_style(if action.is_failure() {
            styles::error()
        } else {
            styles::border_subtle()
        });
    let inner = block.inner(area);
    let width = inner.width as usize;

    let lines: Vec<Line> = panel
        .map(|p| {
            let skip = p.lines.len().saturating_sub(inner.height as usize);
            p.lines
                .iter()
                .skip(skip)
                .map(|l| Line::from(truncate(&strip_ansi(l), width)))
                .collect()
        })
        .unwrap_or_default();

    f.render_widget(Paragraph::new(lines).style(styles::text_dim()).block(block), area);
}

// ---------------- Full log view ----------------

fn draw_full_log(f: &mut Frame, app: &mut App, area: Rect) {
    let rows = area.height.saturating_sub(2) as usize;
    app.set_viewport(rows);

    let Some(view) = app.state.full_log.as_ref() else {
        return;
    };

    let mut title = format!(" Logs: {}", view.key.service);
    if view.is_build_view() {
        title.push_str(" [build]");
    } else if view.auto_scroll {
        title.push_str(" [LIVE]");
    }
    if view.fetch_in_flight() {
        title.push_str(" [loading…]");
    } else if view.history_fully_loaded {
        title.push_str(" [all history]");
    }
    if let Some(query) = &view.query {
        let current = view.match_cursor.map(|c| c + 1).unwrap_or(0);
        title.push_str(&format!(" [/{} ({}/{})]", query, current, view.matches.len()));
    } else if let Some(pending) = &view.pending_search {
        title.push_str(&format!(" [/{pending} …]"));
    }
    title.push(' ');

    let block = Block::default()
        .title(fit_title(&title, area.width))
        .borders(Borders::ALL)
        .border_style(styles::border_focused());
    let width = area.width.saturating_sub(2) as usize;

    let top = view.top(rows);
    let current = view.match_cursor.and_then(|c| view.matches.get(c)).copied();
    let lines: Vec<Line> = view
        .visible(rows)
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            let index = top + i;
            let text = truncate(&strip_ansi(raw), width);
            let style = if view.matches.binary_search(&index).is_ok() {
                styles::search_match(current == Some(index))
            } else {
                styles::text()
            };
            Line::from(Span::styled(text, style))
        })
        .collect();

    f.render_widget(Paragraph::new(lines).block(block), area);
}

// ---------------- Exec ----------------

fn exec_prompt_line(app: &App) -> Line<'static> {
    let exec = &app.state.exec;
    let cwd = exec.cwd.clone().unwrap_or_else(|| "~".into());
    let mut spans = vec![
        Span::styled(format!("{cwd} $ "), styles::accent_bold()),
        Span::styled(exec.input.clone(), styles::text()),
    ];
    if exec.is_running() {
        spans.push(Span::styled("  (running, Ctrl-C to interrupt)", styles::text_muted()));
    } else {
        spans.push(Span::styled("█", styles::text_dim()));
    }
    Line::from(spans)
}

fn exec_body(f: &mut Frame, app: &App, block: Block, area: Rect) {
    let exec = &app.state.exec;
    let inner = block.inner(area);
    f.render_widget(block, area);

    let parts = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(1), Constraint::Length(1)])
        .split(inner);

    let width = parts[0].width as usize;
    let skip = exec.output.len().saturating_sub(parts[0].height as usize);
    let output: Vec<Line> = if exec.container_id.is_none() {
        vec![Line::from(Span::styled(
            "container is not running",
            styles::error(),
        ))]
    } else {
        exec.output
            .iter()
            .skip(skip)
            .map(|l| Line::from(truncate(&strip_ansi(l), width)))
            .collect()
    };
    f.render_widget(Paragraph::new(output).style(styles::text_dim()), parts[0]);
    f.render_widget(Paragraph::new(exec_prompt_line(app)), parts[1]);
}

fn exec_title(app: &App) -> String {
    let service = app
        .state
        .exec
        .target
        .as_ref()
        .map(|k| k.service.as_str())
        .unwrap_or("-");
    format!(" Exec: {service} ")
}

fn draw_exec(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(fit_title(&exec_title(app), area.width))
        .borders(Borders::ALL)
        .border_style(styles::border_focused());
    exec_body(f, app, block, area);
}

fn draw_exec_prompt(f: &mut Frame, app: &App, area: Rect) {
    let width = (area.width * 70 / 100).max(40);
    let rect = centered(area, width, 12);
    f.render_widget(Clear, rect);
    let block = Block::default()
        .title(fit_title(&exec_title(app), rect.width))
        .borders(Borders::ALL)
        .border_style(styles::border_focused());
    exec_body(f, app, block, rect);
}

// ---------------- Worktree picker ----------------

fn draw_worktree_picker(f: &mut Frame, app: &App, area: Rect) {
    let Some(picker) = app.state.picker.as_ref() else {
        return;
    };
    let active = app.state.overrides.get(&picker.key).map(|o| o.manifest.as_path());

    let height = bordered_rows(picker.entries.len()).clamp(4, area.height.saturating_sub(4).max(4));
    let width = (area.width * 60 / 100).clamp(30, 80);
    let rect = centered(area, width, height);
    f.render_widget(Clear, rect);

    let inner_width = rect.width.saturating_sub(4) as usize;
    let items: Vec<ListItem> = picker
        .entries
        .iter()
        .map(|wt| {
            let here = active.is_some_and(|m| m.starts_with(&wt.path))
                || (active.is_none() && picker.key.file.starts_with(&wt.path));
            let marker = if here { "● " } else { "  " };
            let text = format!("{marker}{}  {}", wt.label(), wt.path.display());
            ListItem::new(Span::styled(truncate(&text, inner_width), styles::text()))
        })
        .collect();

    let block = Block::default()
        .title(fit_title(&format!(" Worktree: {} ", picker.key.service), rect.width))
        .borders(Borders::ALL)
        .border_style(styles::border_focused());
    let list = List::new(items)
        .block(block)
        .highlight_style(styles::selection());
    let mut state = ListState::default().with_selected(Some(picker.cursor));
    f.render_stateful_widget(list, rect, &mut state);
}

// ---------------- Footer ----------------

fn hint(key: &'static str, label: &'static str) -> [Span<'static>; 2] {
    [
        Span::styled(key, styles::key_hint()),
        Span::styled(label, styles::text_dim()),
    ]
}

fn draw_footer(f: &mut Frame, app: &App, area: Rect) {
    let state = &app.state;

    if state.overlay == Overlay::Search {
        let line = Line::from(vec![
            Span::styled("/", styles::accent_bold()),
            Span::styled(state.search_input.clone(), styles::text()),
            Span::styled("█", styles::text_dim()),
        ]);
        f.render_widget(Paragraph::new(line), area);
        return;
    }

    if let Some(notice) = &state.notice {
        f.render_widget(
            Paragraph::new(Span::styled(notice.clone(), styles::warn())),
            area,
        );
        return;
    }

    let pairs: &[(&'static str, &'static str)] = match (state.mode, state.overlay) {
        (_, Overlay::WorktreePicker) => &[("↑↓", " move  "), ("Enter", " switch  "), ("Esc", " close")],
        (_, Overlay::ExecPrompt) | (Mode::Exec, _) => &[
            ("Enter", " run  "),
            ("↑↓", " history  "),
            ("^C", " interrupt  "),
            ("Esc", " close"),
        ],
        (Mode::Logs, _) => &[
            ("↑↓", " scroll  "),
            ("gg/G", " top/bottom  "),
            ("/", " search  "),
            ("n/N", " match  "),
            ("Esc", " back  "),
            ("q", " close"),
        ],
        (Mode::List, _) => &[
            ("b", " rebuild  "),
            ("d", " cascade  "),
            ("r", " restart  "),
            ("s", " stop  "),
            ("u", " start  "),
            ("w", " watch  "),
            ("n", " no-cache  "),
            ("l", " logs  "),
            ("e/x", " exec  "),
            ("t", " worktree  "),
            ("/", " search  "),
            ("q", " quit"),
        ],
    };

    let mut spans: Vec<Span> = vec![Span::raw(" ")];
    for &(key, label) in pairs {
        spans.extend(hint(key, label));
    }
    if state.chord.is_pending() {
        spans.push(Span::styled("  g…", styles::accent_bold()));
    }
    f.render_widget(Paragraph::new(Line::from(spans)), area);
}

/// Height of a bordered block holding `rows` lines, saturating at the terminal limit
fn bordered_rows(rows: usize) -> u16 {
    u16::try_from(rows).unwrap_or(u16::MAX).saturating_add(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bordered_rows_saturates() {
        assert_eq!(bordered_rows(10), 12);
        assert_eq!(bordered_rows(65_534), u16::MAX);
        assert_eq!(bordered_rows(70_000), u16::MAX);
        assert_eq!(bordered_rows(70_000).min(40 / 2), 20);
    }
}
