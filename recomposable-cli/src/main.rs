mod app;
mod backend;
mod logging;
mod process;
mod ui;

use std::io;
use std::panic;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use futures_util::StreamExt;
use ratatui::{Terminal, backend::CrosstermBackend};
use tokio::time::MissedTickBehavior;

use recomposable_core::config::Config;
use recomposable_core::input::Key;
use recomposable_core::model::ServiceGroup;

use app::App;
use backend::{ComposeBackend, ComposeCli};

#[derive(Parser, Debug)]
#[command(name = "recomposable")]
#[command(about = "Supervise docker compose services from one terminal dashboard")]
#[command(version)]
struct Cli {
    /// Compose file to supervise (repeatable; overrides the config file)
    #[arg(short = 'f', long = "file")]
    files: Vec<PathBuf>,

    /// Path to recomposable.json
    #[arg(long)]
    config: Option<PathBuf>,

    /// More log detail (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory for log files
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

type Tui = Terminal<CrosstermBackend<io::Stdout>>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "fatal");
            eprintln!("recomposable: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let _log_guard = logging::init_logging(cli.log_dir.clone(), cli.verbose)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting");

    let cwd = std::env::current_dir().context("cannot read the current directory")?;
    let config = match Config::discover(cli.config.as_deref(), &cwd)? {
        Some((path, config)) => {
            tracing::info!(path = %path.display(), "loaded config");
            config
        }
        None => Config::default(),
    };

    let manifests = config.resolve_manifests(&cli.files, &cwd);
    if manifests.is_empty() {
        eprintln!(
            "recomposable: no compose file in {} (pass -f or set composeFiles)",
            cwd.display()
        );
        return Ok(ExitCode::from(1));
    }

    let backend: Arc<dyn ComposeBackend> = Arc::new(ComposeCli::new(config.query_timeout()));
    let groups = discover_groups(backend.as_ref(), &manifests).await;
    if groups.iter().all(|g| g.services.is_empty()) {
        for group in &groups {
            let reason = group.discovery_error.as_deref().unwrap_or("no services");
            eprintln!("recomposable: {}: {reason}", group.file.display());
        }
        return Ok(ExitCode::from(1));
    }

    let mut app = App::new(backend, config, groups);

    install_panic_hook();
    let mut terminal = setup_terminal().context("cannot set up the terminal")?;
    let result = event_loop(&mut terminal, &mut app).await;
    restore_terminal(&mut terminal).context("cannot restore the terminal")?;

    let signalled = app.shutdown().await;
    tracing::info!(signalled, "shut down");

    result.map(|_| ExitCode::SUCCESS)
}

/// List the services of every manifest; failures become error groups
async fn discover_groups(backend: &dyn ComposeBackend, manifests: &[PathBuf]) -> Vec<ServiceGroup> {
    let lookups = manifests.iter().map(|file| async move {
        match backend.list_services(file).await {
            Ok(services) => {
                tracing::debug!(file = %file.display(), count = services.len(), "discovered services");
                ServiceGroup::new(file.clone(), services)
            }
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "service discovery failed");
                ServiceGroup::failed(file.clone(), e)
            }
        }
    });
    futures_util::future::join_all(lookups).await
}

// --- Terminal setup/teardown ---
fn setup_terminal() -> io::Result<Tui> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

fn restore_terminal(terminal: &mut Tui) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Leave raw mode and the alternate screen before the panic message prints
fn install_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        original_hook(panic_info);
    }));
}

fn convert_key(key: KeyEvent) -> Key {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    match key.code {
        KeyCode::Char(c) if ctrl => Key::Ctrl(c.to_ascii_lowercase()),
        KeyCode::Char(c) => Key::Char(c),
        KeyCode::Enter => Key::Enter,
        KeyCode::Esc => Key::Esc,
        KeyCode::Backspace => Key::Backspace,
        KeyCode::Up => Key::Up,
        KeyCode::Down => Key::Down,
        KeyCode::PageUp => Key::PageUp,
        KeyCode::PageDown => Key::PageDown,
        KeyCode::Home => Key::Home,
        KeyCode::End => Key::End,
        _ => Key::Other,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

async fn event_loop(terminal: &mut Tui, app: &mut App) -> Result<()> {
    let mut events = EventStream::new();

    let mut status_tick = tokio::time::interval(app.config().status_poll());
    status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // start() already polls once
    status_tick.reset();
    let mut stats_tick = tokio::time::interval(app.config().stats_poll());
    stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    app.start(Instant::now());

    loop {
        let now = Instant::now();
        if app.render_due(now) {
            terminal.draw(|f| ui::draw(f, app))?;
            app.rendered(now);
        }
        if app.should_quit() {
            return Ok(());
        }

        let deadline = app.next_deadline();
        tokio::select! {
            maybe = events.next() => match maybe {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                    app.handle_key(convert_key(key), Instant::now());
                }
                Some(Ok(Event::Resize(..))) => app.request_render(),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("terminal input failed"),
                None => return Ok(()),
            },
            Some(event) = app.next_event() => app.handle_event(event),
            _ = status_tick.tick() => app.poll_status(),
            _ = stats_tick.tick() => app.poll_stats(),
            _ = sleep_until(deadline) => app.on_timer(Instant::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_ctrl_keys() {
        let key = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(convert_key(key), Key::Ctrl('c'));
        let key = KeyEvent::new(KeyCode::Char('G'), KeyModifiers::SHIFT);
        assert_eq!(convert_key(key), Key::Char('G'));
        let key = KeyEvent::new(KeyCode::F(5), KeyModifiers::NONE);
        assert_eq!(convert_key(key), Key::Other);
    }

    #[test]
    fn test_cli_repeatable_files() {
        let cli = Cli::parse_from(["recomposable", "-f", "a.yml", "--file", "b.yml", "-vv"]);
        assert_eq!(cli.files, vec![PathBuf::from("a.yml"), PathBuf::from("b.yml")]);
        assert_eq!(cli.verbose, 2);
        assert!(cli.config.is_none());
    }
}
