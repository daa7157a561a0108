//! Keystroke interpretation
//!
//! Keys are translated into [`Action`]s against the current [`Mode`] and
//! [`Overlay`]. The only state kept here is the pending `g` of the `gg` chord.

use std::time::{Duration, Instant};

pub const CHORD_TIMEOUT: Duration = Duration::from_millis(300);

/// Terminal-independent key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Ctrl(char),
    Enter,
    Esc,
    Backspace,
    Up,
    Down,
    PageUp,
    PageDown,
    Home,
    End,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    List,
    Logs,
    Exec,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Overlay {
    #[default]
    None,
    /// Search prompt (bottom panel in LIST, buffer in LOGS)
    Search,
    /// One-line exec prompt under the list
    ExecPrompt,
    WorktreePicker,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    None,
    /// First half of a chord; wait for the second key
    Pending,
    Quit,

    MoveCursor(isize),
    CursorTop,
    CursorBottom,

    Rebuild,
    CascadeRebuild,
    Restart,
    Stop,
    Start,
    ToggleWatch,
    ToggleNoCache,

    OpenLogs,
    OpenExec,
    OpenExecPrompt,
    OpenWorktreePicker,
    OpenSearch,
    ClearSearch,

    InputChar(char),
    InputBackspace,
    InputSubmit,
    InputCancel,
    HistoryPrev,
    HistoryNext,
    Interrupt,

    PickerMove(isize),
    PickerSelect,
    PickerClose,

    Scroll(isize),
    PageUp,
    PageDown,
    ScrollTop,
    ScrollBottom,
    NextMatch,
    PrevMatch,
    /// Esc in LOGS: clear the search if there is one, otherwise leave
    Back,
    LeaveView,
}

// ============================================================================
// Chord state
// ============================================================================

/// Pending first key of a two-key chord, valid until its deadline
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChordState {
    pending: Option<(char, Instant)>,
}

impl ChordState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed `c`. Returns true when it completes a chord started by the same key.
    pub fn feed(&mut self, c: char, now: Instant) -> bool {
        match self.pending.take() {
            Some((first, deadline)) if first == c && now <= deadline => true,
            _ => {
                self.pending = Some((c, now + CHORD_TIMEOUT));
                false
            }
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|(_, at)| at)
    }

    /// Drop the pending key once its deadline passed
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.pending {
            Some((_, at)) if now > at => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

// ============================================================================
// Interpreter
// ============================================================================

pub fn interpret(
    mode: Mode,
    overlay: Overlay,
    chord: &mut ChordState,
    key: Key,
    now: Instant,
) -> Action {
    // Any key other than `g` abandons a half-typed chord
    if key != Key::Char('g') {
        chord.cancel();
    }

    match (mode, overlay) {
        (Mode::Exec, _) | (Mode::List, Overlay::ExecPrompt) => exec_key(mode, key),
        (_, Overlay::Search) => prompt_key(key),
        (Mode::List, Overlay::WorktreePicker) => picker_key(key),
        (Mode::List, Overlay::None) => list_key(chord, key, now),
        (Mode::Logs, _) => logs_key(chord, key, now),
    }
}

fn list_key(chord: &mut ChordState, key: Key, now: Instant) -> Action {
    match key {
        Key::Char('q') | Key::Ctrl('c') => Action::Quit,
        Key::Char('j') | Key::Down => Action::MoveCursor(1),
        Key::Char('k') | Key::Up => Action::MoveCursor(-1),
        Key::Char('g') => {
            if chord.feed('g', now) {
                Action::CursorTop
            } else {
                Action::Pending
            }
        }
        Key::Char('G') | Key::End => Action::CursorBottom,
        Key::Home => Action::CursorTop,
        Key::Char('b') => Action::Rebuild,
        Key::Char('d') => Action::CascadeRebuild,
        Key::Char('r') => Action::Restart,
        Key::Char('s') => Action::Stop,
        Key::Char('u') => Action::Start,
        Key::Char('w') => Action::ToggleWatch,
        Key::Char('n') => Action::ToggleNoCache,
        Key::Char('l') | Key::Enter => Action::OpenLogs,
        Key::Char('e') => Action::OpenExec,
        Key::Char('x') => Action::OpenExecPrompt,
        Key::Char('t') => Action::OpenWorktreePicker,
        Key::Char('/') => Action::OpenSearch,
        Key::Esc => Action::ClearSearch,
        _ => Action::None,
    }
}

fn logs_key(chord: &mut ChordState, key: Key, now: Instant) -> Action {
    match key {
        Key::Ctrl('c') => Action::Quit,
        Key::Char('q') => Action::LeaveView,
        Key::Esc => Action::Back,
        Key::Char('j') | Key::Down => Action::Scroll(1),
        Key::Char('k') | Key::Up => Action::Scroll(-1),
        Key::Ctrl('d') | Key::PageDown => Action::PageDown,
        Key::Ctrl('u') | Key::PageUp => Action::PageUp,
        Key::Char('g') => {
            if chord.feed('g', now) {
                Action::ScrollTop
            } else {
                Action::Pending
            }
        }
        Key::Home => Action::ScrollTop,
        Key::Char('G') | Key::End => Action::ScrollBottom,
        Key::Char('/') => Action::OpenSearch,
        Key::Char('n') => Action::NextMatch,
        Key::Char('N') => Action::PrevMatch,
        _ => Action::None,
    }
}

fn prompt_key(key: Key) -> Action {
    match key {
        Key::Ctrl('c') => Action::Quit,
        Key::Enter => Action::InputSubmit,
        Key::Esc => Action::InputCancel,
        Key::Backspace => Action::InputBackspace,
        Key::Char(c) => Action::InputChar(c),
        _ => Action::None,
    }
}

fn exec_key(mode: Mode, key: Key) -> Action {
    match key {
        Key::Ctrl('c') => Action::Interrupt,
        Key::Enter => Action::InputSubmit,
        Key::Esc if mode == Mode::Exec => Action::LeaveView,
        Key::Esc => Action::InputCancel,
        Key::Backspace => Action::InputBackspace,
        Key::Up => Action::HistoryPrev,
        Key::Down => Action::HistoryNext,
        Key::Char(c) => Action::InputChar(c),
        _ => Action::None,
    }
}

fn picker_key(key: Key) -> Action {
    match key {
        Key::Ctrl('c') => Action::Quit,
        Key::Char('j') | Key::Down => Action::PickerMove(1),
        Key::Char('k') | Key::Up => Action::PickerMove(-1),
        Key::Enter => Action::PickerSelect,
        Key::Esc | Key::Char('q') => Action::PickerClose,
        _ => Action::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(chord: &mut ChordState, key: Key, now: Instant) -> Action {
        interpret(Mode::List, Overlay::None, chord, key, now)
    }

    #[test]
    fn test_gg_within_timeout() {
        let start = Instant::now();
        let mut chord = ChordState::new();
        assert_eq!(list(&mut chord, Key::Char('g'), start), Action::Pending);
        assert_eq!(
            list(&mut chord, Key::Char('g'), start + Duration::from_millis(200)),
            Action::CursorTop
        );
        assert!(!chord.is_pending());
    }

    #[test]
    fn test_gg_after_timeout_restarts_chord() {
        let start = Instant::now();
        let mut chord = ChordState::new();
        list(&mut chord, Key::Char('g'), start);
        assert_eq!(
            list(&mut chord, Key::Char('g'), start + Duration::from_millis(301)),
            Action::Pending
        );
    }

    #[test]
    fn test_other_key_cancels_chord() {
        let start = Instant::now();
        let mut chord = ChordState::new();
        list(&mut chord, Key::Char('g'), start);
        assert_eq!(list(&mut chord, Key::Char('j'), start), Action::MoveCursor(1));
        assert_eq!(list(&mut chord, Key::Char('g'), start), Action::Pending);
    }

    #[test]
    fn test_chord_expire() {
        let start = Instant::now();
        let mut chord = ChordState::new();
        chord.feed('g', start);
        assert_eq!(chord.deadline(), Some(start + CHORD_TIMEOUT));
        assert!(!chord.expire(start + Duration::from_millis(100)));
        assert!(chord.expire(start + Duration::from_millis(400)));
        assert!(!chord.is_pending());
    }

    #[test]
    fn test_list_action_keys() {
        let now = Instant::now();
        let mut chord = ChordState::new();
        assert_eq!(list(&mut chord, Key::Char('b'), now), Action::Rebuild);
        assert_eq!(list(&mut chord, Key::Char('d'), now), Action::CascadeRebuild);
        assert_eq!(list(&mut chord, Key::Char('w'), now), Action::ToggleWatch);
        assert_eq!(list(&mut chord, Key::Enter, now), Action::OpenLogs);
        assert_eq!(list(&mut chord, Key::Ctrl('c'), now), Action::Quit);
    }

    #[test]
    fn test_search_prompt_captures_letters() {
        let now = Instant::now();
        let mut chord = ChordState::new();
        let action = interpret(Mode::List, Overlay::Search, &mut chord, Key::Char('q'), now);
        assert_eq!(action, Action::InputChar('q'));
        let action = interpret(Mode::Logs, Overlay::Search, &mut chord, Key::Esc, now);
        assert_eq!(action, Action::InputCancel);
    }

    #[test]
    fn test_logs_keys() {
        let now = Instant::now();
        let mut chord = ChordState::new();
        let logs = |chord: &mut ChordState, key| interpret(Mode::Logs, Overlay::None, chord, key, now);
        assert_eq!(logs(&mut chord, Key::Ctrl('d')), Action::PageDown);
        assert_eq!(logs(&mut chord, Key::Char('N')), Action::PrevMatch);
        assert_eq!(logs(&mut chord, Key::Esc), Action::Back);
        assert_eq!(logs(&mut chord, Key::Char('q')), Action::LeaveView);
        assert_eq!(logs(&mut chord, Key::Char('g')), Action::Pending);
        assert_eq!(logs(&mut chord, Key::Char('g')), Action::ScrollTop);
    }

    #[test]
    fn test_ctrl_c_interrupts_in_exec() {
        let now = Instant::now();
        let mut chord = ChordState::new();
        let exec = interpret(Mode::Exec, Overlay::None, &mut chord, Key::Ctrl('c'), now);
        assert_eq!(exec, Action::Interrupt);
        let prompt = interpret(Mode::List, Overlay::ExecPrompt, &mut chord, Key::Ctrl('c'), now);
        assert_eq!(prompt, Action::Interrupt);
        let leave = interpret(Mode::Exec, Overlay::None, &mut chord, Key::Esc, now);
        assert_eq!(leave, Action::LeaveView);
    }

    #[test]
    fn test_picker_keys() {
        let now = Instant::now();
        let mut chord = ChordState::new();
        let pick = |chord: &mut ChordState, key| {
            interpret(Mode::List, Overlay::WorktreePicker, chord, key, now)
        };
        assert_eq!(pick(&mut chord, Key::Char('j')), Action::PickerMove(1));
        assert_eq!(pick(&mut chord, Key::Enter), Action::PickerSelect);
        assert_eq!(pick(&mut chord, Key::Char('q')), Action::PickerClose);
    }
}
