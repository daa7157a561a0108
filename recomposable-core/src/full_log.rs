//! Full-screen log view buffer
//!
//! The view starts from a live tail of [`INITIAL_TAIL`] lines and pulls older
//! history on demand in escalating depths. Only one history fetch runs at a
//! time, and once a fetch comes back without anything new the history is
//! considered exhausted and never requested again.
//!
//! When the view is opened on a service whose build is running (or just
//! failed) the buffer mirrors the build output instead and has no history.

use crate::logs::find_matches;
use crate::model::ServiceKey;

/// Lines requested by the live tail when the view opens
pub const INITIAL_TAIL: usize = 200;

/// Scrolling within this many lines of the top pulls more history
pub const NEAR_TOP_LINES: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailDepth {
    Lines(usize),
    All,
}

impl TailDepth {
    /// Next step of the 200 → 1000 → 5000 → all ladder
    pub fn next(self) -> Option<TailDepth> {
        match self {
            TailDepth::Lines(n) if n < 1000 => Some(TailDepth::Lines(1000)),
            TailDepth::Lines(n) if n < 5000 => Some(TailDepth::Lines(5000)),
            TailDepth::Lines(_) => Some(TailDepth::All),
            TailDepth::All => None,
        }
    }

    /// Value for `--tail`
    pub fn arg(&self) -> String {
        match self {
            TailDepth::Lines(n) => n.to_string(),
            TailDepth::All => "all".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
struct InFlight {
    depth: TailDepth,
    /// Buffer length when the fetch was requested
    base_len: usize,
}

#[derive(Clone, Copy, Debug)]
struct SavedScroll {
    offset: usize,
    auto_scroll: bool,
}

/// Outcome of asking for a search
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchStart {
    /// Matches are computed and the view jumped to the first one
    Applied,
    /// The whole history has to be fetched first; start this fetch
    Fetch(TailDepth),
    /// A fetch is already running; the search runs once it lands
    Waiting,
}

#[derive(Clone, Debug)]
pub struct FullLogBuffer {
    pub key: ServiceKey,
    pub lines: Vec<String>,
    pub fetched_depth: TailDepth,
    pub history_fully_loaded: bool,
    pub query: Option<String>,
    pub matches: Vec<usize>,
    pub match_cursor: Option<usize>,
    /// Index of the first visible line when not auto-scrolling
    pub scroll_offset: usize,
    pub auto_scroll: bool,
    /// Set when the view mirrors a build instead of container logs
    pub build_key: Option<ServiceKey>,
    pub pending_search: Option<String>,
    in_flight: Option<InFlight>,
    saved_scroll: Option<SavedScroll>,
}

impl FullLogBuffer {
    /// View over a live container tail
    pub fn live(key: ServiceKey) -> Self {
        Self {
            key,
            lines: Vec::new(),
            fetched_depth: TailDepth::Lines(INITIAL_TAIL),
            history_fully_loaded: false,
            query: None,
            matches: Vec::new(),
            match_cursor: None,
            scroll_offset: 0,
            auto_scroll: true,
            build_key: None,
            pending_search: None,
            in_flight: None,
            saved_scroll: None,
        }
    }

    /// View over the captured output of a build
    pub fn from_build(key: ServiceKey, lines: Vec<String>) -> Self {
        let mut buffer = Self::live(key.clone());
        buffer.lines = lines;
        buffer.build_key = Some(key);
        buffer.history_fully_loaded = true;
        buffer
    }

    pub fn is_build_view(&self) -> bool {
        self.build_key.is_some()
    }

    pub fn fetch_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Append lines from the live tail or the mirrored build
    pub fn push_lines<I>(&mut self, lines: I)
    where
        I: IntoIterator<Item = String>,
    {
        let before = self.lines.len();
        self.lines.extend(lines);
        if self.lines.len() == before {
            return;
        }
        if let Some(query) = &self.query {
            let start = before;
            let needle = query.to_lowercase();
            for (i, line) in self.lines[start..].iter().enumerate() {
                if line.to_lowercase().contains(&needle) {
                    self.matches.push(start + i);
                }
            }
            if self.match_cursor.is_none() && !self.matches.is_empty() {
                self.match_cursor = Some(0);
            }
        }
    }

    // ========================================================================
    // History escalation
    // ========================================================================

    /// Start the next escalation step. `None` when a fetch is already
    /// running, the history is exhausted, or this is a build view.
    pub fn begin_fetch(&mut self) -> Option<TailDepth> {
        if self.history_fully_loaded || self.in_flight.is_some() {
            return None;
        }
        let depth = self.fetched_depth.next()?;
        self.start_fetch(depth)
    }

    fn start_fetch(&mut self, depth: TailDepth) -> Option<TailDepth> {
        if self.history_fully_loaded || self.in_flight.is_some() {
            return None;
        }
        self.in_flight = Some(InFlight {
            depth,
            base_len: self.lines.len(),
        });
        Some(depth)
    }

    /// Whether the viewport sits near the top with more history to pull
    pub fn wants_escalation(&self) -> bool {
        !self.auto_scroll
            && self.scroll_offset <= NEAR_TOP_LINES
            && !self.history_fully_loaded
            && self.in_flight.is_none()
    }

    /// Land a history fetch. Lines that arrived on the live tail while the
    /// fetch ran are kept after the fetched history, and the viewport stays
    /// on the same content. A fetch taken after live lines arrived already
    /// ends with them; that overlap is kept only once. Returns a follow-up
    /// fetch when a pending search still needs the full history.
    pub fn complete_fetch(&mut self, mut fetched: Vec<String>) -> Option<TailDepth> {
        let Some(InFlight { depth, base_len }) = self.in_flight.take() else {
            return None;
        };
        let base_len = base_len.min(self.lines.len());
        let exhausted = match depth {
            TailDepth::All => true,
            TailDepth::Lines(n) => fetched.len() < n,
        };

        let live = self.lines.split_off(base_len);
        let overlap = tail_overlap(&fetched, &live);
        fetched.truncate(fetched.len() - overlap);

        if fetched.len() <= base_len {
            // nothing older than what we already have
            self.lines.extend(live);
            self.history_fully_loaded = true;
        } else {
            let prepended = fetched.len() - base_len;
            self.lines = fetched;
            self.lines.extend(live);
            if !self.auto_scroll {
                self.scroll_offset += prepended;
            }
            if let Some(saved) = self.saved_scroll.as_mut() {
                saved.offset += prepended;
            }
            self.fetched_depth = depth;
            self.history_fully_loaded = exhausted;
            if self.query.is_some() {
                self.recompute_matches();
            }
        }

        self.resume_pending_search()
    }

    /// The fetch failed; nothing changes except that a new one may start.
    /// A pending search runs against whatever is already buffered.
    pub fn fail_fetch(&mut self) {
        self.in_flight = None;
        if let Some(query) = self.pending_search.take() {
            self.apply_search(&query);
        }
    }

    fn resume_pending_search(&mut self) -> Option<TailDepth> {
        let query = self.pending_search.take()?;
        if self.history_fully_loaded {
            self.apply_search(&query);
            None
        } else {
            self.pending_search = Some(query);
            self.start_fetch(TailDepth::All)
        }
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Search the buffer. Without the full history loaded the fetch of
    /// everything is forced first and the search runs on completion.
    pub fn request_search(&mut self, query: &str) -> SearchStart {
        if query.is_empty() {
            self.clear_search();
            return SearchStart::Applied;
        }
        if self.history_fully_loaded {
            self.apply_search(query);
            return SearchStart::Applied;
        }
        self.pending_search = Some(query.to_string());
        if self.in_flight.is_some() {
            return SearchStart::Waiting;
        }
        match self.start_fetch(TailDepth::All) {
            Some(depth) => SearchStart::Fetch(depth),
            None => SearchStart::Waiting,
        }
    }

    fn apply_search(&mut self, query: &str) {
        if self.saved_scroll.is_none() {
            self.saved_scroll = Some(SavedScroll {
                offset: self.scroll_offset,
                auto_scroll: self.auto_scroll,
            });
        }
        self.query = Some(query.to_string());
        self.recompute_matches();
        if let Some(&first) = self.matches.first() {
            self.scroll_offset = first;
            self.auto_scroll = false;
        }
    }

    fn recompute_matches(&mut self) {
        let Some(query) = &self.query else {
            return;
        };
        self.matches = find_matches(&self.lines, query);
        self.match_cursor = if self.matches.is_empty() {
            None
        } else {
            Some(self.match_cursor.unwrap_or(0).min(self.matches.len() - 1))
        };
    }

    /// Drop the search and put the viewport back where it was
    pub fn clear_search(&mut self) {
        self.query = None;
        self.pending_search = None;
        self.matches.clear();
        self.match_cursor = None;
        if let Some(saved) = self.saved_scroll.take() {
            self.scroll_offset = saved.offset;
            self.auto_scroll = saved.auto_scroll;
        }
    }

    pub fn has_search(&self) -> bool {
        self.query.is_some() || self.pending_search.is_some()
    }

    /// Jump to the next match, wrapping to the first. Returns the line index.
    pub fn next_match(&mut self) -> Option<usize> {
        self.step_match(true)
    }

    /// Jump to the previous match, wrapping to the last
    pub fn prev_match(&mut self) -> Option<usize> {
        self.step_match(false)
    }

    fn step_match(&mut self, forward: bool) -> Option<usize> {
        let len = self.matches.len();
        if len == 0 {
            return None;
        }
        let cursor = match self.match_cursor {
            None => 0,
            Some(c) if forward => (c + 1) % len,
            Some(c) => (c + len - 1) % len,
        };
        self.match_cursor = Some(cursor);
        let line = self.matches[cursor];
        self.scroll_offset = line;
        self.auto_scroll = false;
        Some(line)
    }

    // ========================================================================
    // Scrolling
    // ========================================================================

    fn max_offset(&self, viewport: usize) -> usize {
        self.lines.len().saturating_sub(viewport)
    }

    /// First visible line for a viewport of `viewport` rows
    pub fn top(&self, viewport: usize) -> usize {
        if self.auto_scroll {
            self.max_offset(viewport)
        } else {
            self.scroll_offset.min(self.max_offset(viewport))
        }
    }

    pub fn visible(&self, viewport: usize) -> &[String] {
        let top = self.top(viewport);
        let end = (top + viewport).min(self.lines.len());
        &self.lines[top..end]
    }

    pub fn scroll_up(&mut self, n: usize, viewport: usize) {
        self.scroll_offset = self.top(viewport).saturating_sub(n);
        self.auto_scroll = false;
    }

    /// Scrolling onto the last line re-enables auto-scroll
    pub fn scroll_down(&mut self, n: usize, viewport: usize) {
        let target = self.top(viewport) + n;
        if target >= self.max_offset(viewport) {
            self.scroll_to_bottom();
        } else {
            self.scroll_offset = target;
            self.auto_scroll = false;
        }
    }

    pub fn scroll_to_top(&mut self) {
        self.scroll_offset = 0;
        self.auto_scroll = false;
    }

    pub fn scroll_to_bottom(&mut self) {
        self.auto_scroll = true;
    }
}

/// Longest run of lines that ends `fetched` and starts `live`
fn tail_overlap(fetched: &[String], live: &[String]) -> usize {
    (1..=fetched.len().min(live.len()))
        .rev()
        .find(|&k| fetched[fetched.len() - k..] == live[..k])
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ServiceKey {
        ServiceKey::new("/app/compose.yml", "api")
    }

    fn numbered(range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("line {i}")).collect()
    }

    #[test]
    fn test_depth_ladder() {
        let mut depth = TailDepth::Lines(INITIAL_TAIL);
        let mut seen = Vec::new();
        while let Some(next) = depth.next() {
            seen.push(next.arg());
            depth = next;
        }
        assert_eq!(seen, vec!["1000", "5000", "all"]);
    }

    #[test]
    fn test_second_fetch_while_in_flight_is_noop() {
        let mut buf = FullLogBuffer::live(key());
        buf.push_lines(numbered(0..200));
        assert_eq!(buf.begin_fetch(), Some(TailDepth::Lines(1000)));
        assert_eq!(buf.begin_fetch(), None);
        assert!(buf.fetch_in_flight());
    }

    #[test]
    fn test_fetch_prepends_history_and_keeps_live_lines() {
        let mut buf = FullLogBuffer::live(key());
        buf.push_lines(numbered(800..1000));
        buf.scroll_up(10, 20);
        let before_top = buf.lines[buf.scroll_offset].clone();

        buf.begin_fetch();
        buf.push_lines(vec!["live during fetch".to_string()]);
        buf.complete_fetch(numbered(0..1000));

        assert_eq!(buf.lines.len(), 1001);
        assert_eq!(buf.lines[0], "line 0");
        assert_eq!(buf.lines.last().unwrap(), "live during fetch");
        assert_eq!(buf.lines[buf.scroll_offset], before_top);
        assert_eq!(buf.fetched_depth, TailDepth::Lines(1000));
        assert!(!buf.history_fully_loaded);
    }

    #[test]
    fn test_fetch_overlapping_live_lines_keeps_one_copy() {
        let mut buf = FullLogBuffer::live(key());
        buf.push_lines(numbered(800..1000));
        buf.scroll_up(10, 20);
        let before_top = buf.lines[buf.scroll_offset].clone();

        buf.begin_fetch();
        buf.push_lines(numbered(1000..1002));
        // the tail was read after the live lines were logged
        buf.complete_fetch(numbered(2..1002));

        assert_eq!(buf.lines, numbered(2..1002));
        assert_eq!(buf.lines[buf.scroll_offset], before_top);
        assert!(!buf.history_fully_loaded);
    }

    #[test]
    fn test_fetch_of_only_known_lines_exhausts_history() {
        let mut buf = FullLogBuffer::live(key());
        buf.push_lines(numbered(0..50));
        buf.begin_fetch();
        buf.push_lines(numbered(50..52));
        buf.complete_fetch(numbered(0..52));

        assert_eq!(buf.lines, numbered(0..52));
        assert!(buf.history_fully_loaded);
    }

    #[test]
    fn test_fetch_that_adds_nothing_exhausts_history() {
        let mut buf = FullLogBuffer::live(key());
        buf.push_lines(numbered(0..50));
        buf.begin_fetch();
        buf.complete_fetch(numbered(0..50));

        assert!(buf.history_fully_loaded);
        assert_eq!(buf.lines.len(), 50);
        // never asked again
        assert_eq!(buf.begin_fetch(), None);
        assert!(buf.history_fully_loaded);
    }

    #[test]
    fn test_short_fetch_marks_exhausted() {
        let mut buf = FullLogBuffer::live(key());
        buf.push_lines(numbered(100..300));
        buf.begin_fetch();
        buf.complete_fetch(numbered(0..300));
        assert!(buf.history_fully_loaded);
        assert_eq!(buf.lines.len(), 300);
    }

    #[test]
    fn test_near_top_wants_escalation() {
        let mut buf = FullLogBuffer::live(key());
        buf.push_lines(numbered(0..200));
        assert!(!buf.wants_escalation());
        buf.scroll_to_top();
        assert!(buf.wants_escalation());
        buf.begin_fetch();
        assert!(!buf.wants_escalation());
    }

    #[test]
    fn test_build_view_has_no_history() {
        let mut buf = FullLogBuffer::from_build(key(), vec!["#1 building".into()]);
        assert!(buf.is_build_view());
        assert_eq!(buf.begin_fetch(), None);
        assert_eq!(buf.request_search("building"), SearchStart::Applied);
        assert_eq!(buf.matches, vec![0]);
    }

    #[test]
    fn test_search_forces_full_fetch_first() {
        let mut buf = FullLogBuffer::live(key());
        buf.push_lines(vec!["recent ERROR".to_string()]);

        assert_eq!(buf.request_search("error"), SearchStart::Fetch(TailDepth::All));
        assert!(buf.matches.is_empty());

        let mut history = vec!["old error".to_string(), "fine".to_string()];
        history.push("recent ERROR".to_string());
        assert_eq!(buf.complete_fetch(history), None);

        assert!(buf.history_fully_loaded);
        assert_eq!(buf.matches, vec![0, 2]);
        assert_eq!(buf.scroll_offset, 0);
    }

    #[test]
    fn test_search_waits_for_running_fetch_then_fetches_all() {
        let mut buf = FullLogBuffer::live(key());
        buf.push_lines(numbered(0..200));
        buf.begin_fetch();
        assert_eq!(buf.request_search("line 5"), SearchStart::Waiting);

        let follow_up = buf.complete_fetch(numbered(0..1000));
        assert_eq!(follow_up, Some(TailDepth::All));
        assert_eq!(buf.complete_fetch(numbered(0..1000)), None);
        assert!(buf.matches.contains(&5));
    }

    #[test]
    fn test_match_navigation_wraps() {
        let mut buf = FullLogBuffer::from_build(
            key(),
            vec!["a hit".into(), "miss".into(), "b HIT".into(), "c hit".into()],
        );
        buf.request_search("hit");
        assert_eq!(buf.match_cursor, Some(0));
        assert_eq!(buf.next_match(), Some(2));
        assert_eq!(buf.next_match(), Some(3));
        assert_eq!(buf.next_match(), Some(0));
        assert_eq!(buf.prev_match(), Some(3));
    }

    #[test]
    fn test_clear_search_restores_viewport() {
        let mut buf = FullLogBuffer::from_build(key(), numbered(0..100));
        assert!(buf.auto_scroll);
        buf.request_search("line 3");
        assert!(!buf.auto_scroll);
        buf.clear_search();
        assert!(buf.auto_scroll);
        assert!(!buf.has_search());
    }

    #[test]
    fn test_live_lines_extend_matches() {
        let mut buf = FullLogBuffer::from_build(key(), vec!["warn one".into()]);
        buf.request_search("warn");
        buf.push_lines(vec!["ok".into(), "WARN two".into()]);
        assert_eq!(buf.matches, vec![0, 2]);
    }

    #[test]
    fn test_scrolling_toggles_autoscroll() {
        let mut buf = FullLogBuffer::live(key());
        buf.push_lines(numbered(0..100));
        assert_eq!(buf.top(10), 90);
        buf.scroll_up(5, 10);
        assert_eq!(buf.top(10), 85);
        assert!(!buf.auto_scroll);
        buf.scroll_down(100, 10);
        assert!(buf.auto_scroll);
        assert_eq!(buf.visible(10).len(), 10);
    }
}
