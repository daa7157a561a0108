//! Counting interesting patterns in recent log output

/// Occurrences of each pattern, in pattern order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatternCounts {
    pub counts: Vec<(String, usize)>,
}

impl PatternCounts {
    /// Count case-insensitive occurrences of every pattern across `lines`
    pub fn scan<S: AsRef<str>>(lines: &[S], patterns: &[String]) -> Self {
        let needles: Vec<String> = patterns.iter().map(|p| p.to_lowercase()).collect();
        let mut counts: Vec<(String, usize)> = patterns.iter().map(|p| (p.clone(), 0)).collect();

        for line in lines {
            let line = line.as_ref().to_lowercase();
            for (needle, (_, count)) in needles.iter().zip(counts.iter_mut()) {
                if !needle.is_empty() {
                    *count += line.matches(needle.as_str()).count();
                }
            }
        }

        Self { counts }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().map(|(_, n)| n).sum()
    }

    /// `error:3 warn:1`, leaving out patterns that never matched
    pub fn label(&self) -> String {
        self.counts
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(p, n)| format!("{p}:{n}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_counts_case_insensitive() {
        let lines = ["ERROR boot", "warn: slow", "error error", "fine"];
        let patterns = vec!["error".to_string(), "warn".to_string(), "panic".to_string()];
        let counts = PatternCounts::scan(&lines, &patterns);
        assert_eq!(counts.counts[0], ("error".to_string(), 3));
        assert_eq!(counts.counts[1].1, 1);
        assert_eq!(counts.total(), 4);
        assert_eq!(counts.label(), "error:3 warn:1");
    }

    #[test]
    fn test_empty_pattern_never_matches() {
        let counts = PatternCounts::scan(&["x"], &[String::new()]);
        assert_eq!(counts.total(), 0);
        assert_eq!(counts.label(), "");
    }
}
