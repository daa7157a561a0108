//! Rolling resource usage per service
//!
//! Each service gets a fixed-capacity circular buffer of CPU% and memory
//! samples. The displayed value is the mean over the filled slots, so a
//! freshly (re)started service is averaged over what it has actually
//! produced rather than over empty slots.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::model::ServiceKey;

pub const DEFAULT_STATS_CAPACITY: usize = 6;

/// Circular sample buffer for a single service
#[derive(Clone, Debug)]
pub struct StatsHistory {
    cpu: Vec<f64>,
    mem: Vec<u64>,
    write_index: usize,
    filled: usize,
}

impl StatsHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            cpu: vec![0.0; capacity],
            mem: vec![0; capacity],
            write_index: 0,
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cpu.len()
    }

    /// Number of valid samples, never more than the capacity
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Overwrite the slot at the write index and advance it
    pub fn push(&mut self, cpu_percent: f64, memory_bytes: u64) {
        self.cpu[self.write_index] = cpu_percent;
        self.mem[self.write_index] = memory_bytes;
        self.write_index = (self.write_index + 1) % self.capacity();
        if self.filled < self.capacity() {
            self.filled += 1;
        }
    }

    pub fn average(&self) -> Option<StatsAverage> {
        if self.filled == 0 {
            return None;
        }
        // Before warm-up the valid slots are exactly [0, filled)
        let cpu: f64 = self.cpu[..self.filled].iter().sum();
        let mem: u128 = self.mem[..self.filled].iter().map(|m| *m as u128).sum();
        Some(StatsAverage {
            cpu_percent: cpu / self.filled as f64,
            memory_bytes: (mem / self.filled as u128) as u64,
            samples: self.filled,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatsAverage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub samples: usize,
}

/// Per-service rolling averages
#[derive(Clone, Debug)]
pub struct StatsAggregator {
    capacity: usize,
    histories: BTreeMap<ServiceKey, StatsHistory>,
}

impl StatsAggregator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            histories: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a sample and return the updated mean
    pub fn record(&mut self, key: &ServiceKey, cpu_percent: f64, memory_bytes: u64) -> StatsAverage {
        let capacity = self.capacity;
        let history = self
            .histories
            .entry(key.clone())
            .or_insert_with(|| StatsHistory::new(capacity));
        history.push(cpu_percent, memory_bytes);
        history.average().unwrap_or(StatsAverage {
            cpu_percent,
            memory_bytes,
            samples: 1,
        })
    }

    pub fn average(&self, key: &ServiceKey) -> Option<StatsAverage> {
        self.histories.get(key).and_then(|h| h.average())
    }

    /// Discard the history; samples from a previous container instance are not comparable
    pub fn reset(&mut self, key: &ServiceKey) {
        self.histories.remove(key);
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_STATS_CAPACITY)
    }
}

// ============================================================================
// Parsing `docker stats --format '{{json .}}'` output
// ============================================================================

/// One decoded line of container stats
#[derive(Clone, Debug, PartialEq)]
pub struct StatsSample {
    pub container_id: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

#[derive(Deserialize)]
struct RawStatsLine {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Container", default)]
    container: String,
    #[serde(rename = "CPUPerc", default)]
    cpu: String,
    #[serde(rename = "MemUsage", default)]
    mem: String,
}

/// Decode one stats line. Malformed JSON yields `None`.
pub fn parse_stats_line(line: &str) -> Option<StatsSample> {
    let raw: RawStatsLine = serde_json::from_str(line.trim()).ok()?;
    let container_id = if raw.id.is_empty() { raw.container } else { raw.id };
    if container_id.is_empty() {
        return None;
    }
    // "12.5MiB / 1.944GiB": only the usage half matters
    let usage = raw.mem.split('/').next().unwrap_or("");
    Some(StatsSample {
        container_id,
        cpu_percent: parse_cpu(&raw.cpu),
        memory_bytes: parse_memory(usage),
    })
}

/// "12.34%" -> 12.34; anything unparseable is 0
pub fn parse_cpu(raw: &str) -> f64 {
    raw.trim()
        .trim_end_matches('%')
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Parse a memory string honoring binary (KiB..TiB) and SI (kB..TB) units.
/// Malformed input parses as 0.
pub fn parse_memory(raw: &str) -> u64 {
    let s = raw.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let Ok(value) = number.parse::<f64>() else {
        return 0;
    };
    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return 0,
    };
    (value * multiplier).round() as u64
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.0}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.0}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ServiceKey {
        ServiceKey::new("/app/compose.yml", "api")
    }

    #[test]
    fn test_average_over_filled_slots_only() {
        let mut h = StatsHistory::new(6);
        h.push(10.0, 100);
        h.push(20.0, 300);
        let avg = h.average().unwrap();
        assert_eq!(avg.samples, 2);
        assert!((avg.cpu_percent - 15.0).abs() < 1e-9);
        assert_eq!(avg.memory_bytes, 200);
    }

    #[test]
    fn test_oldest_sample_evicted_after_capacity_plus_one() {
        let mut h = StatsHistory::new(3);
        h.push(1000.0, 1_000_000);
        h.push(1.0, 1);
        h.push(2.0, 2);
        h.push(3.0, 3);
        let avg = h.average().unwrap();
        assert_eq!(avg.samples, 3);
        assert!((avg.cpu_percent - 2.0).abs() < 1e-9);
        assert_eq!(avg.memory_bytes, 2);
    }

    #[test]
    fn test_empty_history_has_no_average() {
        let h = StatsHistory::new(4);
        assert_eq!(h.filled(), 0);
        assert!(h.average().is_none());
    }

    #[test]
    fn test_aggregator_reset_discards_history() {
        let mut agg = StatsAggregator::new(6);
        agg.record(&key(), 50.0, 10);
        agg.record(&key(), 70.0, 30);
        assert_eq!(agg.average(&key()).unwrap().samples, 2);

        agg.reset(&key());
        assert!(agg.average(&key()).is_none());

        let avg = agg.record(&key(), 5.0, 1);
        assert_eq!(avg.samples, 1);
        assert!((avg.cpu_percent - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_memory_units() {
        assert_eq!(parse_memory("256MiB"), 268_435_456);
        assert_eq!(parse_memory("100MB"), 100_000_000);
        assert_eq!(parse_memory("1.5GiB"), 1_610_612_736);
        assert_eq!(parse_memory("512kB"), 512_000);
        assert_eq!(parse_memory("12B"), 12);
        assert_eq!(parse_memory(" 2KiB "), 2048);
    }

    #[test]
    fn test_parse_memory_malformed() {
        assert_eq!(parse_memory(""), 0);
        assert_eq!(parse_memory("lots"), 0);
        assert_eq!(parse_memory("12XB"), 0);
        assert_eq!(parse_memory("--"), 0);
    }

    #[test]
    fn test_parse_stats_line() {
        let line = r#"{"BlockIO":"0B / 0B","CPUPerc":"3.25%","Container":"abc123","ID":"abc123def456","MemPerc":"1.2%","MemUsage":"24.5MiB / 1.944GiB","Name":"shop-api-1"}"#;
        let sample = parse_stats_line(line).unwrap();
        assert_eq!(sample.container_id, "abc123def456");
        assert!((sample.cpu_percent - 3.25).abs() < 1e-9);
        assert_eq!(sample.memory_bytes, (24.5 * 1024.0 * 1024.0) as u64);
    }

    #[test]
    fn test_parse_stats_line_malformed() {
        assert!(parse_stats_line("not json").is_none());
        assert!(parse_stats_line(r#"{"CPUPerc":"1%"}"#).is_none());
        let sample = parse_stats_line(r#"{"ID":"x","CPUPerc":"--","MemUsage":"?"}"#).unwrap();
        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.memory_bytes, 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2K");
        assert_eq!(format_bytes(268_435_456), "256M");
    }
}
