//! Parsing of compose and docker CLI output
//!
//! Everything here is lenient: malformed records are skipped and the caller
//! sees "no data" rather than an error.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::model::{ContainerState, ContainerStatus, HealthStatus, PortMapping};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsEntry {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    health: String,
    #[serde(default)]
    created_at: JsonValue,
    #[serde(default)]
    publishers: Option<Vec<Publisher>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Publisher {
    #[serde(default)]
    target_port: u16,
    #[serde(default)]
    published_port: u16,
    #[serde(default)]
    protocol: String,
}

impl PsEntry {
    fn into_status(self) -> ContainerStatus {
        let mut status = ContainerStatus::new(ContainerState::parse(&self.state));
        status.health = HealthStatus::parse(&self.health);
        status.container_id = (!self.id.is_empty()).then_some(self.id);
        status.created_at = match self.created_at {
            JsonValue::String(s) if !s.is_empty() => Some(s),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        };

        for p in self.publishers.unwrap_or_default() {
            if p.published_port == 0 {
                continue;
            }
            let mapping = PortMapping {
                published: p.published_port,
                target: p.target_port,
                protocol: p.protocol,
            };
            // IPv4 and IPv6 bindings show up as separate publishers
            if !status.ports.contains(&mapping) {
                status.ports.push(mapping);
            }
        }
        status
    }
}

/// Parse `docker compose ps --format json`, which is a JSON array on older
/// compose releases and one object per line on newer ones.
pub fn parse_ps(output: &str) -> BTreeMap<String, ContainerStatus> {
    let trimmed = output.trim();
    let entries: Vec<PsEntry> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "malformed compose ps output");
            Vec::new()
        })
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    };

    let mut statuses = BTreeMap::new();
    for entry in entries {
        if entry.service.is_empty() {
            continue;
        }
        let service = entry.service.clone();
        let status = entry.into_status();
        // scaled services: a running replica wins over a stopped one
        let keep_existing = statuses
            .get(&service)
            .is_some_and(|existing: &ContainerStatus| existing.is_running() || !status.is_running());
        if !keep_existing {
            statuses.insert(service, status);
        }
    }
    statuses
}

/// Parse `docker compose config --services`
pub fn parse_service_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Whether a compose document declares `service`
pub fn service_defined_in(content: &str, service: &str) -> bool {
    let Ok(doc) = serde_yaml::from_str::<serde_yaml::Value>(content) else {
        return false;
    };
    doc.get("services")
        .and_then(|s| s.as_mapping())
        .is_some_and(|services| services.contains_key(service))
}

/// Parse the `{{.State.StartedAt}}` of `docker inspect`. The zero time
/// docker reports for never-started containers is `None`.
pub fn parse_started_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim().trim_matches('"');
    if raw.is_empty() || raw.starts_with("0001-01-01") {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Compact uptime: `45s`, `12m`, `3h 4m`, `2d 5h`
pub fn format_uptime(started: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - started).num_seconds().max(0);
    let (days, hours, mins) = (secs / 86_400, (secs % 86_400) / 3600, (secs % 3600) / 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else if mins > 0 {
        format!("{mins}m")
    } else {
        format!("{secs}s")
    }
}
