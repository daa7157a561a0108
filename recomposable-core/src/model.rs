use std::fmt;
use std::path::{Path, PathBuf};

/// Stable identity of a service: the manifest it was discovered in plus its name.
///
/// The file is always the *original* manifest path, even while a worktree
/// override redirects execution elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey {
    pub file: PathBuf,
    pub service: String,
}

impl ServiceKey {
    pub fn new(file: impl Into<PathBuf>, service: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            service: service.into(),
        }
    }

    /// Key for another service defined in the same manifest
    pub fn sibling(&self, service: &str) -> Self {
        Self {
            file: self.file.clone(),
            service: service.to_string(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.file.display(), self.service)
    }
}

/// One compose manifest and the services discovered in it
#[derive(Clone, Debug)]
pub struct ServiceGroup {
    pub file: PathBuf,
    pub label: String,
    pub services: Vec<String>,
    /// Short single-line error when discovery failed
    pub discovery_error: Option<String>,
}

impl ServiceGroup {
    pub fn new(file: PathBuf, services: Vec<String>) -> Self {
        let label = group_label(&file);
        Self {
            file,
            label,
            services,
            discovery_error: None,
        }
    }

    pub fn failed(file: PathBuf, error: impl Into<String>) -> Self {
        let label = group_label(&file);
        Self {
            file,
            label,
            services: Vec::new(),
            discovery_error: Some(error.into()),
        }
    }
}

/// Label shown for a manifest: `<parent dir>/<file name>`
pub fn group_label(file: &Path) -> String {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file.display().to_string());
    match file
        .parent()
        .and_then(|p| p.file_name())
        .map(|p| p.to_string_lossy().to_string())
    {
        Some(dir) if !dir.is_empty() => format!("{}/{}", dir, name),
        _ => name,
    }
}

/// Denormalized row of the navigable service list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlatEntry {
    pub group_index: usize,
    pub service_index: usize,
    pub service: String,
    pub file: PathBuf,
}

impl FlatEntry {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.file.clone(), self.service.clone())
    }
}

/// Flatten groups into the cursor index, skipping groups that failed discovery
pub fn flatten(groups: &[ServiceGroup]) -> Vec<FlatEntry> {
    groups
        .iter()
        .enumerate()
        .flat_map(|(gi, group)| {
            group
                .services
                .iter()
                .enumerate()
                .map(move |(si, name)| FlatEntry {
                    group_index: gi,
                    service_index: si,
                    service: name.clone(),
                    file: group.file.clone(),
                })
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Removing,
    Dead,
    Other(String),
}

impl ContainerState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "restarting" => Self::Restarting,
            "paused" => Self::Paused,
            "exited" => Self::Exited,
            "removing" => Self::Removing,
            "dead" => Self::Dead,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Paused => "paused",
            Self::Exited => "exited",
            Self::Removing => "removing",
            Self::Dead => "dead",
            Self::Other(s) => s,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
}

impl HealthStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "healthy" => Some(Self::Healthy),
            "unhealthy" => Some(Self::Unhealthy),
            "starting" => Some(Self::Starting),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Starting => "starting",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortMapping {
    pub published: u16,
    pub target: u16,
    pub protocol: String,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.protocol.is_empty() || self.protocol == "tcp" {
            write!(f, "{}->{}", self.published, self.target)
        } else {
            write!(f, "{}->{}/{}", self.published, self.target, self.protocol)
        }
    }
}

/// Last polled state of a service's container
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub health: Option<HealthStatus>,
    pub created_at: Option<String>,
    pub started_at: Option<String>,
    pub container_id: Option<String>,
    pub ports: Vec<PortMapping>,
    pub worktree_label: Option<String>,
}

impl ContainerStatus {
    pub fn new(state: ContainerState) -> Self {
        Self {
            state,
            health: None,
            created_at: None,
            started_at: None,
            container_id: None,
            ports: Vec::new(),
            worktree_label: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    pub fn ports_label(&self) -> String {
        self.ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_key_display() {
        let key = ServiceKey::new("/srv/app/compose.yml", "api");
        assert_eq!(key.to_string(), "/srv/app/compose.yml::api");
        assert_eq!(key.sibling("db").service, "db");
        assert_eq!(key.sibling("db").file, key.file);
    }

    #[test]
    fn test_flatten_skips_failed_groups() {
        let groups = vec![
            ServiceGroup::new("/a/compose.yml".into(), vec!["api".into(), "db".into()]),
            ServiceGroup::failed("/b/compose.yml".into(), "no such file"),
            ServiceGroup::new("/c/compose.yml".into(), vec!["web".into()]),
        ];
        let flat = flatten(&groups);
        assert_eq!(flat.len(), 3);
        assert_eq!(flat[2].group_index, 2);
        assert_eq!(flat[2].service_index, 0);
        assert_eq!(flat[1].key(), ServiceKey::new("/a/compose.yml", "db"));
    }

    #[test]
    fn test_group_label() {
        assert_eq!(group_label(Path::new("/srv/shop/compose.yml")), "shop/compose.yml");
        assert_eq!(group_label(Path::new("compose.yml")), "compose.yml");
    }

    #[test]
    fn test_container_state_parse() {
        assert_eq!(ContainerState::parse("Running"), ContainerState::Running);
        assert_eq!(
            ContainerState::parse("weird"),
            ContainerState::Other("weird".into())
        );
        assert_eq!(HealthStatus::parse(""), None);
        assert_eq!(HealthStatus::parse("healthy"), Some(HealthStatus::Healthy));
    }
}
