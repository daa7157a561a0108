//! Git worktree support
//!
//! A service can be pointed at the same manifest inside another worktree of
//! its repository. The container keeps its identity because the compose
//! project name stays pinned to the original manifest's directory.

use std::path::{Path, PathBuf};

use crate::model::ServiceKey;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Worktree {
    pub path: PathBuf,
    /// Short branch name; `None` for a detached HEAD
    pub branch: Option<String>,
    pub head: Option<String>,
    pub bare: bool,
}

impl Worktree {
    pub fn label(&self) -> String {
        match (&self.branch, &self.head) {
            (Some(branch), _) => branch.clone(),
            (None, Some(head)) => {
                format!("detached@{}", head.chars().take(7).collect::<String>())
            }
            (None, None) => "detached".to_string(),
        }
    }
}

/// Parse `git worktree list --porcelain`. Bare entries are dropped.
pub fn parse_worktree_list(output: &str) -> Vec<Worktree> {
    let mut worktrees = Vec::new();
    let mut current: Option<Worktree> = None;

    for line in output.lines() {
        let line = line.trim_end();
        if let Some(path) = line.strip_prefix("worktree ") {
            worktrees.extend(current.take());
            current = Some(Worktree {
                path: PathBuf::from(path),
                branch: None,
                head: None,
                bare: false,
            });
            continue;
        }
        let Some(wt) = current.as_mut() else { continue };
        if let Some(head) = line.strip_prefix("HEAD ") {
            wt.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
            wt.branch = Some(short.to_string());
        } else if line == "bare" {
            wt.bare = true;
        }
    }
    worktrees.extend(current);

    worktrees.retain(|wt| !wt.bare);
    worktrees
}

/// Where `manifest` lives inside `worktree`, given the repository root the
/// manifest currently sits in. `None` when the manifest is outside the repo.
pub fn map_into_worktree(manifest: &Path, git_root: &Path, worktree: &Path) -> Option<PathBuf> {
    let relative = manifest.strip_prefix(git_root).ok()?;
    Some(worktree.join(relative))
}

/// Compose project name for a manifest directory, normalized the way
/// compose does it: lowercase, only `[a-z0-9_-]`, starting alphanumeric.
pub fn project_name(manifest: &Path) -> Option<String> {
    let dir = manifest.parent()?.file_name()?.to_str()?;
    let normalized: String = dir
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    let trimmed = normalized.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// A service redirected to a manifest in another worktree
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorktreeOverride {
    pub manifest: PathBuf,
    pub label: String,
}

/// Why a worktree switch was refused
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SwitchError {
    OutsideRepository,
    ManifestMissing(PathBuf),
    ServiceMissing { service: String, manifest: PathBuf },
}

impl std::fmt::Display for SwitchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwitchError::OutsideRepository => write!(f, "manifest is not inside the repository"),
            SwitchError::ManifestMissing(path) => {
                write!(f, "{} does not exist in that worktree", path.display())
            }
            SwitchError::ServiceMissing { service, manifest } => {
                write!(f, "service {service} is not defined in {}", manifest.display())
            }
        }
    }
}

/// Open picker for one service
#[derive(Clone, Debug)]
pub struct WorktreePicker {
    pub key: ServiceKey,
    pub git_root: PathBuf,
    pub entries: Vec<Worktree>,
    pub cursor: usize,
}

impl WorktreePicker {
    pub fn new(key: ServiceKey, git_root: PathBuf, entries: Vec<Worktree>, active: Option<&Path>) -> Self {
        // start on the worktree the service currently runs from
        let cursor = active
            .and_then(|manifest| entries.iter().position(|wt| manifest.starts_with(&wt.path)))
            .unwrap_or(0);
        Self {
            key,
            git_root,
            entries,
            cursor,
        }
    }

    pub fn move_cursor(&mut self, delta: isize) {
        if self.entries.is_empty() {
            return;
        }
        let last = self.entries.len() as isize - 1;
        self.cursor = (self.cursor as isize + delta).clamp(0, last) as usize;
    }

    pub fn selected(&self) -> Option<&Worktree> {
        self.entries.get(self.cursor)
    }

    /// Target manifest for the selected worktree. The original checkout
    /// maps back onto the original manifest.
    pub fn target_manifest(&self) -> Result<PathBuf, SwitchError> {
        let worktree = self.selected().ok_or(SwitchError::OutsideRepository)?;
        map_into_worktree(&self.key.file, &self.git_root, &worktree.path)
            .ok_or(SwitchError::OutsideRepository)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORCELAIN: &str = "\
worktree /src/shop
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /src/shop-feature
HEAD 2222222222222222222222222222222222222222
branch refs/heads/feature/payments

worktree /src/shop-detached
HEAD 3333333333333333333333333333333333333333
detached

worktree /src/shop.git
bare
";

    #[test]
    fn test_parse_porcelain() {
        let list = parse_worktree_list(PORCELAIN);
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].path, PathBuf::from("/src/shop"));
        assert_eq!(list[1].label(), "feature/payments");
        assert_eq!(list[2].label(), "detached@3333333");
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_worktree_list("").is_empty());
    }

    #[test]
    fn test_map_into_worktree() {
        let mapped = map_into_worktree(
            Path::new("/src/shop/deploy/compose.yml"),
            Path::new("/src/shop"),
            Path::new("/src/shop-feature"),
        );
        assert_eq!(mapped, Some(PathBuf::from("/src/shop-feature/deploy/compose.yml")));
        assert!(map_into_worktree(Path::new("/etc/compose.yml"), Path::new("/src/shop"), Path::new("/x")).is_none());
    }

    #[test]
    fn test_project_name_normalized() {
        assert_eq!(project_name(Path::new("/src/My.Shop/compose.yml")).as_deref(), Some("myshop"));
        assert_eq!(project_name(Path::new("/src/_shop-1/compose.yml")).as_deref(), Some("shop-1"));
        assert_eq!(project_name(Path::new("/src/.../compose.yml")), None);
    }

    #[test]
    fn test_picker_targets() {
        let key = ServiceKey::new("/src/shop/compose.yml", "api");
        let mut picker = WorktreePicker::new(
            key,
            PathBuf::from("/src/shop"),
            parse_worktree_list(PORCELAIN),
            Some(Path::new("/src/shop-feature/compose.yml")),
        );
        assert_eq!(picker.cursor, 1);
        assert_eq!(
            picker.target_manifest().unwrap(),
            PathBuf::from("/src/shop-feature/compose.yml")
        );
        picker.move_cursor(-5);
        assert_eq!(picker.target_manifest().unwrap(), PathBuf::from("/src/shop/compose.yml"));
        picker.move_cursor(10);
        assert_eq!(picker.cursor, 2);
    }

    #[test]
    fn test_switch_error_messages() {
        let err = SwitchError::ServiceMissing {
            service: "api".into(),
            manifest: PathBuf::from("/w/compose.yml"),
        };
        assert_eq!(err.to_string(), "service api is not defined in /w/compose.yml");
    }
}
