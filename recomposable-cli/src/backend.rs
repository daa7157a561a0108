//! The docker / compose / git command runner
//!
//! Long-running operations are returned as [`Invocation`]s for the event loop
//! to spawn and track. Short queries run here under a timeout and degrade to
//! empty results on any failure.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;

use recomposable_core::compose::{parse_ps, parse_service_list, parse_started_at, service_defined_in};
use recomposable_core::deps::DependencyGraph;
use recomposable_core::full_log::TailDepth;
use recomposable_core::model::ContainerStatus;
use recomposable_core::text::strip_ansi;
use recomposable_core::worktree::{Worktree, parse_worktree_list};

use crate::process::Invocation;

/// Manifest to run against, with the project name pinned when redirected
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComposeTarget {
    pub file: PathBuf,
    pub project: Option<String>,
}

impl ComposeTarget {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            project: None,
        }
    }

    pub fn pinned(file: impl Into<PathBuf>, project: Option<String>) -> Self {
        Self {
            file: file.into(),
            project,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildOptions {
    pub no_cache: bool,
    pub no_deps: bool,
}

#[async_trait]
pub trait ComposeBackend: Send + Sync + 'static {
    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Services declared by a manifest; the error is a one-line message
    async fn list_services(&self, file: &Path) -> Result<Vec<String>, String>;
    async fn statuses(&self, file: &Path) -> BTreeMap<String, ContainerStatus>;
    async fn container_id(&self, target: &ComposeTarget, service: &str) -> Option<String>;
    /// RFC 3339 start time of a running container
    async fn started_at(&self, container_id: &str) -> Option<String>;
    async fn recent_logs(&self, container_id: &str, lines: usize) -> Vec<String>;
    async fn dependency_graph(&self, file: &Path) -> DependencyGraph;
    async fn watch_available(&self) -> bool;
    async fn git_root(&self, dir: &Path) -> Option<PathBuf>;
    async fn worktrees(&self, dir: &Path) -> Vec<Worktree>;
    async fn service_defined_in(&self, file: &Path, service: &str) -> bool;

    // ------------------------------------------------------------------
    // Streaming operations
    // ------------------------------------------------------------------

    /// One invocation for the fast path, two (build, recreate) without cache
    fn rebuild(&self, target: &ComposeTarget, service: &str, opts: BuildOptions) -> Vec<Invocation>;
    fn restart(&self, target: &ComposeTarget, service: &str) -> Invocation;
    fn stop(&self, target: &ComposeTarget, service: &str) -> Invocation;
    fn start(&self, target: &ComposeTarget, service: &str) -> Invocation;
    fn watch(&self, target: &ComposeTarget, service: &str) -> Invocation;
    fn tail_logs(&self, target: &ComposeTarget, service: &str, lines: usize) -> Invocation;
    fn fetch_logs(&self, target: &ComposeTarget, service: &str, depth: TailDepth) -> Invocation;
    fn tail_container_logs(&self, container_id: &str, lines: usize) -> Invocation;
    fn fetch_container_logs(&self, container_id: &str, depth: TailDepth) -> Invocation;
    fn container_stats(&self, container_ids: &[String]) -> Invocation;
    fn exec(&self, container_id: &str, command: &str, cwd: Option<&str>) -> Invocation;
}

// ============================================================================
// docker CLI implementation
// ============================================================================

pub struct ComposeCli {
    docker: String,
    timeout: Duration,
    watch: OnceCell<bool>,
}

impl ComposeCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            docker: "docker".to_string(),
            timeout,
            watch: OnceCell::new(),
        }
    }

    fn compose(&self, target: &ComposeTarget, rest: &[&str]) -> Invocation {
        let mut args = vec!["compose".to_string(), "-f".to_string()];
        args.push(target.file.display().to_string());
        if let Some(project) = &target.project {
            args.push("-p".to_string());
            args.push(project.clone());
        }
        args.extend(rest.iter().map(|s| s.to_string()));

        let inv = Invocation::new(&self.docker, args);
        match target.file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => inv.in_dir(dir),
            _ => inv,
        }
    }

    fn docker(&self, args: &[&str]) -> Invocation {
        Invocation::new(&self.docker, args.iter().copied())
    }

    /// Run a short query; stdout on success
    async fn query(&self, inv: Invocation) -> Result<String, String> {
        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &inv.cwd {
            cmd.current_dir(cwd);
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => {
                tracing::debug!(command = %inv.display(), "query timed out");
                return Err(format!("timed out after {}s", self.timeout.as_secs()));
            }
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let first = stderr
                .lines()
                .map(|l| strip_ansi(l.trim()))
                .find(|l| !l.is_empty())
                .unwrap_or_else(|| format!("exited with {}", output.status));
            Err(first)
        }
    }
}

#[async_trait]
impl ComposeBackend for ComposeCli {
    async fn list_services(&self, file: &Path) -> Result<Vec<String>, String> {
        let out = self
            .query(self.compose(&ComposeTarget::new(file), &["config", "--services"]))
            .await?;
        Ok(parse_service_list(&out))
    }

    async fn statuses(&self, file: &Path) -> BTreeMap<String, ContainerStatus> {
        let inv = self.compose(&ComposeTarget::new(file), &["ps", "-a", "--format", "json"]);
        match self.query(inv).await {
            Ok(out) => parse_ps(&out),
            Err(e) => {
                tracing::debug!(file = %file.display(), error = %e, "status poll failed");
                BTreeMap::new()
            }
        }
    }

    async fn container_id(&self, target: &ComposeTarget, service: &str) -> Option<String> {
        let out = self.query(self.compose(target, &["ps", "-q", service])).await.ok()?;
        out.lines().map(str::trim).find(|l| !l.is_empty()).map(String::from)
    }

    async fn started_at(&self, container_id: &str) -> Option<String> {
        let out = self
            .query(self.docker(&["inspect", "--format", "{{.State.StartedAt}}", container_id]))
            .await
            .ok()?;
        let raw = out.trim();
        parse_started_at(raw).map(|_| raw.to_string())
    }

    async fn recent_logs(&self, container_id: &str, lines: usize) -> Vec<String> {
        let tail = lines.to_string();
        let mut cmd = Command::new(&self.docker);
        cmd.args(["logs", "--tail", &tail, container_id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // containers write to both streams; count them all
        let Ok(Ok(output)) = tokio::time::timeout(self.timeout, cmd.output()).await else {
            return Vec::new();
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        stdout.lines().chain(stderr.lines()).map(strip_ansi).collect()
    }

    async fn dependency_graph(&self, file: &Path) -> DependencyGraph {
        match self.query(self.compose(&ComposeTarget::new(file), &["config"])).await {
            Ok(resolved) => DependencyGraph::from_compose_str(&resolved),
            Err(e) => {
                tracing::debug!(file = %file.display(), error = %e, "compose config failed, reading manifest");
                match tokio::fs::read_to_string(file).await {
                    Ok(raw) => DependencyGraph::from_compose_str(&raw),
                    Err(_) => DependencyGraph::new(),
                }
            }
        }
    }

    async fn watch_available(&self) -> bool {
        *self
            .watch
            .get_or_init(|| async {
                let inv = self.docker(&["compose", "watch", "--help"]);
                self.query(inv).await.is_ok()
            })
            .await
    }

    async fn git_root(&self, dir: &Path) -> Option<PathBuf> {
        let dir = dir.display().to_string();
        let out = self
            .query(Invocation::new("git", ["-C", dir.as_str(), "rev-parse", "--show-toplevel"]))
            .await
            .ok()?;
        let root = out.trim();
        (!root.is_empty()).then(|| PathBuf::from(root))
    }

    async fn worktrees(&self, dir: &Path) -> Vec<Worktree> {
        let dir = dir.display().to_string();
        let inv = Invocation::new("git", ["-C", dir.as_str(), "worktree", "list", "--porcelain"]);
        self.query(inv)
            .await
            .map(|out| parse_worktree_list(&out))
            .unwrap_or_default()
    }

    async fn service_defined_in(&self, file: &Path, service: &str) -> bool {
        match self.list_services(file).await {
            Ok(services) => services.iter().any(|s| s == service),
            Err(_) => tokio::fs::read_to_string(file)
                .await
                .map(|raw| service_defined_in(&raw, service))
                .unwrap_or(false),
        }
    }

    fn rebuild(&self, target: &ComposeTarget, service: &str, opts: BuildOptions) -> Vec<Invocation> {
        let deps: &[&str] = if opts.no_deps { &["--no-deps"] } else { &[] };
        if opts.no_cache {
            let mut up = vec!["up", "-d", "--force-recreate"];
            up.extend_from_slice(deps);
            up.push(service);
            vec![
                self.compose(target, &["build", "--no-cache", service]),
                self.compose(target, &up),
            ]
        } else {
            let mut up = vec!["up", "-d", "--build"];
            up.extend_from_slice(deps);
            up.push(service);
            vec![self.compose(target, &up)]
        }
    }

    fn restart(&self, target: &ComposeTarget, service: &str) -> Invocation {
        self.compose(target, &["restart", service])
    }

    fn stop(&self, target: &ComposeTarget, service: &str) -> Invocation {
        self.compose(target, &["stop", service])
    }

    fn start(&self, target: &ComposeTarget, service: &str) -> Invocation {
        self.compose(target, &["start", service])
    }

    fn watch(&self, target: &ComposeTarget, service: &str) -> Invocation {
        self.compose(target, &["watch", service])
    }

    fn tail_logs(&self, target: &ComposeTarget, service: &str, lines: usize) -> Invocation {
        let tail = lines.to_string();
        self.compose(target, &["logs", "-f", "--no-log-prefix", "--tail", &tail, service])
    }

    fn fetch_logs(&self, target: &ComposeTarget, service: &str, depth: TailDepth) -> Invocation {
        let tail = depth.arg();
        self.compose(target, &["logs", "--no-log-prefix", "--tail", &tail, service])
    }

    fn tail_container_logs(&self, container_id: &str, lines: usize) -> Invocation {
        let tail = lines.to_string();
        self.docker(&["logs", "-f", "--tail", &tail, container_id])
    }

    fn fetch_container_logs(&self, container_id: &str, depth: TailDepth) -> Invocation {
        let tail = depth.arg();
        self.docker(&["logs", "--tail", &tail, container_id])
    }

    fn container_stats(&self, container_ids: &[String]) -> Invocation {
        let mut args = vec!["stats", "--no-stream", "--format", "{{json .}}"];
        args.extend(container_ids.iter().map(String::as_str));
        self.docker(&args)
    }

    fn exec(&self, container_id: &str, command: &str, cwd: Option<&str>) -> Invocation {
        let mut args = vec!["exec"];
        if let Some(cwd) = cwd {
            args.push("-w");
            args.push(cwd);
        }
        args.extend([container_id, "sh", "-c", command]);
        self.docker(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> ComposeCli {
        ComposeCli::new(Duration::from_secs(5))
    }

    fn args(inv: &Invocation) -> Vec<&str> {
        inv.args.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_fast_rebuild_is_single_step() {
        let target = ComposeTarget::new("/srv/shop/compose.yml");
        let steps = cli().rebuild(&target, "api", BuildOptions::default());
        assert_eq!(steps.len(), 1);
        assert_eq!(
            args(&steps[0]),
            vec!["compose", "-f", "/srv/shop/compose.yml", "up", "-d", "--build", "api"]
        );
        assert_eq!(steps[0].cwd, Some(PathBuf::from("/srv/shop")));
    }

    #[test]
    fn test_no_cache_rebuild_is_two_steps() {
        let target = ComposeTarget::new("/srv/shop/compose.yml");
        let opts = BuildOptions {
            no_cache: true,
            no_deps: true,
        };
        let steps = cli().rebuild(&target, "api", opts);
        assert_eq!(steps.len(), 2);
        assert!(args(&steps[0]).ends_with(&["build", "--no-cache", "api"]));
        assert!(args(&steps[1]).ends_with(&["up", "-d", "--force-recreate", "--no-deps", "api"]));
    }

    #[test]
    fn test_pinned_project() {
        let target = ComposeTarget::pinned("/wt/feature/compose.yml", Some("shop".into()));
        let inv = cli().restart(&target, "api");
        assert_eq!(
            args(&inv),
            vec!["compose", "-f", "/wt/feature/compose.yml", "-p", "shop", "restart", "api"]
        );
    }

    #[test]
    fn test_log_invocations() {
        let target = ComposeTarget::new("/srv/compose.yml");
        let c = cli();
        assert!(args(&c.tail_logs(&target, "db", 30)).ends_with(&["logs", "-f", "--no-log-prefix", "--tail", "30", "db"]));
        assert!(args(&c.fetch_logs(&target, "db", TailDepth::All)).ends_with(&["--tail", "all", "db"]));
        assert_eq!(args(&c.fetch_container_logs("abc", TailDepth::Lines(1000))), vec!["logs", "--tail", "1000", "abc"]);
    }

    #[test]
    fn test_exec_with_cwd() {
        let inv = cli().exec("abc", "ls -la", Some("/srv"));
        assert_eq!(args(&inv), vec!["exec", "-w", "/srv", "abc", "sh", "-c", "ls -la"]);
        let inv = cli().exec("abc", "pwd", None);
        assert_eq!(args(&inv), vec!["exec", "abc", "sh", "-c", "pwd"]);
    }

    #[test]
    fn test_stats_invocation() {
        let inv = cli().container_stats(&["a".into(), "b".into()]);
        assert_eq!(args(&inv), vec!["stats", "--no-stream", "--format", "{{json .}}", "a", "b"]);
    }
}
