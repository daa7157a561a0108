//! Cascading rebuilds
//!
//! A cascade rebuilds one service and then restarts everything that
//! (transitively) depends on it, prerequisites first. Steps run strictly one
//! after another; the first failure aborts the remainder.

use crate::deps::DependencyGraph;
use crate::model::ServiceKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepAction {
    Rebuild,
    Restart,
}

impl StepAction {
    pub fn label(&self) -> &'static str {
        match self {
            StepAction::Rebuild => "rebuild",
            StepAction::Restart => "restart",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn icon(&self) -> &'static str {
        match self {
            StepStatus::Pending => "◯",
            StepStatus::InProgress => "●",
            StepStatus::Completed => "✓",
            StepStatus::Failed => "✗",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CascadeStep {
    pub action: StepAction,
    pub service: String,
    pub status: StepStatus,
}

/// What the scheduler should do after a step finished
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CascadeProgress {
    /// Start this step next
    Next { index: usize, action: StepAction, service: String },
    /// All steps completed
    Finished,
    /// A step failed; the cascade is over
    Aborted { index: usize, service: String },
}

/// A running cascade. `H` is the process handle of the active step.
#[derive(Debug)]
pub struct CascadeOperation<H> {
    pub root: ServiceKey,
    pub steps: Vec<CascadeStep>,
    pub current: usize,
    pub active: Option<H>,
}

impl<H> CascadeOperation<H> {
    /// Plan a cascade for `root`. Returns `None` when nothing depends on it,
    /// in which case a plain rebuild is the whole job.
    pub fn plan(graph: &DependencyGraph, root: &ServiceKey) -> Option<Self> {
        let dependents = graph.transitive_dependents(&root.service);
        if dependents.is_empty() {
            return None;
        }
        let ordered = graph.topo_sort_dependents(&dependents, &root.service);

        let mut steps = Vec::with_capacity(ordered.len() + 1);
        steps.push(CascadeStep {
            action: StepAction::Rebuild,
            service: root.service.clone(),
            status: StepStatus::Pending,
        });
        steps.extend(ordered.into_iter().map(|service| CascadeStep {
            action: StepAction::Restart,
            service,
            status: StepStatus::Pending,
        }));

        Some(Self {
            root: root.clone(),
            steps,
            current: 0,
            active: None,
        })
    }

    pub fn current_step(&self) -> Option<&CascadeStep> {
        self.steps.get(self.current)
    }

    /// Key of the service the current step operates on
    pub fn current_key(&self) -> Option<ServiceKey> {
        self.current_step().map(|s| self.root.sibling(&s.service))
    }

    /// Mark the current step as running under `handle`
    pub fn start_current(&mut self, handle: H) {
        if let Some(step) = self.steps.get_mut(self.current) {
            step.status = StepStatus::InProgress;
        }
        self.active = Some(handle);
    }

    /// Record the exit of the current step and decide what happens next
    pub fn finish_current(&mut self, success: bool) -> CascadeProgress {
        self.active = None;
        let index = self.current;
        let Some(step) = self.steps.get_mut(index) else {
            return CascadeProgress::Finished;
        };

        if !success {
            step.status = StepStatus::Failed;
            return CascadeProgress::Aborted {
                index,
                service: step.service.clone(),
            };
        }

        step.status = StepStatus::Completed;
        self.current += 1;
        match self.steps.get(self.current) {
            Some(next) => CascadeProgress::Next {
                index: self.current,
                action: next.action,
                service: next.service.clone(),
            },
            None => CascadeProgress::Finished,
        }
    }

    /// Whether `service` is the target of the step that is currently running
    pub fn is_running_on(&self, service: &str) -> bool {
        self.current_step()
            .map(|s| s.status == StepStatus::InProgress && s.service == service)
            .unwrap_or(false)
    }

    /// Take the active handle so the caller can kill it. Later steps stay pending.
    pub fn cancel(&mut self) -> Option<H> {
        if let Some(step) = self.steps.get_mut(self.current) {
            if step.status == StepStatus::InProgress {
                step.status = StepStatus::Failed;
            }
        }
        self.active.take()
    }

    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    /// One-line progress summary, e.g. `2/4 restart web`
    pub fn summary(&self) -> String {
        match self.current_step() {
            Some(step) => format!(
                "{}/{} {} {}",
                self.current + 1,
                self.steps.len(),
                step.action.label(),
                step.service
            ),
            None => format!("{}/{} done", self.steps.len(), self.steps.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> DependencyGraph {
        let mut g = DependencyGraph::new();
        g.add_edge("api", "db");
        g.add_edge("worker", "api");
        g.add_edge("worker", "db");
        g.add_edge("web", "api");
        g
    }

    fn root(name: &str) -> ServiceKey {
        ServiceKey::new("/app/compose.yml", name)
    }

    #[test]
    fn test_plan_without_dependents_is_none() {
        let g = graph();
        assert!(CascadeOperation::<()>::plan(&g, &root("web")).is_none());
        assert!(CascadeOperation::<()>::plan(&DependencyGraph::new(), &root("db")).is_none());
    }

    #[test]
    fn test_plan_rebuilds_root_then_restarts_in_order() {
        let g = graph();
        let op = CascadeOperation::<()>::plan(&g, &root("db")).unwrap();
        assert_eq!(op.steps.len(), 4);
        assert_eq!(op.steps[0].action, StepAction::Rebuild);
        assert_eq!(op.steps[0].service, "db");
        assert_eq!(op.steps[1].service, "api");
        assert!(op.steps[1..].iter().all(|s| s.action == StepAction::Restart));
        assert!(op.steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn test_steps_progress_sequentially() {
        let g = graph();
        let mut op = CascadeOperation::<u32>::plan(&g, &root("db")).unwrap();

        op.start_current(1);
        assert!(op.is_running_on("db"));
        let next = op.finish_current(true);
        assert_eq!(
            next,
            CascadeProgress::Next {
                index: 1,
                action: StepAction::Restart,
                service: "api".into()
            }
        );
        assert_eq!(op.current_key(), Some(root("api")));
        assert!(op.active.is_none());

        for handle in 2..=4 {
            op.start_current(handle);
            let progress = op.finish_current(true);
            if handle == 4 {
                assert_eq!(progress, CascadeProgress::Finished);
            }
        }
        assert_eq!(op.completed_steps(), 4);
    }

    #[test]
    fn test_failure_aborts_and_leaves_rest_pending() {
        let g = graph();
        let mut op = CascadeOperation::<u32>::plan(&g, &root("db")).unwrap();
        op.start_current(1);
        op.finish_current(true);
        op.start_current(2);
        let progress = op.finish_current(false);

        assert_eq!(
            progress,
            CascadeProgress::Aborted {
                index: 1,
                service: "api".into()
            }
        );
        assert_eq!(op.steps[0].status, StepStatus::Completed);
        assert_eq!(op.steps[1].status, StepStatus::Failed);
        assert!(op.steps[2..].iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn test_cancel_returns_active_handle() {
        let g = graph();
        let mut op = CascadeOperation::<u32>::plan(&g, &root("db")).unwrap();
        op.start_current(7);
        assert_eq!(op.cancel(), Some(7));
        assert_eq!(op.cancel(), None);
        assert_eq!(op.steps[0].status, StepStatus::Failed);
        assert!(op.steps[1..].iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn test_summary() {
        let g = graph();
        let op = CascadeOperation::<()>::plan(&g, &root("db")).unwrap();
        assert_eq!(op.summary(), "1/4 rebuild db");
    }
}
