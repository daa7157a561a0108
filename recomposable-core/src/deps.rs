//! Service dependency graph for a single compose manifest
//!
//! Built from the resolved compose model (`docker compose config` output).
//! Both `depends_on` forms are understood: the short list form and the long
//! mapping form with conditions.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde_yaml::Value;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// service -> services it depends on
    pub depends_on: BTreeMap<String, Vec<String>>,
    /// service -> services that depend on it
    pub depended_by: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `service` depends on `prerequisite`
    pub fn add_edge(&mut self, service: &str, prerequisite: &str) {
        let deps = self.depends_on.entry(service.to_string()).or_default();
        if !deps.iter().any(|d| d == prerequisite) {
            deps.push(prerequisite.to_string());
        }
        let rdeps = self.depended_by.entry(prerequisite.to_string()).or_default();
        if !rdeps.iter().any(|d| d == service) {
            rdeps.push(service.to_string());
        }
    }

    /// Build from a parsed compose document. Anything unexpected is skipped.
    pub fn from_compose(doc: &Value) -> Self {
        let mut graph = Self::new();
        let Some(services) = doc.get("services").and_then(|s| s.as_mapping()) else {
            return graph;
        };

        for (name, svc) in services {
            let Some(name) = name.as_str() else { continue };
            match svc.get("depends_on") {
                Some(Value::Sequence(items)) => {
                    for item in items {
                        if let Some(dep) = item.as_str() {
                            graph.add_edge(name, dep);
                        }
                    }
                }
                Some(Value::Mapping(map)) => {
                    for dep in map.keys() {
                        if let Some(dep) = dep.as_str() {
                            graph.add_edge(name, dep);
                        }
                    }
                }
                _ => {}
            }
        }

        graph
    }

    /// Parse compose YAML (or JSON, which is valid YAML). Failure yields an empty graph.
    pub fn from_compose_str(content: &str) -> Self {
        match serde_yaml::from_str::<Value>(content) {
            Ok(doc) => Self::from_compose(&doc),
            Err(e) => {
                tracing::debug!(error = %e, "could not parse compose model for dependencies");
                Self::new()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.depends_on.is_empty()
    }

    /// Every service reachable through `depended_by` from `service`,
    /// in breadth-first discovery order, excluding `service` itself.
    pub fn transitive_dependents(&self, service: &str) -> Vec<String> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::new();

        visited.insert(service);
        queue.push_back(service);

        while let Some(current) = queue.pop_front() {
            let Some(children) = self.depended_by.get(current) else {
                continue;
            };
            for child in children {
                if visited.insert(child.as_str()) {
                    order.push(child.clone());
                    queue.push_back(child.as_str());
                }
            }
        }

        order
    }

    /// Order `dependents` so every prerequisite comes before the services that
    /// need it. Only edges pointing at another member of the subset or at
    /// `root` count towards in-degree; `root` itself is treated as already done.
    ///
    /// Members caught in a cycle never reach in-degree zero and are appended
    /// at the end in their original order, so every dependent is still restarted.
    pub fn topo_sort_dependents(&self, dependents: &[String], root: &str) -> Vec<String> {
        let members: BTreeSet<&str> = dependents.iter().map(|s| s.as_str()).collect();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();

        for dep in dependents {
            let count = self
                .depends_on
                .get(dep)
                .map(|prereqs| {
                    prereqs
                        .iter()
                        .filter(|p| p.as_str() != root && members.contains(p.as_str()))
                        .count()
                })
                .unwrap_or(0);
            in_degree.insert(dep.as_str(), count);
        }

        let mut queue: VecDeque<&str> = dependents
            .iter()
            .map(|s| s.as_str())
            .filter(|s| in_degree.get(s) == Some(&0))
            .collect();
        let mut sorted: Vec<String> = Vec::with_capacity(dependents.len());

        while let Some(current) = queue.pop_front() {
            sorted.push(current.to_string());
            let Some(children) = self.depended_by.get(current) else {
                continue;
            };
            for child in children {
                if let Some(degree) = in_degree.get_mut(child.as_str()) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 && !sorted.iter().any(|s| s == child) {
                        queue.push_back(child.as_str());
                    }
                }
            }
        }

        if sorted.len() < dependents.len() {
            tracing::warn!(root, "dependency cycle among dependents");
            for dep in dependents {
                if !sorted.contains(dep) {
                    sorted.push(dep.clone());
                }
            }
        }

        sorted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> DependencyGraph {
        // db <- api <- web, db <- worker, api <- worker
        DependencyGraph::from_compose_str(
            r#"
services:
  db:
    image: postgres
  api:
    build: .
    depends_on: [db]
  worker:
    build: .
    depends_on:
      db:
        condition: service_healthy
      api:
        condition: service_started
  web:
    build: ./web
    depends_on:
      - api
  docs:
    image: nginx
"#,
        )
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|s| s == name).unwrap()
    }

    #[test]
    fn test_parse_both_depends_on_forms() {
        let g = graph();
        assert_eq!(g.depends_on["api"], vec!["db".to_string()]);
        assert_eq!(g.depends_on["worker"].len(), 2);
        assert!(g.depended_by["db"].contains(&"worker".to_string()));
        assert!(!g.depends_on.contains_key("docs"));
    }

    #[test]
    fn test_malformed_compose_is_empty() {
        assert!(DependencyGraph::from_compose_str("services: [").is_empty());
        assert!(DependencyGraph::from_compose_str("version: '3'").is_empty());
    }

    #[test]
    fn test_transitive_dependents_excludes_root() {
        let g = graph();
        let deps = g.transitive_dependents("db");
        assert_eq!(deps.len(), 3);
        assert!(!deps.contains(&"db".to_string()));
        assert!(deps.contains(&"web".to_string()));

        assert!(g.transitive_dependents("docs").is_empty());
        assert!(g.transitive_dependents("web").is_empty());
    }

    #[test]
    fn test_topo_sort_respects_edges() {
        let g = graph();
        let deps = g.transitive_dependents("db");
        let order = g.topo_sort_dependents(&deps, "db");
        assert_eq!(order.len(), deps.len());

        // Every retained edge: prerequisite before dependent
        for svc in &order {
            for prereq in g.depends_on.get(svc).into_iter().flatten() {
                if order.contains(prereq) {
                    assert!(position(&order, prereq) < position(&order, svc));
                }
            }
        }
    }

    #[test]
    fn test_topo_sort_ignores_edges_outside_subset() {
        let mut g = DependencyGraph::new();
        g.add_edge("api", "db");
        g.add_edge("api", "cache");
        g.add_edge("web", "api");
        let deps = g.transitive_dependents("db");
        assert_eq!(deps, vec!["api".to_string(), "web".to_string()]);
        // cache is not in the subset and not the root, so it does not block api
        assert_eq!(g.topo_sort_dependents(&deps, "db"), deps);
    }

    #[test]
    fn test_topo_sort_cycle_keeps_all_members() {
        let mut g = DependencyGraph::new();
        g.add_edge("a", "root");
        g.add_edge("b", "a");
        g.add_edge("a", "b");
        let deps = g.transitive_dependents("root");
        let order = g.topo_sort_dependents(&deps, "root");
        assert_eq!(order.len(), 2);
    }
}
