//! Registry of in-flight operations
//!
//! Every lifecycle operation is keyed by [`ServiceKey`] and stored in exactly
//! one map per kind. A key may be present in at most one of them, and never
//! while it is the root of a cascade or the target of a running cascade step.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::cascade::CascadeOperation;
use crate::model::ServiceKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationKind {
    Rebuild,
    Restart,
    Stop,
    Start,
    Watch,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Rebuild,
        OperationKind::Restart,
        OperationKind::Stop,
        OperationKind::Start,
        OperationKind::Watch,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Rebuild => "rebuild",
            OperationKind::Restart => "restart",
            OperationKind::Stop => "stop",
            OperationKind::Start => "start",
            OperationKind::Watch => "watch",
        }
    }
}

/// What currently occupies a service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActiveOperation {
    Single(OperationKind),
    /// Root of a cascade
    Cascade,
    /// Target of a running step of someone else's cascade
    CascadeStep,
}

impl fmt::Display for ActiveOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveOperation::Single(kind) => write!(f, "{}", kind.label()),
            ActiveOperation::Cascade => write!(f, "cascade"),
            ActiveOperation::CascadeStep => write!(f, "cascade step"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError<H> {
    /// The key is occupied; the rejected handle is handed back so it can be killed
    #[error("{key} is busy ({active})")]
    Busy {
        key: ServiceKey,
        active: ActiveOperation,
        handle: H,
    },
}

/// Typed registry enforcing at most one active operation per service
#[derive(Debug)]
pub struct OperationRegistry<H> {
    rebuilding: BTreeMap<ServiceKey, H>,
    restarting: BTreeMap<ServiceKey, H>,
    stopping: BTreeMap<ServiceKey, H>,
    starting: BTreeMap<ServiceKey, H>,
    watching: BTreeMap<ServiceKey, H>,
    cascades: BTreeMap<ServiceKey, CascadeOperation<H>>,
}

impl<H> Default for OperationRegistry<H> {
    fn default() -> Self {
        Self {
            rebuilding: BTreeMap::new(),
            restarting: BTreeMap::new(),
            stopping: BTreeMap::new(),
            starting: BTreeMap::new(),
            watching: BTreeMap::new(),
            cascades: BTreeMap::new(),
        }
    }
}

impl<H> OperationRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: OperationKind) -> &BTreeMap<ServiceKey, H> {
        match kind {
            OperationKind::Rebuild => &self.rebuilding,
            OperationKind::Restart => &self.restarting,
            OperationKind::Stop => &self.stopping,
            OperationKind::Start => &self.starting,
            OperationKind::Watch => &self.watching,
        }
    }

    fn map_mut(&mut self, kind: OperationKind) -> &mut BTreeMap<ServiceKey, H> {
        match kind {
            OperationKind::Rebuild => &mut self.rebuilding,
            OperationKind::Restart => &mut self.restarting,
            OperationKind::Stop => &mut self.stopping,
            OperationKind::Start => &mut self.starting,
            OperationKind::Watch => &mut self.watching,
        }
    }

    /// What occupies `key`, if anything
    pub fn active(&self, key: &ServiceKey) -> Option<ActiveOperation> {
        if let Some(kind) = OperationKind::ALL
            .into_iter()
            .find(|kind| self.map(*kind).contains_key(key))
        {
            return Some(ActiveOperation::Single(kind));
        }
        if self.cascades.contains_key(key) {
            return Some(ActiveOperation::Cascade);
        }
        let in_step = self
            .cascades
            .values()
            .any(|c| c.root.file == key.file && c.is_running_on(&key.service));
        in_step.then_some(ActiveOperation::CascadeStep)
    }

    pub fn is_busy(&self, key: &ServiceKey) -> bool {
        self.active(key).is_some()
    }

    /// Register `handle` for `key`. Fails without touching the registry when
    /// the key is already occupied.
    pub fn begin(
        &mut self,
        key: ServiceKey,
        kind: OperationKind,
        handle: H,
    ) -> Result<(), RegistryError<H>> {
        if let Some(active) = self.active(&key) {
            return Err(RegistryError::Busy { key, active, handle });
        }
        self.map_mut(kind).insert(key, handle);
        Ok(())
    }

    /// Swap the handle of a running multi-step operation (no-cache build -> recreate)
    pub fn replace(&mut self, key: &ServiceKey, kind: OperationKind, handle: H) -> Option<H> {
        let map = self.map_mut(kind);
        match map.get_mut(key) {
            Some(slot) => Some(std::mem::replace(slot, handle)),
            None => None,
        }
    }

    pub fn get(&self, key: &ServiceKey, kind: OperationKind) -> Option<&H> {
        self.map(kind).get(key)
    }

    /// Remove and return the handle of a finished or cancelled operation
    pub fn finish(&mut self, key: &ServiceKey, kind: OperationKind) -> Option<H> {
        self.map_mut(kind).remove(key)
    }

    pub fn begin_cascade(
        &mut self,
        cascade: CascadeOperation<H>,
    ) -> Result<(), RegistryError<CascadeOperation<H>>> {
        let key = cascade.root.clone();
        if let Some(active) = self.active(&key) {
            return Err(RegistryError::Busy {
                key,
                active,
                handle: cascade,
            });
        }
        self.cascades.insert(key, cascade);
        Ok(())
    }

    pub fn cascade(&self, root: &ServiceKey) -> Option<&CascadeOperation<H>> {
        self.cascades.get(root)
    }

    pub fn cascade_mut(&mut self, root: &ServiceKey) -> Option<&mut CascadeOperation<H>> {
        self.cascades.get_mut(root)
    }

    pub fn finish_cascade(&mut self, root: &ServiceKey) -> Option<CascadeOperation<H>> {
        self.cascades.remove(root)
    }

    /// Keys with an operation in flight, with what is running
    pub fn active_keys(&self) -> Vec<(ServiceKey, ActiveOperation)> {
        let mut out: Vec<(ServiceKey, ActiveOperation)> = OperationKind::ALL
            .into_iter()
            .flat_map(|kind| {
                self.map(kind)
                    .keys()
                    .map(move |k| (k.clone(), ActiveOperation::Single(kind)))
            })
            .collect();
        out.extend(
            self.cascades
                .keys()
                .map(|k| (k.clone(), ActiveOperation::Cascade)),
        );
        out
    }

    pub fn len(&self) -> usize {
        OperationKind::ALL
            .into_iter()
            .map(|kind| self.map(kind).len())
            .sum::<usize>()
            + self.cascades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty every map, returning all live handles (including active cascade steps)
    pub fn drain(&mut self) -> Vec<(ServiceKey, H)> {
        let mut handles = Vec::new();
        for kind in OperationKind::ALL {
            handles.extend(std::mem::take(self.map_mut(kind)));
        }
        for (key, mut cascade) in std::mem::take(&mut self.cascades) {
            if let Some(handle) = cascade.cancel() {
                handles.push((key, handle));
            }
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::DependencyGraph;

    fn key(name: &str) -> ServiceKey {
        ServiceKey::new("/app/compose.yml", name)
    }

    fn assert_exclusive(reg: &OperationRegistry<u32>, k: &ServiceKey) {
        let count = OperationKind::ALL
            .into_iter()
            .filter(|kind| reg.get(k, *kind).is_some())
            .count();
        assert!(count <= 1, "{} present in {} maps", k, count);
    }

    #[test]
    fn test_begin_rejects_second_operation() {
        let mut reg = OperationRegistry::new();
        reg.begin(key("api"), OperationKind::Rebuild, 1).unwrap();

        for kind in OperationKind::ALL {
            let err = reg.begin(key("api"), kind, 2).unwrap_err();
            let RegistryError::Busy { active, handle, .. } = err;
            assert_eq!(active, ActiveOperation::Single(OperationKind::Rebuild));
            assert_eq!(handle, 2);
            assert_exclusive(&reg, &key("api"));
        }

        reg.begin(key("db"), OperationKind::Stop, 3).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_finish_frees_key() {
        let mut reg = OperationRegistry::new();
        reg.begin(key("api"), OperationKind::Restart, 1).unwrap();
        assert_eq!(reg.finish(&key("api"), OperationKind::Stop), None);
        assert_eq!(reg.finish(&key("api"), OperationKind::Restart), Some(1));
        assert!(!reg.is_busy(&key("api")));
        reg.begin(key("api"), OperationKind::Start, 2).unwrap();
    }

    #[test]
    fn test_replace_keeps_membership() {
        let mut reg = OperationRegistry::new();
        reg.begin(key("api"), OperationKind::Rebuild, 1).unwrap();
        assert_eq!(reg.replace(&key("api"), OperationKind::Rebuild, 2), Some(1));
        assert_eq!(reg.get(&key("api"), OperationKind::Rebuild), Some(&2));
        assert_eq!(reg.replace(&key("db"), OperationKind::Rebuild, 3), None);
        assert!(!reg.is_busy(&key("db")));
    }

    #[test]
    fn test_cascade_occupies_root_and_running_step() {
        let mut g = DependencyGraph::new();
        g.add_edge("api", "db");
        let mut reg: OperationRegistry<u32> = OperationRegistry::new();
        let cascade = CascadeOperation::plan(&g, &key("db")).unwrap();
        reg.begin_cascade(cascade).unwrap();

        assert_eq!(reg.active(&key("db")), Some(ActiveOperation::Cascade));
        assert!(reg.begin(key("db"), OperationKind::Rebuild, 1).is_err());
        // api is only pending, so it is free
        assert!(!reg.is_busy(&key("api")));

        let c = reg.cascade_mut(&key("db")).unwrap();
        c.start_current(10);
        c.finish_current(true);
        c.start_current(11);
        assert_eq!(reg.active(&key("api")), Some(ActiveOperation::CascadeStep));
        assert!(reg.begin(key("api"), OperationKind::Stop, 2).is_err());

        let second = CascadeOperation::plan(&g, &key("db")).unwrap();
        assert!(reg.begin_cascade(second).is_err());
    }

    #[test]
    fn test_cascade_rejected_when_root_busy() {
        let mut g = DependencyGraph::new();
        g.add_edge("api", "db");
        let mut reg: OperationRegistry<u32> = OperationRegistry::new();
        reg.begin(key("db"), OperationKind::Watch, 1).unwrap();
        let cascade = CascadeOperation::plan(&g, &key("db")).unwrap();
        assert!(matches!(
            reg.begin_cascade(cascade),
            Err(RegistryError::Busy {
                active: ActiveOperation::Single(OperationKind::Watch),
                ..
            })
        ));
    }

    #[test]
    fn test_drain_returns_every_handle() {
        let mut g = DependencyGraph::new();
        g.add_edge("api", "db");
        let mut reg: OperationRegistry<u32> = OperationRegistry::new();
        reg.begin(key("a"), OperationKind::Rebuild, 1).unwrap();
        reg.begin(key("b"), OperationKind::Restart, 2).unwrap();
        reg.begin(key("c"), OperationKind::Stop, 3).unwrap();
        reg.begin(key("d"), OperationKind::Start, 4).unwrap();
        reg.begin(key("e"), OperationKind::Watch, 5).unwrap();
        let mut cascade = CascadeOperation::plan(&g, &key("db")).unwrap();
        cascade.start_current(6);
        reg.begin_cascade(cascade).unwrap();

        let mut handles: Vec<u32> = reg.drain().into_iter().map(|(_, h)| h).collect();
        handles.sort();
        assert_eq!(handles, vec![1, 2, 3, 4, 5, 6]);
        assert!(reg.is_empty());
        assert!(reg.drain().is_empty());
    }
}
