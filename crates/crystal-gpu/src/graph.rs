//! Resource dependency graph.
//!
//! Every GPU object registers a node here. An edge `dependent -> dependency`
//! means the dependent cannot outlive the dependency. Nodes live in a
//! generational arena, so an id of a released resource never aliases a newer
//! one and no back-pointers exist between managers.
//!
//! Edges may only point from a newer resource to an older one. Since creation
//! order is total, this keeps the graph acyclic by construction.

use hashbrown::HashSet;
use slotmap::{new_key_type, SlotMap};

use crate::error::{GpuError, Result};

new_key_type! {
    /// Stable handle of a node in the [`DependencyGraph`].
    pub struct ResourceId;
}

/// What a node stands for. Only used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Context,
    Buffer,
    Image,
    AccelerationStructure,
    ShaderBindingTable,
    DescriptorSet,
    Pipeline,
    RenderPass,
    Framebuffer,
}

/// What happens when a resource with live dependents is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TeardownPolicy {
    /// Detach every dependent and mark it [`ResourceState::Invalid`].
    #[default]
    Invalidate,
    /// Fail with [`GpuError::DependentsAlive`] and leave the graph untouched.
    Refuse,
}

/// Validity of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Valid,
    /// A dependency was released underneath this resource. It must be rebuilt
    /// (rebound) or destroyed before use.
    Invalid,
}

#[derive(Debug)]
struct Node {
    kind: ResourceKind,
    label: String,
    seq: u64,
    state: ResourceState,
    generation: u64,
    dependencies: HashSet<ResourceId>,
    dependents: HashSet<ResourceId>,
}

/// Result of releasing a node.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Released {
    /// Dependents that were detached and marked invalid.
    pub invalidated: Vec<ResourceId>,
}

/// Arena of resources plus bidirectional adjacency.
#[derive(Debug)]
pub struct DependencyGraph {
    nodes: SlotMap<ResourceId, Node>,
    next_seq: u64,
    policy: TeardownPolicy,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new(policy: TeardownPolicy) -> Self {
        Self {
            nodes: SlotMap::with_key(),
            next_seq: 0,
            policy,
        }
    }

    /// Configured teardown policy.
    pub fn policy(&self) -> TeardownPolicy {
        self.policy
    }

    /// Register a new resource. It is newer than every existing node.
    pub fn register(&mut self, kind: ResourceKind, label: impl Into<String>) -> ResourceId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let label = label.into();
        tracing::trace!(?kind, %label, seq, "registering resource");
        self.nodes.insert(Node {
            kind,
            label,
            seq,
            state: ResourceState::Valid,
            generation: 0,
            dependencies: HashSet::new(),
            dependents: HashSet::new(),
        })
    }

    /// Whether `id` names a live node.
    pub fn contains(&self, id: ResourceId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn kind(&self, id: ResourceId) -> Option<ResourceKind> {
        self.nodes.get(id).map(|n| n.kind)
    }

    pub fn label(&self, id: ResourceId) -> Option<&str> {
        self.nodes.get(id).map(|n| n.label.as_str())
    }

    /// Register `dependent -> dependency`. Adding an existing edge is a no-op.
    pub fn add_dependency(&mut self, dependent: ResourceId, dependency: ResourceId) -> Result<()> {
        self.check_edge(dependent, dependency)?;
        self.link(dependent, dependency);
        Ok(())
    }

    /// Register several edges at once. Either all are added or none.
    pub fn add_dependencies(
        &mut self,
        dependent: ResourceId,
        dependencies: &[ResourceId],
    ) -> Result<()> {
        for &dependency in dependencies {
            self.check_edge(dependent, dependency)?;
        }
        for &dependency in dependencies {
            self.link(dependent, dependency);
        }
        Ok(())
    }

    fn check_edge(&self, dependent: ResourceId, dependency: ResourceId) -> Result<()> {
        let a = self
            .nodes
            .get(dependent)
            .ok_or(GpuError::UnknownResource(dependent))?;
        let b = self
            .nodes
            .get(dependency)
            .ok_or(GpuError::UnknownResource(dependency))?;
        if b.seq >= a.seq {
            return Err(GpuError::Cycle {
                dependent,
                dependency,
            });
        }
        Ok(())
    }

    fn link(&mut self, dependent: ResourceId, dependency: ResourceId) {
        if let Some(node) = self.nodes.get_mut(dependent) {
            node.dependencies.insert(dependency);
        }
        if let Some(node) = self.nodes.get_mut(dependency) {
            node.dependents.insert(dependent);
        }
    }

    /// Detach one edge. Returns whether it existed.
    pub fn remove_dependency(&mut self, dependent: ResourceId, dependency: ResourceId) -> bool {
        let removed = self
            .nodes
            .get_mut(dependent)
            .is_some_and(|n| n.dependencies.remove(&dependency));
        if let Some(node) = self.nodes.get_mut(dependency) {
            node.dependents.remove(&dependent);
        }
        removed
    }

    /// Detach every dependency of `dependent`. Returns the detached ids.
    pub fn remove_dependencies(&mut self, dependent: ResourceId) -> Vec<ResourceId> {
        let Some(node) = self.nodes.get_mut(dependent) else {
            return Vec::new();
        };
        let detached: Vec<ResourceId> = node.dependencies.drain().collect();
        for &dependency in &detached {
            if let Some(dep) = self.nodes.get_mut(dependency) {
                dep.dependents.remove(&dependent);
            }
        }
        detached
    }

    /// Detach a single dependent from `dependency` and mark it invalid.
    pub fn remove_dependent(&mut self, dependency: ResourceId, dependent: ResourceId) -> bool {
        let removed = self.remove_dependency(dependent, dependency);
        if removed {
            self.invalidate(dependent);
        }
        removed
    }

    /// Detach every dependent of `dependency` and mark each invalid.
    ///
    /// Called by a dependency right before it is destroyed.
    pub fn remove_dependents(&mut self, dependency: ResourceId) -> Vec<ResourceId> {
        let Some(node) = self.nodes.get_mut(dependency) else {
            return Vec::new();
        };
        let detached: Vec<ResourceId> = node.dependents.drain().collect();
        for &dependent in &detached {
            if let Some(dep) = self.nodes.get_mut(dependent) {
                dep.dependencies.remove(&dependency);
                dep.state = ResourceState::Invalid;
            }
        }
        detached
    }

    /// Remove a node according to the configured policy.
    ///
    /// Releasing an unknown (already released) id is a no-op.
    pub fn release(&mut self, id: ResourceId) -> Result<Released> {
        let Some(node) = self.nodes.get(id) else {
            return Ok(Released::default());
        };
        if self.policy == TeardownPolicy::Refuse && !node.dependents.is_empty() {
            return Err(GpuError::DependentsAlive {
                id,
                count: node.dependents.len(),
            });
        }
        Ok(self.force_release(id))
    }

    /// Remove a node, invalidating dependents regardless of policy.
    ///
    /// Used from `Drop` paths, which cannot refuse.
    pub fn force_release(&mut self, id: ResourceId) -> Released {
        if !self.nodes.contains_key(id) {
            return Released::default();
        }
        let invalidated = self.remove_dependents(id);
        self.remove_dependencies(id);
        if let Some(node) = self.nodes.remove(id) {
            tracing::trace!(kind = ?node.kind, label = %node.label, "released resource");
        }
        if !invalidated.is_empty() {
            tracing::debug!(count = invalidated.len(), "dependents invalidated by release");
        }
        Released { invalidated }
    }

    pub fn state(&self, id: ResourceId) -> Option<ResourceState> {
        self.nodes.get(id).map(|n| n.state)
    }

    /// Whether `id` is live and not invalidated.
    pub fn is_valid(&self, id: ResourceId) -> bool {
        self.state(id) == Some(ResourceState::Valid)
    }

    pub fn invalidate(&mut self, id: ResourceId) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.state = ResourceState::Invalid;
        }
    }

    /// Mark every dependent invalid while keeping the edges.
    ///
    /// Used when a resource swaps its native handle in place, so dependents
    /// that captured the old handle must be rebuilt against the new one.
    pub fn invalidate_dependents(&mut self, id: ResourceId) -> Vec<ResourceId> {
        let dependents = self.dependents_of(id);
        for &dependent in &dependents {
            self.invalidate(dependent);
        }
        dependents
    }

    /// Mark a rebuilt resource usable again.
    pub fn revalidate(&mut self, id: ResourceId) -> Result<()> {
        let node = self.nodes.get_mut(id).ok_or(GpuError::UnknownResource(id))?;
        node.state = ResourceState::Valid;
        Ok(())
    }

    /// Current rebuild generation of a resource.
    pub fn generation(&self, id: ResourceId) -> Option<u64> {
        self.nodes.get(id).map(|n| n.generation)
    }

    /// Increment the generation after a successful rebuild. Returns the new value.
    pub fn bump_generation(&mut self, id: ResourceId) -> Result<u64> {
        let node = self.nodes.get_mut(id).ok_or(GpuError::UnknownResource(id))?;
        node.generation += 1;
        Ok(node.generation)
    }

    pub fn dependencies_of(&self, id: ResourceId) -> Vec<ResourceId> {
        self.nodes
            .get(id)
            .map(|n| n.dependencies.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, id: ResourceId) -> Vec<ResourceId> {
        self.nodes
            .get(id)
            .map(|n| n.dependents.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether the edge `dependent -> dependency` exists.
    pub fn depends_on(&self, dependent: ResourceId, dependency: ResourceId) -> bool {
        self.nodes
            .get(dependent)
            .is_some_and(|n| n.dependencies.contains(&dependency))
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new(TeardownPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(n: usize) -> (DependencyGraph, Vec<ResourceId>) {
        let mut graph = DependencyGraph::default();
        let ids = (0..n)
            .map(|i| graph.register(ResourceKind::Buffer, format!("r{i}")))
            .collect();
        (graph, ids)
    }

    #[test]
    fn newer_may_depend_on_older() {
        let (mut graph, ids) = graph_with(2);
        graph.add_dependency(ids[1], ids[0]).unwrap();
        assert!(graph.depends_on(ids[1], ids[0]));
        assert_eq!(graph.dependents_of(ids[0]), vec![ids[1]]);
    }

    #[test]
    fn older_cannot_depend_on_newer() {
        let (mut graph, ids) = graph_with(2);
        let err = graph.add_dependency(ids[0], ids[1]).unwrap_err();
        assert!(matches!(err, GpuError::Cycle { .. }));
        assert!(graph.dependencies_of(ids[0]).is_empty());
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let (mut graph, ids) = graph_with(1);
        assert!(matches!(
            graph.add_dependency(ids[0], ids[0]),
            Err(GpuError::Cycle { .. })
        ));
    }

    #[test]
    fn add_dependencies_is_all_or_nothing() {
        let (mut graph, ids) = graph_with(3);
        let err = graph.add_dependencies(ids[1], &[ids[0], ids[2]]);
        assert!(err.is_err());
        assert!(graph.dependencies_of(ids[1]).is_empty());
        assert!(graph.dependents_of(ids[0]).is_empty());
    }

    #[test]
    fn release_invalidates_and_detaches_dependents() {
        let (mut graph, ids) = graph_with(3);
        graph.add_dependency(ids[1], ids[0]).unwrap();
        graph.add_dependency(ids[2], ids[0]).unwrap();

        let released = graph.release(ids[0]).unwrap();
        assert_eq!(released.invalidated.len(), 2);
        assert!(!graph.contains(ids[0]));
        for &dependent in &ids[1..] {
            assert!(!graph.depends_on(dependent, ids[0]));
            assert_eq!(graph.state(dependent), Some(ResourceState::Invalid));
        }
    }

    #[test]
    fn refuse_policy_keeps_graph_intact() {
        let mut graph = DependencyGraph::new(TeardownPolicy::Refuse);
        let a = graph.register(ResourceKind::Buffer, "a");
        let b = graph.register(ResourceKind::DescriptorSet, "b");
        graph.add_dependency(b, a).unwrap();

        let err = graph.release(a).unwrap_err();
        assert!(matches!(err, GpuError::DependentsAlive { count: 1, .. }));
        assert!(graph.contains(a));
        assert!(graph.is_valid(b));

        graph.release(b).unwrap();
        graph.release(a).unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn release_is_idempotent_and_ids_stay_dead() {
        let (mut graph, ids) = graph_with(1);
        graph.release(ids[0]).unwrap();
        assert_eq!(graph.release(ids[0]).unwrap(), Released::default());

        let fresh = graph.register(ResourceKind::Buffer, "fresh");
        assert_ne!(fresh, ids[0]);
        assert!(!graph.contains(ids[0]));
    }

    #[test]
    fn release_detaches_own_dependencies() {
        let (mut graph, ids) = graph_with(2);
        graph.add_dependency(ids[1], ids[0]).unwrap();
        graph.release(ids[1]).unwrap();
        assert!(graph.dependents_of(ids[0]).is_empty());
        assert!(graph.is_valid(ids[0]));
    }

    #[test]
    fn generation_bumps_and_revalidate() {
        let (mut graph, ids) = graph_with(1);
        assert_eq!(graph.generation(ids[0]), Some(0));
        assert_eq!(graph.bump_generation(ids[0]).unwrap(), 1);
        graph.invalidate(ids[0]);
        assert!(!graph.is_valid(ids[0]));
        graph.revalidate(ids[0]).unwrap();
        assert!(graph.is_valid(ids[0]));
    }

    #[test]
    fn remove_dependent_invalidates_only_that_dependent() {
        let (mut graph, ids) = graph_with(3);
        graph.add_dependency(ids[1], ids[0]).unwrap();
        graph.add_dependency(ids[2], ids[0]).unwrap();
        assert!(graph.remove_dependent(ids[0], ids[1]));
        assert!(!graph.is_valid(ids[1]));
        assert!(graph.is_valid(ids[2]));
        assert!(graph.depends_on(ids[2], ids[0]));
    }

    #[test]
    fn no_dangling_edges_after_arbitrary_releases() {
        let (mut graph, ids) = graph_with(12);
        for (i, &dependent) in ids.iter().enumerate() {
            for &dependency in ids.iter().take(i).step_by(2) {
                graph.add_dependency(dependent, dependency).unwrap();
            }
        }
        for &id in ids.iter().step_by(3) {
            graph.release(id).unwrap();
            for &other in &ids {
                if graph.contains(other) {
                    assert!(!graph.depends_on(other, id));
                    assert!(graph
                        .dependencies_of(other)
                        .iter()
                        .all(|dep| graph.contains(*dep)));
                    assert!(graph
                        .dependents_of(other)
                        .iter()
                        .all(|dep| graph.contains(*dep)));
                }
            }
        }
    }
}
