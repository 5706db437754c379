//! Subgraph isomorphism search.
//!
//! The matcher binds every active role of a [`Pattern`] to a distinct graph
//! node such that all predicates and required edges hold. Roles are bound
//! in an order that starts at the target role and then follows pattern
//! edges, so each step only has to look at the neighbors of an already
//! bound node. All matches are computed upfront from a snapshot of the
//! graph; callers that mutate the graph while consuming the results must
//! re-check that bound nodes still exist.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use qforge_ir::{Graph, NodeId};

use crate::pattern::{Pattern, PatternError};

/// One instance of a pattern: role name to bound node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Match {
    target: NodeId,
    bindings: BTreeMap<String, NodeId>,
}

impl Match {
    /// Node bound to the pattern's target role.
    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn get(&self, role: &str) -> Option<NodeId> {
        self.bindings.get(role).copied()
    }

    pub fn contains_role(&self, role: &str) -> bool {
        self.bindings.contains_key(role)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.bindings.iter().map(|(r, &n)| (r.as_str(), n))
    }

    /// All bound nodes.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.bindings.values().copied()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
struct EdgeRef<'p> {
    from: usize,
    to: usize,
    slot: Option<&'p str>,
}

/// A pattern compiled for one selection of optional groups.
#[derive(Debug)]
pub struct PatternMatcher<'p> {
    pattern: &'p Pattern,
    /// Active role indices in binding order; the target comes first.
    order: Vec<usize>,
    /// Edges whose endpoints are both active.
    edges: Vec<EdgeRef<'p>>,
}

impl<'p> PatternMatcher<'p> {
    /// Compile `pattern` with the given optional groups enabled.
    pub fn new(pattern: &'p Pattern, groups: &[&str]) -> Result<Self, PatternError> {
        pattern.validate()?;
        let known = pattern.groups();
        if let Some(unknown) = groups.iter().find(|g| !known.contains(**g)) {
            return Err(PatternError::UnknownGroup {
                pattern: pattern.name().to_string(),
                group: (*unknown).to_string(),
            });
        }

        let nodes = pattern.nodes();
        let active: Vec<bool> = nodes
            .iter()
            .map(|n| n.group.as_deref().is_none_or(|g| groups.contains(&g)))
            .collect();
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.role.as_str(), i))
            .collect();

        let edges: Vec<EdgeRef<'p>> = pattern
            .edges()
            .iter()
            .filter_map(|e| {
                let from = *index.get(e.from.as_str())?;
                let to = *index.get(e.to.as_str())?;
                (active[from] && active[to]).then_some(EdgeRef {
                    from,
                    to,
                    slot: e.slot.as_deref(),
                })
            })
            .collect();

        let target = index
            .get(pattern.target())
            .copied()
            .ok_or_else(|| PatternError::UnknownRole {
                pattern: pattern.name().to_string(),
                role: pattern.target().to_string(),
            })?;

        let mut order = vec![target];
        let mut placed: BTreeSet<usize> = BTreeSet::from([target]);
        let total = active.iter().filter(|&&a| a).count();
        while order.len() < total {
            let pending: Vec<usize> = (0..nodes.len())
                .filter(|i| active[*i] && !placed.contains(i))
                .collect();
            let connected = pending.iter().copied().find(|&i| {
                edges.iter().any(|e| {
                    (e.from == i && placed.contains(&e.to)) || (e.to == i && placed.contains(&e.from))
                })
            });
            let Some(next) = connected.or_else(|| pending.first().copied()) else {
                break;
            };
            order.push(next);
            placed.insert(next);
        }

        Ok(Self {
            pattern,
            order,
            edges,
        })
    }

    pub fn pattern(&self) -> &'p Pattern {
        self.pattern
    }

    /// Find every instance of the pattern in `graph`.
    ///
    /// Results are ordered by target node id. Each target node appears at
    /// most once; when several bindings exist for the same target, the
    /// first one found is kept. Matches may share non-target nodes.
    pub fn find_all(&self, graph: &Graph) -> Vec<Match> {
        let nodes = self.pattern.nodes();
        let candidates: Vec<BTreeSet<NodeId>> = (0..nodes.len())
            .map(|i| {
                if !self.order.contains(&i) {
                    return BTreeSet::new();
                }
                graph
                    .nodes()
                    .filter(|n| nodes[i].predicate.eval(graph, n))
                    .map(|n| n.id)
                    .collect()
            })
            .collect();

        let target = self.order[0];
        let mut matches = Vec::new();
        for &t in &candidates[target] {
            let mut binding: Vec<Option<NodeId>> = vec![None; nodes.len()];
            binding[target] = Some(t);
            if self.extend(graph, &candidates, &mut binding, 1) {
                let bindings = self
                    .order
                    .iter()
                    .filter_map(|&i| binding[i].map(|id| (nodes[i].role.clone(), id)))
                    .collect();
                matches.push(Match {
                    target: t,
                    bindings,
                });
            }
        }

        log::debug!(
            "pattern '{}': {} candidate target(s), {} match(es)",
            self.pattern.name(),
            candidates[target].len(),
            matches.len()
        );
        matches
    }

    fn extend(
        &self,
        graph: &Graph,
        candidates: &[BTreeSet<NodeId>],
        binding: &mut [Option<NodeId>],
        depth: usize,
    ) -> bool {
        let Some(&role) = self.order.get(depth) else {
            return true;
        };

        let pool: Vec<NodeId> = match self.anchor(role, binding) {
            Some(neighbors) => graph_neighbors(graph, neighbors)
                .iter()
                .copied()
                .filter(|id| candidates[role].contains(id))
                .collect(),
            None => candidates[role].iter().copied().collect(),
        };

        for cand in pool {
            if binding.contains(&Some(cand)) || !self.edges_hold(graph, role, cand, binding) {
                continue;
            }
            binding[role] = Some(cand);
            if self.extend(graph, candidates, binding, depth + 1) {
                return true;
            }
            binding[role] = None;
        }
        false
    }

    /// A bound neighbor through which `role` must be reachable.
    fn anchor(&self, role: usize, binding: &[Option<NodeId>]) -> Option<Neighbors> {
        self.edges.iter().find_map(|e| {
            if e.to == role {
                binding[e.from].map(Neighbors::Consumers)
            } else if e.from == role {
                binding[e.to].map(Neighbors::Producers)
            } else {
                None
            }
        })
    }

    fn edges_hold(
        &self,
        graph: &Graph,
        role: usize,
        cand: NodeId,
        binding: &[Option<NodeId>],
    ) -> bool {
        self.edges.iter().all(|e| {
            let (from, to) = if e.from == role {
                match binding[e.to] {
                    Some(to) => (cand, to),
                    None => return true,
                }
            } else if e.to == role {
                match binding[e.from] {
                    Some(from) => (from, cand),
                    None => return true,
                }
            } else {
                return true;
            };
            graph.has_edge(from, to) && slot_holds(graph, from, to, e.slot)
        })
    }
}

#[derive(Clone, Copy, Debug)]
enum Neighbors {
    Consumers(NodeId),
    Producers(NodeId),
}

fn graph_neighbors(graph: &Graph, neighbors: Neighbors) -> &[NodeId] {
    match neighbors {
        Neighbors::Consumers(id) => graph.consumers(id),
        Neighbors::Producers(id) => graph.producers(id),
    }
}

fn slot_holds(graph: &Graph, from: NodeId, to: NodeId, slot: Option<&str>) -> bool {
    let Some(slot) = slot else {
        return true;
    };
    if let (Ok(var), Ok(op)) = (graph.var(from), graph.op(to)) {
        return op.input(slot).contains(&var.name);
    }
    if let (Ok(op), Ok(var)) = (graph.op(from), graph.var(to)) {
        return op.output(slot).contains(&var.name);
    }
    false
}
