//! Bipartite operator/variable graph.
//!
//! Every node is either an operator or a variable, and every edge connects
//! one of each: `var -> op` means the operator reads the variable, `op -> var`
//! means it writes it. Nodes live in a `BTreeMap` keyed by [`NodeId`] so
//! iteration order, and therefore every pass built on top of it, is
//! deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::desc::{OpDesc, ProgramDesc, VarDesc};
use crate::error::IrError;

/// A unique identifier for a node in the graph. Ids are never reused.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a node represents.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Op(OpDesc),
    Var(VarDesc),
}

/// A node together with its adjacency.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Nodes with an edge into this one.
    pub inputs: Vec<NodeId>,
    /// Nodes this one has an edge into.
    pub outputs: Vec<NodeId>,
}

impl Node {
    pub fn is_op(&self) -> bool {
        matches!(self.kind, NodeKind::Op(_))
    }

    pub fn is_var(&self) -> bool {
        matches!(self.kind, NodeKind::Var(_))
    }

    pub fn op(&self) -> Option<&OpDesc> {
        match &self.kind {
            NodeKind::Op(op) => Some(op),
            NodeKind::Var(_) => None,
        }
    }

    pub fn var(&self) -> Option<&VarDesc> {
        match &self.kind {
            NodeKind::Var(var) => Some(var),
            NodeKind::Op(_) => None,
        }
    }

    /// The operator type for op nodes, the variable name for var nodes.
    pub fn name(&self) -> &str {
        match &self.kind {
            NodeKind::Op(op) => &op.op_type,
            NodeKind::Var(var) => &var.name,
        }
    }
}

/// A mutable directed acyclic graph of operators and variables.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    next_id: u32,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                id,
                kind,
                inputs: Vec::new(),
                outputs: Vec::new(),
            },
        );
        id
    }

    /// Add an unconnected operator node.
    pub fn add_op(&mut self, desc: OpDesc) -> NodeId {
        self.insert(NodeKind::Op(desc))
    }

    /// Add an unconnected variable node.
    pub fn add_var(&mut self, desc: VarDesc) -> NodeId {
        self.insert(NodeKind::Var(desc))
    }

    /// Add an operator and link it to the variable nodes its slots name.
    ///
    /// Convenience for building graphs by hand.
    ///
    /// # Panics
    ///
    /// Panics if a slot names a variable that has not been added with
    /// [`add_var`](Self::add_var), or if an output variable already has a
    /// producer (each variable may have at most one producer).
    pub fn add_op_linked(&mut self, desc: OpDesc) -> NodeId {
        let op_type = desc.op_type.clone();
        let resolve = |graph: &Self, name: &str| {
            graph.find_var(name).unwrap_or_else(|| {
                panic!("add_op_linked({op_type}): variable '{name}' not registered in graph")
            })
        };

        let inputs: Vec<NodeId> = desc.input_names().map(|n| resolve(self, n)).collect();
        let outputs: Vec<NodeId> = desc.output_names().map(|n| resolve(self, n)).collect();
        for &out in &outputs {
            if let Some(existing) = self.producer(out) {
                panic!(
                    "add_op_linked({op_type}): variable '{}' already produced by node {existing}",
                    self.node(out).map_or("?", Node::name),
                );
            }
        }

        let id = self.add_op(desc);
        for var in inputs {
            if !self.has_edge(var, id) {
                self.connect(var, id);
            }
        }
        for var in outputs {
            if !self.has_edge(id, var) {
                self.connect(id, var);
            }
        }
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Like [`node`](Self::node) but with an error for missing ids.
    pub fn try_node(&self, id: NodeId) -> Result<&Node, IrError> {
        self.nodes.get(&id).ok_or(IrError::NodeNotFound(id))
    }

    pub fn op(&self, id: NodeId) -> Result<&OpDesc, IrError> {
        self.try_node(id)?.op().ok_or(IrError::NotAnOp(id))
    }

    pub fn op_mut(&mut self, id: NodeId) -> Result<&mut OpDesc, IrError> {
        match &mut self.nodes.get_mut(&id).ok_or(IrError::NodeNotFound(id))?.kind {
            NodeKind::Op(op) => Ok(op),
            NodeKind::Var(_) => Err(IrError::NotAnOp(id)),
        }
    }

    /// Rebind `old` to `new` in one input slot of operator `op`.
    ///
    /// Only the description changes; edges are the caller's business.
    pub fn replace_op_input(
        &mut self,
        op: NodeId,
        slot: &str,
        old: &str,
        new: &str,
    ) -> Result<(), IrError> {
        let desc = self.op_mut(op)?;
        if desc.replace_input(slot, old, new) {
            Ok(())
        } else {
            Err(slot_not_bound(op, desc, slot, old))
        }
    }

    /// Rebind `old` to `new` in one output slot of operator `op`.
    pub fn replace_op_output(
        &mut self,
        op: NodeId,
        slot: &str,
        old: &str,
        new: &str,
    ) -> Result<(), IrError> {
        let desc = self.op_mut(op)?;
        if desc.replace_output(slot, old, new) {
            Ok(())
        } else {
            Err(slot_not_bound(op, desc, slot, old))
        }
    }

    /// Rebind `old` to `new` in every input slot of operator `op`; at least
    /// one slot must hold `old`.
    pub fn rename_op_input(&mut self, op: NodeId, old: &str, new: &str) -> Result<(), IrError> {
        let desc = self.op_mut(op)?;
        if desc.rename_input(old, new) {
            Ok(())
        } else {
            Err(slot_not_bound(op, desc, "*", old))
        }
    }

    pub fn var(&self, id: NodeId) -> Result<&VarDesc, IrError> {
        self.try_node(id)?.var().ok_or(IrError::NotAVar(id))
    }

    pub fn var_mut(&mut self, id: NodeId) -> Result<&mut VarDesc, IrError> {
        match &mut self.nodes.get_mut(&id).ok_or(IrError::NodeNotFound(id))?.kind {
            NodeKind::Var(var) => Ok(var),
            NodeKind::Op(_) => Err(IrError::NotAVar(id)),
        }
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// All operator nodes in id order.
    pub fn ops(&self) -> impl Iterator<Item = (NodeId, &OpDesc)> {
        self.nodes.values().filter_map(|n| n.op().map(|op| (n.id, op)))
    }

    /// All variable nodes in id order.
    pub fn vars(&self) -> impl Iterator<Item = (NodeId, &VarDesc)> {
        self.nodes.values().filter_map(|n| n.var().map(|v| (n.id, v)))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn op_count(&self) -> usize {
        self.ops().count()
    }

    pub fn var_count(&self) -> usize {
        self.vars().count()
    }

    /// Find the variable node with the given name.
    pub fn find_var(&self, name: &str) -> Option<NodeId> {
        self.vars().find(|(_, v)| v.name == name).map(|(id, _)| id)
    }

    /// All operator nodes of the given type, in id order.
    pub fn find_ops(&self, op_type: &str) -> Vec<NodeId> {
        self.ops()
            .filter(|(_, op)| op.op_type == op_type)
            .map(|(id, _)| id)
            .collect()
    }

    /// Nodes reading from `id` (for a variable: its consumer operators).
    pub fn consumers(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(&id)
            .map(|n| n.outputs.as_slice())
            .unwrap_or_default()
    }

    /// Nodes writing into `id` (for a variable: its producer operators).
    pub fn producers(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(&id)
            .map(|n| n.inputs.as_slice())
            .unwrap_or_default()
    }

    /// The producer of a variable, if any.
    pub fn producer(&self, id: NodeId) -> Option<NodeId> {
        self.producers(id).first().copied()
    }

    pub fn has_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.nodes
            .get(&from)
            .is_some_and(|n| n.outputs.contains(&to))
    }

    fn connect(&mut self, from: NodeId, to: NodeId) {
        if let Some(node) = self.nodes.get_mut(&from) {
            node.outputs.push(to);
        }
        if let Some(node) = self.nodes.get_mut(&to) {
            node.inputs.push(from);
        }
    }

    /// Add the edge `from -> to`. Linking an existing edge is a no-op.
    pub fn link(&mut self, from: NodeId, to: NodeId) -> Result<(), IrError> {
        let from_is_op = self.try_node(from)?.is_op();
        let to_is_op = self.try_node(to)?.is_op();
        if from_is_op == to_is_op {
            return Err(IrError::NotBipartite { from, to });
        }
        if !self.has_edge(from, to) {
            self.connect(from, to);
        }
        Ok(())
    }

    /// Remove the edge `from -> to`, which must exist on both endpoints.
    pub fn unlink(&mut self, from: NodeId, to: NodeId) -> Result<(), IrError> {
        let forward = self.try_node(from)?.outputs.contains(&to);
        let backward = self.try_node(to)?.inputs.contains(&from);
        if !forward || !backward {
            return Err(IrError::EdgeNotFound { from, to });
        }
        if let Some(node) = self.nodes.get_mut(&from) {
            node.outputs.retain(|&n| n != to);
        }
        if let Some(node) = self.nodes.get_mut(&to) {
            node.inputs.retain(|&n| n != from);
        }
        Ok(())
    }

    /// Remove nodes together with every edge touching them.
    ///
    /// Either all ids are removed or, if any is missing, none are.
    pub fn remove_nodes(&mut self, ids: &[NodeId]) -> Result<(), IrError> {
        if let Some(&missing) = ids.iter().find(|id| !self.contains(**id)) {
            return Err(IrError::NodeNotFound(missing));
        }
        let doomed: BTreeSet<NodeId> = ids.iter().copied().collect();
        for id in &doomed {
            self.nodes.remove(id);
        }
        for node in self.nodes.values_mut() {
            node.inputs.retain(|n| !doomed.contains(n));
            node.outputs.retain(|n| !doomed.contains(n));
        }
        Ok(())
    }

    /// Returns every node in topological order.
    ///
    /// The ordering is deterministic: among ready nodes, the one with the
    /// smaller [`NodeId`] is emitted first.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, IrError> {
        let mut in_degree: HashMap<NodeId, usize> = self
            .nodes
            .values()
            .map(|n| (n.id, n.inputs.len()))
            .collect();
        let mut ready: BTreeSet<NodeId> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for &next in self.consumers(id) {
                if let Some(deg) = in_degree.get_mut(&next) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(next);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(IrError::Cycle {
                visited: order.len(),
                total: self.nodes.len(),
            });
        }
        Ok(order)
    }

    /// Operator nodes in topological (execution) order.
    pub fn topological_ops(&self) -> Result<Vec<NodeId>, IrError> {
        Ok(self
            .topological_order()?
            .into_iter()
            .filter(|id| self.nodes.get(id).is_some_and(Node::is_op))
            .collect())
    }

    /// Check every structural invariant passes rely on:
    /// edges are recorded on both endpoints and point at live nodes, every
    /// edge joins an operator and a variable, variable names are unique,
    /// each variable has at most one producer, every operator's slots name
    /// exactly the variables it is linked to, and the graph is acyclic.
    pub fn validate(&self) -> Result<(), IrError> {
        let mut seen_names = BTreeSet::new();
        for node in self.nodes.values() {
            for &out in &node.outputs {
                let target = self.nodes.get(&out).ok_or(IrError::DanglingEdge {
                    from: node.id,
                    to: out,
                })?;
                if !target.inputs.contains(&node.id) {
                    return Err(IrError::AsymmetricEdge {
                        from: node.id,
                        to: out,
                    });
                }
                if target.is_op() == node.is_op() {
                    return Err(IrError::NotBipartite {
                        from: node.id,
                        to: out,
                    });
                }
            }
            for &inp in &node.inputs {
                let source = self.nodes.get(&inp).ok_or(IrError::DanglingEdge {
                    from: node.id,
                    to: inp,
                })?;
                if !source.outputs.contains(&node.id) {
                    return Err(IrError::AsymmetricEdge {
                        from: inp,
                        to: node.id,
                    });
                }
            }

            match &node.kind {
                NodeKind::Var(var) => {
                    if !seen_names.insert(var.name.as_str()) {
                        return Err(IrError::DuplicateVar(var.name.clone()));
                    }
                    if node.inputs.len() > 1 {
                        return Err(IrError::MultipleProducers {
                            name: var.name.clone(),
                            count: node.inputs.len(),
                        });
                    }
                }
                NodeKind::Op(op) => {
                    self.check_slots(node.id, op, op.input_names(), &node.inputs)?;
                    self.check_slots(node.id, op, op.output_names(), &node.outputs)?;
                }
            }
        }

        self.topological_order()?;
        Ok(())
    }

    fn check_slots<'a>(
        &'a self,
        id: NodeId,
        op: &'a OpDesc,
        declared: impl Iterator<Item = &'a str>,
        linked: &[NodeId],
    ) -> Result<(), IrError> {
        let declared: BTreeSet<&str> = declared.collect();
        let linked: BTreeSet<&str> = linked
            .iter()
            .filter_map(|n| self.nodes.get(n))
            .map(Node::name)
            .collect();
        match declared.symmetric_difference(&linked).next() {
            Some(var) => Err(IrError::DescMismatch {
                op: id,
                op_type: op.op_type.clone(),
                var: (*var).to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Build a graph from a linear program.
    ///
    /// Variables named by an operator but not declared in `program.vars`
    /// are declared implicitly as non-persistable `f32` variables.
    pub fn from_program(program: &ProgramDesc) -> Result<Self, IrError> {
        let mut graph = Self::new();
        let mut by_name: HashMap<String, NodeId> = HashMap::new();

        for var in &program.vars {
            if by_name.contains_key(&var.name) {
                return Err(IrError::DuplicateVar(var.name.clone()));
            }
            let id = graph.add_var(var.clone());
            by_name.insert(var.name.clone(), id);
        }

        for op in &program.ops {
            let op_id = graph.add_op(op.clone());
            for name in op.input_names() {
                let var = declare(&mut graph, &mut by_name, name);
                graph.link(var, op_id)?;
            }
            for name in op.output_names() {
                let var = declare(&mut graph, &mut by_name, name);
                graph.link(op_id, var)?;
            }
        }

        graph.validate()?;
        Ok(graph)
    }

    /// Lower the graph back to a linear program: variables in id order,
    /// operators in topological order.
    pub fn to_program(&self) -> Result<ProgramDesc, IrError> {
        let ops = self
            .topological_ops()?
            .into_iter()
            .filter_map(|id| self.nodes.get(&id).and_then(Node::op).cloned())
            .collect();
        let vars = self.vars().map(|(_, v)| v.clone()).collect();
        Ok(ProgramDesc { vars, ops })
    }
}

fn declare(graph: &mut Graph, by_name: &mut HashMap<String, NodeId>, name: &str) -> NodeId {
    *by_name
        .entry(name.to_string())
        .or_insert_with(|| graph.add_var(VarDesc::new(name)))
}

fn slot_not_bound(op: NodeId, desc: &OpDesc, slot: &str, var: &str) -> IrError {
    IrError::SlotNotBound {
        op,
        op_type: desc.op_type.clone(),
        slot: slot.to_string(),
        var: var.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// x -> conv2d(w) -> y -> relu -> z
    fn conv_relu() -> (Graph, [NodeId; 6]) {
        let mut graph = Graph::new();
        let x = graph.add_var(VarDesc::new("x"));
        let w = graph.add_var(VarDesc::new("w").persistable(true));
        let y = graph.add_var(VarDesc::new("y"));
        let z = graph.add_var(VarDesc::new("z"));
        let conv = graph.add_op_linked(
            OpDesc::new("conv2d")
                .with_input("Input", ["x"])
                .with_input("Filter", ["w"])
                .with_output("Output", ["y"]),
        );
        let relu = graph.add_op_linked(
            OpDesc::new("relu")
                .with_input("X", ["y"])
                .with_output("Out", ["z"]),
        );
        (graph, [x, w, y, z, conv, relu])
    }

    #[test]
    fn build_simple_graph() {
        let (graph, [x, w, y, _, conv, relu]) = conv_relu();
        assert_eq!(graph.node_count(), 6);
        assert_eq!(graph.op_count(), 2);
        assert_eq!(graph.var_count(), 4);
        assert_eq!(graph.producers(conv), &[w, x]);
        assert_eq!(graph.consumers(y), &[relu]);
        assert_eq!(graph.producer(y), Some(conv));
        assert_eq!(graph.producer(x), None);
        graph.validate().unwrap();
    }

    #[test]
    fn topological_order() {
        let (graph, [.., conv, relu]) = conv_relu();
        assert_eq!(graph.topological_ops().unwrap(), vec![conv, relu]);
    }

    #[test]
    fn topological_order_empty_graph() {
        assert!(Graph::new().topological_order().unwrap().is_empty());
    }

    #[test]
    fn link_rejects_same_kind() {
        let (mut graph, [x, w, ..]) = conv_relu();
        assert!(matches!(
            graph.link(x, w),
            Err(IrError::NotBipartite { .. })
        ));
    }

    #[test]
    fn link_is_idempotent() {
        let (mut graph, [x, _, _, _, conv, _]) = conv_relu();
        graph.link(x, conv).unwrap();
        assert_eq!(graph.consumers(x), &[conv]);
    }

    #[test]
    fn unlink_missing_edge_is_error() {
        let (mut graph, [x, _, _, _, _, relu]) = conv_relu();
        assert!(matches!(
            graph.unlink(x, relu),
            Err(IrError::EdgeNotFound { .. })
        ));
    }

    #[test]
    fn unlink_then_validate_reports_desc_mismatch() {
        let (mut graph, [x, _, _, _, conv, _]) = conv_relu();
        graph.unlink(x, conv).unwrap();
        let err = graph.validate().unwrap_err();
        assert!(matches!(err, IrError::DescMismatch { ref var, .. } if var == "x"));
    }

    #[test]
    fn remove_nodes_drops_incident_edges() {
        let (mut graph, [_, _, y, z, conv, relu]) = conv_relu();
        graph.remove_nodes(&[relu, z]).unwrap();
        assert!(graph.consumers(y).is_empty());
        assert!(!graph.contains(relu));
        assert_eq!(graph.producer(y), Some(conv));
        graph.validate().unwrap();
    }

    #[test]
    fn remove_nodes_is_all_or_nothing() {
        let (mut graph, [.., relu]) = conv_relu();
        let before = graph.node_count();
        assert!(graph.remove_nodes(&[relu, NodeId(999)]).is_err());
        assert_eq!(graph.node_count(), before);
    }

    #[test]
    fn rebinding_an_unbound_name_names_op_and_slot() {
        let (mut graph, [.., conv, relu]) = conv_relu();
        graph.replace_op_input(conv, "Input", "x", "x_q").unwrap();
        assert_eq!(graph.op(conv).unwrap().input("Input"), ["x_q".to_string()]);

        let err = graph.replace_op_input(conv, "Filter", "x", "x_q").unwrap_err();
        assert!(matches!(
            &err,
            IrError::SlotNotBound { op, slot, var, .. }
                if *op == conv && slot == "Filter" && var == "x"
        ));
        assert_eq!(
            err.to_string(),
            format!("operator {conv} (conv2d) does not bind 'x' in slot Filter")
        );
        assert!(matches!(
            graph.replace_op_output(conv, "Output", "z", "acc"),
            Err(IrError::SlotNotBound { .. })
        ));
        assert!(matches!(
            graph.rename_op_input(relu, "w", "w_q"),
            Err(IrError::SlotNotBound { ref slot, .. }) if slot == "*"
        ));
        graph.rename_op_input(relu, "y", "y2").unwrap();
        assert!(graph.op(relu).unwrap().reads("y2"));
    }

    #[test]
    fn cycle_is_detected() {
        let (mut graph, [x, .., relu]) = conv_relu();
        // relu -> x would close x -> conv -> y -> relu -> x
        graph.op_mut(relu).unwrap().set_output("Out", ["z", "x"]);
        graph.link(relu, x).unwrap();
        assert!(matches!(graph.validate(), Err(IrError::Cycle { .. })));
    }

    #[test]
    fn duplicate_producer_is_rejected_by_validate() {
        let (mut graph, [_, _, y, ..]) = conv_relu();
        let other = graph.add_op(OpDesc::new("fill").with_output("Out", ["y"]));
        graph.link(other, y).unwrap();
        assert!(matches!(
            graph.validate(),
            Err(IrError::MultipleProducers { count: 2, .. })
        ));
    }

    #[test]
    #[should_panic(expected = "not registered in graph")]
    fn add_op_linked_unknown_var() {
        let mut graph = Graph::new();
        graph.add_op_linked(OpDesc::new("relu").with_input("X", ["missing"]));
    }

    #[test]
    #[should_panic(expected = "already produced by node")]
    fn add_op_linked_duplicate_producer() {
        let (mut graph, _) = conv_relu();
        graph.add_op_linked(OpDesc::new("relu").with_output("Out", ["z"]));
    }

    #[test]
    fn program_round_trip() {
        let (graph, _) = conv_relu();
        let program = graph.to_program().unwrap();
        assert_eq!(program.ops.len(), 2);
        assert_eq!(program.ops[0].op_type, "conv2d");
        assert_eq!(program.ops[1].op_type, "relu");

        let rebuilt = Graph::from_program(&program).unwrap();
        assert_eq!(rebuilt.node_count(), graph.node_count());
        assert_eq!(rebuilt.to_program().unwrap(), program);
    }

    #[test]
    fn from_program_declares_missing_vars() {
        let program = ProgramDesc {
            vars: vec![VarDesc::new("x")],
            ops: vec![
                OpDesc::new("relu")
                    .with_input("X", ["x"])
                    .with_output("Out", ["y"]),
            ],
        };
        let graph = Graph::from_program(&program).unwrap();
        let y = graph.find_var("y").unwrap();
        assert!(!graph.var(y).unwrap().persistable);
    }

    #[test]
    fn from_program_rejects_duplicate_declarations() {
        let program = ProgramDesc {
            vars: vec![VarDesc::new("x"), VarDesc::new("x")],
            ops: Vec::new(),
        };
        assert!(matches!(
            Graph::from_program(&program),
            Err(IrError::DuplicateVar(name)) if name == "x"
        ));
    }
}
