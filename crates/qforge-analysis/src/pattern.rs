//! Declarative subgraph patterns.
//!
//! A pattern is a set of named roles, each constrained by a [`Predicate`],
//! plus required edges between roles. Roles may belong to a named optional
//! group (for example `"bias"`); a group's roles and every edge touching
//! them only take part in matching when the group is selected at matcher
//! construction time.

use std::collections::BTreeSet;

use crate::predicate::Predicate;

/// Errors in a pattern definition or group selection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("pattern '{pattern}' declares role '{role}' twice")]
    DuplicateRole { pattern: String, role: String },

    #[error("pattern '{pattern}' references unknown role '{role}'")]
    UnknownRole { pattern: String, role: String },

    #[error("pattern '{pattern}' has no optional group '{group}'")]
    UnknownGroup { pattern: String, group: String },

    #[error("pattern '{pattern}' target role '{role}' must not be optional")]
    OptionalTarget { pattern: String, role: String },
}

/// One role of a pattern.
#[derive(Clone, Debug, PartialEq)]
pub struct PatternNode {
    pub role: String,
    pub predicate: Predicate,
    /// Optional group this role belongs to; `None` means always required.
    pub group: Option<String>,
}

/// A required edge `from -> to` between two roles.
///
/// With a `slot`, the operator endpoint must also name the variable endpoint
/// in that slot (input slot for `var -> op`, output slot for `op -> var`).
#[derive(Clone, Debug, PartialEq)]
pub struct PatternEdge {
    pub from: String,
    pub to: String,
    pub slot: Option<String>,
}

/// A named subgraph pattern with a designated target role.
///
/// Within one matcher's result set, no two matches bind the target role to
/// the same node.
#[derive(Clone, Debug, PartialEq)]
pub struct Pattern {
    name: String,
    target: String,
    nodes: Vec<PatternNode>,
    edges: Vec<PatternEdge>,
}

impl Pattern {
    pub fn builder(name: impl Into<String>, target: impl Into<String>) -> PatternBuilder {
        PatternBuilder {
            pattern: Pattern {
                name: name.into(),
                target: target.into(),
                nodes: Vec::new(),
                edges: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn nodes(&self) -> &[PatternNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[PatternEdge] {
        &self.edges
    }

    pub fn node(&self, role: &str) -> Option<&PatternNode> {
        self.nodes.iter().find(|n| n.role == role)
    }

    /// Names of all optional groups.
    pub fn groups(&self) -> BTreeSet<&str> {
        self.nodes.iter().filter_map(|n| n.group.as_deref()).collect()
    }

    /// Check role uniqueness, edge endpoints and the target role.
    pub fn validate(&self) -> Result<(), PatternError> {
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(node.role.as_str()) {
                return Err(PatternError::DuplicateRole {
                    pattern: self.name.clone(),
                    role: node.role.clone(),
                });
            }
        }
        for edge in &self.edges {
            for role in [&edge.from, &edge.to] {
                if !seen.contains(role.as_str()) {
                    return Err(PatternError::UnknownRole {
                        pattern: self.name.clone(),
                        role: role.clone(),
                    });
                }
            }
        }
        match self.node(&self.target) {
            None => Err(PatternError::UnknownRole {
                pattern: self.name.clone(),
                role: self.target.clone(),
            }),
            Some(n) if n.group.is_some() => Err(PatternError::OptionalTarget {
                pattern: self.name.clone(),
                role: self.target.clone(),
            }),
            Some(_) => Ok(()),
        }
    }
}

/// Incremental construction of a [`Pattern`]; validation happens when a
/// matcher is built from it.
#[derive(Debug)]
pub struct PatternBuilder {
    pattern: Pattern,
}

impl PatternBuilder {
    /// Add a required role.
    pub fn node(mut self, role: impl Into<String>, predicate: Predicate) -> Self {
        self.pattern.nodes.push(PatternNode {
            role: role.into(),
            predicate,
            group: None,
        });
        self
    }

    /// Add a role that only participates when `group` is selected.
    pub fn optional(
        mut self,
        group: impl Into<String>,
        role: impl Into<String>,
        predicate: Predicate,
    ) -> Self {
        self.pattern.nodes.push(PatternNode {
            role: role.into(),
            predicate,
            group: Some(group.into()),
        });
        self
    }

    /// Require an edge `from -> to`.
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.pattern.edges.push(PatternEdge {
            from: from.into(),
            to: to.into(),
            slot: None,
        });
        self
    }

    /// Require an edge `from -> to` through the named operator slot.
    pub fn slot_edge(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        slot: impl Into<String>,
    ) -> Self {
        self.pattern.edges.push(PatternEdge {
            from: from.into(),
            to: to.into(),
            slot: Some(slot.into()),
        });
        self
    }

    pub fn build(self) -> Pattern {
        self.pattern
    }
}
