//! qforge graph intermediate representation.
//!
//! A bipartite graph of operator and variable nodes mirroring the host
//! framework's program description, plus the [`Scope`] holding tensor
//! values by variable name. Passes in `qforge-opt` rewrite this graph in
//! place and re-[`validate`](Graph::validate) it after every step.

mod attr;
mod desc;
mod display;
mod error;
pub mod graph;
mod scope;

pub use attr::Attribute;
pub use desc::{DataType, OpDesc, ProgramDesc, VarDesc};
pub use display::{dump_graph, format_op};
pub use error::IrError;
pub use graph::{Graph, Node, NodeId, NodeKind};
pub use scope::{Scope, Tensor, TensorData};
