//! Pattern matching over qforge graphs.
//!
//! Patterns are declared with [`Pattern::builder`] from [`Predicate`]s and
//! role-to-role edges, compiled into a [`PatternMatcher`] for a chosen set
//! of optional groups, and run against a [`Graph`](qforge_ir::Graph) to
//! produce [`Match`]es.

mod matcher;
mod pattern;
pub mod patterns;
mod predicate;

pub use matcher::{Match, PatternMatcher};
pub use pattern::{Pattern, PatternBuilder, PatternEdge, PatternError, PatternNode};
pub use predicate::Predicate;
