//! # Automatic Differentiation
//!
//! An instruction-tape AD engine and the transformations the evaluators need
//! from it:
//!
//! - [`tape`]: the append-only instruction tape with constant folding and
//!   hash-consing at construction, plus a forward interpreter.
//! - [`trace`]: turns an [`ExpressionGraph`](crate::expr::graph::ExpressionGraph)
//!   output list into a tape over its variables and dynamic parameters.
//! - [`derive`]: tape-to-tape adjoint transformation producing the sparse
//!   Jacobian and weighted sparse Hessian sub-programs.
//! - [`structure`]: bundles a traced program with its sparsity patterns and
//!   derivative sub-programs into the symbolic structure consumed by the
//!   group engine.

pub mod derive;
pub mod structure;
pub mod tape;
pub mod trace;
