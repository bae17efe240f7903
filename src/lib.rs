use derive_more::{Display, Error};
use problemo::{Problem, ProblemResult};
use serde::{Deserialize, Serialize};

/// Scalar element type used throughout the crate.
pub type E = f64;
/// Index type used for sparse structures.
pub type I = usize;

pub mod ad;
pub mod expr;
pub mod eval;
pub mod model;

#[cfg(test)]
pub mod tests;

/// Which triangle of the symmetric Lagrangian Hessian is stored.
///
/// The choice is model-wide and must match the expectation of the embedding
/// solver; all triangular reductions in the crate honor it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HessianSparsityType {
    #[default]
    Upper,
    Lower,
}

/// Error kinds surfaced by the modeling core.
///
/// Construction-time errors are returned to the caller immediately and no
/// partial model state is committed. Numerical failures inside evaluation
/// kernels (e.g. a domain error in `log`) are not caught here; the embedding
/// solver is expected to reject the offending iterate.
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum ModelError {
    /// A comparison constraint whose top-level operator is not `<=`, `>=` or
    /// `==`, or a comparison operator used as a value outside of an
    /// if-then-else condition.
    #[display("Invalid comparison expression")]
    InvalidComparisonExpression,

    /// An operator tag that the trace builder does not recognize.
    #[display("Unknown operator")]
    UnknownOperator,

    /// A primal or dual getter was called before a successful solve.
    #[display("No solution available")]
    NoSolution,

    /// An evaluation callback was called before structure analysis.
    #[display("Structure analysis has not been performed")]
    StructureNotReady,

    /// A group assignment or lookup with an out-of-range group index.
    #[display("Group index out of range")]
    GroupIndexOutOfRange,

    /// An objective of degree higher than quadratic was installed on the
    /// affine/quadratic objective pathway.
    #[display("Incompatible objective degree")]
    IncompatibleObjectiveDegree,

    /// A kernel block is missing an evaluator that its symbolic structure
    /// claims to have.
    #[display("Kernel load failure")]
    KernelLoadFailure,
}

impl ModelError {
    /// Raises this error kind as a [`Problem`].
    pub(crate) fn raise<T>(self) -> Result<T, Problem> {
        Err::<T, ModelError>(self).via(self)
    }
}
