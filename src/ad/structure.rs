//! Symbolic structure extraction.
//!
//! Given a traced program, produce the Jacobian sparsity, the full and
//! triangular-reduced Hessian sparsity, and the sparse derivative
//! sub-programs that the per-group kernels are compiled from.

use crate::{HessianSparsityType, I};

use super::derive::{sparse_hessian_program, sparse_jacobian_program};
use super::tape::Tape;

/// Sparsity summary of one AD program.
///
/// `hessian_rows` / `hessian_cols` are restricted to the chosen triangle of
/// the symmetric Lagrangian Hessian.
#[derive(Debug, Clone, Default)]
pub struct AutodiffSymbolicStructure {
    pub nx: usize,
    pub np: usize,
    pub ny: usize,

    pub jacobian_rows: Vec<I>,
    pub jacobian_cols: Vec<I>,
    pub jacobian_nnz: usize,

    pub hessian_rows: Vec<I>,
    pub hessian_cols: Vec<I>,
    pub hessian_nnz: usize,

    pub has_parameter: bool,
    pub has_jacobian: bool,
    pub has_hessian: bool,
}

/// Jacobian and Hessian sparsity patterns of one program, before and after
/// triangular reduction.
#[derive(Debug, Clone, Default)]
pub struct JacobianHessianSparsity {
    pub jacobian_rows: Vec<I>,
    pub jacobian_cols: Vec<I>,
    pub hessian_rows: Vec<I>,
    pub hessian_cols: Vec<I>,
    pub reduced_hessian_rows: Vec<I>,
    pub reduced_hessian_cols: Vec<I>,
}

/// One fully analyzed AD program: the function tape, its sparsity structure
/// and the derivative sub-programs (present only when non-trivial).
#[derive(Debug, Clone)]
pub struct AutodiffRecord {
    pub structure: AutodiffSymbolicStructure,
    pub sparsity: JacobianHessianSparsity,
    pub f_tape: Tape,
    pub jacobian_tape: Option<Tape>,
    pub hessian_tape: Option<Tape>,
}

/// Runs the derivative transformations over `f_tape` and assembles the
/// symbolic structure used by the group engine.
pub fn autodiff(f_tape: Tape, hessian_type: HessianSparsityType) -> AutodiffRecord {
    let mut structure = AutodiffSymbolicStructure {
        nx: f_tape.n_vars(),
        np: f_tape.n_params(),
        ny: f_tape.outputs().len(),
        has_parameter: f_tape.n_params() > 0,
        ..Default::default()
    };
    let mut sparsity = JacobianHessianSparsity::default();

    let jacobian = sparse_jacobian_program(&f_tape);
    structure.jacobian_nnz = jacobian.rows.len();
    structure.jacobian_rows = jacobian.rows.clone();
    structure.jacobian_cols = jacobian.cols.clone();
    structure.has_jacobian = structure.jacobian_nnz > 0;
    sparsity.jacobian_rows = jacobian.rows;
    sparsity.jacobian_cols = jacobian.cols;

    let hessian = sparse_hessian_program(&f_tape, hessian_type);
    structure.hessian_nnz = hessian.rows.len();
    structure.hessian_rows = hessian.rows.clone();
    structure.hessian_cols = hessian.cols.clone();
    structure.has_hessian = structure.hessian_nnz > 0;
    sparsity.reduced_hessian_rows = hessian.rows;
    sparsity.reduced_hessian_cols = hessian.cols;
    sparsity.hessian_rows = hessian.full_rows;
    sparsity.hessian_cols = hessian.full_cols;

    let jacobian_tape = structure.has_jacobian.then_some(jacobian.tape);
    let hessian_tape = structure.has_hessian.then_some(hessian.tape);
    AutodiffRecord {
        structure,
        sparsity,
        f_tape,
        jacobian_tape,
        hessian_tape,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::graph::{ExpressionGraph, NaryOperator, UnaryOperator};

    #[test]
    fn structure_of_sin_square() {
        // f = sin(x * x)
        let mut graph = ExpressionGraph::new();
        let x = graph.add_variable(0);
        let sq = graph.add_nary(NaryOperator::Mul, vec![x, x]);
        let s = graph.add_unary(UnaryOperator::Sin, sq);

        let tape = crate::ad::trace::trace_graph(&graph, &[s]).unwrap();
        let record = autodiff(tape, HessianSparsityType::Upper);
        let structure = &record.structure;

        assert_eq!((structure.nx, structure.np, structure.ny), (1, 0, 1));
        assert!(!structure.has_parameter);
        assert!(structure.has_jacobian);
        assert!(structure.has_hessian);
        assert_eq!(structure.jacobian_nnz, 1);
        assert_eq!(structure.hessian_nnz, 1);
        assert_eq!(structure.hessian_rows, vec![0]);
        assert_eq!(structure.hessian_cols, vec![0]);
        assert!(record.jacobian_tape.is_some());
        assert!(record.hessian_tape.is_some());
    }

    #[test]
    fn constant_output_has_no_derivatives() {
        let mut graph = ExpressionGraph::new();
        let c = graph.add_constant(42.0);
        let tape = crate::ad::trace::trace_graph(&graph, &[c]).unwrap();
        let record = autodiff(tape, HessianSparsityType::Upper);
        assert!(!record.structure.has_jacobian);
        assert!(!record.structure.has_hessian);
        assert!(record.jacobian_tape.is_none());
        assert!(record.hessian_tape.is_none());
    }

    #[test]
    fn linear_output_has_jacobian_but_no_hessian() {
        let mut graph = ExpressionGraph::new();
        let x = graph.add_variable(0);
        let y = graph.add_variable(1);
        let sum = graph.add_nary(NaryOperator::Add, vec![x, y]);
        let tape = crate::ad::trace::trace_graph(&graph, &[sum]).unwrap();
        let record = autodiff(tape, HessianSparsityType::Lower);
        assert_eq!(record.structure.jacobian_nnz, 2);
        assert!(!record.structure.has_hessian);
    }
}
