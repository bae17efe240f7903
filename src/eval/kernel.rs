//! Per-group evaluation kernels.
//!
//! A kernel block bundles the function tape of a group with its sparse
//! Jacobian and Hessian sub-programs. Calls gather the instance's variables
//! out of the global `x` through `var_index`, interpret the tape, and write
//! (or scatter-add) the local outputs into the caller's global buffers.
//!
//! Each kernel owns interior scratch so evaluation signatures stay read-only;
//! a single model instance is therefore not reentrant, matching the
//! single-threaded contract of the evaluators.

use std::cell::RefCell;

use problemo::Problem;

use crate::ad::structure::AutodiffRecord;
use crate::ad::tape::Tape;
use crate::{E, I, ModelError};

#[derive(Debug, Default)]
struct KernelScratch {
    values: Vec<E>,
    local_x: Vec<E>,
    out: Vec<E>,
}

impl KernelScratch {
    fn gather(&mut self, x: &[E], var_index: &[I], n_vars: usize) {
        self.local_x.clear();
        self.local_x
            .extend(var_index.iter().take(n_vars).map(|&v| x[v]));
    }
}

fn check_tapes(record: &AutodiffRecord) -> Result<(), Problem> {
    if record.structure.has_jacobian && record.jacobian_tape.is_none() {
        return ModelError::KernelLoadFailure.raise();
    }
    if record.structure.has_hessian && record.hessian_tape.is_none() {
        return ModelError::KernelLoadFailure.raise();
    }
    Ok(())
}

/// Kernel block of a constraint group: value rows, Jacobian entries and
/// weighted Hessian entries.
#[derive(Debug)]
pub struct ConstraintKernel {
    f_tape: Tape,
    jacobian_tape: Option<Tape>,
    hessian_tape: Option<Tape>,
    scratch: RefCell<KernelScratch>,
}

impl ConstraintKernel {
    pub fn from_record(record: AutodiffRecord) -> Result<Self, Problem> {
        check_tapes(&record)?;
        Ok(Self {
            f_tape: record.f_tape,
            jacobian_tape: record.jacobian_tape,
            hessian_tape: record.hessian_tape,
            scratch: RefCell::default(),
        })
    }

    /// Writes the group's `ny` constraint values into `y`.
    pub fn eval_function(&self, x: &[E], p: &[E], y: &mut [E], var_index: &[I]) {
        let scratch = &mut *self.scratch.borrow_mut();
        scratch.gather(x, var_index, self.f_tape.n_vars());
        self.f_tape
            .eval_into(p, &[], &scratch.local_x, &mut scratch.values, y);
    }

    /// Writes the group's local Jacobian values into `jacobian`, aligned
    /// with the group's local sparsity order.
    pub fn eval_jacobian(&self, x: &[E], p: &[E], jacobian: &mut [E], var_index: &[I]) {
        let Some(tape) = &self.jacobian_tape else {
            return;
        };
        let scratch = &mut *self.scratch.borrow_mut();
        scratch.gather(x, var_index, tape.n_vars());
        tape.eval_into(p, &[], &scratch.local_x, &mut scratch.values, jacobian);
    }

    /// Scatter-adds `Σᵢ wᵢ ∇²fᵢ` into `hessian` at the slots listed in
    /// `hessian_index`.
    pub fn eval_hessian(
        &self,
        x: &[E],
        p: &[E],
        w: &[E],
        hessian: &mut [E],
        var_index: &[I],
        hessian_index: &[I],
    ) {
        let Some(tape) = &self.hessian_tape else {
            return;
        };
        let scratch = &mut *self.scratch.borrow_mut();
        scratch.gather(x, var_index, tape.n_vars());
        let nnz = tape.outputs().len();
        scratch.out.resize(nnz, 0.0);
        tape.eval_into(p, w, &scratch.local_x, &mut scratch.values, &mut scratch.out);
        for k in 0..nnz {
            hessian[hessian_index[k]] += scratch.out[k];
        }
    }
}

/// Kernel block of an objective group. The value and gradient kernels are
/// additive: values accumulate into the scalar objective, gradient entries
/// scatter-add through `gradient_index` so groups sharing a column sum
/// correctly.
#[derive(Debug)]
pub struct ObjectiveKernel {
    f_tape: Tape,
    jacobian_tape: Option<Tape>,
    hessian_tape: Option<Tape>,
    scratch: RefCell<KernelScratch>,
}

impl ObjectiveKernel {
    pub fn from_record(record: AutodiffRecord) -> Result<Self, Problem> {
        check_tapes(&record)?;
        Ok(Self {
            f_tape: record.f_tape,
            jacobian_tape: record.jacobian_tape,
            hessian_tape: record.hessian_tape,
            scratch: RefCell::default(),
        })
    }

    /// Adds the sum of the group's objective outputs into `y`.
    pub fn eval_function(&self, x: &[E], p: &[E], y: &mut E, var_index: &[I]) {
        let scratch = &mut *self.scratch.borrow_mut();
        scratch.gather(x, var_index, self.f_tape.n_vars());
        let ny = self.f_tape.outputs().len();
        scratch.out.resize(ny, 0.0);
        self.f_tape.eval_into(
            p,
            &[],
            &scratch.local_x,
            &mut scratch.values,
            &mut scratch.out,
        );
        *y += scratch.out.iter().sum::<E>();
    }

    /// Scatter-adds the local gradient into `grad` at the slots listed in
    /// `gradient_index`.
    pub fn eval_gradient(
        &self,
        x: &[E],
        p: &[E],
        grad: &mut [E],
        var_index: &[I],
        gradient_index: &[I],
    ) {
        let Some(tape) = &self.jacobian_tape else {
            return;
        };
        let scratch = &mut *self.scratch.borrow_mut();
        scratch.gather(x, var_index, tape.n_vars());
        let nnz = tape.outputs().len();
        scratch.out.resize(nnz, 0.0);
        tape.eval_into(p, &[], &scratch.local_x, &mut scratch.values, &mut scratch.out);
        for k in 0..nnz {
            grad[gradient_index[k]] += scratch.out[k];
        }
    }

    /// Scatter-adds the weighted Hessian into `hessian`; identical contract
    /// to [`ConstraintKernel::eval_hessian`].
    pub fn eval_hessian(
        &self,
        x: &[E],
        p: &[E],
        w: &[E],
        hessian: &mut [E],
        var_index: &[I],
        hessian_index: &[I],
    ) {
        let Some(tape) = &self.hessian_tape else {
            return;
        };
        let scratch = &mut *self.scratch.borrow_mut();
        scratch.gather(x, var_index, tape.n_vars());
        let nnz = tape.outputs().len();
        scratch.out.resize(nnz, 0.0);
        tape.eval_into(p, w, &scratch.local_x, &mut scratch.values, &mut scratch.out);
        for k in 0..nnz {
            hessian[hessian_index[k]] += scratch.out[k];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HessianSparsityType;
    use crate::ad::structure::autodiff;
    use crate::ad::trace::trace_graph;
    use crate::expr::graph::{ExpressionGraph, NaryOperator};

    fn square_record() -> AutodiffRecord {
        let mut graph = ExpressionGraph::new();
        let x = graph.add_variable(0);
        let sq = graph.add_nary(NaryOperator::Mul, vec![x, x]);
        let tape = trace_graph(&graph, &[sq]).unwrap();
        autodiff(tape, HessianSparsityType::Upper)
    }

    #[test]
    fn constraint_kernel_gathers_through_var_index() {
        let kernel = ConstraintKernel::from_record(square_record()).unwrap();
        let x = [1.0, 2.0, 3.0];
        let mut y = [0.0];
        kernel.eval_function(&x, &[], &mut y, &[2]);
        assert_eq!(y[0], 9.0);

        let mut jacobian = [0.0];
        kernel.eval_jacobian(&x, &[], &mut jacobian, &[2]);
        assert_eq!(jacobian[0], 6.0);
    }

    #[test]
    fn objective_kernel_is_additive() {
        let kernel = ObjectiveKernel::from_record(square_record()).unwrap();
        let x = [3.0, 4.0];
        let mut y = 0.0;
        kernel.eval_function(&x, &[], &mut y, &[0]);
        kernel.eval_function(&x, &[], &mut y, &[1]);
        assert_eq!(y, 25.0);

        let mut grad = [0.0, 0.0];
        kernel.eval_gradient(&x, &[], &mut grad, &[0], &[0]);
        kernel.eval_gradient(&x, &[], &mut grad, &[1], &[1]);
        assert_eq!(grad, [6.0, 8.0]);
        // a second scatter accumulates
        kernel.eval_gradient(&x, &[], &mut grad, &[0], &[0]);
        assert_eq!(grad, [12.0, 8.0]);
    }

    #[test]
    fn hessian_kernel_scales_by_weights() {
        let kernel = ConstraintKernel::from_record(square_record()).unwrap();
        let mut hessian = [0.0, 0.0];
        kernel.eval_hessian(&[5.0], &[], &[0.5], &mut hessian, &[0], &[1]);
        assert_eq!(hessian, [0.0, 1.0]);
    }

    #[test]
    fn missing_derivative_tape_is_a_load_failure() {
        let mut record = square_record();
        record.jacobian_tape = None;
        assert!(ConstraintKernel::from_record(record).is_err());
    }
}
