//! Tape-to-tape derivative transformation.
//!
//! Both derivative sub-programs are produced by reverse accumulation written
//! back onto the tape: an adjoint sweep seeds one output slot with 1, walks
//! the instructions backwards and emits the partial-derivative expressions as
//! new nodes. Because node construction folds constants and hash-conses, an
//! entry whose adjoint folds to the zero constant is structurally zero; the
//! sparsity patterns are read off the transformed tape that way, without a
//! numeric seed point.

use crate::expr::graph::UnaryOperator;
use crate::{HessianSparsityType, I};

use super::tape::{ArithOperator, CompareOperator, Slot, Tape, TapeNode};

/// A sparse-Jacobian program: inputs `[p, x]`, outputs the structurally
/// non-zero Jacobian entries in row-major `(rows, cols)` order.
#[derive(Debug, Clone)]
pub struct SparseJacobianProgram {
    pub tape: Tape,
    pub rows: Vec<I>,
    pub cols: Vec<I>,
}

/// A sparse-Hessian program: inputs `[p, w, x]`, outputs the entries of
/// `Σᵢ wᵢ ∇²fᵢ` on the chosen triangle in `(rows, cols)` order. The full
/// symmetric pattern is reported alongside the triangular reduction.
#[derive(Debug, Clone)]
pub struct SparseHessianProgram {
    pub tape: Tape,
    pub rows: Vec<I>,
    pub cols: Vec<I>,
    pub full_rows: Vec<I>,
    pub full_cols: Vec<I>,
}

/// Differentiates every output of `base` with respect to its variables.
pub fn sparse_jacobian_program(base: &Tape) -> SparseJacobianProgram {
    let mut tape = base.clone();
    let outputs = tape.outputs().to_vec();
    tape.reset_outputs();

    let mut rows = Vec::new();
    let mut cols = Vec::new();
    for (i, &output) in outputs.iter().enumerate() {
        let grads = adjoint_sweep(&mut tape, output);
        for (j, &slot) in grads.iter().enumerate() {
            if !tape.is_zero(slot) {
                rows.push(i);
                cols.push(j);
                tape.push_output(slot);
            }
        }
    }
    SparseJacobianProgram { tape, rows, cols }
}

/// Builds the weighted Hessian program `Σᵢ wᵢ ∇²fᵢ` by differentiating the
/// weighted adjoint of `base` a second time.
pub fn sparse_hessian_program(base: &Tape, triangle: HessianSparsityType) -> SparseHessianProgram {
    let mut tape = base.clone();
    let outputs = tape.outputs().to_vec();
    tape.reset_outputs();
    tape.set_weights(outputs.len());

    // weighted objective: W(p, w, x) = sum_i w_i * y_i
    let mut acc = tape.constant(0.0);
    for (i, &output) in outputs.iter().enumerate() {
        let w = tape.weight(i as u32);
        let term = tape.binary(ArithOperator::Mul, w, output);
        acc = tape.binary(ArithOperator::Add, acc, term);
    }

    let grads = adjoint_sweep(&mut tape, acc);
    let n_vars = tape.n_vars();

    let mut rows = Vec::new();
    let mut cols = Vec::new();
    let mut full_rows = Vec::new();
    let mut full_cols = Vec::new();
    for j in 0..n_vars {
        if tape.is_zero(grads[j]) {
            continue;
        }
        let hessian_row = adjoint_sweep(&mut tape, grads[j]);
        for (k, &slot) in hessian_row.iter().enumerate() {
            if tape.is_zero(slot) {
                continue;
            }
            full_rows.push(j);
            full_cols.push(k);
            let keep = match triangle {
                HessianSparsityType::Upper => j <= k,
                HessianSparsityType::Lower => j >= k,
            };
            if keep {
                rows.push(j);
                cols.push(k);
                tape.push_output(slot);
            }
        }
    }
    SparseHessianProgram {
        tape,
        rows,
        cols,
        full_rows,
        full_cols,
    }
}

/// Reverse sweep computing `d(seed)/d(var_j)` for every variable input.
///
/// New nodes are appended to the tape; the returned vector holds one adjoint
/// slot per variable input, the zero constant where the seed does not depend
/// on that variable.
fn adjoint_sweep(tape: &mut Tape, seed: Slot) -> Vec<Slot> {
    let end = tape.len();
    let zero = tape.constant(0.0);
    let one = tape.constant(1.0);

    let mut adjoints = vec![zero; end];
    if (seed as usize) < end {
        adjoints[seed as usize] = one;
    }

    for i in (0..end).rev() {
        let adj = adjoints[i];
        if tape.is_zero(adj) {
            continue;
        }
        match tape.node(i as Slot) {
            TapeNode::Unary { op, arg } => {
                let d = unary_partial(tape, op, arg, i as Slot, adj);
                accumulate(tape, &mut adjoints, arg, d);
            }
            TapeNode::Binary { op, left, right } => {
                let (dl, dr) = binary_partials(tape, op, left, right, i as Slot, adj);
                accumulate(tape, &mut adjoints, left, dl);
                accumulate(tape, &mut adjoints, right, dr);
            }
            TapeNode::Cond {
                op,
                left,
                right,
                if_true,
                if_false,
            } => {
                // The derivative follows whichever branch is active; the
                // condition itself is not differentiated.
                let dt = tape.cond(op, left, right, adj, zero);
                let de = tape.cond(op, left, right, zero, adj);
                accumulate(tape, &mut adjoints, if_true, dt);
                accumulate(tape, &mut adjoints, if_false, de);
            }
            TapeNode::Const(_) | TapeNode::Param(_) | TapeNode::Weight(_) | TapeNode::Var(_) => {}
        }
    }

    (0..tape.n_vars())
        .map(|j| match tape.var_slot(j) {
            Some(slot) if (slot as usize) < end => adjoints[slot as usize],
            _ => zero,
        })
        .collect()
}

fn accumulate(tape: &mut Tape, adjoints: &mut [Slot], child: Slot, delta: Slot) {
    if tape.is_zero(delta) {
        return;
    }
    let current = adjoints[child as usize];
    adjoints[child as usize] = tape.binary(ArithOperator::Add, current, delta);
}

/// `adj * d(op(arg))/d(arg)`. `result` is the slot of `op(arg)` itself,
/// reused where the derivative contains the primal (`exp`, `sqrt`, `tan`).
fn unary_partial(tape: &mut Tape, op: UnaryOperator, arg: Slot, result: Slot, adj: Slot) -> Slot {
    match op {
        UnaryOperator::Neg => tape.unary(UnaryOperator::Neg, adj),
        UnaryOperator::Sin => {
            let cos = tape.unary(UnaryOperator::Cos, arg);
            tape.binary(ArithOperator::Mul, adj, cos)
        }
        UnaryOperator::Cos => {
            let sin = tape.unary(UnaryOperator::Sin, arg);
            let d = tape.binary(ArithOperator::Mul, adj, sin);
            tape.unary(UnaryOperator::Neg, d)
        }
        UnaryOperator::Tan => {
            // d tan = 1 + tan^2
            let one = tape.constant(1.0);
            let sq = tape.binary(ArithOperator::Mul, result, result);
            let d = tape.binary(ArithOperator::Add, one, sq);
            tape.binary(ArithOperator::Mul, adj, d)
        }
        UnaryOperator::Asin => {
            let d = inverse_trig_root(tape, arg);
            tape.binary(ArithOperator::Div, adj, d)
        }
        UnaryOperator::Acos => {
            let d = inverse_trig_root(tape, arg);
            let q = tape.binary(ArithOperator::Div, adj, d);
            tape.unary(UnaryOperator::Neg, q)
        }
        UnaryOperator::Atan => {
            let one = tape.constant(1.0);
            let sq = tape.binary(ArithOperator::Mul, arg, arg);
            let d = tape.binary(ArithOperator::Add, one, sq);
            tape.binary(ArithOperator::Div, adj, d)
        }
        UnaryOperator::Abs => {
            let zero = tape.constant(0.0);
            let neg = tape.unary(UnaryOperator::Neg, adj);
            tape.cond(CompareOperator::GreaterEqual, arg, zero, adj, neg)
        }
        UnaryOperator::Sqrt => {
            let two = tape.constant(2.0);
            let d = tape.binary(ArithOperator::Mul, two, result);
            tape.binary(ArithOperator::Div, adj, d)
        }
        UnaryOperator::Exp => tape.binary(ArithOperator::Mul, adj, result),
        UnaryOperator::Log => tape.binary(ArithOperator::Div, adj, arg),
        UnaryOperator::Log10 => {
            let ln10 = tape.constant(std::f64::consts::LN_10);
            let d = tape.binary(ArithOperator::Mul, arg, ln10);
            tape.binary(ArithOperator::Div, adj, d)
        }
    }
}

/// `sqrt(1 - arg^2)`, the denominator of the asin/acos derivatives.
fn inverse_trig_root(tape: &mut Tape, arg: Slot) -> Slot {
    let one = tape.constant(1.0);
    let sq = tape.binary(ArithOperator::Mul, arg, arg);
    let rest = tape.binary(ArithOperator::Sub, one, sq);
    tape.unary(UnaryOperator::Sqrt, rest)
}

/// `(adj * d/d(left), adj * d/d(right))` of `left op right`; `result` is the
/// slot of the binary node itself.
fn binary_partials(
    tape: &mut Tape,
    op: ArithOperator,
    left: Slot,
    right: Slot,
    result: Slot,
    adj: Slot,
) -> (Slot, Slot) {
    let zero = tape.constant(0.0);
    match op {
        ArithOperator::Add => (adj, adj),
        ArithOperator::Sub => (adj, tape.unary(UnaryOperator::Neg, adj)),
        ArithOperator::Mul => (
            tape.binary(ArithOperator::Mul, adj, right),
            tape.binary(ArithOperator::Mul, adj, left),
        ),
        ArithOperator::Div => {
            let dl = tape.binary(ArithOperator::Div, adj, right);
            let t = tape.binary(ArithOperator::Mul, adj, result);
            let q = tape.binary(ArithOperator::Div, t, right);
            (dl, tape.unary(UnaryOperator::Neg, q))
        }
        ArithOperator::Pow => {
            if let Some(exponent) = tape.const_value(right) {
                // d/da a^c = c * a^(c-1); the exponent contributes nothing.
                let reduced = tape.constant(exponent - 1.0);
                let p = tape.binary(ArithOperator::Pow, left, reduced);
                let c = tape.constant(exponent);
                let t = tape.binary(ArithOperator::Mul, c, p);
                (tape.binary(ArithOperator::Mul, adj, t), zero)
            } else {
                let one = tape.constant(1.0);
                let reduced = tape.binary(ArithOperator::Sub, right, one);
                let p = tape.binary(ArithOperator::Pow, left, reduced);
                let t = tape.binary(ArithOperator::Mul, right, p);
                let dl = tape.binary(ArithOperator::Mul, adj, t);
                let log = tape.unary(UnaryOperator::Log, left);
                let u = tape.binary(ArithOperator::Mul, result, log);
                let dr = tape.binary(ArithOperator::Mul, adj, u);
                (dl, dr)
            }
        }
    }
}
