//! End-to-end scenarios driving the full modeling-to-callback pipeline.

use crate::E;
use crate::expr::func::{ScalarAffineFunction, ScalarQuadraticFunction};
use crate::expr::graph::{
    BinaryOperator, ExpressionGraph, NaryOperator, TernaryOperator, UnaryOperator,
};
use crate::model::{ConstraintKind, ConstraintSense, NlpModel, ObjectiveSense};

const INF: E = E::INFINITY;

fn free_variables(model: &mut NlpModel, n: usize) {
    for _ in 0..n {
        model.add_variable(-INF, INF, 0.0, None);
    }
}

/// Two structurally identical squares over distinct variables fold into one
/// objective group with merged gradient and Hessian layouts.
#[test]
fn two_copies_of_x_squared() {
    let mut model = NlpModel::new();
    free_variables(&mut model, 2);

    for var in 0..2u32 {
        let mut graph = ExpressionGraph::new();
        let x = graph.add_variable(var);
        let square = graph.add_nary(NaryOperator::Mul, vec![x, x]);
        model.add_nl_objective(&mut graph, square);
        let instance = model.add_graph_instance();
        model.finalize_graph_instance(instance, graph);
    }

    model.analyze_structure().unwrap();
    assert_eq!(model.nonlinear().objective_groups().len(), 1);
    assert_eq!(
        model.nonlinear().objective_groups()[0].instance_indices.len(),
        2
    );

    let x = [3.0, 4.0];
    assert_eq!(model.eval_objective(&x).unwrap(), 25.0);

    let (cols, values) = model.eval_objective_gradient(&x).unwrap();
    assert_eq!(cols, &[0, 1]);
    assert_eq!(values, &[6.0, 8.0]);

    let (rows, cols) = model.hessian_structure();
    assert_eq!(rows, &[0, 1]);
    assert_eq!(cols, &[0, 1]);

    let mut hessian = [0.0; 2];
    model
        .eval_lagrangian_hessian(&x, &[], 1.0, &mut hessian)
        .unwrap();
    assert_eq!(hessian, [2.0, 2.0]);
}

/// A nonlinear equality constraint carrying a dynamic parameter:
/// `exp(p * v) - 1 == 0` with `p = 0.5`.
#[test]
fn nonlinear_constraint_with_parameter() {
    let mut model = NlpModel::new();
    free_variables(&mut model, 1);
    let p = model.add_parameter(0.5);

    let mut graph = ExpressionGraph::new();
    let v = graph.add_variable(0);
    let param = graph.add_parameter(p.index);
    let product = graph.add_nary(NaryOperator::Mul, vec![param, v]);
    let exp = graph.add_unary(UnaryOperator::Exp, product);
    let one = graph.add_constant(1.0);
    let body = graph.add_binary(BinaryOperator::Sub, exp, one);
    let zero = graph.add_constant(0.0);
    let compare = graph.add_binary(BinaryOperator::Equal, body, zero);

    let instance = model.add_graph_instance();
    let constraint = model
        .add_nl_constraint_comparison(instance, &mut graph, compare)
        .unwrap();
    assert_eq!(constraint.kind, ConstraintKind::Nonlinear);
    model.finalize_graph_instance(instance, graph);

    model.analyze_structure().unwrap();
    assert_eq!(model.constraint_lower_bounds(), &[0.0]);
    assert_eq!(model.constraint_upper_bounds(), &[0.0]);

    let x = [0.0];
    let mut g = [E::NAN];
    model.eval_constraints(&x, &mut g).unwrap();
    assert_eq!(g, [0.0]);

    let (rows, cols) = model.jacobian_structure();
    assert_eq!((rows, cols), (&[0][..], &[0][..]));
    let mut jacobian = [0.0];
    model.eval_constraints_jacobian(&x, &mut jacobian).unwrap();
    assert_eq!(jacobian, [0.5]);

    let (rows, cols) = model.hessian_structure();
    assert_eq!((rows, cols), (&[0][..], &[0][..]));
    let lambda = [2.0];
    let mut hessian = [0.0];
    model
        .eval_lagrangian_hessian(&x, &lambda, 1.0, &mut hessian)
        .unwrap();
    assert_eq!(hessian, [2.0 * 0.25]);
}

/// One hundred copies of `sin(x_i)` fold into a single group evaluated per
/// instance.
#[test]
fn grouped_repetition_of_sin() {
    let mut model = NlpModel::new();
    free_variables(&mut model, 100);

    for var in 0..100u32 {
        let mut graph = ExpressionGraph::new();
        let x = graph.add_variable(var);
        let s = graph.add_unary(UnaryOperator::Sin, x);
        model.add_nl_objective(&mut graph, s);
        let instance = model.add_graph_instance();
        model.finalize_graph_instance(instance, graph);
    }

    model.analyze_structure().unwrap();
    let groups = model.nonlinear().objective_groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].instance_indices.len(), 100);

    let x = vec![0.0; 100];
    assert_eq!(model.eval_objective(&x).unwrap(), 0.0);

    let (cols, values) = model.eval_objective_gradient(&x).unwrap();
    assert_eq!(cols.len(), 100);
    assert!(values.iter().all(|&v| v == 1.0));

    assert_eq!(model.hessian_nnz(), 100);
    let mut hessian = vec![E::NAN; 100];
    model
        .eval_lagrangian_hessian(&x, &[], 1.0, &mut hessian)
        .unwrap();
    assert!(hessian.iter().all(|&h| h == 0.0));
}

/// An if-then-else constraint: value and Jacobian follow the active branch.
#[test]
fn if_then_else_branch_selection() {
    let mut model = NlpModel::new();
    free_variables(&mut model, 2);

    let mut graph = ExpressionGraph::new();
    let a = graph.add_variable(0);
    let b = graph.add_variable(1);
    let compare = graph.add_binary(BinaryOperator::LessEqual, a, b);
    let a_squared = graph.add_nary(NaryOperator::Mul, vec![a, a]);
    let b_squared = graph.add_nary(NaryOperator::Mul, vec![b, b]);
    let body = graph.add_ternary(TernaryOperator::IfThenElse, compare, a_squared, b_squared);

    let instance = model.add_graph_instance();
    model.add_single_nl_constraint(instance, &mut graph, body, -INF, 10.0);
    model.finalize_graph_instance(instance, graph);
    model.analyze_structure().unwrap();

    // both branches contribute to the sparsity pattern
    let (rows, cols) = model.jacobian_structure();
    assert_eq!(rows, &[0, 0]);
    assert_eq!(cols, &[0, 1]);

    let x = [1.0, 2.0];
    let mut g = [0.0];
    model.eval_constraints(&x, &mut g).unwrap();
    assert_eq!(g, [1.0]);
    let mut jacobian = [0.0; 2];
    model.eval_constraints_jacobian(&x, &mut jacobian).unwrap();
    assert_eq!(jacobian, [2.0, 0.0]);

    let x = [3.0, 2.0];
    model.eval_constraints(&x, &mut g).unwrap();
    assert_eq!(g, [4.0]);
    model.eval_constraints_jacobian(&x, &mut jacobian).unwrap();
    assert_eq!(jacobian, [0.0, 4.0]);
}

/// Mixed linear + nonlinear model: internal row order, merged Hessian slots
/// and the external-to-internal constraint map.
#[test]
fn mixed_linear_nonlinear_driver() {
    let mut model = NlpModel::new();
    free_variables(&mut model, 2);

    // x0 + x1 == 1
    let linear = model.add_linear_constraint(
        &ScalarAffineFunction::new(vec![1.0, 1.0], vec![0, 1], None),
        ConstraintSense::Equal,
        1.0,
    );
    assert_eq!(linear.kind, ConstraintKind::Linear);

    // x0^2 + x1^2 <= 1
    let mut graph = ExpressionGraph::new();
    let x0 = graph.add_variable(0);
    let x1 = graph.add_variable(1);
    let sq0 = graph.add_nary(NaryOperator::Mul, vec![x0, x0]);
    let sq1 = graph.add_nary(NaryOperator::Mul, vec![x1, x1]);
    let body = graph.add_nary(NaryOperator::Add, vec![sq0, sq1]);
    let instance = model.add_graph_instance();
    let nonlinear = model.add_single_nl_constraint(instance, &mut graph, body, -INF, 1.0);
    model.finalize_graph_instance(instance, graph);

    // minimize (x0 - 1)^2 + x1^2 = x0^2 - 2 x0 + 1 + x1^2
    model.set_quadratic_objective(
        &ScalarQuadraticFunction::new(
            vec![1.0, 1.0],
            vec![0, 1],
            vec![0, 1],
            Some(ScalarAffineFunction::new(vec![-2.0], vec![0], Some(1.0))),
        ),
        ObjectiveSense::Minimize,
    );

    model.analyze_structure().unwrap();

    // internal order: [linear row, nonlinear row]
    assert_eq!(model.n_constraints(), 2);
    assert_eq!(model.constraint_lower_bounds(), &[1.0, -INF]);
    assert_eq!(model.constraint_upper_bounds(), &[1.0, 1.0]);
    assert_eq!(model.constraint_internal_index(linear).unwrap(), 0);
    assert_eq!(model.constraint_internal_index(nonlinear).unwrap(), 1);

    let x = [1.0, 0.0];
    assert_eq!(model.eval_objective(&x).unwrap(), 0.0);

    let mut g = [0.0; 2];
    model.eval_constraints(&x, &mut g).unwrap();
    assert_eq!(g, [1.0, 1.0]);

    let (rows, cols) = model.jacobian_structure();
    assert_eq!(rows, &[0, 0, 1, 1]);
    assert_eq!(cols, &[0, 1, 0, 1]);
    let mut jacobian = [0.0; 4];
    model.eval_constraints_jacobian(&x, &mut jacobian).unwrap();
    assert_eq!(jacobian, [1.0, 1.0, 2.0, 0.0]);

    // quadratic objective and nonlinear constraint share both diagonal slots
    let (rows, cols) = model.hessian_structure();
    assert_eq!(rows, &[0, 1]);
    assert_eq!(cols, &[0, 1]);
    let lambda = [0.3, 0.7];
    let mut hessian = [0.0; 2];
    model
        .eval_lagrangian_hessian(&x, &lambda, 1.0, &mut hessian)
        .unwrap();
    assert_eq!(hessian, [2.0 + 2.0 * 0.7, 2.0 + 2.0 * 0.7]);
}

/// Growth after aggregation: new instances join the existing group and the
/// earlier memberships stay bitwise identical.
#[test]
fn reaggregation_after_growth() {
    let mut model = NlpModel::new();
    free_variables(&mut model, 150);

    let add_sin = |model: &mut NlpModel, var: u32| {
        let mut graph = ExpressionGraph::new();
        let x = graph.add_variable(var);
        let s = graph.add_unary(UnaryOperator::Sin, x);
        model.add_nl_objective(&mut graph, s);
        let instance = model.add_graph_instance();
        model.finalize_graph_instance(instance, graph);
    };

    for var in 0..100u32 {
        add_sin(&mut model, var);
    }
    model.analyze_structure().unwrap();
    let before: Vec<_> = (0..100)
        .map(|i| model.nonlinear().objective_membership(i).unwrap())
        .collect();

    for var in 100..150u32 {
        add_sin(&mut model, var);
    }
    model.analyze_structure().unwrap();

    let groups = model.nonlinear().objective_groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].instance_indices.len(), 150);
    for i in 0..100 {
        assert_eq!(model.nonlinear().objective_membership(i).unwrap(), before[i]);
    }
    // ranks stay monotone in insertion order
    for i in 0..150 {
        assert_eq!(model.nonlinear().objective_membership(i).unwrap().rank, i);
    }

    let x = vec![0.0; 150];
    let (cols, _) = model.eval_objective_gradient(&x).unwrap();
    assert_eq!(cols.len(), 150);
}
