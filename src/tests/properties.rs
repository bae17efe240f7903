//! Property-level checks across the evaluator stack.

use rstest::rstest;
use rstest_reuse::{apply, template};

use crate::expr::func::{ScalarAffineFunction, VariableIndex};
use crate::expr::graph::{ExpressionGraph, NaryOperator, UnaryOperator};
use crate::model::{ConstraintSense, NlpModel, NlpSolution, ObjectiveSense};
use crate::{E, HessianSparsityType};

const INF: E = E::INFINITY;

fn free_variables(model: &mut NlpModel, n: usize) {
    for _ in 0..n {
        model.add_variable(-INF, INF, 0.0, None);
    }
}

/// Central finite difference of the model objective along coordinate `j`.
fn finite_difference(model: &NlpModel, x: &[E], j: usize) -> E {
    let h = 1e-6;
    let mut forward = x.to_vec();
    forward[j] += h;
    let mut backward = x.to_vec();
    backward[j] -= h;
    let f_forward = model.eval_objective(&forward).unwrap();
    let f_backward = model.eval_objective(&backward).unwrap();
    (f_forward - f_backward) / (2.0 * h)
}

/// The sparse gradient agrees with finite differences across groups that
/// share columns (two different graph shapes both touching `x1`).
#[test]
fn sparse_gradient_matches_finite_differences() {
    let mut model = NlpModel::new();
    free_variables(&mut model, 2);

    // exp(x0) * x1
    let mut graph = ExpressionGraph::new();
    let x0 = graph.add_variable(0);
    let x1 = graph.add_variable(1);
    let e = graph.add_unary(UnaryOperator::Exp, x0);
    let product = graph.add_nary(NaryOperator::Mul, vec![e, x1]);
    model.add_nl_objective(&mut graph, product);
    let instance = model.add_graph_instance();
    model.finalize_graph_instance(instance, graph);

    // sin(x1)
    let mut graph = ExpressionGraph::new();
    let x1 = graph.add_variable(1);
    let s = graph.add_unary(UnaryOperator::Sin, x1);
    model.add_nl_objective(&mut graph, s);
    let instance = model.add_graph_instance();
    model.finalize_graph_instance(instance, graph);

    model.analyze_structure().unwrap();
    assert_eq!(model.nonlinear().objective_groups().len(), 2);

    let x = [0.3, -0.2];
    let (cols, values) = model.eval_objective_gradient(&x).unwrap();
    let mut dense = vec![0.0; 2];
    for (&col, &value) in cols.iter().zip(values) {
        dense[col] += value;
    }

    for j in 0..2 {
        let fd = finite_difference(&model, &x, j);
        assert!(
            (dense[j] - fd).abs() < 1e-7,
            "gradient mismatch at {}: {} vs {}",
            j,
            dense[j],
            fd
        );
    }
}

/// Instances grouped by hash evaluate with their own variables and parameter
/// values: the shared AD program is only a shape.
#[test]
fn group_members_keep_their_own_data() {
    let mut model = NlpModel::new();
    free_variables(&mut model, 4);
    let p2 = model.add_parameter(2.0);
    let p3 = model.add_parameter(3.0);

    // p * xa * xb over two different variable pairs and parameter values
    for (parameter, va, vb) in [(p2, 0u32, 1u32), (p3, 2, 3)] {
        let mut graph = ExpressionGraph::new();
        let p = graph.add_parameter(parameter.index);
        let xa = graph.add_variable(va);
        let xb = graph.add_variable(vb);
        let product = graph.add_nary(NaryOperator::Mul, vec![p, xa, xb]);
        let instance = model.add_graph_instance();
        model.add_single_nl_constraint(instance, &mut graph, product, -INF, INF);
        model.finalize_graph_instance(instance, graph);
    }

    model.analyze_structure().unwrap();
    assert_eq!(model.nonlinear().constraint_groups().len(), 1);
    assert_eq!(
        model.nonlinear().constraint_groups()[0]
            .instance_indices
            .len(),
        2
    );

    let x = [5.0, 7.0, 11.0, 13.0];
    let mut g = [0.0; 2];
    model.eval_constraints(&x, &mut g).unwrap();
    assert_eq!(g, [2.0 * 5.0 * 7.0, 3.0 * 11.0 * 13.0]);
}

#[template]
#[rstest]
#[case::upper(HessianSparsityType::Upper)]
#[case::lower(HessianSparsityType::Lower)]
fn triangles(#[case] triangle: HessianSparsityType) {}

/// Symmetric contributions from instances with opposite variable orders are
/// canonicalized into a single Hessian slot, in either triangle.
#[apply(triangles)]
fn hessian_merges_symmetric_entries(#[case] triangle: HessianSparsityType) {
    let mut model = NlpModel::new().with_hessian_sparsity(triangle);
    free_variables(&mut model, 2);

    // first instance sees (x0, x1), the second (x1, x0)
    for (va, vb) in [(0u32, 1u32), (1, 0)] {
        let mut graph = ExpressionGraph::new();
        let xa = graph.add_variable(va);
        let xb = graph.add_variable(vb);
        let product = graph.add_nary(NaryOperator::Mul, vec![xa, xb]);
        let instance = model.add_graph_instance();
        model.add_single_nl_constraint(instance, &mut graph, product, -INF, INF);
        model.finalize_graph_instance(instance, graph);
    }

    model.analyze_structure().unwrap();
    assert_eq!(model.hessian_nnz(), 1);
    let (rows, cols) = model.hessian_structure();
    match triangle {
        HessianSparsityType::Upper => assert_eq!((rows[0], cols[0]), (0, 1)),
        HessianSparsityType::Lower => assert_eq!((rows[0], cols[0]), (1, 0)),
    }

    let x = [1.0, 1.0];
    let lambda = [2.0, 5.0];
    let mut hessian = [0.0];
    model
        .eval_lagrangian_hessian(&x, &lambda, 1.0, &mut hessian)
        .unwrap();
    assert_eq!(hessian, [7.0]);
}

/// Maximization runs through the callbacks as minimization of the negated
/// objective, and reporting restores the user's sense.
#[test]
fn maximization_negates_the_callback_surface() {
    let mut model = NlpModel::new();
    free_variables(&mut model, 1);
    model.set_linear_objective(
        &ScalarAffineFunction::new(vec![3.0], vec![0], None),
        ObjectiveSense::Maximize,
    );
    model.analyze_structure().unwrap();

    let x = [2.0];
    assert_eq!(model.eval_objective(&x).unwrap(), -6.0);
    let (cols, values) = model.eval_objective_gradient(&x).unwrap();
    assert_eq!((cols, values), (&[0][..], &[-3.0][..]));

    model.set_solution(NlpSolution {
        x: vec![2.0],
        obj_value: -6.0,
        ..Default::default()
    });
    assert_eq!(model.get_obj_value().unwrap(), 6.0);
}

/// Getters fail with `NoSolution` before a solve and read through the
/// external-to-internal constraint map afterwards.
#[test]
fn solution_plumbing_and_row_mapping() {
    let mut model = NlpModel::new();
    free_variables(&mut model, 2);

    let linear = model.add_linear_constraint(
        &ScalarAffineFunction::new(vec![1.0, 1.0], vec![0, 1], None),
        ConstraintSense::LessEqual,
        4.0,
    );

    let mut graph = ExpressionGraph::new();
    let x0 = graph.add_variable(0);
    let square = graph.add_nary(NaryOperator::Mul, vec![x0, x0]);
    let instance = model.add_graph_instance();
    let nonlinear = model.add_single_nl_constraint(instance, &mut graph, square, -INF, 9.0);
    model.finalize_graph_instance(instance, graph);

    model.analyze_structure().unwrap();

    assert!(model.get_variable_value(VariableIndex::new(0)).is_err());
    assert!(model.get_obj_value().is_err());
    assert!(model.get_constraint_dual(linear).is_err());

    model.set_solution(NlpSolution {
        x: vec![1.0, 2.0],
        obj_value: 0.0,
        g: vec![3.0, 1.0],
        mult_g: vec![-0.5, 0.25],
        mult_x_lb: vec![0.0; 2],
        mult_x_ub: vec![0.0; 2],
    });

    assert_eq!(model.get_variable_value(VariableIndex::new(0)).unwrap(), 1.0);
    assert_eq!(model.get_constraint_primal(linear).unwrap(), 3.0);
    assert_eq!(model.get_constraint_primal(nonlinear).unwrap(), 1.0);
    assert_eq!(model.get_constraint_dual(nonlinear).unwrap(), 0.25);
    assert_eq!(
        model
            .get_affine_expression_value(&ScalarAffineFunction::new(
                vec![1.0, 1.0],
                vec![0, 1],
                None
            ))
            .unwrap(),
        3.0
    );

    model.load_current_solution().unwrap();
    assert_eq!(model.variable_start_values(), &[1.0, 2.0]);
}

/// Evaluation before structure analysis is rejected.
#[test]
fn evaluation_requires_structure_analysis() {
    let mut model = NlpModel::new();
    free_variables(&mut model, 1);
    assert!(model.eval_objective(&[0.0]).is_err());
    let mut g: [E; 0] = [];
    assert!(model.eval_constraints(&[0.0], &mut g).is_err());
}

/// The faer bridge assembles the COO layouts into sparse matrices, with the
/// Hessian mirrored to a full symmetric matrix.
#[test]
fn bridge_assembles_sparse_matrices() {
    let mut model = NlpModel::new();
    free_variables(&mut model, 2);

    let mut graph = ExpressionGraph::new();
    let x0 = graph.add_variable(0);
    let x1 = graph.add_variable(1);
    let product = graph.add_nary(NaryOperator::Mul, vec![x0, x1]);
    let instance = model.add_graph_instance();
    model.add_single_nl_constraint(instance, &mut graph, product, -INF, 2.0);
    model.finalize_graph_instance(instance, graph);

    model.analyze_structure().unwrap();

    let x = [3.0, 4.0];
    let g = model.constraint_values(&x).unwrap();
    assert_eq!(g.nrows(), 1);
    assert_eq!(g[0], 12.0);

    let jacobian = model.jacobian_matrix(&x).unwrap();
    assert_eq!((jacobian.nrows(), jacobian.ncols()), (1, 2));

    let hessian = model.lagrangian_hessian_matrix(&x, &[2.0], 1.0).unwrap();
    assert_eq!((hessian.nrows(), hessian.ncols()), (2, 2));
    // the single stored triangle entry mirrors across the diagonal
    assert_eq!(hessian.compute_nnz(), 2);
}
