use std::sync::Arc;

use strata_common::Result;
use strata_planner::{
    col, explain_logical, lit, AggExpr, Expr, FilterPushDown, IterOptions, LogicalPlan,
    Optimizer, OptimizerPass, PlanBuilder, ProjectionPushDown,
};

mod support;

fn plans() -> Vec<LogicalPlan> {
    vec![
        support::label_sum_plan(),
        support::samples()
            .project(vec![
                (col("label"), "label".to_string()),
                (col("value") * lit(2_i64), "doubled".to_string()),
            ])
            .and_then(|b| b.filter(col("label").not_eq(lit("x"))))
            .expect("project then filter")
            .build(),
        support::samples()
            .aggregate(
                vec![
                    (AggExpr::Sum(col("value")), "total".to_string()),
                    (AggExpr::Count(col("timestamp")), "n".to_string()),
                ],
                vec![col("stacktrace")],
            )
            .and_then(|b| {
                b.filter(
                    col("stacktrace")
                        .eq(lit("A"))
                        .and(col("total").gt(lit(10_i64))),
                )
            })
            .expect("filter over aggregate")
            .build(),
        support::samples()
            .filter(col("duration").gt(lit(1.5)))
            .and_then(|b| b.filter(col("value").lt(lit(100_i64))))
            .expect("stacked filters")
            .build(),
    ]
}

fn run(pass: &dyn OptimizerPass, plan: LogicalPlan) -> LogicalPlan {
    pass.optimize(plan).expect("optimize")
}

#[test]
fn every_pass_is_idempotent() {
    let passes: Vec<Box<dyn OptimizerPass>> =
        vec![Box::new(ProjectionPushDown), Box::new(FilterPushDown)];
    for pass in &passes {
        for plan in plans() {
            let once = run(pass.as_ref(), plan);
            let once_text = explain_logical(&once);
            let twice = run(pass.as_ref(), once);
            assert_eq!(
                once_text,
                explain_logical(&twice),
                "pass {} is not idempotent",
                pass.name()
            );
        }
    }
}

#[test]
fn full_pipeline_is_idempotent_and_order_independent() {
    let optimizer = Optimizer::new();
    let reversed =
        Optimizer::with_passes(vec![Arc::new(FilterPushDown), Arc::new(ProjectionPushDown)]);
    for plan in plans() {
        let once = optimizer.optimize(plan.clone()).expect("optimize");
        let twice = optimizer.optimize(once.clone()).expect("optimize again");
        assert_eq!(explain_logical(&once), explain_logical(&twice));

        let other_order = reversed.optimize(plan).expect("reversed order");
        assert_eq!(explain_logical(&once), explain_logical(&other_order));
    }
}

#[test]
fn optimized_plans_keep_their_output_schema() {
    let optimizer = Optimizer::new();
    for plan in plans() {
        let before = plan.schema().expect("schema before");
        let after = optimizer.optimize(plan).expect("optimize");
        assert_eq!(before, after.schema().expect("schema after"));
    }
}

#[test]
fn projection_pushdown_keeps_filter_only_columns() {
    let plan = run(&ProjectionPushDown, support::label_sum_plan());
    // `label` is dropped by the final projection but the filter still reads it.
    assert_eq!(
        support::scan_projection(&plan),
        Some(vec![
            "label".to_string(),
            "stacktrace".to_string(),
            "value".to_string()
        ])
    );
    assert_eq!(
        support::shape(&plan),
        vec!["Projection", "Aggregate", "Filter", "TableScan"]
    );
}

#[test]
fn projection_pushdown_without_narrowing_consumer_reads_everything() {
    let plan = support::samples()
        .filter(col("value").gt(lit(0_i64)))
        .expect("filter")
        .build();
    let plan = run(&ProjectionPushDown, plan);
    assert_eq!(support::scan_projection(&plan), None);
}

#[test]
fn filter_pushdown_hints_scan_and_keeps_filter() {
    let plan = run(&FilterPushDown, support::label_sum_plan());
    assert_eq!(
        support::shape(&plan),
        vec!["Projection", "Aggregate", "Filter", "TableScan"]
    );
    assert_eq!(support::scan_filters(&plan), vec![col("label").eq(lit("abc"))]);

    // stacked filters both stay and both hint the scan
    let stacked = run(&FilterPushDown, plans().remove(3));
    assert_eq!(
        support::shape(&stacked),
        vec!["Filter", "Filter", "TableScan"]
    );
    assert_eq!(
        support::scan_filters(&stacked),
        vec![col("duration").gt(lit(1.5)), col("value").lt(lit(100_i64))]
    );
    let again = run(&FilterPushDown, stacked.clone());
    assert_eq!(support::scan_filters(&again), support::scan_filters(&stacked));
}

#[test]
fn filter_pushdown_splits_conjuncts_at_aggregate() {
    let plan = run(&FilterPushDown, plans().remove(2));
    assert_eq!(
        support::shape(&plan),
        vec!["Filter", "Aggregate", "Filter", "TableScan"]
    );
    match &plan {
        LogicalPlan::Filter { predicate, .. } => {
            assert_eq!(predicate, &col("total").gt(lit(10_i64)));
        }
        other => panic!("expected filter on aggregate output, got {}", other.name()),
    }
    assert_eq!(support::scan_filters(&plan), vec![col("stacktrace").eq(lit("A"))]);
}

#[test]
fn filter_moves_below_passthrough_projection_only() {
    let passthrough = support::samples()
        .project_columns(&["label", "value"])
        .and_then(|b| b.filter(col("value").gt(lit(3_i64))))
        .expect("plan")
        .build();
    let plan = run(&FilterPushDown, passthrough);
    assert_eq!(support::shape(&plan), vec!["Projection", "Filter", "TableScan"]);
    assert_eq!(support::scan_filters(&plan).len(), 1);

    // `doubled` is computed by the projection, so the filter must stay above it.
    let computed = support::samples()
        .project(vec![(col("value") * lit(2_i64), "doubled".to_string())])
        .and_then(|b| b.filter(col("doubled").gt(lit(3_i64))))
        .expect("plan")
        .build();
    let plan = run(&FilterPushDown, computed);
    assert_eq!(support::shape(&plan), vec!["Filter", "Projection", "TableScan"]);
    assert!(support::scan_filters(&plan).is_empty());
}

#[test]
fn conjunct_hints_are_deduplicated() {
    let plan = support::samples()
        .filter(col("label").eq(lit("abc")).and(col("label").eq(lit("abc"))))
        .expect("plan")
        .build();
    let plan = run(&FilterPushDown, plan);
    assert_eq!(support::scan_filters(&plan), vec![col("label").eq(lit("abc"))]);
}

struct TagScans;

impl OptimizerPass for TagScans {
    fn name(&self) -> &str {
        "tag_scans"
    }

    fn optimize(&self, plan: LogicalPlan) -> Result<LogicalPlan> {
        plan.transform_up(&mut |node| {
            Ok(match node {
                LogicalPlan::TableScan {
                    table,
                    provider,
                    source_schema,
                    projection,
                    mut filters,
                } => {
                    let tag = Expr::Literal(true.into());
                    if !filters.contains(&tag) {
                        filters.push(tag);
                    }
                    LogicalPlan::TableScan {
                        table,
                        provider,
                        source_schema,
                        projection,
                        filters,
                    }
                }
                other => other,
            })
        })
    }
}

#[test]
fn custom_passes_run_after_builtin_passes() {
    let optimizer = Optimizer::new();
    assert!(!optimizer.register_pass(Arc::new(TagScans)));
    let plan = optimizer.optimize(support::label_sum_plan()).expect("optimize");
    assert_eq!(
        support::scan_filters(&plan),
        vec![col("label").eq(lit("abc")), Expr::Literal(true.into())]
    );
    assert!(optimizer.deregister_pass("tag_scans"));
    assert!(!optimizer.deregister_pass("tag_scans"));
}

#[test]
fn builder_can_continue_from_optimized_plan() {
    let plan = Optimizer::new()
        .optimize(support::label_sum_plan())
        .expect("optimize");
    let plan = PlanBuilder::from_plan(plan)
        .filter(col("value_sum").gt_eq(lit(5_i64)))
        .expect("filter on output")
        .build();
    assert_eq!(plan.node_count(), 5);
}

#[test]
fn scan_hints_survive_serialization() {
    let plan = Optimizer::new()
        .optimize(support::label_sum_plan())
        .expect("optimize");
    let options = IterOptions {
        projection: support::scan_projection(&plan),
        filters: support::scan_filters(&plan),
    };
    let encoded = serde_json::to_string(&options).expect("encode");
    let decoded: IterOptions = serde_json::from_str(&encoded).expect("decode");
    assert_eq!(decoded, options);
    assert_eq!(decoded.filters, vec![col("label").eq(lit("abc"))]);
}
