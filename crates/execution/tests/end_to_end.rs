use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema};
use strata_common::{MemoryBudget, StrataError};
use strata_execution::{build, PhysicalPlannerConfig};
use strata_planner::{col, lit, AggExpr, Expr, Optimizer, PlanBuilder, TableProvider};
use tracing::Span;

mod support;

fn scenario_provider(partitions: usize) -> Arc<dyn TableProvider> {
    let first = support::samples_batch(&[("abc", "A", 3), ("x", "A", 100)]);
    let second = support::samples_batch(&[("abc", "A", 2)]);
    let parts = if partitions == 1 {
        vec![vec![first, second]]
    } else {
        vec![vec![first], vec![second]]
    };
    support::mem_provider(parts)
}

#[test]
fn filtered_group_sum_end_to_end() {
    support::init_tracing();
    for partitions in [1, 2] {
        for concurrency in [1, 2, 4] {
            let plan = support::label_sum_plan(scenario_provider(partitions));
            let physical = support::compile(&plan, concurrency);
            let out = physical.collect(&support::ctx(1)).expect("execute");
            assert_eq!(out.len(), 1, "exactly one output batch");
            assert_eq!(support::strings(&out[0], "stacktrace"), vec![Some("A".to_string())]);
            assert_eq!(support::ints(&out[0], "value_sum"), vec![Some(5)]);
            assert!(physical.is_finished());
        }
    }
}

#[test]
fn optimized_plan_gives_same_result_and_pushes_hints() {
    let plan = support::label_sum_plan(scenario_provider(2));
    let optimized = Optimizer::new().optimize(plan.clone()).expect("optimize");
    let physical = support::compile(&optimized, 2);

    let options = physical.iter_options();
    assert_eq!(
        options.projection,
        Some(vec![
            "label".to_string(),
            "stacktrace".to_string(),
            "value".to_string()
        ])
    );
    assert_eq!(options.filters, vec![col("label").eq(lit("abc"))]);
    assert_eq!(physical.scan_schema().fields().len(), 3);
    // the hint never replaces the row-level filter
    assert!(physical.pipeline().contains(&"Filter"));

    let optimized_out = physical.collect(&support::ctx(2)).expect("optimized");
    let plain_out = support::compile(&plan, 2)
        .collect(&support::ctx(3))
        .expect("plain");
    assert_eq!(optimized_out, plain_out);
}

#[test]
fn data_flows_leaf_to_root() {
    let plan = support::label_sum_plan(scenario_provider(1));
    let physical = support::compile(&plan, 2);
    assert_eq!(
        physical.pipeline(),
        &["TableScan", "Filter", "HashAggregate", "Project"]
    );

    let diagram = physical.draw();
    let steps = diagram.steps();
    assert!(steps[0].starts_with("TableScan#0 [table=samples"));
    assert!(steps[1].starts_with("Filter#1[p0] [label = 'abc']"));
    assert_eq!(steps[2], "Synchronizer#2 [partitions=2]");
    assert!(steps[3].starts_with("HashAggregate#3"));
    assert_eq!(steps[4], "Project#4 [stacktrace, value_sum]");
    assert_eq!(steps[5], "Output#5");
    assert!(diagram.to_string().contains(" -> Synchronizer#2"));
}

#[test]
fn operator_count_matches_logical_node_count() {
    let provider = scenario_provider(1);
    let scan = || PlanBuilder::scan(Arc::clone(&provider), "samples").expect("scan");
    let plans = vec![
        scan().build(),
        support::label_sum_plan(Arc::clone(&provider)),
        scan()
            .filter(col("value").gt(lit(1_i64)))
            .and_then(|b| b.filter(col("label").not_eq(lit("zzz"))))
            .and_then(|b| b.project(vec![(col("value") * lit(2_i64), "doubled".to_string())]))
            .expect("two filters")
            .build(),
        scan()
            .aggregate(vec![(AggExpr::Count(col("timestamp")), "n".to_string())], vec![])
            .and_then(|b| b.filter(col("n").gt(lit(0_i64))))
            .expect("filter over aggregate")
            .build(),
    ];
    for plan in &plans {
        for concurrency in [1, 3] {
            let physical = support::compile(plan, concurrency);
            assert_eq!(physical.operator_count(), plan.node_count());
            assert_eq!(physical.partitions().len(), concurrency);
        }
    }
}

#[test]
fn streaming_plans_forward_every_batch() {
    let provider = support::mem_provider(vec![
        vec![
            support::samples_batch(&[("abc", "A", 1), ("x", "B", 2)]),
            support::samples_batch(&[("x", "C", 3)]),
        ],
        vec![support::samples_batch(&[("abc", "D", 4)])],
    ]);
    let plan = PlanBuilder::scan(provider, "samples")
        .and_then(|b| b.filter(col("label").eq(lit("abc"))))
        .and_then(|b| {
            b.project(vec![
                (col("stacktrace"), "stacktrace".to_string()),
                (
                    Expr::call(strata_planner::ScalarFunction::Lower, vec![col("stacktrace")]),
                    "lowered".to_string(),
                ),
                (col("value") + lit(10_i64), "bumped".to_string()),
            ])
        })
        .expect("plan")
        .build();
    let physical = support::compile(&plan, 2);
    let out = physical.collect(&support::ctx(4)).expect("execute");
    // empty filter results are forwarded, not suppressed
    assert_eq!(out.len(), 3);
    let mut rows = out
        .iter()
        .flat_map(|b| {
            support::strings(b, "lowered")
                .into_iter()
                .zip(support::ints(b, "bumped"))
        })
        .collect::<Vec<_>>();
    rows.sort();
    assert_eq!(
        rows,
        vec![
            (Some("a".to_string()), Some(11)),
            (Some("d".to_string()), Some(14))
        ]
    );
}

#[test]
fn global_aggregate_over_empty_input_emits_one_row() {
    let provider = support::mem_provider(vec![vec![support::samples_batch(&[("x", "A", 1)])]]);
    let plan = PlanBuilder::scan(provider, "samples")
        .and_then(|b| b.filter(col("label").eq(lit("nothing"))))
        .and_then(|b| {
            b.aggregate(
                vec![
                    (AggExpr::Count(col("value")), "n".to_string()),
                    (AggExpr::Sum(col("value")), "total".to_string()),
                ],
                vec![],
            )
        })
        .expect("plan")
        .build();
    let out = support::compile(&plan, 3)
        .collect(&support::ctx(5))
        .expect("execute");
    assert_eq!(out.len(), 1);
    assert_eq!(support::ints(&out[0], "n"), vec![Some(0)]);
    assert_eq!(support::ints(&out[0], "total"), vec![None]);
}

#[test]
fn execution_errors_name_the_failing_operator() {
    let provider = support::mem_provider(vec![
        vec![support::samples_batch(&[("abc", "A", i64::MAX)])],
        vec![support::samples_batch(&[("abc", "A", i64::MAX)])],
    ]);
    let plan = support::label_sum_plan(provider);
    let physical = support::compile(&plan, 1);
    let err = physical.collect(&support::ctx(6)).expect_err("overflow");
    assert_eq!(err.stage(), "execution");
    match &err {
        StrataError::Execution { node, message } => {
            assert_eq!(node, "HashAggregate#3");
            assert!(message.contains("integer overflow"), "{message}");
        }
        other => panic!("expected execution error, got {other:?}"),
    }
    assert!(!physical.is_finished());
}

#[test]
fn plans_execute_once() {
    let plan = support::label_sum_plan(scenario_provider(1));
    let physical = support::compile(&plan, 1);
    physical.collect(&support::ctx(7)).expect("first run");
    let err = physical.collect(&support::ctx(8)).expect_err("second run");
    assert!(err.to_string().contains("already executed"));
}

#[test]
fn schema_resolution_failures_are_compile_errors() {
    let plan = support::label_sum_plan(scenario_provider(1));
    let narrow = Arc::new(Schema::new(vec![
        Field::new("stacktrace", DataType::Utf8, true),
        Field::new("value", DataType::Int64, true),
    ]));
    let err = build(
        &plan,
        narrow,
        MemoryBudget::unbounded(),
        &Span::none(),
        &PhysicalPlannerConfig::default(),
    )
    .expect_err("label is missing");
    assert!(matches!(err, StrataError::Compile(_)));
    assert_eq!(err.stage(), "compilation");

    let optimized = Optimizer::new().optimize(plan).expect("optimize");
    let err = build(
        &optimized,
        Arc::new(Schema::new(vec![Field::new("value", DataType::Int64, true)])),
        MemoryBudget::unbounded(),
        &Span::none(),
        &PhysicalPlannerConfig::default(),
    )
    .expect_err("projection references missing column");
    assert!(err.to_string().contains("not in the table schema"));
}

#[test]
fn zero_concurrency_is_rejected() {
    let plan = support::label_sum_plan(scenario_provider(1));
    let err = build(
        &plan,
        support::samples_schema(),
        MemoryBudget::unbounded(),
        &Span::none(),
        &PhysicalPlannerConfig {
            concurrency: 0,
            ..PhysicalPlannerConfig::default()
        },
    )
    .expect_err("invalid");
    assert!(matches!(err, StrataError::InvalidConfig(_)));
}

#[test]
fn successors_cannot_be_rewired() {
    let plan = support::label_sum_plan(scenario_provider(1));
    let physical = support::compile(&plan, 2);
    let head = Arc::clone(physical.partitions()[0].head());
    let other = Arc::clone(physical.partitions()[1].head());
    let err = head.set_next(other).expect_err("already wired");
    assert!(err.to_string().contains("successor already set"));
    // the original wiring still runs
    let out = physical.collect(&support::ctx(9)).expect("execute");
    assert_eq!(support::ints(&out[0], "value_sum"), vec![Some(5)]);
}
