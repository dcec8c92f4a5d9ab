use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use strata_common::Result;
use tracing::debug;

use crate::logical_plan::{AggExpr, Expr, LiteralValue, LogicalPlan};

/// One rewrite over a logical plan.
///
/// Passes are stateless. A pass must preserve query results and must be
/// idempotent: running it on its own output changes nothing.
pub trait OptimizerPass: Send + Sync {
    /// Stable pass name used by the registry and in logs.
    fn name(&self) -> &str;

    /// Consume the plan and return the rewritten plan.
    fn optimize(&self, plan: LogicalPlan) -> Result<LogicalPlan>;
}

/// Ordered pass pipeline.
///
/// Built-in passes run first in their configured order, then custom passes
/// registered at runtime, ordered by name.
pub struct Optimizer {
    passes: Vec<Arc<dyn OptimizerPass>>,
    custom_passes: RwLock<HashMap<String, Arc<dyn OptimizerPass>>>,
}

impl std::fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.passes.iter().map(|p| p.name()).collect::<Vec<_>>();
        let custom = self
            .custom_passes
            .read()
            .map(|m| m.len())
            .unwrap_or_default();
        f.debug_struct("Optimizer")
            .field("passes", &names)
            .field("custom_passes", &custom)
            .finish()
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Projection pushdown followed by filter pushdown.
pub fn default_passes() -> Vec<Arc<dyn OptimizerPass>> {
    vec![Arc::new(ProjectionPushDown), Arc::new(FilterPushDown)]
}

impl Optimizer {
    /// Optimizer running [`default_passes`].
    pub fn new() -> Self {
        Self::with_passes(default_passes())
    }

    /// Optimizer running exactly `passes`, in order.
    pub fn with_passes(passes: Vec<Arc<dyn OptimizerPass>>) -> Self {
        Self {
            passes,
            custom_passes: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace a custom pass.
    ///
    /// Returns `true` when a pass with the same name was replaced.
    pub fn register_pass(&self, pass: Arc<dyn OptimizerPass>) -> bool {
        self.custom_passes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pass.name().to_string(), pass)
            .is_some()
    }

    /// Remove a custom pass by name.
    pub fn deregister_pass(&self, name: &str) -> bool {
        self.custom_passes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn optimize(&self, plan: LogicalPlan) -> Result<LogicalPlan> {
        let mut custom = self
            .custom_passes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect::<Vec<_>>();
        custom.sort_by(|a, b| a.0.cmp(&b.0));

        let mut plan = plan;
        for pass in self.passes.iter().chain(custom.iter().map(|(_, p)| p)) {
            plan = pass.optimize(plan)?;
            debug!(pass = pass.name(), nodes = plan.node_count(), "optimizer pass applied");
        }
        Ok(plan)
    }
}

// -----------------------------
// Projection pushdown
// -----------------------------

/// Narrows every scan to the columns the operators above it read.
///
/// Columns referenced only by a Filter stay in the scan projection even when
/// the final output drops them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectionPushDown;

impl OptimizerPass for ProjectionPushDown {
    fn name(&self) -> &str {
        "projection_pushdown"
    }

    fn optimize(&self, plan: LogicalPlan) -> Result<LogicalPlan> {
        proj_rewrite(plan, None)
    }
}

/// `required == None` means the consumer reads every column of its input.
fn proj_rewrite(plan: LogicalPlan, required: Option<HashSet<String>>) -> Result<LogicalPlan> {
    match plan {
        LogicalPlan::TableScan {
            table,
            provider,
            source_schema,
            projection,
            filters,
        } => {
            let projection = match required {
                None => projection,
                Some(mut req) => {
                    for f in &filters {
                        req.extend(f.columns());
                    }
                    let cols = source_schema
                        .fields()
                        .iter()
                        .map(|f| f.name())
                        .filter(|name| req.contains(*name))
                        .filter(|name| projection.as_ref().map_or(true, |p| p.contains(name)))
                        .cloned()
                        .collect::<Vec<_>>();
                    Some(cols)
                }
            };
            Ok(LogicalPlan::TableScan {
                table,
                provider,
                source_schema,
                projection,
                filters,
            })
        }
        LogicalPlan::Filter { predicate, input } => {
            let req = required.map(|mut r| {
                r.extend(predicate.columns());
                r
            });
            Ok(LogicalPlan::Filter {
                input: Box::new(proj_rewrite(*input, req)?),
                predicate,
            })
        }
        LogicalPlan::Aggregate {
            group_exprs,
            aggr_exprs,
            input,
        } => {
            let mut req = HashSet::new();
            for g in &group_exprs {
                req.extend(g.columns());
            }
            for (agg, _) in &aggr_exprs {
                req.extend(agg_columns(agg));
            }
            Ok(LogicalPlan::Aggregate {
                input: Box::new(proj_rewrite(*input, Some(req))?),
                group_exprs,
                aggr_exprs,
            })
        }
        LogicalPlan::Projection { exprs, input } => {
            let mut req = HashSet::new();
            for (e, _) in &exprs {
                req.extend(e.columns());
            }
            Ok(LogicalPlan::Projection {
                input: Box::new(proj_rewrite(*input, Some(req))?),
                exprs,
            })
        }
    }
}

// -----------------------------
// Filter pushdown
// -----------------------------

/// Sinks filters toward the scan and hands their conjuncts to the scan as
/// pruning hints.
///
/// The Filter node itself is never dropped: storage pruning is approximate,
/// so the predicate is re-checked row by row above the scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterPushDown;

impl OptimizerPass for FilterPushDown {
    fn name(&self) -> &str {
        "filter_pushdown"
    }

    fn optimize(&self, plan: LogicalPlan) -> Result<LogicalPlan> {
        predicate_pushdown(plan)
    }
}

fn predicate_pushdown(plan: LogicalPlan) -> Result<LogicalPlan> {
    match plan {
        LogicalPlan::Filter { predicate, input } => {
            let input = predicate_pushdown(*input)?;
            Ok(sink_filter(predicate, input))
        }
        other => other.map_input(&mut predicate_pushdown),
    }
}

/// Place `predicate` over `input`, as deep as it can legally go.
fn sink_filter(predicate: Expr, input: LogicalPlan) -> LogicalPlan {
    match input {
        scan @ LogicalPlan::TableScan { .. } => {
            let scan = hint_scan(&predicate, scan);
            LogicalPlan::Filter {
                predicate,
                input: Box::new(scan),
            }
        }
        LogicalPlan::Projection { exprs, input } if passes_through(&exprs, &predicate) => {
            LogicalPlan::Projection {
                exprs,
                input: Box::new(sink_filter(predicate, *input)),
            }
        }
        LogicalPlan::Aggregate {
            group_exprs,
            aggr_exprs,
            input,
        } => {
            let group_cols = group_exprs
                .iter()
                .filter_map(|g| match g {
                    Expr::Column(c) => Some(c.clone()),
                    _ => None,
                })
                .collect::<HashSet<_>>();
            let (below, above): (Vec<_>, Vec<_>) =
                split_conjuncts(predicate).into_iter().partition(|c| {
                    let cols = c.columns();
                    !cols.is_empty() && cols.is_subset(&group_cols)
                });
            let input = if below.is_empty() {
                *input
            } else {
                sink_filter(combine_conjuncts(below), *input)
            };
            let aggregate = LogicalPlan::Aggregate {
                group_exprs,
                aggr_exprs,
                input: Box::new(input),
            };
            if above.is_empty() {
                aggregate
            } else {
                LogicalPlan::Filter {
                    predicate: combine_conjuncts(above),
                    input: Box::new(aggregate),
                }
            }
        }
        // filters commute: both stay, the outer conjuncts also hint the scan
        LogicalPlan::Filter {
            predicate: inner,
            input,
        } => {
            let input = hint_scan(&predicate, *input);
            LogicalPlan::Filter {
                predicate,
                input: Box::new(LogicalPlan::Filter {
                    predicate: inner,
                    input: Box::new(input),
                }),
            }
        }
        other => LogicalPlan::Filter {
            predicate,
            input: Box::new(other),
        },
    }
}

/// Append the conjuncts of `predicate` to the scan's hints when only filters
/// separate `plan` from the scan.
fn hint_scan(predicate: &Expr, plan: LogicalPlan) -> LogicalPlan {
    match plan {
        LogicalPlan::TableScan {
            table,
            provider,
            source_schema,
            projection,
            mut filters,
        } => {
            for conjunct in split_conjuncts(predicate.clone()) {
                if !filters.contains(&conjunct) {
                    filters.push(conjunct);
                }
            }
            LogicalPlan::TableScan {
                table,
                provider,
                source_schema,
                projection,
                filters,
            }
        }
        LogicalPlan::Filter {
            predicate: inner,
            input,
        } => LogicalPlan::Filter {
            predicate: inner,
            input: Box::new(hint_scan(predicate, *input)),
        },
        other => other,
    }
}

fn split_conjuncts(e: Expr) -> Vec<Expr> {
    match e {
        Expr::And(a, b) => {
            let mut v = split_conjuncts(*a);
            v.extend(split_conjuncts(*b));
            v
        }
        other => vec![other],
    }
}

fn combine_conjuncts(v: Vec<Expr>) -> Expr {
    v.into_iter()
        .reduce(|acc, e| Expr::And(Box::new(acc), Box::new(e)))
        .unwrap_or(Expr::Literal(LiteralValue::Boolean(true)))
}

/// Whether every column `predicate` reads is forwarded unchanged by `exprs`.
fn passes_through(exprs: &[(Expr, String)], predicate: &Expr) -> bool {
    predicate.columns().iter().all(|c| {
        exprs
            .iter()
            .any(|(e, alias)| alias == c && matches!(e, Expr::Column(src) if src == c))
    })
}

fn agg_columns(agg: &AggExpr) -> HashSet<String> {
    agg.input().columns()
}
