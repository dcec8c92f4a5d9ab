use std::collections::HashSet;
use std::sync::Arc;

use arrow_schema::DataType;
use strata_common::{Result, StrataError};

use crate::logical_plan::{AggExpr, Expr, LogicalPlan};
use crate::table::TableProvider;

/// Builds a logical plan by attaching operators to an input plan.
///
/// Every attachment validates the new node against its input's schema, so a
/// plan returned by [`PlanBuilder::build`] always resolves.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    plan: LogicalPlan,
}

impl PlanBuilder {
    /// Start from a scan of `table`, resolving its schema through `provider`.
    pub fn scan(provider: Arc<dyn TableProvider>, table: &str) -> Result<Self> {
        let reader = provider.get_table(table).map_err(|e| match e {
            StrataError::Plan(_) => e,
            other => StrataError::Plan(format!("cannot resolve table '{table}': {other}")),
        })?;
        let source_schema = reader.schema();
        Ok(Self {
            plan: LogicalPlan::TableScan {
                table: table.to_string(),
                provider,
                source_schema,
                projection: None,
                filters: Vec::new(),
            },
        })
    }

    /// Continue from an existing plan.
    pub fn from_plan(plan: LogicalPlan) -> Self {
        Self { plan }
    }

    pub fn filter(self, predicate: Expr) -> Result<Self> {
        let schema = self.plan.schema()?;
        let dt = predicate.data_type(&schema)?;
        if dt != DataType::Boolean {
            return Err(StrataError::Plan(format!(
                "filter predicate '{predicate}' must be boolean, got {dt}"
            )));
        }
        Ok(Self {
            plan: LogicalPlan::Filter {
                predicate,
                input: Box::new(self.plan),
            },
        })
    }

    pub fn aggregate(
        self,
        aggr_exprs: Vec<(AggExpr, String)>,
        group_exprs: Vec<Expr>,
    ) -> Result<Self> {
        if aggr_exprs.is_empty() && group_exprs.is_empty() {
            return Err(StrataError::Plan(
                "aggregate requires at least one group key or aggregate expression".to_string(),
            ));
        }
        let schema = self.plan.schema()?;
        for g in &group_exprs {
            g.data_type(&schema)?;
        }
        for (agg, _) in &aggr_exprs {
            agg.data_type(&schema)?;
        }
        let names = group_exprs
            .iter()
            .map(Expr::output_name)
            .chain(aggr_exprs.iter().map(|(_, alias)| alias.clone()));
        ensure_unique("aggregate", names)?;
        Ok(Self {
            plan: LogicalPlan::Aggregate {
                group_exprs,
                aggr_exprs,
                input: Box::new(self.plan),
            },
        })
    }

    pub fn project(self, exprs: Vec<(Expr, String)>) -> Result<Self> {
        if exprs.is_empty() {
            return Err(StrataError::Plan(
                "projection requires at least one expression".to_string(),
            ));
        }
        let schema = self.plan.schema()?;
        for (e, _) in &exprs {
            e.data_type(&schema)?;
        }
        ensure_unique("projection", exprs.iter().map(|(_, alias)| alias.clone()))?;
        Ok(Self {
            plan: LogicalPlan::Projection {
                exprs,
                input: Box::new(self.plan),
            },
        })
    }

    /// Project plain columns, keeping their names.
    pub fn project_columns(self, columns: &[&str]) -> Result<Self> {
        let exprs = columns
            .iter()
            .map(|c| (Expr::Column((*c).to_string()), (*c).to_string()))
            .collect();
        self.project(exprs)
    }

    pub fn build(self) -> LogicalPlan {
        self.plan
    }
}

fn ensure_unique(node: &str, names: impl Iterator<Item = String>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name.clone()) {
            return Err(StrataError::Plan(format!(
                "{node} produces duplicate output column '{name}'"
            )));
        }
    }
    Ok(())
}
