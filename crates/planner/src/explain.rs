use crate::logical_plan::LogicalPlan;

/// Render logical plan as human-readable multiline text.
pub fn explain_logical(plan: &LogicalPlan) -> String {
    let mut s = String::new();
    fmt_plan(plan, 0, &mut s);
    s
}

fn fmt_plan(plan: &LogicalPlan, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    match plan {
        LogicalPlan::TableScan {
            table,
            projection,
            filters,
            ..
        } => {
            out.push_str(&format!("{pad}TableScan table={table}\n"));
            match projection {
                Some(cols) => out.push_str(&format!("{pad}  projection=[{}]\n", cols.join(", "))),
                None => out.push_str(&format!("{pad}  projection=*\n")),
            }
            out.push_str(&format!("{pad}  pushed_filters={}\n", filters.len()));
            for f in filters {
                out.push_str(&format!("{pad}    {f}\n"));
            }
        }
        LogicalPlan::Filter { predicate, input } => {
            out.push_str(&format!("{pad}Filter {predicate}\n"));
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Projection { exprs, input } => {
            out.push_str(&format!("{pad}Projection\n"));
            for (e, name) in exprs {
                out.push_str(&format!("{pad}  {name} := {e}\n"));
            }
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Aggregate {
            group_exprs,
            aggr_exprs,
            input,
        } => {
            out.push_str(&format!("{pad}Aggregate\n"));
            out.push_str(&format!("{pad}  group_by={}\n", group_exprs.len()));
            for g in group_exprs {
                out.push_str(&format!("{pad}    {g}\n"));
            }
            out.push_str(&format!("{pad}  aggs={}\n", aggr_exprs.len()));
            for (a, name) in aggr_exprs {
                out.push_str(&format!("{pad}    {name} := {a}\n"));
            }
            fmt_plan(input, indent + 1, out);
        }
    }
}
