use strata_common::Result;

use crate::logical_plan::LogicalPlan;

/// Read-only walk over a logical plan.
///
/// Returning `Ok(false)` from either hook stops the walk; errors abort it.
pub trait PlanVisitor {
    /// Called on a node before its input.
    fn pre_visit(&mut self, plan: &LogicalPlan) -> Result<bool>;

    /// Called on a node after its input.
    fn post_visit(&mut self, _plan: &LogicalPlan) -> Result<bool> {
        Ok(true)
    }
}

impl LogicalPlan {
    /// Walk root-to-leaf with `pre_visit`, then leaf-to-root with `post_visit`.
    /// Returns `false` if the visitor stopped early.
    pub fn accept<V: PlanVisitor + ?Sized>(&self, visitor: &mut V) -> Result<bool> {
        if !visitor.pre_visit(self)? {
            return Ok(false);
        }
        if let Some(input) = self.input() {
            if !input.accept(visitor)? {
                return Ok(false);
            }
        }
        visitor.post_visit(self)
    }
}
