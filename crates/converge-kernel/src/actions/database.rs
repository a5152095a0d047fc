use super::{ActionOutput, StageAction};
use crate::error::StageResult;
use async_trait::async_trait;
use converge_schema::Reconciler;
use std::sync::Arc;

/// Run the schema reconciler to convergence
pub struct ConvergeDatabase {
    reconciler: Arc<Reconciler>,
}

impl ConvergeDatabase {
    /// Action over a configured reconciler
    #[must_use]
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl StageAction for ConvergeDatabase {
    async fn run(&self) -> StageResult<ActionOutput> {
        let report = self.reconciler.run().await?;
        let mut output = ActionOutput::done();
        for warning in report.warnings() {
            output.warnings.push(format!(
                "ledger repaired without re-applying; schema may not match the ledger: {warning}"
            ));
        }
        Ok(output)
    }

    fn describe(&self) -> String {
        let plan = self.reconciler.plan();
        format!(
            "reconcile {} schemas, {} routing tables, {} ledgers ({:?} policy)",
            plan.schemas.len(),
            plan.routing_tables.len(),
            plan.ledgers.len(),
            plan.ledger_policy
        )
    }
}
