//! Step runner: skip gate, retries, and the continue/abort decision.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::retry::{RetryPolicy, RetrySettings, with_retry_outcome};
use crate::step::{UpgradeContext, UpgradeStep, UpgradeStepResult};

/// What the orchestrator should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeAction {
    /// Move on to the next step.
    Continue,
    /// Stop the upgrade.
    Abort,
}

/// How one step run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRun {
    pub step_id: String,
    pub skipped: bool,
    pub attempts: u32,
    /// `None` when skipped.
    pub result: Option<UpgradeStepResult>,
    pub action: UpgradeAction,
}

/// Runs upgrade steps one at a time.
#[derive(Debug, Clone, Default)]
pub struct UpgradeRunner {
    retry: RetrySettings,
}

impl UpgradeRunner {
    pub fn new(retry: RetrySettings) -> Self {
        Self { retry }
    }

    /// Run one step.
    ///
    /// A skip gate error is treated like a failed execution. A step that
    /// still fails after `retry_count() + 1` attempts aborts the upgrade
    /// unless it is optional.
    pub async fn run_step<T: UpgradeStep>(&self, step: &T, ctx: &mut UpgradeContext) -> StepRun {
        let step_id = step.id().to_string();

        match step.skip(ctx).await {
            Ok(true) => {
                info!(step_id = %step_id, "step skipped");
                return StepRun {
                    step_id,
                    skipped: true,
                    attempts: 0,
                    result: None,
                    action: UpgradeAction::Continue,
                };
            }
            Ok(false) => {}
            Err(e) => {
                warn!(step_id = %step_id, error = %e, "skip check failed");
                let result = UpgradeStepResult::failed(step_id.clone(), e.to_string());
                return self.finish(step, ctx, result, 0);
            }
        }

        let policy = RetryPolicy::for_step(step.retry_count(), &self.retry);
        let shared: &UpgradeContext = ctx;
        let outcome = with_retry_outcome(&policy, || async move {
            let result = step.execute(shared).await;
            if result.is_success() { Ok(result) } else { Err(result) }
        })
        .await;

        let result = match outcome.result {
            Ok(result) | Err(result) => result,
        };
        self.finish(step, ctx, result, outcome.attempts)
    }

    fn finish<T: UpgradeStep>(
        &self,
        step: &T,
        ctx: &mut UpgradeContext,
        result: UpgradeStepResult,
        attempts: u32,
    ) -> StepRun {
        let action = if result.is_success() || step.is_optional() {
            UpgradeAction::Continue
        } else {
            UpgradeAction::Abort
        };
        if result.is_success() {
            info!(step_id = %result.step_id, attempts, "step succeeded");
        } else {
            warn!(
                step_id = %result.step_id,
                attempts,
                optional = step.is_optional(),
                action = ?action,
                "step failed"
            );
        }
        ctx.results.push(result.clone());
        StepRun {
            step_id: result.step_id.clone(),
            skipped: false,
            attempts,
            result: Some(result),
            action,
        }
    }
}
