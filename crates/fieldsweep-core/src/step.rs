//! Upgrade steps as seen by an orchestrator.
//!
//! An orchestrator runs a sequence of [`UpgradeStep`]s: it asks each one
//! whether it can be skipped, executes it with retries, and consults
//! [`UpgradeStep::is_optional`] when it finally fails. [`FieldSweepStep`]
//! exposes a [`SweepController`] through that interface.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::aspect::DEFAULT_RUN_ID;
use crate::error::Result;
use crate::search::SearchService;
use crate::store::EntityStore;
use crate::sweep::{SweepController, SweepReport};

/// Terminal status of one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("SUCCEEDED"),
            Self::Failed => f.write_str("FAILED"),
        }
    }
}

/// Result of one step execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<SweepReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpgradeStepResult {
    pub fn succeeded(step_id: impl Into<String>, report: Option<SweepReport>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Succeeded,
            report,
            error: None,
        }
    }

    pub fn failed(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            report: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

impl fmt::Display for UpgradeStepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.step_id, self.status)?;
        if let Some(error) = &self.error {
            write!(f, ": {error}")?;
        }
        Ok(())
    }
}

/// State shared across the steps of one upgrade run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeContext {
    pub run_id: String,
    /// Final result of every step run so far, in order.
    pub results: Vec<UpgradeStepResult>,
}

impl UpgradeContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            results: Vec::new(),
        }
    }

    pub fn result(&self, step_id: &str) -> Option<&UpgradeStepResult> {
        self.results.iter().rev().find(|r| r.step_id == step_id)
    }

    /// Context for runs started without a run id.
    pub fn anonymous() -> Self {
        Self::new(DEFAULT_RUN_ID)
    }
}

/// One unit of an upgrade.
#[allow(async_fn_in_trait)]
pub trait UpgradeStep: Send + Sync {
    /// Stable identifier.
    fn id(&self) -> &str;

    /// A finally-failed optional step does not abort the upgrade.
    fn is_optional(&self) -> bool {
        false
    }

    /// Extra attempts after the first failure.
    fn retry_count(&self) -> u32 {
        0
    }

    /// Pre-execution gate. `Ok(true)` means there is nothing to do.
    async fn skip(&self, _ctx: &UpgradeContext) -> Result<bool> {
        Ok(false)
    }

    async fn execute(&self, ctx: &UpgradeContext) -> UpgradeStepResult;
}

/// A sweep exposed as an optional upgrade step.
#[derive(Debug)]
pub struct FieldSweepStep<S, E> {
    controller: SweepController<S, E>,
    retry_count: u32,
}

impl<S: SearchService, E: EntityStore> FieldSweepStep<S, E> {
    pub fn new(controller: SweepController<S, E>) -> Self {
        Self {
            controller,
            retry_count: 0,
        }
    }

    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn controller(&self) -> &SweepController<S, E> {
        &self.controller
    }
}

impl<S: SearchService, E: EntityStore> UpgradeStep for FieldSweepStep<S, E> {
    fn id(&self) -> &str {
        self.controller.definition().id
    }

    fn is_optional(&self) -> bool {
        true
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    async fn skip(&self, _ctx: &UpgradeContext) -> Result<bool> {
        Ok(self.controller.should_skip().await?)
    }

    async fn execute(&self, _ctx: &UpgradeContext) -> UpgradeStepResult {
        match self.controller.execute().await {
            Ok(report) => UpgradeStepResult::succeeded(self.id(), Some(report)),
            Err(e) => {
                error!(
                    sweep_id = self.id(),
                    error = %e,
                    error_class = ?e.class(),
                    "sweep aborted"
                );
                UpgradeStepResult::failed(self.id(), e.to_string())
            }
        }
    }
}
