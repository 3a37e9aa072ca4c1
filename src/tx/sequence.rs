//! Ordered multi-step submission
//!
//! Each step is checked, built, submitted and confirmed before the next one
//! starts. A step whose precondition does not hold is skipped without
//! touching the nonce; the first failure aborts everything after it.

use super::confirm::SubmissionResult;
use super::sender::{TransactionSender, TxCall};
use crate::chain::ChainClient;
use crate::contracts::{permit2_allowance, token_allowance};
use crate::error::{OpsError, OpsResult};

use async_trait::async_trait;
use ethers::types::{Address, U256};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

/// One unit of a sequence
#[async_trait]
pub trait Step: Send + Sync {
    fn label(&self) -> &str;

    /// Read-only check against current chain state
    async fn is_needed(&self, client: &dyn ChainClient) -> OpsResult<bool>;

    /// Call data and gas limit
    fn build(&self) -> OpsResult<TxCall>;
}

/// Stock preconditions
#[derive(Debug, Clone)]
pub enum Precondition {
    Always,
    /// ERC-20 allowance of `spender` is below `amount`
    AllowanceBelow {
        token: Address,
        owner: Address,
        spender: Address,
        amount: U256,
    },
    /// Permit2 allowance is below `amount` or expires at or before `now`
    Permit2AllowanceBelow {
        permit2: Address,
        token: Address,
        owner: Address,
        spender: Address,
        amount: U256,
        now: u64,
    },
}

impl Precondition {
    pub async fn holds(&self, client: &dyn ChainClient) -> OpsResult<bool> {
        match self {
            Precondition::Always => Ok(true),
            Precondition::AllowanceBelow {
                token,
                owner,
                spender,
                amount,
            } => {
                let allowance = token_allowance(client, *token, *owner, *spender).await?;
                Ok(allowance < *amount)
            }
            Precondition::Permit2AllowanceBelow {
                permit2,
                token,
                owner,
                spender,
                amount,
                now,
            } => {
                let allowance = permit2_allowance(client, *permit2, *owner, *token, *spender).await?;
                Ok(allowance.amount < *amount || allowance.expiration <= *now)
            }
        }
    }
}

/// A prebuilt call guarded by a [`Precondition`]
#[derive(Debug, Clone)]
pub struct ConditionalStep {
    label: String,
    precondition: Precondition,
    call: TxCall,
}

impl ConditionalStep {
    pub fn new(label: impl Into<String>, precondition: Precondition, call: TxCall) -> Self {
        Self {
            label: label.into(),
            precondition,
            call,
        }
    }

    pub fn always(label: impl Into<String>, call: TxCall) -> Self {
        Self::new(label, Precondition::Always, call)
    }
}

#[async_trait]
impl Step for ConditionalStep {
    fn label(&self) -> &str {
        &self.label
    }

    async fn is_needed(&self, client: &dyn ChainClient) -> OpsResult<bool> {
        self.precondition.holds(client).await
    }

    fn build(&self) -> OpsResult<TxCall> {
        Ok(self.call.clone())
    }
}

/// What happened to a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Submitted {
        label: String,
        result: SubmissionResult,
    },
    Skipped {
        label: String,
    },
}

impl StepOutcome {
    pub fn label(&self) -> &str {
        match self {
            StepOutcome::Submitted { label, .. } | StepOutcome::Skipped { label } => label,
        }
    }

    pub fn result(&self) -> Option<&SubmissionResult> {
        match self {
            StepOutcome::Submitted { result, .. } => Some(result),
            StepOutcome::Skipped { .. } => None,
        }
    }
}

/// A sequence aborted at `failed_step`; `completed` already landed and
/// cannot be rolled back
#[derive(Error, Debug)]
#[error("step {failed_step:?} failed after {} completed step(s): {source}", .completed.len())]
pub struct SequenceError {
    pub failed_step: String,
    pub completed: Vec<StepOutcome>,
    #[source]
    pub source: OpsError,
}

/// Run `steps` strictly in order from `sender`'s account
pub async fn run_sequence(
    sender: &TransactionSender,
    steps: &[Box<dyn Step>],
) -> Result<Vec<StepOutcome>, SequenceError> {
    let mut completed = Vec::with_capacity(steps.len());

    for (index, step) in steps.iter().enumerate() {
        let label = step.label().to_string();

        let outcome = run_step(sender, step.as_ref()).await;
        match outcome {
            Ok(outcome) => {
                if let StepOutcome::Skipped { .. } = outcome {
                    info!("Step {}/{} {} not needed, skipping", index + 1, steps.len(), label);
                }
                completed.push(outcome);
            }
            Err(source) => {
                error!(
                    "Step {}/{} {} failed, aborting {} remaining step(s): {}",
                    index + 1,
                    steps.len(),
                    label,
                    steps.len() - index - 1,
                    source
                );
                return Err(SequenceError {
                    failed_step: label,
                    completed,
                    source,
                });
            }
        }
    }

    Ok(completed)
}

async fn run_step(sender: &TransactionSender, step: &dyn Step) -> OpsResult<StepOutcome> {
    let label = step.label().to_string();

    if !step.is_needed(sender.client()).await? {
        return Ok(StepOutcome::Skipped { label });
    }

    let call = step.build()?;
    let result = sender.submit_and_wait(&label, &call).await?;
    Ok(StepOutcome::Submitted { label, result })
}
