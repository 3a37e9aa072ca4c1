//! Transaction submission: fee policy, nonce guard, bounded confirmation and
//! ordered multi-step sequences

pub mod confirm;
pub mod gas;
pub mod nonce;
pub mod poll;
pub mod sender;
pub mod sequence;

pub use confirm::SubmissionResult;
pub use gas::{resolve_fees, Eip1559Fees, FeeQuote, GasPolicy};
pub use nonce::{NonceAllocator, PendingQueueGuard};
pub use sender::{TransactionSender, TxCall, TxOptions};
pub use sequence::{run_sequence, ConditionalStep, Precondition, SequenceError, Step, StepOutcome};
