/*!
Error kinds for the simulator core.

All invariant violations in the memory core are model bugs, not runtime
conditions, so they surface as errors returned upward (never retried):
- `ConfigurationInvalid` is fatal at construction.
- `CapacityExceeded` means `add_transaction` was called after `will_accept`
  returned false (caller contract violation).
- `IllegalCommandIssue` means the scheduler produced a command ahead of the
  bank's earliest-legal clock.
- `TraceParse` is the one recoverable kind: the host loop logs the malformed
  line and skips it; it never propagates into the memory core.
*/

use thiserror::Error;

use crate::command::CommandKind;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("transaction 0x{addr:x} added to channel {channel} past capacity")]
    CapacityExceeded { addr: u64, channel: usize },

    #[error(
        "illegal {kind:?} issue on channel {channel} at clk {clk} (earliest legal clk {earliest})"
    )]
    IllegalCommandIssue {
        kind: CommandKind,
        channel: usize,
        clk: u64,
        earliest: u64,
    },

    #[error("completion for 0x{addr:x} carries an unknown command kind")]
    UnknownCommandKind { addr: u64 },

    #[error("trace parse error at line {line}: {reason}")]
    TraceParse { line: usize, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("stats serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl SimError {
    /// Trace-parse errors are skippable by the host loop; everything else aborts.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SimError::TraceParse { .. })
    }
}
