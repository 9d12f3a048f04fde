/*!
Core value types moved through the memory hierarchy.

- `CommandKind`/`Command`: a decoded DRAM command bound to a bank address.
- `Transaction`: a host-visible memory request, created by the host loop and
  destroyed when its completion callback fires.
- `PimValues`: PIM metadata carried on every transaction (zeroed for plain
  DRAM traffic). See the field comments for the gating semantics.

Commands and transactions are plain move-only values; queues own them and
hand them onward instead of cloning pipelines of deep copies.
*/

use crate::address::Address;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Read,
    ReadPrecharge,
    Write,
    WritePrecharge,
    Activate,
    Precharge,
    RefreshBank,
    Refresh,
    SrefEnter,
    SrefExit,
}

impl CommandKind {
    /// Number of kinds; sizes the per-bank earliest-legal-clock arrays.
    pub const COUNT: usize = 10;

    #[inline]
    pub fn index(self) -> usize {
        match self {
            CommandKind::Read => 0,
            CommandKind::ReadPrecharge => 1,
            CommandKind::Write => 2,
            CommandKind::WritePrecharge => 3,
            CommandKind::Activate => 4,
            CommandKind::Precharge => 5,
            CommandKind::RefreshBank => 6,
            CommandKind::Refresh => 7,
            CommandKind::SrefEnter => 8,
            CommandKind::SrefExit => 9,
        }
    }

    #[inline]
    pub fn is_read(self) -> bool {
        matches!(self, CommandKind::Read | CommandKind::ReadPrecharge)
    }

    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, CommandKind::Write | CommandKind::WritePrecharge)
    }

    #[inline]
    pub fn is_read_write(self) -> bool {
        self.is_read() || self.is_write()
    }

    #[inline]
    pub fn is_refresh(self) -> bool {
        matches!(self, CommandKind::Refresh | CommandKind::RefreshBank)
    }

    /// Rank-scope commands update every bank in the rank.
    #[inline]
    pub fn is_rank_command(self) -> bool {
        matches!(
            self,
            CommandKind::Refresh | CommandKind::SrefEnter | CommandKind::SrefExit
        )
    }
}

#[derive(Copy, Clone, Debug)]
pub struct Command {
    pub kind: CommandKind,
    pub addr: Address,
    pub hex_addr: u64,
}

impl Command {
    pub fn new(kind: CommandKind, addr: Address, hex_addr: u64) -> Self {
        Self {
            kind,
            addr,
            hex_addr,
        }
    }

    /// Rebind the same target address to a different kind (ACT/PRE on the way
    /// to a READ, and so on).
    pub fn with_kind(&self, kind: CommandKind) -> Self {
        Self { kind, ..*self }
    }
}

/// PIM metadata attached to a transaction.
#[derive(Copy, Clone, Debug, Default)]
pub struct PimValues {
    /// Earliest-issue offset modeling inter-instruction skew within a batch.
    pub skewed_cycle: u64,
    /// Earliest-issue offset modeling pipelined instruction decode.
    pub decode_cycle: u64,
    /// Designated final q-vector of its (bank-group, batch) bucket; its
    /// completion emits the aggregated transfer upward.
    pub vector_transfer: bool,
    /// Reference vector: bypasses DRAM and completes after a fixed
    /// sub-vector latency.
    pub is_r_vec: bool,
    /// Set by the host for hot-replicated entries.
    pub is_locality_bit: bool,
    /// Which of the concurrent reductions this transaction belongs to.
    pub batch_tag: usize,
    /// Number of 64-byte sub-vectors composing the logical vector
    /// (1, 2, 4 or 8 under CA-compression). Zero means "not a PIM access".
    pub num_rds: u32,
    /// Highest-indexed sub-vector of its logical vector; gates the
    /// accumulation-complete decision.
    pub is_last_subvec: bool,
    /// Address of the logical vector all sub-vectors roll up into.
    pub start_addr: u64,
}

impl PimValues {
    /// True when the transaction participates in the PIM datapath at all.
    #[inline]
    pub fn is_pim(&self) -> bool {
        self.num_rds > 0
    }
}

#[derive(Clone, Debug)]
pub struct Transaction {
    pub hex_addr: u64,
    pub added_cycle: u64,
    /// `UNSET` until the data burst (or PIM chain) stamps it.
    pub complete_cycle: u64,
    pub is_write: bool,
    pub pim: PimValues,
}

impl Transaction {
    /// Sentinel for "completion clock not decided yet".
    pub const UNSET: u64 = u64::MAX;

    pub fn new(hex_addr: u64, is_write: bool) -> Self {
        Self {
            hex_addr,
            added_cycle: 0,
            complete_cycle: Self::UNSET,
            is_write,
            pim: PimValues::default(),
        }
    }

    pub fn with_pim(hex_addr: u64, is_write: bool, pim: PimValues) -> Self {
        Self {
            hex_addr,
            added_cycle: 0,
            complete_cycle: Self::UNSET,
            is_write,
            pim,
        }
    }

    #[inline]
    pub fn is_complete_at(&self, clk: u64) -> bool {
        self.complete_cycle != Self::UNSET && self.complete_cycle <= clk
    }
}
