/*!
Per-bank finite state and earliest-legal-command clocks.

The bank FSM is deterministic from command kinds:

```text
Closed    --ACTIVATE-->            Open(row)
Open(_)   --PRECHARGE/RDP/WRP-->   Closed
Closed    --REFRESH_BANK/REFRESH-> Refreshing
Refreshing --ACTIVATE-->           Open(row)    (legality enforced by timing)
Closed    --SREF_ENTER-->          Sref
Sref      --SREF_EXIT-->           Closed
```

`Refreshing` is bookkeeping only: the tRFC window is enforced through the
earliest-legal clocks, so a bank in `Refreshing` answers `required_command`
the same way a closed bank does and leaves the state on the next ACTIVATE.

The earliest-legal clock array is written by `update_timing` (max-merge, so
constraints from different scopes compose) and read by `is_ready`.
*/

use crate::command::{Command, CommandKind};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BankFsm {
    Closed,
    Open(usize),
    Refreshing,
    Sref,
}

#[derive(Clone, Debug)]
pub struct BankState {
    fsm: BankFsm,
    cmd_timing: [u64; CommandKind::COUNT],
    /// Set while the refresh engine has an outstanding request on this bank;
    /// blocks new row opens once the request escalates.
    refresh_waiting: bool,
    /// Consecutive row hits on the currently open row, for eviction policy.
    row_hits: u64,
}

impl Default for BankState {
    fn default() -> Self {
        Self::new()
    }
}

impl BankState {
    pub fn new() -> Self {
        Self {
            fsm: BankFsm::Closed,
            cmd_timing: [0; CommandKind::COUNT],
            refresh_waiting: false,
            row_hits: 0,
        }
    }

    #[inline]
    pub fn fsm(&self) -> BankFsm {
        self.fsm
    }

    #[inline]
    pub fn open_row(&self) -> Option<usize> {
        match self.fsm {
            BankFsm::Open(row) => Some(row),
            _ => None,
        }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self.fsm, BankFsm::Open(_))
    }

    #[inline]
    pub fn in_self_refresh(&self) -> bool {
        self.fsm == BankFsm::Sref
    }

    #[inline]
    pub fn refresh_waiting(&self) -> bool {
        self.refresh_waiting
    }

    pub fn set_refresh_waiting(&mut self, waiting: bool) {
        self.refresh_waiting = waiting;
    }

    #[inline]
    pub fn row_hits(&self) -> u64 {
        self.row_hits
    }

    /// Earliest clock at which `kind` may legally issue on this bank.
    #[inline]
    pub fn earliest_legal(&self, kind: CommandKind) -> u64 {
        self.cmd_timing[kind.index()]
    }

    #[inline]
    pub fn is_ready(&self, kind: CommandKind, clk: u64) -> bool {
        clk >= self.cmd_timing[kind.index()]
    }

    /// What must be issued before `cmd` can proceed on this bank. Returns the
    /// command kind to issue next: `cmd.kind` itself once the bank is in the
    /// right state.
    pub fn required_command(&self, cmd: &Command) -> CommandKind {
        if self.fsm == BankFsm::Sref {
            return CommandKind::SrefExit;
        }
        match cmd.kind {
            CommandKind::Read
            | CommandKind::ReadPrecharge
            | CommandKind::Write
            | CommandKind::WritePrecharge => match self.fsm {
                BankFsm::Open(row) if row == cmd.addr.row => cmd.kind,
                BankFsm::Open(_) => CommandKind::Precharge,
                _ => CommandKind::Activate,
            },
            CommandKind::RefreshBank | CommandKind::Refresh | CommandKind::SrefEnter => {
                if self.is_open() {
                    CommandKind::Precharge
                } else {
                    cmd.kind
                }
            }
            // ACT/PRE/SREF_EXIT arrive pre-resolved.
            other => other,
        }
    }

    /// Apply the state transition for an issued command.
    pub fn update_state(&mut self, cmd: &Command) {
        match cmd.kind {
            CommandKind::Activate => {
                self.fsm = BankFsm::Open(cmd.addr.row);
                self.row_hits = 0;
            }
            CommandKind::Read | CommandKind::Write => {
                self.row_hits += 1;
            }
            CommandKind::Precharge
            | CommandKind::ReadPrecharge
            | CommandKind::WritePrecharge => {
                self.fsm = BankFsm::Closed;
                self.row_hits = 0;
            }
            CommandKind::RefreshBank | CommandKind::Refresh => {
                self.fsm = BankFsm::Refreshing;
                self.row_hits = 0;
            }
            CommandKind::SrefEnter => {
                self.fsm = BankFsm::Sref;
            }
            CommandKind::SrefExit => {
                self.fsm = BankFsm::Closed;
            }
        }
    }

    /// Fold in a constraint: `kind` may not issue before `clk`.
    pub fn update_timing(&mut self, kind: CommandKind, clk: u64) {
        let slot = &mut self.cmd_timing[kind.index()];
        *slot = (*slot).max(clk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn read_at(row: usize) -> Command {
        Command::new(
            CommandKind::Read,
            Address::new(0, 0, 0, 0, row, 0),
            (row as u64) << 12,
        )
    }

    #[test]
    fn closed_bank_requires_activate() {
        let bank = BankState::new();
        assert_eq!(bank.required_command(&read_at(7)), CommandKind::Activate);
    }

    #[test]
    fn open_row_match_and_conflict() {
        let mut bank = BankState::new();
        bank.update_state(&read_at(7).with_kind(CommandKind::Activate));
        assert_eq!(bank.open_row(), Some(7));
        assert_eq!(bank.required_command(&read_at(7)), CommandKind::Read);
        assert_eq!(bank.required_command(&read_at(8)), CommandKind::Precharge);
    }

    #[test]
    fn auto_precharge_closes_row() {
        let mut bank = BankState::new();
        bank.update_state(&read_at(7).with_kind(CommandKind::Activate));
        bank.update_state(&read_at(7).with_kind(CommandKind::ReadPrecharge));
        assert_eq!(bank.fsm(), BankFsm::Closed);
    }

    #[test]
    fn refresh_requires_closed_bank() {
        let mut bank = BankState::new();
        bank.update_state(&read_at(3).with_kind(CommandKind::Activate));
        let refb = read_at(3).with_kind(CommandKind::RefreshBank);
        assert_eq!(bank.required_command(&refb), CommandKind::Precharge);
        bank.update_state(&read_at(3).with_kind(CommandKind::Precharge));
        assert_eq!(bank.required_command(&refb), CommandKind::RefreshBank);
        bank.update_state(&refb);
        assert_eq!(bank.fsm(), BankFsm::Refreshing);
        // A later activate leaves the refresh state behind.
        bank.update_state(&read_at(9).with_kind(CommandKind::Activate));
        assert_eq!(bank.open_row(), Some(9));
    }

    #[test]
    fn sref_round_trip() {
        let mut bank = BankState::new();
        let enter = read_at(0).with_kind(CommandKind::SrefEnter);
        bank.update_state(&enter);
        assert!(bank.in_self_refresh());
        assert_eq!(bank.required_command(&read_at(0)), CommandKind::SrefExit);
        bank.update_state(&read_at(0).with_kind(CommandKind::SrefExit));
        assert_eq!(bank.fsm(), BankFsm::Closed);
    }

    #[test]
    fn timing_max_merges() {
        let mut bank = BankState::new();
        bank.update_timing(CommandKind::Read, 10);
        bank.update_timing(CommandKind::Read, 5);
        assert_eq!(bank.earliest_legal(CommandKind::Read), 10);
        assert!(!bank.is_ready(CommandKind::Read, 9));
        assert!(bank.is_ready(CommandKind::Read, 10));
    }
}
