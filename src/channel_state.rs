/*!
Aggregate state of one channel: the `[rank][bankgroup][bank]` grid of bank
states plus the rank-scope bookkeeping a single bank cannot see.

Responsibilities:
- Resolve a wanted command to the command that must issue first
  (`get_ready_command`), folding in bank FSM state, earliest-legal clocks,
  the rolling four-activation window (tFAW) and refresh-escalation blocks.
- Apply an issued command (`update`): bank FSM transition plus timing fanout
  to every scope of the timing table.
- Track per-rank self-refresh membership and idle time for SREF entry.
*/

use std::collections::VecDeque;
use std::rc::Rc;

use crate::bank_state::BankState;
use crate::command::{Command, CommandKind};
use crate::config::Config;
use crate::timing::Timing;

/// Activations allowed inside one rolling tFAW window.
const ACTS_PER_WINDOW: usize = 4;

pub struct ChannelState {
    pub(crate) config: Rc<Config>,
    timing: Rc<Timing>,
    banks: Vec<Vec<Vec<BankState>>>,
    /// Per-rank expiry clocks of recent activations.
    activation_window: Vec<VecDeque<u64>>,
    rank_in_sref: Vec<bool>,
    /// Last clock any command touched the rank; drives SREF idle entry.
    rank_last_active: Vec<u64>,
}

impl ChannelState {
    pub fn new(config: Rc<Config>, timing: Rc<Timing>) -> Self {
        let ranks = config.structure.ranks;
        let banks = (0..ranks)
            .map(|_| {
                (0..config.structure.bankgroups)
                    .map(|_| vec![BankState::new(); config.structure.banks_per_group])
                    .collect()
            })
            .collect();
        Self {
            config,
            timing,
            banks,
            activation_window: vec![VecDeque::new(); ranks],
            rank_in_sref: vec![false; ranks],
            rank_last_active: vec![0; ranks],
        }
    }

    #[inline]
    pub fn bank(&self, rank: usize, bankgroup: usize, bank: usize) -> &BankState {
        &self.banks[rank][bankgroup][bank]
    }

    #[inline]
    pub fn bank_mut(&mut self, rank: usize, bankgroup: usize, bank: usize) -> &mut BankState {
        &mut self.banks[rank][bankgroup][bank]
    }

    pub fn rank_in_self_refresh(&self, rank: usize) -> bool {
        self.rank_in_sref[rank]
    }

    pub fn rank_idle_cycles(&self, rank: usize, clk: u64) -> u64 {
        clk.saturating_sub(self.rank_last_active[rank])
    }

    pub fn all_banks_closed(&self, rank: usize) -> bool {
        self.banks[rank]
            .iter()
            .flatten()
            .all(|bank| !bank.is_open())
    }

    fn activation_window_ok(&self, rank: usize, clk: u64) -> bool {
        self.activation_window[rank]
            .iter()
            .filter(|&&expiry| expiry > clk)
            .count()
            < ACTS_PER_WINDOW
    }

    /// Resolve `cmd` to the command that should issue now, or `None` if no
    /// step toward it is legal at `clk`.
    pub fn get_ready_command(&self, cmd: &Command, clk: u64) -> Option<Command> {
        if cmd.kind.is_rank_command() {
            return self.get_ready_rank_command(cmd, clk);
        }
        let bank = self.bank(cmd.addr.rank, cmd.addr.bankgroup, cmd.addr.bank);
        let required = bank.required_command(cmd);
        if required == CommandKind::Activate {
            // Escalated refresh starves new row opens; tFAW rejects excess
            // activations.
            if bank.refresh_waiting() || !self.activation_window_ok(cmd.addr.rank, clk) {
                return None;
            }
        }
        if required == CommandKind::SrefExit {
            return self
                .sref_exit_ready(cmd.addr.rank, clk)
                .then(|| cmd.with_kind(CommandKind::SrefExit));
        }
        bank.is_ready(required, clk).then(|| cmd.with_kind(required))
    }

    fn get_ready_rank_command(&self, cmd: &Command, clk: u64) -> Option<Command> {
        let rank = cmd.addr.rank;
        if cmd.kind == CommandKind::SrefExit || self.rank_in_sref[rank] {
            // Anything aimed at a self-refreshing rank resolves to the exit.
            return self
                .sref_exit_ready(rank, clk)
                .then(|| cmd.with_kind(CommandKind::SrefExit));
        }
        // Any open bank must precharge first; take the first one whose
        // precharge is legal.
        for (bg, group) in self.banks[rank].iter().enumerate() {
            for (b, bank) in group.iter().enumerate() {
                if bank.is_open() {
                    let mut pre = cmd.with_kind(CommandKind::Precharge);
                    pre.addr.bankgroup = bg;
                    pre.addr.bank = b;
                    return bank.is_ready(CommandKind::Precharge, clk).then_some(pre);
                }
            }
        }
        // All banks closed: the rank command itself must be legal on every
        // bank of the rank.
        let ready = self.banks[rank]
            .iter()
            .flatten()
            .all(|bank| bank.is_ready(cmd.kind, clk));
        ready.then(|| *cmd)
    }

    fn sref_exit_ready(&self, rank: usize, clk: u64) -> bool {
        self.rank_in_sref[rank]
            && self.banks[rank]
                .iter()
                .flatten()
                .all(|bank| bank.is_ready(CommandKind::SrefExit, clk))
    }

    /// Apply an issued command: FSM transitions plus timing fanout.
    pub fn update(&mut self, cmd: &Command, clk: u64) {
        let rank = cmd.addr.rank;
        self.rank_last_active[rank] = clk;

        match cmd.kind {
            CommandKind::Activate => {
                self.activation_window[rank].push_back(clk + self.config.timing.tfaw);
                while let Some(&front) = self.activation_window[rank].front() {
                    if front <= clk {
                        self.activation_window[rank].pop_front();
                    } else {
                        break;
                    }
                }
            }
            CommandKind::SrefEnter => self.rank_in_sref[rank] = true,
            CommandKind::SrefExit => self.rank_in_sref[rank] = false,
            _ => {}
        }

        if cmd.kind.is_rank_command() {
            for group in self.banks[rank].iter_mut() {
                for bank in group.iter_mut() {
                    bank.update_state(cmd);
                }
            }
        } else {
            self.banks[rank][cmd.addr.bankgroup][cmd.addr.bank].update_state(cmd);
        }

        self.apply_timing(cmd, clk);
    }

    fn apply_timing(&mut self, cmd: &Command, clk: u64) {
        let timing = Rc::clone(&self.timing);
        let ki = cmd.kind.index();
        let (rank, bankgroup, bank) = (cmd.addr.rank, cmd.addr.bankgroup, cmd.addr.bank);

        if cmd.kind.is_rank_command() {
            for &(kind, delta) in &timing.same_rank[ki] {
                for group in self.banks[rank].iter_mut() {
                    for b in group.iter_mut() {
                        b.update_timing(kind, clk + delta);
                    }
                }
            }
        } else {
            for &(kind, delta) in &timing.same_bank[ki] {
                self.banks[rank][bankgroup][bank].update_timing(kind, clk + delta);
            }
            for &(kind, delta) in &timing.other_banks_same_bankgroup[ki] {
                for (b, state) in self.banks[rank][bankgroup].iter_mut().enumerate() {
                    if b != bank {
                        state.update_timing(kind, clk + delta);
                    }
                }
            }
            for &(kind, delta) in &timing.other_bankgroups[ki] {
                for (bg, group) in self.banks[rank].iter_mut().enumerate() {
                    if bg == bankgroup {
                        continue;
                    }
                    for state in group.iter_mut() {
                        state.update_timing(kind, clk + delta);
                    }
                }
            }
        }

        for &(kind, delta) in &timing.other_ranks[ki] {
            for (r, rank_banks) in self.banks.iter_mut().enumerate() {
                if r == rank {
                    continue;
                }
                for group in rank_banks.iter_mut() {
                    for state in group.iter_mut() {
                        state.update_timing(kind, clk + delta);
                    }
                }
            }
        }
    }

    /// Direct legality of exactly `cmd.kind` at `clk` (no resolution step).
    pub fn is_ready(&self, cmd: &Command, clk: u64) -> bool {
        clk >= self.earliest_legal(cmd)
    }

    /// Earliest clock `cmd.kind` may issue; rank commands take the max across
    /// the rank's banks.
    pub fn earliest_legal(&self, cmd: &Command) -> u64 {
        if cmd.kind.is_rank_command() {
            self.banks[cmd.addr.rank]
                .iter()
                .flatten()
                .map(|bank| bank.earliest_legal(cmd.kind))
                .max()
                .unwrap_or(0)
        } else {
            self.bank(cmd.addr.rank, cmd.addr.bankgroup, cmd.addr.bank)
                .earliest_legal(cmd.kind)
        }
    }

    /// Mark or clear refresh-pending on the refresh target.
    pub fn set_refresh_waiting(&mut self, rank: usize, bank: Option<(usize, usize)>, on: bool) {
        match bank {
            Some((bg, b)) => self.banks[rank][bg][b].set_refresh_waiting(on),
            None => {
                for group in self.banks[rank].iter_mut() {
                    for state in group.iter_mut() {
                        state.set_refresh_waiting(on);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::test_utils::small_config;

    fn state() -> ChannelState {
        let cfg = Rc::new(small_config());
        let timing = Rc::new(Timing::new(&cfg));
        ChannelState::new(cfg, timing)
    }

    fn read_cmd(bg: usize, bank: usize, row: usize) -> Command {
        Command::new(
            CommandKind::Read,
            Address::new(0, 0, bg, bank, row, 0),
            0x1000,
        )
    }

    #[test]
    fn resolves_act_then_read() {
        let mut ch = state();
        let cmd = read_cmd(0, 0, 5);

        let step = ch.get_ready_command(&cmd, 0).expect("activate ready");
        assert_eq!(step.kind, CommandKind::Activate);
        ch.update(&step, 0);

        // Before tRCD the read is not ready.
        assert!(ch.get_ready_command(&cmd, 1).is_none());
        let trcd = ch.config.timing.trcd;
        let step = ch.get_ready_command(&cmd, trcd).expect("read ready");
        assert_eq!(step.kind, CommandKind::Read);
    }

    #[test]
    fn row_conflict_resolves_to_precharge() {
        let mut ch = state();
        let cmd = read_cmd(0, 0, 5);
        let act = cmd.with_kind(CommandKind::Activate);
        ch.update(&act, 0);

        let other = read_cmd(0, 0, 9);
        let tras = ch.config.timing.tras;
        let step = ch.get_ready_command(&other, tras).expect("precharge ready");
        assert_eq!(step.kind, CommandKind::Precharge);
    }

    #[test]
    fn activation_window_rejects_fifth_act() {
        let mut ch = state();
        // Four activations in different banks, same rank, well inside tFAW.
        for (i, (bg, bank)) in [(0, 0), (0, 1), (1, 0), (1, 1)].iter().enumerate() {
            let act = read_cmd(*bg, *bank, 1).with_kind(CommandKind::Activate);
            ch.update(&act, i as u64 * ch.config.timing.trrd_s);
        }
        // A fifth bank in the same rank is blocked by the window even though
        // its own timing is clear.
        let fifth = read_cmd(2, 0, 1);
        let clk = 4 * ch.config.timing.trrd_s;
        assert!(ch.get_ready_command(&fifth, clk).is_none());
        // After the window expires it resolves to an activate again.
        let clear = ch.config.timing.tfaw + clk;
        let step = ch.get_ready_command(&fifth, clear).expect("act after faw");
        assert_eq!(step.kind, CommandKind::Activate);
    }

    #[test]
    fn rank_refresh_precharges_open_banks_first() {
        let mut ch = state();
        let act = read_cmd(1, 1, 3).with_kind(CommandKind::Activate);
        ch.update(&act, 0);

        let refresh = Command::new(CommandKind::Refresh, Address::new(0, 0, 0, 0, 0, 0), 0);
        let tras = ch.config.timing.tras;
        let step = ch.get_ready_command(&refresh, tras).expect("pre ready");
        assert_eq!(step.kind, CommandKind::Precharge);
        assert_eq!(step.addr.bankgroup, 1);
        assert_eq!(step.addr.bank, 1);
        ch.update(&step, tras);

        let trp = ch.config.timing.trp;
        let step = ch
            .get_ready_command(&refresh, tras + trp)
            .expect("refresh ready");
        assert_eq!(step.kind, CommandKind::Refresh);
        ch.update(&step, tras + trp);
        // tRFC blankets the rank: no activate until it elapses.
        let probe = read_cmd(0, 0, 1);
        assert!(
            ch.get_ready_command(&probe, tras + trp + 1).is_none(),
            "activate must wait out tRFC"
        );
    }

    #[test]
    fn read_precharge_vs_read_then_precharge_converge() {
        let clk_act = 0;
        let cmd = read_cmd(0, 0, 5);

        // Path A: ACT, READ_PRECHARGE.
        let mut a = state();
        a.update(&cmd.with_kind(CommandKind::Activate), clk_act);
        let trcd = a.config.timing.trcd;
        a.update(&cmd.with_kind(CommandKind::ReadPrecharge), trcd);

        // Path B: ACT, READ, explicit PRECHARGE at the same legal point.
        let mut b = state();
        b.update(&cmd.with_kind(CommandKind::Activate), clk_act);
        b.update(&cmd.with_kind(CommandKind::Read), trcd);
        let pre_clk = trcd + b.config.timing.trtp;
        b.update(&cmd.with_kind(CommandKind::Precharge), pre_clk);

        // Both paths leave the bank closed and able to re-activate at the
        // same earliest clock.
        let next = read_cmd(0, 0, 6);
        assert_eq!(a.bank(0, 0, 0).open_row(), None);
        assert_eq!(b.bank(0, 0, 0).open_row(), None);
        let ea = a.bank(0, 0, 0).earliest_legal(CommandKind::Activate);
        let eb = b.bank(0, 0, 0).earliest_legal(CommandKind::Activate);
        assert_eq!(ea, eb);
        assert_eq!(
            a.get_ready_command(&next, ea).map(|c| c.kind),
            Some(CommandKind::Activate)
        );
        assert_eq!(
            b.get_ready_command(&next, eb).map(|c| c.kind),
            Some(CommandKind::Activate)
        );
    }

    #[test]
    fn sref_enter_and_exit() {
        let mut ch = state();
        let enter = Command::new(CommandKind::SrefEnter, Address::new(0, 0, 0, 0, 0, 0), 0);
        let step = ch.get_ready_command(&enter, 10).expect("enter ready");
        assert_eq!(step.kind, CommandKind::SrefEnter);
        ch.update(&step, 10);
        assert!(ch.rank_in_self_refresh(0));

        // A demand read now resolves to SREF_EXIT, gated by tCKESR.
        let cmd = read_cmd(0, 0, 2);
        assert!(ch.get_ready_command(&cmd, 11).is_none());
        let exit_clk = 10 + ch.config.timing.tckesr;
        let step = ch.get_ready_command(&cmd, exit_clk).expect("exit ready");
        assert_eq!(step.kind, CommandKind::SrefExit);
        ch.update(&step, exit_clk);
        assert!(!ch.rank_in_self_refresh(0));
        // tXS holds off the activate after exit.
        assert!(ch.get_ready_command(&cmd, exit_clk + 1).is_none());
        let act_clk = exit_clk + ch.config.timing.txs;
        assert_eq!(
            ch.get_ready_command(&cmd, act_clk).map(|c| c.kind),
            Some(CommandKind::Activate)
        );
    }
}
