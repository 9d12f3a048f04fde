/*!
Periodic refresh injection with bounded postponement.

Two policies:
- `RankStaggered`: one REFRESH per rank every tREFI, ranks offset across the
  interval so the channel never refreshes everything at once.
- `BankStaggered`: one REFRESH_BANK every tREFIb, rotating through
  (rank, bankgroup, bank) in order.

When a refresh comes due it is queued and the target bank(s) keep serving
demand traffic. Once the request has waited `tREFI * max_postpone` cycles it
escalates: the channel stops opening new rows on the target until the refresh
goes out. The controller polls `pending_command` each cycle and reports back
through `refresh_issued`.
*/

use std::rc::Rc;

use log::debug;

use crate::address::Address;
use crate::channel_state::ChannelState;
use crate::command::{Command, CommandKind};
use crate::config::{Config, RefreshPolicy};

#[derive(Copy, Clone, Debug)]
struct RefreshRequest {
    due_clk: u64,
    rank: usize,
    /// `None` for a rank-scope REFRESH.
    bank: Option<(usize, usize)>,
}

pub struct Refresh {
    config: Rc<Config>,
    clk: u64,
    queue: Vec<RefreshRequest>,
    /// Next due clock per rank (rank policy) or for the rotating pointer
    /// (bank policy).
    next_due: Vec<u64>,
    /// Rotating (rank, bankgroup, bank) pointer for bank-level refresh.
    pointer: (usize, usize, usize),
}

impl Refresh {
    pub fn new(config: Rc<Config>) -> Self {
        let ranks = config.structure.ranks;
        let next_due = match config.refresh_policy {
            // Stagger ranks across one tREFI.
            RefreshPolicy::RankStaggered => (0..ranks)
                .map(|r| config.timing.trefi * (r as u64 + 1) / ranks as u64)
                .collect(),
            RefreshPolicy::BankStaggered => vec![config.timing.trefib],
        };
        Self {
            config,
            clk: 0,
            queue: Vec::new(),
            next_due,
            pointer: (0, 0, 0),
        }
    }

    /// Advance one cycle; enqueue any refresh that just came due and flag the
    /// target banks.
    pub fn tick(&mut self, channel_state: &mut ChannelState) {
        self.clk += 1;
        match self.config.refresh_policy {
            RefreshPolicy::RankStaggered => {
                for rank in 0..self.config.structure.ranks {
                    if self.clk >= self.next_due[rank] {
                        self.queue.push(RefreshRequest {
                            due_clk: self.clk,
                            rank,
                            bank: None,
                        });
                        self.next_due[rank] += self.config.timing.trefi;
                    }
                }
            }
            RefreshPolicy::BankStaggered => {
                if self.clk >= self.next_due[0] {
                    let (rank, bg, bank) = self.pointer;
                    self.queue.push(RefreshRequest {
                        due_clk: self.clk,
                        rank,
                        bank: Some((bg, bank)),
                    });
                    self.advance_pointer();
                    self.next_due[0] += self.config.timing.trefib;
                }
            }
        }
        // Escalated requests starve demand row opens on their banks.
        let window = self.postpone_window();
        for req in &self.queue {
            if self.clk.saturating_sub(req.due_clk) >= window {
                channel_state.set_refresh_waiting(req.rank, req.bank, true);
            }
        }
    }

    fn advance_pointer(&mut self) {
        let s = &self.config.structure;
        let (mut rank, mut bg, mut bank) = self.pointer;
        bank += 1;
        if bank == s.banks_per_group {
            bank = 0;
            bg += 1;
            if bg == s.bankgroups {
                bg = 0;
                rank += 1;
                if rank == s.ranks {
                    rank = 0;
                }
            }
        }
        self.pointer = (rank, bg, bank);
    }

    fn postpone_window(&self) -> u64 {
        self.config.timing.trefi * self.config.system.max_postpone
    }

    /// Oldest outstanding refresh as a command, if any.
    pub fn pending_command(&self) -> Option<Command> {
        self.queue.first().map(|req| {
            let (bg, bank) = req.bank.unwrap_or((0, 0));
            let kind = if req.bank.is_some() {
                CommandKind::RefreshBank
            } else {
                CommandKind::Refresh
            };
            Command::new(kind, Address::new(0, req.rank, bg, bank, 0, 0), 0)
        })
    }

    /// True when the oldest request has exhausted its postponement budget.
    pub fn escalated(&self) -> bool {
        self.queue
            .first()
            .is_some_and(|req| self.clk.saturating_sub(req.due_clk) >= self.postpone_window())
    }

    /// The controller reports a REFRESH/REFRESH_BANK actually went out.
    pub fn refresh_issued(&mut self, cmd: &Command, channel_state: &mut ChannelState) {
        let matches_front = self.queue.first().is_some_and(|req| {
            req.rank == cmd.addr.rank
                && match (req.bank, cmd.kind) {
                    (None, CommandKind::Refresh) => true,
                    (Some((bg, b)), CommandKind::RefreshBank) => {
                        bg == cmd.addr.bankgroup && b == cmd.addr.bank
                    }
                    _ => false,
                }
        });
        if matches_front {
            let req = self.queue.remove(0);
            channel_state.set_refresh_waiting(req.rank, req.bank, false);
            debug!(
                "refresh issued to rank {} bank {:?} after {} postponed cycles",
                req.rank,
                req.bank,
                self.clk.saturating_sub(req.due_clk)
            );
        }
    }

    pub fn outstanding(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::small_config;
    use crate::timing::Timing;

    fn harness(policy: &str) -> (Refresh, ChannelState) {
        let mut cfg = small_config();
        cfg.refresh_policy = match policy {
            "rank" => RefreshPolicy::RankStaggered,
            _ => RefreshPolicy::BankStaggered,
        };
        let cfg = Rc::new(cfg);
        let timing = Rc::new(Timing::new(&cfg));
        (
            Refresh::new(Rc::clone(&cfg)),
            ChannelState::new(cfg, timing),
        )
    }

    #[test]
    fn rank_refresh_comes_due_every_trefi() {
        let (mut refresh, mut ch) = harness("rank");
        let trefi = refresh.config.timing.trefi;
        for _ in 0..trefi {
            refresh.tick(&mut ch);
        }
        assert_eq!(refresh.outstanding(), 1);
        let cmd = refresh.pending_command().unwrap();
        assert_eq!(cmd.kind, CommandKind::Refresh);

        refresh.refresh_issued(&cmd, &mut ch);
        assert_eq!(refresh.outstanding(), 0);

        for _ in 0..trefi {
            refresh.tick(&mut ch);
        }
        assert_eq!(refresh.outstanding(), 1);
    }

    #[test]
    fn bank_refresh_rotates_banks() {
        let (mut refresh, mut ch) = harness("bank");
        let trefib = refresh.config.timing.trefib;
        let mut seen = Vec::new();
        for _ in 0..3 {
            while refresh.outstanding() == 0 {
                refresh.tick(&mut ch);
            }
            let cmd = refresh.pending_command().unwrap();
            assert_eq!(cmd.kind, CommandKind::RefreshBank);
            seen.push((cmd.addr.bankgroup, cmd.addr.bank));
            refresh.refresh_issued(&cmd, &mut ch);
        }
        assert_eq!(seen, vec![(0, 0), (0, 1), (1, 0)]);
        // Cadence is one per tREFIb.
        assert!(refresh.clk <= 3 * trefib + 3);
    }

    #[test]
    fn postponed_refresh_escalates_and_blocks_row_opens() {
        let (mut refresh, mut ch) = harness("bank");
        let window = refresh.postpone_window();
        let trefib = refresh.config.timing.trefib;
        for _ in 0..(trefib + window) {
            refresh.tick(&mut ch);
        }
        assert!(refresh.escalated());
        assert!(ch.bank(0, 0, 0).refresh_waiting());

        let cmd = refresh.pending_command().unwrap();
        refresh.refresh_issued(&cmd, &mut ch);
        assert!(!ch.bank(0, 0, 0).refresh_waiting());
        assert!(!refresh.escalated());
    }
}
